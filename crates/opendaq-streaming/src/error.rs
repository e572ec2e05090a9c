// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for the streaming runtime.

use crate::config::ConfigError;
use thiserror::Error;

/// Streaming errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unsupported data rule for signal {signal_id}: {rule}")]
    UnsupportedRule { signal_id: String, rule: String },

    #[error("Signal {0} has no data descriptor")]
    MissingDescriptor(String),

    #[error("Unsupported sample type: {0}")]
    UnsupportedSampleType(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("MessagePack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("MessagePack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Outbound queue limit exceeded ({pending} bytes pending, limit {limit})")]
    SlowConsumer { pending: usize, limit: usize },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Already running")]
    AlreadyRunning,

    #[error("Not connected")]
    NotConnected,

    #[error("Connection rejected: {0}")]
    Rejected(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a protocol violation.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::UnsupportedRule {
            signal_id: "dev/ai0".into(),
            rule: "other".into(),
        };
        assert!(err.to_string().contains("dev/ai0"));

        let err = Error::SlowConsumer {
            pending: 10,
            limit: 5,
        };
        assert!(err.to_string().contains("limit 5"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}

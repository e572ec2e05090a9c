// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! JSON requests posted to the HTTP control port.
//!
//! Body: `{"method": "<streamId>.subscribe", "params": ["<signalId>", ...]}`.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Control operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMethod {
    Subscribe,
    Unsubscribe,
}

impl ControlMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlMethod::Subscribe => "subscribe",
            ControlMethod::Unsubscribe => "unsubscribe",
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RawRequest {
    method: String,
    #[serde(default)]
    params: Vec<String>,
}

/// A parsed control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub stream_id: String,
    pub method: ControlMethod,
    pub signal_ids: Vec<String>,
}

impl ControlRequest {
    pub fn subscribe(stream_id: impl Into<String>, signal_ids: Vec<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            method: ControlMethod::Subscribe,
            signal_ids,
        }
    }

    pub fn unsubscribe(stream_id: impl Into<String>, signal_ids: Vec<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            method: ControlMethod::Unsubscribe,
            signal_ids,
        }
    }

    /// Parse a request body. The stream id is everything before the last `.`.
    pub fn parse(body: &[u8]) -> Result<Self> {
        let raw: RawRequest = serde_json::from_slice(body)?;
        let (stream_id, op) = raw
            .method
            .rsplit_once('.')
            .ok_or_else(|| Error::protocol(format!("method without stream id: {}", raw.method)))?;
        let method = match op {
            "subscribe" => ControlMethod::Subscribe,
            "unsubscribe" => ControlMethod::Unsubscribe,
            other => return Err(Error::protocol(format!("unknown control method: {}", other))),
        };
        if stream_id.is_empty() {
            return Err(Error::protocol("empty stream id"));
        }
        Ok(Self {
            stream_id: stream_id.to_string(),
            method,
            signal_ids: raw.params,
        })
    }

    pub fn to_body(&self) -> Result<Vec<u8>> {
        let raw = RawRequest {
            method: format!("{}.{}", self.stream_id, self.method.as_str()),
            params: self.signal_ids.clone(),
        };
        Ok(serde_json::to_vec(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subscribe() {
        let body = br#"{"method":"a1b2c3d4.subscribe","params":["/dev/ai0","/dev/ai1"]}"#;
        let request = ControlRequest::parse(body).unwrap();
        assert_eq!(request.stream_id, "a1b2c3d4");
        assert_eq!(request.method, ControlMethod::Subscribe);
        assert_eq!(request.signal_ids.len(), 2);
    }

    #[test]
    fn test_stream_id_may_contain_dots() {
        let request = ControlRequest::unsubscribe("host.example.1", vec!["s".into()]);
        let parsed = ControlRequest::parse(&request.to_body().unwrap()).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_malformed_requests() {
        assert!(ControlRequest::parse(b"not json").is_err());
        assert!(ControlRequest::parse(br#"{"method":"subscribe","params":[]}"#).is_err());
        assert!(ControlRequest::parse(br#"{"method":"abc.delete","params":[]}"#).is_err());
        assert!(ControlRequest::parse(br#"{"method":".subscribe","params":[]}"#).is_err());
        assert!(ControlRequest::parse(br#"{"method":"abc.subscribe","params":[1]}"#).is_err());
    }

    #[test]
    fn test_missing_params_is_empty() {
        let request = ControlRequest::parse(br#"{"method":"abc.subscribe"}"#).unwrap();
        assert!(request.signal_ids.is_empty());
    }
}

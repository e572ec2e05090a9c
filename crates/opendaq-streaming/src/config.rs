// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server and client configuration.
//!
//! Both structs load from JSON files; every field has a default so a
//! partial file is enough:
//!
//! ```json
//! { "streaming_port": 7414, "linear_writer": "echo" }
//! ```

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Default WebSocket data port.
pub const DEFAULT_STREAMING_PORT: u16 = 7414;

/// Default HTTP control port.
pub const DEFAULT_CONTROL_PORT: u16 = 7438;

/// Default native config-protocol port.
pub const DEFAULT_CONFIG_PORT: u16 = 7420;

/// Behaviour of the writer attached to linear-rule signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinearWriterMode {
    /// Linear signals never stream data of their own.
    #[default]
    Noop,
    /// Emit `{index, start}` whenever the progression is interrupted.
    Echo,
}

/// Streaming server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// WebSocket data port (0 = ephemeral)
    #[serde(default = "default_streaming_port")]
    pub streaming_port: u16,

    /// HTTP control port (0 = ephemeral)
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// Native config-protocol port (0 = ephemeral)
    #[serde(default = "default_config_port")]
    pub config_port: u16,

    /// Serve the native config protocol
    #[serde(default = "default_true")]
    pub config_channel_enabled: bool,

    /// Maximum number of streaming/control connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum number of config-protocol connections
    #[serde(default = "default_max_config_connections")]
    pub max_config_connections: usize,

    /// Fixed WebSocket read buffer; a frame that does not fit is fatal
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,

    /// Maximum size of an HTTP request (headers + body)
    #[serde(default = "default_max_http_request_size")]
    pub max_http_request_size: usize,

    /// Requested SO_SNDBUF for established clients (0 = OS default)
    #[serde(default = "default_socket_send_buffer")]
    pub socket_send_buffer: usize,

    /// Bytes a client may leave unsent before it is dropped (0 = none)
    #[serde(default = "default_max_pending_bytes")]
    pub max_pending_bytes: usize,

    /// Linear-rule writer behaviour
    #[serde(default)]
    pub linear_writer: LinearWriterMode,

    /// Answer WebSocket PING frames with PONG
    #[serde(default = "default_true")]
    pub reply_to_ping: bool,

    /// Version announced in the `apiVersion` metadata
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

fn default_bind_address() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_streaming_port() -> u16 {
    DEFAULT_STREAMING_PORT
}

fn default_control_port() -> u16 {
    DEFAULT_CONTROL_PORT
}

fn default_config_port() -> u16 {
    DEFAULT_CONFIG_PORT
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> usize {
    64
}

fn default_max_config_connections() -> usize {
    16
}

fn default_read_buffer_size() -> usize {
    64 * 1024
}

fn default_max_http_request_size() -> usize {
    16 * 1024
}

fn default_socket_send_buffer() -> usize {
    8 * 1024 * 1024 // ~2 s of 32 channels at 16 kHz, f64 samples
}

fn default_max_pending_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_api_version() -> String {
    "1.0.0".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            streaming_port: default_streaming_port(),
            control_port: default_control_port(),
            config_port: default_config_port(),
            config_channel_enabled: true,
            max_connections: default_max_connections(),
            max_config_connections: default_max_config_connections(),
            read_buffer_size: default_read_buffer_size(),
            max_http_request_size: default_max_http_request_size(),
            socket_send_buffer: default_socket_send_buffer(),
            max_pending_bytes: default_max_pending_bytes(),
            linear_writer: LinearWriterMode::Noop,
            reply_to_ping: true,
            api_version: default_api_version(),
        }
    }
}

impl ServerConfig {
    /// Configuration bound to loopback on ephemeral ports (tests, embedding).
    pub fn ephemeral() -> Self {
        Self {
            bind_address: IpAddr::from([127, 0, 0, 1]),
            streaming_port: 0,
            control_port: 0,
            config_port: 0,
            ..Default::default()
        }
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        serde_json::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.streaming_port != 0 && self.streaming_port == self.control_port {
            return Err(ConfigError::InvalidValue(
                "streaming_port and control_port must differ".into(),
            ));
        }
        if self.config_channel_enabled
            && self.config_port != 0
            && (self.config_port == self.streaming_port || self.config_port == self.control_port)
        {
            return Err(ConfigError::InvalidValue(
                "config_port collides with another port".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue(
                "max_connections cannot be 0".into(),
            ));
        }
        if self.read_buffer_size < 1024 {
            return Err(ConfigError::InvalidValue(
                "read_buffer_size must be at least 1024".into(),
            ));
        }
        if self.max_http_request_size < 256 {
            return Err(ConfigError::InvalidValue(
                "max_http_request_size must be at least 256".into(),
            ));
        }
        Ok(())
    }
}

/// Client handler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server host name or address
    #[serde(default = "default_host")]
    pub host: String,

    /// WebSocket data port
    #[serde(default = "default_streaming_port")]
    pub streaming_port: u16,

    /// HTTP control port (overridden by the server's `init` announcement)
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// Identifier used in logs and the upgrade request
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Interval between heartbeat PINGs
    #[serde(default = "default_heartbeat_period")]
    pub heartbeat_period_ms: u64,

    /// Silence after which the connection is considered lost
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_ms: u64,

    /// TCP connect timeout
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_ms: u64,

    /// Time allowed between the upgrade and the `init` announcement
    #[serde(default = "default_streaming_init_timeout")]
    pub streaming_init_timeout_ms: u64,

    /// Delay between reconnection attempts
    #[serde(default = "default_reconnection_period")]
    pub reconnection_period_ms: u64,

    /// Largest frame accepted from the server; the read buffer grows to it
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_client_id() -> String {
    uuid::Uuid::new_v4().to_string()[..8].to_string()
}

fn default_heartbeat_period() -> u64 {
    1000
}

fn default_inactivity_timeout() -> u64 {
    5000
}

fn default_connection_timeout() -> u64 {
    2000
}

fn default_streaming_init_timeout() -> u64 {
    3000
}

fn default_reconnection_period() -> u64 {
    1000
}

fn default_max_frame_size() -> usize {
    64 * 1024 * 1024
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            streaming_port: default_streaming_port(),
            control_port: default_control_port(),
            client_id: default_client_id(),
            heartbeat_period_ms: default_heartbeat_period(),
            inactivity_timeout_ms: default_inactivity_timeout(),
            connection_timeout_ms: default_connection_timeout(),
            streaming_init_timeout_ms: default_streaming_init_timeout(),
            reconnection_period_ms: default_reconnection_period(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        serde_json::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn streaming_init_timeout(&self) -> Duration {
        Duration::from_millis(self.streaming_init_timeout_ms)
    }

    pub fn reconnection_period(&self) -> Duration {
        Duration::from_millis(self.reconnection_period_ms)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue("host cannot be empty".into()));
        }
        if self.streaming_port == 0 {
            return Err(ConfigError::InvalidValue(
                "streaming_port cannot be 0".into(),
            ));
        }
        let timings = [
            ("heartbeat_period_ms", self.heartbeat_period_ms),
            ("inactivity_timeout_ms", self.inactivity_timeout_ms),
            ("connection_timeout_ms", self.connection_timeout_ms),
            ("streaming_init_timeout_ms", self.streaming_init_timeout_ms),
            ("reconnection_period_ms", self.reconnection_period_ms),
        ];
        for (name, value) in timings {
            if value == 0 {
                return Err(ConfigError::InvalidValue(format!("{} cannot be 0", name)));
            }
        }
        if self.heartbeat_period_ms >= self.inactivity_timeout_ms {
            return Err(ConfigError::InvalidValue(
                "heartbeat_period_ms must be below inactivity_timeout_ms".into(),
            ));
        }
        if self.max_frame_size < 1024 {
            return Err(ConfigError::InvalidValue(
                "max_frame_size must be at least 1024".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, Clone)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IoError(s) => write!(f, "I/O error: {}", s),
            Self::ParseError(s) => write!(f, "Parse error: {}", s),
            Self::SerializeError(s) => write!(f, "Serialize error: {}", s),
            Self::InvalidValue(s) => write!(f, "Invalid value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

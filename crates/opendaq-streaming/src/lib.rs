// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! openDAQ streaming protocol
//!
//! Moves signal descriptors and sample data from a device to remote
//! consumers over WebSocket, with an HTTP control channel for
//! subscriptions and an optional native config channel.
//!
//! # Features
//!
//! - **Wire codec**: streaming header, RFC 6455 frames, MessagePack metadata
//! - **Signal writers**: explicit, constant and linear rule encodings
//! - **Listeners**: per-signal fan-out with descriptor-change tracking
//! - **Server**: single mio I/O thread for every socket
//! - **Client handler**: heartbeat, inactivity detection, reconnection
//! - **Config channel**: PacketBuffer request/reply and notifications
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use opendaq_streaming::signal::{DataDescriptor, LocalDevice, SampleType, Signal};
//! use opendaq_streaming::{ClientConfig, NullSink, ServerConfig, StreamingClient, StreamingServer};
//!
//! # fn main() -> opendaq_streaming::Result<()> {
//! let device = LocalDevice::new("dev");
//! device.add_signal(Arc::new(Signal::new(
//!     "/dev/ai0",
//!     Some(DataDescriptor::new(SampleType::Float32)),
//! )));
//!
//! let mut server = StreamingServer::new(&device, ServerConfig::default())?;
//! server.start()?;
//!
//! let mut client = StreamingClient::new(ClientConfig::default(), Arc::new(NullSink))?;
//! client.connect()?;
//! client.subscribe(&["/dev/ai0"])?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod signal;
pub mod stats;
pub mod writer;

pub use client::{ConfigClient, ConnectionStatus, NullSink, StreamSink, StreamingClient};
pub use codec::{ConstantValue, StreamMessage};
pub use config::{ClientConfig, ConfigError, LinearWriterMode, ServerConfig};
pub use error::{Error, Result};
pub use server::{LocalAddrs, StreamingServer};
pub use stats::{ServerStats, ServerStatsSnapshot};
pub use writer::{SignalWriter, WriterFactory};

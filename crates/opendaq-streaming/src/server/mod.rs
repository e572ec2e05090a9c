// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Streaming server.
//!
//! Owns the listener registry, the I/O thread and the server counters.
//!
//! # Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                      StreamingServer                         |
//! +--------------------------------------------------------------+
//! |  ListenerRegistry  (signal id -> Listener, built once)       |
//! |     Listener ---- InputPort <---- Signal (device thread)     |
//! |        |                                                     |
//! |        +-- SubscribedClient --weak--> EstablishedClient      |
//! |                                                              |
//! |  IoThread (mio)                                              |
//! |     data port    : HTTP upgrade -> WebSocket session         |
//! |     control port : POST {stream}.subscribe/unsubscribe       |
//! |     config port  : PacketBuffer config protocol              |
//! +--------------------------------------------------------------+
//! ```

pub mod config_channel;
pub mod io_thread;
pub mod listener;
pub mod registry;
pub mod session;

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};

pub use config_channel::{ConfigRequestHandler, ConfigSession, DefaultConfigHandler};
pub use io_thread::LocalAddrs;
pub use listener::{Listener, ListenerState, SubscribedClient};
pub use registry::ListenerRegistry;
pub use session::{EstablishedClient, NegotiatingClient, NegotiationOutcome};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::signal::Device;
use crate::stats::ServerStats;
use crate::writer::WriterFactory;
use io_thread::{IoCommand, IoThread, IoThreadHandle};

/// WebSocket streaming server for one device.
pub struct StreamingServer {
    config: ServerConfig,
    registry: Arc<ListenerRegistry>,
    stats: Arc<ServerStats>,
    handler: Arc<dyn ConfigRequestHandler>,
    io: Option<IoThreadHandle>,
}

impl StreamingServer {
    /// Build listeners for the device's signals. Nothing is bound until
    /// [`start`](Self::start).
    pub fn new(device: &dyn Device, config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let stats = Arc::new(ServerStats::new());
        let registry = Arc::new(ListenerRegistry::from_device(
            device,
            WriterFactory::new(config.linear_writer),
            &stats,
        ));
        info!("{} signal(s) available for streaming", registry.len());

        let handler = Arc::new(DefaultConfigHandler::new(
            registry.signal_ids(),
            json!({
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
                "apiVersion": config.api_version,
            }),
        ));

        Ok(Self {
            config,
            registry,
            stats,
            handler,
            io: None,
        })
    }

    /// Replace the RPC handler of the config channel.
    pub fn with_config_handler(mut self, handler: Arc<dyn ConfigRequestHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Start the listeners and bind the server ports.
    pub fn start(&mut self) -> Result<LocalAddrs> {
        if self.io.is_some() {
            return Err(Error::AlreadyRunning);
        }
        self.registry.start_all();
        let handle = match IoThread::spawn(
            self.config.clone(),
            self.registry.clone(),
            self.handler.clone(),
            self.stats.clone(),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                self.registry.stop_all();
                return Err(e.into());
            }
        };
        let addrs = handle.local_addrs();
        self.io = Some(handle);
        Ok(addrs)
    }

    /// Stop the I/O thread, then detach every listener from its clients
    /// and its signal. The server can be started again.
    pub fn stop(&mut self) {
        if let Some(mut io) = self.io.take() {
            if let Err(e) = io.shutdown() {
                warn!("I/O thread shutdown failed: {}", e);
            }
            self.registry.stop_all();
            info!("streaming server stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.io.as_ref().is_some_and(IoThreadHandle::is_running)
    }

    /// Bound addresses while running.
    pub fn local_addrs(&self) -> Option<LocalAddrs> {
        self.io.as_ref().map(IoThreadHandle::local_addrs)
    }

    /// Signal ids announced in `available`.
    pub fn available_signals(&self) -> Vec<String> {
        self.registry.signal_ids()
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Broadcast a server notification to every config-channel connection.
    pub fn notify(&self, notification: &Value) -> Result<()> {
        let io = self.io.as_ref().ok_or(Error::NotConnected)?;
        io.send(IoCommand::Notify(notification.to_string().into_bytes()))?;
        Ok(())
    }
}

impl Drop for StreamingServer {
    fn drop(&mut self) {
        self.stop();
    }
}

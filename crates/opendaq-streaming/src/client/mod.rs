// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Streaming client handler.
//!
//! Keeps one WebSocket connection to a streaming server, decodes the
//! metadata and data it receives, and reconnects when the connection is
//! lost.
//!
//! ```text
//! Disconnected --connect()--> Connecting --init--> Connected
//!                                                      |
//!                          EOF / inactivity timeout    v
//!                         Connected <--retry--- Reconnecting
//! ```
//!
//! Subscriptions do not survive a reconnect: after a `Connected` status
//! callback the caller subscribes again.

mod config_client;
mod connection;

pub use config_client::ConfigClient;

use std::collections::HashMap;
use std::fmt;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::codec::{self, StreamMessage};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::protocol::control::ControlRequest;
use crate::protocol::metadata::{MetadataMessage, SignalMetadata};
use crate::protocol::websocket::Opcode;
use connection::WsConnection;

/// Granularity of interruptible sleeps.
const SLEEP_STEP: Duration = Duration::from_millis(20);

/// Client connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "Disconnected",
            ConnectionStatus::Connecting => "Connecting",
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::Reconnecting => "Reconnecting",
        };
        f.write_str(s)
    }
}

/// Receives what the client decodes. Called on the client worker thread.
pub trait StreamSink: Send + Sync {
    fn on_status(&self, _status: ConnectionStatus) {}

    fn on_available(&self, _signal_ids: &[String]) {}

    /// A subscribed signal's descriptor, on subscribe and on every change.
    fn on_signal_metadata(&self, _signal_id: &str, _metadata: &SignalMetadata) {}

    fn on_data(&self, _signal_id: &str, _payload: &[u8]) {}

    fn on_unsubscribed(&self, _signal_id: &str) {}
}

/// Sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl StreamSink for NullSink {}

/// State of the current session. Reset on every reconnect.
#[derive(Debug, Default)]
struct SessionState {
    api_version: Option<String>,
    stream_id: Option<String>,
    control_port: Option<u16>,
    available: Option<Vec<String>>,
    signos: HashMap<u32, String>,
    signals: HashMap<String, SignalMetadata>,
}

struct Shared {
    config: ClientConfig,
    sink: Arc<dyn StreamSink>,
    status: RwLock<ConnectionStatus>,
    session: RwLock<SessionState>,
    running: AtomicBool,
    writer: Mutex<Option<TcpStream>>,
}

impl Shared {
    fn set_status(&self, status: ConnectionStatus) {
        {
            let mut current = self.status.write();
            if *current == status {
                return;
            }
            *current = status;
        }
        debug!("client {} status {}", self.config.client_id, status);
        self.sink.on_status(status);
    }

    fn send_frame(&self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock();
        let stream = writer.as_mut().ok_or(Error::NotConnected)?;
        connection::write_frame(stream, opcode, payload)
    }

    fn close_writer(&self, send_close: bool) {
        if let Some(mut stream) = self.writer.lock().take() {
            if send_close {
                let _ = connection::write_frame(&mut stream, Opcode::Close, &[]);
            }
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Sleep up to `duration`, returning early once stopped.
    fn sleep_while_running(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while self.running.load(Ordering::Relaxed) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            thread::sleep(remaining.min(SLEEP_STEP));
        }
        false
    }

    /// Open a connection and wait for the connection-level announcements.
    fn establish(&self) -> Result<WsConnection> {
        let config = &self.config;
        let mut conn = WsConnection::open(
            &config.host,
            config.streaming_port,
            &config.client_id,
            config.connection_timeout(),
            config.max_frame_size,
        )?;
        *self.session.write() = SessionState::default();

        let deadline = Instant::now() + config.streaming_init_timeout();
        loop {
            {
                let session = self.session.read();
                if session.stream_id.is_some() && session.available.is_some() {
                    break;
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout("streaming init".into()));
            }
            conn.set_read_timeout(remaining)?;
            if let Some(frame) = conn.read_frame()? {
                match frame.opcode {
                    Opcode::Binary => self.handle_payload(&frame.payload)?,
                    Opcode::Close => return Err(Error::ConnectionClosed),
                    _ => {}
                }
            }
        }
        *self.writer.lock() = Some(conn.writer()?);
        Ok(conn)
    }

    fn handle_payload(&self, payload: &[u8]) -> Result<()> {
        for message in codec::decode_messages(payload)? {
            match message {
                StreamMessage::Metadata { signo, message } => self.handle_metadata(signo, message),
                StreamMessage::Data { signo, payload } => {
                    let signal_id = self.session.read().signos.get(&signo).cloned();
                    match signal_id {
                        Some(id) => self.sink.on_data(&id, &payload),
                        None => trace!("data on unknown signo {}", signo),
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_metadata(&self, signo: u32, message: MetadataMessage) {
        match message {
            MetadataMessage::ApiVersion { version } => {
                debug!("server api version {}", version);
                self.session.write().api_version = Some(version);
            }
            MetadataMessage::Init {
                stream_id,
                command_interfaces,
            } => {
                let port = control_port(&command_interfaces);
                debug!("stream id {}, control port {:?}", stream_id, port);
                let mut session = self.session.write();
                session.stream_id = Some(stream_id);
                session.control_port = port;
            }
            MetadataMessage::Available { signal_ids } => {
                self.session.write().available = Some(signal_ids.clone());
                self.sink.on_available(&signal_ids);
            }
            MetadataMessage::Subscribe { signal_id } => {
                debug!("subscribed to {} on signo {}", signal_id, signo);
                self.session.write().signos.insert(signo, signal_id);
            }
            MetadataMessage::Unsubscribe { signal_id } => {
                {
                    let mut session = self.session.write();
                    session.signos.retain(|_, id| *id != signal_id);
                    session.signals.remove(&signal_id);
                }
                self.sink.on_unsubscribed(&signal_id);
            }
            MetadataMessage::Signal(params) => {
                let Some(signal_id) = self.session.read().signos.get(&signo).cloned() else {
                    warn!("signal metadata on unknown signo {}", signo);
                    return;
                };
                match SignalMetadata::from_params(&params) {
                    Ok(metadata) => {
                        self.session
                            .write()
                            .signals
                            .insert(signal_id.clone(), metadata.clone());
                        self.sink.on_signal_metadata(&signal_id, &metadata);
                    }
                    Err(e) => warn!("bad signal metadata for {}: {}", signal_id, e),
                }
            }
            MetadataMessage::Other { method, .. } => debug!("ignoring metadata '{}'", method),
        }
    }
}

/// `commandInterfaces["jsonrpc-http"].port`, sent as a string.
fn control_port(command_interfaces: &Value) -> Option<u16> {
    let port = command_interfaces.get("jsonrpc-http")?.get("port")?;
    match port {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        _ => None,
    }
}

/// Client handler for one streaming server.
pub struct StreamingClient {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl StreamingClient {
    pub fn new(config: ClientConfig, sink: Arc<dyn StreamSink>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                sink,
                status: RwLock::new(ConnectionStatus::Disconnected),
                session: RwLock::new(SessionState::default()),
                running: AtomicBool::new(false),
                writer: Mutex::new(None),
            }),
            worker: None,
        })
    }

    /// Connect, then keep the connection alive on a worker thread.
    ///
    /// Returns once `init` and `available` have been received.
    pub fn connect(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Err(Error::AlreadyRunning);
        }
        self.shared.set_status(ConnectionStatus::Connecting);
        let conn = match self.shared.establish() {
            Ok(conn) => conn,
            Err(e) => {
                self.shared.set_status(ConnectionStatus::Disconnected);
                return Err(e);
            }
        };
        self.shared.running.store(true, Ordering::Relaxed);
        self.shared.set_status(ConnectionStatus::Connected);
        info!(
            "connected to {}:{} as {}",
            self.shared.config.host, self.shared.config.streaming_port, self.shared.config.client_id
        );

        let shared = self.shared.clone();
        let worker = thread::Builder::new()
            .name(format!("opendaq-client-{}", self.shared.config.client_id))
            .spawn(move || run(shared, conn));
        match worker {
            Ok(handle) => {
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::Relaxed);
                self.shared.close_writer(true);
                self.shared.set_status(ConnectionStatus::Disconnected);
                Err(e.into())
            }
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.read()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn stream_id(&self) -> Option<String> {
        self.shared.session.read().stream_id.clone()
    }

    pub fn api_version(&self) -> Option<String> {
        self.shared.session.read().api_version.clone()
    }

    /// Signal ids from the last `available` announcement.
    pub fn available_signals(&self) -> Vec<String> {
        self.shared
            .session
            .read()
            .available
            .clone()
            .unwrap_or_default()
    }

    /// Signals the server has confirmed with `subscribe`.
    pub fn subscribed_signals(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.session.read().signos.values().cloned().collect();
        ids.sort();
        ids
    }

    pub fn signal_metadata(&self, signal_id: &str) -> Option<SignalMetadata> {
        self.shared.session.read().signals.get(signal_id).cloned()
    }

    pub fn subscribe(&self, signal_ids: &[&str]) -> Result<()> {
        let stream_id = self.stream_id().ok_or(Error::NotConnected)?;
        self.control(ControlRequest::subscribe(
            stream_id,
            signal_ids.iter().map(|s| s.to_string()).collect(),
        ))
    }

    pub fn unsubscribe(&self, signal_ids: &[&str]) -> Result<()> {
        let stream_id = self.stream_id().ok_or(Error::NotConnected)?;
        self.control(ControlRequest::unsubscribe(
            stream_id,
            signal_ids.iter().map(|s| s.to_string()).collect(),
        ))
    }

    fn control(&self, request: ControlRequest) -> Result<()> {
        if self.status() != ConnectionStatus::Connected {
            return Err(Error::NotConnected);
        }
        let config = &self.shared.config;
        let port = self
            .shared
            .session
            .read()
            .control_port
            .unwrap_or(config.control_port);
        let response = connection::post_json(
            &config.host,
            port,
            &request.to_body()?,
            config.connection_timeout(),
        )?;
        if response.status == 200 {
            Ok(())
        } else {
            Err(Error::Rejected(format!(
                "{} answered {} {}",
                request.method.as_str(),
                response.status,
                response.reason
            )))
        }
    }

    /// Close the connection and stop reconnecting.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Relaxed);
        self.shared.close_writer(true);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("client worker panicked");
            }
        }
        self.shared.set_status(ConnectionStatus::Disconnected);
    }
}

impl Drop for StreamingClient {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for StreamingClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingClient")
            .field("client_id", &self.shared.config.client_id)
            .field("status", &self.status())
            .finish()
    }
}

// ============================================================================
// Worker
// ============================================================================

fn run(shared: Arc<Shared>, mut conn: WsConnection) {
    loop {
        let reason = serve(&shared, &mut conn);
        if !shared.running.load(Ordering::Relaxed) {
            break;
        }
        warn!("client {} lost connection: {}", shared.config.client_id, reason);
        shared.close_writer(false);
        *shared.session.write() = SessionState::default();
        shared.set_status(ConnectionStatus::Reconnecting);

        match reconnect(&shared) {
            Some(next) => {
                conn = next;
                shared.set_status(ConnectionStatus::Connected);
                info!("client {} reconnected", shared.config.client_id);
            }
            None => break,
        }
    }
    shared.close_writer(false);
    debug!("client {} worker stopped", shared.config.client_id);
}

fn reconnect(shared: &Shared) -> Option<WsConnection> {
    loop {
        if !shared.sleep_while_running(shared.config.reconnection_period()) {
            return None;
        }
        match shared.establish() {
            Ok(conn) => return Some(conn),
            Err(e) => debug!("reconnect attempt failed: {}", e),
        }
    }
}

/// Read until the connection is lost or the client stops.
fn serve(shared: &Shared, conn: &mut WsConnection) -> String {
    let heartbeat = shared.config.heartbeat_period();
    let inactivity = shared.config.inactivity_timeout();
    if let Err(e) = conn.set_read_timeout(heartbeat) {
        return e.to_string();
    }
    let mut last_received = Instant::now();
    let mut last_ping = Instant::now();

    while shared.running.load(Ordering::Relaxed) {
        match conn.read_frame() {
            Ok(Some(frame)) => {
                last_received = Instant::now();
                match frame.opcode {
                    Opcode::Binary => {
                        if let Err(e) = shared.handle_payload(&frame.payload) {
                            warn!("dropping malformed payload: {}", e);
                        }
                    }
                    Opcode::Close => return "server closed the connection".into(),
                    Opcode::Ping => {
                        if let Err(e) = shared.send_frame(Opcode::Pong, &frame.payload) {
                            return e.to_string();
                        }
                    }
                    _ => {}
                }
            }
            Ok(None) => {}
            Err(e) => return e.to_string(),
        }

        if last_received.elapsed() >= inactivity {
            return format!("no traffic for {:?}", inactivity);
        }
        if last_ping.elapsed() >= heartbeat {
            if let Err(e) = shared.send_frame(Opcode::Ping, &[]) {
                return e.to_string();
            }
            last_ping = Instant::now();
        }
    }
    "stopped".into()
}

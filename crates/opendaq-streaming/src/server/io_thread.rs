// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server I/O thread.
//!
//! One thread runs a mio poll loop over every server socket: the data
//! (WebSocket) and control (HTTP) acceptors, the optional config-protocol
//! acceptor, and all accepted connections. No call on this thread blocks.
//!
//! ```text
//! +----------------------------------------------------------+
//! |                        IoThread                          |
//! |  mio::Poll                                               |
//! |   - data / control / config acceptors                   |
//! |   - negotiating, established and config sockets         |
//! |   - Waker (commands: notify, shutdown)                  |
//! |                                                          |
//! |  readable -> negotiate / read frames / read packets     |
//! |  writable -> flush pending bytes                        |
//! +----------------------------------------------------------+
//! ```

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info, warn};

use super::config_channel::{ConfigRequestHandler, ConfigSession};
use super::registry::ListenerRegistry;
use super::session::{
    EstablishedClient, FrameReader, NegotiatingClient, NegotiationOutcome, ReadOutcome,
    SessionSettings,
};
use crate::config::ServerConfig;
use crate::error::Error;
use crate::protocol::control::ControlRequest;
use crate::protocol::http::HttpRequest;
use crate::protocol::packet_buffer::PacketBuffer;
use crate::stats::ServerStats;

// ============================================================================
// Constants
// ============================================================================

const DATA_LISTENER: Token = Token(0);
const CONTROL_LISTENER: Token = Token(1);
const CONFIG_LISTENER: Token = Token(2);
const WAKER_TOKEN: Token = Token(3);

/// First token handed to accepted connections.
const CONNECTION_TOKEN_START: usize = 4;

const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const MAX_EVENTS: usize = 256;

// ============================================================================
// Commands and handle
// ============================================================================

/// Commands sent to the I/O thread.
#[derive(Debug)]
pub enum IoCommand {
    /// Broadcast a server notification on every config connection.
    Notify(Vec<u8>),
    Shutdown,
}

/// Addresses the server actually bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalAddrs {
    pub streaming: SocketAddr,
    pub control: SocketAddr,
    pub config: Option<SocketAddr>,
}

/// Handle owned by the server.
pub struct IoThreadHandle {
    cmd_tx: Sender<IoCommand>,
    waker: Arc<Waker>,
    thread_handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    local_addrs: LocalAddrs,
}

impl IoThreadHandle {
    pub fn local_addrs(&self) -> LocalAddrs {
        self.local_addrs
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn send(&self, command: IoCommand) -> io::Result<()> {
        self.cmd_tx
            .send(command)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "I/O thread stopped"))?;
        self.waker.wake()
    }

    /// Stop the loop and join the thread.
    pub fn shutdown(&mut self) -> io::Result<()> {
        let _ = self.cmd_tx.send(IoCommand::Shutdown);
        let _ = self.waker.wake();
        if let Some(handle) = self.thread_handle.take() {
            handle
                .join()
                .map_err(|_| io::Error::other("I/O thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for IoThreadHandle {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

// ============================================================================
// I/O thread
// ============================================================================

/// Clears the running flag when the loop exits, unwinding included.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

enum Connection {
    Negotiating(NegotiatingClient),
    Established {
        client: Arc<EstablishedClient>,
        reader: FrameReader,
    },
    Config(ConfigSession),
}

/// Event loop state.
pub struct IoThread {
    poll: Poll,
    data_listener: TcpListener,
    control_listener: TcpListener,
    config_listener: Option<TcpListener>,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    cmd_rx: Receiver<IoCommand>,
    running: Arc<AtomicBool>,
    config: ServerConfig,
    settings: SessionSettings,
    advertised_control_port: u16,
    registry: Arc<ListenerRegistry>,
    handler: Arc<dyn ConfigRequestHandler>,
    stats: Arc<ServerStats>,
}

impl IoThread {
    /// Bind every acceptor and spawn the loop.
    pub fn spawn(
        config: ServerConfig,
        registry: Arc<ListenerRegistry>,
        handler: Arc<dyn ConfigRequestHandler>,
        stats: Arc<ServerStats>,
    ) -> io::Result<IoThreadHandle> {
        let poll = Poll::new()?;
        let registry_ref = poll.registry();

        let bind = |port: u16, token: Token| -> io::Result<TcpListener> {
            let mut listener = TcpListener::bind(SocketAddr::new(config.bind_address, port))?;
            registry_ref.register(&mut listener, token, Interest::READABLE)?;
            Ok(listener)
        };
        let data_listener = bind(config.streaming_port, DATA_LISTENER)?;
        let control_listener = bind(config.control_port, CONTROL_LISTENER)?;
        let config_listener = if config.config_channel_enabled {
            Some(bind(config.config_port, CONFIG_LISTENER)?)
        } else {
            None
        };

        let local_addrs = LocalAddrs {
            streaming: data_listener.local_addr()?,
            control: control_listener.local_addr()?,
            config: config_listener
                .as_ref()
                .map(TcpListener::local_addr)
                .transpose()?,
        };

        let (cmd_tx, cmd_rx) = channel();
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let running = Arc::new(AtomicBool::new(true));

        let settings = SessionSettings {
            read_buffer_size: config.read_buffer_size,
            socket_send_buffer: config.socket_send_buffer,
            max_pending_bytes: config.max_pending_bytes,
            reply_to_ping: config.reply_to_ping,
        };

        let io_thread = Self {
            poll,
            data_listener,
            control_listener,
            config_listener,
            connections: HashMap::new(),
            next_token: CONNECTION_TOKEN_START,
            cmd_rx,
            running: running.clone(),
            config,
            settings,
            advertised_control_port: local_addrs.control.port(),
            registry,
            handler,
            stats,
        };

        let thread_handle = thread::Builder::new()
            .name("opendaq-stream-io".to_string())
            .spawn(move || io_thread.run())?;

        info!(
            "streaming on {}, control on {}{}",
            local_addrs.streaming,
            local_addrs.control,
            local_addrs
                .config
                .map(|a| format!(", config on {}", a))
                .unwrap_or_default()
        );

        Ok(IoThreadHandle {
            cmd_tx,
            waker,
            thread_handle: Some(thread_handle),
            running,
            local_addrs,
        })
    }

    fn run(mut self) {
        let _running = RunningGuard(self.running.clone());
        let mut events = Events::with_capacity(MAX_EVENTS);

        while self.running.load(Ordering::Relaxed) {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    error!("poll error: {}", e);
                }
                continue;
            }

            for event in events.iter() {
                match event.token() {
                    DATA_LISTENER => self.handle_accept(DATA_LISTENER),
                    CONTROL_LISTENER => self.handle_accept(CONTROL_LISTENER),
                    CONFIG_LISTENER => self.handle_accept(CONFIG_LISTENER),
                    WAKER_TOKEN => self.handle_commands(),
                    token => {
                        if event.is_readable() || event.is_read_closed() || event.is_error() {
                            self.handle_readable(token);
                        }
                        if event.is_writable() {
                            self.handle_writable(token);
                        }
                    }
                }
            }
        }

        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.close_connection(token, "server stopping");
        }
        self.running.store(false, Ordering::Relaxed);
        debug!("I/O thread stopped");
    }

    fn handle_commands(&mut self) {
        loop {
            match self.cmd_rx.try_recv() {
                Ok(IoCommand::Notify(json)) => self.broadcast_notification(json),
                Ok(IoCommand::Shutdown) | Err(TryRecvError::Disconnected) => {
                    self.running.store(false, Ordering::Relaxed);
                    break;
                }
                Err(TryRecvError::Empty) => break,
            }
        }
    }

    fn streaming_connection_count(&self) -> usize {
        self.connections
            .values()
            .filter(|c| !matches!(c, Connection::Config(_)))
            .count()
    }

    fn config_connection_count(&self) -> usize {
        self.connections
            .values()
            .filter(|c| matches!(c, Connection::Config(_)))
            .count()
    }

    fn handle_accept(&mut self, which: Token) {
        loop {
            let listener = match which {
                DATA_LISTENER => &self.data_listener,
                CONTROL_LISTENER => &self.control_listener,
                _ => match &self.config_listener {
                    Some(l) => l,
                    None => return,
                },
            };
            match listener.accept() {
                Ok((stream, peer)) => {
                    self.stats.record_connection_accepted();
                    let _ = stream.set_nodelay(true);
                    if which == CONFIG_LISTENER {
                        self.accept_config(stream, peer);
                    } else {
                        self.accept_streaming(stream, peer);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn allocate_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn accept_streaming(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        if self.streaming_connection_count() >= self.config.max_connections {
            warn!("refusing {}: connection limit {} reached", peer, self.config.max_connections);
            self.stats.record_connection_refused();
            return;
        }
        let token = self.allocate_token();
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)
        {
            warn!("failed to register {}: {}", peer, e);
            return;
        }
        debug!("accepted {} as {:?}", peer, token);
        self.connections.insert(
            token,
            Connection::Negotiating(NegotiatingClient::new(
                stream,
                peer,
                self.config.max_http_request_size,
            )),
        );
        // Bytes may already be waiting.
        self.handle_readable(token);
    }

    fn accept_config(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        let token = self.allocate_token();
        if let Err(e) = self.poll.registry().register(
            &mut stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            warn!("failed to register {}: {}", peer, e);
            return;
        }
        let mut session = ConfigSession::new(stream, peer);
        if self.config_connection_count() >= self.config.max_config_connections {
            warn!("rejecting config connection from {}", peer);
            self.stats.record_connection_refused();
            let _ = session.send(&PacketBuffer::connection_rejected(
                "maximum number of config connections reached",
            ));
            session.close();
            return;
        }
        debug!("config connection from {}", peer);
        self.connections.insert(token, Connection::Config(session));
        self.handle_readable(token);
    }

    fn handle_readable(&mut self, token: Token) {
        let Some(connection) = self.connections.get_mut(&token) else {
            return;
        };
        match connection {
            Connection::Negotiating(client) => match client.service() {
                Ok(NegotiationOutcome::Pending) => {}
                Ok(NegotiationOutcome::Upgrade(request)) => self.upgrade(token, request),
                Ok(NegotiationOutcome::Control(request)) => self.control(token, request),
                Ok(NegotiationOutcome::Closed) => self.close_connection(token, "closed during negotiation"),
                Err(e) => {
                    let peer = client.peer();
                    warn!("negotiation with {} failed: {}", peer, e);
                    if let Some(Connection::Negotiating(client)) = self.connections.remove(&token) {
                        client.respond_and_close(400, "Bad Request");
                    }
                }
            },
            Connection::Established { client, reader } => {
                if let ReadOutcome::Closed(reason) =
                    client.service_read(reader, self.settings.reply_to_ping)
                {
                    self.close_connection(token, &reason);
                }
            }
            Connection::Config(session) => {
                match session.service_read(self.handler.as_ref(), &self.stats) {
                    Ok(true) => {}
                    Ok(false) => self.close_connection(token, "peer closed"),
                    Err(e) => {
                        let reason = e.to_string();
                        self.close_connection(token, &reason);
                    }
                }
            }
        }
    }

    fn handle_writable(&mut self, token: Token) {
        let result = match self.connections.get_mut(&token) {
            Some(Connection::Established { client, .. }) => client.flush_pending(),
            Some(Connection::Config(session)) => session.flush(),
            _ => return,
        };
        if let Err(e) = result {
            let reason = format!("write failed: {}", e);
            self.close_connection(token, &reason);
        }
    }

    /// Hand a negotiating socket over to an established client.
    fn upgrade(&mut self, token: Token, request: HttpRequest) {
        let Some(Connection::Negotiating(mut negotiating)) = self.connections.remove(&token) else {
            return;
        };
        let peer = negotiating.peer();
        if let Err(e) = self.poll.registry().reregister(
            negotiating.stream_mut(),
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            warn!("failed to reregister {}: {}", peer, e);
            return;
        }

        let (client, mut reader) =
            match negotiating.establish(&request, token.0 as u64, self.settings, self.stats.clone()) {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("upgrade of {} failed: {}", peer, e);
                    return;
                }
            };
        self.stats.record_upgrade();
        info!(
            "client {} connected from {}{}",
            client.stream_id(),
            peer,
            client
                .client_id()
                .map(|id| format!(" (client id {})", id))
                .unwrap_or_default()
        );

        if let Err(e) = client.send_connection_metadata(
            &self.config.api_version,
            self.advertised_control_port,
            self.registry.signal_ids(),
        ) {
            warn!("initial metadata to {} failed: {}", peer, e);
            client.shutdown();
            self.stats.record_session_closed();
            return;
        }

        let outcome = client.service_read(&mut reader, self.settings.reply_to_ping);
        self.connections
            .insert(token, Connection::Established { client, reader });
        if let ReadOutcome::Closed(reason) = outcome {
            self.close_connection(token, &reason);
        }
    }

    /// Answer a JSON control request and close the socket.
    fn control(&mut self, token: Token, request: HttpRequest) {
        let Some(Connection::Negotiating(client)) = self.connections.remove(&token) else {
            return;
        };
        let peer = client.peer();
        let result = ControlRequest::parse(&request.body).and_then(|control| {
            let target = self.find_stream(&control.stream_id).ok_or_else(|| {
                Error::protocol(format!("unknown stream id {}", control.stream_id))
            })?;
            self.registry.dispatch(&target, &control)
        });
        self.stats.record_control_request(result.is_ok());
        match result {
            Ok(()) => client.respond_and_close(200, "OK"),
            Err(e) => {
                warn!("control request from {} failed: {}", peer, e);
                client.respond_and_close(400, "Bad Request");
            }
        }
    }

    fn find_stream(&self, stream_id: &str) -> Option<Arc<EstablishedClient>> {
        self.connections.values().find_map(|c| match c {
            Connection::Established { client, .. }
                if client.stream_id() == stream_id && !client.is_closed() =>
            {
                Some(client.clone())
            }
            _ => None,
        })
    }

    fn broadcast_notification(&mut self, json: Vec<u8>) {
        let packet = PacketBuffer::server_notification(json);
        let mut failed = Vec::new();
        for (token, connection) in self.connections.iter_mut() {
            if let Connection::Config(session) = connection {
                if let Err(e) = session.send(&packet) {
                    debug!("notification to {} failed: {}", session.peer(), e);
                    failed.push(*token);
                }
            }
        }
        for token in failed {
            self.close_connection(token, "notification failed");
        }
    }

    fn close_connection(&mut self, token: Token, reason: &str) {
        let Some(connection) = self.connections.remove(&token) else {
            return;
        };
        match connection {
            Connection::Negotiating(mut client) => {
                debug!("negotiating client {} closed: {}", client.peer(), reason);
                let _ = self.poll.registry().deregister(client.stream_mut());
            }
            Connection::Established { client, .. } => {
                info!(
                    "client {} ({}) disconnected: {}",
                    client.stream_id(),
                    client.peer(),
                    reason
                );
                self.registry.forget_client(client.id());
                client.shutdown();
                self.stats.record_session_closed();
            }
            Connection::Config(mut session) => {
                debug!("config connection {} closed: {}", session.peer(), reason);
                let _ = self.poll.registry().deregister(session.stream_mut());
                session.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_flag_cleared_on_panic() {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let result = thread::spawn(move || {
            let _guard = RunningGuard(flag);
            panic!("loop failure");
        })
        .join();
        assert!(result.is_err());
        assert!(!running.load(Ordering::Relaxed));
    }
}

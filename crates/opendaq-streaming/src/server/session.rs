// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server-side connection state machine.
//!
//! ```text
//! accept -> NegotiatingClient --(HTTP upgrade)--> EstablishedClient -> closed
//!                  |
//!                  +--(JSON control request)--> 200/400, closed
//! ```
//!
//! Both states own non-blocking mio sockets serviced by the I/O thread.
//! An [`EstablishedClient`] is shared (`Arc`) with the listeners it is
//! subscribed to, which write to it from the signal delivery thread.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mio::net::TcpStream;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::codec;
use crate::error::{Error, Result};
use crate::protocol::header::{packet_type, CONNECTION_SIGNO, MAX_SIGNO};
use crate::protocol::http::{self, HttpRequest};
use crate::protocol::metadata::MetadataMessage;
use crate::protocol::websocket::{self, Opcode};
use crate::stats::ServerStats;

const READ_CHUNK: usize = 4096;

// ============================================================================
// Negotiating
// ============================================================================

/// Result of servicing a negotiating socket.
#[derive(Debug)]
pub enum NegotiationOutcome {
    /// Request incomplete, wait for more bytes.
    Pending,
    /// WebSocket upgrade request; hand the socket off.
    Upgrade(HttpRequest),
    /// Plain HTTP request for the control handler.
    Control(HttpRequest),
    /// Peer closed before sending a request.
    Closed,
}

/// Freshly accepted socket reading its HTTP request.
pub struct NegotiatingClient {
    stream: TcpStream,
    peer: SocketAddr,
    buffer: Vec<u8>,
    max_request: usize,
}

impl NegotiatingClient {
    pub fn new(stream: TcpStream, peer: SocketAddr, max_request: usize) -> Self {
        Self {
            stream,
            peer,
            buffer: Vec::with_capacity(1024),
            max_request,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Read available bytes and try to parse the request.
    pub fn service(&mut self) -> Result<NegotiationOutcome> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some((request, consumed)) = http::parse_request(&self.buffer, self.max_request)? {
                self.buffer.drain(..consumed);
                return Ok(if request.is_websocket_upgrade() {
                    NegotiationOutcome::Upgrade(request)
                } else {
                    NegotiationOutcome::Control(request)
                });
            }
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(NegotiationOutcome::Closed),
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(NegotiationOutcome::Pending)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Answer a control request and close the socket.
    pub fn respond_and_close(mut self, status: u16, reason: &str) {
        let response = http::status_response(status, reason);
        if let Err(e) = self.stream.write_all(&response) {
            debug!("control response to {} not delivered: {}", self.peer, e);
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    /// Complete the upgrade: queue `101 Switching Protocols` and turn the
    /// socket into an established client. Bytes received after the request
    /// are returned in the frame reader.
    pub fn establish(
        self,
        request: &HttpRequest,
        id: u64,
        settings: SessionSettings,
        stats: Arc<ServerStats>,
    ) -> Result<(Arc<EstablishedClient>, FrameReader)> {
        let key = request
            .header("sec-websocket-key")
            .ok_or_else(|| Error::protocol("upgrade without Sec-WebSocket-Key"))?;
        let accept = websocket::accept_key(key);

        configure_send_buffer(&self.stream, settings.socket_send_buffer, self.peer);

        let mut reader = FrameReader::new(settings.read_buffer_size);
        reader.seed(&self.buffer)?;

        let client = Arc::new(EstablishedClient {
            id,
            peer: self.peer,
            stream_id: new_stream_id(),
            client_id: request.header("x-client-id").map(str::to_string),
            stream: self.stream,
            outbound: Mutex::new(Vec::new()),
            max_pending: settings.max_pending_bytes,
            closed: AtomicBool::new(false),
            signos: Mutex::new(SignoTable::default()),
            stats,
        });
        client.send_raw(&http::upgrade_response(&accept))?;
        Ok((client, reader))
    }
}

/// Per-session tunables taken from the server config.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub read_buffer_size: usize,
    pub socket_send_buffer: usize,
    pub max_pending_bytes: usize,
    pub reply_to_ping: bool,
}

fn new_stream_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn configure_send_buffer(stream: &TcpStream, requested: usize, peer: SocketAddr) {
    if requested == 0 {
        return;
    }
    let sock = socket2::SockRef::from(stream);
    if let Err(e) = sock.set_send_buffer_size(requested) {
        warn!("failed to set send buffer for {}: {}", peer, e);
        return;
    }
    match sock.send_buffer_size() {
        Ok(actual) if actual < requested => warn!(
            "send buffer for {} is {} bytes, requested {}; high-rate streams may be dropped",
            peer, actual, requested
        ),
        Ok(_) => {}
        Err(e) => warn!("failed to read send buffer size for {}: {}", peer, e),
    }
}

// ============================================================================
// Frame reader
// ============================================================================

/// Buffer accumulating WebSocket frames.
///
/// The server uses a fixed buffer: a frame that does not fit is fatal.
/// A growable reader enlarges its buffer for announced frames up to
/// `limit`.
pub struct FrameReader {
    buffer: Vec<u8>,
    filled: usize,
    limit: usize,
}

/// A complete frame taken out of the reader (payload unmasked).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl FrameReader {
    pub fn new(capacity: usize) -> Self {
        Self::growable(capacity, capacity)
    }

    /// Reader starting at `initial` bytes that grows up to `limit`.
    pub fn growable(initial: usize, limit: usize) -> Self {
        let initial = initial.min(limit);
        Self {
            buffer: vec![0u8; initial],
            filled: 0,
            limit,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub(crate) fn seed(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.limit {
            return Err(Error::protocol("frame exceeds read buffer"));
        }
        if bytes.len() > self.buffer.len() {
            self.buffer.resize(bytes.len(), 0);
        }
        self.buffer[..bytes.len()].copy_from_slice(bytes);
        self.filled = bytes.len();
        Ok(())
    }

    /// Read once from `source` into the free space.
    pub(crate) fn fill_from(&mut self, source: &mut impl Read) -> io::Result<usize> {
        let n = source.read(&mut self.buffer[self.filled..])?;
        self.filled += n;
        Ok(n)
    }

    /// Free space for the next read.
    fn spare(&mut self) -> &mut [u8] {
        &mut self.buffer[self.filled..]
    }

    /// Next complete frame, `Ok(None)` if more bytes are needed.
    ///
    /// A frame that cannot fit in the buffer is an error.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if let Some(announced) = websocket::announced_frame_size(&self.buffer[..self.filled]) {
            if announced > self.limit as u64 {
                return Err(Error::protocol(format!(
                    "frame of {} bytes exceeds read buffer of {}",
                    announced, self.limit
                )));
            }
            if announced > self.buffer.len() as u64 {
                self.buffer.resize(announced as usize, 0);
            }
        }
        let data = &self.buffer[..self.filled];
        let header = websocket::decode_header(data);
        if !header.is_complete() {
            return Ok(None);
        }
        let mut payload = data[header.header_size..header.frame_size()].to_vec();
        if let Some(key) = header.masking_key {
            websocket::apply_mask(&mut payload, key);
        }
        self.buffer.copy_within(header.frame_size()..self.filled, 0);
        self.filled -= header.frame_size();
        Ok(Some(Frame {
            opcode: header.opcode,
            payload,
        }))
    }
}

// ============================================================================
// Established
// ============================================================================

#[derive(Default)]
struct SignoTable {
    by_signal: HashMap<String, u32>,
    next: u32,
}

/// Why an established session stopped reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Open,
    Closed(String),
}

/// Upgraded streaming connection.
pub struct EstablishedClient {
    id: u64,
    peer: SocketAddr,
    stream_id: String,
    client_id: Option<String>,
    stream: TcpStream,
    /// Bytes the kernel did not accept yet.
    outbound: Mutex<Vec<u8>>,
    max_pending: usize,
    closed: AtomicBool,
    signos: Mutex<SignoTable>,
    stats: Arc<ServerStats>,
}

impl EstablishedClient {
    /// Connection id, unique for the server's lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Signo of a signal on this connection, assigned on first use.
    pub fn signo_for(&self, signal_id: &str) -> Result<u32> {
        let mut table = self.signos.lock();
        if let Some(signo) = table.by_signal.get(signal_id) {
            return Ok(*signo);
        }
        if table.next >= MAX_SIGNO {
            return Err(Error::protocol("signal numbers exhausted"));
        }
        table.next += 1;
        let signo = table.next;
        table.by_signal.insert(signal_id.to_string(), signo);
        Ok(signo)
    }

    /// Signo if one was already assigned.
    pub fn existing_signo(&self, signal_id: &str) -> Option<u32> {
        self.signos.lock().by_signal.get(signal_id).copied()
    }

    pub fn send_metadata(&self, signo: u32, message: &MetadataMessage) -> Result<()> {
        let frame = codec::encode_frame(signo, packet_type::METADATA, &message.encode()?, None);
        self.send_raw(&frame)?;
        self.stats.record_metadata_sent(frame.len());
        Ok(())
    }

    pub fn send_data(&self, signo: u32, payload: &[u8]) -> Result<()> {
        let frame = codec::encode_frame(signo, packet_type::DATA, payload, None);
        self.send_raw(&frame)?;
        self.stats.record_data_sent(frame.len());
        Ok(())
    }

    /// `apiVersion`, `init` and `available`, in that order.
    pub fn send_connection_metadata(
        &self,
        api_version: &str,
        control_port: u16,
        signal_ids: Vec<String>,
    ) -> Result<()> {
        self.send_metadata(
            CONNECTION_SIGNO,
            &MetadataMessage::ApiVersion {
                version: api_version.to_string(),
            },
        )?;
        self.send_metadata(
            CONNECTION_SIGNO,
            &MetadataMessage::Init {
                stream_id: self.stream_id.clone(),
                command_interfaces: serde_json::json!({
                    "jsonrpc-http": {
                        "httpMethod": "POST",
                        "httpPath": "/",
                        "httpVersion": "1.1",
                        "port": control_port.to_string(),
                    }
                }),
            },
        )?;
        self.send_metadata(CONNECTION_SIGNO, &MetadataMessage::Available { signal_ids })
    }

    /// Write `bytes`, queueing what the socket does not take.
    ///
    /// Fails (and shuts the connection down) when the queue would exceed
    /// the pending limit.
    pub fn send_raw(&self, bytes: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let mut pending = self.outbound.lock();
        let written = if pending.is_empty() {
            match write_some(&self.stream, bytes) {
                Ok(n) => n,
                Err(e) => {
                    drop(pending);
                    self.shutdown();
                    return Err(e.into());
                }
            }
        } else {
            0
        };
        let rest = &bytes[written..];
        if rest.is_empty() {
            return Ok(());
        }
        if pending.len() + rest.len() > self.max_pending {
            let total = pending.len() + rest.len();
            drop(pending);
            warn!(
                "client {} ({}) too slow: {} bytes pending",
                self.stream_id, self.peer, total
            );
            self.shutdown();
            return Err(Error::SlowConsumer {
                pending: total,
                limit: self.max_pending,
            });
        }
        pending.extend_from_slice(rest);
        Ok(())
    }

    /// Flush queued bytes; called on writable readiness.
    pub fn flush_pending(&self) -> Result<()> {
        let mut pending = self.outbound.lock();
        if pending.is_empty() {
            return Ok(());
        }
        let written = write_some(&self.stream, &pending)?;
        pending.drain(..written);
        trace!("flushed {} bytes to {}", written, self.peer);
        Ok(())
    }

    pub fn pending_bytes(&self) -> usize {
        self.outbound.lock().len()
    }

    /// Close the socket. The I/O thread notices and cleans up.
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("shutting down client {} ({})", self.stream_id, self.peer);
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }

    #[cfg(test)]
    pub(crate) fn close_write_half(&self) {
        let _ = self.stream.shutdown(Shutdown::Write);
    }

    /// Read and process frames until the socket would block.
    pub fn service_read(&self, reader: &mut FrameReader, reply_to_ping: bool) -> ReadOutcome {
        loop {
            match self.process_frames(reader, reply_to_ping) {
                Ok(ReadOutcome::Open) => {}
                Ok(closed) => return closed,
                Err(e) => {
                    if matches!(e, Error::Protocol(_)) {
                        self.stats.record_oversized_frame();
                    }
                    return ReadOutcome::Closed(e.to_string());
                }
            }
            if self.is_closed() {
                return ReadOutcome::Closed("shut down locally".into());
            }
            match (&self.stream).read(reader.spare()) {
                Ok(0) => return ReadOutcome::Closed("peer closed".into()),
                Ok(n) => reader.filled += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return ReadOutcome::Open,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return ReadOutcome::Closed(e.to_string()),
            }
        }
    }

    /// Handle every complete frame in the reader.
    pub fn process_frames(
        &self,
        reader: &mut FrameReader,
        reply_to_ping: bool,
    ) -> Result<ReadOutcome> {
        while let Some(frame) = reader.next_frame()? {
            match frame.opcode {
                Opcode::Close => {
                    let _ = self.send_raw(&websocket::encode_frame(Opcode::Close, &[], None));
                    return Ok(ReadOutcome::Closed("close frame".into()));
                }
                Opcode::Ping if reply_to_ping => {
                    self.send_raw(&websocket::encode_frame(Opcode::Pong, &frame.payload, None))?;
                }
                other => trace!("ignoring {:?} frame from {}", other, self.peer),
            }
        }
        Ok(ReadOutcome::Open)
    }
}

impl std::fmt::Debug for EstablishedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EstablishedClient")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("stream_id", &self.stream_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Single non-blocking write attempt; `WouldBlock` counts as 0 bytes.
fn write_some(stream: &TcpStream, bytes: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    let mut writer = stream;
    while written < bytes.len() {
        match writer.write(&bytes[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

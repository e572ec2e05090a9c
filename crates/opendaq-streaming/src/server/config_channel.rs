// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Native config-protocol sessions (PacketBuffer framing).

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};

use mio::net::TcpStream;
use serde_json::{json, Value};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::packet_buffer::{PacketBuffer, PacketBufferType};
use crate::stats::ServerStats;

/// Config-protocol versions this server speaks.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[u16] = &[0, 1];

const READ_CHUNK: usize = 4096;

/// Answers RPC requests received on the config channel.
pub trait ConfigRequestHandler: Send + Sync {
    /// Handle one JSON request and produce the JSON reply.
    fn handle_rpc(&self, request: &Value) -> Value;
}

/// Handler serving `GetSignalIds` and `GetServerInfo`.
#[derive(Debug, Clone)]
pub struct DefaultConfigHandler {
    signal_ids: Vec<String>,
    server_info: Value,
}

impl DefaultConfigHandler {
    pub fn new(signal_ids: Vec<String>, server_info: Value) -> Self {
        Self {
            signal_ids,
            server_info,
        }
    }
}

impl ConfigRequestHandler for DefaultConfigHandler {
    fn handle_rpc(&self, request: &Value) -> Value {
        match request.get("method").and_then(Value::as_str) {
            Some("GetSignalIds") => json!({ "result": self.signal_ids }),
            Some("GetServerInfo") => json!({ "result": self.server_info }),
            Some(other) => json!({ "error": format!("unknown method '{}'", other) }),
            None => json!({ "error": "missing method" }),
        }
    }
}

/// One connection on the config port.
pub struct ConfigSession {
    stream: TcpStream,
    peer: SocketAddr,
    inbound: Vec<u8>,
    outbound: Vec<u8>,
    version: u16,
}

impl ConfigSession {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            inbound: Vec::new(),
            outbound: Vec::new(),
            version: SUPPORTED_PROTOCOL_VERSIONS[0],
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Read until the socket would block and answer every complete packet.
    ///
    /// Returns `Ok(false)` once the peer has closed.
    pub fn service_read(
        &mut self,
        handler: &dyn ConfigRequestHandler,
        stats: &ServerStats,
    ) -> Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut open = true;
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    open = false;
                    break;
                }
                Ok(n) => self.inbound.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        while let Some((packet, used)) = PacketBuffer::decode(&self.inbound)? {
            self.inbound.drain(..used);
            stats.record_config_packet();
            if let Some(reply) = self.handle_packet(packet, handler) {
                self.send(&reply)?;
            }
        }
        Ok(open)
    }

    /// Produce the reply to one client packet, if any.
    pub fn handle_packet(
        &mut self,
        packet: PacketBuffer,
        handler: &dyn ConfigRequestHandler,
    ) -> Option<PacketBuffer> {
        trace!(
            "config packet {} id={} from {}",
            packet.packet_type,
            packet.id,
            self.peer
        );
        match packet.packet_type {
            PacketBufferType::GetProtocolInfo => Some(PacketBuffer::protocol_info_reply(
                packet.id,
                self.version,
                SUPPORTED_PROTOCOL_VERSIONS,
            )),
            PacketBufferType::UpgradeProtocol => {
                let success = match packet.parse_upgrade_request() {
                    Ok(version) if SUPPORTED_PROTOCOL_VERSIONS.contains(&version) => {
                        debug!("config session {} upgraded to v{}", self.peer, version);
                        self.version = version;
                        true
                    }
                    Ok(version) => {
                        warn!("config session {} asked for unsupported v{}", self.peer, version);
                        false
                    }
                    Err(_) => false,
                };
                Some(PacketBuffer::upgrade_reply(packet.id, success))
            }
            PacketBufferType::Rpc => {
                let reply = handler.handle_rpc(&parse_json(&packet.payload));
                Some(PacketBuffer::rpc(packet.id, reply.to_string().into_bytes()))
            }
            PacketBufferType::NoReplyRpc => {
                handler.handle_rpc(&parse_json(&packet.payload));
                None
            }
            PacketBufferType::ServerNotification
            | PacketBufferType::InvalidRequest
            | PacketBufferType::ConnectionRejected => {
                Some(PacketBuffer::invalid_request(packet.id))
            }
        }
    }

    pub fn send(&mut self, packet: &PacketBuffer) -> Result<()> {
        self.outbound.extend_from_slice(&packet.encode());
        self.flush()
    }

    /// Write queued bytes; the rest waits for writable readiness.
    pub fn flush(&mut self) -> Result<()> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => {
                    self.outbound.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

fn parse_json(payload: &[u8]) -> Value {
    serde_json::from_slice(payload).unwrap_or_else(|e| json!({ "parseError": e.to_string() }))
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Blocking client for the native config protocol.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, trace};

use super::connection::connect_tcp;
use crate::error::{Error, Result};
use crate::protocol::packet_buffer::{PacketBuffer, PacketBufferType};

const READ_CHUNK: usize = 4096;

/// Request/reply client for the config port.
///
/// Request ids increase monotonically from 1. Server notifications that
/// arrive while waiting for a reply are queued for
/// [`next_notification`](Self::next_notification).
pub struct ConfigClient {
    stream: TcpStream,
    inbound: Vec<u8>,
    next_id: u64,
    reply_timeout: Duration,
    notifications: VecDeque<Value>,
}

impl ConfigClient {
    pub fn connect(host: &str, port: u16, reply_timeout: Duration) -> Result<Self> {
        let stream = connect_tcp(host, port, reply_timeout)?;
        debug!("config channel connected to {}:{}", host, port);
        Ok(Self {
            stream,
            inbound: Vec::new(),
            next_id: 1,
            reply_timeout,
            notifications: VecDeque::new(),
        })
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Current and supported protocol versions.
    pub fn get_protocol_info(&mut self) -> Result<(u16, Vec<u16>)> {
        let id = self.allocate_id();
        self.request(PacketBuffer::protocol_info_request(id))?
            .parse_protocol_info()
    }

    /// Ask the server to switch versions; `Ok(false)` if it refused.
    pub fn upgrade_protocol(&mut self, version: u16) -> Result<bool> {
        let id = self.allocate_id();
        self.request(PacketBuffer::upgrade_request(id, version))?
            .parse_upgrade_reply()
    }

    pub fn rpc(&mut self, request: &Value) -> Result<Value> {
        let id = self.allocate_id();
        let reply = self.request(PacketBuffer::rpc(id, request.to_string().into_bytes()))?;
        Ok(serde_json::from_slice(&reply.payload)?)
    }

    pub fn no_reply_rpc(&mut self, request: &Value) -> Result<()> {
        let id = self.allocate_id();
        self.write(&PacketBuffer::no_reply_rpc(
            id,
            request.to_string().into_bytes(),
        ))
    }

    /// Next server notification, waiting up to `timeout`.
    pub fn next_notification(&mut self, timeout: Duration) -> Result<Option<Value>> {
        if let Some(n) = self.notifications.pop_front() {
            return Ok(Some(n));
        }
        let deadline = Instant::now() + timeout;
        while let Some(packet) = self.read_packet(deadline)? {
            match packet.packet_type {
                PacketBufferType::ServerNotification => {
                    return Ok(Some(serde_json::from_slice(&packet.payload)?))
                }
                PacketBufferType::ConnectionRejected => return Err(rejected(&packet)),
                other => trace!("unsolicited {} packet id={}", other, packet.id),
            }
        }
        Ok(None)
    }

    /// Send a request and wait for the packet carrying the same id.
    fn request(&mut self, packet: PacketBuffer) -> Result<PacketBuffer> {
        let id = packet.id;
        let request_type = packet.packet_type;
        self.write(&packet)?;

        let deadline = Instant::now() + self.reply_timeout;
        loop {
            let Some(reply) = self.read_packet(deadline)? else {
                return Err(Error::Timeout(format!("reply to {} id={}", request_type, id)));
            };
            match reply.packet_type {
                PacketBufferType::ConnectionRejected => return Err(rejected(&reply)),
                PacketBufferType::ServerNotification => {
                    match serde_json::from_slice(&reply.payload) {
                        Ok(value) => self.notifications.push_back(value),
                        Err(e) => debug!("undecodable notification: {}", e),
                    }
                }
                PacketBufferType::InvalidRequest if reply.id == id => {
                    return Err(Error::protocol(format!(
                        "server rejected {} id={} as invalid",
                        request_type, id
                    )))
                }
                t if t == request_type && reply.id == id => return Ok(reply),
                other => trace!("skipping {} id={}", other, reply.id),
            }
        }
    }

    fn write(&mut self, packet: &PacketBuffer) -> Result<()> {
        self.stream.write_all(&packet.encode())?;
        Ok(())
    }

    /// Next complete packet, or `None` once `deadline` passes.
    fn read_packet(&mut self, deadline: Instant) -> Result<Option<PacketBuffer>> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some((packet, used)) = PacketBuffer::decode(&self.inbound)? {
                self.inbound.drain(..used);
                return Ok(Some(packet));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            self.stream.set_read_timeout(Some(remaining))?;
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => self.inbound.extend_from_slice(&chunk[..n]),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn close(self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

fn rejected(packet: &PacketBuffer) -> Error {
    Error::Rejected(String::from_utf8_lossy(&packet.payload).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn read_one(sock: &mut TcpStream) -> PacketBuffer {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            if let Some((packet, _)) = PacketBuffer::decode(&buf).unwrap() {
                return packet;
            }
            let n = sock.read(&mut chunk).unwrap();
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    #[test]
    fn test_notification_buffered_while_waiting() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let request = read_one(&mut sock);
            assert_eq!(request.id, 1);
            sock.write_all(&PacketBuffer::server_notification(br#"{"n":1}"#.to_vec()).encode())
                .unwrap();
            sock.write_all(&PacketBuffer::rpc(1, br#"{"result":2}"#.to_vec()).encode())
                .unwrap();
        });

        let mut client = ConfigClient::connect("127.0.0.1", port, Duration::from_secs(2)).unwrap();
        let reply = client.rpc(&serde_json::json!({"method": "x"})).unwrap();
        assert_eq!(reply["result"], 2);
        let n = client.next_notification(Duration::from_millis(10)).unwrap();
        assert_eq!(n.unwrap()["n"], 1);
        server.join().unwrap();
    }

    #[test]
    fn test_rejected_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(&PacketBuffer::connection_rejected("full").encode())
                .unwrap();
            thread::sleep(Duration::from_millis(200));
        });

        let mut client = ConfigClient::connect("127.0.0.1", port, Duration::from_secs(2)).unwrap();
        match client.get_protocol_info() {
            Err(Error::Rejected(reason)) => assert_eq!(reason, "full"),
            other => panic!("unexpected {:?}", other),
        }
        server.join().unwrap();
    }

    #[test]
    fn test_reply_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (_sock, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(400));
        });

        let mut client =
            ConfigClient::connect("127.0.0.1", port, Duration::from_millis(100)).unwrap();
        assert!(matches!(client.upgrade_protocol(1), Err(Error::Timeout(_))));
        server.join().unwrap();
    }
}

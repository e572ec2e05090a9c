// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Native config-protocol packet buffer.
//!
//! ```text
//! +-------------+----------+-------------+------------------+---------+
//! | header_size | type     | id (u64 LE) | payload size u32 | payload |
//! | u8 (= 14)   | u8       |             | LE               |         |
//! +-------------+----------+-------------+------------------+---------+
//! ```
//!
//! Request and reply share a type code; the direction tells them apart.

use std::fmt;

use crate::error::{Error, Result};

/// Size of the fixed packet header.
pub const PACKET_HEADER_SIZE: usize = 14;

/// Largest payload accepted on decode.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Packet kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketBufferType {
    GetProtocolInfo = 0x80,
    UpgradeProtocol = 0x81,
    Rpc = 0x82,
    ServerNotification = 0x83,
    InvalidRequest = 0x84,
    NoReplyRpc = 0x85,
    ConnectionRejected = 0x86,
}

impl PacketBufferType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x80 => Self::GetProtocolInfo,
            0x81 => Self::UpgradeProtocol,
            0x82 => Self::Rpc,
            0x83 => Self::ServerNotification,
            0x84 => Self::InvalidRequest,
            0x85 => Self::NoReplyRpc,
            0x86 => Self::ConnectionRejected,
            _ => return None,
        })
    }

    /// Types a client may send.
    pub fn is_client_request(self) -> bool {
        matches!(
            self,
            Self::GetProtocolInfo | Self::UpgradeProtocol | Self::Rpc | Self::NoReplyRpc
        )
    }
}

impl fmt::Display for PacketBufferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::GetProtocolInfo => "GetProtocolInfo",
            Self::UpgradeProtocol => "UpgradeProtocol",
            Self::Rpc => "Rpc",
            Self::ServerNotification => "ServerNotification",
            Self::InvalidRequest => "InvalidRequest",
            Self::NoReplyRpc => "NoReplyRpc",
            Self::ConnectionRejected => "ConnectionRejected",
        };
        f.write_str(name)
    }
}

/// One config-protocol packet. Equality covers type, id and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketBuffer {
    pub packet_type: PacketBufferType,
    pub id: u64,
    pub payload: Vec<u8>,
}

impl PacketBuffer {
    pub fn new(packet_type: PacketBufferType, id: u64, payload: Vec<u8>) -> Self {
        Self {
            packet_type,
            id,
            payload,
        }
    }

    pub fn protocol_info_request(id: u64) -> Self {
        Self::new(PacketBufferType::GetProtocolInfo, id, Vec::new())
    }

    /// Reply payload: `u16 current | u16 count | u16 versions...`.
    pub fn protocol_info_reply(id: u64, current: u16, supported: &[u16]) -> Self {
        let mut payload = Vec::with_capacity(4 + supported.len() * 2);
        payload.extend_from_slice(&current.to_le_bytes());
        payload.extend_from_slice(&(supported.len() as u16).to_le_bytes());
        for version in supported {
            payload.extend_from_slice(&version.to_le_bytes());
        }
        Self::new(PacketBufferType::GetProtocolInfo, id, payload)
    }

    pub fn upgrade_request(id: u64, version: u16) -> Self {
        Self::new(
            PacketBufferType::UpgradeProtocol,
            id,
            version.to_le_bytes().to_vec(),
        )
    }

    pub fn upgrade_reply(id: u64, success: bool) -> Self {
        Self::new(PacketBufferType::UpgradeProtocol, id, vec![success as u8])
    }

    pub fn rpc(id: u64, json: Vec<u8>) -> Self {
        Self::new(PacketBufferType::Rpc, id, json)
    }

    pub fn no_reply_rpc(id: u64, json: Vec<u8>) -> Self {
        Self::new(PacketBufferType::NoReplyRpc, id, json)
    }

    /// Notifications are not tied to a request (id 0).
    pub fn server_notification(json: Vec<u8>) -> Self {
        Self::new(PacketBufferType::ServerNotification, 0, json)
    }

    pub fn invalid_request(id: u64) -> Self {
        Self::new(PacketBufferType::InvalidRequest, id, Vec::new())
    }

    pub fn connection_rejected(reason: &str) -> Self {
        Self::new(
            PacketBufferType::ConnectionRejected,
            0,
            reason.as_bytes().to_vec(),
        )
    }

    /// Parse a protocol-info reply payload.
    pub fn parse_protocol_info(&self) -> Result<(u16, Vec<u16>)> {
        let p = &self.payload;
        if p.len() < 4 {
            return Err(Error::protocol("protocol info reply too short"));
        }
        let current = u16::from_le_bytes([p[0], p[1]]);
        let count = u16::from_le_bytes([p[2], p[3]]) as usize;
        if p.len() < 4 + count * 2 {
            return Err(Error::protocol("protocol info reply truncated"));
        }
        let versions = p[4..4 + count * 2]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        Ok((current, versions))
    }

    pub fn parse_upgrade_request(&self) -> Result<u16> {
        match self.payload.as_slice() {
            [lo, hi, ..] => Ok(u16::from_le_bytes([*lo, *hi])),
            _ => Err(Error::protocol("upgrade request without version")),
        }
    }

    pub fn parse_upgrade_reply(&self) -> Result<bool> {
        self.payload
            .first()
            .map(|b| *b != 0)
            .ok_or_else(|| Error::protocol("upgrade reply without status"))
    }

    pub fn encoded_len(&self) -> usize {
        PACKET_HEADER_SIZE + self.payload.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(PACKET_HEADER_SIZE as u8);
        buf.push(self.packet_type as u8);
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode one packet from the start of `buf`.
    ///
    /// `Ok(None)` while incomplete; `Ok(Some((packet, consumed)))` otherwise.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        if buf.is_empty() {
            return Ok(None);
        }
        let header_size = buf[0] as usize;
        if header_size != PACKET_HEADER_SIZE {
            return Err(Error::protocol(format!(
                "unexpected packet header size {}",
                header_size
            )));
        }
        if buf.len() < PACKET_HEADER_SIZE {
            return Ok(None);
        }
        let packet_type = PacketBufferType::from_u8(buf[1])
            .ok_or_else(|| Error::protocol(format!("unknown packet type 0x{:02x}", buf[1])))?;
        let mut id = [0u8; 8];
        id.copy_from_slice(&buf[2..10]);
        let payload_size = u32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]) as usize;
        if payload_size > MAX_PAYLOAD_SIZE {
            return Err(Error::protocol(format!(
                "packet payload too large: {}",
                payload_size
            )));
        }
        let total = PACKET_HEADER_SIZE + payload_size;
        if buf.len() < total {
            return Ok(None);
        }
        let packet = Self {
            packet_type,
            id: u64::from_le_bytes(id),
            payload: buf[PACKET_HEADER_SIZE..total].to_vec(),
        };
        Ok(Some((packet, total)))
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Packet codec: streaming messages inside WebSocket frames.
//!
//! ```text
//! +-----------------+----------------------+-----------------------+
//! | WebSocket frame | stream header (4/8B) | data or metadata      |
//! | header (2..14B) |                      | payload               |
//! +-----------------+----------------------+-----------------------+
//! ```

use crate::error::{Error, Result};
use crate::protocol::header::{self, packet_type, LONG_HEADER_SIZE};
use crate::protocol::metadata::MetadataMessage;
use crate::protocol::websocket::{self, Opcode};

/// Size of a [`ConstantValue`] on the wire.
pub const CONSTANT_VALUE_SIZE: usize = 16;

/// `{u64 index, i64 value}` payload used for constant-rule values and
/// synthetic domain values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantValue {
    pub index: u64,
    pub value: i64,
}

impl ConstantValue {
    pub fn new(index: u64, value: i64) -> Self {
        Self { index, value }
    }

    pub fn to_bytes(self) -> [u8; CONSTANT_VALUE_SIZE] {
        let mut out = [0u8; CONSTANT_VALUE_SIZE];
        out[..8].copy_from_slice(&self.index.to_le_bytes());
        out[8..].copy_from_slice(&self.value.to_le_bytes());
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < CONSTANT_VALUE_SIZE {
            return None;
        }
        let mut index = [0u8; 8];
        let mut value = [0u8; 8];
        index.copy_from_slice(&buf[..8]);
        value.copy_from_slice(&buf[8..16]);
        Some(Self {
            index: u64::from_le_bytes(index),
            value: i64::from_le_bytes(value),
        })
    }
}

/// Header plus payload of one streaming message.
pub fn encode_message(signo: u32, kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(LONG_HEADER_SIZE + payload.len());
    header::generate_header(&mut buf, signo, kind, payload.len());
    buf.extend_from_slice(payload);
    buf
}

pub fn encode_data(signo: u32, payload: &[u8]) -> Vec<u8> {
    encode_message(signo, packet_type::DATA, payload)
}

pub fn encode_metadata(signo: u32, message: &MetadataMessage) -> Result<Vec<u8>> {
    Ok(encode_message(
        signo,
        packet_type::METADATA,
        &message.encode()?,
    ))
}

/// One streaming message wrapped in a single binary WebSocket frame.
///
/// Server frames are unmasked; clients pass a masking key.
pub fn encode_frame(
    signo: u32,
    kind: u8,
    payload: &[u8],
    masking_key: Option<[u8; 4]>,
) -> Vec<u8> {
    let mut stream_header = Vec::with_capacity(LONG_HEADER_SIZE);
    header::generate_header(&mut stream_header, signo, kind, payload.len());
    let message_len = stream_header.len() + payload.len();

    let mut frame = Vec::with_capacity(websocket::MAX_HEADER_SIZE + message_len);
    websocket::generate_header(&mut frame, Opcode::Binary, true, message_len, masking_key);
    let body_start = frame.len();
    frame.extend_from_slice(&stream_header);
    frame.extend_from_slice(payload);
    if let Some(key) = masking_key {
        websocket::apply_mask(&mut frame[body_start..], key);
    }
    frame
}

/// Decoded streaming message.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Data { signo: u32, payload: Vec<u8> },
    Metadata { signo: u32, message: MetadataMessage },
}

impl StreamMessage {
    pub fn signo(&self) -> u32 {
        match self {
            StreamMessage::Data { signo, .. } | StreamMessage::Metadata { signo, .. } => *signo,
        }
    }
}

/// Decode one streaming message from the start of `buf`.
///
/// `Ok(None)` while incomplete, otherwise the message and bytes consumed.
pub fn decode_message(buf: &[u8]) -> Result<Option<(StreamMessage, usize)>> {
    let header = header::decode_header(buf);
    if !header.is_complete() {
        return Ok(None);
    }
    let payload = &buf[header.header_size..header.frame_size()];
    let message = match header.packet_type {
        packet_type::DATA => StreamMessage::Data {
            signo: header.signo,
            payload: payload.to_vec(),
        },
        packet_type::METADATA => StreamMessage::Metadata {
            signo: header.signo,
            message: MetadataMessage::decode(payload)?,
        },
        other => {
            return Err(Error::protocol(format!(
                "unknown streaming packet type {} on signo {}",
                other, header.signo
            )))
        }
    };
    Ok(Some((message, header.frame_size())))
}

/// Decode every message in a complete WebSocket payload.
pub fn decode_messages(mut buf: &[u8]) -> Result<Vec<StreamMessage>> {
    let mut messages = Vec::new();
    while !buf.is_empty() {
        match decode_message(buf)? {
            Some((message, used)) => {
                messages.push(message);
                buf = &buf[used..];
            }
            None => {
                return Err(Error::protocol(format!(
                    "truncated streaming message ({} trailing bytes)",
                    buf.len()
                )))
            }
        }
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_value_layout() {
        let bytes = ConstantValue::new(0, -5).to_bytes();
        assert_eq!(&bytes[..8], &[0; 8]);
        assert_eq!(&bytes[8..], &(-5i64).to_le_bytes());
        assert_eq!(ConstantValue::from_bytes(&bytes), Some(ConstantValue::new(0, -5)));
        assert_eq!(ConstantValue::from_bytes(&bytes[..15]), None);
    }

    #[test]
    fn test_frame_contains_one_message() {
        let payload = vec![7u8; 300];
        let frame = encode_frame(3, packet_type::DATA, &payload, None);
        let ws = websocket::decode_header(&frame);
        assert!(ws.is_complete());
        assert_eq!(ws.opcode, Opcode::Binary);
        assert_eq!(ws.frame_size(), frame.len());

        let messages = decode_messages(&frame[ws.header_size..]).unwrap();
        assert_eq!(
            messages,
            vec![StreamMessage::Data {
                signo: 3,
                payload
            }]
        );
    }

    #[test]
    fn test_masked_frame_unmasks_to_same_message() {
        let key = [1, 2, 3, 4];
        let frame = encode_frame(9, packet_type::DATA, b"abc", Some(key));
        let ws = websocket::decode_header(&frame);
        let mut body = frame[ws.header_size..].to_vec();
        websocket::apply_mask(&mut body, key);
        assert_eq!(body, encode_data(9, b"abc"));
    }

    #[test]
    fn test_metadata_message_decodes() {
        let message = MetadataMessage::Subscribe {
            signal_id: "/dev/ai0".into(),
        };
        let bytes = encode_metadata(2, &message).unwrap();
        let (decoded, used) = decode_message(&bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded, StreamMessage::Metadata { signo: 2, message });
        assert_eq!(decoded.signo(), 2);
    }

    #[test]
    fn test_truncated_and_unknown() {
        let bytes = encode_data(1, &[1, 2, 3]);
        assert!(decode_message(&bytes[..5]).unwrap().is_none());
        assert!(decode_messages(&bytes[..5]).is_err());

        let bogus = encode_message(1, 7, &[0]);
        assert!(decode_message(&bogus).is_err());
    }
}

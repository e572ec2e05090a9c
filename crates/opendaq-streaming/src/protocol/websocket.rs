// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! WebSocket transport framing (RFC 6455).
//!
//! ```text
//! +-----+------+-----+--------------------+----------------+---------+
//! | FIN | RSV  | op  | MASK | len (7 bit) | ext len 0/2/8B | key 0/4B| payload
//! +-----+------+-----+--------------------+----------------+---------+
//! ```
//!
//! Lengths below 126 fit the 7-bit field (2-byte header), lengths up to
//! 65535 use a 16-bit extension (4 bytes), anything larger a 64-bit
//! extension (10 bytes). Extended lengths are big-endian. Frames sent by a
//! client carry a 4-byte masking key; server frames do not.

use base64::Engine;
use sha1::{Digest, Sha1};

/// GUID appended to the client key when computing `Sec-WebSocket-Accept`.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest possible frame header (10 bytes + masking key).
pub const MAX_HEADER_SIZE: usize = 14;

const FIN_BIT: u8 = 0x80;
const MASK_BIT: u8 = 0x80;
const OPCODE_MASK: u8 = 0x0F;
const LEN_MASK: u8 = 0x7F;
const LEN_16: u8 = 126;
const LEN_64: u8 = 127;

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Opcode {
    Continuation,
    Text,
    #[default]
    Binary,
    Close,
    Ping,
    Pong,
    /// Reserved opcode, carried through so callers can log it.
    Reserved(u8),
}

impl Opcode {
    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
            Opcode::Reserved(code) => code & OPCODE_MASK,
        }
    }

    /// Control frames (close/ping/pong).
    pub fn is_control(self) -> bool {
        self.as_u8() & 0x8 != 0
    }
}

impl From<u8> for Opcode {
    fn from(value: u8) -> Self {
        match value & OPCODE_MASK {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            other => Opcode::Reserved(other),
        }
    }
}

/// Decoded frame header. `header_size == 0` means the frame is incomplete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: Opcode,
    pub masking_key: Option<[u8; 4]>,
    pub payload_size: usize,
    pub header_size: usize,
}

impl FrameHeader {
    pub fn is_complete(&self) -> bool {
        self.header_size != 0
    }

    pub fn frame_size(&self) -> usize {
        self.header_size + self.payload_size
    }
}

/// Append a frame header to `buf`, returning its size (2, 4 or 10 bytes,
/// plus 4 when masked).
pub fn generate_header(
    buf: &mut Vec<u8>,
    opcode: Opcode,
    fin: bool,
    payload_size: usize,
    masking_key: Option<[u8; 4]>,
) -> usize {
    let start = buf.len();
    let first = (if fin { FIN_BIT } else { 0 }) | opcode.as_u8();
    let mask = if masking_key.is_some() { MASK_BIT } else { 0 };

    buf.push(first);
    if payload_size < LEN_16 as usize {
        buf.push(mask | payload_size as u8);
    } else if payload_size <= u16::MAX as usize {
        buf.push(mask | LEN_16);
        buf.extend_from_slice(&(payload_size as u16).to_be_bytes());
    } else {
        buf.push(mask | LEN_64);
        buf.extend_from_slice(&(payload_size as u64).to_be_bytes());
    }
    if let Some(key) = masking_key {
        buf.extend_from_slice(&key);
    }
    buf.len() - start
}

/// Decode the frame header at the start of `buf`.
///
/// Returns the incomplete sentinel unless `buf` holds the header and the
/// full payload it announces.
pub fn decode_header(buf: &[u8]) -> FrameHeader {
    if buf.len() < 2 {
        return FrameHeader::default();
    }

    let fin = buf[0] & FIN_BIT != 0;
    let opcode = Opcode::from(buf[0]);
    let masked = buf[1] & MASK_BIT != 0;
    let short_len = buf[1] & LEN_MASK;

    let (mut offset, payload_size) = match short_len {
        LEN_16 => {
            if buf.len() < 4 {
                return FrameHeader::default();
            }
            (4, u16::from_be_bytes([buf[2], buf[3]]) as u64)
        }
        LEN_64 => {
            if buf.len() < 10 {
                return FrameHeader::default();
            }
            let mut len = [0u8; 8];
            len.copy_from_slice(&buf[2..10]);
            (10, u64::from_be_bytes(len))
        }
        len => (2, len as u64),
    };

    let masking_key = if masked {
        if buf.len() < offset + 4 {
            return FrameHeader::default();
        }
        let key = [
            buf[offset],
            buf[offset + 1],
            buf[offset + 2],
            buf[offset + 3],
        ];
        offset += 4;
        Some(key)
    } else {
        None
    };

    let Ok(payload_size) = usize::try_from(payload_size) else {
        return FrameHeader::default();
    };
    match offset.checked_add(payload_size) {
        Some(total) if buf.len() >= total => FrameHeader {
            fin,
            opcode,
            masking_key,
            payload_size,
            header_size: offset,
        },
        _ => FrameHeader::default(),
    }
}

/// Peek at the total frame size announced by a (possibly partial) header.
///
/// Returns `None` until enough header bytes are present to know it.
pub fn announced_frame_size(buf: &[u8]) -> Option<u64> {
    if buf.len() < 2 {
        return None;
    }
    let masked = buf[1] & MASK_BIT != 0;
    let key_len = if masked { 4 } else { 0 };
    match buf[1] & LEN_MASK {
        LEN_16 if buf.len() >= 4 => {
            Some(4 + key_len + u16::from_be_bytes([buf[2], buf[3]]) as u64)
        }
        LEN_64 if buf.len() >= 10 => {
            let mut len = [0u8; 8];
            len.copy_from_slice(&buf[2..10]);
            Some((10 + key_len).saturating_add(u64::from_be_bytes(len)))
        }
        LEN_16 | LEN_64 => None,
        len => Some(2 + key_len + len as u64),
    }
}

/// XOR `data` with the masking key (masking and unmasking are the same).
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

/// Build a complete frame: header, optional key and (masked) payload.
pub fn encode_frame(opcode: Opcode, payload: &[u8], masking_key: Option<[u8; 4]>) -> Vec<u8> {
    let mut frame = Vec::with_capacity(MAX_HEADER_SIZE + payload.len());
    generate_header(&mut frame, opcode, true, payload.len(), masking_key);
    let start = frame.len();
    frame.extend_from_slice(payload);
    if let Some(key) = masking_key {
        apply_mask(&mut frame[start..], key);
    }
    frame
}

/// Compute `Sec-WebSocket-Accept` for a client key.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Fresh random masking key.
pub fn random_masking_key() -> [u8; 4] {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    [bytes[0], bytes[5], bytes[10], bytes[15]]
}

/// Fresh random `Sec-WebSocket-Key` (16 random bytes, base64).
pub fn random_client_key() -> String {
    base64::engine::general_purpose::STANDARD.encode(uuid::Uuid::new_v4().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_key_rfc_example() {
        // RFC 6455 section 1.3
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_header_sizes() {
        for (len, expected) in [(0, 2), (125, 2), (126, 4), (65535, 4), (65536, 10)] {
            let mut buf = Vec::new();
            assert_eq!(
                generate_header(&mut buf, Opcode::Binary, true, len, None),
                expected,
                "len {}",
                len
            );
        }
        let mut buf = Vec::new();
        assert_eq!(
            generate_header(&mut buf, Opcode::Binary, true, 10, Some([1, 2, 3, 4])),
            6
        );
    }

    #[test]
    fn test_decode_all_length_forms() {
        for len in [0usize, 1, 125, 126, 300, 65535, 65536, 70000] {
            let payload = vec![0x5A; len];
            let frame = encode_frame(Opcode::Binary, &payload, None);
            let header = decode_header(&frame);
            assert!(header.is_complete(), "len {}", len);
            assert!(header.fin);
            assert_eq!(header.opcode, Opcode::Binary);
            assert_eq!(header.payload_size, len);
            assert_eq!(header.frame_size(), frame.len());
            assert_eq!(announced_frame_size(&frame), Some(frame.len() as u64));
        }
    }

    #[test]
    fn test_masked_roundtrip() {
        let key = [0x37, 0xfa, 0x21, 0x3d];
        let frame = encode_frame(Opcode::Text, b"Hello", Some(key));
        // RFC 6455 section 5.7 masked "Hello"
        assert_eq!(
            frame,
            vec![0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]
        );

        let header = decode_header(&frame);
        assert_eq!(header.masking_key, Some(key));
        let mut payload = frame[header.header_size..].to_vec();
        apply_mask(&mut payload, key);
        assert_eq!(payload, b"Hello");
    }

    #[test]
    fn test_truncated_frames() {
        for len in [10usize, 200, 70000] {
            let frame = encode_frame(Opcode::Binary, &vec![1; len], Some([9, 8, 7, 6]));
            for cut in [0, 1, 2, 3, 5, 9, 13, frame.len() - 1] {
                assert_eq!(decode_header(&frame[..cut]).header_size, 0, "cut {}", cut);
            }
        }
    }

    #[test]
    fn test_announced_size_from_partial_header() {
        let frame = encode_frame(Opcode::Binary, &vec![0; 1000], None);
        assert_eq!(announced_frame_size(&frame[..1]), None);
        assert_eq!(announced_frame_size(&frame[..3]), None);
        assert_eq!(announced_frame_size(&frame[..4]), Some(1004));
    }

    #[test]
    fn test_opcode_mapping() {
        assert_eq!(Opcode::from(0x88), Opcode::Close);
        assert_eq!(Opcode::from(0x09), Opcode::Ping);
        assert_eq!(Opcode::from(0x03), Opcode::Reserved(3));
        assert!(Opcode::Pong.is_control());
        assert!(!Opcode::Binary.is_control());
    }

    #[test]
    fn test_random_client_key_is_base64_of_16_bytes() {
        let key = random_client_key();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(key)
            .unwrap();
        assert_eq!(decoded.len(), 16);
    }
}

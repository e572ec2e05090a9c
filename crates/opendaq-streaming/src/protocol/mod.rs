// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire formats.
//!
//! - [`header`]: streaming message header (signo, type, payload size)
//! - [`websocket`]: RFC 6455 transport framing and handshake key
//! - [`http`]: upgrade handshake and control-channel requests
//! - [`metadata`]: MessagePack metadata messages
//! - [`control`]: `{streamId}.subscribe` / `unsubscribe` bodies
//! - [`packet_buffer`]: native config-protocol packets

pub mod control;
pub mod header;
pub mod http;
pub mod metadata;
pub mod packet_buffer;
pub mod websocket;

pub use control::{ControlMethod, ControlRequest};
pub use header::{decode_header, generate_header, metadata_encoding, packet_type, StreamHeader};
pub use metadata::{MetadataMessage, SignalMetadata};
pub use packet_buffer::{PacketBuffer, PacketBufferType};
pub use websocket::{FrameHeader, Opcode};

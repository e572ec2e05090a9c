// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Signal writers: per-rule encoding of data packets.
//!
//! One writer exists per (signal, client) pair, so writers may keep state
//! such as the last constant value sent.

use crate::codec::ConstantValue;
use crate::config::LinearWriterMode;
use crate::error::{Error, Result};
use crate::signal::{DataDescriptor, DataPacket, DataRule};

/// Destination of DATA payloads for one signal on one connection.
pub trait DataSink {
    /// Send one DATA message. `false` means the connection failed.
    fn send_data(&mut self, payload: &[u8]) -> bool;
}

impl DataSink for Vec<Vec<u8>> {
    fn send_data(&mut self, payload: &[u8]) -> bool {
        self.push(payload.to_vec());
        true
    }
}

/// Encodes data packets of one signal for one client.
pub trait SignalWriter: Send {
    /// Emit zero or more DATA messages for `packet`.
    ///
    /// Returns `false` when the sink failed; the client is then dropped.
    fn write(&mut self, packet: &DataPacket, sink: &mut dyn DataSink) -> bool;

    /// Forget per-stream state after new `signal` metadata was sent.
    fn reset(&mut self) {}
}

/// Forwards the raw sample bytes unchanged.
#[derive(Debug, Default)]
pub struct ExplicitWriter;

impl SignalWriter for ExplicitWriter {
    fn write(&mut self, packet: &DataPacket, sink: &mut dyn DataSink) -> bool {
        sink.send_data(packet.raw_data())
    }
}

/// Sends a `{index=0, value}` pair only when the value changes.
#[derive(Debug, Default)]
pub struct ConstantWriter {
    last: Option<i64>,
}

impl SignalWriter for ConstantWriter {
    fn write(&mut self, packet: &DataPacket, sink: &mut dyn DataSink) -> bool {
        let raw = packet.raw_data();
        if raw.len() < 8 {
            return true;
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&raw[..8]);
        let value = i64::from_le_bytes(bytes);
        if self.last == Some(value) {
            return true;
        }
        let sent = sink.send_data(&ConstantValue::new(0, value).to_bytes());
        if sent {
            self.last = Some(value);
        }
        sent
    }

    fn reset(&mut self) {
        self.last = None;
    }
}

/// Linear-rule writer.
///
/// In [`LinearWriterMode::Noop`] nothing is emitted. In
/// [`LinearWriterMode::Echo`] a `{index, start}` pair is sent whenever a
/// packet does not continue the observed progression.
#[derive(Debug)]
pub struct LinearWriter {
    mode: LinearWriterMode,
    samples: u64,
    expected: Option<i64>,
}

impl LinearWriter {
    pub fn new(mode: LinearWriterMode) -> Self {
        Self {
            mode,
            samples: 0,
            expected: None,
        }
    }
}

impl SignalWriter for LinearWriter {
    fn write(&mut self, packet: &DataPacket, sink: &mut dyn DataSink) -> bool {
        if self.mode == LinearWriterMode::Noop {
            return true;
        }
        let (Some(start), Some(delta)) = (packet.start_value(), packet.descriptor.linear_delta())
        else {
            return true;
        };

        if self.expected != Some(start)
            && !sink.send_data(&ConstantValue::new(self.samples, start).to_bytes())
        {
            return false;
        }
        let count = packet.sample_count as u64;
        self.expected = Some(start.wrapping_add(delta.wrapping_mul(count as i64)));
        self.samples += count;
        true
    }

    fn reset(&mut self) {
        self.samples = 0;
        self.expected = None;
    }
}

/// Builds the writer matching a descriptor's rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriterFactory {
    linear_mode: LinearWriterMode,
}

impl WriterFactory {
    pub fn new(linear_mode: LinearWriterMode) -> Self {
        Self { linear_mode }
    }

    pub fn create(
        &self,
        signal_id: &str,
        descriptor: Option<&DataDescriptor>,
    ) -> Result<Box<dyn SignalWriter>> {
        let descriptor = descriptor.ok_or_else(|| Error::MissingDescriptor(signal_id.into()))?;
        match &descriptor.rule {
            DataRule::Explicit => Ok(Box::new(ExplicitWriter)),
            DataRule::Constant => Ok(Box::new(ConstantWriter::default())),
            DataRule::Linear { .. } => Ok(Box::new(LinearWriter::new(self.linear_mode))),
            DataRule::Other(rule) => Err(Error::UnsupportedRule {
                signal_id: signal_id.into(),
                rule: rule.clone(),
            }),
        }
    }
}

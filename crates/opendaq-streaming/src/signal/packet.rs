// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Packets delivered through input ports.

use std::sync::Arc;

use super::descriptor::{DataDescriptor, DataRule};

/// Scalar types that can be packed into a packet's raw buffer.
pub trait Sample: Copy {
    fn append_le(self, out: &mut Vec<u8>);
}

macro_rules! impl_sample {
    ($($ty:ty),*) => {
        $(impl Sample for $ty {
            fn append_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
        })*
    };
}

impl_sample!(f32, f64, i8, i16, i32, i64, u8, u16, u32, u64);

/// Block of samples.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPacket {
    pub descriptor: Arc<DataDescriptor>,
    pub sample_count: usize,
    /// Packet offset added to a linear rule's start.
    pub offset: i64,
    pub domain: Option<Arc<DataPacket>>,
    raw: Vec<u8>,
}

impl DataPacket {
    pub fn new(descriptor: Arc<DataDescriptor>, sample_count: usize, raw: Vec<u8>) -> Self {
        Self {
            descriptor,
            sample_count,
            offset: 0,
            domain: None,
            raw,
        }
    }

    /// Implicit packet of a linear-rule signal: no raw data, only an offset.
    pub fn linear(descriptor: Arc<DataDescriptor>, sample_count: usize, offset: i64) -> Self {
        Self {
            offset,
            ..Self::new(descriptor, sample_count, Vec::new())
        }
    }

    pub fn from_samples<T: Sample>(descriptor: Arc<DataDescriptor>, samples: &[T]) -> Self {
        let mut raw = Vec::with_capacity(std::mem::size_of_val(samples));
        for sample in samples {
            sample.append_le(&mut raw);
        }
        Self::new(descriptor, samples.len(), raw)
    }

    pub fn with_domain(mut self, domain: Arc<DataPacket>) -> Self {
        self.domain = Some(domain);
        self
    }

    pub fn raw_data(&self) -> &[u8] {
        &self.raw
    }

    pub fn data_size(&self) -> usize {
        self.raw.len()
    }

    /// First value of a linear-rule packet (`offset + start`).
    pub fn start_value(&self) -> Option<i64> {
        match self.descriptor.rule {
            DataRule::Linear { start, .. } => Some(self.offset.wrapping_add(start)),
            _ => None,
        }
    }
}

/// Descriptor change notification. `None` fields did not change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventPacket {
    pub data_descriptor: Option<Arc<DataDescriptor>>,
    pub domain_descriptor: Option<Arc<DataDescriptor>>,
}

/// Tagged packet variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Data(Arc<DataPacket>),
    Event(Arc<EventPacket>),
}

impl Packet {
    pub fn descriptor_changed(
        data_descriptor: Option<Arc<DataDescriptor>>,
        domain_descriptor: Option<Arc<DataDescriptor>>,
    ) -> Self {
        Packet::Event(Arc::new(EventPacket {
            data_descriptor,
            domain_descriptor,
        }))
    }
}

impl From<DataPacket> for Packet {
    fn from(packet: DataPacket) -> Self {
        Packet::Data(Arc::new(packet))
    }
}

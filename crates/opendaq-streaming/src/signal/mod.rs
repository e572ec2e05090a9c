// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Signal model consumed by the streaming server.
//!
//! A [`Device`] exposes a tree of [`Signal`]s. Each signal carries a
//! [`DataDescriptor`] and optionally a domain (time) signal. Consumers
//! attach an [`InputPort`] and receive [`Packet`]s: data blocks and
//! descriptor-change events, in the order they were produced.

mod descriptor;
mod device;
mod packet;
mod port;

pub use descriptor::{DataDescriptor, DataRule, Dimension, Range, Ratio, SampleType, Unit};
pub use device::{Device, LocalDevice, Signal};
pub use packet::{DataPacket, EventPacket, Packet, Sample};
pub use port::{InputPort, PacketReadyNotification, PortListener};

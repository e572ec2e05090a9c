// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Signals and the device tree that exposes them.

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use super::descriptor::DataDescriptor;
use super::packet::{DataPacket, Packet};
use super::port::InputPort;

/// A producer of packets, identified by a global id.
pub struct Signal {
    global_id: String,
    name: String,
    description: String,
    public: bool,
    descriptor: RwLock<Option<Arc<DataDescriptor>>>,
    domain: Option<Arc<Signal>>,
    connections: Mutex<Vec<Weak<InputPort>>>,
}

impl Signal {
    pub fn new(global_id: impl Into<String>, descriptor: Option<DataDescriptor>) -> Self {
        let global_id = global_id.into();
        let name = global_id
            .rsplit('/')
            .next()
            .unwrap_or(global_id.as_str())
            .to_string();
        Self {
            global_id,
            name,
            description: String::new(),
            public: true,
            descriptor: RwLock::new(descriptor.map(Arc::new)),
            domain: None,
            connections: Mutex::new(Vec::new()),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_domain(mut self, domain: Arc<Signal>) -> Self {
        self.domain = Some(domain);
        self
    }

    /// Hide the signal from the server's signal list.
    pub fn private(mut self) -> Self {
        self.public = false;
        self
    }

    pub fn global_id(&self) -> &str {
        &self.global_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_public(&self) -> bool {
        self.public
    }

    pub fn descriptor(&self) -> Option<Arc<DataDescriptor>> {
        self.descriptor.read().clone()
    }

    pub fn domain_signal(&self) -> Option<&Arc<Signal>> {
        self.domain.as_ref()
    }

    /// Connect a port. It first receives the current descriptors.
    pub fn connect(&self, port: &Arc<InputPort>) {
        self.connections.lock().push(Arc::downgrade(port));
        port.enqueue(self.descriptor_event());
    }

    pub fn disconnect(&self, port: &Arc<InputPort>) {
        self.connections
            .lock()
            .retain(|p| p.strong_count() > 0 && !std::ptr::eq(p.as_ptr(), Arc::as_ptr(port)));
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .iter()
            .filter(|p| p.strong_count() > 0)
            .count()
    }

    /// Replace the descriptor and notify connected ports.
    pub fn set_descriptor(&self, descriptor: DataDescriptor) {
        *self.descriptor.write() = Some(Arc::new(descriptor));
        self.send(self.descriptor_event());
    }

    pub fn send_packet(&self, packet: DataPacket) {
        self.send(packet.into());
    }

    /// Deliver a packet to every live connection.
    pub fn send(&self, packet: Packet) {
        let ports: Vec<Arc<InputPort>> = {
            let mut connections = self.connections.lock();
            connections.retain(|p| p.strong_count() > 0);
            connections.iter().filter_map(Weak::upgrade).collect()
        };
        for port in ports {
            port.enqueue(packet.clone());
        }
    }

    fn descriptor_event(&self) -> Packet {
        Packet::descriptor_changed(
            self.descriptor(),
            self.domain.as_ref().and_then(|d| d.descriptor()),
        )
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("global_id", &self.global_id)
            .field("public", &self.public)
            .field("domain", &self.domain.as_ref().map(|d| d.global_id()))
            .finish()
    }
}

/// Anything exposing a signal tree.
pub trait Device: Send + Sync {
    /// Signals of this device and all its sub-devices.
    fn signals_recursive(&self) -> Vec<Arc<Signal>>;
}

/// In-memory device.
#[derive(Default)]
pub struct LocalDevice {
    name: String,
    signals: RwLock<Vec<Arc<Signal>>>,
    children: RwLock<Vec<Arc<LocalDevice>>>,
}

impl LocalDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_signal(&self, signal: Arc<Signal>) {
        self.signals.write().push(signal);
    }

    pub fn add_device(&self, device: Arc<LocalDevice>) {
        self.children.write().push(device);
    }
}

impl Device for LocalDevice {
    fn signals_recursive(&self) -> Vec<Arc<Signal>> {
        let mut signals = self.signals.read().clone();
        for child in self.children.read().iter() {
            signals.extend(child.signals_recursive());
        }
        signals
    }
}

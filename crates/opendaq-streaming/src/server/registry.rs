// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Signal-id to listener map and subscription dispatch.
//!
//! Built once when the server is created and read-only afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::listener::Listener;
use super::session::EstablishedClient;
use crate::error::{Error, Result};
use crate::protocol::control::{ControlMethod, ControlRequest};
use crate::signal::{Device, Signal};
use crate::stats::ServerStats;
use crate::writer::WriterFactory;

/// Listeners of every streamable signal.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    listeners: HashMap<String, Arc<Listener>>,
    /// Signal ids in discovery order.
    order: Vec<String>,
}

impl ListenerRegistry {
    /// Create listeners for the device's public signals and their domains.
    ///
    /// Signals whose listener cannot be built are logged and skipped.
    pub fn from_device(device: &dyn Device, factory: WriterFactory, stats: &Arc<ServerStats>) -> Self {
        let mut registry = Self::default();
        for signal in device.signals_recursive() {
            if !signal.is_public() {
                continue;
            }
            registry.try_add(&signal, factory, stats);
            let mut domain = signal.domain_signal().cloned();
            while let Some(d) = domain {
                registry.try_add(&d, factory, stats);
                domain = d.domain_signal().cloned();
            }
        }
        registry.link_domains();
        registry
    }

    fn try_add(&mut self, signal: &Arc<Signal>, factory: WriterFactory, stats: &Arc<ServerStats>) {
        let id = signal.global_id();
        if self.listeners.contains_key(id) {
            return;
        }
        match Listener::new(signal.clone(), factory, stats.clone()) {
            Ok(listener) => {
                debug!("listener created for {}", id);
                self.order.push(id.to_string());
                self.listeners.insert(id.to_string(), listener);
            }
            Err(e) => warn!("signal {} is not streamed: {}", id, e),
        }
    }

    fn link_domains(&self) {
        for listener in self.listeners.values() {
            let Some(domain) = listener.signal().domain_signal() else {
                continue;
            };
            if let Some(domain_listener) = self.listeners.get(domain.global_id()) {
                listener.link_domain(domain_listener.clone());
            }
        }
    }

    pub fn get(&self, signal_id: &str) -> Option<&Arc<Listener>> {
        self.listeners.get(signal_id)
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Ids announced in `available`.
    pub fn signal_ids(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn listeners(&self) -> impl Iterator<Item = &Arc<Listener>> {
        self.order.iter().filter_map(|id| self.listeners.get(id))
    }

    pub fn start_all(&self) {
        for listener in self.listeners() {
            listener.start();
        }
    }

    pub fn stop_all(&self) {
        for listener in self.listeners() {
            listener.stop();
        }
    }

    /// Drop a closed connection from every listener.
    pub fn forget_client(&self, connection_id: u64) {
        for listener in self.listeners.values() {
            listener.forget_client(connection_id);
        }
    }

    /// Subscribe explicitly, after implicitly subscribing the domain chain.
    pub fn subscribe(&self, client: &Arc<EstablishedClient>, signal_id: &str) -> Result<()> {
        self.subscribe_with(client, signal_id, false)
    }

    fn subscribe_with(
        &self,
        client: &Arc<EstablishedClient>,
        signal_id: &str,
        implicit: bool,
    ) -> Result<()> {
        let listener = self
            .get(signal_id)
            .ok_or_else(|| Error::protocol(format!("unknown signal {}", signal_id)))?;
        if let Some(domain) = listener.domain_listener() {
            self.subscribe_with(client, domain.signal_id(), true)?;
        }
        if listener.add_client(client, implicit) {
            Ok(())
        } else {
            Err(Error::protocol(format!("subscription to {} failed", signal_id)))
        }
    }

    /// Unsubscribe, releasing implicit domain subscriptions nobody else
    /// on this connection still needs.
    pub fn unsubscribe(&self, client: &EstablishedClient, signal_id: &str) -> Result<()> {
        let listener = self
            .get(signal_id)
            .ok_or_else(|| Error::protocol(format!("unknown signal {}", signal_id)))?;
        listener.remove_client(client.id(), false);
        self.release_domain(client.id(), listener);
        Ok(())
    }

    fn release_domain(&self, connection_id: u64, listener: &Arc<Listener>) {
        let Some(domain) = listener.domain_listener() else {
            return;
        };
        let still_used = self.listeners.values().any(|other| {
            other
                .domain_listener()
                .is_some_and(|d| Arc::ptr_eq(d, domain))
                && other.is_subscribed(connection_id)
        });
        if !still_used && domain.remove_client(connection_id, true) {
            self.release_domain(connection_id, domain);
        }
    }

    /// Apply a control request for `client`. Every signal id is attempted;
    /// the result is an error if any of them failed.
    pub fn dispatch(&self, client: &Arc<EstablishedClient>, request: &ControlRequest) -> Result<()> {
        let mut failed = Vec::new();
        for signal_id in &request.signal_ids {
            let result = match request.method {
                ControlMethod::Subscribe => self.subscribe(client, signal_id),
                ControlMethod::Unsubscribe => self.unsubscribe(client, signal_id),
            };
            if let Err(e) = result {
                warn!(
                    "{} {} for {} failed: {}",
                    request.method.as_str(),
                    signal_id,
                    client.stream_id(),
                    e
                );
                failed.push(signal_id.as_str());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::protocol(format!(
                "{} failed for: {}",
                request.method.as_str(),
                failed.join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinearWriterMode;
    use crate::signal::{DataDescriptor, DataRule, LocalDevice, SampleType};

    fn device() -> LocalDevice {
        let device = LocalDevice::new("dev");
        let time = Arc::new(
            Signal::new("/dev/time", Some(DataDescriptor::linear_time(1, 1000, ""))).private(),
        );
        device.add_signal(Arc::new(
            Signal::new("/dev/ai0", Some(DataDescriptor::new(SampleType::Float32)))
                .with_domain(time.clone()),
        ));
        device.add_signal(Arc::new(
            Signal::new("/dev/ai1", Some(DataDescriptor::new(SampleType::Float64)))
                .with_domain(time),
        ));
        device.add_signal(Arc::new(Signal::new(
            "/dev/log",
            Some(DataDescriptor::new(SampleType::Int32).with_rule(DataRule::Other("log".into()))),
        )));
        device.add_signal(Arc::new(Signal::new("/dev/hidden", None).private()));
        device
    }

    #[test]
    fn test_registry_includes_domains_and_skips_unsupported() {
        let stats = Arc::new(ServerStats::new());
        let registry =
            ListenerRegistry::from_device(&device(), WriterFactory::new(LinearWriterMode::Noop), &stats);
        assert_eq!(registry.signal_ids(), vec!["/dev/ai0", "/dev/time", "/dev/ai1"]);
        assert!(registry.get("/dev/log").is_none());
        assert!(registry.get("/dev/hidden").is_none());
    }

    #[test]
    fn test_domains_linked() {
        let stats = Arc::new(ServerStats::new());
        let registry = ListenerRegistry::from_device(&device(), WriterFactory::default(), &stats);
        let ai0 = registry.get("/dev/ai0").unwrap();
        assert_eq!(ai0.domain_listener().unwrap().signal_id(), "/dev/time");
        assert!(registry.get("/dev/time").unwrap().domain_listener().is_none());
    }
}

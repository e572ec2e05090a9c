// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-signal subscription point.
//!
//! A [`Listener`] owns an input port connected to one signal and fans its
//! packets out to every subscribed connection. Packets are handled on the
//! thread that enqueued them; the client list is guarded by a mutex that
//! the I/O thread also takes when (un)subscribing. Concurrent senders
//! drain the port one at a time.

use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::session::EstablishedClient;
use crate::codec::ConstantValue;
use crate::error::{Error, Result};
use crate::protocol::metadata::{signal_params, MetadataMessage, SignalInfo};
use crate::signal::{
    DataDescriptor, DataPacket, DataRule, EventPacket, InputPort, Packet, PacketReadyNotification,
    PortListener, Signal,
};
use crate::stats::ServerStats;
use crate::writer::{DataSink, SignalWriter, WriterFactory};

/// Listener lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Created,
    Started,
    Stopped,
}

/// One connection subscribed to one signal.
pub struct SubscribedClient {
    connection: Weak<EstablishedClient>,
    connection_id: u64,
    writer: Box<dyn SignalWriter>,
    implicit: bool,
    samples_since_signal_update: u64,
    /// Domain value the client extrapolates for the next packet.
    expected_domain_value: Option<i64>,
}

impl SubscribedClient {
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn is_implicit(&self) -> bool {
        self.implicit
    }

    pub fn samples_since_signal_update(&self) -> u64 {
        self.samples_since_signal_update
    }
}

struct Inner {
    state: ListenerState,
    clients: Vec<SubscribedClient>,
    descriptor: Option<Arc<DataDescriptor>>,
}

/// Subscription point for one signal.
pub struct Listener {
    signal: Arc<Signal>,
    port: Arc<InputPort>,
    factory: WriterFactory,
    domain_listener: OnceLock<Arc<Listener>>,
    inner: Mutex<Inner>,
    /// Held while the port is drained so packets are handled in queue order.
    drain: Mutex<()>,
    stats: Arc<ServerStats>,
}

/// Writes a client's DATA messages on one signo.
struct ConnectionSink<'a> {
    connection: &'a EstablishedClient,
    signo: u32,
}

impl DataSink for ConnectionSink<'_> {
    fn send_data(&mut self, payload: &[u8]) -> bool {
        match self.connection.send_data(self.signo, payload) {
            Ok(()) => true,
            Err(e) => {
                debug!(
                    "data write to {} failed: {}",
                    self.connection.peer(),
                    e
                );
                false
            }
        }
    }
}

impl Listener {
    /// Create a listener; fails if no writer exists for the signal's rule.
    pub fn new(
        signal: Arc<Signal>,
        factory: WriterFactory,
        stats: Arc<ServerStats>,
    ) -> Result<Arc<Self>> {
        let descriptor = signal.descriptor();
        factory.create(signal.global_id(), descriptor.as_deref())?;

        Ok(Arc::new(Self {
            signal,
            port: Arc::new(InputPort::new(PacketReadyNotification::SameThread)),
            factory,
            domain_listener: OnceLock::new(),
            inner: Mutex::new(Inner {
                state: ListenerState::Created,
                clients: Vec::new(),
                descriptor,
            }),
            drain: Mutex::new(()),
            stats,
        }))
    }

    pub fn signal(&self) -> &Arc<Signal> {
        &self.signal
    }

    pub fn signal_id(&self) -> &str {
        self.signal.global_id()
    }

    pub fn state(&self) -> ListenerState {
        self.inner.lock().state
    }

    /// Link the listener of this signal's domain. Must happen before start.
    pub fn link_domain(&self, domain: Arc<Listener>) {
        if self.domain_listener.set(domain).is_err() {
            warn!("domain listener of {} already linked", self.signal_id());
        }
    }

    pub fn domain_listener(&self) -> Option<&Arc<Listener>> {
        self.domain_listener.get()
    }

    /// Bind the port and connect it to the signal.
    pub fn start(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            if inner.state == ListenerState::Started {
                return;
            }
            inner.state = ListenerState::Started;
        }
        let weak: Weak<dyn PortListener> = Arc::downgrade(self) as Weak<dyn PortListener>;
        self.port.set_listener(weak);
        self.signal.connect(&self.port);
    }

    /// Disconnect from the signal and drop every client.
    pub fn stop(&self) {
        self.signal.disconnect(&self.port);
        self.port.clear_listener();
        {
            let _drain = self.drain.lock();
            while self.port.dequeue().is_some() {}
        }
        let mut inner = self.inner.lock();
        inner.clients.clear();
        inner.state = ListenerState::Stopped;
    }

    pub fn client_count(&self) -> usize {
        self.inner.lock().clients.len()
    }

    /// Ids of the subscribed connections, in subscription order.
    pub fn connection_ids(&self) -> Vec<u64> {
        self.inner
            .lock()
            .clients
            .iter()
            .map(|c| c.connection_id)
            .collect()
    }

    pub fn is_subscribed(&self, connection_id: u64) -> bool {
        self.inner
            .lock()
            .clients
            .iter()
            .any(|c| c.connection_id == connection_id)
    }

    /// `Some(implicit)` if the connection is subscribed.
    pub fn subscription_kind(&self, connection_id: u64) -> Option<bool> {
        self.inner
            .lock()
            .clients
            .iter()
            .find(|c| c.connection_id == connection_id)
            .map(|c| c.implicit)
    }

    pub fn samples_since_signal_update(&self, connection_id: u64) -> Option<u64> {
        self.inner
            .lock()
            .clients
            .iter()
            .find(|c| c.connection_id == connection_id)
            .map(|c| c.samples_since_signal_update)
    }

    /// Subscribe a connection.
    ///
    /// Idempotent per connection: a repeated call only clears the implicit
    /// flag. A new subscriber gets the `subscribe` ack and `signal`
    /// metadata before any data.
    pub fn add_client(&self, connection: &Arc<EstablishedClient>, implicit: bool) -> bool {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner
            .clients
            .iter_mut()
            .find(|c| c.connection_id == connection.id())
        {
            if !implicit {
                existing.implicit = false;
            }
            return true;
        }

        let result = (|| -> Result<Box<dyn SignalWriter>> {
            let signo = connection.signo_for(self.signal_id())?;
            connection.send_metadata(
                signo,
                &MetadataMessage::Subscribe {
                    signal_id: self.signal_id().to_string(),
                },
            )?;
            connection.send_metadata(signo, &self.signal_message(inner.descriptor.as_deref())?)?;
            self.factory
                .create(self.signal_id(), inner.descriptor.as_deref())
        })();

        match result {
            Ok(writer) => {
                info!(
                    "client {} subscribed to {}{}",
                    connection.stream_id(),
                    self.signal_id(),
                    if implicit { " (implicit)" } else { "" }
                );
                inner.clients.push(SubscribedClient {
                    connection: Arc::downgrade(connection),
                    connection_id: connection.id(),
                    writer,
                    implicit,
                    samples_since_signal_update: 0,
                    expected_domain_value: None,
                });
                true
            }
            Err(e) => {
                warn!(
                    "subscribing {} to {} failed: {}",
                    connection.stream_id(),
                    self.signal_id(),
                    e
                );
                false
            }
        }
    }

    /// Remove a connection's subscription, sending `unsubscribe` best-effort.
    ///
    /// With `only_if_implicit`, explicit subscriptions are kept.
    pub fn remove_client(&self, connection_id: u64, only_if_implicit: bool) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.clients.len();
        let signal_id = self.signal_id();
        inner.clients.retain(|client| {
            if client.connection_id != connection_id || (only_if_implicit && !client.implicit) {
                return true;
            }
            if let Some(connection) = client.connection.upgrade() {
                if let Some(signo) = connection.existing_signo(signal_id) {
                    let message = MetadataMessage::Unsubscribe {
                        signal_id: signal_id.to_string(),
                    };
                    if let Err(e) = connection.send_metadata(signo, &message) {
                        debug!("unsubscribe notice to {} failed: {}", connection.peer(), e);
                    }
                }
                info!("client {} unsubscribed from {}", connection.stream_id(), signal_id);
            }
            false
        });
        inner.clients.len() != before
    }

    /// Drop a closed connection without notifying it.
    pub fn forget_client(&self, connection_id: u64) {
        self.inner
            .lock()
            .clients
            .retain(|c| c.connection_id != connection_id);
    }

    fn signal_message(&self, descriptor: Option<&DataDescriptor>) -> Result<MetadataMessage> {
        let descriptor =
            descriptor.ok_or_else(|| Error::MissingDescriptor(self.signal_id().to_string()))?;
        let domain = self.signal.domain_signal();
        let info = SignalInfo {
            name: self.signal.name(),
            description: self.signal.description(),
            table_id: domain.map_or(self.signal_id(), |d| d.global_id()),
            has_domain: domain.is_some(),
        };
        Ok(MetadataMessage::Signal(signal_params(descriptor, info)?))
    }

    fn handle_event(&self, event: &EventPacket) {
        let mut inner = self.inner.lock();
        let Some(descriptor) = event.data_descriptor.clone() else {
            // Domain-only change: value metadata carries no domain fields.
            return;
        };
        inner.descriptor = Some(descriptor.clone());

        let message = self.signal_message(Some(&descriptor));
        let signal_id = self.signal.global_id();
        let factory = self.factory;
        let stats = &self.stats;

        inner.clients.retain_mut(|client| {
            let Some(connection) = client.connection.upgrade() else {
                return false;
            };
            let result = message
                .as_ref()
                .map_err(|e| Error::Metadata(e.to_string()))
                .and_then(|message| {
                    let signo = connection.signo_for(signal_id)?;
                    connection.send_metadata(signo, message)?;
                    factory.create(signal_id, Some(&descriptor))
                });
            match result {
                Ok(writer) => {
                    client.writer = writer;
                    client.samples_since_signal_update = 0;
                    client.expected_domain_value = None;
                    true
                }
                Err(e) => {
                    warn!(
                        "dropping client {} from {}: metadata update failed: {}",
                        connection.stream_id(),
                        signal_id,
                        e
                    );
                    connection.shutdown();
                    stats.record_client_dropped();
                    false
                }
            }
        });
    }

    fn handle_data(&self, packet: &DataPacket) {
        let mut inner = self.inner.lock();
        let signal_id = self.signal.global_id();
        let domain_echo = self.domain_echo_source(inner.descriptor.as_deref(), packet);
        let stats = &self.stats;

        inner.clients.retain_mut(|client| {
            let Some(connection) = client.connection.upgrade() else {
                return false;
            };
            if connection.is_closed() {
                return false;
            }

            let mut ok = true;
            if let Some((domain_id, start, delta)) = &domain_echo {
                ok = Self::echo_domain(client, &connection, domain_id, *start, *delta, packet);
            }
            if ok {
                ok = match connection.signo_for(signal_id) {
                    Ok(signo) => {
                        let mut sink = ConnectionSink {
                            connection: &connection,
                            signo,
                        };
                        client.writer.write(packet, &mut sink)
                    }
                    Err(_) => false,
                };
            }

            if ok {
                client.samples_since_signal_update += packet.sample_count as u64;
                true
            } else {
                warn!(
                    "dropping client {} from {}: write failed",
                    connection.stream_id(),
                    signal_id
                );
                connection.shutdown();
                stats.record_client_dropped();
                false
            }
        });
    }

    /// Domain signal id, start value and delta when this packet needs a
    /// synthetic domain frame check (explicit value, linear domain).
    fn domain_echo_source(
        &self,
        descriptor: Option<&DataDescriptor>,
        packet: &DataPacket,
    ) -> Option<(String, i64, i64)> {
        let domain_listener = self.domain_listener.get()?;
        if !matches!(descriptor?.rule, DataRule::Explicit) {
            return None;
        }
        let domain = packet.domain.as_ref()?;
        let start = domain.start_value()?;
        let delta = domain.descriptor.linear_delta()?;
        Some((domain_listener.signal_id().to_string(), start, delta))
    }

    /// Send `{index, start}` on the domain signo when the client could not
    /// extrapolate the domain value of this packet.
    fn echo_domain(
        client: &mut SubscribedClient,
        connection: &EstablishedClient,
        domain_id: &str,
        start: i64,
        delta: i64,
        packet: &DataPacket,
    ) -> bool {
        if client.expected_domain_value != Some(start) {
            let Some(signo) = connection.existing_signo(domain_id) else {
                return true;
            };
            let value = ConstantValue::new(client.samples_since_signal_update, start);
            if let Err(e) = connection.send_data(signo, &value.to_bytes()) {
                debug!("domain value to {} failed: {}", connection.peer(), e);
                return false;
            }
        }
        client.expected_domain_value =
            Some(start.wrapping_add(delta.wrapping_mul(packet.sample_count as i64)));
        true
    }
}

impl PortListener for Listener {
    fn packet_received(&self, port: &InputPort) {
        let _drain = self.drain.lock();
        while let Some(packet) = port.dequeue() {
            match packet {
                Packet::Data(data) => self.handle_data(&data),
                Packet::Event(event) => self.handle_event(&event),
            }
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("signal", &self.signal_id())
            .field("clients", &self.client_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinearWriterMode;
    use crate::signal::SampleType;

    fn listener_for(descriptor: Option<DataDescriptor>) -> Result<Arc<Listener>> {
        let signal = Arc::new(Signal::new("/dev/ai0", descriptor));
        Listener::new(
            signal,
            WriterFactory::new(LinearWriterMode::Noop),
            Arc::new(ServerStats::new()),
        )
    }

    #[test]
    fn test_unsupported_rule_rejected_at_construction() {
        let desc = DataDescriptor::new(SampleType::Float64).with_rule(DataRule::Other("log".into()));
        assert!(matches!(
            listener_for(Some(desc)),
            Err(Error::UnsupportedRule { .. })
        ));
        assert!(matches!(
            listener_for(None),
            Err(Error::MissingDescriptor(_))
        ));
    }

    #[test]
    fn test_lifecycle() {
        let listener = listener_for(Some(DataDescriptor::new(SampleType::Float32))).unwrap();
        assert_eq!(listener.state(), ListenerState::Created);
        listener.start();
        assert_eq!(listener.state(), ListenerState::Started);
        assert_eq!(listener.signal().connection_count(), 1);
        listener.stop();
        assert_eq!(listener.state(), ListenerState::Stopped);
        assert_eq!(listener.signal().connection_count(), 0);
    }

    #[test]
    fn test_descriptor_event_updates_cached_descriptor() {
        let listener = listener_for(Some(DataDescriptor::new(SampleType::Float32))).unwrap();
        listener.start();
        listener
            .signal()
            .set_descriptor(DataDescriptor::new(SampleType::Int16));
        let cached = listener.inner.lock().descriptor.clone().unwrap();
        assert_eq!(cached.sample_type, SampleType::Int16);
    }

    #[test]
    fn test_concurrent_senders_handled_in_queue_order() {
        let listener = listener_for(Some(DataDescriptor::new(SampleType::Float32))).unwrap();
        listener.start();
        let signal = listener.signal().clone();

        let drain = listener.drain.lock();
        let first = {
            let signal = signal.clone();
            std::thread::spawn(move || signal.set_descriptor(DataDescriptor::new(SampleType::Int16)))
        };
        while listener.port.len() < 1 {
            std::thread::yield_now();
        }
        let second = {
            let signal = signal.clone();
            std::thread::spawn(move || signal.set_descriptor(DataDescriptor::new(SampleType::Int32)))
        };
        while listener.port.len() < 2 {
            std::thread::yield_now();
        }
        drop(drain);
        first.join().unwrap();
        second.join().unwrap();

        assert!(listener.port.is_empty());
        let cached = listener.inner.lock().descriptor.clone().unwrap();
        assert_eq!(cached.sample_type, SampleType::Int32);
    }

    /// Upgraded session over loopback plus the peer's end of the socket.
    fn established(id: u64, stats: &Arc<ServerStats>) -> (Arc<EstablishedClient>, std::net::TcpStream) {
        let acceptor = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = std::net::TcpStream::connect(acceptor.local_addr().unwrap()).unwrap();
        peer.set_read_timeout(Some(std::time::Duration::from_secs(5))).unwrap();
        let (accepted, addr) = acceptor.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();

        let request = crate::protocol::http::HttpRequest {
            method: "GET".into(),
            target: "/".into(),
            version: "HTTP/1.1".into(),
            headers: vec![("Sec-WebSocket-Key".into(), "dGhlIHNhbXBsZSBub25jZQ==".into())],
            body: Vec::new(),
        };
        let settings = crate::server::session::SessionSettings {
            read_buffer_size: 4096,
            socket_send_buffer: 256 * 1024,
            max_pending_bytes: 1 << 20,
            reply_to_ping: true,
        };
        let (client, _) = crate::server::session::NegotiatingClient::new(
            mio::net::TcpStream::from_std(accepted),
            addr,
            4096,
        )
        .establish(&request, id, settings, stats.clone())
        .unwrap();
        (client, peer)
    }

    /// Read from `peer` until a DATA message shows up.
    fn next_data(peer: &mut std::net::TcpStream) -> Vec<u8> {
        use crate::codec::{self, StreamMessage};
        use crate::protocol::{http, websocket};
        use std::io::Read;

        let mut buffer = Vec::new();
        let mut chunk = [0u8; 4096];
        let mut upgraded = false;
        loop {
            if !upgraded {
                if let Some((_, used)) = http::parse_response(&buffer).unwrap() {
                    buffer.drain(..used);
                    upgraded = true;
                }
            }
            while upgraded {
                let header = websocket::decode_header(&buffer);
                if !header.is_complete() {
                    break;
                }
                let payload = buffer[header.header_size..header.frame_size()].to_vec();
                buffer.drain(..header.frame_size());
                for message in codec::decode_messages(&payload).unwrap() {
                    if let StreamMessage::Data { payload, .. } = message {
                        return payload;
                    }
                }
            }
            let n = peer.read(&mut chunk).unwrap();
            assert!(n > 0, "peer closed before data arrived");
            buffer.extend_from_slice(&chunk[..n]);
        }
    }

    #[test]
    fn test_failed_write_drops_client_while_others_receive() {
        let stats = Arc::new(ServerStats::new());
        let signal = Arc::new(Signal::new(
            "/dev/ai0",
            Some(DataDescriptor::new(SampleType::Float32)),
        ));
        let listener = Listener::new(signal.clone(), WriterFactory::default(), stats.clone()).unwrap();
        listener.start();

        let (a, _peer_a) = established(1, &stats);
        let (b, mut peer_b) = established(2, &stats);
        assert!(listener.add_client(&a, false));
        assert!(listener.add_client(&b, false));

        // Writes to A now fail while A is still marked open.
        a.close_write_half();
        assert!(!a.is_closed());

        let desc = signal.descriptor().unwrap();
        signal.send_packet(DataPacket::from_samples(desc, &[1.0f32, 2.0]));

        assert_eq!(listener.connection_ids(), vec![b.id()]);
        assert!(a.is_closed());
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.clients_dropped, 1);
        assert_eq!(snapshot.data_messages_sent, 1);

        let expected: Vec<u8> = [1.0f32, 2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        assert_eq!(next_data(&mut peer_b), expected);
        assert_eq!(listener.samples_since_signal_update(b.id()), Some(2));
    }

    #[test]
    fn test_signal_message_table_id() {
        let time = Arc::new(Signal::new(
            "/dev/time",
            Some(DataDescriptor::linear_time(1, 1000, "")),
        ));
        let value = Arc::new(
            Signal::new("/dev/ai0", Some(DataDescriptor::new(SampleType::Float32)))
                .with_domain(time.clone()),
        );
        let stats = Arc::new(ServerStats::new());
        let factory = WriterFactory::default();
        let value_listener = Listener::new(value.clone(), factory, stats.clone()).unwrap();
        let time_listener = Listener::new(time, factory, stats).unwrap();

        let desc = value.descriptor();
        let MetadataMessage::Signal(params) =
            value_listener.signal_message(desc.as_deref()).unwrap()
        else {
            panic!("expected signal message");
        };
        assert_eq!(params["tableId"], "/dev/time");
        assert_eq!(params["valueIndex"], 0);

        let desc = time_listener.signal().descriptor();
        let MetadataMessage::Signal(params) =
            time_listener.signal_message(desc.as_deref()).unwrap()
        else {
            panic!("expected signal message");
        };
        assert_eq!(params["tableId"], "/dev/time");
        assert!(params.get("valueIndex").is_none());
    }
}

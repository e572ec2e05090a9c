// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared fixtures for the socket-level tests.

#![allow(dead_code)]

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use opendaq_streaming::codec::{self, StreamMessage};
use opendaq_streaming::protocol::http;
use opendaq_streaming::protocol::metadata::SignalMetadata;
use opendaq_streaming::protocol::websocket::{self, Opcode};
use opendaq_streaming::signal::{DataDescriptor, DataRule, LocalDevice, SampleType, Signal};
use opendaq_streaming::{ClientConfig, ConnectionStatus, StreamSink};

pub const WAIT: Duration = Duration::from_secs(5);

/// Poll `condition` until it holds or `timeout` expires.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Signals of the reference test device.
pub struct TestSignals {
    pub device: LocalDevice,
    pub ai0: Arc<Signal>,
    pub ai1: Arc<Signal>,
    pub status: Arc<Signal>,
    pub time: Arc<Signal>,
}

/// `/dev/ai0` (Float32) and `/dev/ai1` (Float64) share the linear
/// `/dev/time` domain; `/dev/status` is a constant Int64 signal.
pub fn test_device() -> TestSignals {
    let device = LocalDevice::new("dev");
    let time = Arc::new(Signal::new(
        "/dev/time",
        Some(DataDescriptor::linear_time(1, 1000, "1970-01-01T00:00:00Z")),
    ));
    let ai0 = Arc::new(
        Signal::new(
            "/dev/ai0",
            Some(DataDescriptor::new(SampleType::Float32).with_name("AI0")),
        )
        .with_domain(time.clone()),
    );
    let ai1 = Arc::new(
        Signal::new("/dev/ai1", Some(DataDescriptor::new(SampleType::Float64)))
            .with_domain(time.clone()),
    );
    let status = Arc::new(Signal::new(
        "/dev/status",
        Some(DataDescriptor::new(SampleType::Int64).with_rule(DataRule::Constant)),
    ));
    device.add_signal(ai0.clone());
    device.add_signal(ai1.clone());
    device.add_signal(status.clone());
    TestSignals {
        device,
        ai0,
        ai1,
        status,
        time,
    }
}

pub fn client_config(streaming_port: u16) -> ClientConfig {
    ClientConfig {
        host: "127.0.0.1".into(),
        streaming_port,
        heartbeat_period_ms: 100,
        inactivity_timeout_ms: 600,
        connection_timeout_ms: 500,
        streaming_init_timeout_ms: 2000,
        reconnection_period_ms: 100,
        ..Default::default()
    }
}

/// What a [`RecordingSink`] saw, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Status(ConnectionStatus),
    Available(Vec<String>),
    Metadata(String, SignalMetadata),
    Data(String, Vec<u8>),
    Unsubscribed(String),
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn statuses(&self) -> Vec<ConnectionStatus> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Status(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    pub fn data_for(&self, signal_id: &str) -> Vec<Vec<u8>> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Data(id, payload) if id == signal_id => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn metadata_for(&self, signal_id: &str) -> Vec<SignalMetadata> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Metadata(id, m) if id == signal_id => Some(m.clone()),
                _ => None,
            })
            .collect()
    }
}

impl StreamSink for RecordingSink {
    fn on_status(&self, status: ConnectionStatus) {
        self.events.lock().push(Event::Status(status));
    }

    fn on_available(&self, signal_ids: &[String]) {
        self.events.lock().push(Event::Available(signal_ids.to_vec()));
    }

    fn on_signal_metadata(&self, signal_id: &str, metadata: &SignalMetadata) {
        self.events
            .lock()
            .push(Event::Metadata(signal_id.to_string(), metadata.clone()));
    }

    fn on_data(&self, signal_id: &str, payload: &[u8]) {
        self.events
            .lock()
            .push(Event::Data(signal_id.to_string(), payload.to_vec()));
    }

    fn on_unsubscribed(&self, signal_id: &str) {
        self.events
            .lock()
            .push(Event::Unsubscribed(signal_id.to_string()));
    }
}

/// Hand-driven WebSocket peer for protocol-level checks.
pub struct RawClient {
    pub stream: TcpStream,
    buffer: Vec<u8>,
}

impl RawClient {
    pub fn connect(addr: SocketAddr) -> Self {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(WAIT)).unwrap();
        let key = websocket::random_client_key();
        stream
            .write_all(&http::upgrade_request("127.0.0.1", addr.port(), &key, "raw"))
            .unwrap();

        let mut buffer = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            if let Some((response, used)) = http::parse_response(&buffer).unwrap() {
                assert_eq!(response.status, 101);
                assert_eq!(
                    response.header("sec-websocket-accept"),
                    Some(websocket::accept_key(&key).as_str())
                );
                buffer.drain(..used);
                break;
            }
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0, "closed during handshake");
            buffer.extend_from_slice(&chunk[..n]);
        }
        Self { stream, buffer }
    }

    /// Next frame from the server, `None` if the connection closed.
    pub fn next_frame(&mut self) -> Option<(Opcode, Vec<u8>)> {
        let mut chunk = [0u8; 4096];
        loop {
            let header = websocket::decode_header(&self.buffer);
            if header.is_complete() {
                assert!(header.masking_key.is_none(), "server frames are unmasked");
                let payload = self.buffer[header.header_size..header.frame_size()].to_vec();
                self.buffer.drain(..header.frame_size());
                return Some((header.opcode, payload));
            }
            match self.stream.read(&mut chunk) {
                Ok(0) => return None,
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    panic!("no frame within {:?}", WAIT)
                }
                Err(_) => return None,
            }
        }
    }

    /// Next streaming messages carried by one binary frame.
    pub fn next_messages(&mut self) -> Vec<StreamMessage> {
        loop {
            let (opcode, payload) = self.next_frame().expect("connection closed");
            if opcode == Opcode::Binary {
                return codec::decode_messages(&payload).unwrap();
            }
        }
    }

    /// Collect messages until `n` have arrived.
    pub fn take_messages(&mut self, n: usize) -> Vec<StreamMessage> {
        let mut out = Vec::new();
        while out.len() < n {
            out.extend(self.next_messages());
        }
        out
    }

    pub fn send_frame(&mut self, opcode: Opcode, payload: &[u8]) {
        let frame =
            websocket::encode_frame(opcode, payload, Some(websocket::random_masking_key()));
        self.stream.write_all(&frame).unwrap();
    }

    /// Drain frames until the server closes the socket.
    pub fn wait_closed(&mut self) {
        while self.next_frame().is_some() {}
    }
}

/// POST a control body and return the HTTP status.
pub fn post_control(addr: SocketAddr, body: &[u8]) -> u16 {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();
    stream
        .write_all(&http::post_request("127.0.0.1", addr.port(), body))
        .unwrap();
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if let Some((response, _)) = http::parse_response(&buffer).unwrap() {
            return response.status;
        }
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "control connection closed without a response");
        buffer.extend_from_slice(&chunk[..n]);
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Listener bookkeeping observed through a running server.

mod common;

use common::{post_control, test_device, wait_until, RawClient, RecordingSink, WAIT};
use opendaq_streaming::codec::StreamMessage;
use opendaq_streaming::protocol::control::ControlRequest;
use opendaq_streaming::protocol::metadata::MetadataMessage;
use opendaq_streaming::signal::{DataDescriptor, DataPacket, SampleType};
use opendaq_streaming::{Error, ServerConfig, StreamingClient, StreamingServer};

fn start(signals: &common::TestSignals) -> (StreamingServer, opendaq_streaming::LocalAddrs) {
    let mut server = StreamingServer::new(&signals.device, ServerConfig::ephemeral()).unwrap();
    let addrs = server.start().unwrap();
    (server, addrs)
}

#[test]
fn test_subscribe_twice_keeps_one_record() {
    let signals = test_device();
    let (server, addrs) = start(&signals);
    let sink = RecordingSink::new();
    let mut client =
        StreamingClient::new(common::client_config(addrs.streaming.port()), sink.clone()).unwrap();
    client.connect().unwrap();

    client.subscribe(&["/dev/ai0"]).unwrap();
    client.subscribe(&["/dev/ai0"]).unwrap();

    let ai0 = server.registry().get("/dev/ai0").unwrap();
    let time = server.registry().get("/dev/time").unwrap();
    assert_eq!(ai0.client_count(), 1);
    assert_eq!(time.client_count(), 1);

    let id = ai0.connection_ids()[0];
    assert_eq!(ai0.subscription_kind(id), Some(false));
    assert_eq!(time.subscription_kind(id), Some(true));

    // Signal metadata is sent once per subscription record.
    assert!(wait_until(WAIT, || sink.metadata_for("/dev/ai0").len() == 1));
    std::thread::sleep(std::time::Duration::from_millis(100));
    assert_eq!(sink.metadata_for("/dev/ai0").len(), 1);
}

#[test]
fn test_explicit_domain_subscription_is_not_demoted() {
    let signals = test_device();
    let (server, addrs) = start(&signals);
    let mut client =
        StreamingClient::new(common::client_config(addrs.streaming.port()), RecordingSink::new())
            .unwrap();
    client.connect().unwrap();

    let time = server.registry().get("/dev/time").unwrap();

    client.subscribe(&["/dev/time"]).unwrap();
    client.subscribe(&["/dev/ai0"]).unwrap();
    let id = time.connection_ids()[0];
    assert_eq!(time.subscription_kind(id), Some(false));

    client.unsubscribe(&["/dev/ai0"]).unwrap();
    assert_eq!(time.subscription_kind(id), Some(false));
}

#[test]
fn test_implicit_domain_released_when_unused() {
    let signals = test_device();
    let (server, addrs) = start(&signals);
    let mut client =
        StreamingClient::new(common::client_config(addrs.streaming.port()), RecordingSink::new())
            .unwrap();
    client.connect().unwrap();
    let time = server.registry().get("/dev/time").unwrap();

    client.subscribe(&["/dev/ai0", "/dev/ai1"]).unwrap();
    assert_eq!(time.client_count(), 1);

    // ai1 still needs the domain.
    client.unsubscribe(&["/dev/ai0"]).unwrap();
    assert_eq!(time.client_count(), 1);

    client.unsubscribe(&["/dev/ai1"]).unwrap();
    assert_eq!(time.client_count(), 0);
}

#[test]
fn test_partial_failure_still_subscribes_known_signals() {
    let signals = test_device();
    let (server, addrs) = start(&signals);
    let mut client =
        StreamingClient::new(common::client_config(addrs.streaming.port()), RecordingSink::new())
            .unwrap();
    client.connect().unwrap();

    let result = client.subscribe(&["/dev/missing", "/dev/status"]);
    assert!(matches!(result, Err(Error::Rejected(_))));
    assert_eq!(server.registry().get("/dev/status").unwrap().client_count(), 1);
}

#[test]
fn test_fan_out_survives_a_dead_client() {
    let signals = test_device();
    let (server, addrs) = start(&signals);

    let sink_a = RecordingSink::new();
    let mut a =
        StreamingClient::new(common::client_config(addrs.streaming.port()), sink_a.clone()).unwrap();
    a.connect().unwrap();
    let sink_b = RecordingSink::new();
    let mut b =
        StreamingClient::new(common::client_config(addrs.streaming.port()), sink_b.clone()).unwrap();
    b.connect().unwrap();

    a.subscribe(&["/dev/status"]).unwrap();
    b.subscribe(&["/dev/status"]).unwrap();
    let status = server.registry().get("/dev/status").unwrap();
    assert_eq!(status.client_count(), 2);

    a.stop();
    let desc = signals.status.descriptor().unwrap();
    signals
        .status
        .send_packet(DataPacket::from_samples(desc.clone(), &[5i64]));
    signals
        .status
        .send_packet(DataPacket::from_samples(desc, &[6i64]));

    assert!(wait_until(WAIT, || sink_b.data_for("/dev/status").len() == 2));
    assert!(sink_a.data_for("/dev/status").is_empty());
    assert!(wait_until(WAIT, || status.client_count() == 1));
}

#[test]
fn test_sample_counter_resets_on_descriptor_change() {
    let signals = test_device();
    let (server, addrs) = start(&signals);

    let mut raw = RawClient::connect(addrs.streaming);
    let stream_id = match &raw.take_messages(3)[1] {
        StreamMessage::Metadata {
            message: MetadataMessage::Init { stream_id, .. },
            ..
        } => stream_id.clone(),
        other => panic!("expected init, got {:?}", other),
    };
    let body = ControlRequest::subscribe(stream_id, vec!["/dev/ai1".into()])
        .to_body()
        .unwrap();
    assert_eq!(post_control(addrs.control, &body), 200);

    let ai1 = server.registry().get("/dev/ai1").unwrap();
    let id = ai1.connection_ids()[0];
    assert_eq!(ai1.samples_since_signal_update(id), Some(0));

    let desc = signals.ai1.descriptor().unwrap();
    signals
        .ai1
        .send_packet(DataPacket::from_samples(desc.clone(), &[1.0f64, 2.0, 3.0]));
    signals
        .ai1
        .send_packet(DataPacket::from_samples(desc, &[4.0f64, 5.0]));
    assert_eq!(ai1.samples_since_signal_update(id), Some(5));

    signals
        .ai1
        .set_descriptor(DataDescriptor::new(SampleType::Float32));
    assert_eq!(ai1.samples_since_signal_update(id), Some(0));

    let desc = signals.ai1.descriptor().unwrap();
    signals
        .ai1
        .send_packet(DataPacket::from_samples(desc, &[1.0f32]));
    assert_eq!(ai1.samples_since_signal_update(id), Some(1));
}

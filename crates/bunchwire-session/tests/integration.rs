//! Integration tests for the bunchwire-session crate.
//!
//! These tests drive two real connections against each other through
//! in-memory sinks, exercising the handshake, reliable reordering, and
//! loss recovery end to end.

use std::{sync::Arc, time::Duration, time::Instant};

use bunchwire_core::{
    config::{Config, SimulationConfig},
    transport::LoopbackSink,
};
use bunchwire_protocol::{bunch::ChannelType, control::ControlRegistry};
use bunchwire_session::{Connection, ConnectionEvent, ConnectionState, Role};

fn registry() -> Arc<ControlRegistry> {
    Arc::new(ControlRegistry::standard())
}

fn pair(config: Config) -> (Connection, Connection, LoopbackSink, LoopbackSink, Instant) {
    let now = Instant::now();
    let client = Connection::new(Role::Client, config.clone(), registry(), now);
    let server = Connection::new(Role::Server, config, registry(), now);
    (client, server, LoopbackSink::new(), LoopbackSink::new(), now)
}

fn deliver(from: &mut LoopbackSink, to: &mut Connection, to_sink: &mut LoopbackSink, now: Instant) {
    for packet in from.drain() {
        to.receive_datagram(to_sink, now, &packet).unwrap();
    }
}

fn establish(
    client: &mut Connection,
    server: &mut Connection,
    client_sink: &mut LoopbackSink,
    server_sink: &mut LoopbackSink,
    now: Instant,
) {
    client.connect(client_sink, now).unwrap();
    for _ in 0..2 {
        deliver(client_sink, server, server_sink, now);
        deliver(server_sink, client, client_sink, now);
    }
    assert_eq!(client.state(), ConnectionState::Open);
    assert_eq!(server.state(), ConnectionState::Open);
}

fn received_payloads(connection: &mut Connection) -> Vec<Vec<u8>> {
    let mut payloads = Vec::new();
    while let Some(event) = connection.poll_event() {
        if let ConnectionEvent::Message { payload, .. } = event {
            payloads.push(payload.as_slice().to_vec());
        }
    }
    payloads
}

#[test]
fn test_reordered_and_duplicated_delivery_comes_out_in_order() {
    let (mut client, mut server, mut cs, mut ss, now) = pair(Config::default());
    establish(&mut client, &mut server, &mut cs, &mut ss, now);

    // Open reliable channel 2 and let the open bunch land first.
    client.open_channel(&mut cs, now, ChannelType::Actor, Some(2)).unwrap();
    client.flush(&mut cs, now).unwrap();
    deliver(&mut cs, &mut server, &mut ss, now);

    // Three reliable messages, one packet each.
    for payload in [b"a".as_slice(), b"b", b"c"] {
        client.send(&mut cs, now, 2, payload, true).unwrap();
        client.flush(&mut cs, now).unwrap();
    }
    let packets = cs.drain();
    assert_eq!(packets.len(), 3);

    // The network delivers b, c, a with an extra copy of b.
    let scrambled = [&packets[1], &packets[2], &packets[1], &packets[0]];
    for packet in scrambled {
        server.receive_datagram(&mut ss, now, packet).unwrap();
    }

    assert_eq!(
        received_payloads(&mut server),
        vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
    );

    // Acks flow back and settle the client's in-flight state.
    server.tick(&mut ss, now).unwrap();
    deliver(&mut ss, &mut client, &mut cs, now);
    assert_eq!(client.packets_in_flight(), 0);
}

#[test]
fn test_unreliable_messages_deliver_without_guarantees() {
    let (mut client, mut server, mut cs, mut ss, now) = pair(Config::default());
    establish(&mut client, &mut server, &mut cs, &mut ss, now);

    client.open_channel(&mut cs, now, ChannelType::Voice, Some(3)).unwrap();
    client.flush(&mut cs, now).unwrap();
    deliver(&mut cs, &mut server, &mut ss, now);
    received_payloads(&mut server);

    client.send(&mut cs, now, 3, b"frame-1", false).unwrap();
    client.send(&mut cs, now, 3, b"frame-2", false).unwrap();
    client.flush(&mut cs, now).unwrap();
    deliver(&mut cs, &mut server, &mut ss, now);

    assert_eq!(
        received_payloads(&mut server),
        vec![b"frame-1".to_vec(), b"frame-2".to_vec()]
    );
}

#[test]
fn test_many_messages_share_packets_and_arrive_in_order() {
    let (mut client, mut server, mut cs, mut ss, now) = pair(Config::default());
    establish(&mut client, &mut server, &mut cs, &mut ss, now);

    client.open_channel(&mut cs, now, ChannelType::Actor, Some(5)).unwrap();
    let sent: Vec<Vec<u8>> = (0..40u8).map(|i| format!("msg-{}", i).into_bytes()).collect();
    for payload in &sent {
        client.send(&mut cs, now, 5, payload, true).unwrap();
    }
    client.flush(&mut cs, now).unwrap();
    // Far fewer packets than messages.
    assert!(cs.len() < sent.len());

    deliver(&mut cs, &mut server, &mut ss, now);
    assert_eq!(received_payloads(&mut server), sent);
}

#[test]
fn test_lossy_link_converges_to_in_order_delivery() {
    let simulation = SimulationConfig { loss: 0.3, seed: 7, ..SimulationConfig::default() };
    let config = Config {
        loss_timeout: Duration::from_millis(300),
        simulation: Some(simulation),
        ..Config::default()
    };
    // Only the client's send path is lossy; the return path stays clean so
    // acks are the recovery signal under test.
    let server_config = Config { loss_timeout: Duration::from_millis(300), ..Config::default() };
    let now = Instant::now();
    let mut client = Connection::new(Role::Client, config, registry(), now);
    let mut server = Connection::new(Role::Server, server_config, registry(), now);
    let mut cs = LoopbackSink::new();
    let mut ss = LoopbackSink::new();

    let mut at = now;
    client.connect(&mut cs, at).unwrap();
    // Drive both ends until the handshake survives the loss.
    for _ in 0..50 {
        deliver(&mut cs, &mut server, &mut ss, at);
        deliver(&mut ss, &mut client, &mut cs, at);
        client.tick(&mut cs, at).unwrap();
        server.tick(&mut ss, at).unwrap();
        if client.state() == ConnectionState::Open && server.state() == ConnectionState::Open {
            break;
        }
        at += Duration::from_millis(100);
    }
    assert_eq!(client.state(), ConnectionState::Open);
    assert_eq!(server.state(), ConnectionState::Open);

    client.open_channel(&mut cs, at, ChannelType::Actor, Some(2)).unwrap();
    let sent: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i; 3]).collect();
    for payload in &sent {
        client.send(&mut cs, at, 2, payload, true).unwrap();
        client.flush(&mut cs, at).unwrap();
    }

    let mut received = Vec::new();
    for _ in 0..100 {
        deliver(&mut cs, &mut server, &mut ss, at);
        deliver(&mut ss, &mut client, &mut cs, at);
        received.extend(received_payloads(&mut server));
        if received.len() >= sent.len() {
            break;
        }
        at += Duration::from_millis(100);
        client.tick(&mut cs, at).unwrap();
        server.tick(&mut ss, at).unwrap();
    }

    // Every message exactly once, in order, despite 30% loss.
    assert_eq!(received, sent);
}

#[test]
fn test_channel_lifecycle_round_trip() {
    let (mut client, mut server, mut cs, mut ss, now) = pair(Config::default());
    establish(&mut client, &mut server, &mut cs, &mut ss, now);

    let index = client.open_channel(&mut cs, now, ChannelType::File, None).unwrap();
    client.flush(&mut cs, now).unwrap();
    deliver(&mut cs, &mut server, &mut ss, now);

    let mut opened = false;
    while let Some(event) = server.poll_event() {
        if let ConnectionEvent::ChannelOpened { channel_index, channel_type } = event {
            assert_eq!(channel_index, index);
            assert_eq!(channel_type, ChannelType::File);
            opened = true;
        }
    }
    assert!(opened);

    client.close_channel(&mut cs, now, index).unwrap();
    client.flush(&mut cs, now).unwrap();
    deliver(&mut cs, &mut server, &mut ss, now);
    let closed = std::iter::from_fn(|| server.poll_event())
        .any(|e| e == ConnectionEvent::ChannelClosed { channel_index: index });
    assert!(closed);
    assert_eq!(server.channel_state(index), None);
}

#[test]
fn test_ready_reflects_window_backpressure() {
    let (mut client, mut server, mut cs, mut ss, now) = pair(Config::default());
    establish(&mut client, &mut server, &mut cs, &mut ss, now);

    let index = client.open_channel(&mut cs, now, ChannelType::Actor, None).unwrap();
    assert!(client.is_ready(index, false));

    // Saturate the window without ever delivering acks.
    let window = bunchwire_core::constants::RELIABLE_WINDOW;
    for _ in 0..window - 2 {
        client.send(&mut cs, now, index, b"backlog", true).unwrap();
    }
    assert!(!client.is_ready(index, false));
    assert!(client.is_ready(index, true));

    // Acks restore readiness.
    client.flush(&mut cs, now).unwrap();
    deliver(&mut cs, &mut server, &mut ss, now);
    server.tick(&mut ss, now).unwrap();
    deliver(&mut ss, &mut client, &mut cs, now);
    assert!(client.is_ready(index, false));
}

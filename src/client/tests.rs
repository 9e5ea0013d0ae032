use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::{advance, timeout, Instant};

use super::handle::Shared;
use super::*;
use crate::codec::{Decoder, Encoder, InboundPacket};
use crate::error::{ClientError, Result};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, ProtocolError, PubAck, PubComp,
    PubRec, PubRel, Publish, QoS, SubAck, UnsubAck,
};
use crate::store::{Direction, Message, MessageState};
use crate::transport::{Connector, Transport};

// ============================================================================
// Test harness
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Connect(ConnectReturnCode),
    Disconnect,
    Publish(u16),
    Message(Message),
    Subscribe(u16, Vec<u8>),
    Unsubscribe(u16),
}

#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl ClientHandler for Recorder {
    fn on_connect(&mut self, _client: &ClientHandle, code: ConnectReturnCode) {
        self.events.lock().push(Event::Connect(code));
    }

    fn on_disconnect(&mut self, _client: &ClientHandle) {
        self.events.lock().push(Event::Disconnect);
    }

    fn on_publish(&mut self, _client: &ClientHandle, mid: u16) {
        self.events.lock().push(Event::Publish(mid));
    }

    fn on_message(&mut self, _client: &ClientHandle, message: &Message) {
        self.events.lock().push(Event::Message(message.clone()));
    }

    fn on_subscribe(&mut self, _client: &ClientHandle, mid: u16, granted_qos: &[u8]) {
        self.events
            .lock()
            .push(Event::Subscribe(mid, granted_qos.to_vec()));
    }

    fn on_unsubscribe(&mut self, _client: &ClientHandle, mid: u16) {
        self.events.lock().push(Event::Unsubscribe(mid));
    }
}

/// Hands out pre-made in-memory streams, one per connect
struct DuplexConnector {
    streams: Mutex<VecDeque<DuplexStream>>,
}

impl DuplexConnector {
    fn new(streams: impl IntoIterator<Item = DuplexStream>) -> Self {
        Self {
            streams: Mutex::new(streams.into_iter().collect()),
        }
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self, _host: &str, _port: u16) -> Result<Box<dyn Transport>> {
        match self.streams.lock().pop_front() {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(io::Error::from(io::ErrorKind::ConnectionRefused).into()),
        }
    }
}

/// Broker side of an in-memory connection
struct FakeBroker {
    stream: DuplexStream,
    pending: BytesMut,
    inbound: InboundPacket,
    decoder: Decoder,
    encoder: Encoder,
}

impl FakeBroker {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            pending: BytesMut::new(),
            inbound: InboundPacket::default(),
            decoder: Decoder::new().with_strict(true),
            encoder: Encoder::new(),
        }
    }

    async fn send(&mut self, packet: &Packet) {
        let buf = self.encoder.encode_to_vec(packet).unwrap();
        self.stream.write_all(&buf).await.unwrap();
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    async fn recv(&mut self) -> Packet {
        loop {
            if !self.pending.is_empty() {
                let (used, raw) = self.inbound.feed(&self.pending).unwrap();
                let _ = self.pending.split_to(used);
                if let Some(raw) = raw {
                    return self.decoder.decode_body(raw.command, &raw.body).unwrap();
                }
            }

            let mut buf = [0u8; 1024];
            let n = timeout(Duration::from_secs(5), self.stream.read(&mut buf))
                .await
                .expect("timed out waiting for client")
                .unwrap();
            assert!(n > 0, "client closed the connection");
            self.pending.extend_from_slice(&buf[..n]);
        }
    }

    /// True once the client side has been dropped
    async fn is_closed(&mut self) -> bool {
        let mut buf = [0u8; 16];
        matches!(
            timeout(Duration::from_secs(1), self.stream.read(&mut buf)).await,
            Ok(Ok(0))
        )
    }
}

fn setup(options: ClientOptions) -> (Client, FakeBroker, Recorder) {
    let (client_end, broker_end) = duplex(64 * 1024);
    let recorder = Recorder::default();
    let client = Client::new(options, recorder.clone())
        .unwrap()
        .with_connector(DuplexConnector::new([client_end]));
    (client, FakeBroker::new(broker_end), recorder)
}

async fn connected(keepalive: u16) -> (Client, FakeBroker, Recorder) {
    let (mut client, mut broker, events) = setup(ClientOptions::new("test-client"));
    client
        .connect("broker.example", 1883, keepalive, true)
        .await
        .unwrap();
    client.loop_write().await.unwrap();
    assert!(matches!(broker.recv().await, Packet::Connect(_)));

    broker
        .send(&Packet::ConnAck(ConnAck::new(ConnectReturnCode::Accepted)))
        .await;
    client.loop_read().await.unwrap();
    assert_eq!(client.state(), ClientState::Connected);
    assert_eq!(
        events.take(),
        vec![Event::Connect(ConnectReturnCode::Accepted)]
    );
    (client, broker, events)
}

// ============================================================================
// Argument checks
// ============================================================================

#[test]
fn test_mid_wraps_and_skips_zero() {
    let shared = Shared::new("c".to_string());
    assert_eq!(shared.next_mid(), 1);
    for _ in 0..65533 {
        shared.next_mid();
    }
    assert_eq!(shared.next_mid(), 65535);
    assert_eq!(shared.next_mid(), 1);
}

#[test]
fn test_new_rejects_invalid_options() {
    assert!(matches!(
        Client::new(ClientOptions::new(""), NoopHandler),
        Err(ClientError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_connect_argument_checks() {
    let (mut client, _broker, _events) = setup(ClientOptions::new("c"));

    assert!(matches!(
        client.reconnect().await,
        Err(ClientError::InvalidArgument(_))
    ));
    assert!(matches!(
        client.connect("", 1883, 60, true).await,
        Err(ClientError::InvalidArgument(_))
    ));
    assert!(matches!(
        client.connect("broker.example", 0, 60, true).await,
        Err(ClientError::InvalidArgument(_))
    ));
    assert_eq!(client.state(), ClientState::New);
}

#[tokio::test]
async fn test_connect_failure_leaves_client_unconnected() {
    let mut client = Client::new(ClientOptions::new("c"), NoopHandler)
        .unwrap()
        .with_connector(DuplexConnector::new([]));

    assert!(matches!(
        client.connect("broker.example", 1883, 60, true).await,
        Err(ClientError::Io(_))
    ));
    assert_eq!(client.state(), ClientState::New);
    assert!(matches!(
        client.loop_once(Duration::from_millis(10)).await,
        Err(ClientError::NotConnected)
    ));
}

#[test]
fn test_publish_validation() {
    let client = Client::new(ClientOptions::new("c"), NoopHandler).unwrap();

    assert!(matches!(
        client.publish("a/b", "x", 3, false),
        Err(ClientError::InvalidArgument(_))
    ));
    assert!(matches!(
        client.publish("a/+", "x", 0, false),
        Err(ClientError::InvalidArgument(_))
    ));
    assert!(matches!(
        client.publish("a/#", "x", 0, false),
        Err(ClientError::InvalidArgument(_))
    ));
    assert!(matches!(
        client.publish("", "x", 0, false),
        Err(ClientError::InvalidArgument(_))
    ));
    assert!(matches!(
        client.publish("a/b", vec![0u8; 268_435_456], 0, false),
        Err(ClientError::PayloadTooLarge)
    ));
    // Topic plus payload must fit in one remaining length
    assert!(matches!(
        client.publish("a/b", vec![0u8; 268_435_455], 0, false),
        Err(ClientError::PayloadTooLarge)
    ));

    // Valid request, but nothing to send it on
    assert!(matches!(
        client.publish("a/b", "x", 1, false),
        Err(ClientError::NotConnected)
    ));
    assert_eq!(client.handle().inflight(), 0);
}

#[test]
fn test_subscribe_validation() {
    let client = Client::new(ClientOptions::new("c"), NoopHandler).unwrap();

    assert!(matches!(
        client.subscribe("a/#/b", 0),
        Err(ClientError::InvalidArgument(_))
    ));
    assert!(matches!(
        client.subscribe("a/b+", 0),
        Err(ClientError::InvalidArgument(_))
    ));
    assert!(matches!(
        client.subscribe("a/+", 3),
        Err(ClientError::InvalidArgument(_))
    ));
    assert!(matches!(
        client.unsubscribe(""),
        Err(ClientError::InvalidArgument(_))
    ));
    assert!(matches!(
        client.subscribe("a/+", 1),
        Err(ClientError::NotConnected)
    ));
    assert!(matches!(client.disconnect(), Err(ClientError::NotConnected)));
}

#[test]
fn test_set_will_and_credentials() {
    let mut client = Client::new(ClientOptions::new("c"), NoopHandler).unwrap();

    assert!(client.set_will("status/+", "gone", 0, false).is_err());
    client.set_will("status/c", "gone", 1, true).unwrap();
    assert_eq!(client.options().will.as_ref().unwrap().qos, QoS::AtLeastOnce);
    client.clear_will();
    assert!(client.options().will.is_none());

    client.set_credentials(Some("user"), Some(b"secret"));
    assert_eq!(client.options().username.as_deref(), Some("user"));
    assert_eq!(client.options().password.as_deref(), Some(&b"secret"[..]));

    // No username means no password either
    client.set_credentials(None, Some(b"secret"));
    assert!(client.options().username.is_none());
    assert!(client.options().password.is_none());
}

// ============================================================================
// Connection
// ============================================================================

struct MockConnector {
    mock: Mutex<Option<tokio_test::io::Mock>>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _host: &str, _port: u16) -> Result<Box<dyn Transport>> {
        match self.mock.lock().take() {
            Some(mock) => Ok(Box::new(mock)),
            None => Err(ClientError::ConnectionLost),
        }
    }
}

#[tokio::test]
async fn test_handshake_bytes_on_scripted_transport() {
    let encoder = Encoder::new();
    let connect = encoder
        .encode_to_vec(&Packet::Connect(Box::new(Connect {
            client_id: "scripted".to_string(),
            keep_alive: 60,
            clean_session: true,
            ..Default::default()
        })))
        .unwrap();
    let mock = tokio_test::io::Builder::new()
        .write(&connect)
        .read(&[0x20, 0x02, 0x00, 0x00])
        .build();

    let recorder = Recorder::default();
    let mut client = Client::new(ClientOptions::new("scripted"), recorder.clone())
        .unwrap()
        .with_connector(MockConnector {
            mock: Mutex::new(Some(mock)),
        });
    client.connect("broker.example", 1883, 60, true).await.unwrap();
    client.loop_write().await.unwrap();
    client.loop_read().await.unwrap();

    assert_eq!(client.state(), ClientState::Connected);
    assert_eq!(
        recorder.take(),
        vec![Event::Connect(ConnectReturnCode::Accepted)]
    );
}

#[tokio::test]
async fn test_connect_sends_connect_first() {
    let (mut client, mut broker, _events) = setup(ClientOptions::new("sensor-7"));
    client.set_credentials(Some("user"), Some(b"pw"));
    client.set_will("status/sensor-7", "offline", 1, true).unwrap();

    client
        .connect("broker.example", 1883, 30, false)
        .await
        .unwrap();
    assert_eq!(client.state(), ClientState::Connecting);

    // Requests queued while connecting go out after CONNECT
    let mid = client.subscribe("cmd/#", 1).unwrap();
    client.loop_write().await.unwrap();

    let Packet::Connect(connect) = broker.recv().await else {
        panic!("expected CONNECT");
    };
    assert_eq!(connect.client_id, "sensor-7");
    assert_eq!(connect.keep_alive, 30);
    assert!(!connect.clean_session);
    assert_eq!(connect.username.as_deref(), Some("user"));
    assert_eq!(connect.password.as_deref(), Some(&b"pw"[..]));
    let will = connect.will.as_ref().unwrap();
    assert_eq!(will.topic, "status/sensor-7");
    assert!(will.retain);

    let Packet::Subscribe(subscribe) = broker.recv().await else {
        panic!("expected SUBSCRIBE");
    };
    assert_eq!(subscribe.packet_id, mid);
}

#[tokio::test]
async fn test_refused_connack() {
    let (mut client, mut broker, events) = setup(ClientOptions::new("c"));
    client.connect("broker.example", 1883, 60, true).await.unwrap();
    client.loop_write().await.unwrap();
    broker.recv().await;

    broker
        .send(&Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::IdentifierRejected,
        )))
        .await;
    assert!(matches!(
        client.loop_read().await,
        Err(ClientError::ConnectionRefused(
            ConnectReturnCode::IdentifierRejected
        ))
    ));
    assert_eq!(client.state(), ClientState::Closed);
    assert_eq!(
        events.take(),
        vec![
            Event::Connect(ConnectReturnCode::IdentifierRejected),
            Event::Disconnect
        ]
    );
    assert!(broker.is_closed().await);
}

#[tokio::test]
async fn test_packet_before_connack_is_protocol_error() {
    let (mut client, mut broker, events) = setup(ClientOptions::new("c"));
    client.connect("broker.example", 1883, 60, true).await.unwrap();
    client.loop_write().await.unwrap();
    broker.recv().await;

    broker.send(&Packet::PubAck(PubAck::new(1))).await;
    assert!(matches!(
        client.loop_read().await,
        Err(ClientError::Protocol(_))
    ));
    assert_eq!(client.state(), ClientState::Closed);
    assert_eq!(events.take(), vec![Event::Disconnect]);
}

#[tokio::test]
async fn test_second_connack_is_protocol_error() {
    let (mut client, mut broker, events) = connected(60).await;

    broker
        .send(&Packet::ConnAck(ConnAck::new(ConnectReturnCode::Accepted)))
        .await;
    assert!(matches!(
        client.loop_read().await,
        Err(ClientError::Protocol(_))
    ));
    assert_eq!(events.take(), vec![Event::Disconnect]);
}

#[tokio::test]
async fn test_client_only_packet_is_protocol_error() {
    let (mut client, mut broker, _events) = connected(60).await;

    broker.send(&Packet::Disconnect).await;
    assert!(matches!(
        client.loop_read().await,
        Err(ClientError::Protocol(_))
    ));
    assert_eq!(client.state(), ClientState::Closed);
}

#[tokio::test]
async fn test_strict_mode_rejects_padded_ack() {
    let mut options = ClientOptions::new("c");
    options.strict_protocol = true;
    let (mut client, mut broker, _events) = setup(options);
    client.connect("broker.example", 1883, 60, true).await.unwrap();
    client.loop_write().await.unwrap();
    broker.recv().await;
    broker
        .send(&Packet::ConnAck(ConnAck::new(ConnectReturnCode::Accepted)))
        .await;
    client.loop_read().await.unwrap();

    broker.send_raw(&[0x40, 0x03, 0x00, 0x01, 0x00]).await;
    assert!(matches!(
        client.loop_read().await,
        Err(ClientError::Protocol(_))
    ));
}

#[tokio::test]
async fn test_inbound_packet_over_size_limit_closes() {
    let mut options = ClientOptions::new("c");
    options.max_packet_size = 64;
    let (mut client, mut broker, events) = setup(options);
    client.connect("broker.example", 1883, 60, true).await.unwrap();
    client.loop_write().await.unwrap();
    broker.recv().await;
    broker
        .send(&Packet::ConnAck(ConnAck::new(ConnectReturnCode::Accepted)))
        .await;
    client.loop_read().await.unwrap();
    events.take();

    broker
        .send(&Packet::Publish(Publish {
            topic: "big".to_string(),
            payload: vec![0u8; 200].into(),
            ..Default::default()
        }))
        .await;
    assert!(matches!(
        client.loop_read().await,
        Err(ClientError::Protocol(ProtocolError::Decode(
            DecodeError::PacketTooLarge
        )))
    ));
    assert_eq!(client.state(), ClientState::Closed);
    assert_eq!(events.take(), vec![Event::Disconnect]);
}

#[tokio::test]
async fn test_peer_close_is_connection_lost() {
    let (mut client, broker, events) = connected(60).await;
    drop(broker);

    assert!(matches!(
        client.loop_read().await,
        Err(ClientError::ConnectionLost)
    ));
    assert_eq!(client.state(), ClientState::Closed);
    assert_eq!(events.take(), vec![Event::Disconnect]);
}

#[tokio::test]
async fn test_graceful_disconnect() {
    let (mut client, mut broker, events) = connected(60).await;

    client.disconnect().unwrap();
    assert_eq!(client.state(), ClientState::Disconnecting);
    assert!(matches!(
        client.publish("a", "x", 0, false),
        Err(ClientError::NotConnected)
    ));

    client.loop_write().await.unwrap();
    assert_eq!(broker.recv().await, Packet::Disconnect);
    assert_eq!(client.state(), ClientState::Closed);
    assert_eq!(events.take(), vec![Event::Disconnect]);
    assert!(broker.is_closed().await);
}

#[tokio::test]
async fn test_reconnect_keeps_store_without_clean_session() {
    let (a_client, a_broker) = duplex(4096);
    let (b_client, b_broker) = duplex(4096);
    let mut client = Client::new(ClientOptions::new("c"), NoopHandler)
        .unwrap()
        .with_connector(DuplexConnector::new([a_client, b_client]));
    let mut first = FakeBroker::new(a_broker);
    let mut second = FakeBroker::new(b_broker);

    client.connect("broker.example", 1883, 60, false).await.unwrap();
    client.loop_write().await.unwrap();
    first.recv().await;
    first
        .send(&Packet::ConnAck(ConnAck::new(ConnectReturnCode::Accepted)))
        .await;
    client.loop_read().await.unwrap();

    client.publish("a/b", "x", 1, false).unwrap();
    assert_eq!(client.handle().inflight(), 1);

    client.reconnect().await.unwrap();
    assert_eq!(client.state(), ClientState::Connecting);
    assert_eq!(client.handle().inflight(), 1);
    assert!(first.is_closed().await);

    client.loop_write().await.unwrap();
    assert!(matches!(second.recv().await, Packet::Connect(_)));
}

#[tokio::test]
async fn test_reconnect_with_clean_session_clears_store() {
    let (a_client, _a_broker) = duplex(4096);
    let (b_client, _b_broker) = duplex(4096);
    let mut client = Client::new(ClientOptions::new("c"), NoopHandler)
        .unwrap()
        .with_connector(DuplexConnector::new([a_client, b_client]));

    client.connect("broker.example", 1883, 60, true).await.unwrap();
    client.publish("a/b", "x", 2, false).unwrap();
    assert_eq!(client.handle().inflight(), 1);

    client.reconnect().await.unwrap();
    assert_eq!(client.handle().inflight(), 0);
    assert_eq!(client.shared.queued(), 1);
}

// ============================================================================
// Publish flows
// ============================================================================

#[tokio::test]
async fn test_qos0_publish_completes_when_written() {
    let (mut client, mut broker, events) = connected(60).await;

    let mid = client.publish("a/b", "hello", 0, false).unwrap();
    assert_eq!(mid, 1);
    assert_eq!(client.handle().inflight(), 0);
    assert!(events.take().is_empty());

    client.loop_write().await.unwrap();
    assert_eq!(events.take(), vec![Event::Publish(1)]);

    let Packet::Publish(publish) = broker.recv().await else {
        panic!("expected PUBLISH");
    };
    assert_eq!(publish.qos, QoS::AtMostOnce);
    assert_eq!(publish.packet_id, None);
    assert_eq!(&publish.payload[..], b"hello");
}

#[tokio::test]
async fn test_qos1_publish_flow() {
    let (mut client, mut broker, events) = connected(60).await;

    let mid = client.publish("a/b", "hello", 1, true).unwrap();
    {
        let store = client.shared.store.lock();
        let stored = store.get(mid, Direction::Out).unwrap();
        assert_eq!(stored.state, MessageState::WaitPubAck);
    }

    client.loop_write().await.unwrap();
    let Packet::Publish(publish) = broker.recv().await else {
        panic!("expected PUBLISH");
    };
    assert_eq!(publish.packet_id, Some(mid));
    assert!(publish.retain);
    assert!(events.take().is_empty());

    broker.send(&Packet::PubAck(PubAck::new(mid))).await;
    client.loop_read().await.unwrap();
    assert_eq!(events.take(), vec![Event::Publish(mid)]);
    assert_eq!(client.handle().inflight(), 0);

    // A repeated PUBACK has nothing left to acknowledge
    broker.send(&Packet::PubAck(PubAck::new(mid))).await;
    client.loop_read().await.unwrap();
    assert!(events.take().is_empty());
}

#[tokio::test]
async fn test_qos2_publish_flow_ignores_early_pubcomp() {
    let (mut client, mut broker, events) = connected(60).await;

    let mid = client.publish("a/b", "hello", 2, false).unwrap();
    client.loop_write().await.unwrap();
    broker.recv().await;

    broker.send(&Packet::PubComp(PubComp::new(mid))).await;
    client.loop_read().await.unwrap();
    assert!(events.take().is_empty());
    assert_eq!(
        client.shared.store.lock().get(mid, Direction::Out).unwrap().state,
        MessageState::WaitPubRec
    );

    broker.send(&Packet::PubRec(PubRec::new(mid))).await;
    client.loop_read().await.unwrap();
    assert_eq!(
        client.shared.store.lock().get(mid, Direction::Out).unwrap().state,
        MessageState::WaitPubComp
    );
    client.loop_write().await.unwrap();
    assert_eq!(broker.recv().await, Packet::PubRel(PubRel::new(mid)));

    broker.send(&Packet::PubComp(PubComp::new(mid))).await;
    client.loop_read().await.unwrap();
    assert_eq!(events.take(), vec![Event::Publish(mid)]);
    assert_eq!(client.handle().inflight(), 0);
}

#[tokio::test]
async fn test_pubrec_for_unknown_mid_still_answers() {
    let (mut client, mut broker, _events) = connected(60).await;

    broker.send(&Packet::PubRec(PubRec::new(42))).await;
    client.loop_read().await.unwrap();
    client.loop_write().await.unwrap();
    assert_eq!(broker.recv().await, Packet::PubRel(PubRel::new(42)));
    assert_eq!(client.handle().inflight(), 0);
}

#[tokio::test]
async fn test_inbound_qos0_and_qos1() {
    let (mut client, mut broker, events) = connected(60).await;

    broker
        .send(&Packet::Publish(Publish {
            topic: "t/0".to_string(),
            payload: "zero".into(),
            ..Default::default()
        }))
        .await;
    broker
        .send(&Packet::Publish(Publish {
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: "t/1".to_string(),
            packet_id: Some(7),
            payload: "one".into(),
            ..Default::default()
        }))
        .await;
    client.loop_read().await.unwrap();

    let events = events.take();
    assert_eq!(events.len(), 2);
    let Event::Message(first) = &events[0] else {
        panic!("expected message");
    };
    assert_eq!(first.topic, "t/0");
    assert_eq!(first.qos, QoS::AtMostOnce);
    let Event::Message(second) = &events[1] else {
        panic!("expected message");
    };
    assert_eq!(second.mid, 7);
    assert!(second.retain);

    client.loop_write().await.unwrap();
    assert_eq!(broker.recv().await, Packet::PubAck(PubAck::new(7)));
}

#[tokio::test]
async fn test_inbound_qos2_delivered_once() {
    let (mut client, mut broker, events) = connected(60).await;
    let publish = Publish {
        qos: QoS::ExactlyOnce,
        topic: "t/2".to_string(),
        packet_id: Some(9),
        payload: "two".into(),
        ..Default::default()
    };

    broker.send(&Packet::Publish(publish.clone())).await;
    client.loop_read().await.unwrap();
    assert!(events.take().is_empty());
    assert!(client.shared.store.lock().contains(9, Direction::In));
    client.loop_write().await.unwrap();
    assert_eq!(broker.recv().await, Packet::PubRec(PubRec::new(9)));

    // Duplicate PUBLISH only repeats PUBREC
    broker
        .send(&Packet::Publish(Publish {
            dup: true,
            ..publish
        }))
        .await;
    client.loop_read().await.unwrap();
    assert_eq!(client.handle().inflight(), 1);
    client.loop_write().await.unwrap();
    assert_eq!(broker.recv().await, Packet::PubRec(PubRec::new(9)));

    broker.send(&Packet::PubRel(PubRel::new(9))).await;
    client.loop_read().await.unwrap();
    let delivered = events.take();
    assert_eq!(delivered.len(), 1);
    assert!(matches!(&delivered[0], Event::Message(m) if m.mid == 9 && &m.payload[..] == b"two"));
    client.loop_write().await.unwrap();
    assert_eq!(broker.recv().await, Packet::PubComp(PubComp::new(9)));

    // Duplicate PUBREL is acknowledged but not delivered again
    broker.send(&Packet::PubRel(PubRel::new(9))).await;
    client.loop_read().await.unwrap();
    assert!(events.take().is_empty());
    client.loop_write().await.unwrap();
    assert_eq!(broker.recv().await, Packet::PubComp(PubComp::new(9)));
}

#[tokio::test]
async fn test_subscribe_and_unsubscribe_acks() {
    let (mut client, mut broker, events) = connected(60).await;

    let sub_mid = client.subscribe("sensors/+", 1).unwrap();
    client.loop_write().await.unwrap();
    let Packet::Subscribe(subscribe) = broker.recv().await else {
        panic!("expected SUBSCRIBE");
    };
    assert_eq!(subscribe.subscriptions[0].filter, "sensors/+");
    assert_eq!(subscribe.subscriptions[0].qos, QoS::AtLeastOnce);

    broker
        .send(&Packet::SubAck(SubAck {
            packet_id: sub_mid,
            granted_qos: vec![1],
        }))
        .await;
    client.loop_read().await.unwrap();
    assert_eq!(events.take(), vec![Event::Subscribe(sub_mid, vec![1])]);

    let unsub_mid = client.unsubscribe("sensors/+").unwrap();
    assert_eq!(unsub_mid, sub_mid + 1);
    client.loop_write().await.unwrap();
    assert!(matches!(broker.recv().await, Packet::Unsubscribe(_)));
    broker
        .send(&Packet::UnsubAck(UnsubAck {
            packet_id: unsub_mid,
        }))
        .await;
    client.loop_read().await.unwrap();
    assert_eq!(events.take(), vec![Event::Unsubscribe(unsub_mid)]);
}

#[tokio::test]
async fn test_broker_pingreq_gets_pingresp() {
    let (mut client, mut broker, _events) = connected(60).await;

    broker.send(&Packet::PingReq).await;
    client.loop_read().await.unwrap();
    client.loop_write().await.unwrap();
    assert_eq!(broker.recv().await, Packet::PingResp);
}

// ============================================================================
// Timers
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_keepalive_ping_and_response() {
    let (mut client, mut broker, _events) = connected(5).await;

    advance(Duration::from_secs(4)).await;
    client.loop_misc().unwrap();
    assert_eq!(client.shared.queued(), 0);

    advance(Duration::from_secs(1)).await;
    client.loop_misc().unwrap();
    // Only one PINGREQ while one is outstanding
    client.loop_misc().unwrap();
    assert_eq!(client.shared.queued(), 1);
    client.loop_write().await.unwrap();
    assert_eq!(broker.recv().await, Packet::PingReq);
    assert!(client.ping_sent.is_some());

    broker.send(&Packet::PingResp).await;
    client.loop_read().await.unwrap();
    assert!(client.ping_sent.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_without_pingresp_drops_connection() {
    let (mut client, mut broker, events) = connected(5).await;

    advance(Duration::from_secs(5)).await;
    client.loop_misc().unwrap();
    client.loop_write().await.unwrap();
    assert_eq!(broker.recv().await, Packet::PingReq);

    advance(Duration::from_secs(5)).await;
    assert!(matches!(
        client.loop_misc(),
        Err(ClientError::ConnectionLost)
    ));
    assert_eq!(client.state(), ClientState::Closed);
    assert_eq!(events.take(), vec![Event::Disconnect]);
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_zero_disables_pings() {
    let (mut client, _broker, _events) = connected(0).await;

    advance(Duration::from_secs(1000)).await;
    client.loop_misc().unwrap();
    assert_eq!(client.shared.queued(), 0);
    assert_eq!(client.state(), ClientState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_connack_timeout_drops_connection() {
    let (mut client, _broker, events) = setup(ClientOptions::new("c"));
    client.connect("broker.example", 1883, 5, true).await.unwrap();
    client.loop_write().await.unwrap();

    advance(Duration::from_secs(5)).await;
    assert!(matches!(
        client.loop_misc(),
        Err(ClientError::ConnectionLost)
    ));
    assert_eq!(events.take(), vec![Event::Disconnect]);
}

#[tokio::test(start_paused = true)]
async fn test_retry_resends_unacknowledged_publish() {
    let (mut client, mut broker, _events) = connected(60).await;

    let mid = client.publish("a/b", "x", 1, false).unwrap();
    client.loop_write().await.unwrap();
    let Packet::Publish(first) = broker.recv().await else {
        panic!("expected PUBLISH");
    };
    assert!(!first.dup);

    advance(Duration::from_secs(10)).await;
    client.loop_misc().unwrap();
    assert_eq!(client.shared.queued(), 0);

    advance(Duration::from_secs(11)).await;
    client.loop_misc().unwrap();
    assert_eq!(client.shared.queued(), 1);
    assert_eq!(
        client
            .shared
            .store
            .lock()
            .get(mid, Direction::Out)
            .unwrap()
            .timestamp,
        Instant::now()
    );

    client.loop_write().await.unwrap();
    let Packet::Publish(retry) = broker.recv().await else {
        panic!("expected PUBLISH");
    };
    assert!(retry.dup);
    assert_eq!(retry.packet_id, Some(mid));
}

#[tokio::test(start_paused = true)]
async fn test_no_retry_while_connecting() {
    let (mut client, _broker, _events) = setup(ClientOptions::new("c"));
    client.connect("broker.example", 1883, 0, false).await.unwrap();
    client.publish("a/b", "x", 1, false).unwrap();
    client.loop_write().await.unwrap();

    advance(Duration::from_secs(30)).await;
    client.loop_misc().unwrap();
    assert_eq!(client.shared.queued(), 0);
}

// ============================================================================
// Callbacks and the loop
// ============================================================================

/// Publishes from inside `on_connect`
struct PublishOnConnect;

impl ClientHandler for PublishOnConnect {
    fn on_connect(&mut self, client: &ClientHandle, code: ConnectReturnCode) {
        if code.is_accepted() {
            client.publish("hello", "world", 0, false).unwrap();
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_publish_from_callback_skips_wakeup() {
    let (client_end, broker_end) = duplex(4096);
    let mut client = Client::new(ClientOptions::new("c"), PublishOnConnect)
        .unwrap()
        .with_connector(DuplexConnector::new([client_end]));
    let mut broker = FakeBroker::new(broker_end);

    client.connect("broker.example", 1883, 60, true).await.unwrap();
    client.loop_write().await.unwrap();
    broker.recv().await;
    broker
        .send(&Packet::ConnAck(ConnAck::new(ConnectReturnCode::Accepted)))
        .await;
    client.loop_read().await.unwrap();

    assert!(!client.shared.in_callback());
    assert_eq!(client.shared.queued(), 1);
    let woken = timeout(
        Duration::from_millis(10),
        client.shared.write_wakeup().notified(),
    )
    .await;
    assert!(woken.is_err());

    client.loop_write().await.unwrap();
    assert!(matches!(broker.recv().await, Packet::Publish(_)));
}

#[tokio::test]
async fn test_publish_from_handle_wakes_writer() {
    let (client, _broker, _events) = connected(60).await;
    let handle = client.handle();

    std::thread::spawn(move || handle.publish("a/b", "x", 0, false).unwrap())
        .join()
        .unwrap();

    let woken = timeout(
        Duration::from_secs(1),
        client.shared.write_wakeup().notified(),
    )
    .await;
    assert!(woken.is_ok());
}

#[tokio::test]
async fn test_loop_once_writes_and_reads() {
    let (mut client, mut broker, events) = connected(60).await;

    client.publish("a/b", "x", 1, false).unwrap();
    while client.shared.queued() > 0 || client.current.is_some() || client.needs_flush {
        client.loop_once(Duration::from_millis(100)).await.unwrap();
    }
    assert!(matches!(broker.recv().await, Packet::Publish(_)));

    broker.send(&Packet::PubAck(PubAck::new(1))).await;
    client.loop_once(Duration::from_secs(1)).await.unwrap();
    assert_eq!(events.take(), vec![Event::Publish(1)]);
}

#[tokio::test]
async fn test_loop_once_writes_while_inbound_is_backed_up() {
    let (mut client, mut broker, events) = connected(60).await;

    let frame = Packet::Publish(Publish {
        topic: "in".to_string(),
        payload: vec![b'x'; 1000].into(),
        ..Default::default()
    });
    for _ in 0..60 {
        broker.send(&frame).await;
    }

    let mid = client.publish("out", "x", 0, false).unwrap();
    client.loop_once(Duration::from_millis(10)).await.unwrap();

    let Packet::Publish(publish) = broker.recv().await else {
        panic!("expected publish");
    };
    assert_eq!(publish.topic, "out");

    let events = events.take();
    assert!(events.contains(&Event::Publish(mid)));
    let delivered = events
        .iter()
        .filter(|e| matches!(e, Event::Message(_)))
        .count();
    assert!(delivered < 60);
}

#[tokio::test(start_paused = true)]
async fn test_loop_once_times_out_quietly() {
    let (mut client, _broker, events) = connected(60).await;

    let started = Instant::now();
    client.loop_once(Duration::from_millis(250)).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(250));
    assert!(events.take().is_empty());
    assert_eq!(client.state(), ClientState::Connected);
}

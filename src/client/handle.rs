//! State shared between the network loop and client handles

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::codec::{Encoder, OutboundPacket, MAX_REMAINING_LENGTH};
use crate::error::{ClientError, Result};
use crate::protocol::{Packet, Publish, QoS, Subscribe, Subscription, Unsubscribe};
use crate::store::{Direction, Message, MessageState, MessageStore, StoredMessage};
use crate::topic::{validate_topic_filter, validate_topic_name};

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    /// Created, never connected
    New,
    /// Transport open, CONNECT queued, waiting for CONNACK
    Connecting,
    /// CONNACK accepted
    Connected,
    /// DISCONNECT queued, flushing before close
    Disconnecting,
    /// Transport closed
    Closed,
}

impl ClientState {
    /// True while a transport exists
    pub fn has_transport(self) -> bool {
        matches!(
            self,
            ClientState::Connecting | ClientState::Connected | ClientState::Disconnecting
        )
    }

    /// True while new requests may be queued
    pub fn can_send(self) -> bool {
        matches!(self, ClientState::Connecting | ClientState::Connected)
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientState::New => write!(f, "new"),
            ClientState::Connecting => write!(f, "connecting"),
            ClientState::Connected => write!(f, "connected"),
            ClientState::Disconnecting => write!(f, "disconnecting"),
            ClientState::Closed => write!(f, "closed"),
        }
    }
}

/// Connection state reachable from any thread
///
/// Each field has its own lock; none is held across an await point or a
/// handler callback.
pub(crate) struct Shared {
    pub(crate) client_id: String,
    encoder: Encoder,
    state: Mutex<ClientState>,
    out_queue: Mutex<VecDeque<OutboundPacket>>,
    pub(crate) store: Mutex<MessageStore>,
    pub(crate) last_msg_out: Mutex<Instant>,
    last_mid: Mutex<u16>,
    in_callback: AtomicBool,
    write_wakeup: Notify,
}

impl Shared {
    pub(crate) fn new(client_id: String) -> Self {
        Self {
            client_id,
            encoder: Encoder::new(),
            state: Mutex::new(ClientState::New),
            out_queue: Mutex::new(VecDeque::new()),
            store: Mutex::new(MessageStore::new()),
            last_msg_out: Mutex::new(Instant::now()),
            last_mid: Mutex::new(0),
            in_callback: AtomicBool::new(false),
            write_wakeup: Notify::new(),
        }
    }

    pub(crate) fn state(&self) -> ClientState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ClientState) {
        *self.state.lock() = state;
    }

    /// Next message id; wraps past 65535 and never yields 0
    pub(crate) fn next_mid(&self) -> u16 {
        let mut mid = self.last_mid.lock();
        *mid = mid.wrapping_add(1);
        if *mid == 0 {
            *mid = 1;
        }
        *mid
    }

    pub(crate) fn set_in_callback(&self, value: bool) {
        self.in_callback.store(value, Ordering::Release);
    }

    pub(crate) fn in_callback(&self) -> bool {
        self.in_callback.load(Ordering::Acquire)
    }

    pub(crate) fn write_wakeup(&self) -> &Notify {
        &self.write_wakeup
    }

    pub(crate) fn encode(&self, packet: &Packet) -> Result<OutboundPacket> {
        Ok(OutboundPacket::encode(&self.encoder, packet)?)
    }

    /// Append a packet to the outbound queue.
    ///
    /// The writer is woken unless a handler callback is running or `wake`
    /// is false; the loop then picks the packet up on its next write phase.
    pub(crate) fn queue(&self, packet: &Packet, wake: bool) -> Result<()> {
        let outbound = self.encode(packet)?;
        debug!("Client {} queued {}", self.client_id, describe(packet));
        self.push(outbound, wake);
        Ok(())
    }

    pub(crate) fn push(&self, outbound: OutboundPacket, wake: bool) {
        self.out_queue.lock().push_back(outbound);
        if wake && !self.in_callback() {
            self.write_wakeup.notify_one();
        }
    }

    /// Replace whatever is queued with `first`
    pub(crate) fn reset_queue(&self, first: OutboundPacket) {
        let mut queue = self.out_queue.lock();
        queue.clear();
        queue.push_back(first);
    }

    pub(crate) fn clear_queue(&self) {
        self.out_queue.lock().clear();
    }

    pub(crate) fn pop_outbound(&self) -> Option<OutboundPacket> {
        self.out_queue.lock().pop_front()
    }

    pub(crate) fn queued(&self) -> usize {
        self.out_queue.lock().len()
    }

    fn require_sendable(&self) -> Result<()> {
        if self.state().can_send() {
            Ok(())
        } else {
            Err(ClientError::NotConnected)
        }
    }
}

/// One-line packet summary for logs
pub(crate) fn describe(packet: &Packet) -> String {
    match packet {
        Packet::Publish(p) => format!(
            "PUBLISH (d{}, q{}, r{}, m{}, '{}', ... ({} bytes))",
            p.dup as u8,
            p.qos as u8,
            p.retain as u8,
            p.packet_id.unwrap_or(0),
            p.topic,
            p.payload.len()
        ),
        Packet::PubAck(p) => format!("PUBACK (Mid: {})", p.packet_id),
        Packet::PubRec(p) => format!("PUBREC (Mid: {})", p.packet_id),
        Packet::PubRel(p) => format!("PUBREL (Mid: {})", p.packet_id),
        Packet::PubComp(p) => format!("PUBCOMP (Mid: {})", p.packet_id),
        Packet::Subscribe(p) => format!("SUBSCRIBE (Mid: {})", p.packet_id),
        Packet::SubAck(p) => format!("SUBACK (Mid: {})", p.packet_id),
        Packet::Unsubscribe(p) => format!("UNSUBSCRIBE (Mid: {})", p.packet_id),
        Packet::UnsubAck(p) => format!("UNSUBACK (Mid: {})", p.packet_id),
        other => other.name().to_string(),
    }
}

/// Cloneable handle for issuing requests from any task, thread or callback
#[derive(Clone)]
pub struct ClientHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("client_id", &self.shared.client_id)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl ClientHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    pub fn state(&self) -> ClientState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state() == ClientState::Connected
    }

    /// Number of QoS 1/2 messages whose handshake has not finished
    pub fn inflight(&self) -> usize {
        self.shared.store.lock().len()
    }

    /// Publish a message and return its message id.
    ///
    /// QoS 0 is sent as is; QoS 1 and 2 are stored until acknowledged and
    /// retried while unacknowledged.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: u8,
        retain: bool,
    ) -> Result<u16> {
        let qos = QoS::from_u8(qos)
            .ok_or_else(|| ClientError::invalid(format!("invalid QoS {}", qos)))?;
        let payload = payload.into();
        if payload.len() > MAX_REMAINING_LENGTH {
            return Err(ClientError::PayloadTooLarge);
        }
        validate_topic_name(topic).map_err(ClientError::invalid)?;

        let id_len = if qos == QoS::AtMostOnce { 0 } else { 2 };
        if 2 + topic.len() + id_len + payload.len() > MAX_REMAINING_LENGTH {
            return Err(ClientError::PayloadTooLarge);
        }
        self.shared.require_sendable()?;

        let mid = self.shared.next_mid();
        let message = Message {
            mid,
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        };

        let publish = Packet::Publish(Publish {
            dup: false,
            qos,
            retain,
            topic: message.topic.clone(),
            packet_id: (qos != QoS::AtMostOnce).then_some(mid),
            payload: message.payload.clone(),
        });
        let outbound = self.shared.encode(&publish)?.with_mid(mid);
        debug!("Client {} queued {}", self.shared.client_id, describe(&publish));

        if qos != QoS::AtMostOnce {
            let state = if qos == QoS::AtLeastOnce {
                MessageState::WaitPubAck
            } else {
                MessageState::WaitPubRec
            };
            self.shared.store.lock().insert(StoredMessage::new(
                message,
                Direction::Out,
                state,
                Instant::now(),
            ));
        }

        self.shared.push(outbound, true);
        Ok(mid)
    }

    /// Subscribe to a topic filter and return the request's message id
    pub fn subscribe(&self, filter: &str, qos: u8) -> Result<u16> {
        let qos = QoS::from_u8(qos)
            .ok_or_else(|| ClientError::invalid(format!("invalid QoS {}", qos)))?;
        validate_topic_filter(filter).map_err(ClientError::invalid)?;
        self.shared.require_sendable()?;

        let mid = self.shared.next_mid();
        self.shared.queue(
            &Packet::Subscribe(Subscribe {
                packet_id: mid,
                subscriptions: vec![Subscription {
                    filter: filter.to_string(),
                    qos,
                }],
            }),
            true,
        )?;
        Ok(mid)
    }

    /// Unsubscribe from a topic filter and return the request's message id
    pub fn unsubscribe(&self, filter: &str) -> Result<u16> {
        validate_topic_filter(filter).map_err(ClientError::invalid)?;
        self.shared.require_sendable()?;

        let mid = self.shared.next_mid();
        self.shared.queue(
            &Packet::Unsubscribe(Unsubscribe {
                packet_id: mid,
                filters: vec![filter.to_string()],
            }),
            true,
        )?;
        Ok(mid)
    }

    /// Queue DISCONNECT; the loop closes the transport once it is written
    pub fn disconnect(&self) -> Result<()> {
        self.shared.require_sendable()?;
        self.shared.set_state(ClientState::Disconnecting);
        self.shared.queue(&Packet::Disconnect, true)
    }
}

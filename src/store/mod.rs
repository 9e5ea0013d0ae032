//! In-flight message store
//!
//! Tracks every QoS 1/2 publish whose handshake has not finished, in both
//! directions. Entries are keyed by (direction, message id) since each peer
//! assigns ids independently. An insertion sequence keeps retry order stable.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::protocol::{Packet, PubRec, PubRel, Publish, QoS};


/// Which peer assigned the message id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Received from the broker
    In,
    /// Published by this client
    Out,
}

/// Acknowledgment the message is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageState {
    WaitPubAck,
    WaitPubRec,
    WaitPubRel,
    WaitPubComp,
}

/// An application message as delivered to `on_message`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub mid: u16,
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl Message {
    pub fn from_publish(publish: Publish) -> Self {
        Self {
            mid: publish.packet_id.unwrap_or(0),
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
        }
    }
}

/// A message with its handshake progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub msg: Message,
    pub dup: bool,
    pub state: MessageState,
    pub direction: Direction,
    /// Last send attempt
    pub timestamp: Instant,
}

impl StoredMessage {
    pub fn new(msg: Message, direction: Direction, state: MessageState, now: Instant) -> Self {
        Self {
            msg,
            dup: false,
            state,
            direction,
            timestamp: now,
        }
    }

    pub fn mid(&self) -> u16 {
        self.msg.mid
    }

    /// PUBLISH packet carrying this message
    pub fn to_publish(&self) -> Publish {
        Publish {
            dup: self.dup,
            qos: self.msg.qos,
            retain: self.msg.retain,
            topic: self.msg.topic.clone(),
            packet_id: Some(self.msg.mid),
            payload: self.msg.payload.clone(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    msg: StoredMessage,
}

/// In-flight messages of one connection
#[derive(Debug, Default)]
pub struct MessageStore {
    entries: HashMap<(Direction, u16), Entry>,
    next_seq: u64,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a message; an entry with the same key is replaced
    pub fn insert(&mut self, msg: StoredMessage) -> Option<StoredMessage> {
        let key = (msg.direction, msg.mid());
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries
            .insert(key, Entry { seq, msg })
            .map(|old| old.msg)
    }

    pub fn get(&self, mid: u16, direction: Direction) -> Option<&StoredMessage> {
        self.entries.get(&(direction, mid)).map(|e| &e.msg)
    }

    pub fn contains(&self, mid: u16, direction: Direction) -> bool {
        self.entries.contains_key(&(direction, mid))
    }

    /// Move a message to `state` and refresh its timestamp.
    /// Returns false when no such message is stored.
    pub fn update(
        &mut self,
        mid: u16,
        direction: Direction,
        state: MessageState,
        now: Instant,
    ) -> bool {
        match self.entries.get_mut(&(direction, mid)) {
            Some(entry) => {
                entry.msg.state = state;
                entry.msg.timestamp = now;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, mid: u16, direction: Direction) -> Option<StoredMessage> {
        self.entries.remove(&(direction, mid)).map(|e| e.msg)
    }

    /// Remove a message only if it is waiting in `state`
    pub fn remove_in_state(
        &mut self,
        mid: u16,
        direction: Direction,
        state: MessageState,
    ) -> Option<StoredMessage> {
        let key = (direction, mid);
        match self.entries.get(&key) {
            Some(entry) if entry.msg.state == state => self.entries.remove(&key).map(|e| e.msg),
            _ => None,
        }
    }

    /// Messages in insertion order
    pub fn messages(&self) -> Vec<&StoredMessage> {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| &e.msg).collect()
    }

    /// Packets that re-drive every handshake idle for at least `interval`.
    /// Timestamps of the retried messages are set to `now`.
    pub fn retry(&mut self, now: Instant, interval: Duration) -> Vec<Packet> {
        let mut due: Vec<&mut Entry> = self
            .entries
            .values_mut()
            .filter(|e| now.saturating_duration_since(e.msg.timestamp) >= interval)
            .collect();
        due.sort_by_key(|e| e.seq);

        due.into_iter()
            .map(|entry| {
                let msg = &mut entry.msg;
                msg.timestamp = now;
                match msg.state {
                    MessageState::WaitPubAck | MessageState::WaitPubRec => {
                        msg.dup = true;
                        Packet::Publish(msg.to_publish())
                    }
                    MessageState::WaitPubRel => Packet::PubRec(PubRec::new(msg.mid())),
                    MessageState::WaitPubComp => Packet::PubRel(PubRel {
                        packet_id: msg.mid(),
                        dup: true,
                    }),
                }
            })
            .collect()
    }

    /// Drop every message
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

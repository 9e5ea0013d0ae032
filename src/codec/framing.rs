//! Incremental packet framing
//!
//! `InboundPacket` assembles one frame from whatever the transport hands
//! over: first the command byte, then the remaining length one byte at a
//! time, then the body. Partial progress survives between reads.
//! `OutboundPacket` is a fully encoded frame with a write cursor.

use bytes::{Bytes, BytesMut};

use super::{Encoder, MAX_REMAINING_LENGTH, MAX_REMAINING_LENGTH_BYTES};
use crate::protocol::{DecodeError, EncodeError, Packet, PacketType};

/// A complete inbound frame: command byte plus body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub command: u8,
    pub body: Bytes,
}

impl RawPacket {
    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_command(self.command)
    }

    pub fn remaining_length(&self) -> usize {
        self.body.len()
    }
}

/// Inbound frame under construction
#[derive(Debug)]
pub struct InboundPacket {
    command: Option<u8>,
    have_remaining: bool,
    remaining_count: usize,
    remaining_mult: u32,
    remaining_length: u32,
    payload: BytesMut,
    max_packet_size: usize,
}

impl Default for InboundPacket {
    fn default() -> Self {
        Self::new(MAX_REMAINING_LENGTH)
    }
}

impl InboundPacket {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            command: None,
            have_remaining: false,
            remaining_count: 0,
            remaining_mult: 1,
            remaining_length: 0,
            payload: BytesMut::new(),
            max_packet_size: max_packet_size.min(MAX_REMAINING_LENGTH),
        }
    }

    /// Drop any partial frame
    pub fn reset(&mut self) {
        self.command = None;
        self.have_remaining = false;
        self.remaining_count = 0;
        self.remaining_mult = 1;
        self.remaining_length = 0;
        self.payload.clear();
    }

    /// True when no byte of the next frame has been seen yet
    pub fn is_idle(&self) -> bool {
        self.command.is_none()
    }

    /// Command byte of the frame being assembled
    pub fn command(&self) -> Option<u8> {
        self.command
    }

    /// Declared body length, once the remaining-length field is complete
    pub fn remaining_length(&self) -> Option<u32> {
        self.have_remaining.then_some(self.remaining_length)
    }

    /// Body bytes received so far
    pub fn position(&self) -> usize {
        self.payload.len()
    }

    /// Consume bytes from `data`.
    ///
    /// Returns how many bytes were used and, when they completed a frame,
    /// that frame. Bytes past the end of the frame are left for the caller to
    /// feed again.
    pub fn feed(&mut self, data: &[u8]) -> Result<(usize, Option<RawPacket>), DecodeError> {
        let mut pos = 0;

        let command = match self.command {
            Some(command) => command,
            None => {
                let Some(&byte) = data.first() else {
                    return Ok((0, None));
                };
                self.command = Some(byte);
                pos += 1;
                byte
            }
        };

        if !self.have_remaining {
            while pos < data.len() {
                let byte = data[pos];
                pos += 1;

                self.remaining_count += 1;
                // Anything beyond 4 length bytes is a broken or malicious peer
                if self.remaining_count > MAX_REMAINING_LENGTH_BYTES {
                    return Err(DecodeError::InvalidRemainingLength);
                }

                self.remaining_length += (byte & 0x7F) as u32 * self.remaining_mult;
                self.remaining_mult = self.remaining_mult.saturating_mul(128);

                if (byte & 0x80) == 0 {
                    self.have_remaining = true;
                    break;
                }
            }

            if !self.have_remaining {
                return Ok((pos, None));
            }

            if self.remaining_length as usize > self.max_packet_size {
                return Err(DecodeError::PacketTooLarge);
            }
            self.payload.reserve(self.remaining_length as usize);
        }

        let needed = self.remaining_length as usize - self.payload.len();
        let take = needed.min(data.len() - pos);
        self.payload.extend_from_slice(&data[pos..pos + take]);
        pos += take;

        if self.payload.len() == self.remaining_length as usize {
            let body = self.payload.split().freeze();
            self.reset();
            return Ok((pos, Some(RawPacket { command, body })));
        }

        Ok((pos, None))
    }
}

/// Outbound frame with a write cursor
#[derive(Debug, Clone)]
pub struct OutboundPacket {
    data: Bytes,
    pos: usize,
    mid: Option<u16>,
}

impl OutboundPacket {
    /// Wrap an encoded frame
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            pos: 0,
            mid: None,
        }
    }

    /// Encode a packet; the packet identifier it carries becomes the frame's mid
    pub fn encode(encoder: &Encoder, packet: &Packet) -> Result<Self, EncodeError> {
        let mid = match packet {
            Packet::Publish(p) => p.packet_id,
            Packet::PubAck(p) => Some(p.packet_id),
            Packet::PubRec(p) => Some(p.packet_id),
            Packet::PubRel(p) => Some(p.packet_id),
            Packet::PubComp(p) => Some(p.packet_id),
            Packet::Subscribe(p) => Some(p.packet_id),
            Packet::SubAck(p) => Some(p.packet_id),
            Packet::Unsubscribe(p) => Some(p.packet_id),
            Packet::UnsubAck(p) => Some(p.packet_id),
            _ => None,
        };

        let buf = encoder.encode_to_vec(packet)?;
        Ok(Self {
            data: buf.freeze(),
            pos: 0,
            mid,
        })
    }

    /// Override the message id attached to this frame
    pub fn with_mid(mut self, mid: u16) -> Self {
        self.mid = Some(mid);
        self
    }

    pub fn command(&self) -> u8 {
        self.data.first().copied().unwrap_or(0)
    }

    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_command(self.command())
    }

    pub fn mid(&self) -> Option<u16> {
        self.mid
    }

    /// True for a PUBLISH with QoS 0 (no acknowledgment will follow)
    pub fn is_qos0_publish(&self) -> bool {
        (self.command() & 0xF6) == 0x30
    }

    /// Bytes not yet written
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    /// Record `n` bytes as written
    pub fn advance(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.data.len());
    }

    pub fn is_complete(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The whole frame, regardless of the cursor
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

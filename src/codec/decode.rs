//! MQTT Packet Decoder
//!
//! Decodes MQTT v3.1 / v3.1.1 packets. Every field read is bounded by the
//! packet's remaining length; reading past it is a decode error.

use bytes::Bytes;

use super::{read_binary, read_string, read_u16, read_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, ProtocolVersion, PubAck, PubComp,
    PubRec, PubRel, Publish, QoS, SubAck, Subscribe, Subscription, UnsubAck, Unsubscribe, Will,
};

/// MQTT Packet Decoder
#[derive(Debug, Clone)]
pub struct Decoder {
    /// Maximum packet size
    max_packet_size: usize,
    /// Validate exact remaining lengths and reserved flags
    strict: bool,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
            strict: false,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Decode a packet from the buffer
    /// Returns Ok(None) while the buffer does not yet hold a whole frame,
    /// otherwise (packet, bytes_consumed)
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let command = buf[0];

        // Read remaining length
        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = 1 + len_bytes + remaining_length as usize;

        // Wait for complete packet
        if buf.len() < total_len {
            return Ok(None);
        }

        let packet = self.decode_body(command, &buf[1 + len_bytes..total_len])?;
        Ok(Some((packet, total_len)))
    }

    /// Decode the variable header and payload of an already framed packet
    pub fn decode_body(&self, command: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        let packet_type = command >> 4;
        let flags = command & 0x0F;

        match packet_type {
            1 => self.decode_connect(flags, payload),
            2 => self.decode_connack(flags, payload),
            3 => self.decode_publish(flags, payload),
            4 => {
                let packet_id = self.decode_packet_id(flags, 0x00, payload)?;
                Ok(Packet::PubAck(PubAck { packet_id }))
            }
            5 => {
                let packet_id = self.decode_packet_id(flags, 0x00, payload)?;
                Ok(Packet::PubRec(PubRec { packet_id }))
            }
            6 => {
                // v3.1 peers may set DUP on a retransmitted PUBREL
                let dup = (flags & 0x08) != 0;
                let packet_id = self.decode_packet_id(flags & !0x08, 0x02, payload)?;
                Ok(Packet::PubRel(PubRel { packet_id, dup }))
            }
            7 => {
                let packet_id = self.decode_packet_id(flags, 0x00, payload)?;
                Ok(Packet::PubComp(PubComp { packet_id }))
            }
            8 => self.decode_subscribe(flags, payload),
            9 => self.decode_suback(flags, payload),
            10 => self.decode_unsubscribe(flags, payload),
            11 => {
                let packet_id = self.decode_packet_id(flags, 0x00, payload)?;
                Ok(Packet::UnsubAck(UnsubAck { packet_id }))
            }
            12 => {
                self.check_empty(flags, payload)?;
                Ok(Packet::PingReq)
            }
            13 => {
                self.check_empty(flags, payload)?;
                Ok(Packet::PingResp)
            }
            14 => {
                self.check_empty(flags, payload)?;
                Ok(Packet::Disconnect)
            }
            _ => Err(DecodeError::InvalidPacketType(packet_type)),
        }
    }

    fn check_flags(&self, flags: u8, expected: u8) -> Result<(), DecodeError> {
        if self.strict && flags != expected {
            return Err(DecodeError::InvalidFlags);
        }
        Ok(())
    }

    fn check_length(&self, payload: &[u8], expected: u32) -> Result<(), DecodeError> {
        if self.strict && payload.len() as u32 != expected {
            return Err(DecodeError::InvalidLength {
                expected,
                actual: payload.len() as u32,
            });
        }
        Ok(())
    }

    /// PINGREQ, PINGRESP and DISCONNECT carry no variable header
    fn check_empty(&self, flags: u8, payload: &[u8]) -> Result<(), DecodeError> {
        self.check_flags(flags, 0x00)?;
        self.check_length(payload, 0)
    }

    /// PUBACK, PUBREC, PUBREL, PUBCOMP and UNSUBACK carry only a packet id
    fn decode_packet_id(
        &self,
        flags: u8,
        expected_flags: u8,
        payload: &[u8],
    ) -> Result<u16, DecodeError> {
        self.check_flags(flags, expected_flags)?;
        self.check_length(payload, 2)?;
        read_u16(payload)
    }

    fn decode_connect(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        self.check_flags(flags, 0x00)?;

        let mut pos = 0;

        // Protocol name
        let (protocol_name, len) = read_string(payload)?;
        pos += len;

        // Protocol level
        let version_byte = *payload.get(pos).ok_or(DecodeError::InsufficientData)?;
        pos += 1;

        let protocol_version = match (protocol_name, version_byte) {
            ("MQIsdp", 3) => ProtocolVersion::V31,
            ("MQTT", 4) => ProtocolVersion::V311,
            ("MQIsdp", _) | ("MQTT", _) => {
                return Err(DecodeError::InvalidProtocolVersion(version_byte))
            }
            _ => return Err(DecodeError::InvalidProtocolName),
        };

        // Connect flags
        let connect_flags = *payload.get(pos).ok_or(DecodeError::InsufficientData)?;
        pos += 1;

        // Reserved bit must be 0
        if (connect_flags & 0x01) != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let clean_session = (connect_flags & 0x02) != 0;
        let will_flag = (connect_flags & 0x04) != 0;
        let will_qos_bits = (connect_flags >> 3) & 0x03;
        let will_retain = (connect_flags & 0x20) != 0;
        let password_flag = (connect_flags & 0x40) != 0;
        let username_flag = (connect_flags & 0x80) != 0;

        let will_qos = QoS::from_u8(will_qos_bits).ok_or(DecodeError::InvalidQoS(will_qos_bits))?;

        // Keep alive
        let keep_alive = read_u16(&payload[pos..])?;
        pos += 2;

        // Client ID
        let (client_id, len) = read_string(&payload[pos..])?;
        pos += len;

        let will = if will_flag {
            let (topic, len) = read_string(&payload[pos..])?;
            pos += len;
            let (will_payload, len) = read_binary(&payload[pos..])?;
            pos += len;

            Some(Will {
                topic: topic.to_string(),
                payload: Bytes::copy_from_slice(will_payload),
                qos: will_qos,
                retain: will_retain,
            })
        } else {
            None
        };

        let username = if username_flag {
            let (s, len) = read_string(&payload[pos..])?;
            pos += len;
            Some(s.to_string())
        } else {
            None
        };

        let password = if password_flag {
            let (data, _len) = read_binary(&payload[pos..])?;
            Some(Bytes::copy_from_slice(data))
        } else {
            None
        };

        Ok(Packet::Connect(Box::new(Connect {
            protocol_version,
            client_id: client_id.to_string(),
            clean_session,
            keep_alive,
            username,
            password,
            will,
        })))
    }

    fn decode_connack(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        self.check_flags(flags, 0x00)?;
        self.check_length(payload, 2)?;

        if payload.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }

        let acknowledge_flags = payload[0];
        // v3.1 leaves this byte reserved; v3.1.1 uses bit 0 for session present
        if self.strict && (acknowledge_flags & 0xFE) != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        Ok(Packet::ConnAck(ConnAck {
            session_present: (acknowledge_flags & 0x01) != 0,
            return_code: ConnectReturnCode::from_u8(payload[1]),
        }))
    }

    fn decode_publish(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        let dup = (flags & 0x08) != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let retain = (flags & 0x01) != 0;

        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

        if self.strict && qos == QoS::AtMostOnce && dup {
            return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
        }

        let mut pos = 0;

        // Topic name
        let (topic, len) = read_string(payload)?;
        pos += len;

        // No wildcards allowed in a topic name
        if topic.contains('+') || topic.contains('#') {
            return Err(DecodeError::MalformedPacket("topic contains wildcard"));
        }

        // Packet ID (only for QoS > 0)
        let packet_id = if qos != QoS::AtMostOnce {
            let id = read_u16(&payload[pos..])?;
            if self.strict && id == 0 {
                return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
            }
            pos += 2;
            Some(id)
        } else {
            None
        };

        // Payload (remainder)
        let message_payload = Bytes::copy_from_slice(&payload[pos..]);

        Ok(Packet::Publish(Publish {
            dup,
            qos,
            retain,
            topic: topic.to_string(),
            packet_id,
            payload: message_payload,
        }))
    }

    fn decode_subscribe(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        self.check_flags(flags, 0x02)?;

        let packet_id = read_u16(payload)?;
        let mut pos = 2;
        let mut subscriptions = Vec::new();

        while pos < payload.len() {
            let (filter, len) = read_string(&payload[pos..])?;
            pos += len;

            let qos_byte = *payload.get(pos).ok_or(DecodeError::InsufficientData)?;
            pos += 1;
            let qos = QoS::from_u8(qos_byte & 0x03).ok_or(DecodeError::InvalidQoS(qos_byte))?;

            subscriptions.push(Subscription {
                filter: filter.to_string(),
                qos,
            });
        }

        if subscriptions.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "SUBSCRIBE must contain at least one topic filter",
            ));
        }

        Ok(Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions,
        }))
    }

    fn decode_suback(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        self.check_flags(flags, 0x00)?;

        let packet_id = read_u16(payload)?;
        let granted_qos = payload[2..].to_vec();

        if self.strict && granted_qos.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "SUBACK must contain at least one return code",
            ));
        }

        Ok(Packet::SubAck(SubAck {
            packet_id,
            granted_qos,
        }))
    }

    fn decode_unsubscribe(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        self.check_flags(flags, 0x02)?;

        let packet_id = read_u16(payload)?;
        let mut pos = 2;
        let mut filters = Vec::new();

        while pos < payload.len() {
            let (filter, len) = read_string(&payload[pos..])?;
            pos += len;
            filters.push(filter.to_string());
        }

        if filters.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "UNSUBSCRIBE must contain at least one topic filter",
            ));
        }

        Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
    }
}

//! MQTT Packet Encoder
//!
//! Encodes MQTT v3.1 / v3.1.1 packets into fully materialized frames.

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, EncodeError, Packet, Publish, QoS, SubAck, Subscribe, Unsubscribe,
};

/// MQTT Packet Encoder
#[derive(Debug, Clone, Copy, Default)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a packet to the buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(p) => self.encode_connect(p, buf),
            Packet::ConnAck(p) => self.encode_connack(p, buf),
            Packet::Publish(p) => self.encode_publish(p, buf),
            Packet::PubAck(p) => self.encode_with_packet_id(0x40, p.packet_id, buf),
            Packet::PubRec(p) => self.encode_with_packet_id(0x50, p.packet_id, buf),
            Packet::PubRel(p) => {
                // PUBREL carries flags 0010; v3.1 also sets DUP on retransmission
                let command = if p.dup { 0x6A } else { 0x62 };
                self.encode_with_packet_id(command, p.packet_id, buf)
            }
            Packet::PubComp(p) => self.encode_with_packet_id(0x70, p.packet_id, buf),
            Packet::Subscribe(p) => self.encode_subscribe(p, buf),
            Packet::SubAck(p) => self.encode_suback(p, buf),
            Packet::Unsubscribe(p) => self.encode_unsubscribe(p, buf),
            Packet::UnsubAck(p) => self.encode_with_packet_id(0xB0, p.packet_id, buf),
            Packet::PingReq => {
                buf.put_u8(0xC0); // PINGREQ type + flags
                buf.put_u8(0x00); // Remaining length
                Ok(())
            }
            Packet::PingResp => {
                buf.put_u8(0xD0); // PINGRESP type + flags
                buf.put_u8(0x00); // Remaining length
                Ok(())
            }
            Packet::Disconnect => {
                buf.put_u8(0xE0); // DISCONNECT type + flags
                buf.put_u8(0x00); // Remaining length
                Ok(())
            }
        }
    }

    /// Encode a packet into a fresh buffer sized for it
    pub fn encode_to_vec(&self, packet: &Packet) -> Result<BytesMut, EncodeError> {
        let mut buf = BytesMut::new();
        self.encode(packet, &mut buf)?;
        Ok(buf)
    }

    fn encode_connect(&self, packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let protocol_name = packet.protocol_version.protocol_name();

        // Calculate remaining length
        let mut remaining_length = 0;

        // Protocol name + length prefix
        remaining_length += 2 + protocol_name.len();
        // Protocol level (1 byte)
        remaining_length += 1;
        // Connect flags (1 byte)
        remaining_length += 1;
        // Keep alive (2 bytes)
        remaining_length += 2;

        // Client ID
        remaining_length += 2 + packet.client_id.len();

        // Will message
        if let Some(ref will) = packet.will {
            remaining_length += 2 + will.topic.len();
            remaining_length += 2 + will.payload.len();
        }

        // Username, and password only alongside a username
        let password = packet.username.as_ref().and(packet.password.as_ref());
        if let Some(ref username) = packet.username {
            remaining_length += 2 + username.len();
        }
        if let Some(password) = password {
            remaining_length += 2 + password.len();
        }

        // Fixed header
        buf.reserve(1 + 4 + remaining_length);
        buf.put_u8(0x10); // CONNECT type + flags (0001 0000)
        write_variable_int(buf, remaining_length as u32)?;

        // Protocol name and level
        write_string(buf, protocol_name)?;
        buf.put_u8(packet.protocol_version as u8);

        // Connect flags
        let mut connect_flags: u8 = 0;
        if packet.clean_session {
            connect_flags |= 0x02;
        }
        if let Some(ref will) = packet.will {
            connect_flags |= 0x04;
            connect_flags |= (will.qos as u8) << 3;
            if will.retain {
                connect_flags |= 0x20;
            }
        }
        if password.is_some() {
            connect_flags |= 0x40;
        }
        if packet.username.is_some() {
            connect_flags |= 0x80;
        }
        buf.put_u8(connect_flags);

        // Keep alive
        buf.put_u16(packet.keep_alive);

        // Client ID
        write_string(buf, &packet.client_id)?;

        // Will message
        if let Some(ref will) = packet.will {
            write_string(buf, &will.topic)?;
            write_binary(buf, &will.payload)?;
        }

        if let Some(ref username) = packet.username {
            write_string(buf, username)?;
        }
        if let Some(password) = password {
            write_binary(buf, password)?;
        }

        Ok(())
    }

    fn encode_connack(&self, packet: &ConnAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(0x20); // CONNACK type + flags (0010 0000)
        buf.put_u8(0x02);
        buf.put_u8(if packet.session_present { 0x01 } else { 0x00 });
        buf.put_u8(packet.return_code.as_u8());
        Ok(())
    }

    fn encode_publish(&self, packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
        // Calculate remaining length
        let mut remaining_length = 2 + packet.topic.len(); // topic length prefix + topic

        if packet.qos != QoS::AtMostOnce {
            remaining_length += 2; // packet identifier
        }

        remaining_length += packet.payload.len();

        if remaining_length > MAX_REMAINING_LENGTH {
            return Err(EncodeError::PacketTooLarge);
        }

        // Fixed header
        let mut first_byte: u8 = 0x30; // PUBLISH type (0011)
        if packet.dup {
            first_byte |= 0x08;
        }
        first_byte |= (packet.qos as u8) << 1;
        if packet.retain {
            first_byte |= 0x01;
        }
        buf.reserve(1 + 4 + remaining_length);
        buf.put_u8(first_byte);
        write_variable_int(buf, remaining_length as u32)?;

        // Topic name
        write_string(buf, &packet.topic)?;

        // Packet identifier (only for QoS > 0)
        if packet.qos != QoS::AtMostOnce {
            buf.put_u16(packet.packet_id.unwrap_or(0));
        }

        // Payload
        buf.put_slice(&packet.payload);

        Ok(())
    }

    /// PUBACK, PUBREC, PUBREL, PUBCOMP and UNSUBACK share one layout
    fn encode_with_packet_id(
        &self,
        command: u8,
        packet_id: u16,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        buf.put_u8(command);
        buf.put_u8(0x02);
        buf.put_u16(packet_id);
        Ok(())
    }

    fn encode_subscribe(&self, packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
        // Calculate remaining length
        let mut remaining_length = 2; // packet identifier

        for sub in &packet.subscriptions {
            remaining_length += 2 + sub.filter.len() + 1; // string + requested QoS
        }

        // Fixed header
        buf.put_u8(0x82); // SUBSCRIBE type with flags 0010
        write_variable_int(buf, remaining_length as u32)?;

        // Packet identifier
        buf.put_u16(packet.packet_id);

        for sub in &packet.subscriptions {
            write_string(buf, &sub.filter)?;
            buf.put_u8(sub.qos as u8);
        }

        Ok(())
    }

    fn encode_suback(&self, packet: &SubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let remaining_length = 2 + packet.granted_qos.len();

        buf.put_u8(0x90); // SUBACK type + flags
        write_variable_int(buf, remaining_length as u32)?;
        buf.put_u16(packet.packet_id);
        buf.put_slice(&packet.granted_qos);

        Ok(())
    }

    fn encode_unsubscribe(
        &self,
        packet: &Unsubscribe,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        // Calculate remaining length
        let mut remaining_length = 2; // packet identifier

        for filter in &packet.filters {
            remaining_length += 2 + filter.len();
        }

        // Fixed header
        buf.put_u8(0xA2); // UNSUBSCRIBE type with flags 0010
        write_variable_int(buf, remaining_length as u32)?;

        // Packet identifier
        buf.put_u16(packet.packet_id);

        for filter in &packet.filters {
            write_string(buf, filter)?;
        }

        Ok(())
    }
}

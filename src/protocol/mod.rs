//! MQTT Protocol definitions and types
//!
//! Defines the core protocol types used by the MQTT v3.1 and v3.1.1 client.

mod error;
mod packet;

pub use error::{DecodeError, EncodeError, ProtocolError};
pub use packet::*;

/// MQTT Protocol Version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ProtocolVersion {
    /// MQTT v3.1 (protocol name "MQIsdp", level 3)
    V31 = 3,
    /// MQTT v3.1.1 (protocol name "MQTT", level 4)
    #[default]
    V311 = 4,
}

impl ProtocolVersion {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            3 => Some(ProtocolVersion::V31),
            4 => Some(ProtocolVersion::V311),
            _ => None,
        }
    }

    /// Protocol name carried in the CONNECT variable header
    pub fn protocol_name(self) -> &'static str {
        match self {
            ProtocolVersion::V31 => "MQIsdp",
            ProtocolVersion::V311 => "MQTT",
        }
    }

    /// Longest client identifier the protocol level guarantees to accept
    /// (None = unbounded)
    pub fn max_client_id_len(self) -> Option<usize> {
        match self {
            ProtocolVersion::V31 => Some(23),
            ProtocolVersion::V311 => None,
        }
    }
}

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

/// MQTT Packet Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(PacketType::Connect),
            2 => Some(PacketType::ConnAck),
            3 => Some(PacketType::Publish),
            4 => Some(PacketType::PubAck),
            5 => Some(PacketType::PubRec),
            6 => Some(PacketType::PubRel),
            7 => Some(PacketType::PubComp),
            8 => Some(PacketType::Subscribe),
            9 => Some(PacketType::SubAck),
            10 => Some(PacketType::Unsubscribe),
            11 => Some(PacketType::UnsubAck),
            12 => Some(PacketType::PingReq),
            13 => Some(PacketType::PingResp),
            14 => Some(PacketType::Disconnect),
            _ => None,
        }
    }

    /// Packet type encoded in the high nibble of a fixed-header command byte
    pub fn from_command(command: u8) -> Option<Self> {
        Self::from_u8(command >> 4)
    }
}

/// CONNACK return code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectReturnCode {
    /// 0: connection accepted
    Accepted,
    /// 1: the broker does not support the requested protocol level
    UnacceptableProtocolVersion,
    /// 2: client identifier rejected
    IdentifierRejected,
    /// 3: broker unavailable
    ServerUnavailable,
    /// 4-255: reserved / broker specific
    Reserved(u8),
}

impl ConnectReturnCode {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectReturnCode::Accepted,
            1 => ConnectReturnCode::UnacceptableProtocolVersion,
            2 => ConnectReturnCode::IdentifierRejected,
            3 => ConnectReturnCode::ServerUnavailable,
            other => ConnectReturnCode::Reserved(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            ConnectReturnCode::Accepted => 0,
            ConnectReturnCode::UnacceptableProtocolVersion => 1,
            ConnectReturnCode::IdentifierRejected => 2,
            ConnectReturnCode::ServerUnavailable => 3,
            ConnectReturnCode::Reserved(v) => v,
        }
    }

    pub fn is_accepted(self) -> bool {
        self == ConnectReturnCode::Accepted
    }
}

impl std::fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectReturnCode::Accepted => write!(f, "connection accepted"),
            ConnectReturnCode::UnacceptableProtocolVersion => {
                write!(f, "connection refused: unacceptable protocol version")
            }
            ConnectReturnCode::IdentifierRejected => {
                write!(f, "connection refused: identifier rejected")
            }
            ConnectReturnCode::ServerUnavailable => {
                write!(f, "connection refused: broker unavailable")
            }
            ConnectReturnCode::Reserved(code) => {
                write!(f, "connection refused: reserved code {}", code)
            }
        }
    }
}

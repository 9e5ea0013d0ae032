//! Connection options

use std::time::Duration;

use bytes::Bytes;

use crate::codec::MAX_REMAINING_LENGTH;
use crate::error::{ClientError, Result};
use crate::protocol::{ProtocolVersion, QoS, Will};
use crate::topic::validate_topic_name;
use crate::transport::{TlsConfig, TransportConfig};

/// Default broker port
pub const DEFAULT_PORT: u16 = 1883;

/// Default keepalive in seconds
pub const DEFAULT_KEEPALIVE: u16 = 60;

/// Default interval before an unacknowledged message is resent
pub const DEFAULT_MESSAGE_RETRY: Duration = Duration::from_secs(20);

/// Options that shape the CONNECT packet and the network loop
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub client_id: String,
    pub protocol_version: ProtocolVersion,
    pub keepalive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub will: Option<Will>,
    pub message_retry: Duration,
    /// Reject peers that pad fixed-length packets or misuse reserved flags
    pub strict_protocol: bool,
    /// Largest inbound remaining length accepted
    pub max_packet_size: usize,
    pub transport: TransportConfig,
    pub tls: Option<TlsConfig>,
}

impl ClientOptions {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            protocol_version: ProtocolVersion::default(),
            keepalive: DEFAULT_KEEPALIVE,
            clean_session: true,
            username: None,
            password: None,
            will: None,
            message_retry: DEFAULT_MESSAGE_RETRY,
            strict_protocol: false,
            max_packet_size: MAX_REMAINING_LENGTH,
            transport: TransportConfig::default(),
            tls: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() {
            return Err(ClientError::invalid("client id cannot be empty"));
        }
        if let Some(max) = self.protocol_version.max_client_id_len() {
            if self.client_id.len() > max {
                return Err(ClientError::invalid(format!(
                    "client id longer than {} bytes",
                    max
                )));
            }
        }
        if self.client_id.len() > 65535 {
            return Err(ClientError::invalid("client id too long"));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(ClientError::invalid("password set without username"));
        }
        if let Some(will) = &self.will {
            check_will(&will.topic, &will.payload)?;
        }
        Ok(())
    }
}

/// Build a will after checking it the way CONNECT needs it
pub(crate) fn make_will(topic: &str, payload: Bytes, qos: u8, retain: bool) -> Result<Will> {
    let qos = QoS::from_u8(qos).ok_or_else(|| ClientError::invalid(format!("invalid QoS {}", qos)))?;
    check_will(topic, &payload)?;
    Ok(Will {
        topic: topic.to_string(),
        payload,
        qos,
        retain,
    })
}

fn check_will(topic: &str, payload: &[u8]) -> Result<()> {
    validate_topic_name(topic).map_err(ClientError::invalid)?;
    if payload.len() > 65535 {
        return Err(ClientError::PayloadTooLarge);
    }
    Ok(())
}

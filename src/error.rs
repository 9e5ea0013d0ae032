//! Client error type

use std::fmt;
use std::io;

use crate::protocol::{ConnectReturnCode, DecodeError, EncodeError, ProtocolError};

/// Errors returned by client operations and the network loop
#[derive(Debug)]
pub enum ClientError {
    /// A caller-supplied argument was rejected before any state changed
    InvalidArgument(String),
    /// The operation needs a transport and there is none
    NotConnected,
    /// The peer closed the connection or it was reset
    ConnectionLost,
    /// The broker answered CONNECT with a non-zero return code
    ConnectionRefused(ConnectReturnCode),
    /// The peer sent something the protocol does not allow
    Protocol(ProtocolError),
    /// Payload does not fit in a single packet
    PayloadTooLarge,
    /// TLS setup or handshake failure
    Tls(String),
    /// Any other I/O failure
    Io(io::Error),
}

impl ClientError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        ClientError::InvalidArgument(msg.into())
    }

    pub(crate) fn violation(msg: &'static str) -> Self {
        ClientError::Protocol(ProtocolError::ProtocolViolation(msg))
    }

    /// True for failures that end the connection
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ClientError::InvalidArgument(_) | ClientError::NotConnected | ClientError::PayloadTooLarge
        )
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            ClientError::NotConnected => write!(f, "not connected"),
            ClientError::ConnectionLost => write!(f, "connection lost"),
            ClientError::ConnectionRefused(code) => write!(f, "{}", code),
            ClientError::Protocol(e) => write!(f, "protocol error: {}", e),
            ClientError::PayloadTooLarge => write!(f, "payload too large"),
            ClientError::Tls(msg) => write!(f, "TLS error: {}", msg),
            ClientError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Protocol(e) => Some(e),
            ClientError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => ClientError::ConnectionLost,
            _ => ClientError::Io(e),
        }
    }
}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Encode(EncodeError::PacketTooLarge) => ClientError::PayloadTooLarge,
            other => ClientError::Protocol(other),
        }
    }
}

impl From<DecodeError> for ClientError {
    fn from(e: DecodeError) -> Self {
        ClientError::Protocol(ProtocolError::Decode(e))
    }
}

impl From<EncodeError> for ClientError {
    fn from(e: EncodeError) -> Self {
        ProtocolError::Encode(e).into()
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, ClientError>;

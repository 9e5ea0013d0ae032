//! vibemq-client - MQTT v3.1/v3.1.1 client
//!
//! An asynchronous MQTT client core: packet codec, transports, in-flight
//! message store and the connection state machine, driven by a caller-run
//! network loop and reporting events through a `ClientHandler`.

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod library;
pub mod protocol;
pub mod store;
pub mod topic;
pub mod transport;

pub use client::{
    Client, ClientHandle, ClientHandler, ClientOptions, ClientState, NoopHandler,
};
pub use config::Config;
pub use error::{ClientError, Result};
pub use protocol::{ConnectReturnCode, ProtocolVersion, QoS};
pub use store::Message;
pub use transport::{Connector, TcpConnector, TlsConfig, TlsConnector, Transport};

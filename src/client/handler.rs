//! Application callbacks
//!
//! The network loop reports protocol events through a `ClientHandler`.
//! Callbacks run on the loop's task; packets queued from inside a callback
//! are written on the loop's next write phase.

use super::ClientHandle;
use crate::protocol::ConnectReturnCode;
use crate::store::Message;

/// Receives protocol events from the network loop
///
/// Every method has a no-op default.
pub trait ClientHandler: Send {
    /// CONNACK received
    ///
    /// # Arguments
    /// * `client` - Handle for issuing requests from the callback
    /// * `code` - Broker's return code; anything but `Accepted` ends the connection
    fn on_connect(&mut self, _client: &ClientHandle, _code: ConnectReturnCode) {}

    /// The transport was closed, gracefully or not
    fn on_disconnect(&mut self, _client: &ClientHandle) {}

    /// An outbound publish completed its handshake
    ///
    /// QoS 0 fires once the frame is written, QoS 1 on PUBACK, QoS 2 on PUBCOMP.
    fn on_publish(&mut self, _client: &ClientHandle, _mid: u16) {}

    /// An application message arrived
    fn on_message(&mut self, _client: &ClientHandle, _message: &Message) {}

    /// SUBACK received, with one granted QoS byte per requested filter
    fn on_subscribe(&mut self, _client: &ClientHandle, _mid: u16, _granted_qos: &[u8]) {}

    /// UNSUBACK received
    fn on_unsubscribe(&mut self, _client: &ClientHandle, _mid: u16) {}
}

/// Handler that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl ClientHandler for NoopHandler {}

impl<T: ClientHandler + ?Sized> ClientHandler for Box<T> {
    fn on_connect(&mut self, client: &ClientHandle, code: ConnectReturnCode) {
        (**self).on_connect(client, code)
    }

    fn on_disconnect(&mut self, client: &ClientHandle) {
        (**self).on_disconnect(client)
    }

    fn on_publish(&mut self, client: &ClientHandle, mid: u16) {
        (**self).on_publish(client, mid)
    }

    fn on_message(&mut self, client: &ClientHandle, message: &Message) {
        (**self).on_message(client, message)
    }

    fn on_subscribe(&mut self, client: &ClientHandle, mid: u16, granted_qos: &[u8]) {
        (**self).on_subscribe(client, mid, granted_qos)
    }

    fn on_unsubscribe(&mut self, client: &ClientHandle, mid: u16) {
        (**self).on_unsubscribe(client, mid)
    }
}

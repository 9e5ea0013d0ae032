//! MQTT client
//!
//! `Client` owns the transport and runs the network loop; `ClientHandle`
//! lets other tasks queue requests. The loop never reconnects on its own.
//!
//! A caller drives the loop with `loop_once` (or `loop_forever`), calling it
//! at least once per second so keepalive and message retry stay on time.

mod dispatch;
mod handle;
mod handler;
mod options;

#[cfg(test)]
mod tests;

pub use handle::{ClientHandle, ClientState};
pub use handler::{ClientHandler, NoopHandler};
pub use options::{ClientOptions, DEFAULT_KEEPALIVE, DEFAULT_MESSAGE_RETRY, DEFAULT_PORT};

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{split, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::codec::{Decoder, InboundPacket, OutboundPacket};
use crate::error::{ClientError, Result};
use crate::protocol::{Connect, Packet, PacketType};
use crate::transport::{Connector, TcpConnector, TlsConnector, Transport};
use handle::Shared;

type Reader = ReadHalf<Box<dyn Transport>>;
type Writer = WriteHalf<Box<dyn Transport>>;

const READ_BUFFER_SIZE: usize = 4096;

/// How often the retry sweep runs at most
const RETRY_CHECK_INTERVAL: Duration = Duration::from_secs(1);

enum IoEvent {
    Read(usize),
    Wrote(usize),
    Flushed,
    Wakeup,
    Timeout,
}

/// One MQTT connection and its network loop
pub struct Client {
    options: ClientOptions,
    shared: Arc<Shared>,
    handle: ClientHandle,
    handler: Box<dyn ClientHandler>,
    connector: Arc<dyn Connector>,
    decoder: Decoder,

    host: Option<String>,
    port: u16,

    reader: Option<Reader>,
    writer: Option<Writer>,
    read_buf: Vec<u8>,
    inbound: InboundPacket,
    /// Packet being written
    current: Option<OutboundPacket>,
    needs_flush: bool,
    /// DISCONNECT has been written; close after the flush
    closing: bool,

    last_msg_in: Instant,
    ping_sent: Option<Instant>,
    last_retry_check: Instant,
}

impl Client {
    /// Create a client; TLS is used when the options carry TLS settings
    pub fn new(options: ClientOptions, handler: impl ClientHandler + 'static) -> Result<Self> {
        options.validate()?;

        let connector: Arc<dyn Connector> = match &options.tls {
            Some(tls) => Arc::new(TlsConnector::new(options.transport.clone(), tls)?),
            None => Arc::new(TcpConnector::new(options.transport.clone())),
        };

        let shared = Arc::new(Shared::new(options.client_id.clone()));
        // Inbound size is capped by the framer, before a body is buffered
        let decoder = Decoder::new().with_strict(options.strict_protocol);
        let now = Instant::now();

        Ok(Self {
            handle: ClientHandle::new(shared.clone()),
            shared,
            handler: Box::new(handler),
            connector,
            decoder,
            host: None,
            port: DEFAULT_PORT,
            reader: None,
            writer: None,
            read_buf: vec![0u8; READ_BUFFER_SIZE],
            inbound: InboundPacket::new(options.max_packet_size),
            current: None,
            needs_flush: false,
            closing: false,
            last_msg_in: now,
            ping_sent: None,
            last_retry_check: now,
            options,
        })
    }

    /// Replace the connector used to open transports
    pub fn with_connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn state(&self) -> ClientState {
        self.shared.state()
    }

    fn has_transport(&self) -> bool {
        self.shared.state().has_transport()
    }

    /// Set the will sent with the next CONNECT
    pub fn set_will(
        &mut self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: u8,
        retain: bool,
    ) -> Result<()> {
        self.options.will = Some(options::make_will(topic, payload.into(), qos, retain)?);
        Ok(())
    }

    pub fn clear_will(&mut self) {
        self.options.will = None;
    }

    /// Set or clear credentials; a password is only sent with a username
    pub fn set_credentials(&mut self, username: Option<&str>, password: Option<&[u8]>) {
        match username {
            Some(username) => {
                self.options.username = Some(username.to_string());
                self.options.password = password.map(Bytes::copy_from_slice);
            }
            None => {
                self.options.username = None;
                self.options.password = None;
            }
        }
    }

    pub fn set_message_retry(&mut self, retry: Duration) {
        self.options.message_retry = retry;
    }

    /// Connect to a broker
    pub async fn connect(
        &mut self,
        host: &str,
        port: u16,
        keepalive: u16,
        clean_session: bool,
    ) -> Result<()> {
        if host.is_empty() {
            return Err(ClientError::invalid("host cannot be empty"));
        }
        if port == 0 {
            return Err(ClientError::invalid("port cannot be 0"));
        }

        self.host = Some(host.to_string());
        self.port = port;
        self.options.keepalive = keepalive;
        self.options.clean_session = clean_session;

        self.reconnect().await
    }

    /// Open a new transport to the stored broker and queue CONNECT
    pub async fn reconnect(&mut self) -> Result<()> {
        let host = self
            .host
            .clone()
            .ok_or_else(|| ClientError::invalid("no host set"))?;

        if self.has_transport() {
            self.close_transport();
            self.shared.set_state(ClientState::Closed);
        }

        let connect = Packet::Connect(Box::new(Connect {
            protocol_version: self.options.protocol_version,
            client_id: self.options.client_id.clone(),
            clean_session: self.options.clean_session,
            keep_alive: self.options.keepalive,
            username: self.options.username.clone(),
            password: self.options.password.clone(),
            will: self.options.will.clone(),
        }));
        let connect = self.shared.encode(&connect)?;

        info!(
            "Client {} connecting to {}:{}",
            self.options.client_id, host, self.port
        );
        let transport = self.connector.connect(&host, self.port).await?;
        let (reader, writer) = split(transport);
        self.reader = Some(reader);
        self.writer = Some(writer);

        let now = Instant::now();
        self.last_msg_in = now;
        self.last_retry_check = now;
        *self.shared.last_msg_out.lock() = now;

        if self.options.clean_session {
            self.shared.store.lock().clear();
        }

        debug!("Client {} sending CONNECT", self.options.client_id);
        self.shared.reset_queue(connect);
        self.shared.set_state(ClientState::Connecting);
        Ok(())
    }

    /// Publish a message; see [`ClientHandle::publish`]
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: u8,
        retain: bool,
    ) -> Result<u16> {
        self.handle.publish(topic, payload, qos, retain)
    }

    pub fn subscribe(&self, filter: &str, qos: u8) -> Result<u16> {
        self.handle.subscribe(filter, qos)
    }

    pub fn unsubscribe(&self, filter: &str) -> Result<u16> {
        self.handle.unsubscribe(filter)
    }

    /// Queue DISCONNECT; the loop closes the transport after writing it
    pub fn disconnect(&self) -> Result<()> {
        self.handle.disconnect()
    }

    /// Wait up to `timeout` for the transport to become readable or
    /// writable, service it, then run the periodic checks. A read is
    /// followed by whatever writing the transport accepts without waiting.
    pub async fn loop_once(&mut self, timeout: Duration) -> Result<()> {
        if !self.has_transport() {
            return Err(ClientError::NotConnected);
        }

        let mut result = self.poll_io(timeout).await;
        if result.is_ok() && self.has_transport() {
            result = self.misc(Instant::now());
        }
        self.finish(result)
    }

    /// Run the loop until the connection closes.
    /// Returns Ok after a graceful disconnect.
    pub async fn loop_forever(&mut self, timeout: Duration) -> Result<()> {
        loop {
            self.loop_once(timeout).await?;
            if !self.has_transport() {
                return Ok(());
            }
        }
    }

    /// Read once from the transport and handle every packet it completes
    pub async fn loop_read(&mut self) -> Result<()> {
        let result = self.read_once().await;
        self.finish(result)
    }

    /// Write out everything queued, then flush
    pub async fn loop_write(&mut self) -> Result<()> {
        let result = self.write_pending().await;
        self.finish(result)
    }

    /// Keepalive and message retry
    pub fn loop_misc(&mut self) -> Result<()> {
        if !self.has_transport() {
            return Err(ClientError::NotConnected);
        }
        let result = self.misc(Instant::now());
        self.finish(result)
    }

    async fn poll_io(&mut self, timeout: Duration) -> Result<()> {
        if self.current.is_none() && !self.closing {
            self.current = self.shared.pop_outbound();
        }

        let Self {
            reader,
            writer,
            read_buf,
            current,
            needs_flush,
            shared,
            ..
        } = &mut *self;
        let (Some(reader), Some(writer)) = (reader.as_mut(), writer.as_mut()) else {
            return Err(ClientError::NotConnected);
        };
        let pending: &[u8] = match current {
            Some(packet) => packet.remaining(),
            None => &[],
        };
        let can_write = !pending.is_empty() || *needs_flush;

        let event = tokio::select! {
            biased;
            res = reader.read(&mut read_buf[..]) => IoEvent::Read(res?),
            res = write_or_flush(writer, pending), if can_write => res?,
            _ = shared.write_wakeup().notified() => IoEvent::Wakeup,
            _ = sleep(timeout) => IoEvent::Timeout,
        };

        let write_after = matches!(event, IoEvent::Read(_) | IoEvent::Wakeup);
        let result = match event {
            IoEvent::Read(0) => Err(ClientError::ConnectionLost),
            IoEvent::Read(n) => self.process_read(n),
            IoEvent::Wrote(n) => {
                self.advance_write(n);
                Ok(())
            }
            IoEvent::Flushed => {
                self.needs_flush = false;
                if self.closing {
                    self.close_graceful();
                }
                Ok(())
            }
            IoEvent::Wakeup | IoEvent::Timeout => Ok(()),
        };

        if result.is_ok() && write_after && self.has_transport() {
            return self.write_ready().await;
        }
        result
    }

    /// Write whatever the transport accepts without waiting.
    /// Keeps outbound traffic moving while inbound data is backed up.
    async fn write_ready(&mut self) -> Result<()> {
        loop {
            if self.current.is_none() && !self.closing {
                self.current = self.shared.pop_outbound();
            }

            let Self {
                writer,
                current,
                needs_flush,
                ..
            } = &mut *self;
            let Some(writer) = writer.as_mut() else {
                return Ok(());
            };
            let pending: &[u8] = match current {
                Some(packet) => packet.remaining(),
                None => &[],
            };
            if pending.is_empty() && !*needs_flush {
                return Ok(());
            }

            let event = tokio::select! {
                biased;
                res = write_or_flush(writer, pending) => Some(res?),
                _ = std::future::ready(()) => None,
            };

            match event {
                Some(IoEvent::Wrote(n)) => self.advance_write(n),
                Some(IoEvent::Flushed) => {
                    self.needs_flush = false;
                    if self.closing {
                        self.close_graceful();
                    }
                    return Ok(());
                }
                _ => return Ok(()),
            }
        }
    }

    async fn read_once(&mut self) -> Result<()> {
        let reader = self.reader.as_mut().ok_or(ClientError::NotConnected)?;
        let n = reader.read(&mut self.read_buf[..]).await?;
        if n == 0 {
            return Err(ClientError::ConnectionLost);
        }
        self.process_read(n)
    }

    async fn write_pending(&mut self) -> Result<()> {
        loop {
            if self.current.is_none() && !self.closing {
                self.current = self.shared.pop_outbound();
            }
            let Some(packet) = self.current.as_ref() else {
                break;
            };
            let writer = self.writer.as_mut().ok_or(ClientError::NotConnected)?;
            let n = writer.write(packet.remaining()).await?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero).into());
            }
            self.advance_write(n);
        }

        if self.needs_flush {
            let writer = self.writer.as_mut().ok_or(ClientError::NotConnected)?;
            writer.flush().await?;
            self.needs_flush = false;
            if self.closing {
                self.close_graceful();
            }
        }
        Ok(())
    }

    /// Feed `n` freshly read bytes through the framer
    fn process_read(&mut self, n: usize) -> Result<()> {
        let mut offset = 0;
        while offset < n {
            let (used, raw) = self.inbound.feed(&self.read_buf[offset..n])?;
            offset += used;

            if let Some(raw) = raw {
                self.last_msg_in = Instant::now();
                self.handle_packet(raw)?;
            }
        }
        Ok(())
    }

    fn advance_write(&mut self, n: usize) {
        self.needs_flush = true;

        let Some(packet) = self.current.as_mut() else {
            return;
        };
        packet.advance(n);
        if !packet.is_complete() {
            return;
        }

        if let Some(packet) = self.current.take() {
            *self.shared.last_msg_out.lock() = Instant::now();

            if packet.is_qos0_publish() {
                if let Some(mid) = packet.mid() {
                    self.callback(|h, c| h.on_publish(c, mid));
                }
            } else if packet.packet_type() == Some(PacketType::Disconnect) {
                self.closing = true;
            }
        }
    }

    fn misc(&mut self, now: Instant) -> Result<()> {
        self.check_keepalive(now)?;

        if now.saturating_duration_since(self.last_retry_check) >= RETRY_CHECK_INTERVAL {
            self.last_retry_check = now;
            if self.shared.state() == ClientState::Connected {
                let packets = self
                    .shared
                    .store
                    .lock()
                    .retry(now, self.options.message_retry);
                for packet in packets {
                    debug!("Client {} retrying", self.options.client_id);
                    self.shared.queue(&packet, false)?;
                }
            }
        }
        Ok(())
    }

    fn check_keepalive(&mut self, now: Instant) -> Result<()> {
        if self.options.keepalive == 0 {
            return Ok(());
        }
        let keepalive = Duration::from_secs(self.options.keepalive as u64);

        if let Some(sent) = self.ping_sent {
            if now.saturating_duration_since(sent) >= keepalive {
                if now.saturating_duration_since(self.last_msg_in) >= keepalive {
                    warn!(
                        "Client {} has had no response to PINGREQ",
                        self.options.client_id
                    );
                    return Err(ClientError::ConnectionLost);
                }
                self.ping_sent = None;
            }
        }

        let last_out = *self.shared.last_msg_out.lock();
        if now.saturating_duration_since(last_out) >= keepalive {
            match self.shared.state() {
                ClientState::Connected => {
                    if self.ping_sent.is_none() {
                        self.shared.queue(&Packet::PingReq, false)?;
                        self.ping_sent = Some(now);
                    }
                }
                _ => return Err(ClientError::ConnectionLost),
            }
        }
        Ok(())
    }

    /// Run a handler callback with the in-callback flag set
    fn callback(&mut self, f: impl FnOnce(&mut Box<dyn ClientHandler>, &ClientHandle)) {
        self.shared.set_in_callback(true);
        f(&mut self.handler, &self.handle);
        self.shared.set_in_callback(false);
    }

    /// Close the transport after an error; a pending graceful disconnect
    /// turns the error into success
    fn finish(&mut self, result: Result<()>) -> Result<()> {
        let err = match result {
            Ok(()) => return Ok(()),
            Err(e) if !e.is_fatal() => return Err(e),
            Err(e) => e,
        };

        let graceful = self.shared.state() == ClientState::Disconnecting;
        if graceful {
            debug!("Client {} closed while disconnecting: {}", self.options.client_id, err);
        } else {
            warn!("Client {} connection closed: {}", self.options.client_id, err);
        }

        self.close_transport();
        self.shared.set_state(ClientState::Closed);
        self.callback(|h, c| h.on_disconnect(c));

        if graceful {
            Ok(())
        } else {
            Err(err)
        }
    }

    fn close_graceful(&mut self) {
        info!("Client {} disconnected", self.options.client_id);
        self.close_transport();
        self.shared.set_state(ClientState::Closed);
        self.callback(|h, c| h.on_disconnect(c));
    }

    /// Drop the transport and anything in flight on it.
    /// The message store survives so QoS 1/2 messages can be resent.
    fn close_transport(&mut self) {
        self.reader = None;
        self.writer = None;
        self.current = None;
        self.needs_flush = false;
        self.closing = false;
        self.ping_sent = None;
        self.inbound.reset();
        self.shared.clear_queue();
    }
}

async fn write_or_flush(writer: &mut Writer, pending: &[u8]) -> io::Result<IoEvent> {
    if pending.is_empty() {
        writer.flush().await?;
        return Ok(IoEvent::Flushed);
    }

    let n = writer.write(pending).await?;
    if n == 0 {
        return Err(io::Error::from(io::ErrorKind::WriteZero));
    }
    Ok(IoEvent::Wrote(n))
}

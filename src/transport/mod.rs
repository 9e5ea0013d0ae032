//! Transport Layer
//!
//! Opens the byte stream a client speaks MQTT over. Plain TCP and TLS are
//! provided; anything implementing `AsyncRead + AsyncWrite` can stand in.

mod tls;

pub use tls::{TlsConfig, TlsConnector};

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::{ClientError, Result};

/// Byte stream a connection runs over
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Opens transports to a broker
#[async_trait]
pub trait Connector: Send + Sync {
    /// Resolve `host` and open a stream to `port`
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn Transport>>;
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// TCP nodelay
    pub tcp_nodelay: bool,
    /// TCP keepalive
    pub tcp_keepalive: Option<Duration>,
    /// Socket receive buffer size
    pub recv_buffer_size: Option<usize>,
    /// Socket send buffer size
    pub send_buffer_size: Option<usize>,
    /// Bound on resolution plus connect
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            tcp_keepalive: Some(Duration::from_secs(60)),
            recv_buffer_size: None,
            send_buffer_size: None,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Configure a TCP stream
pub fn configure_stream(stream: &TcpStream, config: &TransportConfig) -> io::Result<()> {
    let sock = SockRef::from(stream);
    sock.set_nodelay(config.tcp_nodelay)?;

    if let Some(idle) = config.tcp_keepalive {
        sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
    }
    if let Some(size) = config.recv_buffer_size {
        sock.set_recv_buffer_size(size)?;
    }
    if let Some(size) = config.send_buffer_size {
        sock.set_send_buffer_size(size)?;
    }

    Ok(())
}

/// Plain TCP connector
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    config: TransportConfig,
}

impl TcpConnector {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Resolve and connect, trying every resolved address in order
    pub async fn connect_tcp(&self, host: &str, port: u16) -> Result<TcpStream> {
        let stream = timeout(self.config.connect_timeout, try_connect(host, port))
            .await
            .map_err(|_| {
                ClientError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {}:{} timed out", host, port),
                ))
            })??;

        configure_stream(&stream, &self.config)?;
        Ok(stream)
    }
}

async fn try_connect(host: &str, port: u16) -> io::Result<TcpStream> {
    let mut last_err = None;

    for addr in lookup_host((host, port)).await? {
        trace!("trying {}", addr);
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                debug!("TCP connected to {}", addr);
                return Ok(stream);
            }
            Err(e) => {
                debug!("connect to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} did not resolve to any address", host),
        )
    }))
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn Transport>> {
        let stream = self.connect_tcp(host, port).await?;
        Ok(Box::new(stream))
    }
}

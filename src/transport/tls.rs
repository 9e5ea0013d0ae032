//! TLS connector
//!
//! Loads the CA bundle (and optionally a client certificate) from PEM files
//! and wraps a TCP connection in a rustls client session.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tracing::debug;

use super::{Connector, TcpConnector, Transport, TransportConfig};
use crate::error::{ClientError, Result};

/// TLS settings for a client connection
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// CA certificates used to verify the broker (PEM)
    pub ca_file: Option<PathBuf>,
    /// Client certificate chain (PEM)
    pub cert_file: Option<PathBuf>,
    /// Client private key (PEM)
    pub key_file: Option<PathBuf>,
    /// Name to verify the broker certificate against; defaults to the host
    pub server_name: Option<String>,
}

fn tls_error(msg: String) -> ClientError {
    ClientError::Tls(msg)
}

/// Load certificates from a PEM file
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_reader_iter(reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| tls_error(format!("failed to parse certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(tls_error(format!(
            "no certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}

/// Load private key from a PEM file
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    PrivateKeyDer::from_pem_reader(reader)
        .map_err(|e| tls_error(format!("failed to parse private key: {}", e)))
}

/// Load CA certificates into a root store
fn load_ca_certs(path: &Path) -> Result<RootCertStore> {
    let mut root_store = RootCertStore::empty();

    for cert in load_certs(path)? {
        root_store
            .add(cert)
            .map_err(|e| tls_error(format!("failed to add CA certificate: {}", e)))?;
    }

    Ok(root_store)
}

/// Build a rustls client configuration
pub fn load_client_config(config: &TlsConfig) -> Result<ClientConfig> {
    let ca_file = config
        .ca_file
        .as_ref()
        .ok_or_else(|| tls_error("a CA file is required for TLS".to_string()))?;
    let root_store = load_ca_certs(ca_file)?;

    let builder = ClientConfig::builder().with_root_certificates(root_store);

    let client_config = match (&config.cert_file, &config.key_file) {
        (Some(cert), Some(key)) => {
            let certs = load_certs(cert)?;
            let key = load_private_key(key)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| tls_error(format!("failed to build TLS config: {}", e)))?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(tls_error(
                "cert_file and key_file must be set together".to_string(),
            ))
        }
    };

    Ok(client_config)
}

/// TCP connector that completes a TLS handshake before handing over the stream
#[derive(Clone)]
pub struct TlsConnector {
    tcp: TcpConnector,
    connector: tokio_rustls::TlsConnector,
    server_name: Option<String>,
}

impl std::fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnector")
            .field("tcp", &self.tcp)
            .field("server_name", &self.server_name)
            .finish()
    }
}

impl TlsConnector {
    pub fn new(transport: TransportConfig, tls: &TlsConfig) -> Result<Self> {
        let client_config = load_client_config(tls)?;
        Ok(Self {
            tcp: TcpConnector::new(transport),
            connector: tokio_rustls::TlsConnector::from(Arc::new(client_config)),
            server_name: tls.server_name.clone(),
        })
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn Transport>> {
        let name = self.server_name.as_deref().unwrap_or(host).to_string();
        let server_name = ServerName::try_from(name)
            .map_err(|e| tls_error(format!("invalid server name: {}", e)))?;

        let stream = self.tcp.connect_tcp(host, port).await?;
        let tls_stream = self
            .connector
            .connect(server_name, stream)
            .await
            .map_err(|e| tls_error(format!("handshake failed: {}", e)))?;

        debug!("TLS session established with {}:{}", host, port);
        Ok(Box::new(tls_stream))
    }
}

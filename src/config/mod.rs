//! Configuration Module
//!
//! TOML-based configuration for the command-line client:
//! - Broker address
//! - Client identity, session and protocol options
//! - Credentials and will message
//! - Socket and TLS settings
//! - Environment variable overrides (VIBEMQ_CLIENT__* prefix)

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::client::{ClientOptions, DEFAULT_KEEPALIVE, DEFAULT_PORT};
use crate::codec::MAX_REMAINING_LENGTH;
use crate::protocol::{ProtocolVersion, QoS, Will};
use crate::transport::{TlsConfig, TransportConfig};


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Broker to connect to
    pub broker: BrokerConfig,
    /// Client identity and session behaviour
    pub client: ClientConfig,
    /// Credentials
    pub auth: AuthConfig,
    /// Will message registered with CONNECT
    pub will: Option<WillConfig>,
    /// Socket options
    pub transport: TransportSection,
    /// TLS (enabled when the section is present)
    pub tls: Option<TlsSection>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Broker address
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Client identity and session options
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Client identifier (default: "vibemq-client-<pid>")
    #[serde(default = "default_client_id")]
    pub id: String,
    /// Protocol level: 3 (MQTT v3.1) or 4 (MQTT v3.1.1)
    #[serde(default = "default_protocol_level")]
    pub protocol_level: u8,
    /// Keepalive in seconds (0 disables keepalive)
    #[serde(default = "default_keepalive")]
    pub keepalive: u16,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    /// Seconds before an unacknowledged QoS 1/2 message is resent
    #[serde(default = "default_message_retry")]
    pub message_retry: u64,
    /// Reject malformed fixed-length packets and reserved flag misuse
    #[serde(default)]
    pub strict_protocol: bool,
    /// Largest inbound packet accepted, in bytes of remaining length
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

fn default_client_id() -> String {
    format!("vibemq-client-{}", std::process::id())
}

fn default_protocol_level() -> u8 {
    ProtocolVersion::V311 as u8
}

fn default_keepalive() -> u16 {
    DEFAULT_KEEPALIVE
}

fn default_true() -> bool {
    true
}

fn default_message_retry() -> u64 {
    20
}

fn default_max_packet_size() -> usize {
    MAX_REMAINING_LENGTH
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            id: default_client_id(),
            protocol_level: default_protocol_level(),
            keepalive: default_keepalive(),
            clean_session: true,
            message_retry: default_message_retry(),
            strict_protocol: false,
            max_packet_size: default_max_packet_size(),
        }
    }
}

/// Username and password sent with CONNECT
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Will message
#[derive(Debug, Clone, Deserialize)]
pub struct WillConfig {
    pub topic: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
}

/// Socket options
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    #[serde(default = "default_true")]
    pub tcp_nodelay: bool,
    /// TCP keepalive idle time in seconds (0 = disabled)
    #[serde(default = "default_tcp_keepalive")]
    pub tcp_keepalive: u64,
    pub recv_buffer_size: Option<usize>,
    pub send_buffer_size: Option<usize>,
    /// Seconds allowed for resolution plus connect
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

fn default_tcp_keepalive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    30
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            tcp_keepalive: default_tcp_keepalive(),
            recv_buffer_size: None,
            send_buffer_size: None,
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// TLS settings
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TlsSection {
    /// CA certificate file used to verify the broker (PEM, required)
    pub ca_file: Option<PathBuf>,
    /// Client certificate chain (PEM, optional)
    pub cert_file: Option<PathBuf>,
    /// Client private key (PEM, required with cert_file)
    pub key_file: Option<PathBuf>,
    /// Name checked against the broker certificate (default: broker host)
    pub server_name: Option<String>,
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports:
    /// - `${VAR}` and `${VAR:-default}` substitution in the TOML file
    /// - `VIBEMQ_CLIENT__SECTION__KEY` overrides (e.g. `VIBEMQ_CLIENT__BROKER__HOST`)
    ///
    /// A missing file leaves the defaults in place.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("broker.host", "localhost")?
            .set_default("broker.port", DEFAULT_PORT as i64)?
            .set_default("client.id", default_client_id())?
            .set_default("client.protocol_level", default_protocol_level() as i64)?
            .set_default("client.keepalive", DEFAULT_KEEPALIVE as i64)?
            .set_default("client.clean_session", true)?
            .set_default("client.message_retry", default_message_retry())?
            .set_default("client.strict_protocol", false)?
            .set_default("client.max_packet_size", MAX_REMAINING_LENGTH as u64)?
            .set_default("transport.tcp_nodelay", true)?
            .set_default("transport.tcp_keepalive", default_tcp_keepalive())?
            .set_default("transport.connect_timeout", default_connect_timeout())?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore stays in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("VIBEMQ_CLIENT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration from defaults and environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.is_empty() {
            return Err(ConfigError::Validation(
                "broker.host cannot be empty".to_string(),
            ));
        }
        if self.broker.port == 0 {
            return Err(ConfigError::Validation(
                "broker.port cannot be 0".to_string(),
            ));
        }
        if ProtocolVersion::from_u8(self.client.protocol_level).is_none() {
            return Err(ConfigError::Validation(
                "client.protocol_level must be 3 or 4".to_string(),
            ));
        }
        if self.client.max_packet_size == 0 || self.client.max_packet_size > MAX_REMAINING_LENGTH
        {
            return Err(ConfigError::Validation(format!(
                "client.max_packet_size must be between 1 and {}",
                MAX_REMAINING_LENGTH
            )));
        }
        if let Some(will) = &self.will {
            if will.qos > 2 {
                return Err(ConfigError::Validation(
                    "will.qos must be 0, 1, or 2".to_string(),
                ));
            }
        }
        if let Some(tls) = &self.tls {
            if tls.ca_file.is_none() {
                return Err(ConfigError::Validation(
                    "tls.ca_file is required".to_string(),
                ));
            }
            if tls.cert_file.is_some() != tls.key_file.is_some() {
                return Err(ConfigError::Validation(
                    "tls.cert_file and tls.key_file must be set together".to_string(),
                ));
            }
        }

        self.client_options()?;
        Ok(())
    }

    /// Build client options from this configuration
    pub fn client_options(&self) -> Result<ClientOptions, ConfigError> {
        let protocol_version = ProtocolVersion::from_u8(self.client.protocol_level)
            .ok_or_else(|| {
                ConfigError::Validation("client.protocol_level must be 3 or 4".to_string())
            })?;

        let will = match &self.will {
            Some(will) => Some(Will {
                topic: will.topic.clone(),
                payload: Bytes::from(will.payload.clone()),
                qos: QoS::from_u8(will.qos).ok_or_else(|| {
                    ConfigError::Validation("will.qos must be 0, 1, or 2".to_string())
                })?,
                retain: will.retain,
            }),
            None => None,
        };

        let transport = TransportConfig {
            tcp_nodelay: self.transport.tcp_nodelay,
            tcp_keepalive: (self.transport.tcp_keepalive > 0)
                .then(|| Duration::from_secs(self.transport.tcp_keepalive)),
            recv_buffer_size: self.transport.recv_buffer_size,
            send_buffer_size: self.transport.send_buffer_size,
            connect_timeout: Duration::from_secs(self.transport.connect_timeout),
        };

        let tls = self.tls.as_ref().map(|tls| TlsConfig {
            ca_file: tls.ca_file.clone(),
            cert_file: tls.cert_file.clone(),
            key_file: tls.key_file.clone(),
            server_name: tls.server_name.clone(),
        });

        let mut options = ClientOptions::new(self.client.id.clone());
        options.protocol_version = protocol_version;
        options.keepalive = self.client.keepalive;
        options.clean_session = self.client.clean_session;
        options.username = self.auth.username.clone();
        options.password = self.auth.password.clone().map(Bytes::from);
        options.will = will;
        options.message_retry = Duration::from_secs(self.client.message_retry);
        options.strict_protocol = self.client.strict_protocol;
        options.max_packet_size = self.client.max_packet_size;
        options.transport = transport;
        options.tls = tls;

        options
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        Ok(options)
    }
}

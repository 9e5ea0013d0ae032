//! vibemq-client - MQTT v3.1/v3.1.1 command-line client
//!
//! Usage:
//!   vibemq-client [OPTIONS] pub -t <TOPIC> -m <MESSAGE>
//!   vibemq-client [OPTIONS] sub -t <FILTER>...
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -H, --host <HOST>      Broker host (default: localhost)
//!   -p, --port <PORT>      Broker port (default: 1883)
//!   -i, --id <ID>          Client identifier
//!   -k, --keepalive <SECS> Keepalive interval (default: 60)
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use vibemq_client::config::Config;
use vibemq_client::protocol::{ConnectReturnCode, ProtocolVersion};
use vibemq_client::store::Message;
use vibemq_client::{library, Client, ClientError, ClientHandle, ClientHandler};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    #[default]
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Warn,
        }
    }
}

/// vibemq-client - MQTT v3.1/v3.1.1 client
#[derive(Parser, Debug)]
#[command(name = "vibemq-client")]
#[command(author = "VibeMQ Contributors")]
#[command(version)]
#[command(about = "MQTT v3.1/v3.1.1 command-line client")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Broker host
    #[arg(short = 'H', long, global = true)]
    host: Option<String>,

    /// Broker port
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Client identifier
    #[arg(short, long, global = true)]
    id: Option<String>,

    /// Keepalive in seconds (0 disables)
    #[arg(short, long, global = true)]
    keepalive: Option<u16>,

    /// Username
    #[arg(short, long, global = true)]
    username: Option<String>,

    /// Password (requires a username)
    #[arg(short = 'P', long, global = true)]
    password: Option<String>,

    /// Speak MQTT v3.1 instead of v3.1.1
    #[arg(long, global = true)]
    v31: bool,

    /// Keep the session when disconnecting
    #[arg(long, global = true)]
    no_clean_session: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum, global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish one message and exit once it is acknowledged
    Pub {
        /// Topic to publish to
        #[arg(short, long)]
        topic: String,

        /// Message payload
        #[arg(short, long, default_value = "")]
        message: String,

        /// QoS level (0, 1, or 2)
        #[arg(short, long, default_value_t = 0)]
        qos: u8,

        /// Ask the broker to retain the message
        #[arg(short, long)]
        retain: bool,
    },
    /// Subscribe and print every message as "topic payload"
    Sub {
        /// Topic filters to subscribe to
        #[arg(short, long, required = true)]
        topic: Vec<String>,

        /// QoS level (0, 1, or 2)
        #[arg(short, long, default_value_t = 0)]
        qos: u8,

        /// Exit after this many messages
        #[arg(short = 'C', long)]
        count: Option<usize>,
    },
}

/// Events the CLI waits on
#[derive(Debug)]
enum CliEvent {
    Connected,
    Published(u16),
    Message,
}

struct CliHandler {
    tx: mpsc::UnboundedSender<CliEvent>,
    /// Filters subscribed once the broker accepts the connection
    subscriptions: Vec<String>,
    qos: u8,
}

impl ClientHandler for CliHandler {
    fn on_connect(&mut self, client: &ClientHandle, code: ConnectReturnCode) {
        if !code.is_accepted() {
            eprintln!("Connection refused: {}", code);
            return;
        }
        for filter in &self.subscriptions {
            if let Err(e) = client.subscribe(filter, self.qos) {
                eprintln!("Error subscribing to {}: {}", filter, e);
            }
        }
        let _ = self.tx.send(CliEvent::Connected);
    }

    fn on_publish(&mut self, _client: &ClientHandle, mid: u16) {
        let _ = self.tx.send(CliEvent::Published(mid));
    }

    fn on_message(&mut self, _client: &ClientHandle, message: &Message) {
        println!(
            "{} {}",
            message.topic,
            String::from_utf8_lossy(&message.payload)
        );
        let _ = self.tx.send(CliEvent::Message);
    }

    fn on_subscribe(&mut self, _client: &ClientHandle, mid: u16, granted_qos: &[u8]) {
        info!("Subscribed (Mid: {}, granted: {:?})", mid, granted_qos);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise defaults plus environment
    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let mut file_config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config file: {}", e);
            std::process::exit(1);
        }
    };

    // Setup logging - CLI overrides config, config overrides default (warn)
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&file_config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    // CLI args override file config
    if let Some(host) = args.host.clone() {
        file_config.broker.host = host;
    }
    if let Some(port) = args.port {
        file_config.broker.port = port;
    }
    if let Some(id) = args.id.clone() {
        file_config.client.id = id;
    }
    if let Some(keepalive) = args.keepalive {
        file_config.client.keepalive = keepalive;
    }
    if args.username.is_some() {
        file_config.auth.username = args.username.clone();
        file_config.auth.password = args.password.clone();
    }
    if args.v31 {
        file_config.client.protocol_level = ProtocolVersion::V31 as u8;
    }
    if args.no_clean_session {
        file_config.client.clean_session = false;
    }

    if let Err(e) = file_config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }
    let options = file_config.client_options()?;

    let (subscriptions, sub_qos) = match &args.command {
        Command::Sub { topic, qos, .. } => (topic.clone(), *qos),
        Command::Pub { .. } => (Vec::new(), 0),
    };

    library::init();
    let (tx, mut events) = mpsc::unbounded_channel();
    let mut client = Client::new(
        options,
        CliHandler {
            tx,
            subscriptions,
            qos: sub_qos,
        },
    )?;

    info!(
        "Connecting to {}:{} as {}",
        file_config.broker.host, file_config.broker.port, file_config.client.id
    );
    client
        .connect(
            &file_config.broker.host,
            file_config.broker.port,
            file_config.client.keepalive,
            file_config.client.clean_session,
        )
        .await?;

    let handle = client.handle();
    let mut network = tokio::spawn(async move { client.loop_forever(Duration::from_secs(1)).await });

    let outcome = tokio::select! {
        res = drive(&args.command, &handle, &mut events) => res,
        res = &mut network => {
            // The loop ended before the command finished
            let res = res?;
            library::cleanup();
            return match res {
                Ok(()) => Ok(()),
                Err(e) => {
                    eprintln!("Connection closed: {}", e);
                    std::process::exit(1);
                }
            };
        }
    };

    if let Err(e) = outcome {
        eprintln!("Error: {}", e);
    }
    if handle.disconnect().is_ok() {
        let _ = network.await?;
    }
    library::cleanup();
    Ok(())
}

/// Run a subcommand against a connected client
async fn drive(
    command: &Command,
    handle: &ClientHandle,
    events: &mut mpsc::UnboundedReceiver<CliEvent>,
) -> Result<(), ClientError> {
    // Wait for CONNACK
    loop {
        match events.recv().await {
            Some(CliEvent::Connected) => break,
            Some(_) => continue,
            None => return Err(ClientError::ConnectionLost),
        }
    }

    match command {
        Command::Pub {
            topic,
            message,
            qos,
            retain,
        } => {
            let mid = handle.publish(topic, message.clone().into_bytes(), *qos, *retain)?;
            loop {
                match events.recv().await {
                    Some(CliEvent::Published(done)) if done == mid => return Ok(()),
                    Some(_) => continue,
                    None => return Err(ClientError::ConnectionLost),
                }
            }
        }
        Command::Sub { count, .. } => {
            let mut received = 0usize;
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(CliEvent::Message) => {
                            received += 1;
                            if matches!(count, Some(limit) if received >= *limit) {
                                return Ok(());
                            }
                        }
                        Some(_) => {}
                        None => return Err(ClientError::ConnectionLost),
                    },
                    _ = tokio::signal::ctrl_c() => {
                        info!("Interrupted, disconnecting");
                        return Ok(());
                    }
                }
            }
        }
    }
}

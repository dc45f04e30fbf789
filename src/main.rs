//! mqrelay - lightweight MQTT 3.1.1 relay broker
//!
//! Usage:
//!   mqrelay [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>              Configuration file path
//!   -b, --bind <ADDR>                Bind address (default: 0.0.0.0:1883)
//!   --max-packet-size <N>            Maximum packet size (default: 268435455)
//!   --outbound-queue-capacity <N>    Per-connection outbound queue (default: 1000)
//!   --inbox-capacity <N>             Broker receive queue (default: 10000)
//!   -l, --log-level                  Log level (error, warn, info, debug, trace)
//!   -h, --help                       Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use mqrelay::broker::Broker;
use mqrelay::config::Config;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
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
}

/// mqrelay - MQTT 3.1.1 relay broker
#[derive(Parser, Debug)]
#[command(name = "mqrelay")]
#[command(version)]
#[command(about = "Lightweight MQTT 3.1.1 relay broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Maximum packet size in bytes
    #[arg(long)]
    max_packet_size: Option<usize>,

    /// Per-connection outbound queue capacity
    #[arg(long)]
    outbound_queue_capacity: Option<usize>,

    /// Capacity of the queue of client messages delivered to the broker
    #[arg(long)]
    inbox_capacity: Option<usize>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise defaults plus env overrides
    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let mut file_config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // CLI overrides config, config overrides default (info)
    let log_level = args.log_level.unwrap_or_else(|| {
        match file_config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    if let Some(bind) = args.bind {
        file_config.server.bind = bind;
    }
    if let Some(size) = args.max_packet_size {
        file_config.limits.max_packet_size = size;
    }
    if let Some(capacity) = args.outbound_queue_capacity {
        file_config.limits.outbound_queue_capacity = capacity;
    }
    if let Some(capacity) = args.inbox_capacity {
        file_config.limits.inbox_capacity = capacity;
    }
    if let Err(e) = file_config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let broker = Arc::new(Broker::new(file_config.broker_config()));
    let settings = broker.config();

    info!("Starting mqrelay MQTT broker");
    info!("  Bind address: {}", settings.bind_addr);
    info!("  Max packet size: {} bytes", settings.max_packet_size);
    info!("  Outbound queue capacity: {}", settings.outbound_queue_capacity);
    info!("  Inbox capacity: {}", settings.inbox_capacity);
    if settings.prune_on_disconnect {
        info!("  Subscriptions pruned on disconnect");
    }

    // Drain client messages delivered to the broker
    {
        let broker = broker.clone();
        tokio::spawn(async move {
            while let Some(message) = broker.receive().await {
                info!(
                    "Received message on {} ({} bytes)",
                    message.topic,
                    message.payload.len()
                );
            }
        });
    }

    {
        let broker = broker.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Shutdown requested");
                    broker.shutdown();
                }
                Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
            }
        });
    }

    broker.run().await?;

    Ok(())
}

//! driftmail - distributed IMAP server entry point

use anyhow::Result;
use clap::{ArgGroup, Parser, ValueEnum};
use driftmail_common::Config;
use driftmail_comm::{Receiver, Sender};
use driftmail_core::{applier, Distributor, FileAuthenticator, Node, Worker};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Distributed IMAP4rev1 server with CRDT-replicated mailbox state
#[derive(Parser, Debug)]
#[command(name = "driftmail", version)]
#[command(group(ArgGroup::new("role").required(true).multiple(false)))]
struct Cli {
    /// Path to the configuration file in TOML syntax
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Run the public-facing distributor node
    #[arg(long, group = "role")]
    distributor: bool,

    /// Run a worker node under the given replica name
    #[arg(long, group = "role", value_name = "NAME")]
    worker: Option<String>,

    /// Run the failover node (a worker replica standing in for a peer)
    #[arg(long, group = "role")]
    failover: bool,

    /// Run the storage node (receive-only fallback replica)
    #[arg(long, group = "role")]
    storage: bool,

    /// Log level, overriding the configuration file
    #[arg(long, value_enum)]
    loglevel: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_file(&cli.config)?;
    init_logging(cli.loglevel, &config.logging.level);
    info!(config = %cli.config.display(), "starting driftmail");

    if cli.distributor {
        run_distributor(config).await
    } else {
        let replica = cli
            .worker
            .clone()
            .unwrap_or_else(|| config.node.name.clone());
        // The storage role holds replicated state but serves no sessions.
        let serve_imap = !cli.storage;
        run_replica(config, replica, serve_imap).await
    }
}

async fn run_distributor(config: Config) -> Result<()> {
    let auth = Arc::new(FileAuthenticator::open(
        &config.auth.file,
        &config.auth.separator,
    )?);
    let distributor = Distributor::new(
        config.imap.greeting.clone(),
        config.imap.timeout_minutes,
        auth,
        config.workers.clone(),
    );

    let listener = TcpListener::bind(&config.imap.bind).await?;
    info!(bind = %config.imap.bind, "distributor listening");
    tokio::spawn(async move {
        if let Err(e) = distributor.run(listener).await {
            error!(error = %e, "distributor failed");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    Ok(())
}

async fn run_replica(config: Config, replica: String, serve_imap: bool) -> Result<()> {
    let node = Node::open(&config.storage.maildir_root, &config.storage.crdt_root)?;
    info!(replica = %replica, "node state recovered");

    let sender = Sender::open(
        replica.clone(),
        &config.sync.state_dir,
        config.peers.clone(),
        config.sync.clone(),
    )?;
    sender.spawn_peer_tasks();

    let (apply_tx, apply_rx) = mpsc::channel(64);
    let receiver = Receiver::new(sender.clock(), apply_tx);
    let sync_listener = TcpListener::bind(&config.sync.bind).await?;
    info!(bind = %config.sync.bind, "sync receiver listening");
    tokio::spawn(async move {
        if let Err(e) = receiver.run(sync_listener).await {
            error!(error = %e, "sync receiver failed");
        }
    });
    tokio::spawn(applier::run(Arc::clone(&node), apply_rx));

    if serve_imap {
        let worker = Worker::new(Arc::clone(&node), Arc::clone(&sender));
        let listener = TcpListener::bind(&config.imap.bind).await?;
        info!(bind = %config.imap.bind, replica = %replica, "worker serving sessions");
        tokio::spawn(async move {
            if let Err(e) = worker.run(listener).await {
                error!(error = %e, "worker failed");
            }
        });
    } else {
        info!(replica = %replica, "storage replica running receive-only");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    Ok(())
}

fn init_logging(flag: Option<LogLevel>, configured: &str) {
    let level = flag.map(LogLevel::as_str).unwrap_or(configured);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},driftmail={}", level, level)));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_level(true))
        .with(filter)
        .init();
}

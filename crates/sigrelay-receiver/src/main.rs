//! sigrelay-receiver - the subscriber-side admission shell.
//!
//! Wires the [`ExecutionGuard`] to the daemon's push channel and keeps
//! the session alive with backoff. The host-terminal seams are wired in
//! paper mode here (dry-run orders, static quotes, permissive wallet);
//! a platform integration replaces those three trait objects and
//! nothing else.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rand::Rng;
use sigrelay_receiver::client::{run_session, ClientError};
use sigrelay_receiver::config::ReceiverConfig;
use sigrelay_receiver::guard::{ExecutionGuard, SystemClock};
use sigrelay_receiver::seqfile::SequenceFile;
use sigrelay_receiver::terminal::{AlwaysFunded, DryRunTerminal, Quote, StaticQuotes};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// sigrelay receiver - fail-closed signal admission
#[derive(Parser, Debug)]
#[command(name = "sigrelay-receiver")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the daemon push address
    #[arg(long)]
    server: Option<String>,

    /// Override the license token
    #[arg(long)]
    token: Option<String>,

    /// Override the sequence file path
    #[arg(long)]
    sequence_file: Option<PathBuf>,

    /// Override the shared MAC secret (hex)
    #[arg(long)]
    secret_hex: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &args.config {
        Some(path) => ReceiverConfig::load(path).context("loading configuration")?,
        None => ReceiverConfig::default(),
    };
    if let Some(server) = args.server {
        config.server = server;
    }
    if let Some(token) = args.token {
        config.token = token;
    }
    if let Some(path) = args.sequence_file {
        config.sequence_file = path;
    }
    if let Some(secret) = args.secret_hex {
        config.secret_hex = secret;
    }

    let secret = config.secret().context("resolving credentials")?;

    let mut guard = ExecutionGuard::new(
        config.policy.clone(),
        secret,
        SequenceFile::new(&config.sequence_file),
        Box::new(DryRunTerminal::default()),
        Box::new(StaticQuotes {
            quote: Quote {
                bid: config.paper_quote.bid,
                ask: config.paper_quote.ask,
                digits: config.paper_quote.digits,
                point: config.paper_quote.point,
            },
        }),
        Box::new(AlwaysFunded),
        Box::new(SystemClock),
        config.wallet_fail_closed,
    )
    .context("loading sequence state")?;

    info!(
        server = %config.server,
        last_accepted = guard.last_accepted(),
        "receiver starting (paper mode)"
    );

    let mut backoff = config.reconnect_base;
    loop {
        let session = tokio::select! {
            session = run_session(&config.server, &config.token, &mut guard) => session,
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT; stopping");
                return Ok(());
            }
        };
        match session {
            Ok(()) => {
                info!("session closed by server; reconnecting");
                backoff = config.reconnect_base;
            }
            Err(ClientError::HandshakeRejected { reason }) => {
                // Credentials will not fix themselves; surface and stop.
                anyhow::bail!("handshake rejected: {reason}");
            }
            Err(err) => {
                warn!(%err, "session failed");
            }
        }

        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        let sleep = backoff.mul_f64(jitter).min(config.reconnect_max);
        tokio::select! {
            () = tokio::time::sleep(sleep) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT; stopping");
                return Ok(());
            }
        }
        backoff = (backoff * 2).min(config.reconnect_max);
    }
}

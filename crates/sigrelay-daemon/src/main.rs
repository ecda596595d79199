//! sigrelay-daemon - the server side of the signal replication plane.
//!
//! Runs four long-lived tasks over shared stores:
//!
//! - the ingest gateway (producer TCP)
//! - the push distributor (receiver TCP)
//! - the trust loop (periodic reputation + auto-pause)
//! - the retention sweep (signal log + protection sink)
//!
//! plus an optional Prometheus `/metrics` endpoint. Shutdown is a watch
//! channel flipped on SIGINT/SIGTERM; every task observes it and drains.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use sigrelay_daemon::config::DaemonConfig;
use sigrelay_daemon::distributor::PushServer;
use sigrelay_daemon::ingest::{IngestServer, MasterStreams};
use sigrelay_daemon::log::{SignalLog, SqliteSignalLog};
use sigrelay_daemon::metrics::{metrics_router, MetricsRegistry, SharedMetrics};
use sigrelay_daemon::registry::Registry;
use sigrelay_daemon::sink::ProtectionSink;
use sigrelay_daemon::trust::TrustLoop;
use sigrelay_daemon::wallet::{SqliteWallet, WalletOracle};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// sigrelay daemon - trade-signal replication plane
#[derive(Parser, Debug)]
#[command(name = "sigrelay-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the producer ingest bind address
    #[arg(long)]
    ingest_bind: Option<String>,

    /// Override the receiver push bind address
    #[arg(long)]
    push_bind: Option<String>,

    /// Override the metrics bind address (empty string disables)
    #[arg(long)]
    metrics_bind: Option<String>,

    /// Override the data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit JSON logs instead of human-readable ones
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(args: &Args) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    if args.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    let mut config = match &args.config {
        Some(path) => DaemonConfig::load(path).context("loading configuration")?,
        None => DaemonConfig::default(),
    };
    if let Some(bind) = args.ingest_bind {
        config.ingest.bind = bind;
    }
    if let Some(bind) = args.push_bind {
        config.push.bind = bind;
    }
    if let Some(bind) = args.metrics_bind {
        config.metrics.bind = bind;
    }
    if let Some(data_dir) = args.data_dir {
        config.store.data_dir = data_dir;
    }

    std::fs::create_dir_all(&config.store.data_dir).with_context(|| {
        format!(
            "creating data directory {}",
            config.store.data_dir.display()
        )
    })?;

    // Decode every configured MAC secret up front; a bad key is a
    // startup error, not a per-packet surprise.
    let mut keys: HashMap<String, Vec<u8>> = HashMap::new();
    for key_ref in config.keys.keys() {
        let secret = config
            .secret(key_ref)?
            .context("key vanished during decode")?;
        keys.insert(key_ref.clone(), secret);
    }
    let keys = Arc::new(keys);

    // Stores.
    let signal_log = SqliteSignalLog::open(config.store.signal_log_path())
        .context("opening signal log")?;
    let log: Arc<dyn SignalLog> = Arc::new(signal_log.clone());
    let registry = Arc::new(Registry::open(config.store.registry_path()).context("opening registry")?);
    let sink = ProtectionSink::open(config.store.sink_path()).context("opening protection sink")?;
    let wallet = Arc::new(SqliteWallet::open(config.store.wallet_path()).context("opening wallets")?);
    let wallet_oracle: Arc<dyn WalletOracle> = wallet;

    let metrics: SharedMetrics = Arc::new(MetricsRegistry::new().context("registering metrics")?);
    let streams = Arc::new(MasterStreams::new(Arc::clone(&log)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    // Ingest gateway.
    let ingest = Arc::new(IngestServer::new(
        config.ingest.clone(),
        Arc::clone(&registry),
        Arc::clone(&log),
        sink.clone(),
        Arc::clone(&streams),
        metrics.daemon().clone(),
        Arc::clone(&keys),
    ));
    let ingest_listener = TcpListener::bind(&config.ingest.bind)
        .await
        .with_context(|| format!("binding ingest listener on {}", config.ingest.bind))?;
    tasks.push(tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move {
            if let Err(err) = ingest.run(ingest_listener, shutdown).await {
                warn!(%err, "ingest gateway exited with error");
            }
        }
    }));

    // Push distributor.
    let push = Arc::new(PushServer::new(
        config.push.clone(),
        Arc::clone(&registry),
        Arc::clone(&log),
        sink.clone(),
        Arc::clone(&streams),
        metrics.daemon().clone(),
        Arc::clone(&wallet_oracle),
    ));
    let push_listener = TcpListener::bind(&config.push.bind)
        .await
        .with_context(|| format!("binding push listener on {}", config.push.bind))?;
    tasks.push(tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move {
            if let Err(err) = push.run(push_listener, shutdown).await {
                warn!(%err, "push distributor exited with error");
            }
        }
    }));

    // Trust loop.
    let trust = Arc::new(TrustLoop::new(
        config.trust.clone(),
        Arc::clone(&registry),
        sink.clone(),
        metrics.daemon().clone(),
    ));
    tasks.push(tokio::spawn(trust.run(shutdown_rx.clone())));

    // Retention sweep.
    tasks.push(tokio::spawn({
        let sink = sink.clone();
        let signal_log = signal_log.clone();
        let retention = config.retention.clone();
        let mut shutdown = shutdown_rx.clone();
        async move {
            let mut ticker = tokio::time::interval(retention.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = Utc::now().timestamp_millis();
                        #[allow(clippy::cast_possible_wrap)]
                        let events_cutoff = now - retention.protection_events.as_millis() as i64;
                        #[allow(clippy::cast_possible_wrap)]
                        let log_cutoff = now - retention.signal_log.as_millis() as i64;
                        match sink.trim_before(events_cutoff) {
                            Ok(0) => {}
                            Ok(removed) => info!(removed, "trimmed protection events"),
                            Err(err) => warn!(%err, "protection retention sweep failed"),
                        }
                        match signal_log.trim_stamped_before(log_cutoff) {
                            Ok(0) => {}
                            Ok(removed) => info!(removed, "trimmed signal log"),
                            Err(err) => warn!(%err, "signal log retention sweep failed"),
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        }
    }));

    // Metrics endpoint.
    if !config.metrics.bind.is_empty() {
        let listener = TcpListener::bind(&config.metrics.bind)
            .await
            .with_context(|| format!("binding metrics listener on {}", config.metrics.bind))?;
        info!(bind = %config.metrics.bind, "metrics endpoint listening");
        let router = metrics_router(Arc::clone(&metrics));
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            });
            if let Err(err) = serve.await {
                warn!(%err, "metrics endpoint exited with error");
            }
        }));
    }

    info!("sigrelay daemon started");

    // Wait for SIGINT or SIGTERM.
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }

    shutdown_tx.send(true).ok();
    for task in tasks {
        task.await.ok();
    }
    info!("sigrelay daemon stopped");
    Ok(())
}

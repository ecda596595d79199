//! Daemon configuration.
//!
//! Loaded from a TOML file; every field has a default so a bare file (or
//! none at all) yields a runnable development daemon. Binary CLI flags
//! override the file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sigrelay_core::trust::{TrustSettings, TrustWeights};

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Ingest gateway settings.
    pub ingest: IngestConfig,
    /// Receiver push-channel settings.
    pub push: PushConfig,
    /// On-disk store locations.
    pub store: StoreConfig,
    /// Trust loop settings.
    pub trust: TrustConfig,
    /// Retention sweeps.
    pub retention: RetentionConfig,
    /// Prometheus endpoint settings.
    pub metrics: MetricsConfig,
    /// Shared MAC secrets by key reference, hex-encoded.
    ///
    /// `policy.secret_key_ref` names an entry here. Deployments source
    /// this from a secrets manager; the file form exists for development
    /// and tests.
    pub keys: HashMap<String, String>,
}

/// Ingest gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// TCP bind address for producer connections.
    pub bind: String,
    /// Per-connection sustained rate cap, packets per second.
    pub rate_per_sec: u64,
    /// Per-connection burst capacity.
    pub burst: u64,
    /// Coarse wall-clock freshness bound for `generated_at`.
    #[serde(with = "humantime_serde")]
    pub max_clock_skew: Duration,
    /// Deadline for the handshake frame.
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// Deadline for every hot-path I/O and the log append.
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,
    /// Consecutive invalid signatures before the connection is closed.
    pub invalid_signature_close_after: u32,
    /// Bound on concurrent log appends (the log client pool).
    pub log_pool_size: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:9210".to_string(),
            rate_per_sec: 100,
            burst: 200,
            max_clock_skew: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(2),
            invalid_signature_close_after: 3,
            log_pool_size: 64,
        }
    }
}

/// Receiver push-channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// TCP bind address for receiver connections.
    pub bind: String,
    /// Batch size per log read.
    pub batch: usize,
    /// Whether to suppress live push while a subscription is not
    /// SYNCED. Tunable, not a hard rule; DEGRADED_GAP always switches
    /// to full-sync mode regardless.
    pub suppress_non_synced: bool,
    /// Upper bound on signals replayed per full-sync round; past this
    /// the subscription stays DEGRADED_GAP for operator action.
    pub max_sync_batch: usize,
    /// Deadline for receiver-facing writes.
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,
    /// How long a session idles before re-checking subscription state.
    #[serde(with = "humantime_serde")]
    pub idle_poll: Duration,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:9211".to_string(),
            batch: 64,
            suppress_non_synced: true,
            max_sync_batch: 10_000,
            io_timeout: Duration::from_secs(5),
            idle_poll: Duration::from_millis(250),
        }
    }
}

/// On-disk store locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the three `SQLite` stores.
    pub data_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./sigrelay-data"),
        }
    }
}

impl StoreConfig {
    /// Path of the signal log database.
    #[must_use]
    pub fn signal_log_path(&self) -> PathBuf {
        self.data_dir.join("signals.db")
    }

    /// Path of the registry database.
    #[must_use]
    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("registry.db")
    }

    /// Path of the protection sink database.
    #[must_use]
    pub fn sink_path(&self) -> PathBuf {
        self.data_dir.join("protection.db")
    }

    /// Path of the wallet database.
    #[must_use]
    pub fn wallet_path(&self) -> PathBuf {
        self.data_dir.join("wallets.db")
    }
}

/// Trust loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// How often the loop runs.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Rolling event window.
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Pause / resume thresholds.
    pub settings: TrustSettings,
    /// Per-event score weights.
    pub weights: TrustWeights,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            window: Duration::from_secs(24 * 60 * 60),
            settings: TrustSettings::default(),
            weights: TrustWeights::default(),
        }
    }
}

/// Retention sweeps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// How often the sweeps run.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Protection events older than this are trimmed.
    #[serde(with = "humantime_serde")]
    pub protection_events: Duration,
    /// Signal log records older than this are trimmed. Must comfortably
    /// exceed the longest outage a receiver is expected to recover from
    /// via full sync.
    #[serde(with = "humantime_serde")]
    pub signal_log: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            protection_events: Duration::from_secs(90 * 24 * 60 * 60),
            signal_log: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Prometheus endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Bind address for `/metrics`; empty disables the endpoint.
    pub bind: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:9290".to_string(),
        }
    }
}

/// Errors loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file could not be parsed.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// A key entry was not valid hex.
    #[error("key {key_ref:?} is not valid hex")]
    BadKey {
        /// Offending key reference.
        key_ref: String,
    },
}

impl DaemonConfig {
    /// Load from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Decode the MAC secret named by `key_ref`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BadKey`] for malformed hex; `Ok(None)` for
    /// an unknown reference.
    pub fn secret(&self, key_ref: &str) -> Result<Option<Vec<u8>>, ConfigError> {
        match self.keys.get(key_ref) {
            None => Ok(None),
            Some(hex_str) => hex::decode(hex_str)
                .map(Some)
                .map_err(|_| ConfigError::BadKey {
                    key_ref: key_ref.to_string(),
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_runnable() {
        let config = DaemonConfig::default();
        assert_eq!(config.ingest.rate_per_sec, 100);
        assert_eq!(config.trust.settings.pause_threshold, 50);
        assert!(config.push.suppress_non_synced);
        assert_eq!(config.retention.protection_events.as_secs(), 90 * 86_400);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: DaemonConfig = toml::from_str(
            r#"
            [ingest]
            bind = "0.0.0.0:9000"
            rate_per_sec = 500

            [keys]
            master-1 = "deadbeef"
            "#,
        )
        .unwrap();
        assert_eq!(config.ingest.bind, "0.0.0.0:9000");
        assert_eq!(config.ingest.rate_per_sec, 500);
        assert_eq!(config.ingest.burst, 200);
        assert_eq!(config.secret("master-1").unwrap(), Some(vec![0xde, 0xad, 0xbe, 0xef]));
        assert_eq!(config.secret("missing").unwrap(), None);
    }

    #[test]
    fn bad_key_hex_is_an_error() {
        let mut config = DaemonConfig::default();
        config.keys.insert("k".to_string(), "not-hex".to_string());
        assert!(matches!(
            config.secret("k"),
            Err(ConfigError::BadKey { .. })
        ));
    }

    #[test]
    fn durations_parse_humantime() {
        let config: DaemonConfig = toml::from_str(
            r#"
            [trust]
            interval = "30s"
            window = "1h"
            "#,
        )
        .unwrap();
        assert_eq!(config.trust.interval.as_secs(), 30);
        assert_eq!(config.trust.window.as_secs(), 3600);
    }
}

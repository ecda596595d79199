//! Receiver configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sigrelay_core::policy::Policy;

/// Receiver configuration, loaded from TOML with CLI overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Push-channel address of the daemon.
    pub server: String,
    /// License token presented at handshake.
    pub token: String,
    /// Path of the durable sequence file.
    pub sequence_file: PathBuf,
    /// Shared MAC secret, hex-encoded.
    pub secret_hex: String,
    /// Admission policy applied by the guard.
    pub policy: Policy,
    /// Reject when the wallet oracle cannot answer (the safer default);
    /// `false` treats an unanswerable oracle as advisory.
    pub wallet_fail_closed: bool,
    /// Base reconnect backoff; doubles per attempt with jitter.
    #[serde(with = "humantime_serde")]
    pub reconnect_base: Duration,
    /// Upper bound for reconnect backoff.
    #[serde(with = "humantime_serde")]
    pub reconnect_max: Duration,
    /// Paper-mode quote used by the bundled binary until a host quote
    /// feed replaces the [`crate::terminal::QuoteSource`] seam.
    pub paper_quote: PaperQuote,
}

/// Static quote for paper mode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperQuote {
    /// Best bid.
    pub bid: f64,
    /// Best ask.
    pub ask: f64,
    /// Price digits.
    pub digits: u8,
    /// Point size.
    pub point: f64,
}

impl Default for PaperQuote {
    fn default() -> Self {
        Self {
            bid: 1.09998,
            ask: 1.10003,
            digits: 5,
            point: 0.00001,
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:9211".to_string(),
            token: String::new(),
            sequence_file: PathBuf::from("./receiver.seq"),
            secret_hex: String::new(),
            policy: Policy::default(),
            wallet_fail_closed: true,
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(60),
            paper_quote: PaperQuote::default(),
        }
    }
}

/// Errors loading receiver configuration.
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
    /// A required field is missing or malformed.
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ReceiverConfig {
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

    /// Decode the shared MAC secret.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the token or secret is
    /// missing or malformed.
    pub fn secret(&self) -> Result<Vec<u8>, ConfigError> {
        if self.token.is_empty() {
            return Err(ConfigError::Invalid("token is required".to_string()));
        }
        if self.secret_hex.is_empty() {
            return Err(ConfigError::Invalid("secret_hex is required".to_string()));
        }
        hex::decode(&self.secret_hex)
            .map_err(|_| ConfigError::Invalid("secret_hex is not valid hex".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_require_credentials() {
        let config = ReceiverConfig::default();
        assert!(matches!(config.secret(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: ReceiverConfig = toml::from_str(
            r#"
            token = "srk_abc"
            secret_hex = "00ff"

            [policy]
            max_ttl_ms = 500
            secret_key_ref = "m-1"
            "#,
        )
        .unwrap();
        assert_eq!(config.policy.max_ttl_ms, 500);
        assert_eq!(config.secret().unwrap(), vec![0x00, 0xff]);
        assert!(config.wallet_fail_closed);
        assert_eq!(config.server, "127.0.0.1:9211");
    }
}

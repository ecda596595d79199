//! Signal model and the canonical keyed-MAC contract.
//!
//! The canonical payload defined here is a compatibility contract: the
//! producer, the ingest gateway, and every receiver must derive the exact
//! same byte string from the same signal, or signature verification breaks
//! across the fleet. It is therefore fixed in ONE place (this module) and
//! pinned by golden vectors in the tests below.
//!
//! # Canonical payload
//!
//! ```text
//! subscription_id | sequence | generated_at_ms | symbol | side | volume | price | stop_loss | take_profit
//! ```
//!
//! - fields joined by `'|'`, no surrounding whitespace
//! - `side` encoded as its wire digit (1=BUY, 2=SELL, 3=CLOSE)
//! - `volume`, `price`, `stop_loss`, `take_profit` formatted `%.5f`
//! - `generated_at` in **milliseconds** since the Unix epoch, UTC
//!
//! The MAC is HMAC-SHA-256 over the payload bytes, hex-encoded lowercase.
//! Verification always compares in constant time.
//!
//! # Invariants
//!
//! - [INV-SIG-001] `sign` followed by `verify` with the same secret always
//!   succeeds; any single-bit change to a canonical field fails.
//! - [INV-SIG-002] `server_arrival_ms` is NOT part of the canonical
//!   payload: the gateway stamps it after the producer has signed.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted length for a symbol name on the wire.
pub const MAX_SYMBOL_LEN: usize = 32;

/// Maximum accepted length for a subscription identifier on the wire.
pub const MAX_SUBSCRIPTION_ID_LEN: usize = 64;

/// Trade direction carried by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    /// Open or add to a long position.
    Buy,
    /// Open or add to a short position.
    Sell,
    /// Close the position opened by earlier signals for the symbol.
    Close,
}

impl Side {
    /// Wire digit for this side (part of the canonical MAC payload).
    #[must_use]
    pub const fn wire_code(self) -> u8 {
        match self {
            Self::Buy => 1,
            Self::Sell => 2,
            Self::Close => 3,
        }
    }

    /// Decode a wire digit into a side.
    #[must_use]
    pub const fn from_wire(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Buy),
            2 => Some(Self::Sell),
            3 => Some(Self::Close),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Close => write!(f, "CLOSE"),
        }
    }
}

/// A single trade intent emitted by a master stream.
///
/// `(master_id, sequence)` is globally unique. `server_arrival_ms` is
/// assigned exactly once, by the ingest gateway, and is the only timestamp
/// downstream TTL decisions may use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Producer stream identity as emitted on the wire. Bound into the
    /// canonical MAC payload.
    pub subscription_id: String,
    /// Master stream that owns the sequence space. Resolved from the
    /// producer credential at ingest; not on the producer wire.
    pub master_id: String,
    /// Strictly monotonically increasing per master stream, never reused.
    pub sequence: u64,
    /// Producer-side generation time, UTC milliseconds.
    pub generated_at_ms: i64,
    /// Gateway arrival stamp, UTC milliseconds. `None` until the gateway
    /// has stamped the packet.
    pub server_arrival_ms: Option<i64>,
    /// Instrument symbol, e.g. `EURUSD`.
    pub symbol: String,
    /// Trade direction.
    pub side: Side,
    /// Lot volume.
    pub volume: f64,
    /// Intended fill price.
    pub price: f64,
    /// Stop-loss level; `0.0` when unset.
    pub stop_loss: f64,
    /// Take-profit level; `0.0` when unset.
    pub take_profit: f64,
    /// Hex-encoded HMAC-SHA-256 over the canonical payload.
    pub signature: String,
}

/// Reasons a signal fails structural validation before any guard runs.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SignalValidationError {
    /// The sequence number was zero (sequences start at 1).
    #[error("sequence number must be positive")]
    ZeroSequence,
    /// The symbol was empty or longer than [`MAX_SYMBOL_LEN`].
    #[error("symbol must be 1..={MAX_SYMBOL_LEN} bytes, got {len}")]
    BadSymbol {
        /// Observed symbol length in bytes.
        len: usize,
    },
    /// The subscription id was empty or longer than
    /// [`MAX_SUBSCRIPTION_ID_LEN`].
    #[error("subscription id must be 1..={MAX_SUBSCRIPTION_ID_LEN} bytes, got {len}")]
    BadSubscriptionId {
        /// Observed id length in bytes.
        len: usize,
    },
    /// Volume was not a positive finite number.
    #[error("volume must be positive and finite, got {volume}")]
    BadVolume {
        /// Observed volume.
        volume: f64,
    },
    /// A price field was not finite.
    #[error("price fields must be finite")]
    NonFinitePrice,
}

impl Signal {
    /// Construct an unsigned signal with unset stop/take levels.
    ///
    /// `master_id` stays empty until ingest resolves the credential.
    #[must_use]
    pub fn new(
        subscription_id: impl Into<String>,
        sequence: u64,
        generated_at_ms: i64,
        symbol: impl Into<String>,
        side: Side,
        volume: f64,
        price: f64,
    ) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            master_id: String::new(),
            sequence,
            generated_at_ms,
            server_arrival_ms: None,
            symbol: symbol.into(),
            side,
            volume,
            price,
            stop_loss: 0.0,
            take_profit: 0.0,
            signature: String::new(),
        }
    }

    /// Structural validation, run before any signature or guard work.
    ///
    /// # Errors
    ///
    /// Returns the first failed check in field order.
    pub fn validate(&self) -> Result<(), SignalValidationError> {
        if self.subscription_id.is_empty() || self.subscription_id.len() > MAX_SUBSCRIPTION_ID_LEN {
            return Err(SignalValidationError::BadSubscriptionId {
                len: self.subscription_id.len(),
            });
        }
        if self.sequence == 0 {
            return Err(SignalValidationError::ZeroSequence);
        }
        if self.symbol.is_empty() || self.symbol.len() > MAX_SYMBOL_LEN {
            return Err(SignalValidationError::BadSymbol {
                len: self.symbol.len(),
            });
        }
        if !(self.volume.is_finite() && self.volume > 0.0) {
            return Err(SignalValidationError::BadVolume {
                volume: self.volume,
            });
        }
        if !(self.price.is_finite() && self.stop_loss.is_finite() && self.take_profit.is_finite()) {
            return Err(SignalValidationError::NonFinitePrice);
        }
        Ok(())
    }

    /// The canonical MAC payload for this signal.
    ///
    /// Field order and formatting are a compatibility contract; see the
    /// module docs. Changing this string changes the wire protocol.
    #[must_use]
    pub fn canonical_payload(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{:.5}|{:.5}|{:.5}|{:.5}",
            self.subscription_id,
            self.sequence,
            self.generated_at_ms,
            self.symbol,
            self.side.wire_code(),
            self.volume,
            self.price,
            self.stop_loss,
            self.take_profit,
        )
    }

    /// Compute and attach the signature for `secret`.
    pub fn sign(&mut self, secret: &[u8]) {
        self.signature = sign_payload(secret, &self.canonical_payload());
    }

    /// Verify the attached signature against `secret` in constant time.
    #[must_use]
    pub fn verify(&self, secret: &[u8]) -> bool {
        verify_payload(secret, &self.canonical_payload(), &self.signature)
    }

    /// Age of this signal relative to `now_ms`, in milliseconds.
    ///
    /// Negative ages (producer clock ahead of the evaluating clock) are
    /// clamped to zero so a fast producer clock never trips TTL checks.
    #[must_use]
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        (now_ms - self.generated_at_ms).max(0)
    }
}

/// HMAC-SHA-256 over `payload`, hex-encoded lowercase.
#[must_use]
pub fn sign_payload(secret: &[u8], payload: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time verification of a hex signature over `payload`.
///
/// Malformed hex or a wrong-length signature fails verification without
/// short-circuiting on length earlier than the comparison itself.
#[must_use]
pub fn verify_payload(secret: &[u8], payload: &str, signature_hex: &str) -> bool {
    let Ok(provided) = hex::decode(signature_hex) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(payload.as_bytes());
    let expected = mac.finalize().into_bytes();
    if provided.len() != expected.len() {
        return false;
    }
    expected.ct_eq(provided.as_slice()).into()
}

//! Per-subscription admission policy.
//!
//! Immutable between admin updates; the registry hands out snapshots and
//! the guard uses whichever snapshot it started a decision with.

use serde::{Deserialize, Serialize};

/// Admission limits applied by the receiver-side guard pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Maximum allowed distance between signal price and the live quote,
    /// in pips (price units of the symbol's `point`). Equality accepts.
    #[serde(default = "default_max_deviation_pips")]
    pub max_price_deviation_pips: f64,

    /// Maximum allowed signal age at admission, milliseconds. Equality
    /// accepts.
    #[serde(default = "default_max_ttl_ms")]
    pub max_ttl_ms: i64,

    /// Upper bound on order volume; larger signal volumes are capped to
    /// this at order construction.
    #[serde(default = "default_max_lot")]
    pub max_lot: f64,

    /// Name of the shared MAC secret in the key store.
    pub secret_key_ref: String,
}

const fn default_max_ttl_ms() -> i64 {
    30_000
}

const fn default_max_deviation_pips() -> f64 {
    50.0
}

const fn default_max_lot() -> f64 {
    1.0
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_price_deviation_pips: default_max_deviation_pips(),
            max_ttl_ms: default_max_ttl_ms(),
            max_lot: default_max_lot(),
            secret_key_ref: "default".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let policy: Policy = serde_json::from_str(r#"{"secret_key_ref":"m-1"}"#).unwrap();
        assert_eq!(policy.max_ttl_ms, 30_000);
        assert!((policy.max_price_deviation_pips - 50.0).abs() < f64::EPSILON);
        assert_eq!(policy.secret_key_ref, "m-1");
    }

    #[test]
    fn roundtrips_through_json() {
        let policy = Policy {
            max_price_deviation_pips: 25.0,
            max_ttl_ms: 500,
            max_lot: 0.5,
            secret_key_ref: "m-2".to_string(),
        };
        let json = serde_json::to_string(&policy).unwrap();
        assert_eq!(serde_json::from_str::<Policy>(&json).unwrap(), policy);
    }
}

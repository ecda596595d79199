//! Protection events: the closed set of rejection reasons and the record
//! the sink stores for each one.
//!
//! Every rejection anywhere in the plane (gateway or receiver) produces
//! exactly one [`ProtectionEvent`]. Successful executions and failed order
//! placements are recorded through the same sink with their own
//! [`EventKind`] so the fail-closed audit holds: for every delivered
//! signal exactly one of executed / protection event / placement failure
//! exists.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::subscription::SubscriptionState;

/// Why a signal was rejected. Closed set; the admission pipeline is a
/// fixed ordered sequence of guards, not a plugin chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectReason {
    /// Sequence strictly less than the last accepted one.
    Replay,
    /// Sequence equal to the last accepted one.
    Duplicate,
    /// Sequence more than one ahead of the last accepted one.
    SequenceGap,
    /// Signal age exceeded the policy TTL.
    TtlExpired,
    /// Signal price too far from the live quote.
    PriceDeviation,
    /// Wallet oracle reported no spendable balance.
    InsufficientFunds,
    /// Subscription state was not SYNCED at admission.
    StateLocked,
    /// Keyed MAC did not verify.
    InvalidSignature,
    /// Credential missing, inactive, or expired at ingest.
    InvalidCredential,
    /// Per-connection rate cap exceeded at ingest.
    RateLimit,
    /// Producer timestamp outside the coarse freshness bound at ingest.
    ClockSkew,
}

impl RejectReason {
    /// Stable string form, used in the sink, acks, and operator surfaces.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Replay => "REPLAY",
            Self::Duplicate => "DUPLICATE",
            Self::SequenceGap => "SEQUENCE_GAP",
            Self::TtlExpired => "TTL_EXPIRED",
            Self::PriceDeviation => "PRICE_DEVIATION",
            Self::InsufficientFunds => "INSUFFICIENT_FUNDS",
            Self::StateLocked => "STATE_LOCKED",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::InvalidCredential => "INVALID_CREDENTIAL",
            Self::RateLimit => "RATE_LIMIT",
            Self::ClockSkew => "CLOCK_SKEW",
        }
    }

    /// Parse the stable string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "REPLAY" => Some(Self::Replay),
            "DUPLICATE" => Some(Self::Duplicate),
            "SEQUENCE_GAP" => Some(Self::SequenceGap),
            "TTL_EXPIRED" => Some(Self::TtlExpired),
            "PRICE_DEVIATION" => Some(Self::PriceDeviation),
            "INSUFFICIENT_FUNDS" => Some(Self::InsufficientFunds),
            "STATE_LOCKED" => Some(Self::StateLocked),
            "INVALID_SIGNATURE" => Some(Self::InvalidSignature),
            "INVALID_CREDENTIAL" => Some(Self::InvalidCredential),
            "RATE_LIMIT" => Some(Self::RateLimit),
            "CLOCK_SKEW" => Some(Self::ClockSkew),
            _ => None,
        }
    }

    /// Human-readable reason for operator views.
    #[must_use]
    pub const fn describe(self) -> &'static str {
        match self {
            Self::Replay => "sequence number earlier than last accepted (possible replay attack)",
            Self::Duplicate => "sequence number already executed",
            Self::SequenceGap => "sequence number skipped ahead; full sync required",
            Self::TtlExpired => "signal arrived too late to fill safely",
            Self::PriceDeviation => "market moved too far from the signalled price",
            Self::InsufficientFunds => "wallet has no spendable balance",
            Self::StateLocked => "subscription is not in a deliverable state",
            Self::InvalidSignature => "signal signature did not verify",
            Self::InvalidCredential => "license credential missing, inactive, or expired",
            Self::RateLimit => "producer exceeded the per-connection rate cap",
            Self::ClockSkew => "producer clock too far from server clock",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of record is being written to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A guard rejected the signal.
    Rejected(RejectReason),
    /// The signal passed all guards and the order was placed.
    Executed,
    /// The signal passed all guards but the host terminal refused the
    /// order. Not a protection event; the sequence was rolled back.
    OrderFailed,
}

impl EventKind {
    /// Stable string form for persistence.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rejected(reason) => reason.as_str(),
            Self::Executed => "EXECUTED",
            Self::OrderFailed => "ORDER_PLACEMENT_FAILED",
        }
    }

    /// Parse the stable string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "EXECUTED" => Some(Self::Executed),
            "ORDER_PLACEMENT_FAILED" => Some(Self::OrderFailed),
            other => RejectReason::parse(other).map(Self::Rejected),
        }
    }
}

/// One record in the protection sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectionEvent {
    /// Unique event id.
    pub event_id: String,
    /// Subscription the signal belonged to.
    pub subscription_id: String,
    /// Subscriber that owns the subscription (trust scoring key).
    pub subscriber_id: String,
    /// When the event was recorded, UTC milliseconds.
    pub event_time_ms: i64,
    /// What happened.
    pub kind: EventKind,
    /// Sequence number of the signal in question.
    pub signal_sequence: u64,
    /// Producer generation time of the signal, UTC milliseconds.
    pub generated_at_ms: i64,
    /// Gateway arrival stamp of the signal, UTC milliseconds; zero when
    /// the signal never reached the gateway stamp.
    pub arrival_time_ms: i64,
    /// Signal age measured at the decision point, milliseconds.
    pub observed_latency_ms: i64,
    /// Measured price deviation in pips, when the price guard ran.
    pub observed_deviation_pips: Option<f64>,
    /// Subscription state at the time of the event.
    pub state_at_event: SubscriptionState,
    /// Wallet balance at the time of the event, when known.
    pub wallet_balance: Option<f64>,
}

impl ProtectionEvent {
    /// Build an event with a fresh id.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        subscription_id: impl Into<String>,
        subscriber_id: impl Into<String>,
        event_time_ms: i64,
        kind: EventKind,
        signal_sequence: u64,
        generated_at_ms: i64,
        arrival_time_ms: i64,
        observed_latency_ms: i64,
        state_at_event: SubscriptionState,
    ) -> Self {
        Self {
            event_id: format!("PEV-{}", Uuid::new_v4()),
            subscription_id: subscription_id.into(),
            subscriber_id: subscriber_id.into(),
            event_time_ms,
            kind,
            signal_sequence,
            generated_at_ms,
            arrival_time_ms,
            observed_latency_ms,
            observed_deviation_pips: None,
            state_at_event,
            wallet_balance: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_strings_roundtrip() {
        let reasons = [
            RejectReason::Replay,
            RejectReason::Duplicate,
            RejectReason::SequenceGap,
            RejectReason::TtlExpired,
            RejectReason::PriceDeviation,
            RejectReason::InsufficientFunds,
            RejectReason::StateLocked,
            RejectReason::InvalidSignature,
            RejectReason::InvalidCredential,
            RejectReason::RateLimit,
            RejectReason::ClockSkew,
        ];
        for reason in reasons {
            assert_eq!(RejectReason::parse(reason.as_str()), Some(reason));
        }
        assert_eq!(RejectReason::parse("NOT_A_REASON"), None);
    }

    #[test]
    fn kind_strings_roundtrip() {
        for kind in [
            EventKind::Executed,
            EventKind::OrderFailed,
            EventKind::Rejected(RejectReason::TtlExpired),
        ] {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn event_ids_are_unique() {
        let a = ProtectionEvent::new(
            "s",
            "u",
            0,
            EventKind::Executed,
            1,
            0,
            0,
            0,
            SubscriptionState::Synced,
        );
        let b = ProtectionEvent::new(
            "s",
            "u",
            0,
            EventKind::Executed,
            1,
            0,
            0,
            0,
            SubscriptionState::Synced,
        );
        assert_ne!(a.event_id, b.event_id);
    }
}

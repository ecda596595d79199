//! Subscription state machine.
//!
//! States and transitions form a closed set; anything not named in the
//! table below is an invalid transition and is rejected, never silently
//! ignored. The registry applies transitions under a per-subscription
//! lock with an optimistic version check; this module only encodes which
//! transitions exist.

use serde::{Deserialize, Serialize};

/// Replication state of a single subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionState {
    /// Receiver is in lockstep with the master stream.
    Synced,
    /// Receiver reported a sequence gap; full sync in progress.
    DegradedGap,
    /// Subscriber wallet hit zero spendable balance.
    LockedNoFunds,
    /// Trust score dropped below the pause threshold.
    PausedToxic,
    /// Operator suspended the subscription out-of-band.
    SuspendedAdmin,
}

/// Events that drive subscription state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateEvent {
    /// A signal was delivered and acked normally.
    DeliveryOk,
    /// The receiver reported a sequence gap.
    GapReported,
    /// The wallet oracle reported zero spendable balance.
    WalletEmpty,
    /// The trust loop observed a score below the pause threshold.
    TrustBelowThreshold,
    /// Operator suspend action.
    AdminSuspend,
    /// The wallet oracle reported balance restored.
    FundsRestored,
    /// The trust loop observed a score at or above the resume threshold.
    TrustRecovered,
    /// Operator resume action.
    AdminResume,
    /// Full sync brought the receiver back to the log head.
    FullSyncDone,
}

/// An event arrived that the current state does not accept.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid transition: {event:?} in state {from:?}")]
pub struct TransitionError {
    /// State the subscription was in.
    pub from: SubscriptionState,
    /// Event that was rejected.
    pub event: StateEvent,
}

impl SubscriptionState {
    /// Apply `event`, returning the next state.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] for any pair not in the transition
    /// table. Callers decide whether that is a conflict to surface or a
    /// stale event to drop; this function never guesses.
    pub fn apply(self, event: StateEvent) -> Result<Self, TransitionError> {
        use StateEvent as E;
        use SubscriptionState as S;
        let next = match (self, event) {
            (S::Synced, E::DeliveryOk) => S::Synced,
            (S::Synced, E::GapReported) => S::DegradedGap,
            (S::Synced, E::WalletEmpty) => S::LockedNoFunds,
            (S::Synced | S::DegradedGap, E::TrustBelowThreshold) => S::PausedToxic,
            (_, E::AdminSuspend) => S::SuspendedAdmin,
            (S::DegradedGap, E::GapReported) => S::DegradedGap,
            (S::DegradedGap, E::FullSyncDone) => S::Synced,
            (S::LockedNoFunds, E::WalletEmpty) => S::LockedNoFunds,
            (S::LockedNoFunds, E::FundsRestored) => S::Synced,
            (S::PausedToxic, E::TrustBelowThreshold) => S::PausedToxic,
            (S::PausedToxic, E::TrustRecovered) => S::Synced,
            (S::SuspendedAdmin, E::AdminResume) => S::Synced,
            (from, event) => return Err(TransitionError { from, event }),
        };
        Ok(next)
    }

    /// Whether the distributor may push live signals in this state.
    #[must_use]
    pub const fn delivers_live(self) -> bool {
        matches!(self, Self::Synced)
    }

    /// Stable string form, used for persistence and wire surfaces.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "SYNCED",
            Self::DegradedGap => "DEGRADED_GAP",
            Self::LockedNoFunds => "LOCKED_NO_FUNDS",
            Self::PausedToxic => "PAUSED_TOXIC",
            Self::SuspendedAdmin => "SUSPENDED_ADMIN",
        }
    }

    /// Parse the stable string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SYNCED" => Some(Self::Synced),
            "DEGRADED_GAP" => Some(Self::DegradedGap),
            "LOCKED_NO_FUNDS" => Some(Self::LockedNoFunds),
            "PAUSED_TOXIC" => Some(Self::PausedToxic),
            "SUSPENDED_ADMIN" => Some(Self::SuspendedAdmin),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use StateEvent as E;
    use SubscriptionState as S;

    const ALL_STATES: [S; 5] = [
        S::Synced,
        S::DegradedGap,
        S::LockedNoFunds,
        S::PausedToxic,
        S::SuspendedAdmin,
    ];
    const ALL_EVENTS: [E; 9] = [
        E::DeliveryOk,
        E::GapReported,
        E::WalletEmpty,
        E::TrustBelowThreshold,
        E::AdminSuspend,
        E::FundsRestored,
        E::TrustRecovered,
        E::AdminResume,
        E::FullSyncDone,
    ];

    /// The full transition table, row by row. Cells absent here must
    /// error; the exhaustive check below enforces that.
    const TABLE: &[(S, E, S)] = &[
        (S::Synced, E::DeliveryOk, S::Synced),
        (S::Synced, E::GapReported, S::DegradedGap),
        (S::Synced, E::WalletEmpty, S::LockedNoFunds),
        (S::Synced, E::TrustBelowThreshold, S::PausedToxic),
        (S::Synced, E::AdminSuspend, S::SuspendedAdmin),
        (S::DegradedGap, E::GapReported, S::DegradedGap),
        (S::DegradedGap, E::TrustBelowThreshold, S::PausedToxic),
        (S::DegradedGap, E::AdminSuspend, S::SuspendedAdmin),
        (S::DegradedGap, E::FullSyncDone, S::Synced),
        (S::LockedNoFunds, E::WalletEmpty, S::LockedNoFunds),
        (S::LockedNoFunds, E::AdminSuspend, S::SuspendedAdmin),
        (S::LockedNoFunds, E::FundsRestored, S::Synced),
        (S::PausedToxic, E::TrustBelowThreshold, S::PausedToxic),
        (S::PausedToxic, E::AdminSuspend, S::SuspendedAdmin),
        (S::PausedToxic, E::TrustRecovered, S::Synced),
        (S::SuspendedAdmin, E::AdminSuspend, S::SuspendedAdmin),
        (S::SuspendedAdmin, E::AdminResume, S::Synced),
    ];

    #[test]
    fn every_listed_transition_holds() {
        for &(from, event, to) in TABLE {
            assert_eq!(from.apply(event), Ok(to), "{from} + {event:?}");
        }
    }

    #[test]
    fn every_unlisted_transition_errors() {
        for from in ALL_STATES {
            for event in ALL_EVENTS {
                let listed = TABLE.iter().any(|&(f, e, _)| f == from && e == event);
                if !listed {
                    assert_eq!(
                        from.apply(event),
                        Err(TransitionError { from, event }),
                        "{from} + {event:?} should be invalid"
                    );
                }
            }
        }
    }

    #[test]
    fn string_forms_roundtrip() {
        for state in ALL_STATES {
            assert_eq!(S::parse(state.as_str()), Some(state));
        }
        assert_eq!(S::parse("PAUSED_USER"), None);
    }

    #[test]
    fn only_synced_delivers_live() {
        for state in ALL_STATES {
            assert_eq!(state.delivers_live(), state == S::Synced);
        }
    }
}

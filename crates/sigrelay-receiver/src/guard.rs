//! ExecutionGuard: the receiver-side admission pipeline.
//!
//! Six guards run in a fixed order with short-circuit on the first
//! failure: sequence, state, TTL, price deviation, funds, signature.
//! The pipeline is a closed sequence of functions, not a plugin chain;
//! the rejection reasons are a closed set.
//!
//! # Fail closed
//!
//! This code runs in hostile process space. Any uncertainty — no quote,
//! no wallet answer (in the default configuration), a sequence file
//! that will not persist — means the signal is rejected or the order is
//! not placed, and a record says why. For every signal fed to the guard
//! exactly one of {executed, rejection, placement failure} comes back.
//!
//! # Crash safety
//!
//! The sequence is persisted durably BEFORE `place_order`. After any
//! crash the reloaded value equals the last placed order's sequence or
//! at worst one greater that was rolled back, so the worst case is one
//! duplicate attempt — which guard 1 then rejects. A skip can never
//! happen silently: it surfaces as `SEQUENCE_GAP` on the next signal
//! and triggers full sync.
//!
//! # Gap recovery
//!
//! Replayed signals enter through [`ExecutionGuard::admit_recovery`],
//! which bypasses only the state guard; the sequence, TTL, price,
//! fund, and signature guards all still run, so a replay never places
//! an order a live signal would not have. A replayed signal those
//! guards reject (typically `TTL_EXPIRED` — replays are old by nature,
//! but equally `INSUFFICIENT_FUNDS` on a drained wallet) is consumed:
//! the in-memory cursor advances past it so the replay converges on
//! the stream head, while the durable record still moves only on
//! executions. An empty wallet during recovery also does NOT flip the
//! local state to `LOCKED_NO_FUNDS` — the receiver is already in
//! `DEGRADED_GAP`, which has no wallet transition, so the rejection is
//! recorded and the sync is left to finish; the server-side registry
//! owns the lock-out decision from the reported events.

use chrono::Utc;
use sigrelay_core::policy::Policy;
use sigrelay_core::protection::{EventKind, RejectReason};
use sigrelay_core::signal::Signal;
use sigrelay_core::subscription::SubscriptionState;
use tracing::{debug, error, warn};

use crate::seqfile::{SeqFileError, SequenceFile};
use crate::terminal::{OrderRequest, OrderTerminal, QuoteSource, WalletProbe};

/// Receiver-local clock. UTC milliseconds; injected so tests control
/// time and production uses one clock per decision.
pub trait Clock: Send {
    /// Current UTC time in milliseconds.
    fn now_ms(&self) -> i64;
}

/// Wall-clock implementation of [`Clock`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// What the guard did with a signal.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// All guards passed and the order was placed.
    Executed {
        /// Host terminal ticket id.
        ticket: String,
    },
    /// A guard rejected the signal.
    Rejected(RejectReason),
    /// All guards passed but the host terminal refused the order; the
    /// persisted sequence was rolled back.
    ExecutionFailed {
        /// Terminal failure detail.
        detail: String,
    },
}

/// Full decision record for one signal. The client turns this into the
/// wire report; nothing is dropped on the floor.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// What happened.
    pub verdict: Verdict,
    /// Sequence of the signal in question.
    pub sequence: u64,
    /// Age measured at the decision point.
    pub age_ms: i64,
    /// Measured price deviation, when the price guard ran.
    pub deviation_pips: Option<f64>,
    /// Receiver-local state after the decision.
    pub state: SubscriptionState,
    /// `Some(have_through)` when the decision requires a full-sync
    /// request.
    pub sync_from: Option<u64>,
    /// Receiver's last accepted sequence after the decision.
    pub last_accepted: u64,
}

impl Decision {
    /// The sink record kind for this decision.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match &self.verdict {
            Verdict::Executed { .. } => EventKind::Executed,
            Verdict::Rejected(reason) => EventKind::Rejected(*reason),
            Verdict::ExecutionFailed { .. } => EventKind::OrderFailed,
        }
    }
}

/// The admission pipeline.
pub struct ExecutionGuard {
    policy: Policy,
    secret: Vec<u8>,
    seqfile: SequenceFile,
    terminal: Box<dyn OrderTerminal>,
    quotes: Box<dyn QuoteSource>,
    wallet: Box<dyn WalletProbe>,
    clock: Box<dyn Clock>,
    /// Reject when the wallet oracle cannot answer. The safer default;
    /// advisory mode treats an unanswerable oracle as a pass.
    wallet_fail_closed: bool,
    state: SubscriptionState,
    last: u64,
}

impl ExecutionGuard {
    /// Build a guard, loading the durable sequence.
    ///
    /// # Errors
    ///
    /// Returns [`SeqFileError`] when the sequence file exists but is
    /// unreadable — fail closed, do not guess a sequence.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        policy: Policy,
        secret: Vec<u8>,
        seqfile: SequenceFile,
        terminal: Box<dyn OrderTerminal>,
        quotes: Box<dyn QuoteSource>,
        wallet: Box<dyn WalletProbe>,
        clock: Box<dyn Clock>,
        wallet_fail_closed: bool,
    ) -> Result<Self, SeqFileError> {
        let last = seqfile.load()?;
        Ok(Self {
            policy,
            secret,
            seqfile,
            terminal,
            quotes,
            wallet,
            clock,
            wallet_fail_closed,
            state: SubscriptionState::Synced,
            last,
        })
    }

    /// Receiver's last accepted sequence.
    #[must_use]
    pub const fn last_accepted(&self) -> u64 {
        self.last
    }

    /// Receiver-local subscription state.
    #[must_use]
    pub const fn state(&self) -> SubscriptionState {
        self.state
    }

    /// The server completed full sync; return to live admission.
    pub fn mark_synced(&mut self) {
        self.state = SubscriptionState::Synced;
    }

    /// Replace the policy. In-flight decisions keep the snapshot they
    /// started with; this applies from the next signal.
    pub fn set_policy(&mut self, policy: Policy) {
        self.policy = policy;
    }

    /// Admit a live push.
    pub fn admit(&mut self, signal: &Signal) -> Decision {
        self.decide(signal, false)
    }

    /// Admit a gap-recovery replay: the state guard is bypassed and a
    /// rejected replay is consumed so the sync can converge.
    pub fn admit_recovery(&mut self, signal: &Signal) -> Decision {
        self.decide(signal, true)
    }

    fn decide(&mut self, signal: &Signal, recovery: bool) -> Decision {
        let now_ms = self.clock.now_ms();
        let age_ms = signal.age_ms(now_ms);
        let n = signal.sequence;

        // Guard 1: sequence.
        if n <= self.last {
            let reason = if n == self.last {
                RejectReason::Duplicate
            } else {
                RejectReason::Replay
            };
            return self.reject(signal, reason, age_ms, None, None);
        }
        if !recovery && n > self.last + 1 {
            // Gap: degrade and ask for replay from what we hold.
            self.state = SubscriptionState::DegradedGap;
            let have_through = self.last;
            warn!(
                sequence = n,
                have_through, "sequence gap detected; requesting full sync"
            );
            return self.reject(
                signal,
                RejectReason::SequenceGap,
                age_ms,
                None,
                Some(have_through),
            );
        }

        // Guard 2: state. Recovery deliveries bypass exactly this one.
        if !recovery && self.state != SubscriptionState::Synced {
            return self.reject(signal, RejectReason::StateLocked, age_ms, None, None);
        }

        // Guard 3: TTL. Stale fills are the primary toxic-flow vector;
        // age equal to the bound still accepts.
        if age_ms > self.policy.max_ttl_ms {
            return self.consume_if_recovery(recovery, n, |guard| {
                guard.reject(signal, RejectReason::TtlExpired, age_ms, None, None)
            });
        }

        // Guard 4: price deviation against the live quote. No quote
        // means no safe fill price: reject.
        let deviation_pips = match self.quotes.quote(&signal.symbol) {
            Ok(quote) => {
                let quoted = quote.fill_price(signal.side);
                Some((signal.price - quoted).abs() / quote.point)
            }
            Err(err) => {
                debug!(%err, symbol = %signal.symbol, "no quote; failing closed");
                None
            }
        };
        let deviation_ok =
            deviation_pips.is_some_and(|pips| pips <= self.policy.max_price_deviation_pips);
        if !deviation_ok {
            return self.consume_if_recovery(recovery, n, |guard| {
                guard.reject(
                    signal,
                    RejectReason::PriceDeviation,
                    age_ms,
                    deviation_pips,
                    None,
                )
            });
        }

        // Guard 5: funds. A definitive "no" is authoritative for this
        // decision; an unanswerable oracle follows the configured mode.
        let funded = match self.wallet.has_funds() {
            Ok(funded) => funded,
            Err(err) => {
                debug!(%err, "wallet oracle unavailable");
                !self.wallet_fail_closed
            }
        };
        if !funded {
            if !recovery {
                self.state = SubscriptionState::LockedNoFunds;
            }
            return self.consume_if_recovery(recovery, n, |guard| {
                guard.reject(
                    signal,
                    RejectReason::InsufficientFunds,
                    age_ms,
                    deviation_pips,
                    None,
                )
            });
        }

        // Guard 6: signature, recomputed over the canonical payload and
        // compared in constant time.
        if !signal.verify(&self.secret) {
            return self.consume_if_recovery(recovery, n, |guard| {
                guard.reject(
                    signal,
                    RejectReason::InvalidSignature,
                    age_ms,
                    deviation_pips,
                    None,
                )
            });
        }

        self.execute(signal, n, age_ms, deviation_pips)
    }

    /// All guards passed: persist, place, commit (or roll back).
    fn execute(
        &mut self,
        signal: &Signal,
        n: u64,
        age_ms: i64,
        deviation_pips: Option<f64>,
    ) -> Decision {
        let previous = self.last;

        // Durable BEFORE the order. If this write fails the order is
        // not placed at all.
        if let Err(err) = self.seqfile.store(n) {
            error!(%err, sequence = n, "sequence persist failed; order not placed");
            return Decision {
                verdict: Verdict::ExecutionFailed {
                    detail: format!("sequence persist failed: {err}"),
                },
                sequence: n,
                age_ms,
                deviation_pips,
                state: self.state,
                sync_from: None,
                last_accepted: self.last,
            };
        }

        let order = OrderRequest {
            symbol: signal.symbol.clone(),
            side: signal.side,
            volume: signal.volume.min(self.policy.max_lot),
            price: signal.price,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
        };

        match self.terminal.place_order(&order) {
            Ok(ticket) => {
                self.last = n;
                debug!(sequence = n, ticket, "order placed");
                Decision {
                    verdict: Verdict::Executed { ticket },
                    sequence: n,
                    age_ms,
                    deviation_pips,
                    state: self.state,
                    sync_from: None,
                    last_accepted: self.last,
                }
            }
            Err(err) => {
                // Roll back the persisted sequence; a failed rollback
                // leaves the at-most-one-duplicate window, which guard 1
                // absorbs after restart.
                if let Err(rollback_err) = self.seqfile.store(previous) {
                    error!(%rollback_err, "sequence rollback failed");
                }
                warn!(%err, sequence = n, "order placement failed");
                Decision {
                    verdict: Verdict::ExecutionFailed {
                        detail: err.to_string(),
                    },
                    sequence: n,
                    age_ms,
                    deviation_pips,
                    state: self.state,
                    sync_from: None,
                    last_accepted: self.last,
                }
            }
        }
    }

    /// In recovery mode a rejected replay still advances the in-memory
    /// cursor (the signal is consumed, just not traded) so the replay
    /// reaches the head. Live-mode rejections never advance anything.
    fn consume_if_recovery(
        &mut self,
        recovery: bool,
        n: u64,
        reject: impl FnOnce(&mut Self) -> Decision,
    ) -> Decision {
        let mut decision = reject(self);
        if recovery {
            self.last = n;
            decision.last_accepted = n;
        }
        decision
    }

    fn reject(
        &mut self,
        signal: &Signal,
        reason: RejectReason,
        age_ms: i64,
        deviation_pips: Option<f64>,
        sync_from: Option<u64>,
    ) -> Decision {
        debug!(
            sequence = signal.sequence,
            reason = %reason,
            state = %self.state,
            "signal rejected"
        );
        Decision {
            verdict: Verdict::Rejected(reason),
            sequence: signal.sequence,
            age_ms,
            deviation_pips,
            state: self.state,
            sync_from,
            last_accepted: self.last,
        }
    }
}

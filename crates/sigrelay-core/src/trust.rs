//! Trust scoring rules.
//!
//! A subscriber's trust score is a bounded integer in `[0, 100]` derived
//! from the protection events in a rolling window. Scoring here is a pure
//! function; the daemon's trust loop owns the lock-read-calculate-write
//! discipline around it.
//!
//! Penalty weights are policy knobs. The defaults reflect how strongly
//! each event class correlates with toxic flow: replayed sequences are a
//! security violation, a late fill is usually just a slow VPS.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::protection::{EventKind, RejectReason};

/// Upper bound of the score range.
pub const MAX_SCORE: i32 = 100;

/// Lower bound of the score range.
pub const MIN_SCORE: i32 = 0;

/// Per-event score deltas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustWeights {
    /// Reward for each successful execution.
    pub success: i32,
    /// Penalty for a TTL expiry (slow VPS or network jitter).
    pub ttl_expired: i32,
    /// Penalty for a price deviation (market volatility, least severe).
    pub price_deviation: i32,
    /// Penalty for a sequence gap (missing signals or replay attempt).
    pub sequence_gap: i32,
    /// Penalty for a duplicate sequence (likely malicious).
    pub duplicate: i32,
    /// Penalty for a replayed sequence (critical security violation).
    pub replay: i32,
    /// Penalty for an invalid signature (security violation).
    pub invalid_signature: i32,
    /// Penalty for an insufficient-funds rejection.
    pub insufficient_funds: i32,
    /// Penalty for a state-locked rejection (consequence of earlier
    /// issues).
    pub state_locked: i32,
    /// Penalty for tripping the rate cap (potential abuse).
    pub rate_limit: i32,
    /// Recovery points per full quiet day with no negative events.
    pub recovery_per_day: i32,
}

impl Default for TrustWeights {
    fn default() -> Self {
        Self {
            success: 1,
            ttl_expired: -5,
            price_deviation: -3,
            sequence_gap: -20,
            duplicate: -30,
            replay: -50,
            invalid_signature: -40,
            insufficient_funds: -10,
            state_locked: -5,
            rate_limit: -15,
            recovery_per_day: 10,
        }
    }
}

impl TrustWeights {
    /// The score delta for one event.
    ///
    /// Two gateway-only reasons have no weight of their own and borrow
    /// the nearest class: `INVALID_CREDENTIAL` scores as
    /// `INVALID_SIGNATURE` (both mean the presenter failed to prove it
    /// is who the stream says it is), and `CLOCK_SKEW` scores as
    /// `TTL_EXPIRED` (both are stale-timestamp symptoms of broken or
    /// slow producer infrastructure).
    #[must_use]
    pub const fn delta(&self, kind: EventKind) -> i32 {
        match kind {
            EventKind::Executed => self.success,
            EventKind::OrderFailed => 0,
            EventKind::Rejected(reason) => match reason {
                RejectReason::TtlExpired | RejectReason::ClockSkew => self.ttl_expired,
                RejectReason::PriceDeviation => self.price_deviation,
                RejectReason::SequenceGap => self.sequence_gap,
                RejectReason::Duplicate => self.duplicate,
                RejectReason::Replay => self.replay,
                RejectReason::InvalidSignature | RejectReason::InvalidCredential => {
                    self.invalid_signature
                }
                RejectReason::InsufficientFunds => self.insufficient_funds,
                RejectReason::StateLocked => self.state_locked,
                RejectReason::RateLimit => self.rate_limit,
            },
        }
    }
}

/// Thresholds for the auto-pause control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustSettings {
    /// Scores strictly below this pause the subscriber's subscriptions.
    pub pause_threshold: i32,
    /// Scores at or above this resume a toxic-paused subscriber.
    pub resume_threshold: i32,
}

impl Default for TrustSettings {
    fn default() -> Self {
        Self {
            pause_threshold: 50,
            resume_threshold: 55,
        }
    }
}

/// Result of one scoring pass for one subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrustOutcome {
    /// Score before this pass.
    pub previous_score: i32,
    /// Score after this pass, clamped to `[0, 100]`.
    pub score: i32,
    /// Raw (unclamped) delta applied.
    pub delta: i32,
    /// Number of window events analyzed.
    pub events_analyzed: usize,
    /// Event counts by stable kind string.
    pub breakdown: BTreeMap<&'static str, u32>,
    /// Whether the score fell below the pause threshold.
    pub should_pause: bool,
    /// Whether the score reached the resume threshold.
    pub should_resume: bool,
    /// Human-readable assessment for operator views.
    pub recommendation: String,
}

/// Score one subscriber from the events in the rolling window.
///
/// `hours_since_last_negative` is the age of the most recent negative
/// event on record (across all history, not just the window); `None`
/// means the subscriber has no negative events at all. The recovery
/// drift applies only when the window itself contains no negative
/// events, awarding [`TrustWeights::recovery_per_day`] per full quiet
/// 24 h period.
#[must_use]
pub fn evaluate(
    current_score: i32,
    window_events: &[EventKind],
    hours_since_last_negative: Option<i64>,
    weights: &TrustWeights,
    settings: &TrustSettings,
) -> TrustOutcome {
    let mut delta = 0i32;
    let mut breakdown: BTreeMap<&'static str, u32> = BTreeMap::new();
    let mut negative_in_window = false;

    for &kind in window_events {
        let d = weights.delta(kind);
        delta += d;
        if d < 0 {
            negative_in_window = true;
        }
        *breakdown.entry(kind.as_str()).or_insert(0) += 1;
    }

    if !negative_in_window {
        if let Some(hours) = hours_since_last_negative {
            let quiet_days = i32::try_from((hours / 24).max(0)).unwrap_or(i32::MAX);
            delta += quiet_days.saturating_mul(weights.recovery_per_day);
        }
    }

    let score = (current_score + delta).clamp(MIN_SCORE, MAX_SCORE);
    let should_pause = score < settings.pause_threshold;
    let should_resume = score >= settings.resume_threshold;
    let recommendation = recommend(score, &breakdown, should_pause, settings);

    TrustOutcome {
        previous_score: current_score,
        score,
        delta,
        events_analyzed: window_events.len(),
        breakdown,
        should_pause,
        should_resume,
        recommendation,
    }
}

fn recommend(
    score: i32,
    breakdown: &BTreeMap<&'static str, u32>,
    should_pause: bool,
    settings: &TrustSettings,
) -> String {
    if should_pause {
        return format!(
            "CRITICAL: trust score {score} is below the pause threshold ({}); subscriber auto-paused. Event breakdown: {breakdown:?}",
            settings.pause_threshold
        );
    }
    if score < 70 {
        return format!(
            "WARNING: trust score {score} is degraded; monitor {breakdown:?} and check the subscriber's VPS and network health"
        );
    }
    if score < 90 {
        return format!("NOTICE: trust score {score} is acceptable; minor issues: {breakdown:?}");
    }
    format!("HEALTHY: trust score {score}; no action required")
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: TrustWeights = TrustWeights {
        success: 1,
        ttl_expired: -5,
        price_deviation: -3,
        sequence_gap: -20,
        duplicate: -30,
        replay: -50,
        invalid_signature: -40,
        insufficient_funds: -10,
        state_locked: -5,
        rate_limit: -15,
        recovery_per_day: 10,
    };

    fn settings() -> TrustSettings {
        TrustSettings::default()
    }

    #[test]
    fn toxic_flow_auto_pause_scenario() {
        // 4x TTL expiry plus one sequence gap takes a clean subscriber
        // from 100 to 60; a rate-cap violation then drops it to 45 and
        // pauses.
        let window = vec![
            EventKind::Rejected(RejectReason::TtlExpired),
            EventKind::Rejected(RejectReason::TtlExpired),
            EventKind::Rejected(RejectReason::TtlExpired),
            EventKind::Rejected(RejectReason::TtlExpired),
            EventKind::Rejected(RejectReason::SequenceGap),
        ];
        let out = evaluate(100, &window, Some(0), &W, &settings());
        assert_eq!(out.score, 60);
        assert!(!out.should_pause);

        let worse = evaluate(
            out.score,
            &[EventKind::Rejected(RejectReason::RateLimit)],
            Some(0),
            &W,
            &settings(),
        );
        assert_eq!(worse.score, 45);
        assert!(worse.should_pause);
        assert!(worse.recommendation.starts_with("CRITICAL"));

        // 24 quiet hours recover one day of drift and cross the resume
        // threshold.
        let recovered = evaluate(worse.score, &[], Some(24), &W, &settings());
        assert_eq!(recovered.score, 55);
        assert!(recovered.should_resume);
    }

    #[test]
    fn successes_reward_and_clamp_at_max() {
        let window = vec![EventKind::Executed; 10];
        let out = evaluate(95, &window, Some(0), &W, &settings());
        assert_eq!(out.score, 100);
        assert_eq!(out.delta, 10);
        assert!(out.recommendation.starts_with("HEALTHY"));
    }

    #[test]
    fn score_never_goes_below_zero() {
        let window = vec![EventKind::Rejected(RejectReason::Replay); 5];
        let out = evaluate(30, &window, Some(0), &W, &settings());
        assert_eq!(out.score, 0);
        assert!(out.should_pause);
    }

    #[test]
    fn recovery_requires_quiet_window() {
        // A negative event inside the window blocks the drift even when
        // the most recent negative event is old.
        let window = vec![EventKind::Rejected(RejectReason::PriceDeviation)];
        let out = evaluate(80, &window, Some(72), &W, &settings());
        assert_eq!(out.score, 77);

        // A quiet window with 3 old quiet days drifts +30.
        let out = evaluate(60, &[], Some(72), &W, &settings());
        assert_eq!(out.score, 90);

        // No negative events on record at all: nothing to recover from.
        let out = evaluate(60, &[], None, &W, &settings());
        assert_eq!(out.score, 60);
    }

    #[test]
    fn order_failures_are_neutral() {
        let out = evaluate(80, &[EventKind::OrderFailed], Some(0), &W, &settings());
        assert_eq!(out.score, 80);
        assert_eq!(out.delta, 0);
    }

    #[test]
    fn gateway_only_reasons_borrow_their_nearest_weight() {
        // No weight of their own: a failed credential scores like a
        // failed signature, clock skew like a TTL expiry.
        assert_eq!(
            W.delta(EventKind::Rejected(RejectReason::InvalidCredential)),
            W.invalid_signature
        );
        assert_eq!(
            W.delta(EventKind::Rejected(RejectReason::ClockSkew)),
            W.ttl_expired
        );
    }

    #[test]
    fn breakdown_counts_by_kind() {
        let window = vec![
            EventKind::Executed,
            EventKind::Executed,
            EventKind::Rejected(RejectReason::TtlExpired),
        ];
        let out = evaluate(90, &window, Some(0), &W, &settings());
        assert_eq!(out.breakdown.get("EXECUTED"), Some(&2));
        assert_eq!(out.breakdown.get("TTL_EXPIRED"), Some(&1));
        assert_eq!(out.events_analyzed, 3);
    }

    #[test]
    fn recommendation_bands() {
        let warn = evaluate(65, &[], None, &W, &settings());
        assert!(warn.recommendation.starts_with("WARNING"));
        let notice = evaluate(85, &[], None, &W, &settings());
        assert!(notice.recommendation.starts_with("NOTICE"));
    }
}

//! Trust loop: periodic reputation recomputation and auto-pause.
//!
//! Per subscriber, every pass follows the lock-read-calculate-write
//! discipline strictly:
//!
//! 1. take the per-subscriber exclusive lock
//! 2. read the current score
//! 3. aggregate the rolling window with weighted deltas
//! 4. clamp to `[0, 100]`
//! 5. apply pause/resume transitions under the per-subscription row lock
//! 6. write the score, release the lock
//!
//! Without step 1, concurrent workers overwrite each other's scores —
//! the serial-equivalence test below pins that behavior.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use sigrelay_core::subscription::{StateEvent, SubscriptionState};
use sigrelay_core::trust::{self, TrustOutcome};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::TrustConfig;
use crate::metrics::DaemonMetrics;
use crate::registry::{Registry, RegistryError};
use crate::sink::ProtectionSink;

/// Attempts for a state transition that loses the version race.
const TRANSITION_RETRY_LIMIT: u32 = 3;

/// Errors from a trust pass.
#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    /// Registry failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Sink failure.
    #[error("protection sink error: {0}")]
    Sink(#[from] crate::sink::SinkError),
}

/// The periodic trust worker.
pub struct TrustLoop {
    config: TrustConfig,
    registry: Arc<Registry>,
    sink: ProtectionSink,
    metrics: DaemonMetrics,
}

impl TrustLoop {
    /// Assemble the loop.
    #[must_use]
    pub fn new(
        config: TrustConfig,
        registry: Arc<Registry>,
        sink: ProtectionSink,
        metrics: DaemonMetrics,
    ) -> Self {
        Self {
            config,
            registry,
            sink,
            metrics,
        }
    }

    /// Run until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(scored) if scored > 0 => {
                            info!(scored, "trust sweep complete");
                        }
                        Ok(_) => {}
                        Err(err) => warn!(%err, "trust sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("trust loop shutting down");
                    return;
                }
            }
        }
    }

    /// One full pass over every subscriber with recent events plus
    /// every paused subscriber (so recovery can happen with no events).
    ///
    /// # Errors
    ///
    /// Returns [`TrustError`] only for work-list failures; per-subscriber
    /// failures are logged and skipped.
    pub async fn sweep(&self) -> Result<usize, TrustError> {
        #[allow(clippy::cast_possible_wrap)]
        let window_ms = self.config.window.as_millis() as i64;
        let since_ms = Utc::now().timestamp_millis() - window_ms;

        let mut subscribers = self.sink.subscribers_since(since_ms)?;
        for paused in self
            .registry
            .subscribers_in_state(SubscriptionState::PausedToxic)?
        {
            if !subscribers.contains(&paused) {
                subscribers.push(paused);
            }
        }

        let mut scored = 0;
        for subscriber_id in subscribers {
            match self.score_subscriber(&subscriber_id, since_ms).await {
                Ok(outcome) => {
                    scored += 1;
                    if outcome.should_pause {
                        info!(
                            subscriber_id,
                            score = outcome.score,
                            recommendation = %outcome.recommendation,
                            "subscriber below pause threshold"
                        );
                    }
                }
                Err(err) => warn!(subscriber_id, %err, "trust pass failed"),
            }
        }
        Ok(scored)
    }

    /// Score one subscriber under its exclusive lock and apply the
    /// resulting transitions.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError`] on store failure.
    pub async fn score_subscriber(
        &self,
        subscriber_id: &str,
        since_ms: i64,
    ) -> Result<TrustOutcome, TrustError> {
        let lock = self.registry.subscriber_lock(subscriber_id);
        let _guard = lock.lock().await;

        let current = self.registry.trust_score(subscriber_id)?;
        let window_events = self.sink.kinds_for_subscriber(subscriber_id, since_ms)?;
        let hours_since_last_negative = self
            .sink
            .last_rejection_ms(subscriber_id)?
            .map(|last| (Utc::now().timestamp_millis() - last) / 3_600_000);

        let outcome = trust::evaluate(
            current,
            &window_events,
            hours_since_last_negative,
            &self.config.weights,
            &self.config.settings,
        );

        if outcome.should_pause {
            self.pause_subscriptions(subscriber_id, &outcome.recommendation)
                .await?;
        } else if outcome.should_resume {
            self.resume_subscriptions(subscriber_id).await?;
        }

        self.registry
            .store_trust_score(subscriber_id, outcome.score)?;
        Ok(outcome)
    }

    /// `score < pause_threshold`: pause every SYNCED / DEGRADED_GAP
    /// subscription of the subscriber.
    async fn pause_subscriptions(
        &self,
        subscriber_id: &str,
        reason: &str,
    ) -> Result<(), TrustError> {
        for subscription in self.registry.subscriptions_for_subscriber(subscriber_id)? {
            if matches!(
                subscription.state,
                SubscriptionState::Synced | SubscriptionState::DegradedGap
            ) {
                self.apply_with_retry(
                    &subscription.subscription_id,
                    StateEvent::TrustBelowThreshold,
                    Some(reason),
                )
                .await;
                self.metrics.trust_pause();
            }
        }
        Ok(())
    }

    /// `score >= resume_threshold`: resume every PAUSED_TOXIC
    /// subscription of the subscriber.
    async fn resume_subscriptions(&self, subscriber_id: &str) -> Result<(), TrustError> {
        for subscription in self.registry.subscriptions_for_subscriber(subscriber_id)? {
            if subscription.state == SubscriptionState::PausedToxic {
                self.apply_with_retry(
                    &subscription.subscription_id,
                    StateEvent::TrustRecovered,
                    Some("trust score recovered"),
                )
                .await;
            }
        }
        Ok(())
    }

    /// Version-conflict losers retry with jitter, bounded.
    async fn apply_with_retry(
        &self,
        subscription_id: &str,
        event: StateEvent,
        reason: Option<&str>,
    ) {
        let row_lock = self.registry.row_lock(subscription_id);
        let _guard = row_lock.lock().await;
        for attempt in 0..TRANSITION_RETRY_LIMIT {
            match self.registry.apply_event(subscription_id, event, reason) {
                Ok(_) => return,
                Err(RegistryError::VersionConflict { .. })
                    if attempt + 1 < TRANSITION_RETRY_LIMIT =>
                {
                    let jitter = rand::thread_rng().gen_range(1..=5);
                    tokio::time::sleep(Duration::from_millis(jitter * u64::from(attempt + 1)))
                        .await;
                }
                Err(RegistryError::InvalidTransition(_)) => return, // state moved on
                Err(err) => {
                    warn!(subscription_id, %err, "state transition failed");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigrelay_core::policy::Policy;
    use sigrelay_core::protection::{EventKind, ProtectionEvent, RejectReason};
    use crate::metrics::MetricsRegistry;

    fn harness() -> (Arc<TrustLoop>, Arc<Registry>, ProtectionSink) {
        let registry = Arc::new(Registry::in_memory().unwrap());
        let sink = ProtectionSink::in_memory().unwrap();
        let metrics = MetricsRegistry::new().unwrap();
        let trust = Arc::new(TrustLoop::new(
            TrustConfig::default(),
            Arc::clone(&registry),
            sink.clone(),
            metrics.daemon().clone(),
        ));
        (trust, registry, sink)
    }

    fn record(sink: &ProtectionSink, subscriber: &str, kind: EventKind, time_ms: i64) {
        sink.record(&ProtectionEvent::new(
            "sub-x",
            subscriber,
            time_ms,
            kind,
            1,
            time_ms,
            time_ms,
            0,
            SubscriptionState::Synced,
        ))
        .unwrap();
    }

    #[tokio::test]
    async fn toxic_window_pauses_subscriptions() {
        let (trust, registry, sink) = harness();
        let sub = registry
            .create_subscription("user-1", "master-1", &Policy::default())
            .unwrap();
        let now = Utc::now().timestamp_millis();
        // -20 (4x ttl), -20 gap, -15 rate limit: 100 -> 45, below 50.
        for _ in 0..4 {
            record(&sink, "user-1", EventKind::Rejected(RejectReason::TtlExpired), now);
        }
        record(&sink, "user-1", EventKind::Rejected(RejectReason::SequenceGap), now);
        record(&sink, "user-1", EventKind::Rejected(RejectReason::RateLimit), now);

        let scored = trust.sweep().await.unwrap();
        assert_eq!(scored, 1);
        assert_eq!(registry.trust_score("user-1").unwrap(), 45);
        let snap = registry.snapshot(&sub.subscription_id).unwrap().unwrap();
        assert_eq!(snap.state, SubscriptionState::PausedToxic);
    }

    #[tokio::test]
    async fn quiet_paused_subscriber_recovers() {
        let (trust, registry, sink) = harness();
        let sub = registry
            .create_subscription("user-1", "master-1", &Policy::default())
            .unwrap();
        registry
            .apply_event(&sub.subscription_id, StateEvent::TrustBelowThreshold, None)
            .unwrap();
        registry.store_trust_score("user-1", 45).unwrap();
        // Last rejection was 24h+ ago, outside the window.
        let old = Utc::now().timestamp_millis() - 25 * 3_600_000;
        record(&sink, "user-1", EventKind::Rejected(RejectReason::TtlExpired), old);

        let scored = trust.sweep().await.unwrap();
        assert_eq!(scored, 1);
        // 45 + 10 (one quiet day) = 55, at the resume threshold.
        assert_eq!(registry.trust_score("user-1").unwrap(), 55);
        let snap = registry.snapshot(&sub.subscription_id).unwrap().unwrap();
        assert_eq!(snap.state, SubscriptionState::Synced);
    }

    #[tokio::test]
    async fn paused_subscriber_stays_paused_below_resume() {
        let (trust, registry, _sink) = harness();
        let sub = registry
            .create_subscription("user-1", "master-1", &Policy::default())
            .unwrap();
        registry
            .apply_event(&sub.subscription_id, StateEvent::TrustBelowThreshold, None)
            .unwrap();
        registry.store_trust_score("user-1", 52).unwrap();

        trust.sweep().await.unwrap();
        // 52 is above pause (50) but below resume (55): no transition
        // either way, and no recovery drift without a prior rejection.
        assert_eq!(registry.trust_score("user-1").unwrap(), 52);
        let snap = registry.snapshot(&sub.subscription_id).unwrap().unwrap();
        assert_eq!(snap.state, SubscriptionState::PausedToxic);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_passes_are_serially_equivalent() {
        let (trust, registry, sink) = harness();
        registry
            .create_subscription("user-1", "master-1", &Policy::default())
            .unwrap();
        let now = Utc::now().timestamp_millis();
        record(&sink, "user-1", EventKind::Rejected(RejectReason::TtlExpired), now);

        let since = now - 3_600_000;
        let mut handles = Vec::new();
        for _ in 0..4 {
            let trust = Arc::clone(&trust);
            handles.push(tokio::spawn(async move {
                trust.score_subscriber("user-1", since).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        // Four serial passes each apply the window's -5: 100 -> 80. Any
        // lost update would leave a higher score.
        assert_eq!(registry.trust_score("user-1").unwrap(), 80);
    }
}

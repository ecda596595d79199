//! Fan-out distributor: per-subscription ordered push channels to live
//! receivers.
//!
//! Each receiver holds one long-lived bidirectional connection. After
//! the handshake the receiver advertises its durable
//! `last_accepted_sequence`; delivery resumes from the log strictly
//! after that point, in append order. The delivery cursor advances only
//! on a positive receiver ack — a receiver-side admission rejection does
//! not retract it, because from the server's view the signal WAS
//! delivered; the receiver's protection report describes what it did
//! with it.
//!
//! Disconnect abandons any buffered delivery; reconnect renegotiates
//! from the advertised cursor. Retries therefore happen only across
//! reconnects, never on the same open channel: the receiver is
//! authoritative about what it has.
//!
//! # Full-sync mode
//!
//! A `DEGRADED_GAP` subscription switches this channel into replay: the
//! send position rewinds to the receiver's `have_through` and every
//! missing signal streams in order with the replay flag set (the
//! receiver feeds those through its gap-recovery entry point). When the
//! receiver's acks reach the master stream head, the subscription
//! transitions back to `SYNCED` and the channel returns to live push.
//! Replay per round is bounded by configuration; past the cap the
//! subscription stays `DEGRADED_GAP` for operator action.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use sigrelay_core::protection::{EventKind, ProtectionEvent, RejectReason};
use sigrelay_core::subscription::{StateEvent, SubscriptionState};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use sigrelay_core::protocol::{ProtocolError, ReceiverReport, WireCodec, WireMessage};

use crate::config::PushConfig;
use crate::ingest::MasterStreams;
use crate::log::SignalLog;
use crate::metrics::DaemonMetrics;
use crate::registry::{Registry, RegistryError};
use crate::sink::ProtectionSink;
use crate::wallet::WalletOracle;

/// The receiver-facing push server.
pub struct PushServer {
    config: PushConfig,
    registry: Arc<Registry>,
    log: Arc<dyn SignalLog>,
    sink: ProtectionSink,
    streams: Arc<MasterStreams>,
    metrics: DaemonMetrics,
    wallet: Arc<dyn WalletOracle>,
}

/// Per-session delivery bookkeeping.
struct Session {
    subscription_id: String,
    subscriber_id: String,
    master_id: String,
    /// Highest sequence pushed on this channel.
    sent_through: u64,
    /// Highest sequence positively acked by the receiver.
    acked_through: u64,
    /// Whether the channel is in gap-recovery replay.
    replaying: bool,
    /// Signals replayed in the current sync round (bounded).
    replayed_this_round: usize,
}

impl PushServer {
    /// Assemble the push server.
    #[must_use]
    pub fn new(
        config: PushConfig,
        registry: Arc<Registry>,
        log: Arc<dyn SignalLog>,
        sink: ProtectionSink,
        streams: Arc<MasterStreams>,
        metrics: DaemonMetrics,
        wallet: Arc<dyn WalletOracle>,
    ) -> Self {
        Self {
            config,
            registry,
            log,
            sink,
            streams,
            metrics,
            wallet,
        }
    }

    /// Accept loop. Returns when `shutdown` flips.
    ///
    /// # Errors
    ///
    /// Returns the bind/accept error that stopped the loop.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        info!(bind = %listener.local_addr()?, "push distributor listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    stream.set_nodelay(true).ok();
                    let server = Arc::clone(&self);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        server.metrics.connection_opened("receiver");
                        if let Err(err) = server.handle_connection(stream, addr, shutdown).await {
                            debug!(%addr, %err, "receiver connection ended");
                        }
                        server.metrics.connection_closed("receiver");
                    });
                }
                _ = shutdown.changed() => {
                    info!("push distributor shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ProtocolError> {
        let mut framed = Framed::new(stream, WireCodec::new());

        // Handshake: Hello with the license token.
        let hello = timeout(self.config.io_timeout, framed.next())
            .await
            .map_err(|_| ProtocolError::Timeout { operation: "handshake" })?
            .ok_or_else(|| ProtocolError::malformed("closed before handshake"))??;
        let WireMessage::Hello { token } = hello else {
            return Err(ProtocolError::malformed("expected Hello"));
        };

        let snapshot = match self.registry.resolve_token(&token) {
            Ok(credential) => credential.snapshot,
            Err(err) => {
                warn!(%addr, %err, "receiver handshake rejected");
                self.send(
                    &mut framed,
                    WireMessage::HelloAck {
                        accepted: false,
                        reason: Some(RejectReason::InvalidCredential.as_str().to_string()),
                    },
                )
                .await?;
                return Ok(());
            }
        };
        self.send(
            &mut framed,
            WireMessage::HelloAck {
                accepted: true,
                reason: None,
            },
        )
        .await?;

        // The receiver advertises its durable position; it is
        // authoritative for where delivery resumes.
        let resume = timeout(self.config.io_timeout, framed.next())
            .await
            .map_err(|_| ProtocolError::Timeout { operation: "resume" })?
            .ok_or_else(|| ProtocolError::malformed("closed before resume"))??;
        let WireMessage::Resume { last_accepted } = resume else {
            return Err(ProtocolError::malformed("expected Resume"));
        };

        info!(
            %addr,
            subscription_id = %snapshot.subscription_id,
            last_accepted,
            "receiver attached"
        );

        let mut session = Session {
            subscription_id: snapshot.subscription_id.clone(),
            subscriber_id: snapshot.subscriber_id.clone(),
            master_id: snapshot.master_id.clone(),
            sent_through: last_accepted,
            acked_through: last_accepted,
            replaying: snapshot.state == SubscriptionState::DegradedGap,
            replayed_this_round: 0,
        };

        let mut head = self.streams.watch_head(&session.master_id);
        let mut idle = tokio::time::interval(self.config.idle_poll);
        idle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        // Initial catch-up before waiting on the head watch.
        self.deliver(&mut framed, &mut session).await?;
        self.maybe_finish_sync(&mut framed, &mut session).await?;

        loop {
            tokio::select! {
                frame = framed.next() => {
                    let Some(message) = frame else { return Ok(()) };
                    self.handle_receiver_message(&mut framed, &mut session, message?).await?;
                }
                changed = head.changed() => {
                    if changed.is_ok() {
                        self.deliver(&mut framed, &mut session).await?;
                    }
                }
                _ = idle.tick() => {
                    // State may have changed off-channel (trust loop,
                    // admin); re-evaluate even without new signals.
                    self.deliver(&mut framed, &mut session).await?;
                    self.maybe_finish_sync(&mut framed, &mut session).await?;
                }
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    async fn handle_receiver_message(
        &self,
        framed: &mut Framed<TcpStream, WireCodec>,
        session: &mut Session,
        message: WireMessage,
    ) -> Result<(), ProtocolError> {
        match message {
            WireMessage::Ack { last_accepted } => {
                self.metrics.ack_received();
                session.acked_through = session.acked_through.max(last_accepted);
                self.commit_ack(session, last_accepted).await;
                self.maybe_finish_sync(framed, session).await?;
            }
            WireMessage::SyncRequest { have_through } => {
                info!(
                    subscription_id = %session.subscription_id,
                    have_through,
                    "receiver requested full sync"
                );
                self.enter_degraded_gap(session).await;
                session.replaying = true;
                session.replayed_this_round = 0;
                session.sent_through = have_through;
                session.acked_through = session.acked_through.min(have_through);
                self.deliver(framed, session).await?;
            }
            WireMessage::Report(report) => {
                self.record_report(session, &report).await;
            }
            other => {
                return Err(ProtocolError::UnexpectedMessage {
                    message_type: other.tag(),
                })
            }
        }
        Ok(())
    }

    /// Push pending signals according to the subscription's state.
    async fn deliver(
        &self,
        framed: &mut Framed<TcpStream, WireCodec>,
        session: &mut Session,
    ) -> Result<(), ProtocolError> {
        let state = self
            .registry
            .snapshot(&session.subscription_id)
            .ok()
            .flatten()
            .map(|s| s.state);
        let Some(state) = state else {
            // Subscription deleted out from under the session.
            return Err(ProtocolError::malformed("subscription gone"));
        };

        let replaying = state == SubscriptionState::DegradedGap;
        session.replaying = replaying;

        if !replaying && self.config.suppress_non_synced && !state.delivers_live() {
            return Ok(());
        }

        if replaying && session.replayed_this_round >= self.config.max_sync_batch {
            // Bounded replay: stay DEGRADED_GAP pending operator action.
            return Ok(());
        }

        loop {
            let batch =
                self.log
                    .read_after_sequence(&session.master_id, session.sent_through, self.config.batch);
            let batch = match batch {
                Ok(batch) => batch,
                Err(err) => {
                    warn!(%err, "log read failed during delivery");
                    return Ok(());
                }
            };
            if batch.is_empty() {
                return Ok(());
            }
            for (_offset, signal) in batch {
                if replaying && session.replayed_this_round >= self.config.max_sync_batch {
                    return Ok(());
                }
                let sequence = signal.sequence;
                self.send(
                    framed,
                    WireMessage::Push {
                        signal,
                        replay: replaying,
                    },
                )
                .await?;
                self.metrics.push_delivered();
                session.sent_through = sequence;
                if replaying {
                    session.replayed_this_round += 1;
                }
            }
        }
    }

    /// Persist a positive ack: server-side sequence, delivery cursor.
    async fn commit_ack(&self, session: &Session, last_accepted: u64) {
        let row_lock = self.registry.row_lock(&session.subscription_id);
        let _guard = row_lock.lock().await;
        if let Err(err) = self
            .registry
            .record_accepted_sequence(&session.subscription_id, last_accepted)
        {
            match err {
                RegistryError::SequenceRegression { .. } => {
                    // Stale ack after a server-side catch-up; harmless.
                }
                err => warn!(%err, "failed to record acked sequence"),
            }
        }
        if let Err(err) = self
            .registry
            .advance_delivery_cursor(&session.subscription_id, last_accepted)
        {
            warn!(%err, "failed to advance delivery cursor");
        }
    }

    /// If a replay round has caught up with the stream head, complete
    /// the sync: DEGRADED_GAP -> SYNCED plus a SyncComplete frame.
    async fn maybe_finish_sync(
        &self,
        framed: &mut Framed<TcpStream, WireCodec>,
        session: &mut Session,
    ) -> Result<(), ProtocolError> {
        if !session.replaying {
            return Ok(());
        }
        let head = self.streams.last_sequence(&session.master_id);
        if session.acked_through < head {
            return Ok(());
        }
        let row_lock = self.registry.row_lock(&session.subscription_id);
        let _guard = row_lock.lock().await;
        match self
            .registry
            .apply_event(&session.subscription_id, StateEvent::FullSyncDone, None)
        {
            Ok(_) => {
                session.replaying = false;
                session.replayed_this_round = 0;
                self.send(framed, WireMessage::SyncComplete).await?;
                info!(
                    subscription_id = %session.subscription_id,
                    through = session.acked_through,
                    "full sync complete"
                );
            }
            Err(RegistryError::InvalidTransition(_)) => {
                // Not DEGRADED_GAP server-side (e.g. paused mid-sync);
                // nothing to complete.
                session.replaying = false;
            }
            Err(err) => warn!(%err, "failed to complete full sync"),
        }
        Ok(())
    }

    /// Server-side half of gap handling: the registry transition.
    async fn enter_degraded_gap(&self, session: &Session) {
        let row_lock = self.registry.row_lock(&session.subscription_id);
        let _guard = row_lock.lock().await;
        match self
            .registry
            .apply_event(&session.subscription_id, StateEvent::GapReported, None)
        {
            Ok(_) | Err(RegistryError::InvalidTransition(_)) => {}
            Err(err) => warn!(%err, "failed to enter DEGRADED_GAP"),
        }
    }

    /// Store a receiver report and mirror its state consequences.
    async fn record_report(&self, session: &Session, report: &ReceiverReport) {
        let now_ms = Utc::now().timestamp_millis();
        let mut event = ProtectionEvent::new(
            session.subscription_id.clone(),
            session.subscriber_id.clone(),
            now_ms,
            report.kind,
            report.sequence,
            report.generated_at_ms,
            report.arrival_time_ms,
            report.observed_latency_ms,
            report.state,
        );
        event.observed_deviation_pips = report.observed_deviation_pips;
        event.wallet_balance = self.wallet.balance_hint(&session.subscriber_id);
        if let Err(err) = self.sink.record(&event) {
            warn!(%err, "failed to record receiver report");
        }
        if let EventKind::Rejected(reason) = report.kind {
            self.metrics.rejection(reason.as_str());
            if reason == RejectReason::InsufficientFunds {
                let row_lock = self.registry.row_lock(&session.subscription_id);
                let _guard = row_lock.lock().await;
                match self.registry.apply_event(
                    &session.subscription_id,
                    StateEvent::WalletEmpty,
                    Some("receiver reported insufficient funds"),
                ) {
                    Ok(_) | Err(RegistryError::InvalidTransition(_)) => {}
                    Err(err) => warn!(%err, "failed to lock subscription for funds"),
                }
            }
        }
    }

    async fn send(
        &self,
        framed: &mut Framed<TcpStream, WireCodec>,
        message: WireMessage,
    ) -> Result<(), ProtocolError> {
        timeout(self.config.io_timeout, framed.send(message))
            .await
            .map_err(|_| ProtocolError::Timeout { operation: "write" })?
    }
}

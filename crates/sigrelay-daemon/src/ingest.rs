//! Hot-path ingest gateway.
//!
//! Accepts framed, signed signal packets from masters over long-lived
//! TCP connections, validates cheaply and fails fast, and commits each
//! accepted signal to the signal log in order. Latency target is
//! sub-20 ms p99 from socket read to log commit, so nothing on this path
//! blocks on a per-subscription lock: registry reads are snapshots and
//! the only synchronization is the bounded log-client pool.
//!
//! Per-packet pipeline, in order:
//!
//! 1. credential resolution (`INVALID_CREDENTIAL`)
//! 2. keyed-MAC verification (`INVALID_SIGNATURE`, constant time)
//! 3. per-master strict monotonicity (`DUPLICATE` / `REPLAY`; gaps are
//!    permitted here, gap detection is a receiver concern)
//! 4. bounded freshness vs the wall clock (`CLOCK_SKEW`)
//! 5. server stamp
//! 6. durable append (`LOG_UNAVAILABLE`; the producer is not acked)
//! 7. bounded ack
//!
//! Framing or decode errors are connection-fatal. Repeated invalid
//! signatures close the connection. The rate cap rejects without
//! closing.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use sigrelay_core::protection::{EventKind, ProtectionEvent, RejectReason};
use sigrelay_core::signal::Signal;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use sigrelay_core::protocol::{ProtocolError, WireCodec, WireMessage};

use crate::config::IngestConfig;
use crate::log::SignalLog;
use crate::metrics::DaemonMetrics;
use crate::registry::{Registry, SubscriptionSnapshot};
use crate::sink::ProtectionSink;

// ============================================================================
// Master stream table
// ============================================================================

struct StreamEntry {
    last_sequence: u64,
    head_tx: watch::Sender<u64>,
}

/// In-memory view of every master stream: the last accepted sequence
/// (authoritative for ingest monotonicity) and a watch channel that
/// push sessions use to learn about new appends without polling.
///
/// Entries hydrate lazily from the log head, so a daemon restart does
/// not reset monotonicity.
pub struct MasterStreams {
    log: Arc<dyn SignalLog>,
    inner: Mutex<HashMap<String, StreamEntry>>,
}

impl MasterStreams {
    /// Stream table backed by `log` for hydration.
    #[must_use]
    pub fn new(log: Arc<dyn SignalLog>) -> Self {
        Self {
            log,
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn with_entry<T>(&self, master_id: &str, f: impl FnOnce(&mut StreamEntry) -> T) -> T {
        let mut inner = self.inner.lock().expect("stream table poisoned");
        if !inner.contains_key(master_id) {
            let head = self
                .log
                .head_sequence(master_id)
                .ok()
                .flatten()
                .unwrap_or(0);
            let (head_tx, _) = watch::channel(head);
            inner.insert(
                master_id.to_string(),
                StreamEntry {
                    last_sequence: head,
                    head_tx,
                },
            );
        }
        f(inner.get_mut(master_id).expect("entry just inserted"))
    }

    /// Last accepted sequence for a master stream.
    pub fn last_sequence(&self, master_id: &str) -> u64 {
        self.with_entry(master_id, |entry| entry.last_sequence)
    }

    /// Record an accepted append and wake push sessions.
    pub fn advance(&self, master_id: &str, sequence: u64) {
        self.with_entry(master_id, |entry| {
            entry.last_sequence = sequence;
            let _ = entry.head_tx.send(sequence);
        });
    }

    /// Watch the head sequence of a master stream.
    pub fn watch_head(&self, master_id: &str) -> watch::Receiver<u64> {
        self.with_entry(master_id, |entry| entry.head_tx.subscribe())
    }
}

// ============================================================================
// Rate limiter
// ============================================================================

/// Token bucket guarding a single producer connection.
///
/// Tokens are stored scaled by 1000 so sub-second refill keeps
/// precision without floats. Single-owner (one per connection task), so
/// no interior locking.
pub struct RateLimiter {
    tokens: u64,
    rate: u64,
    burst: u64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Limiter allowing `rate` packets/second with `burst` capacity.
    #[must_use]
    pub fn new(rate: u64, burst: u64) -> Self {
        Self {
            tokens: burst * 1000,
            rate,
            burst,
            last_refill: Instant::now(),
        }
    }

    /// Consume one token if available.
    pub fn allow(&mut self) -> bool {
        let now = Instant::now();
        #[allow(clippy::cast_possible_truncation)] // fits for any real uptime
        let elapsed_ms = now.duration_since(self.last_refill).as_millis() as u64;
        if elapsed_ms > 0 {
            self.tokens = (self.tokens + elapsed_ms * self.rate).min(self.burst * 1000);
            self.last_refill = now;
        }
        if self.tokens < 1000 {
            return false;
        }
        self.tokens -= 1000;
        true
    }
}

// ============================================================================
// Gateway
// ============================================================================

/// Outcome of the per-packet pipeline.
enum PacketOutcome {
    /// Committed to the log.
    Accepted,
    /// Rejected; connection stays open.
    Rejected(RejectReason),
    /// Rejected; connection must close (credential gone mid-stream).
    RejectedFatal(RejectReason),
    /// System failure (not subscriber misbehavior); the packet fails
    /// with this reason string and the producer resends under its own
    /// monotonicity.
    Failed(&'static str),
}

/// The ingest gateway. One instance serves every producer connection.
pub struct IngestServer {
    config: IngestConfig,
    registry: Arc<Registry>,
    log: Arc<dyn SignalLog>,
    sink: ProtectionSink,
    streams: Arc<MasterStreams>,
    metrics: DaemonMetrics,
    keys: Arc<HashMap<String, Vec<u8>>>,
    append_permits: Arc<Semaphore>,
}

impl IngestServer {
    /// Assemble the gateway.
    #[must_use]
    pub fn new(
        config: IngestConfig,
        registry: Arc<Registry>,
        log: Arc<dyn SignalLog>,
        sink: ProtectionSink,
        streams: Arc<MasterStreams>,
        metrics: DaemonMetrics,
        keys: Arc<HashMap<String, Vec<u8>>>,
    ) -> Self {
        let append_permits = Arc::new(Semaphore::new(config.log_pool_size));
        Self {
            config,
            registry,
            log,
            sink,
            streams,
            metrics,
            keys,
            append_permits,
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
        info!(bind = %listener.local_addr()?, "ingest gateway listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    stream.set_nodelay(true).ok();
                    let server = Arc::clone(&self);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        server.metrics.connection_opened("producer");
                        if let Err(err) = server.handle_connection(stream, addr, shutdown).await {
                            debug!(%addr, %err, "producer connection ended");
                        }
                        server.metrics.connection_closed("producer");
                    });
                }
                _ = shutdown.changed() => {
                    info!("ingest gateway shutting down");
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

        // Handshake: one Hello frame within the deadline.
        let hello = timeout(self.config.handshake_timeout, framed.next())
            .await
            .map_err(|_| ProtocolError::Timeout { operation: "handshake" })?
            .ok_or_else(|| ProtocolError::malformed("closed before handshake"))??;
        let token = match hello {
            WireMessage::Hello { token } => token,
            other => {
                return Err(ProtocolError::UnexpectedMessage {
                    message_type: other.tag(),
                })
            }
        };

        match self.registry.resolve_token(&token) {
            Ok(credential) => {
                self.send(
                    &mut framed,
                    WireMessage::HelloAck {
                        accepted: true,
                        reason: None,
                    },
                )
                .await?;
                info!(%addr, master_id = %credential.snapshot.master_id, "producer authenticated");
            }
            Err(err) => {
                warn!(%addr, %err, "producer handshake rejected");
                self.metrics
                    .rejection(RejectReason::InvalidCredential.as_str());
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
        }

        let mut limiter = RateLimiter::new(self.config.rate_per_sec, self.config.burst);
        let mut consecutive_bad_signatures = 0u32;

        loop {
            let frame = tokio::select! {
                frame = framed.next() => frame,
                _ = shutdown.changed() => return Ok(()),
            };
            let Some(message) = frame else {
                return Ok(()); // clean disconnect
            };
            let received_at = Instant::now();
            // Decode errors are connection-fatal: no mid-stream resync.
            let signal = match message? {
                WireMessage::SignalPacket(signal) => signal,
                other => {
                    self.metrics.rejection("PROTOCOL_VIOLATION");
                    return Err(ProtocolError::UnexpectedMessage {
                        message_type: other.tag(),
                    });
                }
            };
            let sequence = signal.sequence;

            if !limiter.allow() {
                self.reject(&mut framed, &token, &signal, RejectReason::RateLimit)
                    .await?;
                continue;
            }

            match self.process_packet(&token, signal, received_at) {
                PacketOutcome::Accepted => {
                    self.send(
                        &mut framed,
                        WireMessage::IngestAck {
                            sequence,
                            accepted: true,
                            reason: None,
                        },
                    )
                    .await?;
                }
                PacketOutcome::Rejected(reason) => {
                    if reason == RejectReason::InvalidSignature {
                        consecutive_bad_signatures += 1;
                    } else {
                        consecutive_bad_signatures = 0;
                    }
                    self.ack_rejection(&mut framed, sequence, reason).await?;
                    if consecutive_bad_signatures >= self.config.invalid_signature_close_after {
                        warn!(%addr, "closing connection after repeated invalid signatures");
                        return Ok(());
                    }
                }
                PacketOutcome::RejectedFatal(reason) => {
                    self.ack_rejection(&mut framed, sequence, reason).await?;
                    return Ok(());
                }
                PacketOutcome::Failed(reason) => {
                    consecutive_bad_signatures = 0;
                    self.send(
                        &mut framed,
                        WireMessage::IngestAck {
                            sequence,
                            accepted: false,
                            reason: Some(reason.to_string()),
                        },
                    )
                    .await?;
                }
            }
        }
    }

    /// The per-packet pipeline. Synchronous: every step is an in-memory
    /// or local-store operation bounded well below the I/O deadlines.
    fn process_packet(
        &self,
        token: &str,
        mut signal: Signal,
        received_at: Instant,
    ) -> PacketOutcome {
        // 1. Credential resolution, re-done per packet so revocation is
        //    immediate.
        let Ok(credential) = self.registry.resolve_token(token) else {
            self.metrics
                .rejection(RejectReason::InvalidCredential.as_str());
            return PacketOutcome::RejectedFatal(RejectReason::InvalidCredential);
        };
        let snapshot = credential.snapshot;
        if signal.subscription_id != snapshot.subscription_id {
            // Emitting under someone else's stream id is a credential
            // problem, not a stream problem.
            return self.record_rejection(&snapshot, &signal, RejectReason::InvalidCredential);
        }
        if let Err(err) = signal.validate() {
            debug!(%err, sequence = signal.sequence, "structurally invalid packet");
            return PacketOutcome::Failed("MALFORMED_PACKET");
        }

        // 2. Signature check before anything trusts the payload.
        let Some(secret) = self.keys.get(&snapshot.policy.secret_key_ref) else {
            error!(
                key_ref = %snapshot.policy.secret_key_ref,
                "no MAC secret configured; failing closed"
            );
            return self.record_rejection(&snapshot, &signal, RejectReason::InvalidSignature);
        };
        if !signal.verify(secret) {
            return self.record_rejection(&snapshot, &signal, RejectReason::InvalidSignature);
        }

        // 3. Stream monotonicity. Gaps are allowed: the master's stream
        //    is authoritative and gap detection is the receiver's job.
        let last = self.streams.last_sequence(&snapshot.master_id);
        if signal.sequence <= last {
            let reason = if signal.sequence == last {
                RejectReason::Duplicate
            } else {
                RejectReason::Replay
            };
            return self.record_rejection(&snapshot, &signal, reason);
        }

        // 4. Bounded freshness: wall-clock sanity, not fill-safety (TTL
        //    is the receiver's decision).
        let now_ms = Utc::now().timestamp_millis();
        #[allow(clippy::cast_possible_wrap)]
        let skew_bound = self.config.max_clock_skew.as_millis() as i64;
        if (now_ms - signal.generated_at_ms).abs() > skew_bound {
            return self.record_rejection(&snapshot, &signal, RejectReason::ClockSkew);
        }

        // 5. Server stamp: assigned exactly once, here.
        signal.server_arrival_ms = Some(now_ms);
        signal.master_id = snapshot.master_id.clone();

        // 6. Append under a borrowed log client; exhaustion fails the
        //    packet rather than queueing behind it.
        let Ok(_permit) = self.append_permits.try_acquire() else {
            self.metrics.log_append_error();
            return self.log_unavailable(&snapshot, &signal);
        };
        if let Err(err) = self.log.append(&signal) {
            error!(%err, master_id = %snapshot.master_id, "signal log append failed");
            self.metrics.log_append_error();
            return self.log_unavailable(&snapshot, &signal);
        }

        self.streams.advance(&snapshot.master_id, signal.sequence);
        self.metrics
            .signal_accepted(received_at.elapsed().as_secs_f64());
        PacketOutcome::Accepted
    }

    fn record_rejection(
        &self,
        snapshot: &SubscriptionSnapshot,
        signal: &Signal,
        reason: RejectReason,
    ) -> PacketOutcome {
        self.metrics.rejection(reason.as_str());
        let now_ms = Utc::now().timestamp_millis();
        let event = ProtectionEvent::new(
            snapshot.subscription_id.clone(),
            snapshot.subscriber_id.clone(),
            now_ms,
            EventKind::Rejected(reason),
            signal.sequence,
            signal.generated_at_ms,
            signal.server_arrival_ms.unwrap_or(0),
            signal.age_ms(now_ms),
            snapshot.state,
        );
        if let Err(err) = self.sink.record(&event) {
            // A missing record must read as system failure, never as
            // "nothing happened".
            error!(%err, "failed to record gateway protection event");
        }
        PacketOutcome::Rejected(reason)
    }

    fn log_unavailable(&self, snapshot: &SubscriptionSnapshot, signal: &Signal) -> PacketOutcome {
        debug!(
            subscription_id = %snapshot.subscription_id,
            sequence = signal.sequence,
            "log unavailable; failing packet"
        );
        self.metrics.rejection("LOG_UNAVAILABLE");
        PacketOutcome::Failed("LOG_UNAVAILABLE")
    }

    async fn reject(
        &self,
        framed: &mut Framed<TcpStream, WireCodec>,
        token: &str,
        signal: &Signal,
        reason: RejectReason,
    ) -> Result<(), ProtocolError> {
        if let Ok(credential) = self.registry.resolve_token(token) {
            let _ = self.record_rejection(&credential.snapshot, signal, reason);
        } else {
            self.metrics.rejection(reason.as_str());
        }
        self.ack_rejection(framed, signal.sequence, reason).await
    }

    async fn ack_rejection(
        &self,
        framed: &mut Framed<TcpStream, WireCodec>,
        sequence: u64,
        reason: RejectReason,
    ) -> Result<(), ProtocolError> {
        self.send(
            framed,
            WireMessage::IngestAck {
                sequence,
                accepted: false,
                reason: Some(reason.as_str().to_string()),
            },
        )
        .await
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

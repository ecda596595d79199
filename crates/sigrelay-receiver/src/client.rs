//! Push-channel client: keeps one receiver attached to the daemon.
//!
//! One session = one TCP connection: handshake with the license token,
//! advertise the durable `last_accepted_sequence`, then feed every
//! pushed signal through the [`ExecutionGuard`] and report back. The
//! report is best-effort by design (a lost event is tolerated
//! server-side), but within a live session every decision produces
//! exactly one report frame.
//!
//! Reconnection policy lives in the binary: a session returning `Ok`
//! means the server closed cleanly; any error means reconnect with
//! backoff and renegotiate from the sequence file.

use futures::{SinkExt, StreamExt};
use sigrelay_core::protocol::{ProtocolError, ReceiverReport, WireCodec, WireMessage};
use sigrelay_core::signal::Signal;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::guard::{Decision, ExecutionGuard, Verdict};

/// Errors ending a client session.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// TCP connect failure.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        /// Server address.
        addr: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The server rejected the handshake; reconnecting will not help
    /// until the credential changes.
    #[error("handshake rejected: {reason}")]
    HandshakeRejected {
        /// Server-provided reason.
        reason: String,
    },

    /// Protocol violation or socket failure mid-session.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Run one session against `addr` until the connection ends.
///
/// # Errors
///
/// Returns [`ClientError`] describing why the session ended; a clean
/// server-side close returns `Ok`.
pub async fn run_session(
    addr: &str,
    token: &str,
    guard: &mut ExecutionGuard,
) -> Result<(), ClientError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| ClientError::Connect {
            addr: addr.to_string(),
            source,
        })?;
    stream.set_nodelay(true).ok();
    let mut framed = Framed::new(stream, WireCodec::new());

    framed
        .send(WireMessage::Hello {
            token: token.to_string(),
        })
        .await?;
    let ack = framed
        .next()
        .await
        .ok_or_else(|| ProtocolError::malformed("closed during handshake"))??;
    match ack {
        WireMessage::HelloAck { accepted: true, .. } => {}
        WireMessage::HelloAck { reason, .. } => {
            return Err(ClientError::HandshakeRejected {
                reason: reason.unwrap_or_else(|| "unspecified".to_string()),
            });
        }
        other => {
            return Err(ProtocolError::UnexpectedMessage {
                message_type: other.tag(),
            }
            .into())
        }
    }

    let last = guard.last_accepted();
    framed
        .send(WireMessage::Resume {
            last_accepted: last,
        })
        .await?;
    info!(addr, last_accepted = last, "attached to distributor");

    while let Some(message) = framed.next().await {
        match message? {
            WireMessage::Push { signal, replay } => {
                let decision = if replay {
                    guard.admit_recovery(&signal)
                } else {
                    guard.admit(&signal)
                };
                report_decision(&mut framed, &signal, &decision).await?;
            }
            WireMessage::SyncComplete => {
                info!("full sync complete; back to live admission");
                guard.mark_synced();
            }
            other => {
                return Err(ProtocolError::UnexpectedMessage {
                    message_type: other.tag(),
                }
                .into())
            }
        }
    }
    debug!("server closed the push channel");
    Ok(())
}

/// One decision, one report frame, one ack; plus the sync request when
/// the sequence guard found a gap.
async fn report_decision(
    framed: &mut Framed<TcpStream, WireCodec>,
    signal: &Signal,
    decision: &Decision,
) -> Result<(), ProtocolError> {
    match &decision.verdict {
        Verdict::Executed { ticket } => {
            info!(
                sequence = decision.sequence,
                ticket, "signal executed"
            );
        }
        Verdict::Rejected(reason) => {
            warn!(
                sequence = decision.sequence,
                reason = %reason,
                age_ms = decision.age_ms,
                "signal rejected"
            );
        }
        Verdict::ExecutionFailed { detail } => {
            warn!(
                sequence = decision.sequence,
                detail, "order placement failed"
            );
        }
    }

    let report = ReceiverReport {
        kind: decision.kind(),
        sequence: decision.sequence,
        generated_at_ms: signal.generated_at_ms,
        arrival_time_ms: signal.server_arrival_ms.unwrap_or(0),
        observed_latency_ms: decision.age_ms,
        observed_deviation_pips: decision.deviation_pips,
        state: decision.state,
    };
    framed.send(WireMessage::Report(report)).await?;
    framed
        .send(WireMessage::Ack {
            last_accepted: decision.last_accepted,
        })
        .await?;
    if let Some(have_through) = decision.sync_from {
        framed
            .send(WireMessage::SyncRequest { have_through })
            .await?;
    }
    Ok(())
}

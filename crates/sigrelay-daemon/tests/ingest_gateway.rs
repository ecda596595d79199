//! Integration tests for the ingest gateway over real TCP.
//!
//! Covers the per-packet pipeline end to end: credential resolution,
//! signature verification, monotonicity, freshness, the rate cap, and
//! the durable append.

mod common;

use chrono::Utc;
use common::{attach, connect, provision, recv, send, spawn_plane, TEST_SECRET};
use sigrelay_core::signal::{Side, Signal};
use sigrelay_core::protocol::WireMessage;

fn fresh_signal(subscription_id: &str, sequence: u64) -> Signal {
    let mut signal = Signal::new(
        subscription_id,
        sequence,
        Utc::now().timestamp_millis(),
        "EURUSD",
        Side::Buy,
        0.10,
        1.10000,
    );
    signal.sign(TEST_SECRET);
    signal
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn happy_path_commits_to_log_and_acks() {
    let plane = spawn_plane(|_| {}, |_| {}).await;
    let (sub, token) = provision(&plane, "user-1", "master-1");
    let mut producer = attach(plane.ingest_addr, &token).await;

    for sequence in 1..=3 {
        send(
            &mut producer,
            WireMessage::SignalPacket(fresh_signal(&sub.subscription_id, sequence)),
        )
        .await;
        let ack = recv(&mut producer).await;
        assert_eq!(
            ack,
            WireMessage::IngestAck {
                sequence,
                accepted: true,
                reason: None
            }
        );
    }

    let rows = plane.log.read_from("master-1", 0, 10).unwrap();
    assert_eq!(rows.len(), 3);
    let sequences: Vec<u64> = rows.iter().map(|(_, s)| s.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    // The gateway stamped each signal exactly once.
    assert!(rows.iter().all(|(_, s)| s.server_arrival_ms.is_some()));
    assert!(rows.iter().all(|(_, s)| s.master_id == "master-1"));

    let text = plane.metrics.encode_text().unwrap();
    assert!(text.contains("sigrelay_signals_accepted_total 3"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_token_rejected_at_handshake() {
    let plane = spawn_plane(|_| {}, |_| {}).await;
    let mut channel = connect(plane.ingest_addr).await;
    send(
        &mut channel,
        WireMessage::Hello {
            token: "srk_bogus".to_string(),
        },
    )
    .await;
    let ack = recv(&mut channel).await;
    assert_eq!(
        ack,
        WireMessage::HelloAck {
            accepted: false,
            reason: Some("INVALID_CREDENTIAL".to_string())
        }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn revocation_is_observed_mid_stream() {
    let plane = spawn_plane(|_| {}, |_| {}).await;
    let policy = sigrelay_core::policy::Policy {
        secret_key_ref: common::KEY_REF.to_string(),
        ..sigrelay_core::policy::Policy::default()
    };
    let sub = plane
        .registry
        .create_subscription("user-1", "master-1", &policy)
        .unwrap();
    let license = plane
        .registry
        .issue_license(&sub.subscription_id, None)
        .unwrap();
    let mut producer = attach(plane.ingest_addr, &license.token).await;

    send(
        &mut producer,
        WireMessage::SignalPacket(fresh_signal(&sub.subscription_id, 1)),
    )
    .await;
    assert!(matches!(
        recv(&mut producer).await,
        WireMessage::IngestAck { accepted: true, .. }
    ));

    // Revoke between packets: the very next lookup must fail.
    plane
        .registry
        .revoke_license(&license.token_hash, "test revocation")
        .unwrap();

    send(
        &mut producer,
        WireMessage::SignalPacket(fresh_signal(&sub.subscription_id, 2)),
    )
    .await;
    let ack = recv(&mut producer).await;
    assert_eq!(
        ack,
        WireMessage::IngestAck {
            sequence: 2,
            accepted: false,
            reason: Some("INVALID_CREDENTIAL".to_string())
        }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tampered_signature_rejected() {
    let plane = spawn_plane(|_| {}, |_| {}).await;
    let (sub, token) = provision(&plane, "user-1", "master-1");
    let mut producer = attach(plane.ingest_addr, &token).await;

    let mut signal = fresh_signal(&sub.subscription_id, 1);
    signal.price = 1.23456; // breaks the MAC
    send(&mut producer, WireMessage::SignalPacket(signal)).await;
    let ack = recv(&mut producer).await;
    assert_eq!(
        ack,
        WireMessage::IngestAck {
            sequence: 1,
            accepted: false,
            reason: Some("INVALID_SIGNATURE".to_string())
        }
    );
    assert!(plane.log.read_from("master-1", 0, 10).unwrap().is_empty());

    // The rejection reached the protection sink.
    let kinds = plane.sink.kinds_for_subscriber("user-1", 0).unwrap();
    assert_eq!(kinds.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_invalid_signatures_close_the_connection() {
    let plane = spawn_plane(|cfg| cfg.invalid_signature_close_after = 2, |_| {}).await;
    let (sub, token) = provision(&plane, "user-1", "master-1");
    let mut producer = attach(plane.ingest_addr, &token).await;

    for sequence in 1..=2 {
        let mut signal = fresh_signal(&sub.subscription_id, sequence);
        signal.signature = "00".repeat(32);
        send(&mut producer, WireMessage::SignalPacket(signal)).await;
        assert!(matches!(
            recv(&mut producer).await,
            WireMessage::IngestAck {
                accepted: false,
                ..
            }
        ));
    }

    // The server closed the stream after the second failure.
    use futures::StreamExt;
    let next = tokio::time::timeout(std::time::Duration::from_secs(5), producer.next())
        .await
        .unwrap();
    assert!(next.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicates_and_replays_rejected_gaps_allowed() {
    let plane = spawn_plane(|_| {}, |_| {}).await;
    let (sub, token) = provision(&plane, "user-1", "master-1");
    let mut producer = attach(plane.ingest_addr, &token).await;

    for (sequence, expect_accept, reason) in [
        (5u64, true, None),
        (5, false, Some("DUPLICATE".to_string())),
        (3, false, Some("REPLAY".to_string())),
        // A gap in the master's own stream is allowed at ingest.
        (9, true, None),
    ] {
        send(
            &mut producer,
            WireMessage::SignalPacket(fresh_signal(&sub.subscription_id, sequence)),
        )
        .await;
        let ack = recv(&mut producer).await;
        assert_eq!(
            ack,
            WireMessage::IngestAck {
                sequence,
                accepted: expect_accept,
                reason
            }
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_producer_clock_rejected() {
    let plane = spawn_plane(|_| {}, |_| {}).await;
    let (sub, token) = provision(&plane, "user-1", "master-1");
    let mut producer = attach(plane.ingest_addr, &token).await;

    let mut signal = Signal::new(
        &sub.subscription_id,
        1,
        Utc::now().timestamp_millis() - 120_000,
        "EURUSD",
        Side::Buy,
        0.10,
        1.10000,
    );
    signal.sign(TEST_SECRET);
    send(&mut producer, WireMessage::SignalPacket(signal)).await;
    let ack = recv(&mut producer).await;
    assert_eq!(
        ack,
        WireMessage::IngestAck {
            sequence: 1,
            accepted: false,
            reason: Some("CLOCK_SKEW".to_string())
        }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rate_cap_rejects_without_closing() {
    let plane = spawn_plane(
        |cfg| {
            cfg.rate_per_sec = 1;
            cfg.burst = 1;
        },
        |_| {},
    )
    .await;
    let (sub, token) = provision(&plane, "user-1", "master-1");
    let mut producer = attach(plane.ingest_addr, &token).await;

    send(
        &mut producer,
        WireMessage::SignalPacket(fresh_signal(&sub.subscription_id, 1)),
    )
    .await;
    assert!(matches!(
        recv(&mut producer).await,
        WireMessage::IngestAck { accepted: true, .. }
    ));

    send(
        &mut producer,
        WireMessage::SignalPacket(fresh_signal(&sub.subscription_id, 2)),
    )
    .await;
    let ack = recv(&mut producer).await;
    assert_eq!(
        ack,
        WireMessage::IngestAck {
            sequence: 2,
            accepted: false,
            reason: Some("RATE_LIMIT".to_string())
        }
    );

    // The connection survives: resend after the bucket refills.
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    send(
        &mut producer,
        WireMessage::SignalPacket(fresh_signal(&sub.subscription_id, 2)),
    )
    .await;
    assert!(matches!(
        recv(&mut producer).await,
        WireMessage::IngestAck {
            sequence: 2,
            accepted: true,
            ..
        }
    ));
}

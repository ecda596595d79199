//! Shared harness for daemon integration tests: an in-process plane
//! with real TCP listeners on ephemeral ports and in-memory stores.
#![allow(dead_code)] // each test binary uses a different subset

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use sigrelay_core::policy::Policy;
use sigrelay_core::protocol::{WireCodec, WireMessage};
use sigrelay_daemon::config::{IngestConfig, PushConfig};
use sigrelay_daemon::distributor::PushServer;
use sigrelay_daemon::ingest::{IngestServer, MasterStreams};
use sigrelay_daemon::log::{SignalLog, SqliteSignalLog};
use sigrelay_daemon::metrics::MetricsRegistry;
use sigrelay_daemon::registry::{Registry, SubscriptionSnapshot};
use sigrelay_daemon::sink::ProtectionSink;
use sigrelay_daemon::wallet::AlwaysFunded;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::codec::Framed;

pub const TEST_SECRET: &[u8] = b"plane-secret";
pub const KEY_REF: &str = "master-key";

pub struct TestPlane {
    pub registry: Arc<Registry>,
    pub log: Arc<dyn SignalLog>,
    pub sink: ProtectionSink,
    pub streams: Arc<MasterStreams>,
    pub metrics: Arc<MetricsRegistry>,
    pub ingest_addr: SocketAddr,
    pub push_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl Drop for TestPlane {
    fn drop(&mut self) {
        self.shutdown.send(true).ok();
    }
}

pub async fn spawn_plane(
    tune_ingest: impl FnOnce(&mut IngestConfig),
    tune_push: impl FnOnce(&mut PushConfig),
) -> TestPlane {
    let registry = Arc::new(Registry::in_memory().unwrap());
    let log: Arc<dyn SignalLog> = Arc::new(SqliteSignalLog::in_memory().unwrap());
    let sink = ProtectionSink::in_memory().unwrap();
    let streams = Arc::new(MasterStreams::new(Arc::clone(&log)));
    let metrics = Arc::new(MetricsRegistry::new().unwrap());
    let keys = Arc::new(HashMap::from([(KEY_REF.to_string(), TEST_SECRET.to_vec())]));

    let mut ingest_config = IngestConfig::default();
    ingest_config.bind = "127.0.0.1:0".to_string();
    tune_ingest(&mut ingest_config);
    let mut push_config = PushConfig::default();
    push_config.bind = "127.0.0.1:0".to_string();
    push_config.idle_poll = std::time::Duration::from_millis(50);
    tune_push(&mut push_config);

    let (shutdown, shutdown_rx) = watch::channel(false);

    let ingest_listener = TcpListener::bind(&ingest_config.bind).await.unwrap();
    let ingest_addr = ingest_listener.local_addr().unwrap();
    let ingest = Arc::new(IngestServer::new(
        ingest_config,
        Arc::clone(&registry),
        Arc::clone(&log),
        sink.clone(),
        Arc::clone(&streams),
        metrics.daemon().clone(),
        keys,
    ));
    tokio::spawn(ingest.run(ingest_listener, shutdown_rx.clone()));

    let push_listener = TcpListener::bind(&push_config.bind).await.unwrap();
    let push_addr = push_listener.local_addr().unwrap();
    let push = Arc::new(PushServer::new(
        push_config,
        Arc::clone(&registry),
        Arc::clone(&log),
        sink.clone(),
        Arc::clone(&streams),
        metrics.daemon().clone(),
        Arc::new(AlwaysFunded),
    ));
    tokio::spawn(push.run(push_listener, shutdown_rx));

    TestPlane {
        registry,
        log,
        sink,
        streams,
        metrics,
        ingest_addr,
        push_addr,
        shutdown,
    }
}

/// Create a subscription with a default-ish policy bound to the shared
/// test key, and issue a license for it.
pub fn provision(plane: &TestPlane, subscriber: &str, master: &str) -> (SubscriptionSnapshot, String) {
    let policy = Policy {
        secret_key_ref: KEY_REF.to_string(),
        ..Policy::default()
    };
    let snapshot = plane
        .registry
        .create_subscription(subscriber, master, &policy)
        .unwrap();
    let license = plane
        .registry
        .issue_license(&snapshot.subscription_id, None)
        .unwrap();
    (snapshot, license.token)
}

pub type Channel = Framed<TcpStream, WireCodec>;

pub async fn connect(addr: SocketAddr) -> Channel {
    let stream = TcpStream::connect(addr).await.unwrap();
    Framed::new(stream, WireCodec::new())
}

pub async fn send(channel: &mut Channel, message: WireMessage) {
    channel.send(message).await.unwrap();
}

pub async fn recv(channel: &mut Channel) -> WireMessage {
    tokio::time::timeout(std::time::Duration::from_secs(5), channel.next())
        .await
        .expect("timed out waiting for frame")
        .expect("connection closed")
        .expect("frame error")
}

/// Handshake as a producer or receiver; panics unless accepted.
pub async fn attach(addr: SocketAddr, token: &str) -> Channel {
    let mut channel = connect(addr).await;
    send(
        &mut channel,
        WireMessage::Hello {
            token: token.to_string(),
        },
    )
    .await;
    match recv(&mut channel).await {
        WireMessage::HelloAck { accepted: true, .. } => channel,
        other => panic!("handshake failed: {other:?}"),
    }
}

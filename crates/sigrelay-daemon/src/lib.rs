//! # sigrelay-daemon
//!
//! Server side of the sigrelay replication plane: the hot-path ingest
//! gateway, the durable per-master signal log, the subscription registry
//! and its state machine, the fan-out distributor, the protection-event
//! sink, and the trust loop that closes the adversarial feedback.
//!
//! Two concurrency domains share this process:
//!
//! - **Hot path** (ingest + fan-out): task-per-connection over the shared
//!   runtime; short I/O-bound tasks; reads shared state via snapshots and
//!   never takes per-subscription locks.
//! - **Control plane** (trust loop, full-sync replay, admin actions):
//!   periodic and event-driven tasks that take per-subscription locks and
//!   write under optimistic version checks.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod distributor;
pub mod ingest;
pub mod log;
pub mod metrics;
pub mod registry;
pub mod sink;
pub mod trust;
pub mod wallet;

//! # sigrelay-receiver
//!
//! Receiver side of the sigrelay replication plane. Runs colocated with
//! the subscriber's trading terminal, in what must be assumed to be
//! hostile process space, and therefore fails closed: any uncertainty
//! means reject the signal and record why.
//!
//! The centerpiece is [`guard::ExecutionGuard`], the fixed six-guard
//! admission pipeline. Around it sit the durable sequence file (the
//! crash-safety anchor), the seams to the host terminal, and the
//! push-channel client that keeps the receiver attached to the daemon.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod client;
pub mod config;
pub mod guard;
pub mod seqfile;
pub mod terminal;

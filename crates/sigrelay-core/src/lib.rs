//! # sigrelay-core
//!
//! Core library for sigrelay - a distributed trade-signal replication
//! plane.
//!
//! This crate provides the types and logic shared between the server
//! daemon and the receiver: the signal model with its canonical MAC
//! contract, the wire protocol and its framing codec, the subscription
//! state machine, per-subscription admission policy, the
//! protection-event model, and the trust-scoring rules that drive
//! auto-pause.
//!
//! No socket or file I/O lives here. Everything in this crate —
//! including the codec, which operates purely on in-memory buffers — is
//! a function of its inputs so that both sides of the wire agree
//! bit-for-bit on the parts that are compatibility contracts (most
//! importantly the MAC payload). The receiver in particular links only
//! this crate, never the daemon.
//!
//! ## Example
//!
//! ```rust
//! use sigrelay_core::signal::{Side, Signal};
//!
//! let mut signal = Signal::new("sub-1", 1, 1_700_000_000_000, "EURUSD", Side::Buy, 0.10, 1.10000);
//! signal.sign(b"shared-secret");
//! assert!(signal.verify(b"shared-secret"));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod policy;
pub mod protection;
pub mod protocol;
pub mod signal;
pub mod subscription;
pub mod trust;

pub use policy::Policy;
pub use protection::{EventKind, ProtectionEvent, RejectReason};
pub use protocol::{ProtocolError, WireCodec, WireMessage};
pub use signal::{Side, Signal};
pub use subscription::{StateEvent, SubscriptionState, TransitionError};
pub use trust::{TrustOutcome, TrustSettings, TrustWeights};

//! Wire protocol shared by every sigrelay peer: producers, the daemon,
//! and receivers.
//!
//! ```text
//! +-----------------------------------------+
//! |   Messages (canonical binary, typed)     |  wire::WireMessage
//! +-----------------------------------------+
//! |   Framing (length prefix, bounded)       |  wire::WireCodec
//! +-----------------------------------------+
//! |   Transport (TCP, owned by the peers)    |
//! +-----------------------------------------+
//! ```
//!
//! The two upper layers are fused in [`wire::WireCodec`]: a frame off
//! the socket is decoded straight into a typed [`wire::WireMessage`],
//! and a message is encoded with its length prefix in one pass. The
//! signal field order and numeric formatting participate in the MAC
//! compatibility contract, so the encoding is explicit rather than
//! schema-generated.
//!
//! Everything here operates on in-memory buffers only; sockets belong
//! to the peers. Framing or decode errors are connection-fatal: the
//! stream cannot be resynced mid-frame, so the peer must reconnect.

pub mod error;
pub mod wire;

pub use error::{ProtocolError, ProtocolResult, MAX_FRAME_SIZE};
pub use wire::{ReceiverReport, WireCodec, WireMessage};

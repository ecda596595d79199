//! Canonical binary encoding of sigrelay wire messages, and the codec
//! that frames them.
//!
//! Every message is a one-byte type tag followed by its fields in a
//! fixed order. Integers are big-endian; floats are IEEE-754 bits,
//! big-endian; strings are a `u16` byte length followed by UTF-8. On
//! the wire each message travels behind a 4-byte big-endian length
//! prefix, enforced by [`WireCodec`].
//!
//! The signal field order here mirrors the canonical MAC payload order
//! (`crate::signal`), so a packet can be re-canonicalized for
//! verification without reordering. The gateway's `server_arrival_ms`
//! stamp travels only on the receiver push frame and never participates
//! in the MAC.
//!
//! Decode never panics: every read is bounds-checked and any violation
//! is a [`ProtocolError::Malformed`], which is connection-fatal.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::protection::EventKind;
use crate::signal::{Side, Signal, MAX_SUBSCRIPTION_ID_LEN, MAX_SYMBOL_LEN};
use crate::subscription::SubscriptionState;

use super::error::{ProtocolError, ProtocolResult, MAX_FRAME_SIZE};

/// Upper bound for any string field on the wire.
const MAX_STRING_LEN: usize = 256;

/// Length of the frame header (4-byte big-endian payload length).
const HEADER_LEN: usize = 4;

// Message type tags. Producer-origin tags sit in 0x0x, receiver-origin
// in 0x1x, server-origin in 0x8x/0x9x.
const TAG_HELLO: u8 = 0x01;
const TAG_SIGNAL_PACKET: u8 = 0x02;
const TAG_RESUME: u8 = 0x11;
const TAG_ACK: u8 = 0x12;
const TAG_SYNC_REQUEST: u8 = 0x13;
const TAG_REPORT: u8 = 0x14;
const TAG_HELLO_ACK: u8 = 0x81;
const TAG_INGEST_ACK: u8 = 0x82;
const TAG_PUSH: u8 = 0x91;
const TAG_SYNC_COMPLETE: u8 = 0x92;

/// A receiver-side event report, sent best-effort to the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiverReport {
    /// What the receiver did with the signal.
    pub kind: EventKind,
    /// Sequence of the signal in question.
    pub sequence: u64,
    /// Producer generation time, UTC milliseconds.
    pub generated_at_ms: i64,
    /// Gateway arrival stamp, UTC milliseconds.
    pub arrival_time_ms: i64,
    /// Age measured at the decision point, milliseconds.
    pub observed_latency_ms: i64,
    /// Price deviation in pips when the price guard ran.
    pub observed_deviation_pips: Option<f64>,
    /// Receiver-local subscription state at the event.
    pub state: SubscriptionState,
}

/// All sigrelay wire messages.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// Connection handshake: the opaque license token.
    Hello {
        /// Cleartext license token; hashed server-side for lookup.
        token: String,
    },
    /// A producer signal packet (unstamped).
    SignalPacket(Signal),
    /// Handshake response.
    HelloAck {
        /// Whether the credential resolved to a live subscription.
        accepted: bool,
        /// Rejection reason when not accepted.
        reason: Option<String>,
    },
    /// Per-packet ingest response.
    IngestAck {
        /// Sequence the ack refers to.
        sequence: u64,
        /// Whether the packet was committed to the log.
        accepted: bool,
        /// Stable reason string when rejected.
        reason: Option<String>,
    },
    /// Receiver advertises its durable cursor after handshake.
    Resume {
        /// Last sequence the receiver accepted and persisted.
        last_accepted: u64,
    },
    /// Receiver ack after processing a pushed signal.
    Ack {
        /// Receiver's last accepted sequence after processing.
        last_accepted: u64,
    },
    /// Receiver detected a gap and requests replay.
    SyncRequest {
        /// Highest contiguous sequence the receiver holds.
        have_through: u64,
    },
    /// Best-effort receiver event report.
    Report(ReceiverReport),
    /// Server pushes a stamped signal to a receiver.
    Push {
        /// The stamped signal.
        signal: Signal,
        /// True when this is a gap-recovery replay delivery.
        replay: bool,
    },
    /// Server signals that full sync reached the log head.
    SyncComplete,
}

impl WireMessage {
    /// The type tag this message travels under.
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Self::Hello { .. } => TAG_HELLO,
            Self::SignalPacket(_) => TAG_SIGNAL_PACKET,
            Self::HelloAck { .. } => TAG_HELLO_ACK,
            Self::IngestAck { .. } => TAG_INGEST_ACK,
            Self::Resume { .. } => TAG_RESUME,
            Self::Ack { .. } => TAG_ACK,
            Self::SyncRequest { .. } => TAG_SYNC_REQUEST,
            Self::Report(_) => TAG_REPORT,
            Self::Push { .. } => TAG_PUSH,
            Self::SyncComplete => TAG_SYNC_COMPLETE,
        }
    }

    /// Encode this message as an unframed payload (tag + fields).
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        self.encode_payload(&mut buf);
        buf.freeze()
    }

    fn encode_payload(&self, buf: &mut BytesMut) {
        buf.put_u8(self.tag());
        match self {
            Self::Hello { token } => put_str(buf, token),
            Self::SignalPacket(signal) => put_signal_fields(buf, signal),
            Self::HelloAck { accepted, reason } => {
                buf.put_u8(u8::from(*accepted));
                put_opt_str(buf, reason.as_deref());
            }
            Self::IngestAck {
                sequence,
                accepted,
                reason,
            } => {
                buf.put_u64(*sequence);
                buf.put_u8(u8::from(*accepted));
                put_opt_str(buf, reason.as_deref());
            }
            Self::Resume { last_accepted } | Self::Ack { last_accepted } => {
                buf.put_u64(*last_accepted);
            }
            Self::SyncRequest { have_through } => buf.put_u64(*have_through),
            Self::Report(report) => {
                put_str(buf, report.kind.as_str());
                buf.put_u64(report.sequence);
                buf.put_i64(report.generated_at_ms);
                buf.put_i64(report.arrival_time_ms);
                buf.put_i64(report.observed_latency_ms);
                match report.observed_deviation_pips {
                    Some(pips) => {
                        buf.put_u8(1);
                        buf.put_f64(pips);
                    }
                    None => buf.put_u8(0),
                }
                put_str(buf, report.state.as_str());
            }
            Self::Push { signal, replay } => {
                put_signal_fields(buf, signal);
                buf.put_i64(signal.server_arrival_ms.unwrap_or(0));
                buf.put_u8(u8::from(*replay));
            }
            Self::SyncComplete => {}
        }
    }

    /// Decode an unframed payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] for truncated or otherwise
    /// invalid payloads and [`ProtocolError::UnexpectedMessage`] for an
    /// unknown type tag.
    pub fn decode(mut buf: Bytes) -> ProtocolResult<Self> {
        let tag = get_u8(&mut buf)?;
        let message = match tag {
            TAG_HELLO => Self::Hello {
                token: get_str(&mut buf)?,
            },
            TAG_SIGNAL_PACKET => Self::SignalPacket(get_signal_fields(&mut buf)?),
            TAG_HELLO_ACK => Self::HelloAck {
                accepted: get_u8(&mut buf)? != 0,
                reason: get_opt_str(&mut buf)?,
            },
            TAG_INGEST_ACK => Self::IngestAck {
                sequence: get_u64(&mut buf)?,
                accepted: get_u8(&mut buf)? != 0,
                reason: get_opt_str(&mut buf)?,
            },
            TAG_RESUME => Self::Resume {
                last_accepted: get_u64(&mut buf)?,
            },
            TAG_ACK => Self::Ack {
                last_accepted: get_u64(&mut buf)?,
            },
            TAG_SYNC_REQUEST => Self::SyncRequest {
                have_through: get_u64(&mut buf)?,
            },
            TAG_REPORT => {
                let kind_str = get_str(&mut buf)?;
                let kind = EventKind::parse(&kind_str)
                    .ok_or_else(|| ProtocolError::malformed(format!("event kind {kind_str:?}")))?;
                let sequence = get_u64(&mut buf)?;
                let generated_at_ms = get_i64(&mut buf)?;
                let arrival_time_ms = get_i64(&mut buf)?;
                let observed_latency_ms = get_i64(&mut buf)?;
                let observed_deviation_pips = if get_u8(&mut buf)? != 0 {
                    Some(get_f64(&mut buf)?)
                } else {
                    None
                };
                let state_str = get_str(&mut buf)?;
                let state = SubscriptionState::parse(&state_str)
                    .ok_or_else(|| ProtocolError::malformed(format!("state {state_str:?}")))?;
                Self::Report(ReceiverReport {
                    kind,
                    sequence,
                    generated_at_ms,
                    arrival_time_ms,
                    observed_latency_ms,
                    observed_deviation_pips,
                    state,
                })
            }
            TAG_PUSH => {
                let mut signal = get_signal_fields(&mut buf)?;
                let arrival = get_i64(&mut buf)?;
                signal.server_arrival_ms = (arrival != 0).then_some(arrival);
                let replay = get_u8(&mut buf)? != 0;
                Self::Push { signal, replay }
            }
            TAG_SYNC_COMPLETE => Self::SyncComplete,
            message_type => return Err(ProtocolError::UnexpectedMessage { message_type }),
        };
        if buf.has_remaining() {
            return Err(ProtocolError::malformed(format!(
                "{} trailing bytes after message",
                buf.remaining()
            )));
        }
        Ok(message)
    }
}

/// Message-typed codec for [`tokio_util::codec::Framed`]: frames are
/// decoded straight into [`WireMessage`]s and messages are encoded with
/// their length prefix in one pass.
///
/// The decoder consumes a frame's length header as soon as it arrives
/// and remembers it across calls, so a slow sender costs bookkeeping,
/// not re-parsing. The header is validated against [`MAX_FRAME_SIZE`]
/// before any payload capacity is reserved.
#[derive(Debug, Default)]
pub struct WireCodec {
    /// Payload length parsed from a header whose payload has not fully
    /// arrived yet.
    pending_payload: Option<usize>,
}

impl WireCodec {
    /// Fresh codec; one per connection.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pending_payload: None,
        }
    }
}

impl Decoder for WireCodec {
    type Item = WireMessage;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> ProtocolResult<Option<WireMessage>> {
        let length = match self.pending_payload {
            Some(length) => length,
            None => {
                if src.len() < HEADER_LEN {
                    return Ok(None);
                }
                let length = src.get_u32() as usize;
                if length > MAX_FRAME_SIZE {
                    return Err(ProtocolError::FrameTooLarge {
                        size: length,
                        max: MAX_FRAME_SIZE,
                    });
                }
                self.pending_payload = Some(length);
                length
            }
        };
        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }
        self.pending_payload = None;
        WireMessage::decode(src.split_to(length).freeze()).map(Some)
    }
}

impl Encoder<WireMessage> for WireCodec {
    type Error = ProtocolError;

    fn encode(&mut self, message: WireMessage, dst: &mut BytesMut) -> ProtocolResult<()> {
        // Length prefix is backfilled once the payload size is known;
        // messages are small so the single pass beats a scratch buffer.
        let header_at = dst.len();
        dst.put_u32(0);
        message.encode_payload(dst);
        let payload_len = dst.len() - header_at - HEADER_LEN;
        if payload_len > MAX_FRAME_SIZE {
            dst.truncate(header_at);
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: MAX_FRAME_SIZE,
            });
        }
        #[allow(clippy::cast_possible_truncation)] // bounded by MAX_FRAME_SIZE
        let prefix = (payload_len as u32).to_be_bytes();
        dst[header_at..header_at + HEADER_LEN].copy_from_slice(&prefix);
        Ok(())
    }
}

fn put_signal_fields(buf: &mut BytesMut, signal: &Signal) {
    put_str(buf, &signal.subscription_id);
    buf.put_u64(signal.sequence);
    buf.put_i64(signal.generated_at_ms);
    put_str(buf, &signal.symbol);
    buf.put_u8(signal.side.wire_code());
    buf.put_f64(signal.volume);
    buf.put_f64(signal.price);
    buf.put_f64(signal.stop_loss);
    buf.put_f64(signal.take_profit);
    put_str(buf, &signal.signature);
}

fn get_signal_fields(buf: &mut Bytes) -> ProtocolResult<Signal> {
    let subscription_id = get_str(buf)?;
    if subscription_id.len() > MAX_SUBSCRIPTION_ID_LEN {
        return Err(ProtocolError::malformed("subscription id too long"));
    }
    let sequence = get_u64(buf)?;
    let generated_at_ms = get_i64(buf)?;
    let symbol = get_str(buf)?;
    if symbol.len() > MAX_SYMBOL_LEN {
        return Err(ProtocolError::malformed("symbol too long"));
    }
    let side_code = get_u8(buf)?;
    let side = Side::from_wire(side_code)
        .ok_or_else(|| ProtocolError::malformed(format!("side code {side_code}")))?;
    let volume = get_f64(buf)?;
    let price = get_f64(buf)?;
    let stop_loss = get_f64(buf)?;
    let take_profit = get_f64(buf)?;
    let signature = get_str(buf)?;

    Ok(Signal {
        subscription_id,
        master_id: String::new(),
        sequence,
        generated_at_ms,
        server_arrival_ms: None,
        symbol,
        side,
        volume,
        price,
        stop_loss,
        take_profit,
        signature,
    })
}

fn put_str(buf: &mut BytesMut, s: &str) {
    debug_assert!(s.len() <= MAX_STRING_LEN);
    #[allow(clippy::cast_possible_truncation)] // bounded by MAX_STRING_LEN
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn put_opt_str(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        Some(s) => {
            buf.put_u8(1);
            put_str(buf, s);
        }
        None => buf.put_u8(0),
    }
}

fn get_u8(buf: &mut Bytes) -> ProtocolResult<u8> {
    if buf.remaining() < 1 {
        return Err(ProtocolError::malformed("truncated u8"));
    }
    Ok(buf.get_u8())
}

fn get_u64(buf: &mut Bytes) -> ProtocolResult<u64> {
    if buf.remaining() < 8 {
        return Err(ProtocolError::malformed("truncated u64"));
    }
    Ok(buf.get_u64())
}

fn get_i64(buf: &mut Bytes) -> ProtocolResult<i64> {
    if buf.remaining() < 8 {
        return Err(ProtocolError::malformed("truncated i64"));
    }
    Ok(buf.get_i64())
}

fn get_f64(buf: &mut Bytes) -> ProtocolResult<f64> {
    if buf.remaining() < 8 {
        return Err(ProtocolError::malformed("truncated f64"));
    }
    let value = buf.get_f64();
    if !value.is_finite() {
        return Err(ProtocolError::malformed("non-finite float"));
    }
    Ok(value)
}

fn get_str(buf: &mut Bytes) -> ProtocolResult<String> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::malformed("truncated string length"));
    }
    let len = buf.get_u16() as usize;
    if len > MAX_STRING_LEN {
        return Err(ProtocolError::malformed(format!("string of {len} bytes")));
    }
    if buf.remaining() < len {
        return Err(ProtocolError::malformed("truncated string"));
    }
    let bytes = buf.split_to(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::malformed("invalid utf-8"))
}

fn get_opt_str(buf: &mut Bytes) -> ProtocolResult<Option<String>> {
    if get_u8(buf)? != 0 {
        Ok(Some(get_str(buf)?))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protection::RejectReason;

    fn sample_signal() -> Signal {
        let mut s = Signal::new(
            "sub-7",
            3,
            1_700_000_000_000,
            "GBPUSD",
            Side::Sell,
            0.25,
            1.2650,
        );
        s.stop_loss = 1.27;
        s.take_profit = 1.25;
        s.sign(b"secret");
        s
    }

    fn roundtrip(message: WireMessage) {
        let decoded = WireMessage::decode(message.encode()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn all_variants_roundtrip() {
        roundtrip(WireMessage::Hello {
            token: "tok-abc123".to_string(),
        });
        roundtrip(WireMessage::SignalPacket(sample_signal()));
        roundtrip(WireMessage::HelloAck {
            accepted: true,
            reason: None,
        });
        roundtrip(WireMessage::HelloAck {
            accepted: false,
            reason: Some(RejectReason::InvalidCredential.as_str().to_string()),
        });
        roundtrip(WireMessage::IngestAck {
            sequence: 9,
            accepted: false,
            reason: Some("CLOCK_SKEW".to_string()),
        });
        roundtrip(WireMessage::Resume { last_accepted: 17 });
        roundtrip(WireMessage::Ack { last_accepted: 18 });
        roundtrip(WireMessage::SyncRequest { have_through: 4 });
        roundtrip(WireMessage::Report(ReceiverReport {
            kind: EventKind::Rejected(RejectReason::PriceDeviation),
            sequence: 12,
            generated_at_ms: 1_700_000_000_000,
            arrival_time_ms: 1_700_000_000_030,
            observed_latency_ms: 120,
            observed_deviation_pips: Some(60.0),
            state: SubscriptionState::Synced,
        }));
        roundtrip(WireMessage::SyncComplete);
    }

    #[test]
    fn push_carries_arrival_stamp_and_replay_flag() {
        let mut signal = sample_signal();
        signal.server_arrival_ms = Some(1_700_000_000_055);
        let decoded = WireMessage::decode(
            WireMessage::Push {
                signal: signal.clone(),
                replay: true,
            }
            .encode(),
        )
        .unwrap();
        let WireMessage::Push {
            signal: out,
            replay,
        } = decoded
        else {
            panic!("expected Push");
        };
        assert!(replay);
        assert_eq!(out.server_arrival_ms, Some(1_700_000_000_055));
        assert_eq!(out.signature, signal.signature);
    }

    #[test]
    fn truncated_payloads_are_malformed() {
        let encoded = WireMessage::SignalPacket(sample_signal()).encode();
        for cut in [1, 5, encoded.len() - 1] {
            let result = WireMessage::decode(encoded.slice(..cut));
            assert!(
                matches!(result, Err(ProtocolError::Malformed { .. })),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn unknown_tag_rejected() {
        let result = WireMessage::decode(Bytes::from_static(&[0x7f]));
        assert!(matches!(
            result,
            Err(ProtocolError::UnexpectedMessage { message_type: 0x7f })
        ));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut encoded = BytesMut::from(&WireMessage::SyncComplete.encode()[..]);
        encoded.put_u8(0);
        assert!(matches!(
            WireMessage::decode(encoded.freeze()),
            Err(ProtocolError::Malformed { .. })
        ));
    }

    #[test]
    fn hostile_string_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(TAG_HELLO);
        buf.put_u16(u16::MAX);
        buf.put_slice(&[b'a'; 32]);
        assert!(matches!(
            WireMessage::decode(buf.freeze()),
            Err(ProtocolError::Malformed { .. })
        ));
    }

    #[test]
    fn invalid_side_code_rejected() {
        let mut signal = sample_signal();
        signal.side = Side::Buy;
        let encoded = WireMessage::SignalPacket(signal).encode();
        let mut bytes = BytesMut::from(&encoded[..]);
        // The side byte follows tag + subscription id + sequence +
        // generated_at + symbol.
        let side_index = 1 + 2 + 5 + 8 + 8 + 2 + 6;
        bytes[side_index] = 9;
        assert!(matches!(
            WireMessage::decode(bytes.freeze()),
            Err(ProtocolError::Malformed { .. })
        ));
    }

    #[test]
    fn non_finite_float_rejected() {
        let mut signal = sample_signal();
        signal.volume = 1.0;
        let encoded = WireMessage::SignalPacket(signal).encode();
        let mut bytes = BytesMut::from(&encoded[..]);
        let volume_index = 1 + 2 + 5 + 8 + 8 + 2 + 6 + 1;
        bytes[volume_index..volume_index + 8].copy_from_slice(&f64::NAN.to_bits().to_be_bytes());
        assert!(matches!(
            WireMessage::decode(bytes.freeze()),
            Err(ProtocolError::Malformed { .. })
        ));
    }

    // ------------------------------------------------------------------
    // Codec
    // ------------------------------------------------------------------

    #[test]
    fn codec_roundtrips_framed_messages() {
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(WireMessage::Ack { last_accepted: 11 }, &mut buf)
            .unwrap();
        codec
            .encode(WireMessage::SignalPacket(sample_signal()), &mut buf)
            .unwrap();

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(WireMessage::Ack { last_accepted: 11 })
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(WireMessage::SignalPacket(sample_signal()))
        );
        assert!(buf.is_empty());
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn codec_remembers_header_across_partial_reads() {
        let mut codec = WireCodec::new();
        let mut wire = BytesMut::new();
        codec
            .encode(WireMessage::SyncRequest { have_through: 2 }, &mut wire)
            .unwrap();

        // Drip the frame in byte by byte; the header is consumed the
        // moment it is complete and the decoder waits statefully.
        let mut buf = BytesMut::new();
        let mut decoded = None;
        for byte in wire.freeze() {
            buf.put_u8(byte);
            if let Some(message) = codec.decode(&mut buf).unwrap() {
                decoded = Some(message);
            }
        }
        assert_eq!(decoded, Some(WireMessage::SyncRequest { have_through: 2 }));
    }

    #[test]
    fn codec_rejects_hostile_length_prefix_before_reserving() {
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        buf.put_slice(&[0u8; 16]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { size, max })
                if size == u32::MAX as usize && max == MAX_FRAME_SIZE
        ));
    }

    #[test]
    fn codec_length_prefix_matches_payload() {
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(WireMessage::SyncComplete, &mut buf).unwrap();
        // SyncComplete is a bare tag: 4-byte prefix of 1, then the tag.
        assert_eq!(&buf[..], &[0, 0, 0, 1, TAG_SYNC_COMPLETE]);
    }

    #[test]
    fn codec_waits_for_incomplete_header() {
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0][..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 3);
    }
}

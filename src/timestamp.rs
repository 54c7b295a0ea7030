use std::time::{Duration, Instant};

use bytes::{Buf, BufMut};

use crate::protocol::ProtocolError;

/// Protocol tick rate: all timestamps on the wire count 100 microsecond units
///  since the owning session's start time. This is fixed by RTP-MIDI and not
///  configurable.
pub const TICK: Duration = Duration::from_micros(100);

/// Largest delta time representable in the 4-octet variable-length encoding.
pub const MAX_DELTA_TICKS: u64 = 0x0fff_ffff;

/// Relative session time, used in control messages and MIDI packets.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Debug, Default)]
pub struct MediaTimestamp(pub u64);

impl MediaTimestamp {
    /// The timestamp of 'now', relative to the session's start time.
    pub fn now(start: Instant) -> MediaTimestamp {
        MediaTimestamp::of(Instant::now(), start)
    }

    /// The timestamp of a given point in time, relative to the session's start
    ///  time. Times before the start clamp to 0.
    pub fn of(t: Instant, start: Instant) -> MediaTimestamp {
        let elapsed = t.saturating_duration_since(start);
        MediaTimestamp((elapsed.as_micros() / TICK.as_micros()) as u64)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// The truncated representation used in the 32-bit RTP header field.
    pub fn as_u32(&self) -> u32 {
        self.0 as u32
    }
}

/// Whether a delta-time survived encoding unchanged, or was clamped to the
///  4-octet maximum. Encoding proceeds either way; callers decide whether the
///  loss matters to them.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum Precision {
    Exact,
    Saturated,
}

/// Encode the delta time between a command and its reference time as 1-4
///  octets, most significant octet first, with the top bit of every octet
///  except the last set as a continuation marker.
///
/// The tick count is `ticks(reference+delta) - ticks(reference)` rather than
///  `delta / tick` so that truncation stays anchored to the session clock.
pub fn put_delta_time(buf: &mut impl BufMut, reference: Instant, start: Instant, delta: Duration) -> Precision {
    let ticks = MediaTimestamp::of(reference + delta, start).0 - MediaTimestamp::of(reference, start).0;
    put_delta_ticks(buf, ticks)
}

/// Encode a raw tick count. Values above [MAX_DELTA_TICKS] are clamped to the
///  maximum 4-octet sequence and reported as [Precision::Saturated].
pub fn put_delta_ticks(buf: &mut impl BufMut, ticks: u64) -> Precision {
    if ticks > MAX_DELTA_TICKS {
        buf.put_slice(&[0xff, 0xff, 0xff, 0x8f]);
        return Precision::Saturated;
    }

    if ticks >= 0x0020_0000 {
        buf.put_u8(0x80 | (ticks >> 21) as u8);
    }
    if ticks >= 0x4000 {
        buf.put_u8(0x80 | ((ticks >> 14) & 0x7f) as u8);
    }
    if ticks >= 0x80 {
        buf.put_u8(0x80 | ((ticks >> 7) & 0x7f) as u8);
    }
    buf.put_u8((ticks & 0x7f) as u8);

    Precision::Exact
}

/// Decode a variable-length delta time: accumulate 7-bit groups while the
///  continuation bit is set, stopping at the first octet with it clear.
pub fn try_get_delta_time(buf: &mut impl Buf) -> Result<u64, ProtocolError> {
    let mut ticks = 0u64;
    for _ in 0..4 {
        let octet = buf.try_get_u8()?;
        ticks = (ticks << 7) | (octet & 0x7f) as u64;
        if octet & 0x80 == 0 {
            return Ok(ticks);
        }
    }
    Err(ProtocolError::MalformedDeltaTime)
}

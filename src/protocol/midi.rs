use std::fmt::{Display, Formatter};
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, BytesMut};

use crate::protocol::ProtocolError;
use crate::timestamp::{put_delta_time, try_get_delta_time, MediaTimestamp, Precision};

// generic RTP constants
const VERSION_2_BIT: u8 = 0x80;
const PADDING: u8 = 0x00;
const EXTENSION: u8 = 0x00;
const CC_BITS: u8 = 0x00;
const FIRST_BYTE: u8 = VERSION_2_BIT | PADDING | EXTENSION | CC_BITS;

const MARKER_BIT: u8 = 0x80;
const PAYLOAD_TYPE: u8 = 0x61;
const SECOND_BYTE: u8 = MARKER_BIT | PAYLOAD_TYPE;

const PT_MASK: u8 = 0x7f;

const MINIMUM_BUFFER_LEN: usize = 12;

// MIDI command section header bits
const EMPTY_HEADER: u8 = 0x00;
const BIG_HEADER_BIT: u8 = 0x80; // section header is 2 octets
const JOURNAL_BIT: u8 = 0x40; // journal section present
const ZERO_DELTA_BIT: u8 = 0x20; // delta time present for the first MIDI command
const PHANTOM_BIT: u8 = 0x10; // status byte was not present in the original MIDI command
const LEN_MASK: u8 = 0x0f;

/// Largest command-list body representable in the 12-bit length of the
///  2-octet section header.
pub const MAX_COMMAND_LIST_LEN: usize = 4095;

/// A MIDI packet exchanged over RTP.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | V |P|X|  CC   |M|     PT      |        Sequence number        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                     MIDI command section ...                  |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       Journal section ...                     |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// see <https://tools.ietf.org/html/rfc6295>
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct MidiMessage {
    pub sequence_number: u16,
    pub ssrc: u32,
    pub commands: MidiCommandList,
}

/// The list of [MidiCommand]s sent inside a [MidiMessage], stamped with the
///  nominal clock reading of the packet.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct MidiCommandList {
    pub timestamp: Instant,
    pub commands: Vec<MidiCommand>,
}

/// A single command: a delta time relative to the previous command's nominal
///  time, and an opaque MIDI status+data byte sequence. The payload is never
///  semantically parsed.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct MidiCommand {
    pub delta_time: Duration,
    pub payload: Vec<u8>,
}

impl MidiMessage {
    pub fn ser(&self, buf: &mut BytesMut, start: Instant) -> Result<Precision, ProtocolError> {
        buf.put_u8(FIRST_BYTE);
        buf.put_u8(SECOND_BYTE);
        buf.put_u16(self.sequence_number);
        buf.put_u32(MediaTimestamp::of(self.commands.timestamp, start).as_u32());
        buf.put_u32(self.ssrc);
        self.commands.ser(buf, start)
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<DecodedMidiMessage, ProtocolError> {
        if buf.remaining() < MINIMUM_BUFFER_LEN {
            return Err(ProtocolError::BufferTooSmall(buf.remaining()));
        }

        let b0 = buf.get_u8();
        let b1 = buf.get_u8();
        if b0 != FIRST_BYTE || b1 & PT_MASK != PAYLOAD_TYPE {
            return Err(ProtocolError::BadHeader(u16::from_be_bytes([b0, b1])));
        }
        let sequence_number = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        let h0 = buf.try_get_u8()?;
        let len = if h0 & BIG_HEADER_BIT != 0 {
            ((h0 & LEN_MASK) as usize) << 8 | buf.try_get_u8()? as usize
        } else {
            (h0 & LEN_MASK) as usize
        };
        if buf.remaining() < len {
            return Err(ProtocolError::BufferTooSmall(buf.remaining()));
        }

        let mut body = buf.copy_to_bytes(len);
        let first_delta_time = if h0 & ZERO_DELTA_BIT != 0 {
            Some(try_get_delta_time(&mut body)?)
        } else {
            None
        };

        Ok(DecodedMidiMessage {
            sequence_number,
            ssrc,
            timestamp,
            journal_present: h0 & JOURNAL_BIT != 0,
            phantom: h0 & PHANTOM_BIT != 0,
            first_delta_time,
            payload: body.to_vec(),
        })
    }
}

impl Display for MidiMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RM SSRC=0x{:08x} sn={}", self.ssrc, self.sequence_number)
    }
}

/// The structurally decoded view of a MIDI packet. Command boundaries inside
///  the list body require interpreting MIDI status bytes, which this codec
///  deliberately does not do - the body past the leading delta time stays
///  opaque.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct DecodedMidiMessage {
    pub sequence_number: u16,
    pub ssrc: u32,
    /// Tick count, truncated to 32 bits on the wire.
    pub timestamp: u32,
    pub journal_present: bool,
    pub phantom: bool,
    /// The delta time preceding the first command, when the Z bit was set.
    pub first_delta_time: Option<u64>,
    pub payload: Vec<u8>,
}

/*
 0                   1                   2                   3
 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
|B|J|Z|P|LEN... |  MIDI list ...                                |
+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
*/
impl MidiCommandList {
    fn ser(&self, buf: &mut BytesMut, start: Instant) -> Result<Precision, ProtocolError> {
        if self.commands.is_empty() {
            buf.put_u8(EMPTY_HEADER);
            return Ok(Precision::Exact);
        }

        let mut header = EMPTY_HEADER;
        let mut body = BytesMut::new();
        let mut saturated = false;

        for (i, mc) in self.commands.iter().enumerate() {
            if i == 0 && !mc.delta_time.is_zero() {
                header |= ZERO_DELTA_BIT;
                saturated |= put_delta_time(&mut body, self.timestamp, start, mc.delta_time) == Precision::Saturated;
            }
            if i > 0 {
                saturated |= put_delta_time(&mut body, self.timestamp, start, mc.delta_time) == Precision::Saturated;
            }
            body.put_slice(&mc.payload);
        }

        if body.len() > MAX_COMMAND_LIST_LEN {
            return Err(ProtocolError::UnrepresentableInput(body.len()));
        }
        if body.len() > LEN_MASK as usize {
            buf.put_u8(header | BIG_HEADER_BIT | (body.len() >> 8) as u8 & LEN_MASK);
            buf.put_u8(body.len() as u8);
        } else {
            buf.put_u8(header | body.len() as u8 & LEN_MASK);
        }
        buf.put_slice(&body);

        Ok(if saturated { Precision::Saturated } else { Precision::Exact })
    }
}

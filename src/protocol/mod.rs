use std::fmt::{Display, Formatter};

pub mod control;
pub mod midi;

/// Errors raised by the wire codecs.
///
/// Decode errors on inbound datagrams are recovered locally by the dispatch
///  loops (logged, datagram discarded); encode errors are returned to the
///  caller since they indicate a caller-correctable condition.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ProtocolError {
    /// The buffer ended before the message did. Carries the number of bytes
    ///  that were still available.
    BufferTooSmall(usize),
    /// The first two octets of a control datagram were not `0xffff`.
    BadHeader(u16),
    /// A message that cannot be expressed on the wire, e.g. a
    ///  synchronization without any timestamp.
    InvalidMessage(&'static str),
    /// A delta time whose continuation bit never terminated within 4 octets.
    MalformedDeltaTime,
    /// A MIDI command list whose body exceeds the 4095-octet limit of the
    ///  2-octet section header. Carries the actual body length.
    UnrepresentableInput(usize),
}

impl Display for ProtocolError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::BufferTooSmall(available) => write!(f, "buffer is too small: {} bytes", available),
            ProtocolError::BadHeader(header) => write!(f, "invalid header: {:x}", header),
            ProtocolError::InvalidMessage(reason) => write!(f, "invalid message: {}", reason),
            ProtocolError::MalformedDeltaTime => write!(f, "malformed delta time"),
            ProtocolError::UnrepresentableInput(len) => write!(f, "MIDI command list is too big: {} octets", len),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<bytes::TryGetError> for ProtocolError {
    fn from(e: bytes::TryGetError) -> Self {
        ProtocolError::BufferTooSmall(e.available)
    }
}

use std::fmt::{Display, Formatter};

use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::warn;

use crate::protocol::ProtocolError;

/// One of the commands defined by the AppleMIDI session initiation protocol.
///  The numeric values are the two ASCII characters of the command on the
///  wire.
#[derive(Clone, Copy, Eq, PartialEq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum Command {
    /// Invite a remote participant to the session.
    Invitation = 0x494e,
    /// Reject the invitation.
    InvitationRejected = 0x4e4f,
    /// Accept the invitation.
    InvitationAccepted = 0x4f4b,
    /// End the current session.
    End = 0x4259,
    /// Synchronize timestamps between participants.
    Synchronization = 0x434b,
    /// Update the recovery journal on the remote participant.
    ReceiverFeedback = 0x5253,
    /// Defined by the protocol but unused in practice.
    BitrateReceiveLimit = 0x524c,
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let raw: u16 = (*self).into();
        let chars = raw.to_be_bytes();
        write!(f, "{}{}", chars[0] as char, chars[1] as char)
    }
}

const HEADER: u16 = 0xffff;
const PROTOCOL_VERSION: u32 = 2;

const MINIMUM_BUFFER_LEN: usize = 4;

/// An AppleMIDI control message, exchanged on both the control and the data
///  port during session negotiation and clock synchronization.
///
/// see <https://en.wikipedia.org/wiki/RTP-MIDI>
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ControlMessage {
    pub cmd: Command,
    pub token: u32,
    pub ssrc: u32,
    /// Display name of the sending session. Never present for [Command::End].
    pub name: Option<String>,
    /// 1-3 clock readings for [Command::Synchronization], empty otherwise.
    pub timestamps: Vec<u64>,
}

impl ControlMessage {
    pub fn invitation_accepted(token: u32, ssrc: u32, name: &str) -> ControlMessage {
        ControlMessage {
            cmd: Command::InvitationAccepted,
            token,
            ssrc,
            name: Some(name.to_string()),
            timestamps: Vec::new(),
        }
    }

    pub fn invitation_rejected(token: u32, ssrc: u32, name: &str) -> ControlMessage {
        ControlMessage {
            cmd: Command::InvitationRejected,
            token,
            ssrc,
            name: Some(name.to_string()),
            timestamps: Vec::new(),
        }
    }

    pub fn end(ssrc: u32) -> ControlMessage {
        ControlMessage {
            cmd: Command::End,
            token: 0,
            ssrc,
            name: None,
            timestamps: Vec::new(),
        }
    }

    pub fn synchronization(ssrc: u32, timestamps: Vec<u64>) -> ControlMessage {
        ControlMessage {
            cmd: Command::Synchronization,
            token: 0,
            ssrc,
            name: None,
            timestamps,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u16(HEADER);
        buf.put_u16(self.cmd.into());

        match self.cmd {
            Command::Invitation | Command::InvitationAccepted | Command::InvitationRejected | Command::End => {
                buf.put_u32(PROTOCOL_VERSION);
                buf.put_u32(self.token);
                buf.put_u32(self.ssrc);
                if self.cmd != Command::End {
                    if let Some(name) = &self.name {
                        buf.put_slice(name.as_bytes());
                    }
                    buf.put_u8(0);
                }
            }
            Command::Synchronization => {
                if self.timestamps.is_empty() {
                    return Err(ProtocolError::InvalidMessage("at least 1 timestamp is expected"));
                }
                if self.timestamps.len() > 3 {
                    return Err(ProtocolError::InvalidMessage("at most 3 timestamps fit on the wire"));
                }
                buf.put_u32(self.ssrc);
                buf.put_u8((self.timestamps.len() - 1) as u8);
                buf.put_u8(0);
                buf.put_u16(0);
                // always 3 slots, unpopulated ones zero-filled
                for i in 0..3 {
                    buf.put_u64(self.timestamps.get(i).copied().unwrap_or(0));
                }
            }
            Command::ReceiverFeedback | Command::BitrateReceiveLimit => {
                // payload encoding is out of scope
            }
        }
        Ok(())
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<ControlMessage, ProtocolError> {
        if buf.remaining() < MINIMUM_BUFFER_LEN {
            return Err(ProtocolError::BufferTooSmall(buf.remaining()));
        }

        let header = buf.get_u16();
        if header != HEADER {
            return Err(ProtocolError::BadHeader(header));
        }
        let cmd = Command::try_from(buf.get_u16())
            .map_err(|_| ProtocolError::InvalidMessage("unknown command code"))?;

        let mut msg = ControlMessage {
            cmd,
            token: 0,
            ssrc: 0,
            name: None,
            timestamps: Vec::new(),
        };

        match cmd {
            Command::Invitation | Command::InvitationAccepted | Command::InvitationRejected | Command::End => {
                let version = buf.try_get_u32()?;
                if version != PROTOCOL_VERSION {
                    warn!("unsupported protocol version: {}", version);
                }
                msg.token = buf.try_get_u32()?;
                msg.ssrc = buf.try_get_u32()?;
                if cmd != Command::End {
                    msg.name = try_get_name(buf);
                }
            }
            Command::Synchronization => {
                msg.ssrc = buf.try_get_u32()?;
                let count = buf.try_get_u8()? as usize + 1;
                let _reserved = buf.try_get_u8()?;
                let _reserved = buf.try_get_u16()?;
                // only the declared timestamps are reconstructed - the
                //  zero-filled padding slots are left in the buffer
                for _ in 0..count {
                    msg.timestamps.push(buf.try_get_u64()?);
                }
            }
            Command::ReceiverFeedback | Command::BitrateReceiveLimit => {
                // payload decoding is out of scope
            }
        }
        Ok(msg)
    }
}

/// A null-terminated UTF-8 name, taking the whole remaining buffer if no
///  terminator is present. An empty name decodes as absent.
fn try_get_name(buf: &mut impl Buf) -> Option<String> {
    let mut raw = Vec::with_capacity(buf.remaining());
    while buf.has_remaining() {
        match buf.get_u8() {
            0 => break,
            b => raw.push(b),
        }
    }
    if raw.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&raw).into_owned())
    }
}

impl Display for ControlMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.cmd == Command::Synchronization {
            write!(f, "{} SSRC=0x{:08x}", self.cmd, self.ssrc)?;
            for (i, ts) in self.timestamps.iter().enumerate() {
                write!(f, " ts{}={}", i + 1, ts)?;
            }
            Ok(())
        } else {
            write!(
                f,
                "{} token=0x{:x} SSRC=0x{:08x} name=[{}]",
                self.cmd,
                self.token,
                self.ssrc,
                self.name.as_deref().unwrap_or("")
            )
        }
    }
}

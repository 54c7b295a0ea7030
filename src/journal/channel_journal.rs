use bytes::{Buf, BufMut, BytesMut};

use crate::journal::chapter_n::ChapterN;
use crate::protocol::ProtocolError;

/*
 0                   1                   2                   3
 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
|S| CHAN  |H|      LENGTH       |P|C|M|W|N|E|T|A|  Chapters ... |
+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
*/

// first 2 header octets
const S_FLAG: u16 = 0x8000; // single packet loss
const CHANNEL_MASK: u16 = 0x7800;
const H_FLAG: u16 = 0x0400; // enhanced chapter C encoding
const LENGTH_MASK: u16 = 0x003f;

// chapter table of contents (3rd octet), one presence bit per chapter kind
//  in the order P,C,M,W,N,E,T,A
const CHAPTER_N: u8 = 0x08;

const HEADER_LEN: usize = 3;

/// The recovery journal of a single MIDI channel: a chapter table of
///  contents followed by the present chapters. Only chapter N (note on/off)
///  is carried by this implementation.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ChannelJournal {
    pub single_loss: bool,
    /// MIDI channel, 0-15.
    pub channel: u8,
    /// Use enhanced chapter C encoding.
    pub enhanced: bool,
    pub chapter_n: Option<ChapterN>,
}

impl ChannelJournal {
    pub fn new(channel: u8) -> ChannelJournal {
        ChannelJournal {
            single_loss: false,
            channel,
            enhanced: false,
            chapter_n: None,
        }
    }

    fn toc(&self) -> u8 {
        if self.chapter_n.is_some() {
            CHAPTER_N
        } else {
            0
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        // no chapter flags set - the chapter region is empty
        let mut chapters = BytesMut::new();
        if let Some(chapter_n) = &self.chapter_n {
            chapter_n.ser(&mut chapters)?;
        }

        let length = HEADER_LEN + chapters.len();
        if length > LENGTH_MASK as usize {
            return Err(ProtocolError::InvalidMessage("channel journal exceeds the 6-bit length field"));
        }

        let mut header = length as u16 & LENGTH_MASK;
        if self.single_loss {
            header |= S_FLAG;
        }
        header |= (self.channel as u16) << 11 & CHANNEL_MASK;
        if self.enhanced {
            header |= H_FLAG;
        }

        buf.put_u16(header);
        buf.put_u8(self.toc());
        buf.put_slice(&chapters);
        Ok(())
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<ChannelJournal, ProtocolError> {
        let header = buf.try_get_u16()?;
        let toc = buf.try_get_u8()?;

        if toc & !CHAPTER_N != 0 {
            // chapter boundaries other than N cannot be located without
            //  implementing those chapters
            return Err(ProtocolError::InvalidMessage("unsupported chapter in table of contents"));
        }

        let chapter_n = if toc & CHAPTER_N != 0 {
            Some(ChapterN::try_deser(buf)?)
        } else {
            None
        };

        Ok(ChannelJournal {
            single_loss: header & S_FLAG != 0,
            channel: ((header & CHANNEL_MASK) >> 11) as u8,
            enhanced: header & H_FLAG != 0,
            chapter_n,
        })
    }
}

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, BytesMut};

use crate::journal::channel_journal::ChannelJournal;
use crate::journal::chapter_n::{ChapterN, NoteOnLog};
use crate::protocol::ProtocolError;

pub mod channel_journal;
pub mod chapter_n;

/*
 0                   1                   2
 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3
+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
|S|Y|A|H|TOTCHAN|   Checkpoint Packet Seqnum    |
+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
*/
const S_FLAG: u8 = 0x80; // single packet loss
const Y_FLAG: u8 = 0x40; // system journal present
const A_FLAG: u8 = 0x20; // channel journals present
const H_FLAG: u8 = 0x10; // enhanced chapter C encoding
const TOTCHAN_MASK: u8 = 0x0f;

const NOTE_OFF: u8 = 0x80;
const NOTE_ON: u8 = 0x90;

const MAX_NOTE_LOGS: usize = 127;

/// Sender-authoritative loss-recovery state: everything a receiver needs to
///  recover from lost packets since the checkpoint. Not yet wired into the
///  MIDI packet codec's journal section.
///
/// No system journal is carried (the Y flag stays 0).
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct RecoveryJournal {
    pub single_loss: bool,
    /// Use enhanced chapter C encoding.
    pub enhanced: bool,
    /// Extended sequence number of the checkpoint packet; the low 16 bits go
    ///  on the wire.
    pub checkpoint_seqnum: u32,
    /// Per-channel journals, keyed by MIDI channel (0-15).
    pub channels: BTreeMap<u8, ChannelJournal>,
}

impl RecoveryJournal {
    pub fn ser(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let mut b0 = 0u8;
        if self.single_loss {
            b0 |= S_FLAG;
        }
        if self.enhanced {
            b0 |= H_FLAG;
        }
        if !self.channels.is_empty() {
            // TOTCHAN codes the channel count minus one so 16 channels fit 4 bits
            b0 |= A_FLAG;
            b0 |= (self.channels.len() - 1) as u8 & TOTCHAN_MASK;
        }
        buf.put_u8(b0);
        buf.put_u16(self.checkpoint_seqnum as u16);

        for channel in self.channels.values() {
            channel.ser(buf)?;
        }
        Ok(())
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<RecoveryJournal, ProtocolError> {
        let b0 = buf.try_get_u8()?;
        if b0 & Y_FLAG != 0 {
            return Err(ProtocolError::InvalidMessage("system journal is not supported"));
        }
        let checkpoint_seqnum = buf.try_get_u16()? as u32;

        let mut channels = BTreeMap::new();
        if b0 & A_FLAG != 0 {
            for _ in 0..(b0 & TOTCHAN_MASK) + 1 {
                let channel = ChannelJournal::try_deser(buf)?;
                channels.insert(channel.channel, channel);
            }
        }

        Ok(RecoveryJournal {
            single_loss: b0 & S_FLAG != 0,
            enhanced: b0 & H_FLAG != 0,
            checkpoint_seqnum,
            channels,
        })
    }

    /// Fold a sent MIDI command into the journal. Only note on/off commands
    ///  (chapter N) are recognized; everything else is left alone.
    pub fn record(&mut self, seqnum: u32, timestamp: u32, payload: &[u8]) {
        if payload.len() < 3 {
            return;
        }
        let status = payload[0];
        let channel = status & 0x0f;
        let note = payload[1] & 0x7f;
        let velocity = payload[2] & 0x7f;

        match status & 0xf0 {
            NOTE_ON if velocity != 0 => self.record_note_on(seqnum, timestamp, channel, note, velocity),
            NOTE_ON | NOTE_OFF => self.record_note_off(seqnum, channel, note),
            _ => {}
        }
    }

    /// A receiver feedback acknowledging `seqnum`: everything up to the
    ///  checkpoint no longer needs recovering.
    pub fn acknowledge(&mut self, seqnum: u32) {
        self.checkpoint_seqnum = seqnum;
        self.channels.clear();
    }

    fn chapter_n(&mut self, channel: u8) -> &mut ChapterN {
        self.channels
            .entry(channel)
            .or_insert_with(|| ChannelJournal::new(channel))
            .chapter_n
            .get_or_insert_with(ChapterN::default)
    }

    fn record_note_on(&mut self, seqnum: u32, timestamp: u32, channel: u8, note: u8, velocity: u8) {
        let chapter = self.chapter_n(channel);
        chapter.note_seqnum = seqnum;
        chapter.note_timestamp = timestamp;
        chapter.note_off.retain(|&n| n != note);

        let log = NoteOnLog {
            note,
            velocity,
            play_recommendation: true,
        };
        if let Some(existing) = chapter.note_on.iter_mut().find(|l| l.note == note) {
            *existing = log;
        } else if chapter.note_on.len() < MAX_NOTE_LOGS {
            chapter.note_on.push(log);
        }
    }

    fn record_note_off(&mut self, seqnum: u32, channel: u8, note: u8) {
        let chapter = self.chapter_n(channel);
        chapter.note_seqnum = seqnum;
        chapter.note_on.retain(|l| l.note != note);
        if !chapter.note_off.contains(&note) {
            chapter.note_off.push(note);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(RecoveryJournal::default())]
    #[case::checkpoint_only(RecoveryJournal { checkpoint_seqnum: 0xbeef, ..Default::default() })]
    #[case::single_loss(RecoveryJournal { single_loss: true, ..Default::default() })]
    fn test_ser_deser(#[case] journal: RecoveryJournal) {
        let mut buf = BytesMut::new();
        journal.ser(&mut buf).unwrap();

        let mut b: &[u8] = &buf;
        let deser = RecoveryJournal::try_deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, journal);
    }

    #[test]
    fn test_ser_deser_with_channels() {
        let mut journal = RecoveryJournal::default();
        journal.record(7, 100, &[0x93, 0x3c, 0x40]);
        journal.record(8, 120, &[0x80, 0x30, 0x00]);

        let mut buf = BytesMut::new();
        journal.ser(&mut buf).unwrap();

        let mut b: &[u8] = &buf;
        let deser = RecoveryJournal::try_deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser.channels.len(), 2);
        assert_eq!(
            deser.channels[&3].chapter_n.as_ref().unwrap().note_on,
            vec![NoteOnLog { note: 0x3c, velocity: 0x40, play_recommendation: true }]
        );
        assert_eq!(deser.channels[&0].chapter_n.as_ref().unwrap().note_off, vec![0x30]);
    }

    #[test]
    fn test_ser_header_bits() {
        let mut journal = RecoveryJournal {
            single_loss: true,
            checkpoint_seqnum: 0x1_1234,
            ..Default::default()
        };
        journal.record(1, 1, &[0x90, 0x40, 0x10]);

        let mut buf = BytesMut::new();
        journal.ser(&mut buf).unwrap();
        // S=1, A=1, TOTCHAN=0 (one channel); checkpoint truncated to 16 bits
        assert_eq!(&buf[..3], &[0xa0, 0x12, 0x34]);
    }

    #[test]
    fn test_record_note_lifecycle() {
        let mut journal = RecoveryJournal::default();

        journal.record(1, 50, &[0x90, 0x3c, 0x40]);
        let chapter = journal.channels[&0].chapter_n.as_ref().unwrap();
        assert_eq!(chapter.note_seqnum, 1);
        assert_eq!(chapter.note_timestamp, 50);
        assert_eq!(chapter.note_on.len(), 1);

        // zero-velocity note-on counts as note-off
        journal.record(2, 60, &[0x90, 0x3c, 0x00]);
        let chapter = journal.channels[&0].chapter_n.as_ref().unwrap();
        assert!(chapter.note_on.is_empty());
        assert_eq!(chapter.note_off, vec![0x3c]);

        // a fresh note-on clears the pending off bit
        journal.record(3, 70, &[0x90, 0x3c, 0x7f]);
        let chapter = journal.channels[&0].chapter_n.as_ref().unwrap();
        assert_eq!(chapter.note_on.len(), 1);
        assert_eq!(chapter.note_on[0].velocity, 0x7f);
        assert!(chapter.note_off.is_empty());
    }

    #[test]
    fn test_record_ignores_non_note_commands() {
        let mut journal = RecoveryJournal::default();
        journal.record(1, 1, &[0xb0, 0x07, 0x64]); // control change
        journal.record(2, 2, &[0xf8]); // clock
        assert!(journal.channels.is_empty());
    }

    #[test]
    fn test_acknowledge_clears_state() {
        let mut journal = RecoveryJournal::default();
        journal.record(1, 1, &[0x90, 0x3c, 0x40]);
        journal.acknowledge(42);
        assert!(journal.channels.is_empty());
        assert_eq!(journal.checkpoint_seqnum, 42);
    }
}

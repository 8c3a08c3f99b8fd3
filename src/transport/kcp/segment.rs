//! KCP segment kinds and their byte-exact wire codec
//!
//! Every segment starts with a command byte, an option bitfield, and the
//! 16-bit conversation id in big-endian. The body depends on the command:
//!
//! ```text
//! 0x00 Data:    timestamp(4) number(4) sending_next(4) len(2) payload
//! 0x01 Ack:     receiving_window(4) receiving_next(4) count(1)
//!               count x { timestamp(4) number(4) }
//! 0x02 CmdOnly: command(1) sending_next(4) receiving_next(4) peer_rto(4)
//! ```
//!
//! A UDP datagram may carry several segments back to back; the parser
//! consumes one at a time and stops at the first malformed byte.

use crate::buf::Buffer;

/// Fixed per-segment framing cost of a Data segment.
pub const DATA_SEGMENT_OVERHEAD: usize = 18;

/// Option bit: sender has half-closed its write side.
pub const SEGMENT_OPTION_CLOSE: u8 = 0x01;

/// Most (timestamp, number) pairs a single Ack segment carries.
pub const MAX_ACK_COUNT: usize = 128;

const CMD_DATA: u8 = 0x00;
const CMD_ACK: u8 = 0x01;
const CMD_ONLY: u8 = 0x02;

/// Sub-command of a [`CmdOnlySegment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Keep-alive and state carrier
    Ping,
    /// Full-close signal
    Terminate,
}

impl Command {
    fn to_byte(self) -> u8 {
        match self {
            Self::Ping => 0,
            Self::Terminate => 1,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Ping),
            1 => Some(Self::Terminate),
            _ => None,
        }
    }
}

/// An in-order payload carrier.
#[derive(Debug)]
pub struct DataSegment {
    /// Conversation id
    pub conv: u16,
    /// Option bitfield
    pub option: u8,
    /// Sender clock at transmission, milliseconds
    pub timestamp: u32,
    /// Sequence number
    pub number: u32,
    /// Sender's lowest unacknowledged number at transmission
    pub sending_next: u32,
    /// Payload bytes
    pub payload: Buffer,
}

/// Anything with the common KCP wire framing.
pub trait SegmentEncode {
    /// Encoded size in bytes.
    fn byte_size(&self) -> usize;
    /// Append the wire encoding to `out`.
    fn encode(&self, out: &mut Buffer);
}

impl SegmentEncode for DataSegment {
    fn byte_size(&self) -> usize {
        DATA_SEGMENT_OVERHEAD + self.payload.len()
    }

    fn encode(&self, out: &mut Buffer) {
        out.append(&[CMD_DATA, self.option]);
        out.append(&self.conv.to_be_bytes());
        out.append(&self.timestamp.to_be_bytes());
        out.append(&self.number.to_be_bytes());
        out.append(&self.sending_next.to_be_bytes());
        out.append(&(self.payload.len() as u16).to_be_bytes());
        out.append(self.payload.bytes());
    }
}

/// One acknowledged (timestamp, number) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckEntry {
    /// Echoed sender timestamp
    pub timestamp: u32,
    /// Acknowledged sequence number
    pub number: u32,
}

/// Cumulative plus selective acknowledgement.
#[derive(Debug)]
pub struct AckSegment {
    /// Conversation id
    pub conv: u16,
    /// Option bitfield
    pub option: u8,
    /// Right edge of the receiver's window (next expected + window size)
    pub receiving_window: u32,
    /// Next number the receiver expects contiguously
    pub receiving_next: u32,
    /// Selectively acknowledged segments
    pub entries: Vec<AckEntry>,
}

impl SegmentEncode for AckSegment {
    fn byte_size(&self) -> usize {
        13 + self.entries.len() * 8
    }

    fn encode(&self, out: &mut Buffer) {
        debug_assert!(self.entries.len() <= MAX_ACK_COUNT);
        out.append(&[CMD_ACK, self.option]);
        out.append(&self.conv.to_be_bytes());
        out.append(&self.receiving_window.to_be_bytes());
        out.append(&self.receiving_next.to_be_bytes());
        out.append(&[self.entries.len() as u8]);
        for entry in &self.entries {
            out.append(&entry.timestamp.to_be_bytes());
            out.append(&entry.number.to_be_bytes());
        }
    }
}

/// Control segment without payload: ping or terminate.
#[derive(Debug)]
pub struct CmdOnlySegment {
    /// Conversation id
    pub conv: u16,
    /// Option bitfield
    pub option: u8,
    /// Sub-command
    pub command: Command,
    /// Sender's lowest unacknowledged number
    pub sending_next: u32,
    /// Sender's next expected receive number
    pub receiving_next: u32,
    /// Sender's current retransmission timeout, milliseconds
    pub peer_rto: u32,
}

impl SegmentEncode for CmdOnlySegment {
    fn byte_size(&self) -> usize {
        17
    }

    fn encode(&self, out: &mut Buffer) {
        out.append(&[CMD_ONLY, self.option]);
        out.append(&self.conv.to_be_bytes());
        out.append(&[self.command.to_byte()]);
        out.append(&self.sending_next.to_be_bytes());
        out.append(&self.receiving_next.to_be_bytes());
        out.append(&self.peer_rto.to_be_bytes());
    }
}

/// Any KCP segment.
#[derive(Debug)]
pub enum Segment {
    /// Payload carrier
    Data(DataSegment),
    /// Acknowledgement
    Ack(AckSegment),
    /// Control only
    Cmd(CmdOnlySegment),
}

impl Segment {
    /// The conversation this segment belongs to.
    #[must_use]
    pub fn conversation(&self) -> u16 {
        match self {
            Self::Data(s) => s.conv,
            Self::Ack(s) => s.conv,
            Self::Cmd(s) => s.conv,
        }
    }

    /// The option bitfield.
    #[must_use]
    pub fn option(&self) -> u8 {
        match self {
            Self::Data(s) => s.option,
            Self::Ack(s) => s.option,
            Self::Cmd(s) => s.option,
        }
    }
}

impl SegmentEncode for Segment {
    fn byte_size(&self) -> usize {
        match self {
            Self::Data(s) => s.byte_size(),
            Self::Ack(s) => s.byte_size(),
            Self::Cmd(s) => s.byte_size(),
        }
    }

    fn encode(&self, out: &mut Buffer) {
        match self {
            Self::Data(s) => s.encode(out),
            Self::Ack(s) => s.encode(out),
            Self::Cmd(s) => s.encode(out),
        }
    }
}

fn read_u16(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

/// Peek the conversation id of the first segment in a datagram.
#[must_use]
pub fn read_conversation(data: &[u8]) -> Option<u16> {
    if data.len() < 4 {
        return None;
    }
    Some(read_u16(data, 2))
}

/// Decode one segment from the front of `data`, returning it along with
/// the remaining bytes. `None` terminates the per-datagram parse loop:
/// malformed trailing bytes are discarded, not diagnosed.
#[must_use]
pub fn read_segment(data: &[u8]) -> Option<(Segment, &[u8])> {
    if data.len() < 4 {
        return None;
    }
    let cmd = data[0];
    let option = data[1];
    let conv = read_u16(data, 2);
    let body = &data[4..];

    match cmd {
        CMD_DATA => {
            if body.len() < 14 {
                return None;
            }
            let timestamp = read_u32(body, 0);
            let number = read_u32(body, 4);
            let sending_next = read_u32(body, 8);
            let len = read_u16(body, 12) as usize;
            let rest = &body[14..];
            if rest.len() < len {
                return None;
            }
            let mut payload = Buffer::small();
            if payload.unfilled().len() < len {
                return None;
            }
            payload.append(&rest[..len]);
            Some((
                Segment::Data(DataSegment {
                    conv,
                    option,
                    timestamp,
                    number,
                    sending_next,
                    payload,
                }),
                &rest[len..],
            ))
        }
        CMD_ACK => {
            if body.len() < 9 {
                return None;
            }
            let receiving_window = read_u32(body, 0);
            let receiving_next = read_u32(body, 4);
            let count = body[8] as usize;
            let rest = &body[9..];
            if rest.len() < count * 8 {
                return None;
            }
            let mut entries = Vec::with_capacity(count);
            for i in 0..count {
                entries.push(AckEntry {
                    timestamp: read_u32(rest, i * 8),
                    number: read_u32(rest, i * 8 + 4),
                });
            }
            Some((
                Segment::Ack(AckSegment {
                    conv,
                    option,
                    receiving_window,
                    receiving_next,
                    entries,
                }),
                &rest[count * 8..],
            ))
        }
        CMD_ONLY => {
            if body.len() < 13 {
                return None;
            }
            let command = Command::from_byte(body[0])?;
            Some((
                Segment::Cmd(CmdOnlySegment {
                    conv,
                    option,
                    command,
                    sending_next: read_u32(body, 1),
                    receiving_next: read_u32(body, 5),
                    peer_rto: read_u32(body, 9),
                }),
                &body[13..],
            ))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_segment_round_trip() {
        let seg = DataSegment {
            conv: 0x1234,
            option: SEGMENT_OPTION_CLOSE,
            timestamp: 7,
            number: 42,
            sending_next: 40,
            payload: Buffer::from_bytes(b"payload"),
        };
        let mut out = Buffer::small();
        seg.encode(&mut out);
        assert_eq!(out.len(), seg.byte_size());
        assert_eq!(out.bytes()[0], CMD_DATA);
        assert_eq!(&out.bytes()[2..4], &[0x12, 0x34]);

        let (parsed, rest) = read_segment(out.bytes()).unwrap();
        assert!(rest.is_empty());
        match parsed {
            Segment::Data(d) => {
                assert_eq!(d.conv, 0x1234);
                assert_eq!(d.option, SEGMENT_OPTION_CLOSE);
                assert_eq!(d.timestamp, 7);
                assert_eq!(d.number, 42);
                assert_eq!(d.sending_next, 40);
                assert_eq!(d.payload.bytes(), b"payload");
            }
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn test_ack_segment_round_trip() {
        let seg = AckSegment {
            conv: 9,
            option: 0,
            receiving_window: 32,
            receiving_next: 100,
            entries: vec![
                AckEntry {
                    timestamp: 1,
                    number: 100,
                },
                AckEntry {
                    timestamp: 2,
                    number: 103,
                },
            ],
        };
        let mut out = Buffer::small();
        seg.encode(&mut out);
        assert_eq!(out.len(), 13 + 16);

        let (parsed, rest) = read_segment(out.bytes()).unwrap();
        assert!(rest.is_empty());
        match parsed {
            Segment::Ack(a) => {
                assert_eq!(a.receiving_window, 32);
                assert_eq!(a.receiving_next, 100);
                assert_eq!(a.entries.len(), 2);
                assert_eq!(a.entries[1].number, 103);
            }
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn test_cmd_segment_round_trip() {
        let seg = CmdOnlySegment {
            conv: 1,
            option: 0,
            command: Command::Terminate,
            sending_next: 5,
            receiving_next: 6,
            peer_rto: 200,
        };
        let mut out = Buffer::small();
        seg.encode(&mut out);
        assert_eq!(out.len(), 17);

        let (parsed, _) = read_segment(out.bytes()).unwrap();
        match parsed {
            Segment::Cmd(c) => {
                assert_eq!(c.command, Command::Terminate);
                assert_eq!(c.sending_next, 5);
                assert_eq!(c.receiving_next, 6);
                assert_eq!(c.peer_rto, 200);
            }
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn test_multiple_segments_per_datagram() {
        let mut out = Buffer::small();
        CmdOnlySegment {
            conv: 2,
            option: 0,
            command: Command::Ping,
            sending_next: 0,
            receiving_next: 0,
            peer_rto: 100,
        }
        .encode(&mut out);
        DataSegment {
            conv: 2,
            option: 0,
            timestamp: 0,
            number: 0,
            sending_next: 0,
            payload: Buffer::from_bytes(b"x"),
        }
        .encode(&mut out);

        let (first, rest) = read_segment(out.bytes()).unwrap();
        assert!(matches!(first, Segment::Cmd(_)));
        let (second, rest) = read_segment(rest).unwrap();
        assert!(matches!(second, Segment::Data(_)));
        assert!(rest.is_empty());
    }

    #[test]
    fn test_malformed_input_terminates_parse() {
        assert!(read_segment(&[]).is_none());
        assert!(read_segment(&[0x00, 0x00, 0x01]).is_none());
        // truncated data body
        assert!(read_segment(&[0x00, 0, 0, 1, 0, 0, 0, 1]).is_none());
        // unknown command byte
        assert!(read_segment(&[0x09, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]).is_none());
        // data segment whose declared length exceeds the datagram
        let mut out = Buffer::small();
        DataSegment {
            conv: 1,
            option: 0,
            timestamp: 0,
            number: 0,
            sending_next: 0,
            payload: Buffer::from_bytes(b"abcdef"),
        }
        .encode(&mut out);
        let bytes = out.bytes();
        assert!(read_segment(&bytes[..bytes.len() - 2]).is_none());
    }

    #[test]
    fn test_read_conversation() {
        assert_eq!(read_conversation(&[0, 0, 0xAB, 0xCD]), Some(0xABCD));
        assert_eq!(read_conversation(&[0, 0]), None);
    }
}

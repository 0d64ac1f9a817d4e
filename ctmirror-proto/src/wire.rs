//! Fixed message header and frame walking.
//!
//! All multi-byte fields are network byte order on the wire.

use crate::error::ProtoError;
use crate::seq::SeqNum;
use bitflags::bitflags;

/// Size of the base header: version, flags, type, reserved, len, seq.
pub const NETHDR_SIZ: usize = 10;
/// Size of the header extended with ACK/NACK/RESYNC sequence bounds.
pub const NETHDR_ACK_SIZ: usize = NETHDR_SIZ + 8;

bitflags! {
    /// Control bits carried in the second header octet.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NetFlags: u8 {
        const RESYNC     = 1 << 0;
        const NACK       = 1 << 1;
        const ACK        = 1 << 2;
        const ALIVE      = 1 << 3;
        const HELLO      = 1 << 4;
        const HELLO_BACK = 1 << 5;
    }
}

impl NetFlags {
    /// A message with any of these bits carries the extended header.
    pub fn has_ack_hdr(self) -> bool {
        self.intersects(NetFlags::ACK | NetFlags::NACK | NetFlags::RESYNC)
    }

    /// Data messages carry a flow payload; control bits other than the
    /// HELLO handshake pair make a message pure control.
    pub fn is_data(self) -> bool {
        !self.intersects(
            NetFlags::ACK | NetFlags::NACK | NetFlags::RESYNC | NetFlags::ALIVE,
        )
    }
}

/// Message types on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    CtNew = 0,
    CtUpd = 1,
    CtDel = 2,
    ExpNew = 3,
    ExpUpd = 4,
    ExpDel = 5,
    /// Pure control frame, no payload.
    Ctl = 10,
}

impl MsgType {
    pub fn from_u8(val: u8) -> Option<MsgType> {
        match val {
            0 => Some(MsgType::CtNew),
            1 => Some(MsgType::CtUpd),
            2 => Some(MsgType::CtDel),
            3 => Some(MsgType::ExpNew),
            4 => Some(MsgType::ExpUpd),
            5 => Some(MsgType::ExpDel),
            10 => Some(MsgType::Ctl),
            _ => None,
        }
    }

    pub fn is_expectation(self) -> bool {
        matches!(self, MsgType::ExpNew | MsgType::ExpUpd | MsgType::ExpDel)
    }
}

/// Sequence bounds carried by ACK, NACK and RESYNC messages, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckBounds {
    pub from: SeqNum,
    pub to: SeqNum,
}

/// The fixed sync message header.
///
/// `msg_type` is kept raw so that unknown types survive dissection; use
/// [`NetHdr::typ`] for the decoded variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetHdr {
    pub version: u8,
    pub flags: NetFlags,
    pub msg_type: u8,
    /// Total message length including this header and any ACK extension.
    pub len: u16,
    pub seq: SeqNum,
    /// Present iff `flags.has_ack_hdr()`.
    pub bounds: Option<AckBounds>,
}

impl NetHdr {
    pub fn typ(&self) -> Option<MsgType> {
        MsgType::from_u8(self.msg_type)
    }

    pub fn hdr_len(&self) -> usize {
        if self.flags.has_ack_hdr() {
            NETHDR_ACK_SIZ
        } else {
            NETHDR_SIZ
        }
    }

    /// Appends the header in wire byte order. `len` must already be final.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.version);
        out.push(self.flags.bits());
        out.push(self.msg_type);
        out.push(0); // reserved
        out.extend_from_slice(&self.len.to_be_bytes());
        out.extend_from_slice(&self.seq.0.to_be_bytes());
        if let Some(b) = self.bounds {
            out.extend_from_slice(&b.from.0.to_be_bytes());
            out.extend_from_slice(&b.to.0.to_be_bytes());
        }
    }

    /// Parses one header from the front of `buf`, validating the declared
    /// length against the remaining bytes and the minimum header sizes.
    pub fn parse(buf: &[u8]) -> Result<NetHdr, ProtoError> {
        if buf.len() < NETHDR_SIZ {
            return Err(ProtoError::TruncatedHeader(buf.len()));
        }
        let version = buf[0];
        let flags = NetFlags::from_bits_truncate(buf[1]);
        let msg_type = buf[2];
        let len = u16::from_be_bytes([buf[4], buf[5]]);
        let seq = SeqNum(u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]));

        if len == 0 {
            return Err(ProtoError::BadLength(len));
        }
        if len as usize > buf.len() {
            return Err(ProtoError::TruncatedPacket {
                claimed: len,
                remain: buf.len(),
            });
        }

        let bounds = if flags.has_ack_hdr() {
            if buf.len() < NETHDR_ACK_SIZ || (len as usize) < NETHDR_ACK_SIZ {
                return Err(ProtoError::TruncatedAck);
            }
            Some(AckBounds {
                from: SeqNum(u32::from_be_bytes([buf[10], buf[11], buf[12], buf[13]])),
                to: SeqNum(u32::from_be_bytes([buf[14], buf[15], buf[16], buf[17]])),
            })
        } else {
            if (len as usize) < NETHDR_SIZ {
                return Err(ProtoError::BadLength(len));
            }
            None
        };

        Ok(NetHdr {
            version,
            flags,
            msg_type,
            len,
            seq,
            bounds,
        })
    }
}

//! Minimal classic-pcap container reader: 24-byte global header, 16-byte
//! record headers, either byte order, microsecond or nanosecond magic.

use crate::DissectError;

const MAGIC_USEC: u32 = 0xa1b2_c3d4;
const MAGIC_NSEC: u32 = 0xa1b2_3c4d;

const GLOBAL_HDR_LEN: usize = 24;
const RECORD_HDR_LEN: usize = 16;

/// Ethernet link type; the only one the dissector understands.
pub const LINKTYPE_ETHERNET: u32 = 1;

pub struct Packet<'a> {
    pub ts_sec: u32,
    pub data: &'a [u8],
}

pub struct PcapReader<'a> {
    body: &'a [u8],
    swapped: bool,
    pub linktype: u32,
}

impl<'a> PcapReader<'a> {
    pub fn new(data: &'a [u8]) -> Result<PcapReader<'a>, DissectError> {
        if data.len() < GLOBAL_HDR_LEN {
            return Err(DissectError::BadCapture("truncated global header"));
        }
        let raw_magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let swapped = match raw_magic {
            MAGIC_USEC | MAGIC_NSEC => false,
            m if m.swap_bytes() == MAGIC_USEC || m.swap_bytes() == MAGIC_NSEC => true,
            _ => return Err(DissectError::BadCapture("unknown magic")),
        };
        let read_u32 = |off: usize| {
            let bytes = [data[off], data[off + 1], data[off + 2], data[off + 3]];
            if swapped {
                u32::from_be_bytes(bytes)
            } else {
                u32::from_le_bytes(bytes)
            }
        };
        let linktype = read_u32(20);
        Ok(PcapReader {
            body: &data[GLOBAL_HDR_LEN..],
            swapped,
            linktype,
        })
    }

    fn read_u32(&self, buf: &[u8], off: usize) -> u32 {
        let bytes = [buf[off], buf[off + 1], buf[off + 2], buf[off + 3]];
        if self.swapped {
            u32::from_be_bytes(bytes)
        } else {
            u32::from_le_bytes(bytes)
        }
    }
}

impl<'a> Iterator for PcapReader<'a> {
    type Item = Packet<'a>;

    fn next(&mut self) -> Option<Packet<'a>> {
        if self.body.len() < RECORD_HDR_LEN {
            return None;
        }
        let ts_sec = self.read_u32(self.body, 0);
        let incl_len = self.read_u32(self.body, 8) as usize;
        let rest = &self.body[RECORD_HDR_LEN..];
        if rest.len() < incl_len {
            // Truncated tail record; stop cleanly.
            self.body = &[];
            return None;
        }
        let data = &rest[..incl_len];
        self.body = &rest[incl_len..];
        Some(Packet { ts_sec, data })
    }
}

/// Builds an in-memory capture; shared by the test suites.
pub fn build_capture(packets: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC_USEC.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes()); // version major
    out.extend_from_slice(&4u16.to_le_bytes()); // version minor
    out.extend_from_slice(&0i32.to_le_bytes()); // thiszone
    out.extend_from_slice(&0u32.to_le_bytes()); // sigfigs
    out.extend_from_slice(&65535u32.to_le_bytes()); // snaplen
    out.extend_from_slice(&LINKTYPE_ETHERNET.to_le_bytes());
    for pkt in packets {
        out.extend_from_slice(&0u32.to_le_bytes()); // ts_sec
        out.extend_from_slice(&0u32.to_le_bytes()); // ts_usec
        out.extend_from_slice(&(pkt.len() as u32).to_le_bytes());
        out.extend_from_slice(&(pkt.len() as u32).to_le_bytes());
        out.extend_from_slice(pkt);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_back_built_captures() {
        let capture = build_capture(&[b"abc", b"defgh"]);
        let reader = PcapReader::new(&capture).unwrap();
        assert_eq!(reader.linktype, LINKTYPE_ETHERNET);
        let packets: Vec<_> = reader.map(|p| p.data.to_vec()).collect();
        assert_eq!(packets, vec![b"abc".to_vec(), b"defgh".to_vec()]);
    }

    #[test]
    fn rejects_unknown_magic() {
        assert!(PcapReader::new(&[0u8; 24]).is_err());
        assert!(PcapReader::new(b"short").is_err());
    }

    #[test]
    fn handles_byte_swapped_captures() {
        let mut capture = build_capture(&[b"xy"]);
        // Rewrite the whole header big-endian.
        capture[..4].copy_from_slice(&MAGIC_USEC.to_be_bytes());
        capture[20..24].copy_from_slice(&LINKTYPE_ETHERNET.to_be_bytes());
        capture[24 + 8..24 + 12].copy_from_slice(&2u32.to_be_bytes());
        capture[24 + 12..24 + 16].copy_from_slice(&2u32.to_be_bytes());
        let reader = PcapReader::new(&capture).unwrap();
        assert_eq!(reader.linktype, LINKTYPE_ETHERNET);
        let packets: Vec<_> = reader.collect();
        assert_eq!(packets[0].data, b"xy");
    }
}

//! Offline parser of captured sync packets.
//!
//! Reads a classic-pcap capture, walks each Ethernet frame down to the sync
//! port, strips the padding of short frames, and dissects the back-to-back
//! sync messages inside, printing one line per message. Malformed
//! attributes fail their message; framing errors abort the rest of the
//! packet; the capture as a whole keeps going.

pub mod bisect;
pub mod pcap;
pub mod proto;

use std::io::Write;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DissectError {
    #[error("not a pcap capture: {0}")]
    BadCapture(&'static str),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Counters printed in the summary line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DissectStats {
    pub pkts: u32,
    pub errors: u32,
    pub skip: u32,
    pub l3_proto_unsupported: u32,
    pub l4_proto_unsupported: u32,
    pub l3_proto_malformed: u32,
    pub l4_proto_malformed: u32,
    pub sync_version_old: u32,
}

/// Dissects a whole capture, writing per-message lines to `out`.
pub fn dissect_capture(
    data: &[u8],
    port: u16,
    out: &mut dyn Write,
) -> Result<DissectStats, DissectError> {
    let reader = pcap::PcapReader::new(data)?;
    let registry = proto::Registry::new();
    let mut stats = DissectStats::default();
    for packet in reader {
        stats.pkts += 1;
        bisect::process_packet(&registry, &mut stats, packet.data, port, out)?;
    }
    Ok(stats)
}

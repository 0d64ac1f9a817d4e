//! Frame walking and per-message printing.

use crate::proto::{Registry, IPPROTO_TCP, IPPROTO_UDP};
use crate::{DissectError, DissectStats};
use ctmirror_proto::attr::{nta_align, AttrLen, CtAttr, ExpAttr, NTA_HDR_SIZ};
use ctmirror_proto::{MsgType, NetFlags, NetHdr, PROTOCOL_VERSION};
use std::io::Write;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Ethernet pads frames up to this size; pcap captures include the padding
/// but not the FCS.
const MIN_ETHER_FRAME: usize = 60;

/// Walks one captured frame down to the sync payload and dissects it.
pub fn process_packet(
    registry: &Registry,
    stats: &mut DissectStats,
    pkt: &[u8],
    port: u16,
    out: &mut dyn Write,
) -> Result<(), DissectError> {
    if pkt.len() < 14 {
        stats.skip += 1;
        stats.l3_proto_unsupported += 1;
        return Ok(());
    }
    let ethertype = u16::from_be_bytes([pkt[12], pkt[13]]);
    let Some(l3h) = registry.l2l3(ethertype) else {
        stats.skip += 1;
        stats.l3_proto_unsupported += 1;
        return Ok(());
    };

    let l3 = &pkt[l3h.l2hdr_len..];
    let Some(info) = (l3h.parse)(l3) else {
        stats.errors += 1;
        stats.l3_proto_malformed += 1;
        return Ok(());
    };
    let Some(l4h) = registry.l4(info.l4proto) else {
        stats.skip += 1;
        stats.l4_proto_unsupported += 1;
        return Ok(());
    };
    if info.l3hdr_len > l3.len() {
        stats.errors += 1;
        stats.l3_proto_malformed += 1;
        return Ok(());
    }

    let l4 = &l3[info.l3hdr_len..];
    let Some(l4hdr_len) = (l4h.hdr_len)(l4) else {
        stats.errors += 1;
        stats.l4_proto_malformed += 1;
        return Ok(());
    };
    if l4hdr_len > l4.len() {
        stats.errors += 1;
        stats.l4_proto_malformed += 1;
        return Ok(());
    }

    // Reject traffic unless either endpoint is the sync port.
    if matches!(info.l4proto, IPPROTO_TCP | IPPROTO_UDP) {
        let sport = u16::from_be_bytes([l4[0], l4[1]]);
        let dport = u16::from_be_bytes([l4[2], l4[3]]);
        if sport != port && dport != port {
            stats.skip += 1;
            return Ok(());
        }
    }

    let payload = &l4[l4hdr_len..];
    let mut remain = payload.len();
    // Short frames were padded on the wire; discard the tail bytes.
    if info.tot_len + l3h.l2hdr_len < MIN_ETHER_FRAME {
        let pad = MIN_ETHER_FRAME - (info.tot_len + l3h.l2hdr_len);
        remain = remain.saturating_sub(pad);
    }

    bisect(stats, &payload[..remain], out)
}

/// Walks back-to-back sync messages inside one packet payload.
fn bisect(stats: &mut DissectStats, buf: &[u8], out: &mut dyn Write) -> Result<(), DissectError> {
    for item in ctmirror_proto::codec::FrameIter::new(buf) {
        match item {
            Ok((hdr, frame)) => {
                bisect_message(stats, &hdr, frame, out)?;
                writeln!(out)?;
            }
            Err(err) => {
                writeln!(out, "[warning: {}]", err)?;
                break;
            }
        }
    }
    Ok(())
}

fn bisect_message(
    stats: &mut DissectStats,
    hdr: &NetHdr,
    frame: &[u8],
    out: &mut dyn Write,
) -> Result<(), DissectError> {
    write!(out, "v{} ", hdr.version)?;
    if hdr.version != PROTOCOL_VERSION {
        write!(out, "[warning: old version] ")?;
        stats.errors += 1;
        stats.sync_version_old += 1;
    }
    write!(out, "seq:{} ", hdr.seq)?;

    if hdr.flags.contains(NetFlags::RESYNC) {
        write!(out, "RESYNC ")?;
    }
    if hdr.flags.contains(NetFlags::NACK) {
        write!(out, "NACK ")?;
    }
    if hdr.flags.contains(NetFlags::ACK) {
        write!(out, "ACK ")?;
    }
    if hdr.flags.contains(NetFlags::ALIVE) {
        write!(out, "ALIVE ")?;
    }
    if hdr.flags.contains(NetFlags::HELLO) {
        write!(out, "HELLO ")?;
    }
    if hdr.flags.contains(NetFlags::HELLO_BACK) {
        write!(out, "HELLO BACK ")?;
    }

    if let Some(bounds) = hdr.bounds {
        if hdr.flags.intersects(NetFlags::ACK | NetFlags::NACK) {
            if bounds.to.before(bounds.from) {
                write!(out, "[warning: bad ACK message] ")?;
            }
            write!(out, "from: {} to: {} ", bounds.from, bounds.to)?;
        }
    }

    if !hdr.flags.is_data() {
        return Ok(());
    }
    let body = &frame[hdr.hdr_len()..];
    match hdr.typ() {
        Some(MsgType::CtNew) => print_ct(out, "CT-NEW", body)?,
        Some(MsgType::CtUpd) => print_ct(out, "CT-UPD", body)?,
        Some(MsgType::CtDel) => print_ct(out, "CT-DEL", body)?,
        Some(MsgType::ExpNew) => print_exp(out, "EXP-NEW", body)?,
        Some(MsgType::ExpUpd) => print_exp(out, "EXP-UPD", body)?,
        Some(MsgType::ExpDel) => print_exp(out, "EXP-DEL", body)?,
        Some(MsgType::Ctl) => {}
        None => write!(out, "? [warning: unknown type] ")?,
    }
    Ok(())
}

fn print_ct(out: &mut dyn Write, label: &str, body: &[u8]) -> Result<(), DissectError> {
    write!(out, "{} ", label)?;
    if walk(out, body, |id| CtAttr::from_u16(id).map(CtAttr::declared_len), render_ct)?.is_err() {
        write!(out, "[warning: malformed payload] ")?;
    }
    Ok(())
}

fn print_exp(out: &mut dyn Write, label: &str, body: &[u8]) -> Result<(), DissectError> {
    write!(out, "{} ", label)?;
    if walk(
        out,
        body,
        |id| ExpAttr::from_u16(id).map(ExpAttr::declared_len),
        render_exp,
    )?
    .is_err()
    {
        write!(out, "[warning: malformed payload] ")?;
    }
    Ok(())
}

/// Prints the attribute list; the inner result reports whether the payload
/// was fully valid.
fn walk(
    out: &mut dyn Write,
    mut body: &[u8],
    declared: fn(u16) -> Option<AttrLen>,
    render: fn(u16, &[u8]) -> String,
) -> Result<Result<(), ()>, DissectError> {
    write!(out, "attrs=[ ")?;
    while body.len() > NTA_HDR_SIZ {
        let id = u16::from_be_bytes([body[0], body[1]]);
        let len = u16::from_be_bytes([body[2], body[3]]) as usize;
        if len < NTA_HDR_SIZ || len > body.len() {
            write!(out, "[warning: bad attribute length (attr={})] ", id)?;
            return Ok(Err(()));
        }
        let Some(size) = declared(id) else {
            write!(out, "[warning: wrong attribute type (attr={})] ", id)?;
            return Ok(Err(()));
        };
        let payload = &body[NTA_HDR_SIZ..len];
        match size {
            AttrLen::Fixed(want) if payload.len() != want => {
                write!(out, "[warning: wrong attribute length (attr={})] ", id)?;
                return Ok(Err(()));
            }
            AttrLen::Max(max) if payload.len() > max => {
                write!(
                    out,
                    "[warning: too big attribute length (attr={}) len={}>max={}] ",
                    id,
                    payload.len(),
                    max
                )?;
                return Ok(Err(()));
            }
            _ => {}
        }
        write!(out, "{}={} ", id, render(id, payload))?;
        let step = nta_align(len).min(body.len());
        body = &body[step..];
    }
    write!(out, "] ")?;
    Ok(Ok(()))
}

fn render_scalar(data: &[u8]) -> String {
    match data.len() {
        1 => data[0].to_string(),
        2 => u16::from_be_bytes([data[0], data[1]]).to_string(),
        4 => u32::from_be_bytes([data[0], data[1], data[2], data[3]]).to_string(),
        _ => format!("{} bytes", data.len()),
    }
}

fn render_ip4_group(data: &[u8]) -> String {
    let src = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
    let dst = Ipv4Addr::new(data[4], data[5], data[6], data[7]);
    format!("{}->{}", src, dst)
}

fn render_ip6_group(data: &[u8]) -> String {
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&data[..16]);
    dst.copy_from_slice(&data[16..32]);
    format!("{}->{}", Ipv6Addr::from(src), Ipv6Addr::from(dst))
}

fn render_port_group(data: &[u8]) -> String {
    format!(
        "{}->{}",
        u16::from_be_bytes([data[0], data[1]]),
        u16::from_be_bytes([data[2], data[3]])
    )
}

fn render_str(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

fn render_ct(id: u16, data: &[u8]) -> String {
    match CtAttr::from_u16(id) {
        Some(CtAttr::Ipv4) | Some(CtAttr::MasterIpv4) => render_ip4_group(data),
        Some(CtAttr::Ipv6) | Some(CtAttr::MasterIpv6) => render_ip6_group(data),
        Some(CtAttr::Port) | Some(CtAttr::MasterPort) => render_port_group(data),
        Some(CtAttr::NatSeqAdj) => "seq-adj".to_owned(),
        Some(CtAttr::HelperName) => render_str(data),
        _ => render_scalar(data),
    }
}

fn render_exp(id: u16, data: &[u8]) -> String {
    use ExpAttr::*;
    match ExpAttr::from_u16(id) {
        Some(MasterIpv4) | Some(ExpectIpv4) | Some(MaskIpv4) | Some(NatIpv4) => {
            render_ip4_group(data)
        }
        Some(MasterIpv6) | Some(ExpectIpv6) | Some(MaskIpv6) => render_ip6_group(data),
        Some(MasterPort) | Some(ExpectPort) | Some(MaskPort) | Some(NatPort) => {
            render_port_group(data)
        }
        Some(HelperName) | Some(Fn) => render_str(data),
        _ => render_scalar(data),
    }
}

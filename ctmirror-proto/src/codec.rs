//! Message encode/decode: NetHdr framing plus attribute TLV payloads.
//!
//! Encoding emits attributes in ascending id order and only for populated
//! fields. Decoding validates every TLV against the remaining length and the
//! attribute's declared size before touching the payload; any violation
//! fails the whole message and nothing is applied.

use crate::attr::{nta_align, AttrLen, CtAttr, ExpAttr, NTA_HDR_SIZ};
use crate::error::ProtoError;
use crate::expect::{Expectation, Tuple};
use crate::flow::{Flow, IpPair, L4Info, MasterTuple, NatSeqAdj, PortPair, StatusFlags};
use crate::seq::SeqNum;
use crate::wire::{AckBounds, MsgType, NetFlags, NetHdr, NETHDR_SIZ};
use crate::PROTOCOL_VERSION;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Decoded payload of a data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Flow(Flow),
    Expectation(Expectation),
}

// -------------------------------------------------------------------------
// Encoding
// -------------------------------------------------------------------------

struct AttrWriter {
    buf: Vec<u8>,
}

impl AttrWriter {
    fn new() -> AttrWriter {
        AttrWriter {
            buf: Vec::with_capacity(128),
        }
    }

    fn put(&mut self, attr: u16, payload: &[u8]) {
        let len = (NTA_HDR_SIZ + payload.len()) as u16;
        self.buf.extend_from_slice(&attr.to_be_bytes());
        self.buf.extend_from_slice(&len.to_be_bytes());
        self.buf.extend_from_slice(payload);
        let pad = nta_align(len as usize) - len as usize;
        self.buf.extend_from_slice(&[0u8; 3][..pad]);
    }

    fn put_u8(&mut self, attr: u16, val: u8) {
        self.put(attr, &[val]);
    }

    fn put_u16(&mut self, attr: u16, val: u16) {
        self.put(attr, &val.to_be_bytes());
    }

    fn put_u32(&mut self, attr: u16, val: u32) {
        self.put(attr, &val.to_be_bytes());
    }

    fn put_ip_pair(&mut self, attr_v4: u16, attr_v6: u16, pair: IpPair) {
        match pair {
            IpPair::V4 { src, dst } => {
                let mut grp = [0u8; 8];
                grp[..4].copy_from_slice(&src.octets());
                grp[4..].copy_from_slice(&dst.octets());
                self.put(attr_v4, &grp);
            }
            IpPair::V6 { src, dst } => {
                let mut grp = [0u8; 32];
                grp[..16].copy_from_slice(&src.octets());
                grp[16..].copy_from_slice(&dst.octets());
                self.put(attr_v6, &grp);
            }
        }
    }

    fn put_ports(&mut self, attr: u16, ports: PortPair) {
        let mut grp = [0u8; 4];
        grp[..2].copy_from_slice(&ports.sport.to_be_bytes());
        grp[2..].copy_from_slice(&ports.dport.to_be_bytes());
        self.put(attr, &grp);
    }

    fn put_str(&mut self, attr: u16, val: &str) {
        // NUL-terminated on the wire, C-style.
        let mut bytes = val.as_bytes().to_vec();
        bytes.push(0);
        self.put(attr, &bytes);
    }
}

fn finish_frame(
    msg_type: MsgType,
    flags: NetFlags,
    seq: SeqNum,
    bounds: Option<AckBounds>,
    attrs: AttrWriter,
) -> Vec<u8> {
    let hdr_len = if flags.has_ack_hdr() {
        crate::NETHDR_ACK_SIZ
    } else {
        NETHDR_SIZ
    };
    let hdr = NetHdr {
        version: PROTOCOL_VERSION,
        flags,
        msg_type: msg_type as u8,
        len: (hdr_len + attrs.buf.len()) as u16,
        seq,
        bounds,
    };
    let mut out = Vec::with_capacity(hdr.len as usize);
    hdr.write_to(&mut out);
    out.extend_from_slice(&attrs.buf);
    out
}

/// Encodes a pure control frame (ACK/NACK/RESYNC/ALIVE/HELLO).
pub fn encode_ctl(flags: NetFlags, seq: SeqNum, bounds: Option<AckBounds>) -> Vec<u8> {
    finish_frame(MsgType::Ctl, flags, seq, bounds, AttrWriter::new())
}

/// Encodes one flow as a CT_NEW/CT_UPD/CT_DEL frame.
pub fn encode_flow(msg_type: MsgType, flags: NetFlags, seq: SeqNum, flow: &Flow) -> Vec<u8> {
    let mut w = AttrWriter::new();

    if let Some(ip) = flow.orig {
        w.put_ip_pair(CtAttr::Ipv4 as u16, CtAttr::Ipv6 as u16, ip);
    }
    if let Some(L4Info::Ports(ports)) = flow.l4 {
        w.put_ports(CtAttr::Port as u16, ports);
    }
    w.put_u8(CtAttr::L4Proto as u16, flow.proto);
    if let Some(state) = flow.tcp_state {
        w.put_u8(CtAttr::TcpState as u16, state);
    }
    if !flow.status.is_empty() {
        w.put_u32(CtAttr::Status as u16, flow.status.bits());
    }
    if let Some(mark) = flow.mark {
        w.put_u32(CtAttr::Mark as u16, mark);
    }
    if let Some(timeout) = flow.timeout {
        w.put_u32(CtAttr::Timeout as u16, timeout);
    }
    if let Some(master) = flow.master {
        w.put_ip_pair(
            CtAttr::MasterIpv4 as u16,
            CtAttr::MasterIpv6 as u16,
            master.ip,
        );
        w.put_u8(CtAttr::MasterL4Proto as u16, master.proto);
        if let Some(ports) = master.ports {
            w.put_ports(CtAttr::MasterPort as u16, ports);
        }
    }
    if let Some(addr) = flow.snat_ipv4 {
        w.put_u32(CtAttr::SnatIpv4 as u16, u32::from(addr));
    }
    if let Some(addr) = flow.dnat_ipv4 {
        w.put_u32(CtAttr::DnatIpv4 as u16, u32::from(addr));
    }
    if let Some(port) = flow.spat_port {
        w.put_u16(CtAttr::SpatPort as u16, port);
    }
    if let Some(port) = flow.dpat_port {
        w.put_u16(CtAttr::DpatPort as u16, port);
    }
    if let Some(adj) = flow.nat_seq_adj {
        let mut grp = [0u8; 24];
        for (i, val) in [
            adj.orig_correction_pos,
            adj.orig_offset_before,
            adj.orig_offset_after,
            adj.repl_correction_pos,
            adj.repl_offset_before,
            adj.repl_offset_after,
        ]
        .into_iter()
        .enumerate()
        {
            grp[i * 4..i * 4 + 4].copy_from_slice(&val.to_be_bytes());
        }
        w.put(CtAttr::NatSeqAdj as u16, &grp);
    }
    if let Some(state) = flow.sctp_state {
        w.put_u8(CtAttr::SctpState as u16, state);
    }
    if let Some(vtag) = flow.sctp_vtag_orig {
        w.put_u32(CtAttr::SctpVtagOrig as u16, vtag);
    }
    if let Some(vtag) = flow.sctp_vtag_repl {
        w.put_u32(CtAttr::SctpVtagRepl as u16, vtag);
    }
    if let Some(state) = flow.dccp_state {
        w.put_u8(CtAttr::DccpState as u16, state);
    }
    if let Some(role) = flow.dccp_role {
        w.put_u8(CtAttr::DccpRole as u16, role);
    }
    if let Some(L4Info::Icmp { id, typ, code }) = flow.l4 {
        w.put_u8(CtAttr::IcmpType as u16, typ);
        w.put_u8(CtAttr::IcmpCode as u16, code);
        w.put_u16(CtAttr::IcmpId as u16, id);
    }
    if let Some(ws) = flow.tcp_wscale_orig {
        w.put_u8(CtAttr::TcpWscaleOrig as u16, ws);
    }
    if let Some(ws) = flow.tcp_wscale_repl {
        w.put_u8(CtAttr::TcpWscaleRepl as u16, ws);
    }
    if let Some(ref helper) = flow.helper {
        w.put_str(CtAttr::HelperName as u16, helper);
    }

    finish_frame(msg_type, flags, seq, None, w)
}

fn put_tuple(w: &mut AttrWriter, v4: u16, v6: u16, proto_attr: u16, port_attr: u16, t: &Tuple) {
    w.put_ip_pair(v4, v6, t.ip);
    w.put_u8(proto_attr, t.proto);
    if let Some(ports) = t.ports {
        w.put_ports(port_attr, ports);
    }
}

/// Encodes one expectation as an EXP_NEW/EXP_UPD/EXP_DEL frame.
pub fn encode_expectation(
    msg_type: MsgType,
    flags: NetFlags,
    seq: SeqNum,
    exp: &Expectation,
) -> Vec<u8> {
    use ExpAttr::*;
    let mut w = AttrWriter::new();

    put_tuple(
        &mut w,
        MasterIpv4 as u16,
        MasterIpv6 as u16,
        MasterL4Proto as u16,
        MasterPort as u16,
        &exp.master,
    );
    put_tuple(
        &mut w,
        ExpectIpv4 as u16,
        ExpectIpv6 as u16,
        ExpectL4Proto as u16,
        ExpectPort as u16,
        &exp.expected,
    );
    put_tuple(
        &mut w,
        MaskIpv4 as u16,
        MaskIpv6 as u16,
        MaskL4Proto as u16,
        MaskPort as u16,
        &exp.mask,
    );
    if let Some(timeout) = exp.timeout {
        w.put_u32(Timeout as u16, timeout);
    }
    if let Some(val) = exp.flags {
        w.put_u32(Flags as u16, val);
    }
    if let Some(class) = exp.class {
        w.put_u32(Class as u16, class);
    }
    // NAT rewrites are IPv4-only on the wire.
    if let Some(ref nat) = exp.nat {
        if let IpPair::V4 { .. } = nat.ip {
            w.put_ip_pair(NatIpv4 as u16, NatIpv4 as u16, nat.ip);
            w.put_u8(NatL4Proto as u16, nat.proto);
            if let Some(ports) = nat.ports {
                w.put_ports(NatPort as u16, ports);
            }
        }
    }
    if let Some(dir) = exp.nat_dir {
        w.put_u32(NatDir as u16, dir);
    }
    if let Some(ref helper) = exp.helper {
        w.put_str(HelperName as u16, helper);
    }
    if let Some(ref name) = exp.expectfn {
        w.put_str(Fn as u16, name);
    }

    finish_frame(msg_type, flags, seq, None, w)
}

// -------------------------------------------------------------------------
// Decoding
// -------------------------------------------------------------------------

/// One validated TLV view into a payload buffer.
struct RawAttr<'a> {
    id: u16,
    data: &'a [u8],
}

/// Walks TLVs, applying the length checks shared by all payload kinds.
/// `declared` resolves the size class of a known attribute id, or `None`
/// for an id beyond the table (which fails the message).
fn walk_attrs<'a>(
    mut body: &'a [u8],
    declared: impl Fn(u16) -> Option<AttrLen>,
) -> Result<Vec<RawAttr<'a>>, ProtoError> {
    let mut out = Vec::new();
    while body.len() > NTA_HDR_SIZ {
        let id = u16::from_be_bytes([body[0], body[1]]);
        let len = u16::from_be_bytes([body[2], body[3]]) as usize;
        if len < NTA_HDR_SIZ {
            return Err(ProtoError::MalformedPayload("attribute length underflow"));
        }
        if len > body.len() {
            return Err(ProtoError::MalformedPayload("attribute exceeds payload"));
        }
        let Some(size) = declared(id) else {
            return Err(ProtoError::MalformedPayload("attribute id out of range"));
        };
        let payload_len = len - NTA_HDR_SIZ;
        match size {
            AttrLen::Fixed(want) => {
                if payload_len != want {
                    return Err(ProtoError::MalformedPayload("attribute size mismatch"));
                }
            }
            AttrLen::Max(max) => {
                if payload_len > max {
                    return Err(ProtoError::AttrTooLong {
                        attr: id,
                        len: payload_len,
                        max,
                    });
                }
            }
        }
        out.push(RawAttr {
            id,
            data: &body[NTA_HDR_SIZ..len],
        });
        let step = nta_align(len).min(body.len());
        body = &body[step..];
    }
    Ok(out)
}

fn get_u32(data: &[u8]) -> u32 {
    u32::from_be_bytes([data[0], data[1], data[2], data[3]])
}

fn get_u16(data: &[u8]) -> u16 {
    u16::from_be_bytes([data[0], data[1]])
}

fn get_ip4_pair(data: &[u8]) -> IpPair {
    let mut src = [0u8; 4];
    let mut dst = [0u8; 4];
    src.copy_from_slice(&data[..4]);
    dst.copy_from_slice(&data[4..8]);
    IpPair::V4 {
        src: Ipv4Addr::from(src),
        dst: Ipv4Addr::from(dst),
    }
}

fn get_ip6_pair(data: &[u8]) -> IpPair {
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&data[..16]);
    dst.copy_from_slice(&data[16..32]);
    IpPair::V6 {
        src: Ipv6Addr::from(src),
        dst: Ipv6Addr::from(dst),
    }
}

fn get_ports(data: &[u8]) -> PortPair {
    PortPair {
        sport: get_u16(&data[..2]),
        dport: get_u16(&data[2..4]),
    }
}

fn get_str(data: &[u8]) -> Result<String, ProtoError> {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    std::str::from_utf8(&data[..end])
        .map(str::to_owned)
        .map_err(|_| ProtoError::MalformedPayload("string attribute not UTF-8"))
}

/// Decodes the TLV payload of a CT_NEW/CT_UPD/CT_DEL message.
pub fn decode_flow(body: &[u8]) -> Result<Flow, ProtoError> {
    let attrs = walk_attrs(body, |id| CtAttr::from_u16(id).map(CtAttr::declared_len))?;

    let mut flow = Flow::default();
    let mut icmp_id = None;
    let mut icmp_type = None;
    let mut icmp_code = None;
    let mut master_ip = None;
    let mut master_proto = None;
    let mut master_ports = None;

    for attr in attrs {
        let a = CtAttr::from_u16(attr.id).expect("validated by walk_attrs");
        let data = attr.data;
        match a {
            CtAttr::Ipv4 => flow.orig = Some(get_ip4_pair(data)),
            CtAttr::Ipv6 => flow.orig = Some(get_ip6_pair(data)),
            CtAttr::Port => flow.l4 = Some(L4Info::Ports(get_ports(data))),
            CtAttr::L4Proto => flow.proto = data[0],
            CtAttr::TcpState => flow.tcp_state = Some(data[0]),
            CtAttr::Status => flow.status = StatusFlags::from_bits_truncate(get_u32(data)),
            CtAttr::Mark => flow.mark = Some(get_u32(data)),
            CtAttr::Timeout => flow.timeout = Some(get_u32(data)),
            CtAttr::MasterIpv4 => master_ip = Some(get_ip4_pair(data)),
            CtAttr::MasterIpv6 => master_ip = Some(get_ip6_pair(data)),
            CtAttr::MasterL4Proto => master_proto = Some(data[0]),
            CtAttr::MasterPort => master_ports = Some(get_ports(data)),
            CtAttr::SnatIpv4 => flow.snat_ipv4 = Some(Ipv4Addr::from(get_u32(data))),
            CtAttr::DnatIpv4 => flow.dnat_ipv4 = Some(Ipv4Addr::from(get_u32(data))),
            CtAttr::SpatPort => flow.spat_port = Some(get_u16(data)),
            CtAttr::DpatPort => flow.dpat_port = Some(get_u16(data)),
            CtAttr::NatSeqAdj => {
                flow.nat_seq_adj = Some(NatSeqAdj {
                    orig_correction_pos: get_u32(&data[0..]),
                    orig_offset_before: get_u32(&data[4..]),
                    orig_offset_after: get_u32(&data[8..]),
                    repl_correction_pos: get_u32(&data[12..]),
                    repl_offset_before: get_u32(&data[16..]),
                    repl_offset_after: get_u32(&data[20..]),
                })
            }
            CtAttr::SctpState => flow.sctp_state = Some(data[0]),
            CtAttr::SctpVtagOrig => flow.sctp_vtag_orig = Some(get_u32(data)),
            CtAttr::SctpVtagRepl => flow.sctp_vtag_repl = Some(get_u32(data)),
            CtAttr::DccpState => flow.dccp_state = Some(data[0]),
            CtAttr::DccpRole => flow.dccp_role = Some(data[0]),
            CtAttr::IcmpType => icmp_type = Some(data[0]),
            CtAttr::IcmpCode => icmp_code = Some(data[0]),
            CtAttr::IcmpId => icmp_id = Some(get_u16(data)),
            CtAttr::TcpWscaleOrig => flow.tcp_wscale_orig = Some(data[0]),
            CtAttr::TcpWscaleRepl => flow.tcp_wscale_repl = Some(data[0]),
            CtAttr::HelperName => flow.helper = Some(get_str(data)?),
        }
    }

    if let (Some(id), Some(typ), Some(code)) = (icmp_id, icmp_type, icmp_code) {
        flow.l4 = Some(L4Info::Icmp { id, typ, code });
    }
    if let Some(ip) = master_ip {
        flow.master = Some(MasterTuple {
            ip,
            proto: master_proto.unwrap_or(0),
            ports: master_ports,
        });
    }
    Ok(flow)
}

#[derive(Default)]
struct TupleParts {
    ip: Option<IpPair>,
    proto: Option<u8>,
    ports: Option<PortPair>,
}

impl TupleParts {
    fn build(self, what: &'static str) -> Result<Tuple, ProtoError> {
        let Some(ip) = self.ip else {
            return Err(ProtoError::MalformedPayload(what));
        };
        Ok(Tuple {
            ip,
            proto: self.proto.unwrap_or(0),
            ports: self.ports,
        })
    }
}

/// Decodes the TLV payload of an EXP_NEW/EXP_UPD/EXP_DEL message.
pub fn decode_expectation(body: &[u8]) -> Result<Expectation, ProtoError> {
    let attrs = walk_attrs(body, |id| ExpAttr::from_u16(id).map(ExpAttr::declared_len))?;

    let mut master = TupleParts::default();
    let mut expected = TupleParts::default();
    let mut mask = TupleParts::default();
    let mut nat = TupleParts::default();
    let mut timeout = None;
    let mut flags = None;
    let mut class = None;
    let mut nat_dir = None;
    let mut helper = None;
    let mut expectfn = None;

    for attr in attrs {
        let a = ExpAttr::from_u16(attr.id).expect("validated by walk_attrs");
        let data = attr.data;
        match a {
            ExpAttr::MasterIpv4 => master.ip = Some(get_ip4_pair(data)),
            ExpAttr::MasterIpv6 => master.ip = Some(get_ip6_pair(data)),
            ExpAttr::MasterL4Proto => master.proto = Some(data[0]),
            ExpAttr::MasterPort => master.ports = Some(get_ports(data)),
            ExpAttr::ExpectIpv4 => expected.ip = Some(get_ip4_pair(data)),
            ExpAttr::ExpectIpv6 => expected.ip = Some(get_ip6_pair(data)),
            ExpAttr::ExpectL4Proto => expected.proto = Some(data[0]),
            ExpAttr::ExpectPort => expected.ports = Some(get_ports(data)),
            ExpAttr::MaskIpv4 => mask.ip = Some(get_ip4_pair(data)),
            ExpAttr::MaskIpv6 => mask.ip = Some(get_ip6_pair(data)),
            ExpAttr::MaskL4Proto => mask.proto = Some(data[0]),
            ExpAttr::MaskPort => mask.ports = Some(get_ports(data)),
            ExpAttr::Timeout => timeout = Some(get_u32(data)),
            ExpAttr::Flags => flags = Some(get_u32(data)),
            ExpAttr::Class => class = Some(get_u32(data)),
            ExpAttr::NatIpv4 => nat.ip = Some(get_ip4_pair(data)),
            ExpAttr::NatL4Proto => nat.proto = Some(data[0]),
            ExpAttr::NatPort => nat.ports = Some(get_ports(data)),
            ExpAttr::NatDir => nat_dir = Some(get_u32(data)),
            ExpAttr::HelperName => helper = Some(get_str(data)?),
            ExpAttr::Fn => expectfn = Some(get_str(data)?),
        }
    }

    let mut exp = Expectation::new(
        master.build("expectation missing master tuple")?,
        expected.build("expectation missing expected tuple")?,
        mask.build("expectation missing mask tuple")?,
    );
    exp.timeout = timeout;
    exp.flags = flags;
    exp.class = class;
    exp.nat = match nat.ip {
        Some(_) => Some(nat.build("unreachable")?),
        None => None,
    };
    exp.nat_dir = nat_dir;
    exp.helper = helper;
    exp.expectfn = expectfn;
    Ok(exp)
}

/// Decodes the payload of one parsed frame. Control frames yield `None`.
pub fn decode_payload(hdr: &NetHdr, frame: &[u8]) -> Result<Option<Payload>, ProtoError> {
    if !hdr.flags.is_data() {
        return Ok(None);
    }
    let body = &frame[hdr.hdr_len()..hdr.len as usize];
    match hdr.typ() {
        Some(MsgType::CtNew) | Some(MsgType::CtUpd) | Some(MsgType::CtDel) => {
            Ok(Some(Payload::Flow(decode_flow(body)?)))
        }
        Some(MsgType::ExpNew) | Some(MsgType::ExpUpd) | Some(MsgType::ExpDel) => {
            Ok(Some(Payload::Expectation(decode_expectation(body)?)))
        }
        Some(MsgType::Ctl) => Ok(None),
        None => Err(ProtoError::UnknownType(hdr.msg_type)),
    }
}

/// Walks back-to-back frames in one datagram or stream chunk.
///
/// Yields `(header, frame)` pairs where `frame` spans exactly `header.len`
/// bytes. The first framing error ends iteration; messages already yielded
/// remain valid.
pub struct FrameIter<'a> {
    buf: &'a [u8],
    dead: bool,
}

impl<'a> FrameIter<'a> {
    pub fn new(buf: &'a [u8]) -> FrameIter<'a> {
        FrameIter { buf, dead: false }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }
}

impl<'a> Iterator for FrameIter<'a> {
    type Item = Result<(NetHdr, &'a [u8]), ProtoError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.dead || self.buf.is_empty() {
            return None;
        }
        match NetHdr::parse(self.buf) {
            Ok(hdr) => {
                let frame = &self.buf[..hdr.len as usize];
                self.buf = &self.buf[hdr.len as usize..];
                Some(Ok((hdr, frame)))
            }
            Err(err) => {
                self.dead = true;
                Some(Err(err))
            }
        }
    }
}

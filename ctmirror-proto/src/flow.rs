//! Canonical in-memory representation of one conntrack entry.

use bitflags::bitflags;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

bitflags! {
    /// Conntrack status bits relevant to replication.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatusFlags: u32 {
        const EXPECTED      = 1 << 0;
        const SEEN_REPLY    = 1 << 1;
        const ASSURED       = 1 << 2;
        const CONFIRMED     = 1 << 3;
        const SRC_NAT       = 1 << 4;
        const DST_NAT       = 1 << 5;
        const SEQ_ADJUST    = 1 << 6;
        const SRC_NAT_DONE  = 1 << 7;
        const DST_NAT_DONE  = 1 << 8;
        const DYING         = 1 << 9;
        const FIXED_TIMEOUT = 1 << 10;
    }
}

/// Original-direction source/destination addresses. The variant fixes the
/// L3 family of the whole flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpPair {
    V4 { src: Ipv4Addr, dst: Ipv4Addr },
    V6 { src: Ipv6Addr, dst: Ipv6Addr },
}

impl IpPair {
    pub fn src(&self) -> IpAddr {
        match *self {
            IpPair::V4 { src, .. } => IpAddr::V4(src),
            IpPair::V6 { src, .. } => IpAddr::V6(src),
        }
    }

    pub fn dst(&self) -> IpAddr {
        match *self {
            IpPair::V4 { dst, .. } => IpAddr::V4(dst),
            IpPair::V6 { dst, .. } => IpAddr::V6(dst),
        }
    }

    pub fn is_v6(&self) -> bool {
        matches!(self, IpPair::V6 { .. })
    }
}

/// Original-direction source/destination ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PortPair {
    pub sport: u16,
    pub dport: u16,
}

/// Layer-4 identification beyond the protocol number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L4Info {
    Ports(PortPair),
    Icmp { id: u16, typ: u8, code: u8 },
    /// Protocols carrying neither ports nor an ICMP id.
    Bare,
}

/// TCP sequence adjustment deltas for both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NatSeqAdj {
    pub orig_correction_pos: u32,
    pub orig_offset_before: u32,
    pub orig_offset_after: u32,
    pub repl_correction_pos: u32,
    pub repl_offset_before: u32,
    pub repl_offset_after: u32,
}

/// One kernel conntrack entry as replicated between peers.
///
/// The original tuple (`orig`, `proto`, `l4`) identifies the flow; the rest
/// is replicated metadata, present only when the kernel reported it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Flow {
    pub orig: Option<IpPair>,
    pub proto: u8,
    pub l4: Option<L4Info>,
    pub status: StatusFlags,
    pub tcp_state: Option<u8>,
    pub tcp_wscale_orig: Option<u8>,
    pub tcp_wscale_repl: Option<u8>,
    pub sctp_state: Option<u8>,
    pub sctp_vtag_orig: Option<u32>,
    pub sctp_vtag_repl: Option<u32>,
    pub dccp_state: Option<u8>,
    pub dccp_role: Option<u8>,
    pub mark: Option<u32>,
    pub timeout: Option<u32>,
    pub snat_ipv4: Option<Ipv4Addr>,
    pub dnat_ipv4: Option<Ipv4Addr>,
    pub spat_port: Option<u16>,
    pub dpat_port: Option<u16>,
    pub nat_seq_adj: Option<NatSeqAdj>,
    pub helper: Option<String>,
    /// Master flow tuple, set on expected (child) flows.
    pub master: Option<MasterTuple>,
}

/// The tuple of the master flow an expected flow belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MasterTuple {
    pub ip: IpPair,
    pub proto: u8,
    pub ports: Option<PortPair>,
}

/// Fingerprint uniquely identifying a flow within a cache: L3 family,
/// original addresses, L4 protocol and L4 identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub orig: IpPair,
    pub proto: u8,
    pub l4: L4Info,
}

impl Flow {
    /// Builds a minimal TCP flow; the usual constructor in tests.
    pub fn tcp_v4(src: Ipv4Addr, sport: u16, dst: Ipv4Addr, dport: u16) -> Flow {
        Flow {
            orig: Some(IpPair::V4 { src, dst }),
            proto: 6,
            l4: Some(L4Info::Ports(PortPair { sport, dport })),
            ..Flow::default()
        }
    }

    /// The cache fingerprint, or `None` when the original tuple is
    /// incomplete (such flows are unroutable and dropped by callers).
    pub fn key(&self) -> Option<FlowKey> {
        let orig = self.orig?;
        Some(FlowKey {
            orig,
            proto: self.proto,
            l4: self.l4.unwrap_or(L4Info::Bare),
        })
    }

    /// Merges replicated metadata from `other` into `self`, keeping the
    /// original tuple. Fields absent from `other` are left untouched.
    pub fn merge(&mut self, other: &Flow) {
        macro_rules! take {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field.clone();
                }
            };
        }
        if !other.status.is_empty() {
            self.status = other.status;
        }
        take!(tcp_state);
        take!(tcp_wscale_orig);
        take!(tcp_wscale_repl);
        take!(sctp_state);
        take!(sctp_vtag_orig);
        take!(sctp_vtag_repl);
        take!(dccp_state);
        take!(dccp_role);
        take!(mark);
        take!(timeout);
        take!(snat_ipv4);
        take!(dnat_ipv4);
        take!(spat_port);
        take!(dpat_port);
        take!(nat_seq_adj);
        take!(helper);
        take!(master);
    }

    /// Strips attributes that must not be replicated or cached verbatim
    /// (timers are owned by each kernel).
    pub fn strip_volatile(&mut self) {
        self.timeout = None;
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.orig {
            Some(ip) => write!(f, "proto={} src={} dst={}", self.proto, ip.src(), ip.dst())?,
            None => write!(f, "proto={} (no tuple)", self.proto)?,
        }
        match self.l4 {
            Some(L4Info::Ports(p)) => write!(f, " sport={} dport={}", p.sport, p.dport)?,
            Some(L4Info::Icmp { id, typ, code }) => {
                write!(f, " icmp id={} type={} code={}", id, typ, code)?
            }
            _ => {}
        }
        if let Some(st) = self.tcp_state {
            write!(f, " tcp-state={}", st)?;
        }
        if let Some(mark) = self.mark {
            write!(f, " mark={}", mark)?;
        }
        if let Some(ref helper) = self.helper {
            write!(f, " helper={}", helper)?;
        }
        Ok(())
    }
}

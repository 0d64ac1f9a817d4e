//! Transport channels for the sync stream.
//!
//! One trait, three transports: UDP multicast, TCP with reconnection, and
//! TIPC datagrams. Channels are non-blocking; "no data" is a normal recv
//! outcome, and any errno other than `EAGAIN` bumps the error counter.

mod mcast;
mod tcp;
mod tipc;

pub use mcast::McastChannel;
pub use tcp::TcpChannel;
pub use tipc::TipcChannel;

use crate::config::ChannelConfig;
use crate::error::TransportError;
use std::fmt::Write as _;
use std::os::unix::io::RawFd;
use std::time::Instant;

/// Per-channel traffic counters, updated on every I/O call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelStats {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub msgs_sent: u64,
    pub msgs_recv: u64,
    pub errors: u64,
}

impl ChannelStats {
    pub fn render(&self, kind: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{} traffic:", kind);
        let _ = writeln!(
            out,
            "{:20} Bytes sent {:20} Bytes recv",
            self.bytes_sent, self.bytes_recv
        );
        let _ = writeln!(
            out,
            "{:20} Pckts sent {:20} Pckts recv",
            self.msgs_sent, self.msgs_recv
        );
        let _ = writeln!(out, "{:20} Errors", self.errors);
        out
    }
}

/// Housekeeping outcome reported by [`Channel::maintain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintainEvent {
    Idle,
    /// The transport dropped and is connected again; pending retransmits
    /// are stale and the peer needs a resync.
    Reconnected,
}

/// Uniform send/recv surface over the concrete transports.
pub trait Channel {
    fn kind(&self) -> &'static str;

    /// Sends one sync message (or stream chunk).
    fn send(&mut self, buf: &[u8]) -> Result<usize, TransportError>;

    /// Receives into `buf`; `Ok(None)` means no data was ready.
    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TransportError>;

    /// File descriptors the event loop must watch for readability.
    fn fds(&self) -> Vec<RawFd>;

    /// True when one of this channel's fds is in the ready set.
    fn isset(&self, ready: &[RawFd]) -> bool {
        self.fds().iter().any(|fd| ready.contains(fd))
    }

    /// Byte streams need receiver-side reframing; datagram transports
    /// preserve message boundaries.
    fn is_stream(&self) -> bool {
        false
    }

    /// Periodic housekeeping (reconnects, backoff).
    fn maintain(&mut self, _now: Instant) -> MaintainEvent {
        MaintainEvent::Idle
    }

    fn stats(&self) -> ChannelStats;
}

/// Opens the configured transport.
pub fn open(conf: &ChannelConfig) -> Result<Box<dyn Channel>, TransportError> {
    match conf {
        ChannelConfig::Multicast(c) => Ok(Box::new(McastChannel::open(c)?)),
        ChannelConfig::Tcp(c) => Ok(Box::new(TcpChannel::open(c)?)),
        ChannelConfig::Tipc(c) => Ok(Box::new(TipcChannel::open(c)?)),
    }
}

/// Largest sync datagram we ever emit or accept in one unit.
pub const MAX_DGRAM: usize = 60000;

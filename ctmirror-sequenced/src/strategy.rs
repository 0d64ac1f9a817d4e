//! Synchronization strategies.
//!
//! A strategy is a pure state machine fed with parsed headers. It never
//! touches a socket: every decision comes back as an [`Action`] for the
//! event loop to execute. Data messages themselves are always applied to
//! the external cache (application is idempotent); the strategy only
//! governs acknowledgment, retransmission and resync traffic.

use crate::rtqueue::RetransmitQueue;
use crate::tracker::{RecvTracker, SeqClass};
use ctmirror_proto::{AckBounds, NetFlags, NetHdr, SeqNum};
use tracing::{debug, warn};

/// I/O the caller must perform after feeding a strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Emit a pure control frame with these flags and optional bounds.
    SendCtl {
        flags: NetFlags,
        bounds: Option<AckBounds>,
    },
    /// Retransmit a stored frame verbatim (sequence number preserved).
    SendFrame(Vec<u8>),
    /// Walk the internal cache and re-send every entry as CT_NEW/EXP_NEW.
    ReplayCache,
}

/// Which strategy a channel runs; selected at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    NoTrack,
    Alarm,
    FtFw,
}

/// The common strategy surface. One instance serves both directions of a
/// channel: `on_sent` is the sender half, `on_data`/`on_ctl` the receiver
/// half, `on_tick` the periodic alarm.
pub trait SyncStrategy {
    fn kind(&self) -> StrategyKind;

    /// A data frame with this sequence was just transmitted.
    fn on_sent(&mut self, seq: SeqNum, frame: &[u8]);

    /// An inbound data header was accepted by the codec.
    fn on_data(&mut self, hdr: &NetHdr) -> Vec<Action>;

    /// An inbound control frame.
    fn on_ctl(&mut self, hdr: &NetHdr) -> Vec<Action>;

    /// Periodic tick driven by the alarm scheduler.
    fn on_tick(&mut self) -> Vec<Action>;

    /// The transport dropped and came back (TCP reconnect).
    fn on_link_reset(&mut self) -> Vec<Action>;

    /// Pending retransmit entries (0 for strategies without a queue).
    fn queue_len(&self) -> usize {
        0
    }
}

fn ack_ctl(from: SeqNum, to: SeqNum) -> Action {
    Action::SendCtl {
        flags: NetFlags::ACK | NetFlags::ALIVE,
        bounds: Some(AckBounds { from, to }),
    }
}

fn resync_ctl() -> Action {
    Action::SendCtl {
        flags: NetFlags::RESYNC,
        bounds: None,
    }
}

// -------------------------------------------------------------------------
// no-track
// -------------------------------------------------------------------------

/// Fire-and-forget: no queue, no control traffic. Appropriate when the
/// channel is lossless or loss is tolerable.
#[derive(Debug, Default)]
pub struct NoTrack;

impl SyncStrategy for NoTrack {
    fn kind(&self) -> StrategyKind {
        StrategyKind::NoTrack
    }

    fn on_sent(&mut self, _seq: SeqNum, _frame: &[u8]) {}

    fn on_data(&mut self, _hdr: &NetHdr) -> Vec<Action> {
        Vec::new()
    }

    fn on_ctl(&mut self, hdr: &NetHdr) -> Vec<Action> {
        // Even fire-and-forget peers honor an explicit replay request.
        if hdr.flags.contains(NetFlags::RESYNC) {
            return vec![Action::ReplayCache];
        }
        Vec::new()
    }

    fn on_tick(&mut self) -> Vec<Action> {
        Vec::new()
    }

    fn on_link_reset(&mut self) -> Vec<Action> {
        Vec::new()
    }
}

// -------------------------------------------------------------------------
// alarm
// -------------------------------------------------------------------------

/// Batched acknowledgment: the receiver records the span of accepted
/// sequences and acknowledges it wholesale at every tick. The sender keeps
/// a bounded retransmit queue pruned by those ACKs.
#[derive(Debug)]
pub struct AlarmStrategy {
    queue: RetransmitQueue,
    tracker: RecvTracker,
}

impl AlarmStrategy {
    pub fn new(window: usize) -> AlarmStrategy {
        AlarmStrategy {
            queue: RetransmitQueue::new(window),
            tracker: RecvTracker::new(),
        }
    }
}

impl SyncStrategy for AlarmStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Alarm
    }

    fn on_sent(&mut self, seq: SeqNum, frame: &[u8]) {
        self.queue.push(seq, frame.to_vec());
    }

    fn on_data(&mut self, hdr: &NetHdr) -> Vec<Action> {
        self.tracker.classify(hdr.seq);
        Vec::new()
    }

    fn on_ctl(&mut self, hdr: &NetHdr) -> Vec<Action> {
        let mut actions = Vec::new();
        if hdr.flags.contains(NetFlags::ACK) {
            if let Some(bounds) = hdr.bounds {
                self.queue.ack(bounds.to);
            }
        }
        if hdr.flags.contains(NetFlags::RESYNC) {
            self.tracker.reset();
            actions.push(Action::ReplayCache);
        }
        actions
    }

    fn on_tick(&mut self) -> Vec<Action> {
        match self.tracker.take_ack() {
            Some((from, to)) => vec![ack_ctl(from, to)],
            None => Vec::new(),
        }
    }

    fn on_link_reset(&mut self) -> Vec<Action> {
        self.queue.clear();
        self.tracker.reset();
        vec![resync_ctl(), Action::ReplayCache]
    }

    fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

// -------------------------------------------------------------------------
// ft-fw
// -------------------------------------------------------------------------

/// Negative-acknowledgment recovery: a gap in the inbound sequence space is
/// NACKed immediately and served from the sender's queue; a pruned range
/// degrades to a full resync. In-order traffic is acknowledged every
/// `ack_window` messages and on ticks.
#[derive(Debug)]
pub struct FtFw {
    queue: RetransmitQueue,
    tracker: RecvTracker,
    ack_window: u32,
    since_ack: u32,
}

impl FtFw {
    pub fn new(window: usize, ack_window: u32) -> FtFw {
        FtFw {
            queue: RetransmitQueue::new(window),
            tracker: RecvTracker::new(),
            ack_window: ack_window.max(1),
            since_ack: 0,
        }
    }
}

impl SyncStrategy for FtFw {
    fn kind(&self) -> StrategyKind {
        StrategyKind::FtFw
    }

    fn on_sent(&mut self, seq: SeqNum, frame: &[u8]) {
        self.queue.push(seq, frame.to_vec());
    }

    fn on_data(&mut self, hdr: &NetHdr) -> Vec<Action> {
        let mut actions = Vec::new();
        match self.tracker.classify(hdr.seq) {
            SeqClass::InOrder => {
                self.since_ack += 1;
                if self.since_ack >= self.ack_window {
                    if let Some((from, to)) = self.tracker.take_ack() {
                        actions.push(ack_ctl(from, to));
                    }
                    self.since_ack = 0;
                }
            }
            SeqClass::Old => {}
            SeqClass::Gap { from, to } => {
                debug!(from = from.0, to = to.0, "sequence hole, requesting NACK");
                actions.push(Action::SendCtl {
                    flags: NetFlags::NACK,
                    bounds: Some(AckBounds { from, to }),
                });
            }
        }
        actions
    }

    fn on_ctl(&mut self, hdr: &NetHdr) -> Vec<Action> {
        let mut actions = Vec::new();
        if hdr.flags.contains(NetFlags::ACK) {
            if let Some(bounds) = hdr.bounds {
                self.queue.ack(bounds.to);
            }
        }
        if hdr.flags.contains(NetFlags::NACK) {
            if let Some(bounds) = hdr.bounds {
                match self.queue.range(bounds.from, bounds.to) {
                    Some(frames) => {
                        actions.extend(frames.into_iter().map(Action::SendFrame));
                    }
                    None => {
                        // The requested range fell off the window; deltas
                        // can no longer heal this peer.
                        warn!(
                            from = bounds.from.0,
                            to = bounds.to.0,
                            "NACKed range pruned, forcing full resync"
                        );
                        actions.push(resync_ctl());
                        actions.push(Action::ReplayCache);
                    }
                }
            }
        }
        if hdr.flags.contains(NetFlags::RESYNC) {
            self.tracker.reset();
            actions.push(Action::ReplayCache);
        }
        actions
    }

    fn on_tick(&mut self) -> Vec<Action> {
        self.since_ack = 0;
        // Holes that were NACKed but never served are requested again
        // until a retransmit fills them or a resync resets the window.
        let mut actions: Vec<Action> = self
            .tracker
            .outstanding_gaps()
            .iter()
            .map(|&(from, to)| Action::SendCtl {
                flags: NetFlags::NACK,
                bounds: Some(AckBounds { from, to }),
            })
            .collect();
        if let Some((from, to)) = self.tracker.take_ack() {
            actions.push(ack_ctl(from, to));
        }
        actions
    }

    fn on_link_reset(&mut self) -> Vec<Action> {
        self.queue.clear();
        self.tracker.reset();
        self.since_ack = 0;
        vec![resync_ctl(), Action::ReplayCache]
    }

    fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

/// Builds the configured strategy with the given retransmit and ACK
/// windows.
pub fn build(kind: StrategyKind, window: usize, ack_window: u32) -> Box<dyn SyncStrategy> {
    match kind {
        StrategyKind::NoTrack => Box::new(NoTrack),
        StrategyKind::Alarm => Box::new(AlarmStrategy::new(window)),
        StrategyKind::FtFw => Box::new(FtFw::new(window, ack_window)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_hdr(seq: u32) -> NetHdr {
        NetHdr {
            version: ctmirror_proto::PROTOCOL_VERSION,
            flags: NetFlags::empty(),
            msg_type: 0,
            len: 10,
            seq: SeqNum(seq),
            bounds: None,
        }
    }

    fn ctl_hdr(flags: NetFlags, from: u32, to: u32) -> NetHdr {
        NetHdr {
            version: ctmirror_proto::PROTOCOL_VERSION,
            flags,
            msg_type: 10,
            len: 18,
            seq: SeqNum(0),
            bounds: Some(AckBounds {
                from: SeqNum(from),
                to: SeqNum(to),
            }),
        }
    }

    #[test]
    fn ftfw_nacks_the_hole_and_sender_serves_it() {
        let mut receiver = FtFw::new(8, 64);
        let mut sender = FtFw::new(8, 64);

        sender.on_sent(SeqNum(7), b"frame-7");
        sender.on_sent(SeqNum(8), b"frame-8");
        sender.on_sent(SeqNum(9), b"frame-9");

        assert!(receiver.on_data(&data_hdr(7)).is_empty());
        // seq 8 lost; 9 arrives.
        let actions = receiver.on_data(&data_hdr(9));
        assert_eq!(
            actions,
            vec![Action::SendCtl {
                flags: NetFlags::NACK,
                bounds: Some(AckBounds {
                    from: SeqNum(8),
                    to: SeqNum(8)
                }),
            }]
        );

        let served = sender.on_ctl(&ctl_hdr(NetFlags::NACK, 8, 8));
        assert_eq!(served, vec![Action::SendFrame(b"frame-8".to_vec())]);
    }

    #[test]
    fn ftfw_pruned_nack_degrades_to_resync() {
        let mut sender = FtFw::new(2, 64);
        for n in 10..=15 {
            sender.on_sent(SeqNum(n), &[n as u8]);
        }
        let actions = sender.on_ctl(&ctl_hdr(NetFlags::NACK, 10, 11));
        assert_eq!(actions, vec![resync_ctl(), Action::ReplayCache]);
    }

    #[test]
    fn ack_prunes_the_send_window() {
        let mut sender = FtFw::new(4, 64);
        for n in 10..=15 {
            sender.on_sent(SeqNum(n), &[n as u8]);
        }
        // Window of 4 kept 12..=15; cumulative ACK up to 12 leaves 13..=15.
        assert_eq!(sender.queue_len(), 4);
        sender.on_ctl(&ctl_hdr(NetFlags::ACK, 0, 12));
        assert_eq!(sender.queue_len(), 3);
    }

    #[test]
    fn alarm_acks_the_accepted_span_on_tick() {
        let mut receiver = AlarmStrategy::new(8);
        for n in 3..=5 {
            receiver.on_data(&data_hdr(n));
        }
        let actions = receiver.on_tick();
        assert_eq!(actions, vec![ack_ctl(SeqNum(3), SeqNum(5))]);
        // Nothing new, nothing to ack.
        assert!(receiver.on_tick().is_empty());
    }

    #[test]
    fn resync_request_triggers_cache_replay() {
        let mut peer = FtFw::new(8, 64);
        let hdr = NetHdr {
            bounds: None,
            len: 18,
            ..ctl_hdr(NetFlags::RESYNC, 0, 0)
        };
        assert_eq!(peer.on_ctl(&hdr), vec![Action::ReplayCache]);
    }

    #[test]
    fn link_reset_drops_retransmits_and_forces_resync() {
        let mut peer = FtFw::new(8, 64);
        peer.on_sent(SeqNum(1), b"x");
        let actions = peer.on_link_reset();
        assert_eq!(peer.queue_len(), 0);
        assert!(actions.contains(&resync_ctl()));
        assert!(actions.contains(&Action::ReplayCache));
    }

    #[test]
    fn ftfw_acks_after_a_full_ack_window() {
        let mut receiver = FtFw::new(8, 3);
        assert!(receiver.on_data(&data_hdr(1)).is_empty());
        assert!(receiver.on_data(&data_hdr(2)).is_empty());
        let actions = receiver.on_data(&data_hdr(3));
        assert_eq!(actions, vec![ack_ctl(SeqNum(1), SeqNum(3))]);
    }
}

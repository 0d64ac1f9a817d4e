//! Receiver-side sequence tracking.

use ctmirror_proto::SeqNum;

/// Classification of one inbound data sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqClass {
    /// The next expected sequence (or the first ever seen).
    InOrder,
    /// At or before something already accepted: a duplicate, a stale
    /// retransmit, or a gap being filled.
    Old,
    /// Sequences `[from, to]` were skipped. The carrying message itself is
    /// still applied; the hole is what needs recovery.
    Gap { from: SeqNum, to: SeqNum },
}

/// Tracks the receive window of a single remote sender.
///
/// Acknowledgments are cumulative, so the pending ACK span never reaches
/// past the first outstanding hole; holes are recorded until a retransmit
/// fills them or the window is reset by a resync.
#[derive(Debug, Default)]
pub struct RecvTracker {
    /// One past the highest sequence accepted, once traffic has arrived.
    next: Option<SeqNum>,
    /// Lower bound of the not-yet-acknowledged span.
    ack_from: Option<SeqNum>,
    /// Outstanding holes, oldest first, inclusive bounds.
    gaps: Vec<(SeqNum, SeqNum)>,
}

impl RecvTracker {
    pub fn new() -> RecvTracker {
        RecvTracker::default()
    }

    /// Classifies `seq` and advances the window.
    pub fn classify(&mut self, seq: SeqNum) -> SeqClass {
        match self.next {
            None => {
                self.next = Some(seq.next());
                self.ack_from = Some(seq);
                SeqClass::InOrder
            }
            Some(next) => {
                if seq == next {
                    self.next = Some(seq.next());
                    SeqClass::InOrder
                } else if seq.before(next) {
                    self.fill(seq);
                    SeqClass::Old
                } else {
                    let gap = (next, seq.prev());
                    self.gaps.push(gap);
                    self.next = Some(seq.next());
                    SeqClass::Gap {
                        from: gap.0,
                        to: gap.1,
                    }
                }
            }
        }
    }

    /// Shrinks or splits whichever hole contains a late arrival.
    fn fill(&mut self, seq: SeqNum) {
        let Some(pos) = self
            .gaps
            .iter()
            .position(|&(from, to)| !seq.before(from) && !to.before(seq))
        else {
            return;
        };
        let (from, to) = self.gaps.remove(pos);
        if seq != from {
            self.gaps.insert(pos, (from, seq.prev()));
        }
        if seq != to {
            let at = if seq == from { pos } else { pos + 1 };
            self.gaps.insert(at, (seq.next(), to));
        }
    }

    /// Holes still waiting for retransmission.
    pub fn outstanding_gaps(&self) -> &[(SeqNum, SeqNum)] {
        &self.gaps
    }

    /// Takes the pending cumulative-ACK span: from the oldest unacked
    /// sequence up to just before the first outstanding hole.
    pub fn take_ack(&mut self) -> Option<(SeqNum, SeqNum)> {
        let from = self.ack_from?;
        let hi = match self.gaps.first() {
            Some(&(gap_from, _)) => gap_from.prev(),
            None => self.next?.prev(),
        };
        if hi.before(from) {
            return None;
        }
        self.ack_from = Some(hi.next());
        Some((from, hi))
    }

    /// Forgets the window, e.g. when the peer announces a full replay.
    pub fn reset(&mut self) {
        self.next = None;
        self.ack_from = None;
        self.gaps.clear();
    }
}

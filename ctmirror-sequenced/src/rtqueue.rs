//! Sender-side retransmit queue.

use ctmirror_proto::SeqNum;
use std::collections::VecDeque;

/// An ordered sequence of (seq, serialized frame) entries bounded by a
/// configurable window. When the window overflows, the oldest entry is
/// evicted; a NACK for an evicted sequence can then only be answered with a
/// full resync.
#[derive(Debug)]
pub struct RetransmitQueue {
    entries: VecDeque<(SeqNum, Vec<u8>)>,
    window: usize,
    evicted: u64,
}

impl RetransmitQueue {
    pub fn new(window: usize) -> RetransmitQueue {
        RetransmitQueue {
            entries: VecDeque::with_capacity(window.min(1024)),
            window,
            evicted: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total entries dropped by window overflow since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Appends a sent frame, evicting FIFO when the window is full.
    pub fn push(&mut self, seq: SeqNum, frame: Vec<u8>) {
        if self.entries.len() >= self.window {
            self.entries.pop_front();
            self.evicted += 1;
        }
        self.entries.push_back((seq, frame));
    }

    /// Drops every entry acknowledged by the inclusive range `[from, to]`.
    /// Sequences at or before `to` are covered (cumulative ACK).
    pub fn ack(&mut self, to: SeqNum) {
        self.entries.retain(|(seq, _)| seq.after(to));
    }

    /// Clones the frames stored for the inclusive range `[from, to]`, or
    /// `None` when any requested sequence has been pruned.
    pub fn range(&self, from: SeqNum, to: SeqNum) -> Option<Vec<Vec<u8>>> {
        let mut want = from;
        let mut out = Vec::new();
        loop {
            let frame = self
                .entries
                .iter()
                .find(|(seq, _)| *seq == want)
                .map(|(_, frame)| frame.clone())?;
            out.push(frame);
            if want == to {
                return Some(out);
            }
            want = want.next();
        }
    }

    /// Drops all pending entries (transport reset).
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub(crate) fn seqs(&self) -> Vec<u32> {
        self.entries.iter().map(|(seq, _)| seq.0).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: u32) -> Vec<u8> {
        vec![n as u8]
    }

    #[test]
    fn window_overflow_evicts_fifo() {
        let mut queue = RetransmitQueue::new(4);
        for n in 10..=15 {
            queue.push(SeqNum(n), frame(n));
        }
        assert_eq!(queue.seqs(), vec![12, 13, 14, 15]);
        assert_eq!(queue.evicted(), 2);
    }

    #[test]
    fn cumulative_ack_prunes_covered_entries() {
        let mut queue = RetransmitQueue::new(4);
        for n in 10..=15 {
            queue.push(SeqNum(n), frame(n));
        }
        queue.ack(SeqNum(12));
        assert_eq!(queue.seqs(), vec![13, 14, 15]);
    }

    #[test]
    fn range_returns_none_once_pruned() {
        let mut queue = RetransmitQueue::new(2);
        queue.push(SeqNum(1), frame(1));
        queue.push(SeqNum(2), frame(2));
        queue.push(SeqNum(3), frame(3)); // evicts 1

        assert!(queue.range(SeqNum(1), SeqNum(2)).is_none());
        let got = queue.range(SeqNum(2), SeqNum(3)).unwrap();
        assert_eq!(got, vec![frame(2), frame(3)]);
    }

    #[test]
    fn ack_handles_sequence_wrap() {
        let mut queue = RetransmitQueue::new(8);
        queue.push(SeqNum(u32::MAX - 1), frame(1));
        queue.push(SeqNum(u32::MAX), frame(2));
        queue.push(SeqNum(0), frame(3));
        queue.push(SeqNum(1), frame(4));

        queue.ack(SeqNum(0));
        assert_eq!(queue.seqs(), vec![1]);
    }
}

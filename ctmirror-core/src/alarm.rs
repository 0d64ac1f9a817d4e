//! Deadline scheduler for deferred work.
//!
//! Alarms carry an opaque payload token instead of a callback: firing
//! returns the tokens and the event loop dispatches them, so no alarm ever
//! holds a reference back into the state it wakes up. Re-adding a pending
//! alarm reschedules it; equal deadlines fire in insertion order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

/// Handle to one registered alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlarmId(u64);

#[derive(Debug)]
struct Entry<T> {
    payload: T,
    /// Set while armed: deadline plus the generation of the arming.
    armed: Option<(Instant, u64)>,
}

/// Min-heap of pending alarms keyed by absolute deadline.
#[derive(Debug)]
pub struct AlarmScheduler<T> {
    entries: HashMap<u64, Entry<T>>,
    // (deadline, insertion tick, id, generation); stale generations are
    // skipped lazily on pop.
    heap: BinaryHeap<Reverse<(Instant, u64, u64, u64)>>,
    next_id: u64,
    tick: u64,
}

impl<T: Clone> AlarmScheduler<T> {
    pub fn new() -> AlarmScheduler<T> {
        AlarmScheduler {
            entries: HashMap::new(),
            heap: BinaryHeap::new(),
            next_id: 0,
            tick: 0,
        }
    }

    /// Registers an alarm without arming it.
    pub fn register(&mut self, payload: T) -> AlarmId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            Entry {
                payload,
                armed: None,
            },
        );
        AlarmId(id)
    }

    /// Arms (or re-arms) an alarm for an absolute deadline.
    pub fn schedule_at(&mut self, id: AlarmId, deadline: Instant) {
        let Some(entry) = self.entries.get_mut(&id.0) else {
            return;
        };
        self.tick += 1;
        entry.armed = Some((deadline, self.tick));
        self.heap.push(Reverse((deadline, self.tick, id.0, self.tick)));
    }

    /// Arms an alarm `delay` from `now`.
    pub fn schedule_in(&mut self, id: AlarmId, now: Instant, delay: Duration) {
        self.schedule_at(id, now + delay);
    }

    /// Disarms without unregistering.
    pub fn cancel(&mut self, id: AlarmId) {
        if let Some(entry) = self.entries.get_mut(&id.0) {
            entry.armed = None;
        }
    }

    /// Drops the registration entirely.
    pub fn remove(&mut self, id: AlarmId) {
        self.entries.remove(&id.0);
    }

    pub fn pending(&self, id: AlarmId) -> bool {
        self.entries
            .get(&id.0)
            .map(|e| e.armed.is_some())
            .unwrap_or(false)
    }

    /// Deadline of an armed alarm, for dump annotations.
    pub fn deadline(&self, id: AlarmId) -> Option<Instant> {
        self.entries.get(&id.0)?.armed.map(|(deadline, _)| deadline)
    }

    /// Earliest live deadline; the event loop bounds its I/O wait with
    /// `next_deadline - now` clamped to zero.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, _, id, gen))) = self.heap.peek().copied() {
            if self.is_live(id, deadline, gen) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    fn is_live(&self, id: u64, deadline: Instant, gen: u64) -> bool {
        matches!(
            self.entries.get(&id),
            Some(Entry {
                armed: Some((armed_deadline, armed_gen)),
                ..
            }) if *armed_deadline == deadline && *armed_gen == gen
        )
    }

    /// Fires every alarm with deadline at or before `now`, in deadline then
    /// insertion order. Each alarm is disarmed before its token is
    /// returned, so handlers may re-arm freely.
    pub fn run_pending(&mut self, now: Instant) -> Vec<(AlarmId, T)> {
        let mut fired = Vec::new();
        while let Some(Reverse((deadline, _, id, gen))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if !self.is_live(id, deadline, gen) {
                continue;
            }
            let entry = self.entries.get_mut(&id).expect("checked by is_live");
            entry.armed = None;
            fired.push((AlarmId(id), entry.payload.clone()));
        }
        fired
    }
}

impl<T: Clone> Default for AlarmScheduler<T> {
    fn default() -> Self {
        AlarmScheduler::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_then_insertion_order() {
        let now = Instant::now();
        let mut sched = AlarmScheduler::new();
        let a = sched.register("a");
        let b = sched.register("b");
        let c = sched.register("c");
        sched.schedule_in(a, now, Duration::from_secs(2));
        sched.schedule_in(b, now, Duration::from_secs(1));
        sched.schedule_in(c, now, Duration::from_secs(1));

        let fired = sched.run_pending(now + Duration::from_secs(3));
        let tokens: Vec<_> = fired.iter().map(|(_, t)| *t).collect();
        assert_eq!(tokens, vec!["b", "c", "a"]);
    }

    #[test]
    fn rearming_moves_the_deadline() {
        let now = Instant::now();
        let mut sched = AlarmScheduler::new();
        let a = sched.register(1);
        sched.schedule_in(a, now, Duration::from_secs(1));
        sched.schedule_in(a, now, Duration::from_secs(10));

        assert!(sched.run_pending(now + Duration::from_secs(5)).is_empty());
        assert!(sched.pending(a));
        let fired = sched.run_pending(now + Duration::from_secs(11));
        assert_eq!(fired.len(), 1);
        assert!(!sched.pending(a));
    }

    #[test]
    fn cancel_prevents_firing() {
        let now = Instant::now();
        let mut sched = AlarmScheduler::new();
        let a = sched.register(1);
        sched.schedule_in(a, now, Duration::from_secs(1));
        sched.cancel(a);
        assert!(!sched.pending(a));
        assert!(sched.run_pending(now + Duration::from_secs(2)).is_empty());
    }

    #[test]
    fn next_deadline_skips_stale_heap_entries() {
        let now = Instant::now();
        let mut sched = AlarmScheduler::new();
        let a = sched.register(1);
        let b = sched.register(2);
        sched.schedule_in(a, now, Duration::from_secs(1));
        sched.schedule_in(b, now, Duration::from_secs(5));
        sched.cancel(a);

        assert_eq!(sched.next_deadline(), Some(now + Duration::from_secs(5)));
    }

    #[test]
    fn handlers_may_rearm_themselves() {
        let now = Instant::now();
        let mut sched = AlarmScheduler::new();
        let a = sched.register(());
        sched.schedule_in(a, now, Duration::from_secs(1));

        let fired = sched.run_pending(now + Duration::from_secs(1));
        assert_eq!(fired.len(), 1);
        sched.schedule_in(a, now + Duration::from_secs(1), Duration::from_secs(1));
        assert!(sched.pending(a));
        assert_eq!(
            sched.run_pending(now + Duration::from_secs(2)).len(),
            1
        );
    }
}

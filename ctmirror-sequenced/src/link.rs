//! Link liveness: the HELLO / HELLO-BACK handshake.

use std::time::{Duration, Instant};

/// What the caller must do after feeding the link state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Send a HELLO control frame.
    SendHello,
    /// Answer the peer's first HELLO.
    SendHelloBack,
    /// Both sides are up; replay the internal cache under a RESYNC flag.
    Established,
}

/// Per-channel liveness state.
///
/// A sender idle for longer than the hello interval probes with HELLO; the
/// first HELLO a peer sees is answered with HELLO-BACK, after which both
/// sides consider the link established and trigger a full resync.
#[derive(Debug)]
pub struct LinkState {
    hello_interval: Duration,
    last_tx: Instant,
    established: bool,
    hello_seen: bool,
}

impl LinkState {
    pub fn new(hello_interval: Duration, now: Instant) -> LinkState {
        LinkState {
            hello_interval,
            last_tx: now,
            established: false,
            hello_seen: false,
        }
    }

    pub fn is_established(&self) -> bool {
        self.established
    }

    /// Any outbound traffic refreshes the idle timer.
    pub fn on_tx(&mut self, now: Instant) {
        self.last_tx = now;
    }

    /// Called periodically; emits HELLO when the sender has been idle.
    pub fn tick(&mut self, now: Instant) -> Option<LinkEvent> {
        if now.duration_since(self.last_tx) > self.hello_interval {
            self.last_tx = now;
            return Some(LinkEvent::SendHello);
        }
        None
    }

    /// Feeds inbound HELLO/HELLO-BACK flags.
    pub fn on_hello(&mut self) -> Vec<LinkEvent> {
        let mut events = vec![LinkEvent::SendHelloBack];
        if !self.hello_seen {
            self.hello_seen = true;
            if !self.established {
                self.established = true;
                events.push(LinkEvent::Established);
            }
        }
        events
    }

    pub fn on_hello_back(&mut self) -> Vec<LinkEvent> {
        if !self.established {
            self.established = true;
            return vec![LinkEvent::Established];
        }
        Vec::new()
    }

    /// Transport went away; the next handshake re-establishes.
    pub fn reset(&mut self, now: Instant) {
        self.established = false;
        self.hello_seen = false;
        self.last_tx = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_sender_probes_with_hello() {
        let start = Instant::now();
        let mut link = LinkState::new(Duration::from_secs(5), start);
        assert_eq!(link.tick(start + Duration::from_secs(1)), None);
        assert_eq!(
            link.tick(start + Duration::from_secs(6)),
            Some(LinkEvent::SendHello)
        );
        // Probe refreshed the timer.
        assert_eq!(link.tick(start + Duration::from_secs(7)), None);
    }

    #[test]
    fn first_hello_establishes_and_answers() {
        let mut link = LinkState::new(Duration::from_secs(5), Instant::now());
        let events = link.on_hello();
        assert_eq!(
            events,
            vec![LinkEvent::SendHelloBack, LinkEvent::Established]
        );
        // Subsequent HELLOs are answered without re-establishing.
        assert_eq!(link.on_hello(), vec![LinkEvent::SendHelloBack]);
    }

    #[test]
    fn hello_back_establishes_the_probing_side() {
        let mut link = LinkState::new(Duration::from_secs(5), Instant::now());
        assert_eq!(link.on_hello_back(), vec![LinkEvent::Established]);
        assert!(link.is_established());
        assert_eq!(link.on_hello_back(), vec![]);
    }
}

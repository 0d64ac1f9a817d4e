//! The sync engine: event stream in, wire frames out, replica maintained.
//!
//! Owns the internal cache (locally owned flows), the external cache (the
//! peer's replica), the reliability strategy and the link handshake. All
//! I/O is delegated: methods append ready-to-send frames to the caller's
//! output queue.

use crate::cache::Cache;
use crate::error::CoreError;
use crate::source::{CtEvent, KernelSource};
use ctmirror_proto::codec::{self, Payload};
use ctmirror_proto::expect::Expectation;
use ctmirror_proto::flow::Flow;
use ctmirror_proto::{MsgType, NetFlags, NetHdr, SeqNum, PROTOCOL_VERSION};
use ctmirror_sequenced::{self as sequenced, Action, LinkEvent, LinkState, StrategyKind, SyncStrategy};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Per-engine protocol counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncStats {
    /// Messages from peers speaking an older protocol version.
    pub version_old: u64,
    /// Messages dropped for malformed payloads.
    pub malformed: u64,
    /// Data messages applied to the external caches.
    pub delivered: u64,
    /// Messages with an unknown type octet.
    pub unknown_type: u64,
}

pub struct SyncEngine {
    pub internal: Cache<Flow>,
    pub external: Cache<Flow>,
    pub internal_exp: Cache<Expectation>,
    pub external_exp: Cache<Expectation>,
    strategy: Box<dyn SyncStrategy>,
    link: LinkState,
    next_seq: SeqNum,
    stats: SyncStats,
}

impl SyncEngine {
    pub fn new(
        kind: StrategyKind,
        resend_window: usize,
        ack_window: u32,
        hello_interval: Duration,
        now: Instant,
    ) -> SyncEngine {
        SyncEngine {
            internal: Cache::new("internal"),
            external: Cache::new("external"),
            internal_exp: Cache::new("internal-exp"),
            external_exp: Cache::new("external-exp"),
            strategy: sequenced::build(kind, resend_window, ack_window),
            link: LinkState::new(hello_interval, now),
            next_seq: SeqNum(1),
            stats: SyncStats::default(),
        }
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    pub fn queue_len(&self) -> usize {
        self.strategy.queue_len()
    }

    fn take_seq(&mut self) -> SeqNum {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.next();
        seq
    }

    fn emit_flow(&mut self, msg_type: MsgType, flow: &Flow, now: Instant, out: &mut Vec<Vec<u8>>) {
        let seq = self.take_seq();
        let frame = codec::encode_flow(msg_type, NetFlags::empty(), seq, flow);
        self.strategy.on_sent(seq, &frame);
        self.link.on_tx(now);
        out.push(frame);
    }

    fn emit_expectation(
        &mut self,
        msg_type: MsgType,
        exp: &Expectation,
        now: Instant,
        out: &mut Vec<Vec<u8>>,
    ) {
        let seq = self.take_seq();
        let frame = codec::encode_expectation(msg_type, NetFlags::empty(), seq, exp);
        self.strategy.on_sent(seq, &frame);
        self.link.on_tx(now);
        out.push(frame);
    }

    fn emit_ctl(
        &mut self,
        flags: NetFlags,
        bounds: Option<ctmirror_proto::AckBounds>,
        now: Instant,
        out: &mut Vec<Vec<u8>>,
    ) {
        let frame = codec::encode_ctl(flags, self.next_seq, bounds);
        self.link.on_tx(now);
        out.push(frame);
    }

    /// Mirrors one kernel event into the internal caches and queues the
    /// corresponding sync message.
    pub fn handle_event(&mut self, event: CtEvent, now: Instant, out: &mut Vec<Vec<u8>>) {
        match event {
            CtEvent::New(mut flow) => {
                flow.strip_volatile();
                if flow.key().is_none() {
                    debug!("event without usable tuple, skipped");
                    return;
                }
                if self.internal.update_force(flow.clone()).is_ok() {
                    self.emit_flow(MsgType::CtNew, &flow, now, out);
                }
            }
            CtEvent::Update(mut flow) => {
                flow.strip_volatile();
                if flow.key().is_none() {
                    debug!("event without usable tuple, skipped");
                    return;
                }
                if self.internal.update_force(flow.clone()).is_ok() {
                    self.emit_flow(MsgType::CtUpd, &flow, now, out);
                }
            }
            CtEvent::Destroy(mut flow) => {
                flow.strip_volatile();
                let Some(key) = flow.key() else {
                    debug!("event without usable tuple, skipped");
                    return;
                };
                if self.internal.del(&key) {
                    self.emit_flow(MsgType::CtDel, &flow, now, out);
                }
            }
            CtEvent::ExpNew(exp) => {
                if self.internal_exp.update_force(exp.clone()).is_ok() {
                    self.emit_expectation(MsgType::ExpNew, &exp, now, out);
                }
            }
            CtEvent::ExpUpdate(exp) => {
                if self.internal_exp.update_force(exp.clone()).is_ok() {
                    self.emit_expectation(MsgType::ExpUpd, &exp, now, out);
                }
            }
            CtEvent::ExpDestroy(exp) => {
                if self.internal_exp.del(&exp.key()) {
                    self.emit_expectation(MsgType::ExpDel, &exp, now, out);
                }
            }
        }
    }

    /// Applies one decoded data message to the external caches.
    /// Application is idempotent; duplicates degrade to updates.
    fn apply(&mut self, msg_type: MsgType, payload: Payload) -> Result<(), CoreError> {
        match (msg_type, payload) {
            (MsgType::CtNew, Payload::Flow(flow)) | (MsgType::CtUpd, Payload::Flow(flow)) => {
                self.external.update_force(flow)?;
            }
            (MsgType::CtDel, Payload::Flow(flow)) => {
                if let Some(key) = flow.key() {
                    self.external.del(&key);
                }
            }
            (MsgType::ExpNew, Payload::Expectation(exp))
            | (MsgType::ExpUpd, Payload::Expectation(exp)) => {
                self.external_exp.update_force(exp)?;
            }
            (MsgType::ExpDel, Payload::Expectation(exp)) => {
                self.external_exp.del(&exp.key());
            }
            _ => return Err(CoreError::ResourceExhausted("payload/type mismatch")),
        }
        self.stats.delivered += 1;
        Ok(())
    }

    fn run_actions(&mut self, actions: Vec<Action>, now: Instant, out: &mut Vec<Vec<u8>>) {
        for action in actions {
            match action {
                Action::SendCtl { flags, bounds } => self.emit_ctl(flags, bounds, now, out),
                Action::SendFrame(frame) => {
                    self.link.on_tx(now);
                    out.push(frame);
                }
                Action::ReplayCache => self.replay(now, out),
            }
        }
    }

    fn run_link_events(&mut self, events: Vec<LinkEvent>, now: Instant, out: &mut Vec<Vec<u8>>) {
        for event in events {
            match event {
                LinkEvent::SendHello => self.emit_ctl(NetFlags::HELLO, None, now, out),
                LinkEvent::SendHelloBack => {
                    self.emit_ctl(NetFlags::HELLO_BACK, None, now, out)
                }
                LinkEvent::Established => {
                    info!("peer link established, announcing full resync");
                    self.emit_ctl(NetFlags::RESYNC, None, now, out);
                    self.replay(now, out);
                }
            }
        }
    }

    /// Feeds one received datagram (or reframed stream chunk). Per-message
    /// errors are counted and skipped; framing errors abort the rest of the
    /// buffer only.
    pub fn handle_datagram(&mut self, data: &[u8], now: Instant, out: &mut Vec<Vec<u8>>) {
        let frames: Vec<(NetHdr, Vec<u8>)> = {
            let mut collected = Vec::new();
            for item in codec::FrameIter::new(data) {
                match item {
                    Ok((hdr, frame)) => collected.push((hdr, frame.to_vec())),
                    Err(err) => {
                        warn!(%err, "dropping rest of packet");
                        self.stats.malformed += 1;
                        break;
                    }
                }
            }
            collected
        };

        for (hdr, frame) in frames {
            self.handle_frame(&hdr, &frame, now, out);
        }
    }

    fn handle_frame(&mut self, hdr: &NetHdr, frame: &[u8], now: Instant, out: &mut Vec<Vec<u8>>) {
        if hdr.version != PROTOCOL_VERSION {
            self.stats.version_old += 1;
            warn!(
                version = hdr.version,
                expected = PROTOCOL_VERSION,
                "peer speaks another protocol version"
            );
            return;
        }

        if hdr.flags.contains(NetFlags::HELLO) {
            let events = self.link.on_hello();
            self.run_link_events(events, now, out);
        }
        if hdr.flags.contains(NetFlags::HELLO_BACK) {
            let events = self.link.on_hello_back();
            self.run_link_events(events, now, out);
        }

        if hdr.flags.is_data() && hdr.typ() != Some(MsgType::Ctl) {
            match codec::decode_payload(hdr, frame) {
                Ok(Some(payload)) => {
                    let msg_type = hdr.typ().expect("typed payload was decoded");
                    if let Err(err) = self.apply(msg_type, payload) {
                        warn!(%err, "could not apply message");
                    }
                    let actions = self.strategy.on_data(hdr);
                    self.run_actions(actions, now, out);
                }
                Ok(None) => {}
                Err(err) => {
                    self.stats.malformed += 1;
                    if matches!(err, ctmirror_proto::ProtoError::UnknownType(_)) {
                        self.stats.unknown_type += 1;
                    }
                    warn!(%err, seq = hdr.seq.0, "malformed message dropped");
                }
            }
        } else {
            let actions = self.strategy.on_ctl(hdr);
            self.run_actions(actions, now, out);
        }
    }

    /// Strategy and hello timers.
    pub fn tick(&mut self, now: Instant, out: &mut Vec<Vec<u8>>) {
        let actions = self.strategy.on_tick();
        self.run_actions(actions, now, out);
        if let Some(event) = self.link.tick(now) {
            self.run_link_events(vec![event], now, out);
        }
    }

    /// The transport dropped and reconnected underneath us.
    pub fn handle_link_reset(&mut self, now: Instant, out: &mut Vec<Vec<u8>>) {
        info!("transport reset, resynchronizing");
        let actions = self.strategy.on_link_reset();
        self.run_actions(actions, now, out);
    }

    /// Re-sends the whole internal state as NEW messages.
    pub fn replay(&mut self, now: Instant, out: &mut Vec<Vec<u8>>) {
        let flows: Vec<Flow> = {
            let mut collected = Vec::new();
            self.internal.for_each(|flow| collected.push(flow.clone()));
            collected
        };
        debug!(count = flows.len(), "replaying internal cache");
        for flow in flows {
            self.emit_flow(MsgType::CtNew, &flow, now, out);
        }
        let exps: Vec<Expectation> = {
            let mut collected = Vec::new();
            self.internal_exp
                .for_each(|exp| collected.push(exp.clone()));
            collected
        };
        for exp in exps {
            self.emit_expectation(MsgType::ExpNew, &exp, now, out);
        }
    }

    /// Installs the external replica into the kernel (failover promotion).
    pub fn commit(&mut self, kernel: &mut dyn KernelSource) -> usize {
        let mut committed = 0;
        let mut failed = 0;
        self.external.for_each(|flow| {
            // Committed flows must not carry the peer's timers.
            let mut flow = flow.clone();
            flow.strip_volatile();
            match kernel.inject(&flow) {
                Ok(()) => committed += 1,
                Err(_) => failed += 1,
            }
        });
        if failed > 0 {
            warn!(failed, "some flows could not be committed to the kernel");
        }
        info!(committed, "external cache committed to kernel");
        committed
    }
}

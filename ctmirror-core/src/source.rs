//! The kernel conntrack event source, as seen by the core.
//!
//! The real netlink subscription lives outside this crate; the core only
//! consumes this trait. Tests inject [`MockKernel`].

use crate::error::CoreError;
use ctmirror_proto::expect::Expectation;
use ctmirror_proto::flow::{Flow, FlowKey};
use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;

/// One flow or expectation operation announced by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CtEvent {
    New(Flow),
    Update(Flow),
    Destroy(Flow),
    ExpNew(Expectation),
    ExpUpdate(Expectation),
    ExpDestroy(Expectation),
}

/// Injected collaborator wrapping the conntrack netlink subsystem.
pub trait KernelSource {
    /// Starts event delivery.
    fn subscribe(&mut self) -> Result<(), CoreError>;

    /// Readiness fd for the event loop, if the source is fd-backed.
    fn poll_fd(&self) -> Option<RawFd>;

    /// Drains every queued event into `cb` without blocking.
    fn drain_events(&mut self, cb: &mut dyn FnMut(CtEvent));

    /// Point query of the current kernel table.
    fn get(&mut self, key: &FlowKey) -> Option<Flow>;

    /// Full table walk, used when (re)priming the internal cache.
    fn dump_table(&mut self, cb: &mut dyn FnMut(Flow));

    /// Installs one flow into the kernel (failover promotion).
    fn inject(&mut self, flow: &Flow) -> Result<(), CoreError>;
}

/// A source with no kernel behind it, for deployments where the netlink
/// collaborator runs out of process (pure replica hosts) or is wired in
/// later. It produces no events and denies every query.
#[derive(Debug, Default)]
pub struct NullSource;

impl KernelSource for NullSource {
    fn subscribe(&mut self) -> Result<(), CoreError> {
        Ok(())
    }

    fn poll_fd(&self) -> Option<RawFd> {
        None
    }

    fn drain_events(&mut self, _cb: &mut dyn FnMut(CtEvent)) {}

    fn get(&mut self, _key: &FlowKey) -> Option<Flow> {
        None
    }

    fn dump_table(&mut self, _cb: &mut dyn FnMut(Flow)) {}

    fn inject(&mut self, _flow: &Flow) -> Result<(), CoreError> {
        Err(CoreError::ResourceExhausted("no kernel backend attached"))
    }
}

/// Deterministic in-memory kernel used by the test suite.
#[derive(Default)]
pub struct MockKernel {
    pub table: HashMap<FlowKey, Flow>,
    pub queued: VecDeque<CtEvent>,
    pub injected: Vec<Flow>,
    pub subscribed: bool,
    /// Forces `get` to deny even present entries, to exercise stamina.
    pub deny_gets: bool,
}

impl MockKernel {
    pub fn new() -> MockKernel {
        MockKernel::default()
    }

    /// Queues an event and mirrors it into the fake table.
    pub fn push_event(&mut self, event: CtEvent) {
        match &event {
            CtEvent::New(flow) | CtEvent::Update(flow) => {
                if let Some(key) = flow.key() {
                    self.table.insert(key, flow.clone());
                }
            }
            CtEvent::Destroy(flow) => {
                if let Some(key) = flow.key() {
                    self.table.remove(&key);
                }
            }
            // Expectations have no table of their own in the mock.
            CtEvent::ExpNew(_) | CtEvent::ExpUpdate(_) | CtEvent::ExpDestroy(_) => {}
        }
        self.queued.push_back(event);
    }
}

impl KernelSource for MockKernel {
    fn subscribe(&mut self) -> Result<(), CoreError> {
        self.subscribed = true;
        Ok(())
    }

    fn poll_fd(&self) -> Option<RawFd> {
        None
    }

    fn drain_events(&mut self, cb: &mut dyn FnMut(CtEvent)) {
        while let Some(event) = self.queued.pop_front() {
            cb(event);
        }
    }

    fn get(&mut self, key: &FlowKey) -> Option<Flow> {
        if self.deny_gets {
            return None;
        }
        self.table.get(key).cloned()
    }

    fn dump_table(&mut self, cb: &mut dyn FnMut(Flow)) {
        for flow in self.table.values() {
            cb(flow.clone());
        }
    }

    fn inject(&mut self, flow: &Flow) -> Result<(), CoreError> {
        self.injected.push(flow.clone());
        if let Some(key) = flow.key() {
            self.table.insert(key, flow.clone());
        }
        Ok(())
    }
}

//! Track mode: periodic reconciliation of the cache against the kernel.
//!
//! Every cached flow carries an alarm firing at a jittered interval and a
//! stamina budget of kernel-GET misses; flows the kernel no longer knows
//! are logged and evicted. A second, fixed-period alarm compares the
//! cache's active count against `nf_conntrack_count` and flags divergence
//! beyond what in-flight netlink messages could explain.

use crate::alarm::{AlarmId, AlarmScheduler};
use crate::cache::{Cache, DumpFormat, ExtraLifecycle};
use crate::config::{Config, RunMode};
use crate::error::{ConfigError, CoreError};
use crate::source::{CtEvent, KernelSource};
use ctmirror_proto::flow::{Flow, FlowKey};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Misses tolerated before a flow is declared vanished.
const STAMINA: i32 = 5;

/// Counter-comparison period.
const COUNTER_SECS: u64 = 10;

/// Average ctnetlink message size, for the in-flight allowance.
const AVG_NETLINK_MSG: usize = 160;

pub const CONNTRACK_COUNT_PATH: &str = "/proc/sys/net/netfilter/nf_conntrack_count";

/// Alarm tokens dispatched by the event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackToken {
    /// Probe one flow in the kernel.
    Ping(FlowKey),
    /// Compare cache size against the kernel counter.
    Counter,
}

type Sched = Rc<RefCell<AlarmScheduler<TrackToken>>>;
type SharedRng = Rc<RefCell<StdRng>>;

/// Per-object state: the probe alarm and the remaining miss budget.
pub struct TrackExtra {
    pub alarm: AlarmId,
    pub stamina: i32,
}

/// Picks the next probe deadline: a uniform [1, 60] second delay plus a
/// 0.2-second-granular microsecond jitter.
fn probe_delay(rng: &mut StdRng) -> Duration {
    let secs: u64 = rng.gen_range(1..=60);
    let micros: u32 = rng.gen_range(1..=5) * 200_000 - 1;
    Duration::new(secs, micros * 1000)
}

struct TrackLifecycle {
    sched: Sched,
    rng: SharedRng,
    now: Rc<RefCell<Instant>>,
}

impl ExtraLifecycle<Flow, TrackExtra> for TrackLifecycle {
    fn on_add(&mut self, item: &Flow) -> TrackExtra {
        let mut sched = self.sched.borrow_mut();
        let key = item.key().expect("cache rejects flows without a key");
        let alarm = sched.register(TrackToken::Ping(key));
        let delay = probe_delay(&mut self.rng.borrow_mut());
        sched.schedule_in(alarm, *self.now.borrow(), delay);
        TrackExtra {
            alarm,
            stamina: STAMINA,
        }
    }

    fn on_update(&mut self, _item: &Flow, extra: &mut TrackExtra) {
        let delay = probe_delay(&mut self.rng.borrow_mut());
        self.sched
            .borrow_mut()
            .schedule_in(extra.alarm, *self.now.borrow(), delay);
    }

    fn on_destroy(&mut self, _item: &Flow, extra: &mut TrackExtra) {
        self.sched.borrow_mut().remove(extra.alarm);
    }

    fn dump(&self, _item: &Flow, extra: &TrackExtra, fmt: DumpFormat) -> Option<String> {
        if fmt == DumpFormat::Xml {
            return None;
        }
        let sched = self.sched.borrow();
        if !sched.pending(extra.alarm) {
            return None;
        }
        let deadline = sched.deadline(extra.alarm)?;
        let left = deadline.saturating_duration_since(*self.now.borrow());
        Some(format!(
            " [ping in {}s, stamina {}]",
            left.as_secs(),
            extra.stamina
        ))
    }
}

enum Op {
    New,
    Update,
    Destroy,
}

pub struct TrackMode {
    pub cache: Cache<Flow, TrackExtra>,
    sched: Sched,
    rng: SharedRng,
    counter_alarm: AlarmId,
    netlink_buffer_size: usize,
    count_path: PathBuf,
    now: Rc<RefCell<Instant>>,
}

impl TrackMode {
    pub fn new(config: &Config, now: Instant) -> Result<TrackMode, CoreError> {
        Self::with_rng_and_path(
            config,
            now,
            StdRng::from_entropy(),
            PathBuf::from(CONNTRACK_COUNT_PATH),
        )
    }

    /// Deterministic constructor for tests.
    pub fn with_rng_and_path(
        config: &Config,
        now: Instant,
        rng: StdRng,
        count_path: PathBuf,
    ) -> Result<TrackMode, CoreError> {
        if config.mode == RunMode::Track && config.poll_secs.is_some() {
            return Err(ConfigError::Incompatible(
                "`poll_secs` cannot be used together with track mode",
            )
            .into());
        }
        let sched: Sched = Rc::new(RefCell::new(AlarmScheduler::new()));
        let shared_now = Rc::new(RefCell::new(now));
        let shared_rng: SharedRng = Rc::new(RefCell::new(rng));
        let lifecycle = TrackLifecycle {
            sched: sched.clone(),
            rng: shared_rng.clone(),
            now: shared_now.clone(),
        };
        let counter_alarm = {
            let mut s = sched.borrow_mut();
            let id = s.register(TrackToken::Counter);
            s.schedule_in(id, now, Duration::from_secs(COUNTER_SECS));
            id
        };
        info!("running in TRACK mode");
        Ok(TrackMode {
            cache: Cache::with_extra("track", Box::new(lifecycle)),
            sched,
            rng: shared_rng,
            counter_alarm,
            netlink_buffer_size: config.netlink_buffer_size,
            count_path,
            now: shared_now,
        })
    }

    /// Keeps the lifecycle's notion of "now" current; called once per loop
    /// iteration before cache mutations.
    pub fn set_now(&mut self, now: Instant) {
        *self.now.borrow_mut() = now;
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.sched.borrow_mut().next_deadline()
    }

    /// Mirrors one kernel event. Timers are the kernel's business and are
    /// not cached; expectations are not tracked.
    pub fn handle_event(&mut self, event: CtEvent) {
        let (mut flow, op) = match event {
            CtEvent::New(flow) => (flow, Op::New),
            CtEvent::Update(flow) => (flow, Op::Update),
            CtEvent::Destroy(flow) => (flow, Op::Destroy),
            CtEvent::ExpNew(_) | CtEvent::ExpUpdate(_) | CtEvent::ExpDestroy(_) => return,
        };
        flow.strip_volatile();
        let Some(key) = flow.key() else {
            return;
        };
        match op {
            Op::New => {
                if self.cache.find(&key).is_none() {
                    let _ = self.cache.add(flow);
                }
            }
            Op::Update => {
                let _ = self.cache.update_force(flow);
            }
            Op::Destroy => {
                self.cache.del(&key);
            }
        }
    }

    /// Primes the cache from a full kernel table walk.
    pub fn resync(&mut self, kernel: &mut dyn KernelSource) {
        let mut flows = Vec::new();
        kernel.dump_table(&mut |flow| flows.push(flow));
        for mut flow in flows {
            flow.strip_volatile();
            let _ = self.cache.update_force(flow);
        }
    }

    /// Fires due alarms and dispatches their tokens.
    pub fn run_alarms(&mut self, now: Instant, kernel: &mut dyn KernelSource) {
        self.set_now(now);
        let fired = self.sched.borrow_mut().run_pending(now);
        for (_, token) in fired {
            match token {
                TrackToken::Ping(key) => self.probe(key, now, kernel),
                TrackToken::Counter => self.compare_counter(now),
            }
        }
    }

    fn probe(&mut self, key: FlowKey, now: Instant, kernel: &mut dyn KernelSource) {
        let Some(obj) = self.cache.find_mut(&key) else {
            return;
        };
        if kernel.get(&key).is_none() {
            obj.extra.stamina -= 1;
            if obj.extra.stamina < 0 {
                // Out of tries; the kernel has forgotten this entry.
                let line = obj.item.to_string();
                warn!(flow = %line, "entry vanished from the kernel");
                self.cache.del(&key);
                return;
            }
        }
        let alarm = obj.extra.alarm;
        let delay = probe_delay(&mut self.rng.borrow_mut());
        self.sched.borrow_mut().schedule_in(alarm, now, delay);
    }

    fn compare_counter(&mut self, now: Instant) {
        if let Some(kernel_count) = read_count(&self.count_path) {
            let active = self.cache.stats().active as i64;
            let diff = active - kernel_count as i64;
            // 160 bytes is the assumed average ctnetlink message size; a
            // smaller difference may just be messages still in flight.
            let allowance = (self.netlink_buffer_size / AVG_NETLINK_MSG) as i64;
            if diff > allowance {
                error!(
                    diff,
                    "the cache contains more entries than the kernel"
                );
            }
        }
        let counter_alarm = self.counter_alarm;
        self.sched
            .borrow_mut()
            .schedule_in(counter_alarm, now, Duration::from_secs(COUNTER_SECS));
    }
}

fn read_count(path: &PathBuf) -> Option<usize> {
    let text = fs::read_to_string(path).ok()?;
    text.trim().parse().ok()
}

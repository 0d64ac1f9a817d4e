//! The event-driven main loop.
//!
//! Single-threaded and cooperative: each iteration computes the next alarm
//! deadline, waits for readiness on the channel, kernel and control fds
//! bounded by that deadline, services the ready fds with non-blocking
//! calls, then fires expired alarms. The loop is the only mutator of cache
//! state; shutdown is a flag observed at the top of each iteration.

use crate::alarm::AlarmScheduler;
use crate::cache::DumpFormat;
use crate::channel::{self, Channel, MaintainEvent, MAX_DGRAM};
use crate::config::{Config, RunMode};
use crate::control::{ControlCommand, ControlSocket};
use crate::error::{ConfigError, CoreError};
use crate::snapshot;
use crate::source::{CtEvent, KernelSource};
use crate::sync::SyncEngine;
use crate::track::TrackMode;
use ctmirror_proto::codec::FrameIter;
use nix::poll::{poll, PollFd, PollFlags};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Alarm tokens owned by the loop itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopToken {
    /// Strategy tick: batched ACKs, gap re-requests, hello probing.
    SyncTick,
}

enum Engine {
    Sync {
        engine: SyncEngine,
        channel: Box<dyn Channel>,
        /// Reassembly buffer for stream transports.
        stream_buf: Vec<u8>,
    },
    Track(TrackMode),
}

pub struct Daemon {
    config: Config,
    control: ControlSocket,
    kernel: Box<dyn KernelSource>,
    engine: Engine,
    sched: AlarmScheduler<LoopToken>,
    shutdown: Arc<AtomicBool>,
}

impl Daemon {
    pub fn new(
        config: Config,
        kernel: Box<dyn KernelSource>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Daemon, CoreError> {
        config.validate()?;
        let now = Instant::now();
        let control = ControlSocket::bind(&config.control_socket)?;
        let mut sched = AlarmScheduler::new();

        let engine = match config.mode {
            RunMode::Sync => {
                let chan_conf = config
                    .channel
                    .as_ref()
                    .ok_or(ConfigError::Incompatible("sync mode without channel"))?;
                let channel = channel::open(chan_conf)?;
                let mut engine = SyncEngine::new(
                    config.sync.strategy.into(),
                    config.sync.resend_window,
                    config.sync.ack_window,
                    Duration::from_secs(config.hello_interval_secs),
                    now,
                );
                if let Some(path) = config.snapshot_file.as_deref() {
                    snapshot::load(&mut engine.external, path)?;
                }
                let tick = sched.register(LoopToken::SyncTick);
                sched.schedule_in(tick, now, Duration::from_secs(config.sync.tick_secs));
                Engine::Sync {
                    engine,
                    channel,
                    stream_buf: Vec::new(),
                }
            }
            RunMode::Track => Engine::Track(TrackMode::new(&config, now)?),
        };

        Ok(Daemon {
            config,
            control,
            kernel,
            engine,
            sched,
            shutdown,
        })
    }

    /// Runs until the shutdown flag is raised. Destruction order is the
    /// reverse of construction: engine, then control socket, then kernel.
    pub fn run(&mut self) -> Result<(), CoreError> {
        self.kernel.subscribe()?;
        self.prime();
        info!("daemon running");

        while !self.shutdown.load(Ordering::SeqCst) {
            let now = Instant::now();
            let timeout = self.poll_timeout(now);
            let ready = self.wait_ready(timeout);
            let now = Instant::now();

            self.drain_kernel(now);
            self.service_channel(&ready, now);
            self.service_control(&ready, now);
            self.fire_alarms(now);
        }

        info!("shutting down");
        if let (Some(path), Engine::Sync { engine, .. }) =
            (self.config.snapshot_file.as_deref(), &self.engine)
        {
            if let Err(err) = snapshot::save(&engine.external, path) {
                warn!(%err, "snapshot save failed");
            }
        }
        Ok(())
    }

    /// Primes the caches from a full kernel walk before serving traffic.
    fn prime(&mut self) {
        match &mut self.engine {
            Engine::Sync { engine, .. } => {
                let mut flows = Vec::new();
                self.kernel.dump_table(&mut |flow| flows.push(flow));
                for mut flow in flows {
                    flow.strip_volatile();
                    if let Err(err) = engine.internal.update_force(flow) {
                        debug!(%err, "prime skipped an entry");
                    }
                }
            }
            Engine::Track(track) => track.resync(self.kernel.as_mut()),
        }
    }

    fn poll_timeout(&mut self, now: Instant) -> i32 {
        let mut deadline = self.sched.next_deadline();
        if let Engine::Track(track) = &self.engine {
            let track_deadline = track.next_deadline();
            deadline = match (deadline, track_deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        match deadline {
            Some(at) => {
                let left = at.saturating_duration_since(now);
                left.as_millis().min(i32::MAX as u128) as i32
            }
            None => 1000,
        }
    }

    fn wait_ready(&mut self, timeout_ms: i32) -> Vec<RawFd> {
        let mut fds = vec![self.control.fd()];
        if let Some(fd) = self.kernel.poll_fd() {
            fds.push(fd);
        }
        if let Engine::Sync { channel, .. } = &self.engine {
            fds.extend(channel.fds());
        }

        let mut pollfds: Vec<PollFd> = fds
            .iter()
            .map(|&fd| PollFd::new(fd, PollFlags::POLLIN))
            .collect();
        match poll(&mut pollfds, timeout_ms) {
            Ok(0) | Err(nix::errno::Errno::EINTR) => Vec::new(),
            Ok(_) => fds
                .iter()
                .zip(pollfds.iter())
                .filter(|(_, p)| {
                    p.revents()
                        .map(|r| {
                            r.intersects(
                                PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP,
                            )
                        })
                        .unwrap_or(false)
                })
                .map(|(&fd, _)| fd)
                .collect(),
            Err(err) => {
                warn!(%err, "poll failed");
                Vec::new()
            }
        }
    }

    fn drain_kernel(&mut self, now: Instant) {
        let mut events: Vec<CtEvent> = Vec::new();
        self.kernel.drain_events(&mut |event| events.push(event));
        if events.is_empty() {
            return;
        }
        match &mut self.engine {
            Engine::Sync {
                engine, channel, ..
            } => {
                let mut out = Vec::new();
                for event in events {
                    engine.handle_event(event, now, &mut out);
                }
                send_frames(channel.as_mut(), out);
            }
            Engine::Track(track) => {
                track.set_now(now);
                for event in events {
                    track.handle_event(event);
                }
            }
        }
    }

    fn service_channel(&mut self, ready: &[RawFd], now: Instant) {
        let Engine::Sync {
            engine,
            channel,
            stream_buf,
        } = &mut self.engine
        else {
            return;
        };

        if channel.maintain(now) == MaintainEvent::Reconnected {
            stream_buf.clear();
            let mut out = Vec::new();
            engine.handle_link_reset(now, &mut out);
            send_frames(channel.as_mut(), out);
        }

        if !channel.isset(ready) {
            return;
        }

        let mut buf = vec![0u8; MAX_DGRAM];
        let mut out = Vec::new();
        // Bounded batch per loop turn; leftovers wake us again.
        for _ in 0..64 {
            match channel.recv(&mut buf) {
                Ok(Some(len)) => {
                    if channel.is_stream() {
                        stream_buf.extend_from_slice(&buf[..len]);
                        let consumed = drain_stream(stream_buf, engine, now, &mut out);
                        stream_buf.drain(..consumed);
                    } else {
                        engine.handle_datagram(&buf[..len], now, &mut out);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(%err, "channel recv error");
                    break;
                }
            }
        }
        send_frames(channel.as_mut(), out);
    }

    fn service_control(&mut self, ready: &[RawFd], now: Instant) {
        if !ready.contains(&self.control.fd()) {
            return;
        }
        while let Some((cmd, peer)) = self.control.recv_command() {
            let response = self.execute(cmd, now);
            self.control.reply(&peer, &response);
            if cmd == ControlCommand::Kill {
                self.shutdown.store(true, Ordering::SeqCst);
                break;
            }
        }
    }

    fn execute(&mut self, cmd: ControlCommand, now: Instant) -> String {
        match cmd {
            ControlCommand::Kill => "bye\n".to_owned(),
            ControlCommand::DumpInternal => self.dump(true, DumpFormat::Plain),
            ControlCommand::DumpInternalXml => self.dump(true, DumpFormat::Xml),
            ControlCommand::DumpExternal => self.dump(false, DumpFormat::Plain),
            ControlCommand::DumpExternalXml => self.dump(false, DumpFormat::Xml),
            ControlCommand::FlushCaches => {
                info!("flushing caches");
                match &mut self.engine {
                    Engine::Sync { engine, .. } => {
                        engine.internal.flush();
                        engine.external.flush();
                        engine.internal_exp.flush();
                        engine.external_exp.flush();
                    }
                    Engine::Track(track) => {
                        track.set_now(now);
                        track.cache.flush();
                    }
                }
                "caches flushed\n".to_owned()
            }
            ControlCommand::FlushInternal => {
                info!("flushing internal cache");
                match &mut self.engine {
                    Engine::Sync { engine, .. } => {
                        engine.internal.flush();
                        engine.internal_exp.flush();
                    }
                    Engine::Track(track) => {
                        track.set_now(now);
                        track.cache.flush();
                    }
                }
                "internal cache flushed\n".to_owned()
            }
            ControlCommand::FlushExternal => {
                match &mut self.engine {
                    Engine::Sync { engine, .. } => {
                        engine.external.flush();
                        engine.external_exp.flush();
                        "external cache flushed\n".to_owned()
                    }
                    Engine::Track(_) => "no external cache in track mode\n".to_owned(),
                }
            }
            ControlCommand::Resync => match &mut self.engine {
                Engine::Sync {
                    engine, channel, ..
                } => {
                    let mut out = Vec::new();
                    engine.replay(now, &mut out);
                    send_frames(channel.as_mut(), out);
                    "resync started\n".to_owned()
                }
                Engine::Track(track) => {
                    track.set_now(now);
                    track.resync(self.kernel.as_mut());
                    "cache resynchronized from kernel\n".to_owned()
                }
            },
            ControlCommand::Commit => match &mut self.engine {
                Engine::Sync { engine, .. } => {
                    let committed = engine.commit(self.kernel.as_mut());
                    format!("committed {} flows\n", committed)
                }
                Engine::Track(_) => "nothing to commit in track mode\n".to_owned(),
            },
            ControlCommand::Stats | ControlCommand::StatsCache => self.stats_text(cmd),
        }
    }

    fn dump(&mut self, internal: bool, fmt: DumpFormat) -> String {
        let mut out = Vec::new();
        let result = match &self.engine {
            Engine::Sync { engine, .. } => {
                if internal {
                    engine
                        .internal
                        .dump(&mut out, fmt)
                        .and_then(|_| engine.internal_exp.dump(&mut out, fmt))
                } else {
                    engine
                        .external
                        .dump(&mut out, fmt)
                        .and_then(|_| engine.external_exp.dump(&mut out, fmt))
                }
            }
            Engine::Track(track) => track.cache.dump(&mut out, fmt),
        };
        match result {
            Ok(()) => String::from_utf8_lossy(&out).into_owned(),
            Err(err) => format!("dump failed: {}\n", err),
        }
    }

    fn stats_text(&self, cmd: ControlCommand) -> String {
        let mut out = Vec::new();
        match &self.engine {
            Engine::Sync {
                engine, channel, ..
            } => {
                let _ = engine.internal.write_stats(&mut out);
                let _ = engine.external.write_stats(&mut out);
                if cmd == ControlCommand::StatsCache {
                    let _ = engine.internal_exp.write_stats(&mut out);
                    let _ = engine.external_exp.write_stats(&mut out);
                }
                let s = engine.stats();
                let text = format!(
                    "message tracking:\n\
                     {:20} Malformed msgs {:20} Version mismatch\n\
                     {:20} Delivered msgs {:20} Retransmit queue\n",
                    s.malformed,
                    s.version_old,
                    s.delivered,
                    engine.queue_len()
                );
                out.extend_from_slice(text.as_bytes());
                out.extend_from_slice(channel.stats().render(channel.kind()).as_bytes());
            }
            Engine::Track(track) => {
                let _ = track.cache.write_stats(&mut out);
            }
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    fn fire_alarms(&mut self, now: Instant) {
        let fired = self.sched.run_pending(now);
        for (id, token) in fired {
            match token {
                LoopToken::SyncTick => {
                    if let Engine::Sync {
                        engine, channel, ..
                    } = &mut self.engine
                    {
                        let mut out = Vec::new();
                        engine.tick(now, &mut out);
                        send_frames(channel.as_mut(), out);
                    }
                    self.sched
                        .schedule_in(id, now, Duration::from_secs(self.config.sync.tick_secs));
                }
            }
        }
        if let Engine::Track(track) = &mut self.engine {
            track.run_alarms(now, self.kernel.as_mut());
        }
    }
}

fn send_frames(channel: &mut dyn Channel, frames: Vec<Vec<u8>>) {
    for frame in frames {
        if let Err(err) = channel.send(&frame) {
            warn!(%err, "send failed, message dropped");
        }
    }
}

/// Consumes complete frames from the front of a stream buffer, returning
/// how many bytes were used. A partial tail stays for the next read; a
/// corrupt header poisons the whole buffer, which the next resync heals.
fn drain_stream(
    buf: &[u8],
    engine: &mut SyncEngine,
    now: Instant,
    out: &mut Vec<Vec<u8>>,
) -> usize {
    use ctmirror_proto::ProtoError;

    let mut consumed = 0;
    let mut iter = FrameIter::new(buf);
    loop {
        let before = iter.remaining();
        match iter.next() {
            Some(Ok((_hdr, frame))) => {
                engine.handle_datagram(frame, now, out);
                consumed += before - iter.remaining();
            }
            Some(Err(ProtoError::TruncatedHeader(_)))
            | Some(Err(ProtoError::TruncatedPacket { .. }))
            | None => break,
            Some(Err(err)) => {
                warn!(%err, "corrupt stream, dropping buffered bytes");
                consumed = buf.len();
                break;
            }
        }
    }
    consumed
}

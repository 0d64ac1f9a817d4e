//! TCP transport: connection-oriented with bounded-backoff reconnection.
//!
//! One listening socket accepts the peer's inbound stream; one outbound
//! socket connects to the peer. Connects are non-blocking: progress is
//! checked in `maintain` via POLLOUT + SO_ERROR, and a lost connection
//! re-enters backoff. The caller learns about a completed reconnect so it
//! can drop stale retransmits and schedule a resync.

use super::{Channel, ChannelStats, MaintainEvent};
use crate::config::TcpConfig;
use crate::error::TransportError;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::socket::{self, sockopt, AddressFamily, SockFlag, SockType, SockaddrIn};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddrV4, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

enum TxState {
    Connecting { fd: RawFd, since: Instant },
    Connected(TcpStream),
    Backoff { until: Instant, attempt: u32 },
}

pub struct TcpChannel {
    listener: TcpListener,
    peer_rx: Option<TcpStream>,
    tx: TxState,
    remote: SocketAddrV4,
    stats: ChannelStats,
}

impl TcpChannel {
    pub fn open(conf: &TcpConfig) -> Result<TcpChannel, TransportError> {
        let listener = TcpListener::bind(conf.local)?;
        listener.set_nonblocking(true)?;
        info!(local = %conf.local, remote = %conf.remote, "tcp channel up");

        let mut chan = TcpChannel {
            listener,
            peer_rx: None,
            tx: TxState::Backoff {
                until: Instant::now(),
                attempt: 0,
            },
            remote: conf.remote,
            stats: ChannelStats::default(),
        };
        chan.start_connect();
        Ok(chan)
    }

    fn start_connect(&mut self) {
        let attempt = match self.tx {
            TxState::Backoff { attempt, .. } => attempt,
            _ => 0,
        };
        let fd = match socket::socket(
            AddressFamily::Inet,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK,
            None,
        ) {
            Ok(fd) => fd,
            Err(err) => {
                warn!(%err, "tcp socket creation failed");
                self.enter_backoff(attempt);
                return;
            }
        };
        let addr = SockaddrIn::from(self.remote);
        match socket::connect(fd, &addr) {
            Ok(()) => {
                self.tx = TxState::Connected(unsafe { TcpStream::from_raw_fd(fd) });
                info!(remote = %self.remote, "tcp peer connected");
            }
            Err(Errno::EINPROGRESS) => {
                self.tx = TxState::Connecting {
                    fd,
                    since: Instant::now(),
                };
            }
            Err(err) => {
                warn!(%err, "tcp connect failed");
                let _ = nix::unistd::close(fd);
                self.enter_backoff(attempt);
            }
        }
    }

    fn enter_backoff(&mut self, prev_attempt: u32) {
        let attempt = prev_attempt.saturating_add(1);
        let delay = Duration::from_secs(1u64 << attempt.min(5)).min(MAX_BACKOFF);
        self.tx = TxState::Backoff {
            until: Instant::now() + delay,
            attempt,
        };
    }

    fn accept_pending(&mut self) {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                if stream.set_nonblocking(true).is_ok() {
                    info!(%peer, "tcp peer accepted");
                    self.peer_rx = Some(stream);
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(_) => self.stats.errors += 1,
        }
    }
}

impl Channel for TcpChannel {
    fn kind(&self) -> &'static str {
        "tcp"
    }

    fn send(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        let stream = match self.tx {
            TxState::Connected(ref mut stream) => stream,
            _ => return Err(TransportError::NotConnected),
        };
        match stream.write(buf) {
            Ok(n) => {
                self.stats.bytes_sent += n as u64;
                self.stats.msgs_sent += 1;
                Ok(n)
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(err) => {
                self.stats.errors += 1;
                warn!(%err, "tcp send failed, reconnecting");
                self.enter_backoff(0);
                Err(TransportError::Disconnected)
            }
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TransportError> {
        if self.peer_rx.is_none() {
            self.accept_pending();
        }
        let Some(stream) = self.peer_rx.as_mut() else {
            return Ok(None);
        };
        match stream.read(buf) {
            Ok(0) => {
                // Orderly close from the peer.
                self.peer_rx = None;
                Ok(None)
            }
            Ok(n) => {
                self.stats.bytes_recv += n as u64;
                self.stats.msgs_recv += 1;
                Ok(Some(n))
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(err) => {
                self.stats.errors += 1;
                self.peer_rx = None;
                Err(TransportError::Io(err))
            }
        }
    }

    fn fds(&self) -> Vec<RawFd> {
        let mut fds = vec![self.listener.as_raw_fd()];
        if let Some(stream) = self.peer_rx.as_ref() {
            fds.push(stream.as_raw_fd());
        }
        fds
    }

    fn is_stream(&self) -> bool {
        true
    }

    fn maintain(&mut self, now: Instant) -> MaintainEvent {
        match self.tx {
            TxState::Connected(_) => MaintainEvent::Idle,
            TxState::Backoff { until, .. } => {
                if now >= until {
                    self.start_connect();
                    if matches!(self.tx, TxState::Connected(_)) {
                        return MaintainEvent::Reconnected;
                    }
                }
                MaintainEvent::Idle
            }
            TxState::Connecting { fd, since } => {
                let mut fds = [PollFd::new(fd, PollFlags::POLLOUT)];
                let writable = matches!(poll(&mut fds, 0), Ok(n) if n > 0);
                if writable {
                    match socket::getsockopt(fd, sockopt::SocketError) {
                        Ok(0) => {
                            self.tx = TxState::Connected(unsafe { TcpStream::from_raw_fd(fd) });
                            info!(remote = %self.remote, "tcp peer connected");
                            return MaintainEvent::Reconnected;
                        }
                        Ok(errno) => {
                            warn!(errno, "tcp connect failed");
                            let _ = nix::unistd::close(fd);
                            self.enter_backoff(0);
                        }
                        Err(err) => {
                            warn!(%err, "tcp connect status unavailable");
                            let _ = nix::unistd::close(fd);
                            self.enter_backoff(0);
                        }
                    }
                } else if now.duration_since(since) > Duration::from_secs(10) {
                    warn!(remote = %self.remote, "tcp connect timed out");
                    let _ = nix::unistd::close(fd);
                    self.enter_backoff(0);
                }
                MaintainEvent::Idle
            }
        }
    }

    fn stats(&self) -> ChannelStats {
        self.stats
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        if let TxState::Connecting { fd, .. } = self.tx {
            let _ = nix::unistd::close(fd);
        }
    }
}

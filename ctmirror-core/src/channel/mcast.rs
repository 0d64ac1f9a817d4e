//! UDP multicast transport: unreliable, datagram-preserving, one socket
//! per direction, joined to the configured group on a named interface.

use super::{Channel, ChannelStats};
use crate::config::McastConfig;
use crate::error::TransportError;
use nix::sys::socket::{self, sockopt, AddressFamily, SockFlag, SockType, SockaddrIn};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use tracing::info;

pub struct McastChannel {
    tx: UdpSocket,
    rx: UdpSocket,
    group: SocketAddrV4,
    stats: ChannelStats,
}

fn nix_err(err: nix::Error) -> TransportError {
    TransportError::Io(err.into())
}

impl McastChannel {
    pub fn open(conf: &McastConfig) -> Result<McastChannel, TransportError> {
        let group = SocketAddrV4::new(conf.group, conf.port);

        // SO_REUSEADDR must land before bind, so the socket is built by
        // hand instead of through UdpSocket::bind.
        let fd = socket::socket(
            AddressFamily::Inet,
            SockType::Datagram,
            SockFlag::empty(),
            None,
        )
        .map_err(nix_err)?;
        socket::setsockopt(fd, sockopt::ReuseAddr, &true).map_err(nix_err)?;
        let bind_addr = SockaddrIn::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, conf.port));
        if let Err(err) = socket::bind(fd, &bind_addr) {
            let _ = nix::unistd::close(fd);
            return Err(nix_err(err));
        }
        let rx = unsafe { UdpSocket::from_raw_fd(fd) };
        rx.join_multicast_v4(&conf.group, &conf.interface)?;
        rx.set_nonblocking(true)?;

        let tx = UdpSocket::bind(SocketAddrV4::new(conf.interface, 0))?;
        tx.set_multicast_loop_v4(false)?;
        tx.set_nonblocking(true)?;

        if let Some(size) = conf.sndbuf {
            socket::setsockopt(tx.as_raw_fd(), sockopt::SndBuf, &size)
                .map_err(|e| TransportError::Io(e.into()))?;
        }
        if let Some(size) = conf.rcvbuf {
            socket::setsockopt(rx.as_raw_fd(), sockopt::RcvBuf, &size)
                .map_err(|e| TransportError::Io(e.into()))?;
        }

        info!(group = %group, iface = %conf.interface, "multicast channel up");
        Ok(McastChannel {
            tx,
            rx,
            group,
            stats: ChannelStats::default(),
        })
    }
}

impl Channel for McastChannel {
    fn kind(&self) -> &'static str {
        "multicast"
    }

    fn send(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        match self.tx.send_to(buf, self.group) {
            Ok(n) => {
                self.stats.bytes_sent += n as u64;
                self.stats.msgs_sent += 1;
                Ok(n)
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(err) => {
                self.stats.errors += 1;
                Err(TransportError::Io(err))
            }
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TransportError> {
        match self.rx.recv_from(buf) {
            Ok((n, _peer)) => {
                self.stats.bytes_recv += n as u64;
                self.stats.msgs_recv += 1;
                Ok(Some(n))
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(err) => {
                self.stats.errors += 1;
                Err(TransportError::Io(err))
            }
        }
    }

    fn fds(&self) -> Vec<RawFd> {
        vec![self.rx.as_raw_fd()]
    }

    fn stats(&self) -> ChannelStats {
        self.stats
    }
}

//! TIPC transport: reliable-datagram sockets addressed by (type, instance)
//! names. The client socket sends to the peer's server name; the server
//! socket binds the symmetric pair. Message importance is configurable;
//! ordering and retransmission remain the sync protocol's concern.

use super::{Channel, ChannelStats};
use crate::config::TipcConfig;
use crate::error::TransportError;
use libc::{c_int, c_void, sa_family_t, socklen_t};
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use tracing::info;

// Kernel ABI from linux/tipc.h; not exposed by the libc crate.
const TIPC_ADDR_NAME: u8 = 2;
const TIPC_CLUSTER_SCOPE: i8 = 2;
const SOL_TIPC: c_int = 271;
const TIPC_IMPORTANCE: c_int = 127;

#[repr(C)]
#[derive(Clone, Copy)]
struct TipcName {
    typ: u32,
    instance: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct TipcNameAddr {
    name: TipcName,
    domain: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct SockaddrTipc {
    family: sa_family_t,
    addrtype: u8,
    scope: i8,
    addr: TipcNameAddr,
}

fn name_addr(typ: u32, instance: u32) -> SockaddrTipc {
    SockaddrTipc {
        family: libc::AF_TIPC as sa_family_t,
        addrtype: TIPC_ADDR_NAME,
        scope: TIPC_CLUSTER_SCOPE,
        addr: TipcNameAddr {
            name: TipcName { typ, instance },
            domain: 0,
        },
    }
}

fn tipc_socket() -> io::Result<RawFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_TIPC,
            libc::SOCK_RDM | libc::SOCK_NONBLOCK,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

pub struct TipcChannel {
    client: RawFd,
    server: RawFd,
    dest: SockaddrTipc,
    stats: ChannelStats,
}

impl TipcChannel {
    pub fn open(conf: &TipcConfig) -> Result<TipcChannel, TransportError> {
        let server = tipc_socket()?;
        let bind_addr = name_addr(conf.server_type, conf.server_instance);
        let rc = unsafe {
            libc::bind(
                server,
                &bind_addr as *const SockaddrTipc as *const libc::sockaddr,
                mem::size_of::<SockaddrTipc>() as socklen_t,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(server) };
            return Err(TransportError::Io(err));
        }

        let client = match tipc_socket() {
            Ok(fd) => fd,
            Err(err) => {
                unsafe { libc::close(server) };
                return Err(TransportError::Io(err));
            }
        };
        let importance = conf.importance as c_int;
        unsafe {
            // Best effort, as in the reference implementations.
            libc::setsockopt(
                client,
                SOL_TIPC,
                TIPC_IMPORTANCE,
                &importance as *const c_int as *const c_void,
                mem::size_of::<c_int>() as socklen_t,
            );
        }

        info!(
            client_type = conf.client_type,
            client_instance = conf.client_instance,
            server_type = conf.server_type,
            server_instance = conf.server_instance,
            "tipc channel up"
        );
        Ok(TipcChannel {
            client,
            server,
            dest: name_addr(conf.client_type, conf.client_instance),
            stats: ChannelStats::default(),
        })
    }
}

impl Channel for TipcChannel {
    fn kind(&self) -> &'static str {
        "tipc"
    }

    fn send(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        let rc = unsafe {
            libc::sendto(
                self.client,
                buf.as_ptr() as *const c_void,
                buf.len(),
                0,
                &self.dest as *const SockaddrTipc as *const libc::sockaddr,
                mem::size_of::<SockaddrTipc>() as socklen_t,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            self.stats.errors += 1;
            return Err(TransportError::Io(err));
        }
        self.stats.bytes_sent += rc as u64;
        self.stats.msgs_sent += 1;
        Ok(rc as usize)
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TransportError> {
        let rc = unsafe {
            libc::recvfrom(
                self.server,
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
                0,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            self.stats.errors += 1;
            return Err(TransportError::Io(err));
        }
        self.stats.bytes_recv += rc as u64;
        self.stats.msgs_recv += 1;
        Ok(Some(rc as usize))
    }

    fn fds(&self) -> Vec<RawFd> {
        vec![self.server]
    }

    fn stats(&self) -> ChannelStats {
        self.stats
    }
}

impl Drop for TipcChannel {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.client);
            libc::close(self.server);
        }
    }
}

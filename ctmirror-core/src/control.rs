//! Local control socket: a UNIX datagram endpoint accepting admin commands
//! and answering with human-readable text.

use crate::error::CoreError;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{SocketAddr, UnixDatagram};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Commands accepted on the control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    DumpInternal,
    DumpInternalXml,
    DumpExternal,
    DumpExternalXml,
    /// Flush every cache.
    FlushCaches,
    FlushInternal,
    FlushExternal,
    /// Force a full replay toward the peer.
    Resync,
    /// Install the external cache into the kernel (failover promotion).
    Commit,
    Kill,
    Stats,
    StatsCache,
}

impl ControlCommand {
    pub fn parse(text: &str) -> Option<ControlCommand> {
        match text.trim() {
            "dump-internal" => Some(ControlCommand::DumpInternal),
            "dump-internal-xml" => Some(ControlCommand::DumpInternalXml),
            "dump-external" => Some(ControlCommand::DumpExternal),
            "dump-external-xml" => Some(ControlCommand::DumpExternalXml),
            "flush" => Some(ControlCommand::FlushCaches),
            "flush-internal" => Some(ControlCommand::FlushInternal),
            "flush-external" => Some(ControlCommand::FlushExternal),
            "resync" => Some(ControlCommand::Resync),
            "commit" => Some(ControlCommand::Commit),
            "kill" => Some(ControlCommand::Kill),
            "stats" => Some(ControlCommand::Stats),
            "stats-cache" => Some(ControlCommand::StatsCache),
            _ => None,
        }
    }

    pub fn wire_name(&self) -> &'static str {
        match self {
            ControlCommand::DumpInternal => "dump-internal",
            ControlCommand::DumpInternalXml => "dump-internal-xml",
            ControlCommand::DumpExternal => "dump-external",
            ControlCommand::DumpExternalXml => "dump-external-xml",
            ControlCommand::FlushCaches => "flush",
            ControlCommand::FlushInternal => "flush-internal",
            ControlCommand::FlushExternal => "flush-external",
            ControlCommand::Resync => "resync",
            ControlCommand::Commit => "commit",
            ControlCommand::Kill => "kill",
            ControlCommand::Stats => "stats",
            ControlCommand::StatsCache => "stats-cache",
        }
    }
}

/// Server end, owned by the daemon.
pub struct ControlSocket {
    sock: UnixDatagram,
    path: PathBuf,
}

impl ControlSocket {
    pub fn bind(path: &Path) -> Result<ControlSocket, CoreError> {
        // A previous daemon may have left its socket behind.
        let _ = std::fs::remove_file(path);
        let sock = UnixDatagram::bind(path)?;
        sock.set_nonblocking(true)?;
        Ok(ControlSocket {
            sock,
            path: path.to_owned(),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    /// Receives one pending command, if any.
    pub fn recv_command(&self) -> Option<(ControlCommand, SocketAddr)> {
        let mut buf = [0u8; 256];
        match self.sock.recv_from(&mut buf) {
            Ok((n, peer)) => {
                let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                match ControlCommand::parse(&text) {
                    Some(cmd) => {
                        debug!(?cmd, "control command");
                        Some((cmd, peer))
                    }
                    None => {
                        warn!(%text, "unknown control command");
                        None
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => None,
            Err(err) => {
                warn!(%err, "control socket recv failed");
                None
            }
        }
    }

    /// Writes a text response back to the requesting client.
    pub fn reply(&self, peer: &SocketAddr, text: &str) {
        let Some(path) = peer.as_pathname() else {
            // Unbound client; nowhere to answer.
            return;
        };
        if let Err(err) = self.sock.send_to(text.as_bytes(), path) {
            warn!(%err, "control reply failed");
        }
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Client end, used by the admin subcommands.
pub struct ControlClient {
    sock: UnixDatagram,
    /// The client binds its own path so the daemon can answer.
    _own_path: PathBuf,
    server: PathBuf,
}

impl ControlClient {
    pub fn connect(server: &Path, own_path: &Path) -> Result<ControlClient, CoreError> {
        let _ = std::fs::remove_file(own_path);
        let sock = UnixDatagram::bind(own_path)?;
        Ok(ControlClient {
            sock,
            _own_path: own_path.to_owned(),
            server: server.to_owned(),
        })
    }

    pub fn request(&self, cmd: ControlCommand) -> Result<String, CoreError> {
        self.sock
            .send_to(cmd.wire_name().as_bytes(), &self.server)?;
        self.sock
            .set_read_timeout(Some(std::time::Duration::from_secs(3)))?;
        let mut buf = vec![0u8; 65536];
        match self.sock.recv(&mut buf) {
            Ok(n) => Ok(String::from_utf8_lossy(&buf[..n]).into_owned()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(String::new()),
            Err(err) if err.kind() == io::ErrorKind::TimedOut => Ok(String::new()),
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self._own_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_names_round_trip() {
        for cmd in [
            ControlCommand::DumpInternal,
            ControlCommand::DumpInternalXml,
            ControlCommand::DumpExternal,
            ControlCommand::DumpExternalXml,
            ControlCommand::FlushCaches,
            ControlCommand::FlushInternal,
            ControlCommand::FlushExternal,
            ControlCommand::Resync,
            ControlCommand::Commit,
            ControlCommand::Kill,
            ControlCommand::Stats,
            ControlCommand::StatsCache,
        ] {
            assert_eq!(ControlCommand::parse(cmd.wire_name()), Some(cmd));
        }
        assert_eq!(ControlCommand::parse("no-such-command"), None);
    }
}

//! Daemon configuration: TOML file plus post-parse validation.

use crate::error::ConfigError;
use ctmirror_sequenced::StrategyKind;
use serde::Deserialize;
use std::fs;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};

fn default_control_socket() -> PathBuf {
    PathBuf::from("/var/run/ctmirrord.ctl")
}

fn default_hello_interval() -> u64 {
    5
}

fn default_netlink_buffer() -> usize {
    262144
}

fn default_window() -> usize {
    128
}

fn default_ack_window() -> u32 {
    64
}

fn default_tick_secs() -> u64 {
    1
}

fn default_port() -> u16 {
    ctmirror_proto::SYNC_PORT
}

fn default_importance() -> u8 {
    0
}

/// Which engine the daemon runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Sync,
    Track,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyName {
    NoTrack,
    Alarm,
    FtFw,
}

impl From<StrategyName> for StrategyKind {
    fn from(name: StrategyName) -> StrategyKind {
        match name {
            StrategyName::NoTrack => StrategyKind::NoTrack,
            StrategyName::Alarm => StrategyKind::Alarm,
            StrategyName::FtFw => StrategyKind::FtFw,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    pub strategy: StrategyName,
    /// Retransmit window: entries kept for NACK service.
    #[serde(default = "default_window")]
    pub resend_window: usize,
    /// In-order messages between implicit ACKs (ft-fw).
    #[serde(default = "default_ack_window")]
    pub ack_window: u32,
    /// Strategy tick period (batched ACK emission).
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> SyncConfig {
        SyncConfig {
            strategy: StrategyName::FtFw,
            resend_window: default_window(),
            ack_window: default_ack_window(),
            tick_secs: default_tick_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct McastConfig {
    pub group: Ipv4Addr,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Address of the local interface joined to the group.
    pub interface: Ipv4Addr,
    #[serde(default)]
    pub sndbuf: Option<usize>,
    #[serde(default)]
    pub rcvbuf: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TcpConfig {
    pub local: SocketAddrV4,
    pub remote: SocketAddrV4,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TipcConfig {
    pub client_type: u32,
    pub client_instance: u32,
    pub server_type: u32,
    pub server_instance: u32,
    #[serde(default = "default_importance")]
    pub importance: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum ChannelConfig {
    Multicast(McastConfig),
    Tcp(TcpConfig),
    Tipc(TipcConfig),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_control_socket")]
    pub control_socket: PathBuf,
    #[serde(default = "default_hello_interval")]
    pub hello_interval_secs: u64,
    /// Kernel-side netlink socket buffer; also feeds the track-mode
    /// divergence heuristic.
    #[serde(default = "default_netlink_buffer")]
    pub netlink_buffer_size: usize,
    /// Polling period for kernels without reliable event delivery.
    #[serde(default)]
    pub poll_secs: Option<u64>,
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub channel: Option<ChannelConfig>,
    /// External cache snapshot written on clean shutdown and reloaded on
    /// start.
    #[serde(default)]
    pub snapshot_file: Option<PathBuf>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = fs::read_to_string(path).map_err(|err| ConfigError::Read {
            path: path.display().to_string(),
            err,
        })?;
        let config: Config = toml::from_str(&text).map_err(|err| ConfigError::Parse {
            path: path.display().to_string(),
            err: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mode == RunMode::Track && self.poll_secs.is_some() {
            // Track needs event-reliable netlink; polling forfeits that.
            return Err(ConfigError::Incompatible(
                "`poll_secs` cannot be used together with track mode",
            ));
        }
        if self.mode == RunMode::Sync && self.channel.is_none() {
            return Err(ConfigError::Invalid {
                field: "channel",
                reason: "sync mode requires a [channel] section".to_owned(),
            });
        }
        if self.sync.resend_window == 0 {
            return Err(ConfigError::Invalid {
                field: "sync.resend_window",
                reason: "must be at least 1".to_owned(),
            });
        }
        Ok(())
    }
}

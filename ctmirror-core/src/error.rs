use std::io;
use thiserror::Error;

/// Errors surfaced by the daemon core.
///
/// Per-message and per-operation failures are logged and recovered; only
/// configuration errors abort startup.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// An allocation, socket or cache insert failed; the operation is
    /// dropped and accounted, the daemon keeps running.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),
    /// A fingerprint collision on cache insert.
    #[error("object already exists in cache")]
    Exists,
    #[error("protocol error from peer: {0}")]
    PeerProtocol(#[from] ctmirror_proto::ProtoError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Fatal-at-startup configuration problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {err}")]
    Read { path: String, err: io::Error },
    #[error("cannot parse {path}: {err}")]
    Parse { path: String, err: String },
    #[error("incompatible options: {0}")]
    Incompatible(&'static str),
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

/// Channel-level failures. `EAGAIN` never reaches this type; it is
/// reported as "no data" by the channel API.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("peer disconnected")]
    Disconnected,
    #[error("channel not connected")]
    NotConnected,
}

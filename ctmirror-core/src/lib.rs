//! # ctmirror-core
//!
//! The daemon core: alarm scheduler, flow caches, transport channels, the
//! sync engine, track-mode reconciliation, the event loop and the local
//! control surface. The kernel conntrack subscription is an injected
//! collaborator; everything else lives here.

pub mod alarm;
pub mod cache;
pub mod channel;
pub mod config;
pub mod control;
pub mod daemon;
pub mod error;
pub mod snapshot;
pub mod source;
pub mod sync;
pub mod track;

pub use alarm::{AlarmId, AlarmScheduler};
pub use cache::{Cache, CacheItem, CacheStats, DumpFormat, ExtraLifecycle, IterVerdict};
pub use channel::{Channel, ChannelStats, MaintainEvent};
pub use config::{Config, RunMode};
pub use control::{ControlClient, ControlCommand, ControlSocket};
pub use daemon::Daemon;
pub use error::{ConfigError, CoreError, TransportError};
pub use source::{CtEvent, KernelSource, MockKernel, NullSource};
pub use sync::{SyncEngine, SyncStats};
pub use track::{TrackMode, TrackToken};

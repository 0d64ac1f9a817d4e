//! # ctmirror-sequenced
//!
//! Reliable-delivery machinery for the sync protocol: the sender-side
//! retransmit queue, the receiver-side sequence tracker, the link liveness
//! handshake and the three synchronization strategies (no-track, batched-ACK
//! alarm, and ft-fw NACK/RESYNC).
//!
//! Everything here is a pure state machine: methods consume parsed headers
//! and return [`Action`] values describing the I/O the caller must perform.
//! The event loop owns the sockets.

pub mod link;
pub mod rtqueue;
pub mod strategy;
pub mod tracker;

pub use link::{LinkEvent, LinkState};
pub use rtqueue::RetransmitQueue;
pub use strategy::{build, Action, AlarmStrategy, FtFw, NoTrack, StrategyKind, SyncStrategy};
pub use tracker::{RecvTracker, SeqClass};

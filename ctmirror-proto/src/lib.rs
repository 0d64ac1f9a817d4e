//! # ctmirror-proto
//!
//! Wire format for the connection-tracking state-sync protocol.
//!
//! A sync stream is a sequence of framed messages. Each message starts with
//! a fixed [`NetHdr`]; control messages carrying ACK/NACK/RESYNC flags extend
//! it with `from`/`to` sequence bounds. Data messages append a list of
//! attribute TLVs describing one flow or one expectation.
//!
//! This crate is pure: it owns the byte layout, the attribute tables and the
//! sequence-number arithmetic, and performs no I/O.

pub mod attr;
pub mod codec;
pub mod error;
pub mod expect;
pub mod flow;
pub mod seq;
pub mod wire;

pub use attr::{CtAttr, ExpAttr};
pub use codec::{decode_payload, encode_ctl, encode_expectation, encode_flow, FrameIter, Payload};
pub use error::ProtoError;
pub use expect::{Expectation, Tuple};
pub use flow::{Flow, FlowKey, IpPair, L4Info, PortPair};
pub use seq::SeqNum;
pub use wire::{AckBounds, MsgType, NetFlags, NetHdr, NETHDR_ACK_SIZ, NETHDR_SIZ};

/// Protocol version carried in every [`NetHdr`]. Bump on any incompatible
/// change to the header or attribute layout.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default port the sync stream runs on, for TCP and UDP transports.
pub const SYNC_PORT: u16 = 3780;

/// Helper names are NUL-terminated strings of at most this many octets.
pub const HELPER_NAME_MAX: usize = 16;

/// Expectation `fn` strings are bounded by this many octets.
pub const EXPECT_FN_MAX: usize = 32;

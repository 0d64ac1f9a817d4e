use thiserror::Error;

/// Errors raised while encoding or decoding sync messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtoError {
    #[error("truncated header ({0} bytes remain)")]
    TruncatedHeader(usize),
    #[error("bad header length {0}")]
    BadLength(u16),
    #[error("truncated packet (header claims {claimed}, {remain} remain)")]
    TruncatedPacket { claimed: u16, remain: usize },
    #[error("truncated ACK header")]
    TruncatedAck,
    #[error("malformed payload: {0}")]
    MalformedPayload(&'static str),
    #[error("unknown message type {0}")]
    UnknownType(u8),
    /// Variable-length string attribute exceeds its declared maximum.
    #[error("attribute {attr} too long ({len} > {max})")]
    AttrTooLong { attr: u16, len: usize, max: usize },
}

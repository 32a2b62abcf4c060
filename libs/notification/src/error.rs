//! Error types for the codec and node directory.

use thiserror::Error;
use ubot_id::NodeNumber;

/// Errors that can occur when encoding or decoding packets.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The buffer ended before a field could be read.
    #[error("truncated input: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    /// The packet type byte is not recognized.
    #[error("unknown packet type: {0}")]
    UnknownPacketType(u8),

    /// The sender is not in the local network configuration.
    #[error("unknown sender node: {0}")]
    UnknownSender(NodeNumber),

    /// The declared notification count is negative or too large.
    #[error("invalid notification count: {0}")]
    InvalidCount(i64),

    /// No handler is registered for this type code.
    #[error("unknown notification type code: {0}")]
    UnknownTypeCode(u16),

    /// A field holds a value its type does not allow.
    #[error("invalid field: {0}")]
    InvalidField(String),

    /// Bytes were left over after the declared content.
    #[error("{0} trailing bytes after packet content")]
    TrailingBytes(usize),

    /// A notification inside the packet failed to decode.
    #[error("notification #{index} is malformed: {source}")]
    Notification {
        index: usize,
        #[source]
        source: Box<CodecError>,
    },
}

/// Errors that can occur when loading the network configuration.
#[derive(Debug, Error)]
pub enum NetConfigError {
    /// The configuration file could not be read.
    #[error("failed to read network config: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration is not valid JSON.
    #[error("invalid network config: {0}")]
    Json(#[from] serde_json::Error),

    /// Two descriptors share a node number.
    #[error("duplicate node number in network config: {0}")]
    DuplicateNode(NodeNumber),

    /// The configuration lists no nodes.
    #[error("network config is empty")]
    Empty,
}

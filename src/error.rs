//! Error types for the node core.
//!
//! Every failure is mapped to one of a small set of kinds so callers can
//! pick a policy per kind: close the peer (protocol), close the transfer
//! (I/O), or report back to the user (not-connected, invalid input).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NodeError>;

#[derive(Debug, Error)]
pub enum NodeError {
    /// Socket or file I/O failure. Closes the affected peer or transfer.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed frame, bad magic, CRC mismatch, oversize field, or a
    /// message out of protocol order. Closes the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The addressed peer has no live connection.
    #[error("peer not connected: {0}")]
    NotConnected(String),

    /// Unusable user input (unknown group, missing file, bad argument).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A file, chunk, or name exceeds the protocol bounds on the send side.
    #[error("resource limit: {0}")]
    ResourceLimit(String),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NodeError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        NodeError::Protocol(msg.into())
    }
}

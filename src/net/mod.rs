//! Peer connections and the connection manager.
//!
//! One reader task per peer, one accept loop, writes from any task
//! serialized by a per-peer mutex held for exactly one frame. The manager
//! owns the peer index and every receive session, and routes parsed
//! frames to messaging, groups, or file transfer.

pub mod manager;
pub mod peer;

pub use manager::{Node, NodeConfig, NodeEvent, TCP_PORT};
pub use peer::{CloseReason, Peer, PeerInfo};

//! Serverless LAN peer-to-peer messaging and file transfer.
//!
//! A node discovers others on the local network over UDP broadcast, keeps
//! long-lived TCP connections to them, and exchanges direct messages,
//! master-relayed group messages, and checksummed file transfers over a
//! hybrid JSON/binary stream. No central server, no internet.
//!
//! ```text
//! socket bytes -> frame codec -> peer read loop -> Node dispatch
//!              -> messaging | group engine | file receiver -> history + events
//! ```

pub mod discovery;
pub mod error;
pub mod group;
pub mod identity;
pub mod net;
pub mod protocol;
pub mod storage;
pub mod transfer;

pub use discovery::{run_discovery, Discovered, DISCOVERY_PORT};
pub use error::{NodeError, Result};
pub use identity::Identity;
pub use net::{Node, NodeConfig, NodeEvent, TCP_PORT};
pub use storage::ChatStore;
pub use transfer::TransferMode;

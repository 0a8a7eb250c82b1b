//! File transfer: a lazy frame-producing sender and a disk-backed
//! reassembling receiver.
//!
//! The binary path streams raw 512 KiB chunks; the legacy JSON path keeps
//! 64 KiB base64 chunks for interop with older peers. Both produce the
//! same receive sessions on the far side.

pub mod receiver;
pub mod sender;

pub use receiver::{sanitize_filename, ReceiveSession};
pub use sender::{FileSender, TransferMode};

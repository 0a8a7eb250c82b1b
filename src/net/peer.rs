//! One live TCP peer.
//!
//! The write half sits behind an async mutex so concurrent senders (chat,
//! group relay, file chunks) interleave only at frame boundaries: the lock
//! is held for one complete `write_all` and never across multiple frames.
//! Reads happen in a dedicated task owned by the manager.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex as StdMutex, RwLock};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{watch, Mutex};

use crate::error::{NodeError, Result};
use crate::protocol::envelope::Envelope;
use crate::protocol::frame;

/// Identity a peer presented in its handshake.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub device_id: String,
    pub device_name: String,
    pub platform: String,
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Clean EOF at a frame boundary.
    Eof,
    /// Socket I/O failure.
    Io(String),
    /// Malformed or out-of-order traffic.
    Protocol(String),
    /// A newer connection from the same device id took over.
    Replaced,
    /// Local shutdown.
    Shutdown,
}

pub struct Peer {
    pub addr: SocketAddr,
    pub outbound: bool,
    info: RwLock<Option<PeerInfo>>,
    writer: Mutex<OwnedWriteHalf>,
    closed: AtomicBool,
    close_reason: StdMutex<Option<CloseReason>>,
    // watch, not Notify: a close that lands before the read loop registers
    // its waiter must still be observed.
    close_tx: watch::Sender<bool>,
}

impl Peer {
    pub fn new(addr: SocketAddr, outbound: bool, writer: OwnedWriteHalf) -> Self {
        let (close_tx, _) = watch::channel(false);
        Self {
            addr,
            outbound,
            info: RwLock::new(None),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
            close_reason: StdMutex::new(None),
            close_tx,
        }
    }

    pub fn info(&self) -> Option<PeerInfo> {
        self.info.read().unwrap().clone()
    }

    pub fn device_id(&self) -> Option<String> {
        self.info.read().unwrap().as_ref().map(|i| i.device_id.clone())
    }

    pub fn set_info(&self, info: PeerInfo) {
        *self.info.write().unwrap() = Some(info);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Mark the peer closed. Idempotent and callable from any task; the
    /// first caller's reason wins and the read loop is woken. Subsequent
    /// writes fail fast.
    pub fn close(&self, reason: CloseReason) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            *self.close_reason.lock().unwrap() = Some(reason);
        }
        // send_replace updates the value even when no reader is subscribed
        // yet; the read loop re-checks the flag before each frame.
        self.close_tx.send_replace(true);
    }

    pub(crate) fn close_reason(&self) -> CloseReason {
        self.close_reason
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(CloseReason::Eof)
    }

    pub(crate) fn close_signal(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }

    /// Write one complete frame. Either the whole frame reaches the socket
    /// or the peer is closed; a partial write never leaves the connection
    /// usable.
    pub async fn send_bytes(&self, frame: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(NodeError::NotConnected(self.describe()));
        }
        let mut writer = self.writer.lock().await;
        if self.is_closed() {
            return Err(NodeError::NotConnected(self.describe()));
        }
        if let Err(e) = writer.write_all(frame).await {
            self.close(CloseReason::Io(e.to_string()));
            return Err(e.into());
        }
        Ok(())
    }

    /// Frame and send a JSON envelope.
    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        let frame = frame::encode_json(envelope)?;
        self.send_bytes(&frame).await
    }

    fn describe(&self) -> String {
        self.device_id().unwrap_or_else(|| self.addr.to_string())
    }
}

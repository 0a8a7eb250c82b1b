//! Connection manager: peer lifecycle, routing, messaging, groups, files.
//!
//! The `Node` accepts inbound sockets, dials discovered peers, runs one
//! read loop per connection, and routes every parsed frame to direct
//! messaging, the group engine, or a file-receive session. UI-facing
//! activity surfaces on a single event channel.
//!
//! Locking: the peer index and group state use short critical sections and
//! are never held across a socket write; sends go to a snapshot taken
//! under the lock. Receive sessions live behind an async mutex because
//! chunk writes await disk I/O.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::discovery::Discovered;
use crate::error::{NodeError, Result};
use crate::group::{self, GroupRecord};
use crate::identity::Identity;
use crate::protocol::envelope::{
    self, Envelope, FileChunkPayload, FileMetaPayload, GroupInvitePayload, GroupJoinAckPayload,
    GroupJoinPayload, GroupJoinRejectPayload, GroupMasterPayload, GroupMessagePayload,
    MessagePayload,
};
use crate::protocol::frame::{self, FileId, Frame, MAX_CHUNK_SIZE};
use crate::storage::ChatStore;
use crate::transfer::{FileSender, ReceiveSession, TransferMode};

use super::peer::{CloseReason, Peer, PeerInfo};

use base64::Engine as _;

/// Default TCP port for peer connections.
pub const TCP_PORT: u16 = 60000;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const HISTORY_TAIL: usize = 20;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Port to listen on; 0 picks a free port (used by tests).
    pub tcp_port: u16,
    /// Where completed incoming files land.
    pub received_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            tcp_port: TCP_PORT,
            received_dir: PathBuf::from("received"),
        }
    }
}

/// Everything the UI layer can observe.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    PeerConnected { device_id: String, device_name: String },
    PeerDisconnected { device_id: String },
    Discovered { device_id: String, device_name: String, ip: String, tcp_port: u16 },
    DirectMessage { device_id: String, text: String },
    GroupMessage { group_id: String, device_id: String, text: String },
    GroupInvite { group_id: String, name: String, master_id: String, inviter_id: String },
    GroupNotice { text: String },
    SendProgress { device_id: String, filename: String, bytes_sent: u64, total: u64 },
    ReceiveProgress { device_id: String, filename: String, bytes_written: u64, total: u64 },
    FileSent { device_id: String, filename: String },
    FileReceived { device_id: String, filename: String, path: PathBuf },
    TransferFailed { device_id: String, filename: String },
}

pub struct Node {
    identity: Identity,
    config: NodeConfig,
    store: Arc<ChatStore>,
    peers: StdMutex<HashMap<String, Arc<Peer>>>,
    sessions: Mutex<HashMap<(String, FileId), ReceiveSession>>,
    pending_invites: StdMutex<HashMap<String, GroupInvitePayload>>,
    seen_group_messages: StdMutex<HashSet<String>>,
    discovered: StdMutex<HashMap<String, Discovered>>,
    dialing: StdMutex<HashSet<String>>,
    events: mpsc::UnboundedSender<NodeEvent>,
    local_port: OnceLock<u16>,
    shutdown_tx: watch::Sender<bool>,
}

impl Node {
    pub fn new(
        identity: Identity,
        config: NodeConfig,
        store: Arc<ChatStore>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<NodeEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let node = Arc::new(Self {
            identity,
            config,
            store,
            peers: StdMutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            pending_invites: StdMutex::new(HashMap::new()),
            seen_group_messages: StdMutex::new(HashSet::new()),
            discovered: StdMutex::new(HashMap::new()),
            dialing: StdMutex::new(HashSet::new()),
            events,
            local_port: OnceLock::new(),
            shutdown_tx,
        });
        (node, events_rx)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Bind the listener, start accepting, and start dialing discovered
    /// peers. Returns the bound port.
    pub async fn start(
        self: &Arc<Self>,
        discovery: Option<mpsc::UnboundedReceiver<Discovered>>,
    ) -> Result<u16> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.tcp_port)).await?;
        let port = listener.local_addr()?.port();
        let _ = self.local_port.set(port);
        info!(port, device_id = %self.identity.device_id, "node listening");

        let node = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            debug!(%addr, "inbound connection");
                            node.spawn_peer(stream, addr, false);
                        }
                        Err(e) => {
                            warn!("accept failed: {e}");
                        }
                    }
                }
            }
        });

        if let Some(mut rx) = discovery {
            let node = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        item = rx.recv() => match item {
                            Some(found) => node.handle_discovered(found),
                            None => break,
                        }
                    }
                }
            });
        }

        Ok(port)
    }

    pub fn local_port(&self) -> Option<u16> {
        self.local_port.get().copied()
    }

    /// Dial a peer and initiate the handshake.
    pub async fn connect(self: &Arc<Self>, ip: &str, port: u16) -> Result<()> {
        let addr: SocketAddr = format!("{ip}:{port}")
            .parse()
            .map_err(|e| NodeError::InvalidInput(format!("bad address {ip}:{port}: {e}")))?;
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| NodeError::NotConnected(format!("{addr}: connect timed out")))??;
        let peer = self.spawn_peer(stream, addr, true);
        peer.send_envelope(&self.envelope(envelope::MSG_HANDSHAKE, serde_json::Value::Null))
            .await
    }

    /// Snapshot of handshook peers.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers
            .lock()
            .unwrap()
            .values()
            .filter_map(|p| p.info())
            .collect()
    }

    /// Latest sighting per discovered device.
    pub fn discoveries(&self) -> Vec<Discovered> {
        self.discovered.lock().unwrap().values().cloned().collect()
    }

    pub fn groups(&self) -> HashMap<String, GroupRecord> {
        self.store.groups()
    }

    pub fn direct_history(&self, peer_id: &str) -> Result<Vec<Envelope>> {
        self.store.read_direct(peer_id, HISTORY_TAIL)
    }

    pub fn group_history(&self, group_id: &str) -> Result<Vec<Envelope>> {
        self.store.read_group(group_id, HISTORY_TAIL)
    }

    /// Send a 1:1 text message and append it to our own history.
    pub async fn send_direct(&self, peer_id: &str, text: &str) -> Result<()> {
        let peer = self
            .peer(peer_id)
            .ok_or_else(|| NodeError::NotConnected(peer_id.to_string()))?;
        let payload = MessagePayload {
            message_id: uuid::Uuid::new_v4().to_string(),
            text: text.to_string(),
        };
        let env = self.envelope(envelope::MSG_MESSAGE, serde_json::to_value(&payload)?);
        peer.send_envelope(&env).await?;
        self.store.append_direct(peer_id, &env)
    }

    /// Begin a binary file transfer. Validation is synchronous; the frames
    /// stream from a background task, reporting progress as events.
    pub async fn send_file(self: &Arc<Self>, peer_id: &str, path: &std::path::Path) -> Result<()> {
        self.send_file_with(peer_id, path, TransferMode::Binary).await
    }

    pub async fn send_file_with(
        self: &Arc<Self>,
        peer_id: &str,
        path: &std::path::Path,
        mode: TransferMode,
    ) -> Result<()> {
        let peer = self
            .peer(peer_id)
            .ok_or_else(|| NodeError::NotConnected(peer_id.to_string()))?;
        let mut sender = FileSender::open(path, mode, self.identity.clone()).await?;
        let node = self.clone();
        let device_id = peer_id.to_string();
        tokio::spawn(async move {
            let filename = sender.filename().to_string();
            let mut last_reported = 0u64;
            loop {
                match sender.next_frame().await {
                    Ok(Some(frame)) => {
                        if let Err(e) = peer.send_bytes(&frame).await {
                            warn!("transfer to {device_id} failed: {e}");
                            node.emit(NodeEvent::TransferFailed {
                                device_id,
                                filename,
                            });
                            return;
                        }
                        let (sent, total) = sender.progress();
                        if sent > last_reported {
                            last_reported = sent;
                            node.emit(NodeEvent::SendProgress {
                                device_id: device_id.clone(),
                                filename: filename.clone(),
                                bytes_sent: sent,
                                total,
                            });
                        }
                    }
                    Ok(None) => {
                        node.emit(NodeEvent::FileSent {
                            device_id,
                            filename,
                        });
                        return;
                    }
                    Err(e) => {
                        warn!("reading outbound file failed: {e}");
                        node.emit(NodeEvent::TransferFailed {
                            device_id,
                            filename,
                        });
                        return;
                    }
                }
            }
        });
        Ok(())
    }

    // -- groups ------------------------------------------------------------

    /// Create a group mastered by this node and announce it to the
    /// connected initial members.
    pub async fn create_group(&self, name: &str, initial_members: &[String]) -> Result<String> {
        let mut members: BTreeSet<String> =
            initial_members.iter().filter(|m| !m.is_empty()).cloned().collect();
        members.insert(self.identity.device_id.clone());
        let record = GroupRecord::new(name, members, self.identity.device_id.clone());
        let group_id = self.store.create_group(record)?;
        self.broadcast_group_master(&group_id).await;
        Ok(group_id)
    }

    /// Offer membership to a connected peer. Master-only.
    pub async fn invite(&self, group_id: &str, peer_id: &str) -> Result<()> {
        let record = self
            .store
            .group(group_id)
            .ok_or_else(|| NodeError::InvalidInput(format!("unknown group {group_id}")))?;
        if record.master_id != self.identity.device_id {
            return Err(NodeError::InvalidInput(
                "only the master can invite".to_string(),
            ));
        }
        let peer = self
            .peer(peer_id)
            .ok_or_else(|| NodeError::NotConnected(peer_id.to_string()))?;
        let payload = GroupInvitePayload {
            group_id: group_id.to_string(),
            name: record.name,
            master_id: self.identity.device_id.clone(),
            inviter_id: self.identity.device_id.clone(),
        };
        peer.send_envelope(
            &self.envelope(envelope::MSG_GROUP_INVITE, serde_json::to_value(&payload)?),
        )
        .await
    }

    /// Accept a pending invite: adopt provisional local state and ask the
    /// master to add us. The master's ack carries the authoritative record.
    pub async fn accept_invite(&self, group_id: &str) -> Result<()> {
        let invite = self
            .pending_invites
            .lock()
            .unwrap()
            .remove(group_id)
            .ok_or_else(|| NodeError::InvalidInput(format!("no pending invite for {group_id}")))?;

        let members: BTreeSet<String> = [
            self.identity.device_id.clone(),
            invite.master_id.clone(),
        ]
        .into_iter()
        .collect();
        self.store.upsert_group(
            group_id,
            GroupRecord::new(invite.name.clone(), members, invite.master_id.clone()),
        )?;

        let master = match self.peer(&invite.master_id) {
            Some(peer) => peer,
            None => {
                // Keep the invite so the user can retry once the master is back.
                self.pending_invites
                    .lock()
                    .unwrap()
                    .insert(group_id.to_string(), invite.clone());
                return Err(NodeError::NotConnected(invite.master_id));
            }
        };
        let payload = GroupJoinPayload {
            group_id: group_id.to_string(),
            name: invite.name,
            from_id: self.identity.device_id.clone(),
        };
        master
            .send_envelope(&self.envelope(envelope::MSG_GROUP_JOIN, serde_json::to_value(&payload)?))
            .await
    }

    /// Decline a pending invite, telling the master.
    pub async fn reject_invite(&self, group_id: &str) -> Result<()> {
        let invite = self
            .pending_invites
            .lock()
            .unwrap()
            .remove(group_id)
            .ok_or_else(|| NodeError::InvalidInput(format!("no pending invite for {group_id}")))?;
        let master = self
            .peer(&invite.master_id)
            .ok_or(NodeError::NotConnected(invite.master_id))?;
        let payload = GroupJoinRejectPayload {
            group_id: group_id.to_string(),
            from_id: self.identity.device_id.clone(),
        };
        master
            .send_envelope(
                &self.envelope(envelope::MSG_GROUP_JOIN_REJECT, serde_json::to_value(&payload)?),
            )
            .await
    }

    /// Send a group message through the effective master, electing a new
    /// one locally if the recorded master is unreachable.
    pub async fn send_group(&self, group_id: &str, text: &str) -> Result<()> {
        let record = self
            .store
            .group(group_id)
            .ok_or_else(|| NodeError::InvalidInput(format!("unknown group {group_id}")))?;
        let self_id = self.identity.device_id.clone();

        let connected: HashSet<String> = self.peers.lock().unwrap().keys().cloned().collect();
        let mut active: BTreeSet<String> = record
            .members
            .iter()
            .filter(|m| connected.contains(*m))
            .cloned()
            .collect();
        active.insert(self_id.clone());

        let mut master_id = record.master_id.clone();
        if !active.contains(&master_id) {
            // The recorded master is gone. Every member runs this same rule
            // locally, so no election traffic is needed.
            master_id = group::elect_master(&active).unwrap_or_else(|| self_id.clone());
            let epoch = group::next_epoch(record.epoch);
            self.store.update_group(group_id, |g| {
                g.master_id = master_id.clone();
                g.epoch = epoch;
                g.members.insert(self_id.clone());
            })?;
            info!(group_id, master = %master_id, epoch, "elected new group master");
        }

        let payload = GroupMessagePayload {
            group_id: group_id.to_string(),
            message_id: uuid::Uuid::new_v4().to_string(),
            text: text.to_string(),
            from_id: self_id.clone(),
        };
        let env = self.envelope(envelope::MSG_GROUP_MESSAGE, serde_json::to_value(&payload)?);

        // Mark our own id seen so a relay echo cannot double-store it.
        self.seen_group_messages
            .lock()
            .unwrap()
            .insert(payload.message_id.clone());
        self.store.append_group(group_id, &env)?;

        if master_id == self_id {
            self.relay_group_message(group_id, &env, &self_id).await;
            Ok(())
        } else {
            let master = self
                .peer(&master_id)
                .ok_or(NodeError::NotConnected(master_id))?;
            master.send_envelope(&env).await
        }
    }

    /// Stop accepting, close every peer, and end the background tasks.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let peers: Vec<Arc<Peer>> = self.peers.lock().unwrap().values().cloned().collect();
        for peer in peers {
            peer.close(CloseReason::Shutdown);
        }
    }

    // -- connection plumbing ----------------------------------------------

    fn spawn_peer(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr, outbound: bool) -> Arc<Peer> {
        let (read_half, write_half) = stream.into_split();
        let peer = Arc::new(Peer::new(addr, outbound, write_half));
        let node = self.clone();
        let reader_peer = peer.clone();
        tokio::spawn(async move {
            node.read_loop(reader_peer, read_half).await;
        });
        peer
    }

    async fn read_loop(self: Arc<Self>, peer: Arc<Peer>, read_half: OwnedReadHalf) {
        let mut reader = tokio::io::BufReader::new(read_half);
        let mut close_rx = peer.close_signal();
        let mut handshook = false;

        loop {
            if peer.is_closed() {
                break;
            }
            tokio::select! {
                _ = close_rx.changed() => break,
                result = frame::read_frame(&mut reader) => match result {
                    Ok(None) => {
                        peer.close(CloseReason::Eof);
                        break;
                    }
                    Ok(Some(frame)) => {
                        if !handshook {
                            match frame {
                                Frame::Json(env) if env.kind == envelope::MSG_HANDSHAKE => {
                                    handshook = true;
                                    self.handle_handshake(&peer, env).await;
                                }
                                _ => {
                                    warn!(addr = %peer.addr, "traffic before handshake");
                                    peer.close(CloseReason::Protocol(
                                        "message before handshake".to_string(),
                                    ));
                                    break;
                                }
                            }
                        } else if let Err(e) = self.dispatch(&peer, frame).await {
                            match e {
                                NodeError::Protocol(msg) => {
                                    warn!(addr = %peer.addr, "protocol violation: {msg}");
                                    peer.close(CloseReason::Protocol(msg));
                                    break;
                                }
                                other => warn!(addr = %peer.addr, "dispatch error: {other}"),
                            }
                        }
                    }
                    Err(NodeError::Protocol(msg)) => {
                        warn!(addr = %peer.addr, "protocol violation: {msg}");
                        peer.close(CloseReason::Protocol(msg));
                        break;
                    }
                    Err(NodeError::Io(e)) => {
                        peer.close(CloseReason::Io(e.to_string()));
                        break;
                    }
                    Err(other) => {
                        peer.close(CloseReason::Protocol(other.to_string()));
                        break;
                    }
                }
            }
        }

        self.handle_closed(&peer).await;
    }

    async fn handle_handshake(&self, peer: &Arc<Peer>, env: Envelope) {
        let info = PeerInfo {
            device_id: env.device_id.clone(),
            device_name: env.device_name.clone(),
            platform: env.platform.clone(),
        };
        peer.set_info(info.clone());

        let replaced = self
            .peers
            .lock()
            .unwrap()
            .insert(info.device_id.clone(), peer.clone());
        if let Some(old) = replaced {
            if !Arc::ptr_eq(&old, peer) {
                info!(device_id = %info.device_id, "newer connection replaces older");
                old.close(CloseReason::Replaced);
            }
        }

        info!(device_id = %info.device_id, name = %info.device_name, "peer connected");
        self.emit(NodeEvent::PeerConnected {
            device_id: info.device_id.clone(),
            device_name: info.device_name.clone(),
        });

        // A reconnecting member resynchronizes from the groups we master.
        self.send_group_state(&info.device_id).await;

        if !peer.outbound {
            let reply = self.envelope(envelope::MSG_HANDSHAKE, serde_json::Value::Null);
            if let Err(e) = peer.send_envelope(&reply).await {
                warn!("handshake reply failed: {e}");
            }
        }
    }

    async fn handle_closed(&self, peer: &Arc<Peer>) {
        let reason = peer.close_reason();
        let Some(device_id) = peer.device_id() else {
            debug!(addr = %peer.addr, ?reason, "connection closed before handshake");
            return;
        };

        let removed = {
            let mut peers = self.peers.lock().unwrap();
            match peers.get(&device_id) {
                Some(current) if Arc::ptr_eq(current, peer) => {
                    peers.remove(&device_id);
                    true
                }
                _ => false,
            }
        };

        // Any transfer in flight from this peer is dead with it.
        let orphaned: Vec<ReceiveSession> = {
            let mut sessions = self.sessions.lock().await;
            let keys: Vec<(String, FileId)> = sessions
                .keys()
                .filter(|(id, _)| *id == device_id)
                .cloned()
                .collect();
            keys.into_iter().filter_map(|k| sessions.remove(&k)).collect()
        };
        for session in orphaned {
            self.emit(NodeEvent::TransferFailed {
                device_id: device_id.clone(),
                filename: session.filename().to_string(),
            });
        }

        if removed {
            info!(device_id = %device_id, ?reason, "peer disconnected");
            self.emit(NodeEvent::PeerDisconnected { device_id });
        }
    }

    // -- dispatch ----------------------------------------------------------

    async fn dispatch(&self, peer: &Arc<Peer>, frame: Frame) -> Result<()> {
        match frame {
            Frame::Json(env) => self.dispatch_envelope(peer, env).await,
            Frame::FileMeta(meta) => {
                if meta.compression != 0 {
                    return Err(NodeError::protocol(format!(
                        "unsupported compression flag 0x{:02x}",
                        meta.compression
                    )));
                }
                let device_id = self.sender_id(peer)?;
                self.open_session(&device_id, meta.file_id, &meta.filename, meta.size)
                    .await
            }
            Frame::FileChunk(chunk) => {
                let device_id = self.sender_id(peer)?;
                self.feed_session(&device_id, chunk.file_id, chunk.index, &chunk.data)
                    .await
            }
        }
    }

    async fn dispatch_envelope(&self, peer: &Arc<Peer>, env: Envelope) -> Result<()> {
        match env.kind.as_str() {
            envelope::MSG_HANDSHAKE => {
                // Repeat handshake refreshes the peer's identity fields.
                peer.set_info(PeerInfo {
                    device_id: env.device_id,
                    device_name: env.device_name,
                    platform: env.platform,
                });
                Ok(())
            }
            envelope::MSG_MESSAGE => {
                let payload: MessagePayload = match env.payload_as() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("dropping malformed message: {e}");
                        return Ok(());
                    }
                };
                self.store.append_direct(&env.device_id, &env)?;
                self.emit(NodeEvent::DirectMessage {
                    device_id: env.device_id.clone(),
                    text: payload.text,
                });
                Ok(())
            }
            envelope::MSG_GROUP_MASTER => self.handle_group_master(env),
            envelope::MSG_GROUP_INVITE => {
                let payload: GroupInvitePayload = match env.payload_as() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("dropping malformed invite: {e}");
                        return Ok(());
                    }
                };
                self.pending_invites
                    .lock()
                    .unwrap()
                    .insert(payload.group_id.clone(), payload.clone());
                self.emit(NodeEvent::GroupInvite {
                    group_id: payload.group_id,
                    name: payload.name,
                    master_id: payload.master_id,
                    inviter_id: payload.inviter_id,
                });
                Ok(())
            }
            envelope::MSG_GROUP_JOIN => self.handle_group_join(env).await,
            envelope::MSG_GROUP_JOIN_ACK => {
                let payload: GroupJoinAckPayload = match env.payload_as() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("dropping malformed join ack: {e}");
                        return Ok(());
                    }
                };
                let mut members: BTreeSet<String> = payload.members.into_iter().collect();
                members.insert(payload.master_id.clone());
                self.store.upsert_group(
                    &payload.group_id,
                    GroupRecord {
                        name: payload.name,
                        members,
                        master_id: payload.master_id,
                        epoch: payload.epoch,
                    },
                )?;
                self.emit(NodeEvent::GroupNotice {
                    text: format!("joined group {}", payload.group_id),
                });
                Ok(())
            }
            envelope::MSG_GROUP_JOIN_REJECT => {
                if let Ok(payload) = env.payload_as::<GroupJoinRejectPayload>() {
                    self.emit(NodeEvent::GroupNotice {
                        text: format!("invite rejected for {} by {}", payload.group_id, payload.from_id),
                    });
                }
                Ok(())
            }
            envelope::MSG_GROUP_MESSAGE => self.handle_group_message(env).await,
            envelope::MSG_FILE_META => {
                // Legacy JSON path.
                let payload: FileMetaPayload = match env.payload_as() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("dropping malformed file_meta: {e}");
                        return Ok(());
                    }
                };
                let device_id = self.sender_id(peer)?;
                let file_id = frame::file_id_from_str(&payload.file_id);
                self.open_session(&device_id, file_id, &payload.filename, payload.size)
                    .await
            }
            envelope::MSG_FILE_CHUNK => {
                let payload: FileChunkPayload = match env.payload_as() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("dropping malformed file_chunk: {e}");
                        return Ok(());
                    }
                };
                let data = base64::engine::general_purpose::STANDARD
                    .decode(&payload.data)
                    .map_err(|e| NodeError::protocol(format!("bad base64 chunk: {e}")))?;
                if data.len() > MAX_CHUNK_SIZE as usize {
                    return Err(NodeError::protocol(format!(
                        "chunk of {} bytes exceeds {} byte limit",
                        data.len(),
                        MAX_CHUNK_SIZE
                    )));
                }
                let device_id = self.sender_id(peer)?;
                let file_id = frame::file_id_from_str(&payload.file_id);
                self.feed_session(&device_id, file_id, payload.chunk_index, &data)
                    .await
            }
            other => {
                warn!("dropping message of unknown type {other:?}");
                Ok(())
            }
        }
    }

    // -- group handlers ----------------------------------------------------

    fn handle_group_master(&self, env: Envelope) -> Result<()> {
        let payload: GroupMasterPayload = match env.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!("dropping malformed group_master: {e}");
                return Ok(());
            }
        };
        let local = self.store.group(&payload.group_id);
        if !group::accepts_announcement(local.as_ref(), &payload.master_id, payload.epoch) {
            debug!(group_id = %payload.group_id, "ignoring stale group_master");
            return Ok(());
        }
        let mut members: BTreeSet<String> = payload.members.into_iter().collect();
        members.insert(payload.master_id.clone());
        self.store.upsert_group(
            &payload.group_id,
            GroupRecord {
                name: payload.name,
                members,
                master_id: payload.master_id,
                epoch: payload.epoch,
            },
        )
    }

    async fn handle_group_join(&self, env: Envelope) -> Result<()> {
        let payload: GroupJoinPayload = match env.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!("dropping malformed group_join: {e}");
                return Ok(());
            }
        };
        let Some(record) = self.store.group(&payload.group_id) else {
            return Ok(());
        };
        if record.master_id != self.identity.device_id {
            return Ok(());
        }

        let epoch = group::next_epoch(record.epoch);
        self.store.update_group(&payload.group_id, |g| {
            g.members.insert(payload.from_id.clone());
            g.epoch = epoch;
        })?;
        let record = self
            .store
            .group(&payload.group_id)
            .ok_or_else(|| NodeError::InvalidInput("group vanished".to_string()))?;

        if let Some(joiner) = self.peer(&payload.from_id) {
            let ack = GroupJoinAckPayload {
                group_id: payload.group_id.clone(),
                name: record.name.clone(),
                members: record.members.iter().cloned().collect(),
                master_id: self.identity.device_id.clone(),
                epoch: record.epoch,
            };
            let env = self.envelope(envelope::MSG_GROUP_JOIN_ACK, serde_json::to_value(&ack)?);
            if let Err(e) = joiner.send_envelope(&env).await {
                warn!("join ack failed: {e}");
            }
        }

        self.broadcast_group_master(&payload.group_id).await;
        self.emit(NodeEvent::GroupNotice {
            text: format!("member joined {}: {}", payload.group_id, payload.from_id),
        });
        Ok(())
    }

    async fn handle_group_message(&self, env: Envelope) -> Result<()> {
        let payload: GroupMessagePayload = match env.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!("dropping malformed group_message: {e}");
                return Ok(());
            }
        };

        // Idempotent application: a relayed duplicate is dropped.
        if !self
            .seen_group_messages
            .lock()
            .unwrap()
            .insert(payload.message_id.clone())
        {
            debug!(message_id = %payload.message_id, "duplicate group message");
            return Ok(());
        }

        self.store.append_group(&payload.group_id, &env)?;

        if let Some(record) = self.store.group(&payload.group_id) {
            if record.master_id == self.identity.device_id {
                self.relay_group_message(&payload.group_id, &env, &payload.from_id)
                    .await;
            }
        }

        self.emit(NodeEvent::GroupMessage {
            group_id: payload.group_id,
            device_id: payload.from_id,
            text: payload.text,
        });
        Ok(())
    }

    /// Forward a group message to every connected member except the
    /// original sender and ourselves.
    async fn relay_group_message(&self, group_id: &str, env: &Envelope, exclude: &str) {
        let Some(record) = self.store.group(group_id) else {
            return;
        };
        let targets: Vec<Arc<Peer>> = {
            let peers = self.peers.lock().unwrap();
            record
                .members
                .iter()
                .filter(|m| m.as_str() != exclude && **m != self.identity.device_id)
                .filter_map(|m| peers.get(m).cloned())
                .collect()
        };
        for peer in targets {
            if let Err(e) = peer.send_envelope(env).await {
                warn!("group relay failed: {e}");
            }
        }
    }

    /// Announce the authoritative state of a group we master to its
    /// connected members.
    async fn broadcast_group_master(&self, group_id: &str) {
        let Some(record) = self.store.group(group_id) else {
            return;
        };
        if record.master_id != self.identity.device_id {
            return;
        }
        let payload = GroupMasterPayload {
            group_id: group_id.to_string(),
            name: record.name.clone(),
            members: record.members.iter().cloned().collect(),
            master_id: record.master_id.clone(),
            epoch: record.epoch,
        };
        let env = match serde_json::to_value(&payload) {
            Ok(value) => self.envelope(envelope::MSG_GROUP_MASTER, value),
            Err(e) => {
                warn!("encoding group_master failed: {e}");
                return;
            }
        };
        let targets: Vec<Arc<Peer>> = {
            let peers = self.peers.lock().unwrap();
            record
                .members
                .iter()
                .filter(|m| **m != self.identity.device_id)
                .filter_map(|m| peers.get(m).cloned())
                .collect()
        };
        for peer in targets {
            if let Err(e) = peer.send_envelope(&env).await {
                warn!("group_master broadcast failed: {e}");
            }
        }
    }

    async fn send_group_state(&self, device_id: &str) {
        let groups = self.store.groups();
        for (group_id, record) in groups {
            if record.master_id == self.identity.device_id && record.members.contains(device_id) {
                self.broadcast_group_master(&group_id).await;
            }
        }
    }

    // -- file sessions -----------------------------------------------------

    async fn open_session(
        &self,
        device_id: &str,
        file_id: FileId,
        filename: &str,
        size: u64,
    ) -> Result<()> {
        let key = (device_id.to_string(), file_id);
        let mut sessions = self.sessions.lock().await;
        if let Some(old) = sessions.remove(&key) {
            warn!(
                file_id = %frame::file_id_hex(&file_id),
                "restarting transfer, discarding {} partial bytes",
                old.progress().0
            );
        }
        let session =
            match ReceiveSession::create(&self.config.received_dir, file_id, filename, size).await {
                Ok(session) => session,
                Err(e @ NodeError::Protocol(_)) => return Err(e),
                Err(e) => {
                    warn!("opening receive session failed: {e}");
                    self.emit(NodeEvent::TransferFailed {
                        device_id: device_id.to_string(),
                        filename: filename.to_string(),
                    });
                    return Ok(());
                }
            };

        if session.is_complete() {
            // Zero-size file: nothing more is coming.
            let device_id = device_id.to_string();
            match session.finish().await {
                Ok((filename, path)) => self.emit(NodeEvent::FileReceived {
                    device_id,
                    filename,
                    path,
                }),
                Err(e) => warn!("finalizing empty file failed: {e}"),
            }
            return Ok(());
        }

        sessions.insert(key, session);
        Ok(())
    }

    async fn feed_session(
        &self,
        device_id: &str,
        file_id: FileId,
        index: u32,
        data: &[u8],
    ) -> Result<()> {
        let key = (device_id.to_string(), file_id);
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(&key) else {
            warn!(
                file_id = %frame::file_id_hex(&file_id),
                "dropping chunk for unknown transfer"
            );
            return Ok(());
        };

        match session.write_chunk(index, data).await {
            Ok(complete) => {
                let (bytes_written, total) = session.progress();
                let filename = session.filename().to_string();
                self.emit(NodeEvent::ReceiveProgress {
                    device_id: device_id.to_string(),
                    filename: filename.clone(),
                    bytes_written,
                    total,
                });
                if complete {
                    if let Some(session) = sessions.remove(&key) {
                        match session.finish().await {
                            Ok((filename, path)) => self.emit(NodeEvent::FileReceived {
                                device_id: device_id.to_string(),
                                filename,
                                path,
                            }),
                            Err(e) => {
                                warn!("finalizing received file failed: {e}");
                                self.emit(NodeEvent::TransferFailed {
                                    device_id: device_id.to_string(),
                                    filename,
                                });
                            }
                        }
                    }
                }
                Ok(())
            }
            Err(e) => {
                // Session-level failure: the transfer dies, the peer lives.
                warn!("receive session failed: {e}");
                let filename = session.filename().to_string();
                sessions.remove(&key);
                self.emit(NodeEvent::TransferFailed {
                    device_id: device_id.to_string(),
                    filename,
                });
                Ok(())
            }
        }
    }

    // -- discovery ---------------------------------------------------------

    fn handle_discovered(self: &Arc<Self>, found: Discovered) {
        if found.device_id == self.identity.device_id {
            return;
        }
        let first_sighting = self
            .discovered
            .lock()
            .unwrap()
            .insert(found.device_id.clone(), found.clone())
            .is_none();
        if first_sighting {
            self.emit(NodeEvent::Discovered {
                device_id: found.device_id.clone(),
                device_name: found.device_name.clone(),
                ip: found.ip.clone(),
                tcp_port: found.tcp_port,
            });
        }

        let already_connected = self.peers.lock().unwrap().contains_key(&found.device_id);
        if already_connected {
            return;
        }
        if !self.dialing.lock().unwrap().insert(found.device_id.clone()) {
            return;
        }

        let node = self.clone();
        tokio::spawn(async move {
            if let Err(e) = node.connect(&found.ip, found.tcp_port).await {
                debug!(device_id = %found.device_id, "dial failed: {e}");
            }
            node.dialing.lock().unwrap().remove(&found.device_id);
        });
    }

    // -- helpers -----------------------------------------------------------

    fn peer(&self, device_id: &str) -> Option<Arc<Peer>> {
        self.peers.lock().unwrap().get(device_id).cloned()
    }

    fn sender_id(&self, peer: &Arc<Peer>) -> Result<String> {
        peer.device_id()
            .ok_or_else(|| NodeError::protocol("frame from peer without handshake"))
    }

    fn envelope(&self, kind: &str, payload: serde_json::Value) -> Envelope {
        Envelope::new(&self.identity, kind, payload)
    }

    fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }
}

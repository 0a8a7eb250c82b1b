//! JSON envelope carried by every control message.
//!
//! All envelopes share the same outer fields; the `payload` object varies
//! by message type. Unknown types are logged and dropped, never fatal, so
//! newer peers can extend the protocol without breaking older ones.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{NodeError, Result};
use crate::identity::{self, Identity};

// Message types understood by this revision.
pub const MSG_HANDSHAKE: &str = "handshake";
pub const MSG_MESSAGE: &str = "message";
pub const MSG_GROUP_MASTER: &str = "group_master";
pub const MSG_GROUP_INVITE: &str = "group_invite";
pub const MSG_GROUP_JOIN: &str = "group_join";
pub const MSG_GROUP_JOIN_ACK: &str = "group_join_ack";
pub const MSG_GROUP_JOIN_REJECT: &str = "group_join_reject";
pub const MSG_GROUP_MESSAGE: &str = "group_message";
pub const MSG_FILE_META: &str = "file_meta";
pub const MSG_FILE_CHUNK: &str = "file_chunk";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub device_id: String,
    pub device_name: String,
    pub platform: String,
    pub timestamp: u64,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Build an envelope stamped with this node's identity and the current
    /// wall clock.
    pub fn new(identity: &Identity, kind: &str, payload: Value) -> Self {
        Self {
            kind: kind.to_string(),
            device_id: identity.device_id.clone(),
            device_name: identity.device_name.clone(),
            platform: identity.platform.clone(),
            timestamp: identity::timestamp(),
            payload,
        }
    }

    /// Decode the payload into the typed struct for this message kind.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| NodeError::protocol(format!("bad {} payload: {e}", self.kind)))
    }
}

/// `message`: a 1:1 text message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: String,
    pub text: String,
}

/// `group_message`: text relayed through the group master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMessagePayload {
    pub group_id: String,
    pub message_id: String,
    pub text: String,
    pub from_id: String,
}

/// `group_master`: authoritative group state announcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMasterPayload {
    pub group_id: String,
    pub name: String,
    pub members: Vec<String>,
    pub master_id: String,
    pub epoch: u64,
}

/// `group_invite`: the master offers membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupInvitePayload {
    pub group_id: String,
    pub name: String,
    pub master_id: String,
    pub inviter_id: String,
}

/// `group_join`: an invitee asks the master to add it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupJoinPayload {
    pub group_id: String,
    pub name: String,
    pub from_id: String,
}

/// `group_join_ack`: the master confirms with the authoritative record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupJoinAckPayload {
    pub group_id: String,
    pub name: String,
    pub members: Vec<String>,
    pub master_id: String,
    pub epoch: u64,
}

/// `group_join_reject`: an invitee declines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupJoinRejectPayload {
    pub group_id: String,
    pub from_id: String,
}

/// `file_meta` on the legacy JSON path. The string file id is normalized
/// to 16 raw bytes before it keys a receive session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetaPayload {
    pub file_id: String,
    pub filename: String,
    pub size: u64,
}

/// `file_chunk` on the legacy JSON path; `data` is base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChunkPayload {
    pub file_id: String,
    pub chunk_index: u32,
    pub data: String,
}

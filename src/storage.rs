//! On-disk chat history and group state.
//!
//! Message history is append-only JSONL, one envelope per line, one file
//! per conversation. Group state lives in a single `state.json` written
//! atomically (temp file + rename) because it needs whole-record updates.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::group::GroupRecord;
use crate::protocol::Envelope;

const STATE_FILE: &str = "state.json";
const DIRECT_PREFIX: &str = "direct_";
const GROUP_PREFIX: &str = "group_";

#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    groups: HashMap<String, GroupRecord>,
}

/// Persisted storage for groups and message logs.
pub struct ChatStore {
    data_dir: PathBuf,
    state: Mutex<State>,
}

impl ChatStore {
    /// Open the store, creating the data directory and loading any
    /// existing group state. A corrupt state file starts fresh rather than
    /// refusing to boot.
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;
        let state_path = data_dir.join(STATE_FILE);
        let state = match fs::read(&state_path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("state file unreadable, starting fresh: {e}");
                State::default()
            }),
            Err(_) => State::default(),
        };
        Ok(Self {
            data_dir,
            state: Mutex::new(state),
        })
    }

    fn save(&self, state: &State) -> Result<()> {
        let tmp = self.data_dir.join(format!("{STATE_FILE}.tmp"));
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&serde_json::to_vec_pretty(state)?)?;
        file.sync_all()?;
        fs::rename(&tmp, self.data_dir.join(STATE_FILE))?;
        Ok(())
    }

    // -- groups ------------------------------------------------------------

    /// Create a group under a fresh UUID and persist it immediately.
    pub fn create_group(&self, record: GroupRecord) -> Result<String> {
        let group_id = uuid::Uuid::new_v4().to_string();
        let mut state = self.state.lock().unwrap();
        state.groups.insert(group_id.clone(), record);
        self.save(&state)?;
        Ok(group_id)
    }

    /// Insert or wholesale-replace a group record.
    pub fn upsert_group(&self, group_id: &str, record: GroupRecord) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.groups.insert(group_id.to_string(), record);
        self.save(&state)
    }

    /// Mutate a group in place. Returns false if the group is unknown.
    pub fn update_group<F>(&self, group_id: &str, mutate: F) -> Result<bool>
    where
        F: FnOnce(&mut GroupRecord),
    {
        let mut state = self.state.lock().unwrap();
        match state.groups.get_mut(group_id) {
            Some(record) => {
                mutate(record);
                self.save(&state)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn group(&self, group_id: &str) -> Option<GroupRecord> {
        self.state.lock().unwrap().groups.get(group_id).cloned()
    }

    pub fn groups(&self) -> HashMap<String, GroupRecord> {
        self.state.lock().unwrap().groups.clone()
    }

    // -- history -----------------------------------------------------------

    pub fn append_direct(&self, peer_id: &str, envelope: &Envelope) -> Result<()> {
        self.append_line(&self.log_path(DIRECT_PREFIX, peer_id), envelope)
    }

    pub fn append_group(&self, group_id: &str, envelope: &Envelope) -> Result<()> {
        self.append_line(&self.log_path(GROUP_PREFIX, group_id), envelope)
    }

    /// Read the last `limit` entries of a direct conversation; 0 reads all.
    pub fn read_direct(&self, peer_id: &str, limit: usize) -> Result<Vec<Envelope>> {
        read_lines(&self.log_path(DIRECT_PREFIX, peer_id), limit)
    }

    /// Read the last `limit` entries of a group conversation; 0 reads all.
    pub fn read_group(&self, group_id: &str, limit: usize) -> Result<Vec<Envelope>> {
        read_lines(&self.log_path(GROUP_PREFIX, group_id), limit)
    }

    fn log_path(&self, prefix: &str, key: &str) -> PathBuf {
        self.data_dir.join(format!("{prefix}{}.jsonl", safe_key(key)))
    }

    fn append_line(&self, path: &Path, envelope: &Envelope) -> Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut line = serde_json::to_vec(envelope)?;
        line.push(b'\n');
        file.write_all(&line)?;
        Ok(())
    }
}

/// Ids come from remote peers; keep them inert as filename components.
fn safe_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn read_lines(path: &Path, limit: usize) -> Result<Vec<Envelope>> {
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        // Corrupt lines are skipped so one bad write can't hide the rest.
        match serde_json::from_str::<Envelope>(&line) {
            Ok(envelope) => entries.push(envelope),
            Err(e) => warn!("skipping corrupt history line: {e}"),
        }
    }
    if limit > 0 && entries.len() > limit {
        entries.drain(..entries.len() - limit);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::protocol::envelope::MSG_MESSAGE;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn identity() -> Identity {
        Identity {
            device_id: "store-test".to_string(),
            device_name: "box".to_string(),
            platform: "pc".to_string(),
        }
    }

    fn message(text: &str) -> Envelope {
        Envelope::new(
            &identity(),
            MSG_MESSAGE,
            serde_json::json!({"message_id": uuid::Uuid::new_v4().to_string(), "text": text}),
        )
    }

    #[test]
    fn direct_history_appends_and_reads_back() {
        let tmp = TempDir::new().unwrap();
        let store = ChatStore::open(tmp.path()).unwrap();
        store.append_direct("peer-1", &message("one")).unwrap();
        store.append_direct("peer-1", &message("two")).unwrap();

        let all = store.read_direct("peer-1", 0).unwrap();
        assert_eq!(all.len(), 2);

        let tail = store.read_direct("peer-1", 1).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].payload["text"], "two");
    }

    #[test]
    fn missing_history_reads_empty() {
        let tmp = TempDir::new().unwrap();
        let store = ChatStore::open(tmp.path()).unwrap();
        assert!(store.read_group("nope", 0).unwrap().is_empty());
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let store = ChatStore::open(tmp.path()).unwrap();
        store.append_group("g", &message("kept")).unwrap();
        let path = tmp.path().join("group_g.jsonl");
        let mut raw = fs::read(&path).unwrap();
        raw.extend_from_slice(b"{not json\n");
        fs::write(&path, raw).unwrap();
        store.append_group("g", &message("also kept")).unwrap();

        let entries = store.read_group("g", 0).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn group_state_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let members: BTreeSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let group_id = {
            let store = ChatStore::open(tmp.path()).unwrap();
            store
                .create_group(GroupRecord::new("team", members.clone(), "a".to_string()))
                .unwrap()
        };

        let store = ChatStore::open(tmp.path()).unwrap();
        let record = store.group(&group_id).unwrap();
        assert_eq!(record.name, "team");
        assert_eq!(record.members, members);
        assert_eq!(record.master_id, "a");
    }

    #[test]
    fn update_group_mutates_in_place() {
        let tmp = TempDir::new().unwrap();
        let store = ChatStore::open(tmp.path()).unwrap();
        let members: BTreeSet<String> = ["a"].iter().map(|s| s.to_string()).collect();
        let group_id = store
            .create_group(GroupRecord::new("team", members, "a".to_string()))
            .unwrap();

        let updated = store
            .update_group(&group_id, |g| {
                g.members.insert("b".to_string());
                g.epoch += 1;
            })
            .unwrap();
        assert!(updated);
        assert!(store.group(&group_id).unwrap().members.contains("b"));

        assert!(!store.update_group("unknown", |_| {}).unwrap());
    }

    #[test]
    fn hostile_ids_cannot_escape_the_data_dir() {
        let tmp = TempDir::new().unwrap();
        let store = ChatStore::open(tmp.path()).unwrap();
        store.append_direct("../../evil", &message("x")).unwrap();
        // The log landed inside the data dir under a neutralized name.
        let entries: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert!(entries.iter().any(|n| n.starts_with("direct_") && !n.contains("..")));
    }
}

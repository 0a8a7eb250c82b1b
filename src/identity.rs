//! Device identity: stable device id, display name, platform tag.
//!
//! The device id is a UUID persisted to `device_id.txt` so the node keeps
//! its identity across restarts. Peers key all state by this id.

use std::fs;
use std::net::UdpSocket;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;

/// Platform tag carried in every envelope.
pub const PLATFORM: &str = "pc";

const DEVICE_ID_FILE: &str = "device_id.txt";

#[derive(Debug, Clone)]
pub struct Identity {
    pub device_id: String,
    pub device_name: String,
    pub platform: String,
}

impl Identity {
    /// Load the persisted device id from `dir`, generating and saving a
    /// fresh UUID on first run.
    pub fn load_or_create(dir: &Path) -> Result<Self> {
        let path = dir.join(DEVICE_ID_FILE);
        let device_id = match fs::read_to_string(&path) {
            Ok(contents) if !contents.trim().is_empty() => contents.trim().to_string(),
            _ => {
                let id = uuid::Uuid::new_v4().to_string();
                fs::write(&path, &id)?;
                id
            }
        };
        Ok(Self {
            device_id,
            device_name: device_name(),
            platform: PLATFORM.to_string(),
        })
    }
}

fn device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Current Unix time in whole seconds.
pub fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Best-effort local LAN address for discovery announcements.
///
/// Connecting a datagram socket selects the outbound interface without
/// sending any packets; the local end of that socket is our LAN address.
pub fn local_ip() -> String {
    let probe = || -> std::io::Result<String> {
        let sock = UdpSocket::bind("0.0.0.0:0")?;
        sock.connect("8.8.8.8:80")?;
        Ok(sock.local_addr()?.ip().to_string())
    };
    probe().unwrap_or_else(|_| "127.0.0.1".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn device_id_persists_across_loads() {
        let tmp = TempDir::new().unwrap();
        let first = Identity::load_or_create(tmp.path()).unwrap();
        let second = Identity::load_or_create(tmp.path()).unwrap();
        assert_eq!(first.device_id, second.device_id);
        assert!(!first.device_id.is_empty());
    }

    #[test]
    fn timestamp_is_seconds() {
        let ts = timestamp();
        // Sanity: after 2020, before 2100.
        assert!(ts > 1_577_836_800);
        assert!(ts < 4_102_444_800);
    }
}

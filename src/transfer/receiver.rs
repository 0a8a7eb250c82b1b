//! Receiving side of a file transfer.
//!
//! One session per `(peer, file_id)`. Chunks append at the current offset
//! (arrival order is send order on one TCP stream); the index is recorded
//! so a later revision can reassemble out-of-order instead.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::{NodeError, Result};
use crate::protocol::frame::{FileId, MAX_FILE_SIZE};

/// Longest filename kept after sanitization, in UTF-8 bytes.
const MAX_SANITIZED_BYTES: usize = 255;

const FALLBACK_NAME: &str = "unnamed_file";

/// Strip an untrusted filename down to a safe final path component.
///
/// Drops directory components (both separator styles) and NUL bytes,
/// rejects empty, `.` and `..`, and truncates to 255 bytes of UTF-8,
/// keeping the extension when it fits. Idempotent.
pub fn sanitize_filename(filename: &str) -> String {
    let last = filename.rsplit(['/', '\\']).next().unwrap_or("");
    let name: String = last.chars().filter(|&c| c != '\0').collect();
    let name = truncate_utf8(&name, MAX_SANITIZED_BYTES);
    if name.is_empty() || name == "." || name == ".." {
        FALLBACK_NAME.to_string()
    } else {
        name
    }
}

// Truncate to at most `max` bytes on a char boundary, preserving the
// extension when the stem leaves room for it.
fn truncate_utf8(name: &str, max: usize) -> String {
    if name.len() <= max {
        return name.to_string();
    }
    match name.rfind('.') {
        Some(dot) if dot > 0 && name.len() - dot < max => {
            let ext = &name[dot..];
            let stem = take_bytes(&name[..dot], max - ext.len());
            format!("{stem}{ext}")
        }
        _ => take_bytes(name, max),
    }
}

fn take_bytes(s: &str, max: usize) -> String {
    let mut end = max.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

// First free variant of `name` in `dir`: name, stem-1.ext, stem-2.ext, ...
async fn unique_path(dir: &Path, name: &str) -> Result<PathBuf> {
    let candidate = dir.join(name);
    if !fs::try_exists(&candidate).await? {
        return Ok(candidate);
    }
    let (stem, ext) = match name.rfind('.') {
        Some(dot) if dot > 0 => (&name[..dot], &name[dot..]),
        _ => (name, ""),
    };
    for n in 1u32.. {
        let candidate = dir.join(format!("{stem}-{n}{ext}"));
        if !fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
    }
    unreachable!("u32 suffix space exhausted")
}

/// In-flight inbound transfer, created from a `file_meta` frame and fed
/// chunks until the declared size is reached.
pub struct ReceiveSession {
    file_id: FileId,
    filename: String,
    path: PathBuf,
    file: File,
    size: u64,
    bytes_written: u64,
    received: BTreeSet<u32>,
}

impl ReceiveSession {
    /// Validate the metadata and open a fresh output file under `dir`.
    pub async fn create(dir: &Path, file_id: FileId, filename: &str, size: u64) -> Result<Self> {
        if size > MAX_FILE_SIZE {
            return Err(NodeError::protocol(format!(
                "declared file size {size} exceeds {MAX_FILE_SIZE} byte limit"
            )));
        }
        let filename = sanitize_filename(filename);
        fs::create_dir_all(dir).await?;
        let path = unique_path(dir, &filename).await?;
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        Ok(Self {
            file_id,
            filename,
            path,
            file,
            size,
            bytes_written: 0,
            received: BTreeSet::new(),
        })
    }

    /// Append one chunk. Returns true when the transfer is complete.
    /// Overrunning the declared size is a protocol violation that destroys
    /// the session (the peer connection survives).
    pub async fn write_chunk(&mut self, index: u32, data: &[u8]) -> Result<bool> {
        let new_total = self.bytes_written + data.len() as u64;
        if new_total > self.size {
            return Err(NodeError::protocol(format!(
                "chunk {index} overruns declared size: {new_total} > {}",
                self.size
            )));
        }
        self.file.write_all(data).await?;
        self.bytes_written = new_total;
        self.received.insert(index);
        Ok(self.bytes_written == self.size)
    }

    /// Flush to disk and hand back the final location.
    pub async fn finish(mut self) -> Result<(String, PathBuf)> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok((self.filename, self.path))
    }

    pub fn file_id(&self) -> &FileId {
        &self.file_id
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn progress(&self) -> (u64, u64) {
        (self.bytes_written, self.size)
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_written == self.size
    }

    pub fn received_indices(&self) -> &BTreeSet<u32> {
        &self.received
    }
}

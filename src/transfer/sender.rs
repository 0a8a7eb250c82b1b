//! Sending side of a file transfer.
//!
//! The sender is a lazy sequence of pre-framed messages: metadata first,
//! then fixed-size chunks read on demand, so only one chunk is ever
//! resident. Frames are complete wire bytes; the caller owns the socket
//! and the pacing, and a closed peer cancels the sequence at the next
//! frame boundary.

use std::path::Path;

use base64::Engine as _;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};

use crate::error::{NodeError, Result};
use crate::identity::Identity;
use crate::protocol::envelope::{Envelope, MSG_FILE_CHUNK, MSG_FILE_META};
use crate::protocol::frame::{
    self, FileChunk, FileId, FileMeta, BINARY_CHUNK_SIZE, JSON_CHUNK_SIZE, MAX_FILE_SIZE,
};

/// Which wire encoding to stream the file with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Raw binary frames, 512 KiB chunks. The default.
    Binary,
    /// Length-prefixed JSON envelopes with base64 chunks, 64 KiB. Kept for
    /// interop with peers that predate the binary protocol.
    LegacyJson,
}

impl TransferMode {
    fn chunk_size(self) -> usize {
        match self {
            TransferMode::Binary => BINARY_CHUNK_SIZE,
            TransferMode::LegacyJson => JSON_CHUNK_SIZE,
        }
    }
}

/// Streams one file to one peer as a sequence of frames.
pub struct FileSender {
    file_id: FileId,
    filename: String,
    size: u64,
    mode: TransferMode,
    identity: Identity,
    reader: BufReader<File>,
    sent_meta: bool,
    next_index: u32,
    bytes_sent: u64,
    finished: bool,
}

impl FileSender {
    /// Stat and open the file, deriving a fresh transfer id. Send-side
    /// bound violations surface before any frame is produced.
    pub async fn open(path: &Path, mode: TransferMode, identity: Identity) -> Result<Self> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| NodeError::InvalidInput(format!("{}: {e}", path.display())))?;
        if !meta.is_file() {
            return Err(NodeError::InvalidInput(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        if meta.len() > MAX_FILE_SIZE {
            return Err(NodeError::ResourceLimit(format!(
                "file size {} exceeds {} byte limit",
                meta.len(),
                MAX_FILE_SIZE
            )));
        }
        let filename = file_name(path)?;
        let file = File::open(path).await?;
        Ok(Self {
            file_id: frame::new_file_id(),
            filename,
            size: meta.len(),
            mode,
            identity,
            reader: BufReader::new(file),
            sent_meta: false,
            next_index: 0,
            bytes_sent: 0,
            finished: false,
        })
    }

    /// Produce the next complete frame, or `None` when the file has been
    /// fully read. Any read error aborts the transfer; there is no retry.
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if !self.sent_meta {
            self.sent_meta = true;
            return self.meta_frame().map(Some);
        }
        if self.finished {
            return Ok(None);
        }

        let chunk = self.read_chunk().await?;
        if chunk.is_empty() {
            self.finished = true;
            return Ok(None);
        }

        let index = self.next_index;
        self.next_index += 1;
        self.bytes_sent += chunk.len() as u64;
        let frame = match self.mode {
            TransferMode::Binary => FileChunk {
                file_id: self.file_id,
                index,
                data: Bytes::from(chunk),
            }
            .encode()?,
            TransferMode::LegacyJson => {
                let payload = serde_json::json!({
                    "file_id": frame::file_id_hex(&self.file_id),
                    "chunk_index": index,
                    "data": base64::engine::general_purpose::STANDARD.encode(&chunk),
                });
                frame::encode_json(&Envelope::new(&self.identity, MSG_FILE_CHUNK, payload))?
            }
        };
        Ok(Some(frame))
    }

    // Fill a whole chunk unless EOF arrives first. A single read may
    // return less than the chunk size without meaning end of file.
    async fn read_chunk(&mut self) -> Result<Vec<u8>> {
        let chunk_size = self.mode.chunk_size();
        let mut chunk = vec![0u8; chunk_size];
        let mut filled = 0;
        while filled < chunk_size {
            let n = self.reader.read(&mut chunk[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        chunk.truncate(filled);
        Ok(chunk)
    }

    fn meta_frame(&self) -> Result<Bytes> {
        match self.mode {
            TransferMode::Binary => FileMeta {
                file_id: self.file_id,
                filename: self.filename.clone(),
                size: self.size,
                compression: 0,
            }
            .encode(),
            TransferMode::LegacyJson => {
                let payload = serde_json::json!({
                    "file_id": frame::file_id_hex(&self.file_id),
                    "filename": self.filename,
                    "size": self.size,
                });
                frame::encode_json(&Envelope::new(&self.identity, MSG_FILE_META, payload))
            }
        }
    }

    pub fn file_id(&self) -> &FileId {
        &self.file_id
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// `(bytes_sent, total_size)`, updated after every chunk frame.
    pub fn progress(&self) -> (u64, u64) {
        (self.bytes_sent, self.size)
    }
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| NodeError::InvalidInput(format!("{} has no filename", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::Frame;
    use std::io::Cursor;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn identity() -> Identity {
        Identity {
            device_id: "sender-test".to_string(),
            device_name: "box".to_string(),
            platform: "pc".to_string(),
        }
    }

    async fn collect_frames(sender: &mut FileSender) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Some(frame) = sender.next_frame().await.unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn binary_transfer_chunks_at_512k() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("payload.bin");
        // Three full chunks exactly.
        std::fs::write(&path, vec![7u8; 3 * BINARY_CHUNK_SIZE]).unwrap();

        let mut sender = FileSender::open(&path, TransferMode::Binary, identity())
            .await
            .unwrap();
        let frames = collect_frames(&mut sender).await;
        assert_eq!(frames.len(), 4); // meta + 3 chunks
        assert_eq!(sender.progress(), (3 * BINARY_CHUNK_SIZE as u64, 3 * BINARY_CHUNK_SIZE as u64));

        let mut stream = Cursor::new(frames.concat());
        match frame::read_frame(&mut stream).await.unwrap() {
            Some(Frame::FileMeta(meta)) => {
                assert_eq!(meta.filename, "payload.bin");
                assert_eq!(meta.size, 3 * BINARY_CHUNK_SIZE as u64);
            }
            other => panic!("expected meta, got {other:?}"),
        }
        for expected_index in 0..3u32 {
            match frame::read_frame(&mut stream).await.unwrap() {
                Some(Frame::FileChunk(chunk)) => {
                    assert_eq!(chunk.index, expected_index);
                    assert_eq!(chunk.data.len(), BINARY_CHUNK_SIZE);
                }
                other => panic!("expected chunk, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn short_tail_chunk_is_not_padded() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("odd.bin");
        std::fs::write(&path, vec![1u8; BINARY_CHUNK_SIZE + 100]).unwrap();

        let mut sender = FileSender::open(&path, TransferMode::Binary, identity())
            .await
            .unwrap();
        let frames = collect_frames(&mut sender).await;
        assert_eq!(frames.len(), 3);

        let last = FileChunk::decode(&frames[2][4..]).unwrap();
        assert_eq!(last.data.len(), 100);
    }

    #[tokio::test]
    async fn empty_file_sends_meta_only() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("empty.bin");
        std::fs::write(&path, b"").unwrap();

        let mut sender = FileSender::open(&path, TransferMode::Binary, identity())
            .await
            .unwrap();
        let frames = collect_frames(&mut sender).await;
        assert_eq!(frames.len(), 1);
        let meta = FileMeta::decode(&frames[0][4..]).unwrap();
        assert_eq!(meta.size, 0);
    }

    #[tokio::test]
    async fn legacy_json_frames_carry_base64() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("note.txt");
        std::fs::write(&path, b"hello json path").unwrap();

        let mut sender = FileSender::open(&path, TransferMode::LegacyJson, identity())
            .await
            .unwrap();
        let frames = collect_frames(&mut sender).await;
        assert_eq!(frames.len(), 2);

        let mut stream = Cursor::new(frames.concat());
        match frame::read_frame(&mut stream).await.unwrap() {
            Some(Frame::Json(env)) => assert_eq!(env.kind, MSG_FILE_META),
            other => panic!("expected json meta, got {other:?}"),
        }
        match frame::read_frame(&mut stream).await.unwrap() {
            Some(Frame::Json(env)) => {
                assert_eq!(env.kind, MSG_FILE_CHUNK);
                let data = env.payload["data"].as_str().unwrap();
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(data)
                    .unwrap();
                assert_eq!(decoded, b"hello json path");
            }
            other => panic!("expected json chunk, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_file_is_invalid_input() {
        let result = FileSender::open(
            &PathBuf::from("/no/such/file"),
            TransferMode::Binary,
            identity(),
        )
        .await;
        assert!(matches!(result, Err(NodeError::InvalidInput(_))));
    }
}

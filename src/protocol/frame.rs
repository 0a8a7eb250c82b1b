//! Frame codec for the hybrid JSON/binary stream.
//!
//! Wire format: all multi-byte integers are big-endian, all strings UTF-8.
//!
//! ```text
//! JSON frame:   len:u32 | json bytes ('{' first)
//! Binary frame: len:u32 | 'BIN' | type:u8 | payload | crc32:u32
//! ```
//!
//! The binary length covers everything after itself up to and including
//! the trailing CRC32; the CRC32 covers everything between the length
//! field and the CRC itself. Binary file chunks carry raw bytes, avoiding
//! the base64 overhead of the legacy JSON file path.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{NodeError, Result};
use crate::protocol::envelope::Envelope;

/// Maximum JSON frame size. Keeps the length prefix's first byte at 0x00,
/// which is what lets the reader discriminate on the body's first byte.
pub const MAX_JSON_FRAME: u32 = 16 * 1024 * 1024;

/// Maximum binary frame size: one 10 MiB chunk plus framing overhead.
pub const MAX_BINARY_FRAME: u32 = 11 * 1024 * 1024;

/// Maximum declared file size (10 GiB).
pub const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Maximum chunk payload size (10 MiB).
pub const MAX_CHUNK_SIZE: u32 = 10 * 1024 * 1024;

/// Maximum filename length in UTF-8 bytes.
pub const MAX_FILENAME_BYTES: usize = 1024;

/// Chunk size used by the binary file path.
pub const BINARY_CHUNK_SIZE: usize = 512 * 1024;

/// Chunk size used by the legacy JSON file path (base64 grows it by a third).
pub const JSON_CHUNK_SIZE: usize = 64 * 1024;

/// Magic prefix of every binary frame. 0x42 can never collide with a JSON
/// body, which always starts with '{' (0x7B).
const BINARY_MAGIC: &[u8; 3] = b"BIN";

pub const FRAME_TYPE_FILE_META: u8 = 0x01;
pub const FRAME_TYPE_FILE_CHUNK: u8 = 0x02;

// Fixed part of a meta body: magic(3) + type(1) + id(16) + size(8) +
// compression(1) + name_len(2) + crc(4).
const META_FIXED_LEN: usize = 35;
// Fixed part of a chunk body: magic(3) + type(1) + id(16) + index(4) +
// size(4) + crc(4).
const CHUNK_FIXED_LEN: usize = 32;

/// Raw 16-byte transfer identifier.
pub type FileId = [u8; 16];

/// Fresh random file id for a new transfer.
pub fn new_file_id() -> FileId {
    *uuid::Uuid::new_v4().as_bytes()
}

/// Hex rendering used in logs and the legacy JSON path.
pub fn file_id_hex(id: &FileId) -> String {
    id.iter().map(|b| format!("{b:02x}")).collect()
}

/// Normalize a legacy string file id to 16 raw bytes: truncate, NUL-pad.
pub fn file_id_from_str(s: &str) -> FileId {
    let mut id = [0u8; 16];
    let bytes = s.as_bytes();
    let n = bytes.len().min(16);
    id[..n].copy_from_slice(&bytes[..n]);
    id
}

// =============================================================================
// JSON frames
// =============================================================================

/// Encode an envelope as a complete length-prefixed JSON frame.
pub fn encode_json(envelope: &Envelope) -> Result<Bytes> {
    let json = serde_json::to_vec(envelope)?;
    if json.len() > MAX_JSON_FRAME as usize {
        return Err(NodeError::ResourceLimit(format!(
            "json frame of {} bytes exceeds {} byte limit",
            json.len(),
            MAX_JSON_FRAME
        )));
    }
    let mut buf = BytesMut::with_capacity(4 + json.len());
    buf.put_u32(json.len() as u32);
    buf.put_slice(&json);
    Ok(buf.freeze())
}

// =============================================================================
// FILE_META (0x01)
// =============================================================================

/// File transfer metadata, sent once before the chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub file_id: FileId,
    pub filename: String,
    pub size: u64,
    /// Reserved; 0x00 means uncompressed. Non-zero values are surfaced to
    /// the application layer, which refuses them until a compressor is
    /// specified.
    pub compression: u8,
}

impl FileMeta {
    pub fn encode(&self) -> Result<Bytes> {
        if self.size > MAX_FILE_SIZE {
            return Err(NodeError::ResourceLimit(format!(
                "file size {} exceeds {} byte limit",
                self.size, MAX_FILE_SIZE
            )));
        }
        let name = self.filename.as_bytes();
        if name.len() > MAX_FILENAME_BYTES {
            return Err(NodeError::ResourceLimit(format!(
                "filename of {} bytes exceeds {} byte limit",
                name.len(),
                MAX_FILENAME_BYTES
            )));
        }

        let body_len = META_FIXED_LEN + name.len();
        let mut buf = BytesMut::with_capacity(4 + body_len);
        buf.put_u32(body_len as u32);
        buf.put_slice(BINARY_MAGIC);
        buf.put_u8(FRAME_TYPE_FILE_META);
        buf.put_slice(&self.file_id);
        buf.put_u64(self.size);
        buf.put_u8(self.compression);
        buf.put_u16(name.len() as u16);
        buf.put_slice(name);
        let crc = crc32fast::hash(&buf[4..]);
        buf.put_u32(crc);
        Ok(buf.freeze())
    }

    /// Decode from a frame body (everything after the length prefix).
    /// Magic and type byte have already been inspected for routing but are
    /// re-verified here.
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < META_FIXED_LEN {
            return Err(NodeError::protocol(format!(
                "file_meta frame too short: {} bytes",
                body.len()
            )));
        }
        check_header(body, FRAME_TYPE_FILE_META)?;

        let mut file_id = [0u8; 16];
        file_id.copy_from_slice(&body[4..20]);
        let size = u64::from_be_bytes(body[20..28].try_into().unwrap());
        let compression = body[28];
        let name_len = u16::from_be_bytes(body[29..31].try_into().unwrap()) as usize;

        if size > MAX_FILE_SIZE {
            return Err(NodeError::protocol(format!(
                "declared file size {size} exceeds {MAX_FILE_SIZE} byte limit"
            )));
        }
        if name_len > MAX_FILENAME_BYTES {
            return Err(NodeError::protocol(format!(
                "filename of {name_len} bytes exceeds {MAX_FILENAME_BYTES} byte limit"
            )));
        }
        if body.len() != META_FIXED_LEN + name_len {
            return Err(NodeError::protocol(format!(
                "file_meta frame of {} bytes, expected {}",
                body.len(),
                META_FIXED_LEN + name_len
            )));
        }

        verify_crc(body)?;

        let filename = std::str::from_utf8(&body[31..31 + name_len])
            .map_err(|e| NodeError::protocol(format!("filename is not UTF-8: {e}")))?
            .to_string();

        Ok(Self {
            file_id,
            filename,
            size,
            compression,
        })
    }
}

// =============================================================================
// FILE_CHUNK (0x02)
// =============================================================================

/// One raw chunk of file data. The index allows a later revision to
/// reassemble out-of-order; the current receiver writes in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub file_id: FileId,
    pub index: u32,
    pub data: Bytes,
}

impl FileChunk {
    pub fn encode(&self) -> Result<Bytes> {
        if self.data.len() > MAX_CHUNK_SIZE as usize {
            return Err(NodeError::ResourceLimit(format!(
                "chunk of {} bytes exceeds {} byte limit",
                self.data.len(),
                MAX_CHUNK_SIZE
            )));
        }

        let body_len = CHUNK_FIXED_LEN + self.data.len();
        let mut buf = BytesMut::with_capacity(4 + body_len);
        buf.put_u32(body_len as u32);
        buf.put_slice(BINARY_MAGIC);
        buf.put_u8(FRAME_TYPE_FILE_CHUNK);
        buf.put_slice(&self.file_id);
        buf.put_u32(self.index);
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
        let crc = crc32fast::hash(&buf[4..]);
        buf.put_u32(crc);
        Ok(buf.freeze())
    }

    /// Decode from a frame body (everything after the length prefix).
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < CHUNK_FIXED_LEN {
            return Err(NodeError::protocol(format!(
                "file_chunk frame too short: {} bytes",
                body.len()
            )));
        }
        check_header(body, FRAME_TYPE_FILE_CHUNK)?;

        let mut file_id = [0u8; 16];
        file_id.copy_from_slice(&body[4..20]);
        let index = u32::from_be_bytes(body[20..24].try_into().unwrap());
        let chunk_size = u32::from_be_bytes(body[24..28].try_into().unwrap());

        if chunk_size > MAX_CHUNK_SIZE {
            return Err(NodeError::protocol(format!(
                "chunk of {chunk_size} bytes exceeds {MAX_CHUNK_SIZE} byte limit"
            )));
        }
        if body.len() != CHUNK_FIXED_LEN + chunk_size as usize {
            return Err(NodeError::protocol(format!(
                "file_chunk frame of {} bytes, expected {}",
                body.len(),
                CHUNK_FIXED_LEN + chunk_size as usize
            )));
        }

        verify_crc(body)?;

        let data = Bytes::copy_from_slice(&body[28..28 + chunk_size as usize]);
        Ok(Self {
            file_id,
            index,
            data,
        })
    }
}

fn check_header(body: &[u8], expected_type: u8) -> Result<()> {
    if &body[..3] != BINARY_MAGIC {
        return Err(NodeError::protocol(format!(
            "bad binary magic: {:02x}{:02x}{:02x}",
            body[0], body[1], body[2]
        )));
    }
    if body[3] != expected_type {
        return Err(NodeError::protocol(format!(
            "frame type 0x{:02x}, expected 0x{expected_type:02x}",
            body[3]
        )));
    }
    Ok(())
}

// CRC covers the whole body except the trailing checksum itself.
fn verify_crc(body: &[u8]) -> Result<()> {
    let crc_offset = body.len() - 4;
    let received = u32::from_be_bytes(body[crc_offset..].try_into().unwrap());
    let computed = crc32fast::hash(&body[..crc_offset]);
    if received != computed {
        return Err(NodeError::protocol(format!(
            "crc mismatch: received {received:08x}, computed {computed:08x}"
        )));
    }
    Ok(())
}

// =============================================================================
// Stream reading
// =============================================================================

/// One parsed unit from the wire.
#[derive(Debug, Clone)]
pub enum Frame {
    Json(Envelope),
    FileMeta(FileMeta),
    FileChunk(FileChunk),
}

/// Read the next frame from the stream.
///
/// Returns `Ok(None)` on a clean close at a frame boundary. A close in the
/// middle of a frame surfaces as an I/O error, and any malformed byte as a
/// protocol error; both terminate the connection.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len == 0 {
        return Err(NodeError::protocol("zero-length frame"));
    }
    if len > MAX_JSON_FRAME {
        return Err(NodeError::protocol(format!(
            "frame length {len} exceeds {MAX_JSON_FRAME} byte limit"
        )));
    }

    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body).await?;

    match body[0] {
        b'{' => {
            let envelope: Envelope = serde_json::from_slice(&body)
                .map_err(|e| NodeError::protocol(format!("invalid json frame: {e}")))?;
            Ok(Some(Frame::Json(envelope)))
        }
        b'B' if body.starts_with(BINARY_MAGIC) => {
            if len > MAX_BINARY_FRAME {
                return Err(NodeError::protocol(format!(
                    "binary frame length {len} exceeds {MAX_BINARY_FRAME} byte limit"
                )));
            }
            if body.len() < 4 {
                return Err(NodeError::protocol("binary frame missing type byte"));
            }
            match body[3] {
                FRAME_TYPE_FILE_META => Ok(Some(Frame::FileMeta(FileMeta::decode(&body)?))),
                FRAME_TYPE_FILE_CHUNK => Ok(Some(Frame::FileChunk(FileChunk::decode(&body)?))),
                other => Err(NodeError::protocol(format!(
                    "unknown binary frame type 0x{other:02x}"
                ))),
            }
        }
        other => Err(NodeError::protocol(format!(
            "unknown frame discriminator 0x{other:02x}"
        ))),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::protocol::envelope::{self, Envelope};
    use std::io::Cursor;

    fn identity() -> Identity {
        Identity {
            device_id: "aaaaaaaa-0000-0000-0000-000000000000".to_string(),
            device_name: "codec-test".to_string(),
            platform: "pc".to_string(),
        }
    }

    fn sample_meta() -> FileMeta {
        FileMeta {
            file_id: *b"0123456789abcdef",
            filename: "photo.jpg".to_string(),
            size: 1_572_864,
            compression: 0,
        }
    }

    fn sample_chunk() -> FileChunk {
        FileChunk {
            file_id: *b"0123456789abcdef",
            index: 2,
            data: Bytes::from(vec![0xA5; 1024]),
        }
    }

    #[test]
    fn meta_roundtrip() {
        let meta = sample_meta();
        let frame = meta.encode().unwrap();
        let decoded = FileMeta::decode(&frame[4..]).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn chunk_roundtrip() {
        let chunk = sample_chunk();
        let frame = chunk.encode().unwrap();
        let decoded = FileChunk::decode(&frame[4..]).unwrap();
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn unicode_filename_roundtrip() {
        let meta = FileMeta {
            filename: "фото 📷.jpg".to_string(),
            ..sample_meta()
        };
        let frame = meta.encode().unwrap();
        assert_eq!(FileMeta::decode(&frame[4..]).unwrap().filename, meta.filename);
    }

    #[test]
    fn single_bit_flip_fails_crc() {
        let chunk = sample_chunk();
        let mut frame = chunk.encode().unwrap().to_vec();
        // Flip one bit in the last data byte, just before the CRC.
        let idx = frame.len() - 5;
        frame[idx] ^= 0x01;
        let err = FileChunk::decode(&frame[4..]).unwrap_err();
        assert!(err.to_string().contains("crc mismatch"), "{err}");
    }

    #[test]
    fn meta_payload_bit_flip_fails_crc() {
        let meta = sample_meta();
        let mut frame = meta.encode().unwrap().to_vec();
        // Flip a bit inside the declared size field.
        frame[25] ^= 0x80;
        assert!(FileMeta::decode(&frame[4..]).is_err());
    }

    #[test]
    fn chunk_at_limit_accepted_over_limit_rejected() {
        let at = FileChunk {
            data: Bytes::from(vec![0u8; MAX_CHUNK_SIZE as usize]),
            ..sample_chunk()
        };
        let frame = at.encode().unwrap();
        assert!(FileChunk::decode(&frame[4..]).is_ok());

        let over = FileChunk {
            data: Bytes::from(vec![0u8; MAX_CHUNK_SIZE as usize + 1]),
            ..sample_chunk()
        };
        assert!(matches!(
            over.encode(),
            Err(crate::error::NodeError::ResourceLimit(_))
        ));
    }

    #[test]
    fn oversize_chunk_rejected_by_decoder() {
        // Forge a frame declaring a chunk just over the limit.
        let chunk = sample_chunk();
        let mut frame = chunk.encode().unwrap().to_vec();
        let bogus = (MAX_CHUNK_SIZE + 1).to_be_bytes();
        frame[4 + 24..4 + 28].copy_from_slice(&bogus);
        let err = FileChunk::decode(&frame[4..]).unwrap_err();
        assert!(err.to_string().contains("exceeds"), "{err}");
    }

    #[test]
    fn file_size_at_limit_accepted_over_limit_rejected() {
        let at = FileMeta {
            size: MAX_FILE_SIZE,
            ..sample_meta()
        };
        let frame = at.encode().unwrap();
        assert_eq!(FileMeta::decode(&frame[4..]).unwrap().size, MAX_FILE_SIZE);

        let over = FileMeta {
            size: MAX_FILE_SIZE + 1,
            ..sample_meta()
        };
        assert!(over.encode().is_err());
    }

    #[test]
    fn filename_at_limit_accepted_over_limit_rejected() {
        let at = FileMeta {
            filename: "x".repeat(MAX_FILENAME_BYTES),
            ..sample_meta()
        };
        assert!(at.encode().is_ok());

        let over = FileMeta {
            filename: "x".repeat(MAX_FILENAME_BYTES + 1),
            ..sample_meta()
        };
        assert!(over.encode().is_err());
    }

    #[test]
    fn truncated_meta_rejected() {
        let frame = sample_meta().encode().unwrap();
        assert!(FileMeta::decode(&frame[4..frame.len() - 1]).is_err());
    }

    #[tokio::test]
    async fn read_frame_routes_json_and_binary() {
        let env = Envelope::new(
            &identity(),
            envelope::MSG_MESSAGE,
            serde_json::json!({"message_id": "m", "text": "between chunks"}),
        );
        let mut stream = Vec::new();
        stream.extend_from_slice(&sample_chunk().encode().unwrap());
        stream.extend_from_slice(&encode_json(&env).unwrap());
        stream.extend_from_slice(&sample_meta().encode().unwrap());

        let mut cursor = Cursor::new(stream);
        assert!(matches!(
            read_frame(&mut cursor).await.unwrap(),
            Some(Frame::FileChunk(_))
        ));
        match read_frame(&mut cursor).await.unwrap() {
            Some(Frame::Json(e)) => assert_eq!(e.kind, envelope::MSG_MESSAGE),
            other => panic!("expected json frame, got {other:?}"),
        }
        assert!(matches!(
            read_frame(&mut cursor).await.unwrap(),
            Some(Frame::FileMeta(_))
        ));
        // Clean end of stream.
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_length_frame_is_a_protocol_error() {
        let mut cursor = Cursor::new(vec![0u8, 0, 0, 0]);
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn oversize_json_frame_rejected() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&(MAX_JSON_FRAME + 1).to_be_bytes());
        stream.push(b'{');
        let mut cursor = Cursor::new(stream);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(err.to_string().contains("exceeds"), "{err}");
    }

    #[tokio::test]
    async fn unknown_discriminator_is_a_protocol_error() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&4u32.to_be_bytes());
        stream.extend_from_slice(b"XYZ\x01");
        let mut cursor = Cursor::new(stream);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(err.to_string().contains("discriminator"), "{err}");
    }

    #[tokio::test]
    async fn unknown_binary_type_is_a_protocol_error() {
        // Valid magic, bogus frame type.
        let mut body = Vec::new();
        body.extend_from_slice(b"BIN");
        body.push(0x7F);
        let mut stream = Vec::new();
        stream.extend_from_slice(&(body.len() as u32).to_be_bytes());
        stream.extend_from_slice(&body);
        let mut cursor = Cursor::new(stream);
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[test]
    fn file_id_from_str_truncates_and_pads() {
        let long = file_id_from_str("0123456789abcdefXXXX");
        assert_eq!(&long, b"0123456789abcdef");
        let short = file_id_from_str("abc");
        assert_eq!(&short[..3], b"abc");
        assert!(short[3..].iter().all(|&b| b == 0));
    }
}

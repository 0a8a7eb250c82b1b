//! Hybrid wire protocol: length-prefixed JSON envelopes for control
//! traffic, length-prefixed binary frames for file data.
//!
//! ```text
//! JSON:   [4 B length BE] [UTF-8 JSON object]
//! Binary: [4 B length BE] ['B' 'I' 'N'] [1 B type] [payload] [4 B CRC32 BE]
//! ```
//!
//! Both frame kinds share one TCP stream. The reader consumes the length,
//! then the body, and routes on the body's first byte: `{` is JSON, `B`
//! (verified against the full `BIN` magic) is binary. Anything else is a
//! protocol violation that terminates the connection.

pub mod envelope;
pub mod frame;

pub use envelope::Envelope;
pub use frame::{
    read_frame, FileChunk, FileId, FileMeta, Frame, BINARY_CHUNK_SIZE, JSON_CHUNK_SIZE,
    MAX_CHUNK_SIZE, MAX_FILENAME_BYTES, MAX_FILE_SIZE,
};

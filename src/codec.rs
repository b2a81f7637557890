//! Ingestion wire format.
//!
//! One frame per connection, no magic or version byte:
//!
//! ```text
//! +-----------+----------------+-----------+-------------+
//! | L1: i32le | L1 bytes JSON  | L2: i32le | L2 bytes    |
//! |           | VideoMetadata  |           | raw payload |
//! +-----------+----------------+-----------+-------------+
//! ```
//!
//! Decoding either yields the whole `(metadata, payload)` pair or a
//! [`DecodeError`]; nothing partial escapes.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::model::VideoMetadata;

/// Default cap on the metadata block.
pub const DEFAULT_MAX_METADATA_BYTES: usize = 64 * 1024;

/// Default cap on the payload block.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 512 * 1024 * 1024;

/// Initial buffer size for a block; larger blocks grow as bytes arrive.
const READ_CHUNK: usize = 64 * 1024;

/// The part of a frame being read when decoding failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    MetadataLength,
    Metadata,
    PayloadLength,
    Payload,
}

impl std::fmt::Display for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Section::MetadataLength => "metadata length",
            Section::Metadata => "metadata",
            Section::PayloadLength => "payload length",
            Section::Payload => "payload",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("stream closed while reading {section}")]
    Truncated { section: Section },

    #[error("negative {section}: {len}")]
    NegativeLength { section: Section, len: i32 },

    #[error("{section} of {len} bytes exceeds limit of {max}")]
    TooLarge {
        section: Section,
        len: usize,
        max: usize,
    },

    #[error("malformed metadata: {0}")]
    BadMetadata(#[from] serde_json::Error),

    #[error("read failed: {0}")]
    Io(#[from] io::Error),
}

/// Size limits applied while decoding, so a peer cannot make us allocate
/// an arbitrary buffer from a forged length prefix.
#[derive(Debug, Clone, Copy)]
pub struct FrameLimits {
    pub max_metadata_bytes: usize,
    pub max_payload_bytes: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_metadata_bytes: DEFAULT_MAX_METADATA_BYTES,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

/// Read exactly one frame from `reader`.
pub async fn read_frame<R>(
    reader: &mut R,
    limits: FrameLimits,
) -> Result<(VideoMetadata, Vec<u8>), DecodeError>
where
    R: AsyncRead + Unpin,
{
    let meta_len = read_len(reader, Section::MetadataLength, limits.max_metadata_bytes).await?;
    let meta_bytes = read_block(reader, Section::Metadata, meta_len).await?;
    let metadata: VideoMetadata = serde_json::from_slice(&meta_bytes)?;

    let payload_len = read_len(reader, Section::PayloadLength, limits.max_payload_bytes).await?;
    let payload = read_block(reader, Section::Payload, payload_len).await?;

    Ok((metadata, payload))
}

/// Serialize a frame into a single buffer.
///
/// Fails with `InvalidInput` if either block is longer than `i32::MAX`.
pub fn encode_frame(metadata: &VideoMetadata, payload: &[u8]) -> io::Result<Vec<u8>> {
    let meta_bytes = serde_json::to_vec(metadata)?;
    let meta_len = len_prefix(meta_bytes.len())?;
    let payload_len = len_prefix(payload.len())?;

    let mut buf = Vec::with_capacity(8 + meta_bytes.len() + payload.len());
    buf.extend_from_slice(&meta_len);
    buf.extend_from_slice(&meta_bytes);
    buf.extend_from_slice(&payload_len);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Write one frame to `writer` and flush it.
pub async fn write_frame<W>(writer: &mut W, metadata: &VideoMetadata, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let meta_bytes = serde_json::to_vec(metadata)?;
    writer.write_all(&len_prefix(meta_bytes.len())?).await?;
    writer.write_all(&meta_bytes).await?;
    writer.write_all(&len_prefix(payload.len())?).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

fn len_prefix(len: usize) -> io::Result<[u8; 4]> {
    let len = i32::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("block of {len} bytes does not fit an i32 length prefix"),
        )
    })?;
    Ok(len.to_le_bytes())
}

async fn read_len<R>(reader: &mut R, section: Section, max: usize) -> Result<usize, DecodeError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| eof_as_truncated(e, section))?;

    let len = i32::from_le_bytes(buf);
    let len = usize::try_from(len).map_err(|_| DecodeError::NegativeLength { section, len })?;
    if len > max {
        return Err(DecodeError::TooLarge { section, len, max });
    }
    Ok(len)
}

async fn read_block<R>(reader: &mut R, section: Section, len: usize) -> Result<Vec<u8>, DecodeError>
where
    R: AsyncRead + Unpin,
{
    // Grow with the bytes that actually arrive, not with the declared length.
    let mut buf = Vec::with_capacity(len.min(READ_CHUNK));
    let read = (&mut *reader)
        .take(len as u64)
        .read_to_end(&mut buf)
        .await?;
    if read < len {
        return Err(DecodeError::Truncated { section });
    }
    Ok(buf)
}

fn eof_as_truncated(e: io::Error, section: Section) -> DecodeError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        DecodeError::Truncated { section }
    } else {
        DecodeError::Io(e)
    }
}

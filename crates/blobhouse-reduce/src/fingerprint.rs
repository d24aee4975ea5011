//! Content fingerprinting: BLAKE3 hashing of whole payloads and of streamed input

use crate::error::ReduceError;
use blobhouse_core::ContentHash;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Read buffer size used while streaming a payload.
const READ_CHUNK: usize = 64 * 1024;

/// Compute BLAKE3 hash of data
pub fn blake3_hash(data: &[u8]) -> ContentHash {
    let hash = blake3::hash(data);
    ContentHash(*hash.as_bytes())
}

/// Incremental hasher for payloads that arrive in pieces.
#[derive(Default)]
pub struct StreamingHasher {
    hasher: blake3::Hasher,
    bytes: u64,
}

impl StreamingHasher {
    /// Fresh hasher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next piece.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    /// Bytes fed so far.
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    /// Final digest.
    pub fn finalize(&self) -> ContentHash {
        ContentHash(*self.hasher.finalize().as_bytes())
    }
}

/// Drain `reader` into memory while hashing it.
/// Fails with `PayloadTooLarge` as soon as more than `limit` bytes have been read.
pub async fn read_and_hash<R>(mut reader: R, limit: u64) -> Result<(Bytes, ContentHash), ReduceError>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = StreamingHasher::new();
    let mut buf = BytesMut::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        if hasher.bytes_hashed() + n as u64 > limit {
            return Err(ReduceError::PayloadTooLarge { limit });
        }
        hasher.update(&chunk[..n]);
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok((buf.freeze(), hasher.finalize()))
}

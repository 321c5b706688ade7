//! Backing sources the sender reads track bytes from.
//!
//! A source must support two operations, both blocking from the worker
//! task's point of view: read the next chunk of bytes, and reposition
//! to an absolute byte offset. Files implement this trivially; a ranged
//! HTTP stream would reopen the connection at the new offset.

use async_trait::async_trait;
use std::io::{self, SeekFrom};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// A positionable byte stream backing one track.
///
/// Owned exclusively by the worker task serving the track; never shared
/// across tasks.
#[async_trait]
pub trait ByteSource: Send {
    /// Reads up to `buf.len()` bytes from the current position.
    /// Returns 0 only at end of stream.
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Repositions to an absolute byte offset from the start of the
    /// stream. Offsets past the end are allowed; the next read then
    /// reports end of stream.
    async fn seek_to(&mut self, pos: u64) -> io::Result<u64>;

    /// Total stream length in bytes.
    fn total_length(&self) -> i64;
}

/// A local file as a byte source.
pub struct FileSource {
    file: File,
    total_length: i64,
}

impl FileSource {
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path).await?;
        let total_length = file.metadata().await?.len() as i64;
        Ok(Self { file, total_length })
    }
}

#[async_trait]
impl ByteSource for FileSource {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf).await
    }

    async fn seek_to(&mut self, pos: u64) -> io::Result<u64> {
        self.file.seek(SeekFrom::Start(pos)).await
    }

    fn total_length(&self) -> i64 {
        self.total_length
    }
}

/// Resolves a seek request offset against the stream length.
///
/// `offset_bytes >= 0` is absolute from the start; `< 0` is relative to
/// the end (`-100` with a 1000-byte stream resolves to 900). A resolved
/// position before the start of the stream is a failed seek. Positions
/// past the end are valid - the consumer may seek into the not-yet-sent
/// tail, and the next read simply hits end of stream.
pub fn resolve_seek_offset(offset_bytes: i64, total_length: i64) -> Option<u64> {
    let target = if offset_bytes >= 0 {
        offset_bytes
    } else {
        total_length + offset_bytes
    };
    u64::try_from(target).ok()
}

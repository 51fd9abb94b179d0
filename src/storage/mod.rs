//! Part-indexed object storage
//!
//! Stores one metadata file and one file per part for every object, at paths
//! derived only from the object's content hash (see [`layout`]). Misses for
//! parts of known objects are filled from the upstream through a single
//! download coordinator that runs at most one fetch per part at a time.

pub mod disk;
mod download;
pub mod layout;

pub use disk::DiskStorage;
pub use layout::ZoneSettings;

use crate::error::Result;
use crate::models::{ObjectId, ObjectIndex, ObjectMetadata};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::{Cursor, SeekFrom};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, ReadBuf};
use tokio::sync::mpsc;

/// Capability set of an object storage
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_metadata(&self, id: &ObjectId) -> Result<ObjectMetadata>;

    /// Open one part, downloading it if needed
    async fn get_part(&self, idx: &ObjectIndex) -> Result<PartStream>;

    async fn save_metadata(&self, metadata: &ObjectMetadata) -> Result<()>;

    async fn save_part(&self, idx: &ObjectIndex, data: Bytes) -> Result<()>;

    /// Remove an object with all its parts; succeeds if it is already gone
    async fn discard(&self, id: &ObjectId) -> Result<()>;

    /// Remove one part; succeeds if it is already gone
    async fn discard_part(&self, idx: &ObjectIndex) -> Result<()>;

    /// Iterate over every stored object
    fn walk(&self) -> Walker;
}

/// Readable handle over the bytes of one part
///
/// Every caller gets its own handle, either an opened part file or a cursor
/// over a freshly downloaded buffer shared between waiters.
#[derive(Debug)]
pub enum PartStream {
    File(File),
    Memory(Cursor<Bytes>),
}

impl PartStream {
    /// Advance the stream by `n` bytes
    pub async fn skip(&mut self, n: u64) -> std::io::Result<()> {
        match self {
            PartStream::File(file) => {
                file.seek(SeekFrom::Current(n as i64)).await?;
            }
            PartStream::Memory(cursor) => {
                cursor.set_position(cursor.position() + n);
            }
        }
        Ok(())
    }

    /// Read the rest of the stream into memory
    pub async fn into_bytes(self) -> Result<Bytes> {
        match self {
            PartStream::File(mut file) => {
                let mut buf = Vec::new();
                file.read_to_end(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
            PartStream::Memory(cursor) => {
                let pos = cursor.position() as usize;
                let data = cursor.into_inner();
                Ok(data.slice(pos.min(data.len())..))
            }
        }
    }
}

impl From<Bytes> for PartStream {
    fn from(data: Bytes) -> Self {
        PartStream::Memory(Cursor::new(data))
    }
}

impl AsyncRead for PartStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            PartStream::File(file) => Pin::new(file).poll_read(cx, buf),
            PartStream::Memory(cursor) => Pin::new(cursor).poll_read(cx, buf),
        }
    }
}

/// A stored object and the parts present for it
#[derive(Debug, Clone)]
pub struct ObjectEntry {
    pub metadata: ObjectMetadata,
    /// Present parts, in ascending part order
    pub parts: Vec<StoredPart>,
}

/// One part file found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPart {
    pub index: ObjectIndex,
    /// Size of the part file in bytes
    pub size: u64,
}

/// Lazy iteration over the objects of a storage
///
/// Produced by [`Storage::walk`]. Dropping the walker stops the walk.
pub struct Walker {
    rx: mpsc::Receiver<Result<ObjectEntry>>,
}

impl Walker {
    pub(crate) fn new(rx: mpsc::Receiver<Result<ObjectEntry>>) -> Self {
        Walker { rx }
    }

    /// Next stored object, `None` once the walk is complete
    pub async fn next(&mut self) -> Option<Result<ObjectEntry>> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_stream_skip_and_read() {
        let mut stream = PartStream::from(Bytes::from_static(b"Hello, World!"));
        stream.skip(7).await.unwrap();
        assert_eq!(stream.into_bytes().await.unwrap(), Bytes::from_static(b"World!"));
    }

    #[tokio::test]
    async fn test_memory_streams_are_independent() {
        let data = Bytes::from_static(b"abcdef");
        let mut first = PartStream::from(data.clone());
        let second = PartStream::from(data);

        let mut buf = [0u8; 3];
        first.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");
        assert_eq!(second.into_bytes().await.unwrap(), Bytes::from_static(b"abcdef"));
    }
}

//! Splitting a response body into cached parts
//!
//! The writer receives the body of a response covering some byte range of an
//! object and stores every complete part it sees. Bytes before the first part
//! boundary of the range are skipped, since they only make up the tail of a
//! part whose beginning was never received.

use crate::algorithm::CacheAlgorithm;
use crate::error::{CacheError, Result};
use crate::models::{ContentRange, ObjectId, ObjectIndex};
use crate::storage::Storage;
use crate::zone::CacheZone;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

/// Stores a response body as object parts
pub struct PartWriter {
    algorithm: Arc<dyn CacheAlgorithm>,
    storage: Arc<dyn Storage>,
    object_id: ObjectId,
    part_size: u64,
    start_pos: u64,
    current_pos: u64,
    length: u64,
    object_size: u64,
    buffer: Vec<u8>,
}

impl PartWriter {
    /// Create a writer for a body covering `range` of `object_id`
    pub fn new(zone: &CacheZone, object_id: ObjectId, range: ContentRange) -> Self {
        PartWriter {
            algorithm: zone.algorithm().clone(),
            storage: zone.storage().clone(),
            object_id,
            part_size: zone.part_size(),
            start_pos: range.start,
            current_pos: range.start,
            length: range.length,
            object_size: range.object_size,
            buffer: Vec::new(),
        }
    }

    /// Bytes received so far
    pub fn written(&self) -> u64 {
        self.current_pos - self.start_pos
    }

    /// Feed the next chunk of the body
    ///
    /// Returns the number of bytes consumed, which is always `data.len()`.
    /// Writing past the announced length fails with
    /// [`CacheError::LengthMismatch`].
    pub async fn write(&mut self, mut data: &[u8]) -> Result<usize> {
        let consumed = data.len();
        let end = self.start_pos + self.length;
        if self.current_pos + consumed as u64 > end {
            return Err(CacheError::LengthMismatch {
                expected: self.length,
                actual: self.written() + consumed as u64,
            });
        }

        while !data.is_empty() {
            // Skip up to the next part boundary while nothing is buffered
            if self.buffer.is_empty() {
                let misalignment = self.current_pos % self.part_size;
                if misalignment != 0 {
                    let skip = ((self.part_size - misalignment) as usize).min(data.len());
                    self.current_pos += skip as u64;
                    data = &data[skip..];
                    continue;
                }
            }

            let room = self.part_size as usize - self.buffer.len();
            let take = room.min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            self.current_pos += take as u64;
            data = &data[take..];

            if self.buffer.len() as u64 == self.part_size || self.current_pos == self.object_size {
                self.flush().await?;
            }
        }

        Ok(consumed)
    }

    /// Finish the body
    ///
    /// Fails with [`CacheError::LengthMismatch`] if fewer bytes than announced
    /// were written. A buffered fragment that is neither a complete part nor
    /// the end of the object is dropped: a stored part always holds its whole
    /// byte range, so readers and restore can trust its size.
    pub async fn close(mut self) -> Result<()> {
        if self.written() != self.length {
            return Err(CacheError::LengthMismatch {
                expected: self.length,
                actual: self.written(),
            });
        }

        if !self.buffer.is_empty() {
            if self.buffer.len() as u64 == self.part_size || self.current_pos == self.object_size {
                self.flush().await?;
            } else {
                debug!(
                    "Dropping {} trailing bytes of {}: not a complete part",
                    self.buffer.len(),
                    self.object_id
                );
            }
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        let data = Bytes::from(std::mem::take(&mut self.buffer));
        let part = ((self.current_pos - data.len() as u64) / self.part_size) as u32;
        let idx = ObjectIndex::new(self.object_id.clone(), part);

        if !self.algorithm.should_keep(&idx) {
            debug!("Not keeping part {}", idx);
            return Ok(());
        }

        match self.storage.save_part(&idx, data).await {
            Ok(()) => {}
            Err(CacheError::AlreadyExists) => debug!("Part {} already stored", idx),
            Err(e) => {
                warn!("Failed to store part {}: {}", idx, e);
                return Err(e);
            }
        }

        if let Err(CacheError::AlreadyInCache) = self.algorithm.add_object(&idx) {
            self.algorithm.promote_object(&idx);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::TieredLru;
    use crate::metrics::ZoneMetrics;
    use crate::storage::DiskStorage;
    use tokio::sync::mpsc;

    fn zone(root: &std::path::Path, part_size: u64) -> CacheZone {
        let (tx, _rx) = mpsc::unbounded_channel();
        let algorithm: Arc<dyn CacheAlgorithm> = Arc::new(TieredLru::new(part_size, 64, tx));
        let metrics = ZoneMetrics::new("writer").unwrap();
        let storage: Arc<dyn Storage> = Arc::new(DiskStorage::new(
            root,
            part_size,
            algorithm.clone(),
            None,
            metrics.clone(),
        ));
        CacheZone::from_parts("writer", part_size, algorithm, storage, metrics)
    }

    async fn part(zone: &CacheZone, id: &ObjectId, part: u32) -> Option<Bytes> {
        let idx = ObjectIndex::new(id.clone(), part);
        match zone.storage().get_part(&idx).await {
            Ok(stream) => Some(stream.into_bytes().await.unwrap()),
            Err(e) if e.is_not_exist() => None,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    #[tokio::test]
    async fn test_whole_object_in_one_write() {
        let dir = tempfile::tempdir().unwrap();
        let zone = zone(dir.path(), 5);
        let id = zone.object_id("/hello");

        let mut writer = zone.part_writer(id.clone(), ContentRange::full(13));
        assert_eq!(writer.write(b"Hello, World!").await.unwrap(), 13);
        writer.close().await.unwrap();

        assert_eq!(part(&zone, &id, 0).await.unwrap(), Bytes::from_static(b"Hello"));
        assert_eq!(part(&zone, &id, 1).await.unwrap(), Bytes::from_static(b", Wor"));
        assert_eq!(part(&zone, &id, 2).await.unwrap(), Bytes::from_static(b"ld!"));
        assert_eq!(zone.stats().objects, 3);
    }

    #[tokio::test]
    async fn test_small_chunks_across_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let zone = zone(dir.path(), 5);
        let id = zone.object_id("/chunks");

        let mut writer = zone.part_writer(id.clone(), ContentRange::full(13));
        for chunk in [&b"Hel"[..], b"lo, W", b"o", b"rld!"] {
            writer.write(chunk).await.unwrap();
        }
        writer.close().await.unwrap();

        assert_eq!(part(&zone, &id, 1).await.unwrap(), Bytes::from_static(b", Wor"));
        assert_eq!(part(&zone, &id, 2).await.unwrap(), Bytes::from_static(b"ld!"));
    }

    #[tokio::test]
    async fn test_short_body_is_length_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let zone = zone(dir.path(), 5);
        let id = zone.object_id("/short");

        let mut writer = zone.part_writer(id.clone(), ContentRange::full(13));
        writer.write(b"Hello, Wor").await.unwrap();
        let err = writer.close().await.unwrap_err();
        assert_eq!(
            err,
            CacheError::LengthMismatch {
                expected: 13,
                actual: 10
            }
        );

        // Complete parts were stored before the body was cut
        assert!(part(&zone, &id, 0).await.is_some());
        assert!(part(&zone, &id, 1).await.is_some());
        assert!(part(&zone, &id, 2).await.is_none());
    }

    #[tokio::test]
    async fn test_writing_past_length_fails() {
        let dir = tempfile::tempdir().unwrap();
        let zone = zone(dir.path(), 5);
        let mut writer = zone.part_writer(zone.object_id("/long"), ContentRange::full(4));

        let err = writer.write(b"Hello").await.unwrap_err();
        assert_eq!(
            err,
            CacheError::LengthMismatch {
                expected: 4,
                actual: 5
            }
        );
    }

    #[tokio::test]
    async fn test_unaligned_start_skips_to_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let zone = zone(dir.path(), 5);
        let id = zone.object_id("/mid");

        // Body is bytes 3..=12 of "Hello, World!"
        let range = ContentRange::from_header("bytes 3-12/13").unwrap();
        let mut writer = zone.part_writer(id.clone(), range);
        writer.write(b"lo, World!").await.unwrap();
        writer.close().await.unwrap();

        assert!(part(&zone, &id, 0).await.is_none());
        assert_eq!(part(&zone, &id, 1).await.unwrap(), Bytes::from_static(b", Wor"));
        assert_eq!(part(&zone, &id, 2).await.unwrap(), Bytes::from_static(b"ld!"));
    }

    #[tokio::test]
    async fn test_range_ending_mid_part_drops_fragment() {
        let dir = tempfile::tempdir().unwrap();
        let zone = zone(dir.path(), 5);
        let id = zone.object_id("/head");

        let range = ContentRange::from_header("bytes 0-7/13").unwrap();
        let mut writer = zone.part_writer(id.clone(), range);
        writer.write(b"Hello, W").await.unwrap();
        writer.close().await.unwrap();

        assert_eq!(part(&zone, &id, 0).await.unwrap(), Bytes::from_static(b"Hello"));
        assert!(part(&zone, &id, 1).await.is_none());
    }

    #[tokio::test]
    async fn test_rewriting_existing_parts_promotes() {
        let dir = tempfile::tempdir().unwrap();
        let zone = zone(dir.path(), 5);
        let id = zone.object_id("/twice");

        for _ in 0..2 {
            let mut writer = zone.part_writer(id.clone(), ContentRange::full(5));
            writer.write(b"Hello").await.unwrap();
            writer.close().await.unwrap();
        }

        assert_eq!(zone.stats().objects, 1);
        assert_eq!(part(&zone, &id, 0).await.unwrap(), Bytes::from_static(b"Hello"));
    }
}

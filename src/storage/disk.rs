//! Filesystem backed storage

use super::download::{DownloadContext, DownloadCoordinator};
use super::layout;
use super::{ObjectEntry, PartStream, Storage, StoredPart, Walker};
use crate::algorithm::CacheAlgorithm;
use crate::error::{CacheError, Result};
use crate::metrics::ZoneMetrics;
use crate::models::{ObjectId, ObjectIndex, ObjectMetadata};
use crate::upstream::Upstream;
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const WALK_BUFFER: usize = 16;

/// Storage keeping metadata and parts as files under a zone root
pub struct DiskStorage {
    root: PathBuf,
    part_size: u64,
    algorithm: Arc<dyn CacheAlgorithm>,
    downloads: Option<DownloadCoordinator>,
}

impl DiskStorage {
    /// Create a new DiskStorage
    ///
    /// Without an upstream, `get_part` only serves parts already on disk.
    /// With one, it spawns the download coordinator and must be called from
    /// within a tokio runtime.
    ///
    /// # Arguments
    /// * `root` - Zone root directory, already prepared
    /// * `part_size` - Size of one part
    /// * `algorithm` - Algorithm notified of part reads and downloads
    /// * `upstream` - Source for parts missing on disk
    /// * `metrics` - Zone counters
    pub fn new(
        root: impl Into<PathBuf>,
        part_size: u64,
        algorithm: Arc<dyn CacheAlgorithm>,
        upstream: Option<Arc<dyn Upstream>>,
        metrics: ZoneMetrics,
    ) -> Self {
        let root = root.into();
        let downloads = upstream.map(|upstream| {
            DownloadCoordinator::spawn(DownloadContext {
                root: root.clone(),
                upstream,
                algorithm: algorithm.clone(),
                metrics,
            })
        });

        DiskStorage {
            root,
            part_size,
            algorithm,
            downloads,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl Storage for DiskStorage {
    async fn get_metadata(&self, id: &ObjectId) -> Result<ObjectMetadata> {
        let raw = fs::read(layout::metadata_path(&self.root, id)).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    async fn get_part(&self, idx: &ObjectIndex) -> Result<PartStream> {
        self.algorithm.lookup(idx);

        match File::open(layout::part_path(&self.root, idx)).await {
            Ok(file) => {
                self.algorithm.promote_object(idx);
                return Ok(PartStream::File(file));
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let Some(downloads) = &self.downloads else {
            return Err(CacheError::NotExist);
        };

        // Only parts of objects whose response is cached can be fetched
        let metadata = self.get_metadata(&idx.object_id).await?;
        let range = metadata
            .part_range(idx.part, self.part_size)
            .map_err(|_| CacheError::NotExist)?;

        let data = downloads.fetch(idx.clone(), range).await?;
        Ok(PartStream::from(data))
    }

    async fn save_metadata(&self, metadata: &ObjectMetadata) -> Result<()> {
        let raw = serde_json::to_vec(metadata)?;
        layout::write_new_file(&layout::metadata_path(&self.root, &metadata.id), &raw).await?;
        debug!("Saved metadata of {}", metadata.id);
        Ok(())
    }

    async fn save_part(&self, idx: &ObjectIndex, data: Bytes) -> Result<()> {
        layout::write_new_file(&layout::part_path(&self.root, idx), &data).await?;
        debug!("Saved part {} ({} bytes)", idx, data.len());
        Ok(())
    }

    async fn discard(&self, id: &ObjectId) -> Result<()> {
        let dir = layout::object_dir(&self.root, id);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        // Try every file even if some removals fail
        let mut errors = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Err(e) = layout::remove_if_exists(&entry.path()).await {
                errors.push(e);
            }
        }
        if errors.is_empty() {
            match fs::remove_dir(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => errors.push(CacheError::Io(format!("{}: {}", dir.display(), e))),
            }
        }

        debug!("Discarded {}", id);
        CacheError::combine(errors)
    }

    async fn discard_part(&self, idx: &ObjectIndex) -> Result<()> {
        layout::remove_if_exists(&layout::part_path(&self.root, idx)).await?;
        debug!("Discarded part {}", idx);
        Ok(())
    }

    fn walk(&self) -> Walker {
        let (tx, rx) = mpsc::channel(WALK_BUFFER);
        tokio::spawn(walk_zone(self.root.clone(), tx));
        Walker::new(rx)
    }
}

/// Subdirectories of `dir`, skipping dot entries and plain files
async fn subdirs(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if !hidden && entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

async fn walk_zone(root: PathBuf, tx: mpsc::Sender<Result<ObjectEntry>>) {
    if let Err(e) = walk_levels(&root, &tx).await {
        let _ = tx.send(Err(e.into())).await;
    }
}

async fn walk_levels(root: &Path, tx: &mpsc::Sender<Result<ObjectEntry>>) -> std::io::Result<()> {
    for namespace in subdirs(root).await? {
        for first in subdirs(&namespace).await? {
            for second in subdirs(&first).await? {
                for object_dir in subdirs(&second).await? {
                    let entry = match read_object_dir(&object_dir).await {
                        Ok(Some(entry)) => Ok(entry),
                        Ok(None) => continue,
                        Err(e) => Err(e),
                    };
                    if tx.send(entry).await.is_err() {
                        debug!("Walk abandoned by its consumer");
                        return Ok(());
                    }
                }
            }
        }
    }
    Ok(())
}

/// Read one object directory
///
/// Directories whose metadata is missing or unreadable cannot be addressed
/// any more and are removed; leftover temporary files are removed as well.
async fn read_object_dir(dir: &Path) -> Result<Option<ObjectEntry>> {
    let metadata: ObjectMetadata = match fs::read(dir.join(layout::METADATA_FILE)).await {
        Ok(raw) => match serde_json::from_slice(&raw) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("Removing {} with corrupt metadata: {}", dir.display(), e);
                fs::remove_dir_all(dir).await?;
                return Ok(None);
            }
        },
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!("Removing {} without metadata", dir.display());
            fs::remove_dir_all(dir).await?;
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    let mut parts = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(part) = layout::parse_part_name(&name) {
            let size = entry.metadata().await?.len();
            parts.push((part, size));
        } else if layout::is_temp_name(&name) {
            layout::remove_if_exists(&entry.path()).await?;
        }
    }
    parts.sort_unstable();

    let parts = parts
        .into_iter()
        .map(|(part, size)| StoredPart {
            index: ObjectIndex::new(metadata.id.clone(), part),
            size,
        })
        .collect();

    Ok(Some(ObjectEntry { metadata, parts }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::TieredLru;

    fn storage(root: &Path) -> (DiskStorage, Arc<TieredLru>) {
        let (tx, _rx) = mpsc::unbounded_channel();
        let algorithm = Arc::new(TieredLru::new(5, 64, tx));
        let storage = DiskStorage::new(
            root,
            5,
            algorithm.clone(),
            None,
            ZoneMetrics::new("test").unwrap(),
        );
        (storage, algorithm)
    }

    #[tokio::test]
    async fn test_metadata_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, _) = storage(dir.path());
        let id = ObjectId::new("ns", "/a");
        let mut metadata = ObjectMetadata::new(id.clone(), 200, 13, 60);
        metadata
            .headers
            .insert("content-type".to_string(), vec!["text/plain".to_string()]);

        assert_eq!(storage.get_metadata(&id).await, Err(CacheError::NotExist));
        storage.save_metadata(&metadata).await.unwrap();
        assert_eq!(storage.get_metadata(&id).await.unwrap(), metadata);
        assert_eq!(
            storage.save_metadata(&metadata).await,
            Err(CacheError::AlreadyExists)
        );
    }

    #[tokio::test]
    async fn test_get_part_hit_promotes() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, algorithm) = storage(dir.path());
        let idx = ObjectIndex::new(ObjectId::new("ns", "/a"), 0);

        assert!(storage.get_part(&idx).await.unwrap_err().is_not_exist());

        storage.save_part(&idx, Bytes::from_static(b"Hello")).await.unwrap();
        let data = storage.get_part(&idx).await.unwrap().into_bytes().await.unwrap();
        assert_eq!(data, Bytes::from_static(b"Hello"));
        assert!(algorithm.contains(&idx));

        // Only the read after the promotion finds the part tracked
        storage.get_part(&idx).await.unwrap();
        let stats = algorithm.stats();
        assert_eq!(stats.requests, 3);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_discard_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, _) = storage(dir.path());
        let id = ObjectId::new("ns", "/a");
        let idx = ObjectIndex::new(id.clone(), 1);

        storage.save_metadata(&ObjectMetadata::new(id.clone(), 200, 10, 60)).await.unwrap();
        storage.save_part(&idx, Bytes::from_static(b"World")).await.unwrap();

        storage.discard_part(&idx).await.unwrap();
        storage.discard_part(&idx).await.unwrap();
        assert!(storage.get_part(&idx).await.unwrap_err().is_not_exist());

        storage.discard(&id).await.unwrap();
        storage.discard(&id).await.unwrap();
        assert!(!layout::object_dir(dir.path(), &id).exists());
    }

    #[tokio::test]
    async fn test_walk_lists_objects_and_cleans_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, _) = storage(dir.path());

        let id = ObjectId::new("ns", "/walked");
        storage.save_metadata(&ObjectMetadata::new(id.clone(), 200, 13, 60)).await.unwrap();
        for part in [2u32, 0] {
            storage
                .save_part(&ObjectIndex::new(id.clone(), part), Bytes::from_static(b"x"))
                .await
                .unwrap();
        }

        // Parts without metadata
        let orphan = ObjectId::new("ns", "/orphan");
        storage
            .save_part(&ObjectIndex::new(orphan.clone(), 0), Bytes::from_static(b"x"))
            .await
            .unwrap();

        let mut walker = storage.walk();
        let mut entries = Vec::new();
        while let Some(entry) = walker.next().await {
            entries.push(entry.unwrap());
        }

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].metadata.id, id);
        let parts: Vec<(u32, u64)> = entries[0]
            .parts
            .iter()
            .map(|p| (p.index.part, p.size))
            .collect();
        assert_eq!(parts, vec![(0, 1), (2, 1)]);
        assert!(!layout::object_dir(dir.path(), &orphan).exists());
    }
}

//! Cache zone: one independently configured cache
//!
//! A zone binds one eviction algorithm, one storage and one scheduler, all
//! sized with the same part size. Nothing is shared between zones.

use crate::algorithm::{AlgorithmStats, CacheAlgorithm, TieredLru};
use crate::config::{AlgorithmKind, CacheConfig, ZoneConfig};
use crate::error::{CacheError, Result};
use crate::metrics::ZoneMetrics;
use crate::models::{ByteRange, ContentRange, ObjectId, ObjectIndex, ObjectMetadata};
use crate::part_reader::PartReader;
use crate::part_writer::PartWriter;
use crate::scheduler::Scheduler;
use crate::storage::{layout, DiskStorage, Storage};
use crate::upstream::Upstream;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One cache zone
pub struct CacheZone {
    id: String,
    part_size: u64,
    algorithm: Arc<dyn CacheAlgorithm>,
    storage: Arc<dyn Storage>,
    scheduler: Arc<Scheduler<ObjectId>>,
    metrics: ZoneMetrics,
}

impl CacheZone {
    /// Open the zone described by `config`
    ///
    /// Prepares the zone directory (discarding it if it was written with a
    /// different part size), builds the algorithm, storage and scheduler and
    /// starts forwarding evictions to the storage.
    ///
    /// # Arguments
    /// * `config` - Zone configuration
    /// * `upstream` - Source for parts missing on disk, if any
    pub async fn open(config: &ZoneConfig, upstream: Option<Arc<dyn Upstream>>) -> Result<Self> {
        config.validate()?;

        if layout::prepare_zone_dir(&config.path, config.part_size).await? {
            warn!("Zone {} started empty after part size change", config.id);
        }

        let metrics = ZoneMetrics::new(&config.id)
            .map_err(|e| CacheError::Config(format!("zone {} metrics: {}", config.id, e)))?;

        let (evictions_tx, evictions_rx) = mpsc::unbounded_channel();
        let algorithm: Arc<dyn CacheAlgorithm> = match config.algorithm {
            AlgorithmKind::Lru => Arc::new(TieredLru::new(
                config.part_size,
                config.storage_objects,
                evictions_tx,
            )),
        };

        let storage: Arc<dyn Storage> = Arc::new(DiskStorage::new(
            &config.path,
            config.part_size,
            algorithm.clone(),
            upstream,
            metrics.clone(),
        ));

        tokio::spawn(forward_evictions(
            evictions_rx,
            Arc::downgrade(&algorithm),
            Arc::downgrade(&storage),
            metrics.clone(),
        ));

        info!(
            "Opened zone {} at {} (part_size={}, storage_objects={})",
            config.id,
            config.path.display(),
            config.part_size,
            config.storage_objects
        );

        Ok(Self::from_parts(
            config.id.clone(),
            config.part_size,
            algorithm,
            storage,
            metrics,
        ))
    }

    /// Open every zone of `config` against a shared upstream
    pub async fn open_all(
        config: &CacheConfig,
        upstream: Option<Arc<dyn Upstream>>,
    ) -> Result<Vec<CacheZone>> {
        let mut zones = Vec::with_capacity(config.zones.len());
        for zone_config in &config.zones {
            zones.push(CacheZone::open(zone_config, upstream.clone()).await?);
        }
        Ok(zones)
    }

    /// Assemble a zone from already built components
    ///
    /// The caller guarantees that `algorithm` and `storage` use `part_size`.
    pub fn from_parts(
        id: impl Into<String>,
        part_size: u64,
        algorithm: Arc<dyn CacheAlgorithm>,
        storage: Arc<dyn Storage>,
        metrics: ZoneMetrics,
    ) -> Self {
        CacheZone {
            id: id.into(),
            part_size,
            algorithm,
            storage,
            scheduler: Arc::new(Scheduler::new()),
            metrics,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    pub fn algorithm(&self) -> &Arc<dyn CacheAlgorithm> {
        &self.algorithm
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn scheduler(&self) -> &Arc<Scheduler<ObjectId>> {
        &self.scheduler
    }

    pub fn metrics(&self) -> &ZoneMetrics {
        &self.metrics
    }

    pub fn stats(&self) -> AlgorithmStats {
        self.algorithm.stats()
    }

    /// Id of `path` in this zone's own namespace
    pub fn object_id(&self, path: &str) -> ObjectId {
        ObjectId::new(self.id.as_str(), path)
    }

    pub fn object_index(&self, id: &ObjectId, part: u32) -> ObjectIndex {
        ObjectIndex::new(id.clone(), part)
    }

    /// Index of the part holding byte `offset` of `id`
    pub fn index_for_offset(&self, id: &ObjectId, offset: u64) -> ObjectIndex {
        ObjectIndex::new(id.clone(), (offset / self.part_size) as u32)
    }

    /// Indexes of every part touched by `range`
    pub fn part_indexes(&self, id: &ObjectId, range: ByteRange) -> Vec<ObjectIndex> {
        range
            .parts(self.part_size)
            .map(|part| ObjectIndex::new(id.clone(), part))
            .collect()
    }

    /// Store the metadata of a new response and schedule its expiry
    pub async fn cache_metadata(&self, metadata: &ObjectMetadata) -> Result<()> {
        self.storage.save_metadata(metadata).await?;
        self.schedule_expiry(metadata);
        Ok(())
    }

    /// Discard the object once `metadata.expires_at` is reached
    ///
    /// Replaces any expiry already scheduled for the object.
    pub fn schedule_expiry(&self, metadata: &ObjectMetadata) {
        let id = metadata.id.clone();
        let algorithm = self.algorithm.clone();
        let storage = Arc::downgrade(&self.storage);
        let metrics = self.metrics.clone();
        let delay = Duration::from_secs(metadata.remaining_ttl());

        debug!("Scheduling expiry of {} in {:?}", id, delay);
        self.scheduler.add_event(
            id.clone(),
            move || {
                tokio::spawn(async move {
                    algorithm.remove_object(&id);
                    let Some(storage) = storage.upgrade() else {
                        return;
                    };
                    match storage.discard(&id).await {
                        Ok(()) => {
                            metrics.expirations.inc();
                            debug!("Expired {}", id);
                        }
                        Err(e) => warn!("Failed to discard expired {}: {}", id, e),
                    }
                });
            },
            delay,
        );
    }

    /// Remove an object from the algorithm and from disk
    ///
    /// Returns whether the object was cached at all.
    pub async fn purge(&self, id: &ObjectId) -> Result<bool> {
        let tracked = self.algorithm.remove_object(id);
        let stored = match self.storage.get_metadata(id).await {
            Ok(_) => true,
            Err(CacheError::NotExist) => false,
            Err(e) => {
                warn!("Reading metadata of purged {} failed: {}", id, e);
                true
            }
        };
        self.storage.discard(id).await?;

        self.metrics.purges.inc();
        info!("Purged {} (tracked={}, stored={})", id, tracked, stored);
        Ok(tracked || stored)
    }

    /// Writer caching a response body that covers `range` of `id`
    pub fn part_writer(&self, id: ObjectId, range: ContentRange) -> PartWriter {
        PartWriter::new(self, id, range)
    }

    /// Reader serving `range` of `id` from cached (or downloaded) parts
    pub fn part_reader(&self, id: ObjectId, range: ByteRange) -> PartReader {
        PartReader::new(self.storage.clone(), id, self.part_size, range)
    }

    /// Stop the scheduler; pending expiries are dropped
    pub fn shutdown(&self) {
        self.scheduler.destroy();
        info!("Zone {} shut down", self.id);
    }
}

async fn forward_evictions(
    mut rx: mpsc::UnboundedReceiver<ObjectIndex>,
    algorithm: Weak<dyn CacheAlgorithm>,
    storage: Weak<dyn Storage>,
    metrics: ZoneMetrics,
) {
    while let Some(idx) = rx.recv().await {
        let (Some(algorithm), Some(storage)) = (algorithm.upgrade(), storage.upgrade()) else {
            break;
        };
        discard_evicted(algorithm.as_ref(), storage.as_ref(), &metrics, &idx).await;
    }
    debug!("Eviction forwarder stopped");
}

/// Remove the file of a part the algorithm evicted
///
/// A read between the eviction and this call may have promoted the part
/// again; its file is then kept. A promotion racing with the unlink itself
/// is undone so the algorithm never tracks a part without a file.
async fn discard_evicted(
    algorithm: &dyn CacheAlgorithm,
    storage: &dyn Storage,
    metrics: &ZoneMetrics,
    idx: &ObjectIndex,
) {
    if algorithm.contains(idx) {
        debug!("Evicted part {} was read again, keeping it", idx);
        return;
    }

    metrics.evictions.inc();
    if let Err(e) = storage.discard_part(idx).await {
        warn!("Failed to discard evicted part {}: {}", idx, e);
        return;
    }
    if algorithm.contains(idx) {
        algorithm.remove(idx);
    }
}

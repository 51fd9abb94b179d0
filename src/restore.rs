//! Rebuilding a zone's state from disk at startup
//!
//! Walks the zone storage, drops whatever can no longer be served (expired
//! objects, parts outside the object or of the wrong size) and registers
//! everything else with the algorithm and the expiry scheduler.

use crate::error::{CacheError, Result};
use crate::storage::ObjectEntry;
use crate::zone::CacheZone;
use tracing::{debug, info, warn};

/// What a restore found on disk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Objects kept
    pub objects: usize,
    /// Parts registered with the algorithm
    pub parts: usize,
    /// Objects discarded because they had expired
    pub expired: usize,
    /// Parts discarded because they did not fit their object
    pub invalid_parts: usize,
    /// Directories that could not be read
    pub errors: usize,
}

/// Restore the state of `zone` from its storage
///
/// Only fails if discarding invalid data fails; unreadable object
/// directories are logged and counted.
pub async fn restore_zone(zone: &CacheZone) -> Result<RestoreReport> {
    let mut report = RestoreReport::default();
    let mut walker = zone.storage().walk();

    while let Some(entry) = walker.next().await {
        match entry {
            Ok(entry) => restore_object(zone, entry, &mut report).await?,
            Err(CacheError::NotExist) => {
                // Removed while walking
                continue;
            }
            Err(e) => {
                warn!("Skipping unreadable object in zone {}: {}", zone.id(), e);
                report.errors += 1;
            }
        }
    }

    info!(
        "Restored zone {}: {} objects, {} parts ({} expired, {} invalid parts, {} errors)",
        zone.id(),
        report.objects,
        report.parts,
        report.expired,
        report.invalid_parts,
        report.errors
    );
    Ok(report)
}

async fn restore_object(
    zone: &CacheZone,
    entry: ObjectEntry,
    report: &mut RestoreReport,
) -> Result<()> {
    let metadata = entry.metadata;

    if metadata.is_expired() {
        debug!("Discarding expired {}", metadata.id);
        zone.storage().discard(&metadata.id).await?;
        report.expired += 1;
        return Ok(());
    }

    for part in entry.parts {
        let expected = metadata
            .part_range(part.index.part, zone.part_size())
            .map(|range| range.size())
            .ok();

        if expected != Some(part.size) {
            debug!(
                "Discarding part {} of size {} (expected {:?})",
                part.index, part.size, expected
            );
            zone.storage().discard_part(&part.index).await?;
            report.invalid_parts += 1;
            continue;
        }

        match zone.algorithm().add_object(&part.index) {
            Ok(()) => report.parts += 1,
            Err(CacheError::AlreadyInCache) => {}
            Err(e) => return Err(e),
        }
    }

    zone.schedule_expiry(&metadata);
    report.objects += 1;
    Ok(())
}

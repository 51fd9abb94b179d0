//! On-disk layout of a cache zone
//!
//! ```text
//! <root>/.zone_settings.json
//! <root>/<cache_key>/<hash[0:2]>/<hash[2:4]>/<hash>/objID
//! <root>/<cache_key>/<hash[0:2]>/<hash[2:4]>/<hash>/000000
//! ```
//!
//! A cache key that is not a plain directory name is stored under `_` followed
//! by its hex encoding, so no key can leave the zone root.

use crate::error::{CacheError, Result};
use crate::models::{ObjectId, ObjectIndex};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Name of the metadata file inside an object directory
pub const METADATA_FILE: &str = "objID";

/// Name of the zone settings file in the zone root
pub const SETTINGS_FILE: &str = ".zone_settings.json";

const TEMP_MARKER: &str = ".tmp.";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Zone level settings persisted next to the objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneSettings {
    pub part_size: u64,
}

/// Whether `name` can be used as a single directory below the zone root
pub fn is_plain_dir_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(|c: char| c == '/' || c == '\\' || c == '\0')
}

/// Directory holding every object of `cache_key`
pub fn namespace_dir(root: &Path, cache_key: &str) -> PathBuf {
    if is_plain_dir_name(cache_key) {
        root.join(cache_key)
    } else {
        root.join(format!("_{}", hex::encode(cache_key)))
    }
}

pub fn object_dir(root: &Path, id: &ObjectId) -> PathBuf {
    let hash = id.str_hash();
    namespace_dir(root, id.cache_key())
        .join(&hash[0..2])
        .join(&hash[2..4])
        .join(&hash)
}

pub fn metadata_path(root: &Path, id: &ObjectId) -> PathBuf {
    object_dir(root, id).join(METADATA_FILE)
}

pub fn part_file_name(part: u32) -> String {
    format!("{:06}", part)
}

pub fn part_path(root: &Path, idx: &ObjectIndex) -> PathBuf {
    object_dir(root, &idx.object_id).join(part_file_name(idx.part))
}

/// Part number of a part file name, `None` for anything else
pub fn parse_part_name(name: &str) -> Option<u32> {
    if name.len() < 6 || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

pub fn is_temp_name(name: &str) -> bool {
    name.contains(TEMP_MARKER)
}

/// Write `data` to `path` unless it already exists
///
/// The bytes go to a temporary sibling first and are hard linked into place,
/// so readers never see a partial file and an existing file is never
/// replaced. Returns [`CacheError::AlreadyExists`] if `path` exists.
pub async fn write_new_file(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| CacheError::Io(format!("{} has no parent directory", path.display())))?;
    fs::create_dir_all(parent).await?;

    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(format!(
        "{}{}",
        TEMP_MARKER,
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    let temp_path = PathBuf::from(temp_name);

    let result = async {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::hard_link(&temp_path, path).await
    }
    .await;

    if let Err(e) = fs::remove_file(&temp_path).await {
        if e.kind() != ErrorKind::NotFound {
            warn!("Failed to remove temporary file {}: {}", temp_path.display(), e);
        }
    }

    result.map_err(CacheError::from)
}

/// Remove a file, treating a missing file as success
pub async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CacheError::Io(format!("{}: {}", path.display(), e))),
    }
}

/// Make `root` ready for a zone with the given part size
///
/// A zone directory written with a different part size is wiped, because its
/// part files cannot be reinterpreted. Returns `true` if the zone was wiped.
pub async fn prepare_zone_dir(root: &Path, part_size: u64) -> Result<bool> {
    fs::create_dir_all(root).await?;

    let settings_path = root.join(SETTINGS_FILE);
    let wanted = ZoneSettings { part_size };

    let wiped = match fs::read(&settings_path).await {
        Ok(raw) => match serde_json::from_slice::<ZoneSettings>(&raw) {
            Ok(stored) if stored == wanted => {
                debug!("Zone {} settings match", root.display());
                return Ok(false);
            }
            Ok(stored) => {
                warn!(
                    "Zone {} was stored with part_size {}, configured {}; discarding it",
                    root.display(),
                    stored.part_size,
                    part_size
                );
                wipe_dir(root).await?;
                true
            }
            Err(e) => {
                warn!(
                    "Zone {} has unreadable settings ({}); discarding it",
                    root.display(),
                    e
                );
                wipe_dir(root).await?;
                true
            }
        },
        Err(e) if e.kind() == ErrorKind::NotFound => {
            // Either a fresh zone or one created before settings were recorded
            if dir_has_entries(root).await? {
                warn!("Zone {} has no settings file; discarding it", root.display());
                wipe_dir(root).await?;
                true
            } else {
                false
            }
        }
        Err(e) => return Err(e.into()),
    };

    fs::write(&settings_path, serde_json::to_vec(&wanted)?).await?;
    info!("Initialized zone {} with part_size {}", root.display(), part_size);
    Ok(wiped)
}

async fn dir_has_entries(dir: &Path) -> Result<bool> {
    let mut entries = fs::read_dir(dir).await?;
    Ok(entries.next_entry().await?.is_some())
}

async fn wipe_dir(dir: &Path) -> Result<()> {
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            fs::remove_dir_all(&path).await?;
        } else {
            fs::remove_file(&path).await?;
        }
    }
    Ok(())
}

//! Core data models: object addressing, metadata and byte ranges

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

/// Length of an object content hash in bytes
pub const HASH_LEN: usize = 20;

/// Identifies one cached object: a cache namespace key plus a path
///
/// The SHA-1 of `cache_key` followed by `path` is computed once on
/// construction and used as the storage and lookup key.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "RawObjectId", into = "RawObjectId")]
pub struct ObjectId {
    cache_key: String,
    path: String,
    hash: [u8; HASH_LEN],
}

#[derive(Serialize, Deserialize)]
struct RawObjectId {
    cache_key: String,
    path: String,
}

impl From<RawObjectId> for ObjectId {
    fn from(raw: RawObjectId) -> Self {
        ObjectId::new(raw.cache_key, raw.path)
    }
}

impl From<ObjectId> for RawObjectId {
    fn from(id: ObjectId) -> Self {
        RawObjectId {
            cache_key: id.cache_key,
            path: id.path,
        }
    }
}

impl ObjectId {
    /// Create a new ObjectId
    ///
    /// # Arguments
    /// * `cache_key` - Namespace of the object (usually the zone's cache key)
    /// * `path` - Logical path of the object upstream
    pub fn new(cache_key: impl Into<String>, path: impl Into<String>) -> Self {
        let cache_key = cache_key.into();
        let path = path.into();

        let mut hasher = Sha1::new();
        hasher.update(cache_key.as_bytes());
        hasher.update(path.as_bytes());
        let hash = hasher.finalize().into();

        ObjectId {
            cache_key,
            path,
            hash,
        }
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw content hash
    pub fn hash(&self) -> &[u8; HASH_LEN] {
        &self.hash
    }

    /// Lowercase hex form of the content hash, as used on disk
    pub fn str_hash(&self) -> String {
        hex::encode(self.hash)
    }
}

impl PartialEq for ObjectId {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.cache_key == other.cache_key && self.path == other.path
    }
}

impl Eq for ObjectId {}

impl Hash for ObjectId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl PartialOrd for ObjectId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ObjectId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.hash
            .cmp(&other.hash)
            .then_with(|| self.cache_key.cmp(&other.cache_key))
            .then_with(|| self.path.cmp(&other.path))
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.cache_key, self.path, self.str_hash())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.cache_key, self.path)
    }
}

/// One fixed-size part of an object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectIndex {
    pub object_id: ObjectId,
    pub part: u32,
}

impl ObjectIndex {
    pub fn new(object_id: ObjectId, part: u32) -> Self {
        ObjectIndex { object_id, part }
    }
}

impl fmt::Display for ObjectIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.object_id, self.part)
    }
}

/// Metadata of a cached upstream response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub id: ObjectId,
    /// Unix timestamp (seconds) of the upstream response
    pub response_timestamp: i64,
    pub status_code: u16,
    /// Full size of the object body in bytes
    pub size: u64,
    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,
    /// Unix timestamp (seconds) after which the object is stale
    pub expires_at: i64,
}

impl ObjectMetadata {
    /// Create metadata for a response received now
    pub fn new(id: ObjectId, status_code: u16, size: u64, ttl_secs: i64) -> Self {
        let now = unix_now();
        ObjectMetadata {
            id,
            response_timestamp: now,
            status_code,
            size,
            headers: BTreeMap::new(),
            expires_at: now + ttl_secs,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= unix_now()
    }

    /// Seconds until expiry, zero if already expired
    pub fn remaining_ttl(&self) -> u64 {
        (self.expires_at - unix_now()).max(0) as u64
    }

    /// Number of parts the object body splits into
    pub fn part_count(&self, part_size: u64) -> u32 {
        if self.size == 0 {
            return 0;
        }
        ((self.size + part_size - 1) / part_size) as u32
    }

    /// Byte range covered by one part, clamped to the object size
    pub fn part_range(&self, part: u32, part_size: u64) -> Result<ByteRange> {
        let start = part as u64 * part_size;
        if start >= self.size {
            return Err(CacheError::InconsistentState(format!(
                "part {} starts at {} beyond object size {}",
                part, start, self.size
            )));
        }
        let end = (start + part_size - 1).min(self.size - 1);
        ByteRange::new(start, end)
    }
}

/// Current unix time in seconds
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Represents an inclusive byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    /// Starting byte position (inclusive)
    pub start: u64,
    /// Ending byte position (inclusive)
    pub end: u64,
}

impl ByteRange {
    /// Create a new ByteRange
    ///
    /// # Returns
    /// * `Ok(ByteRange)` if the range is valid
    /// * `Err(CacheError)` if start > end
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start > end {
            return Err(CacheError::InconsistentState(format!(
                "range start ({}) must be <= end ({})",
                start, end
            )));
        }
        Ok(ByteRange { start, end })
    }

    /// Get the size of this byte range in bytes
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Indexes of the parts this range touches
    pub fn parts(&self, part_size: u64) -> std::ops::RangeInclusive<u32> {
        (self.start / part_size) as u32..=(self.end / part_size) as u32
    }

    /// Convert this ByteRange to an HTTP Range header value
    pub fn to_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Position of a response body within its object
///
/// Describes what a part writer is about to receive: `length` bytes starting
/// at `start` of an object that is `object_size` bytes long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub length: u64,
    pub object_size: u64,
}

impl ContentRange {
    /// Range covering a whole object
    pub fn full(object_size: u64) -> Self {
        ContentRange {
            start: 0,
            length: object_size,
            object_size,
        }
    }

    /// Parse an HTTP Content-Range header value (`bytes start-end/total`)
    pub fn from_header(header: &str) -> Result<Self> {
        let parse_err = || CacheError::UpstreamFetch(format!("invalid Content-Range: {}", header));

        let rest = header.trim().strip_prefix("bytes ").ok_or_else(parse_err)?;
        let (range, total) = rest.split_once('/').ok_or_else(parse_err)?;
        let (start, end) = range.split_once('-').ok_or_else(parse_err)?;

        let start: u64 = start.trim().parse().map_err(|_| parse_err())?;
        let end: u64 = end.trim().parse().map_err(|_| parse_err())?;
        let object_size: u64 = total.trim().parse().map_err(|_| parse_err())?;

        if start > end || end >= object_size {
            return Err(parse_err());
        }

        Ok(ContentRange {
            start,
            length: end - start + 1,
            object_size,
        })
    }
}

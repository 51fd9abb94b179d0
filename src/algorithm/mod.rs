//! Cache eviction algorithms
//!
//! An algorithm decides which object parts stay cached. It only tracks
//! [`ObjectIndex`] values; when it evicts a part it reports the index on the
//! eviction channel it was built with, and the owner of the storage removes
//! the file.

pub mod tiered_lru;

pub use tiered_lru::TieredLru;

use crate::error::Result;
use crate::models::{ObjectId, ObjectIndex};

/// Statistics reported by a cache algorithm
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlgorithmStats {
    pub hits: u64,
    pub requests: u64,
    /// Number of tracked parts
    pub objects: u64,
    /// Bytes taken by the tracked parts
    pub size: u64,
}

impl AlgorithmStats {
    /// Hit ratio in the range [0, 1]
    pub fn hit_ratio(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.hits as f64 / self.requests as f64
        }
    }
}

/// Capability set of a cache eviction algorithm
pub trait CacheAlgorithm: Send + Sync {
    /// Whether `idx` is tracked; counts a request (and a hit) for statistics
    fn lookup(&self, idx: &ObjectIndex) -> bool;

    /// Whether `idx` is tracked, without touching the statistics
    fn contains(&self, idx: &ObjectIndex) -> bool;

    /// Whether a freshly downloaded part should be stored at all
    fn should_keep(&self, idx: &ObjectIndex) -> bool;

    /// Start tracking `idx`
    ///
    /// Returns [`CacheError::AlreadyInCache`](crate::CacheError::AlreadyInCache)
    /// when it is already tracked.
    fn add_object(&self, idx: &ObjectIndex) -> Result<()>;

    /// Record that `idx` satisfied a client read
    fn promote_object(&self, idx: &ObjectIndex);

    /// Stop tracking `idx` without reporting an eviction
    fn remove(&self, idx: &ObjectIndex) -> bool;

    /// Stop tracking every part of `id` without reporting evictions
    fn remove_object(&self, id: &ObjectId) -> bool;

    /// Bytes taken by all tracked parts
    fn consumed_size(&self) -> u64;

    fn stats(&self) -> AlgorithmStats;
}

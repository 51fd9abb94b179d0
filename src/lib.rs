//! Zone Cache
//!
//! Storage and eviction core of a CDN edge cache. Cached responses are split
//! into fixed-size parts, each addressed and evicted on its own, so a client
//! asking for a byte range only needs the parts that range touches.
//!
//! # Overview
//!
//! A cache is made of independent zones. Every zone has:
//!
//! - an eviction algorithm ([`TieredLru`]) deciding which parts stay,
//! - a storage ([`DiskStorage`]) holding one metadata file and one file per
//!   part for every object, and downloading missing parts from the upstream
//!   with at most one fetch per part in flight,
//! - a [`Scheduler`] discarding objects when they expire.
//!
//! Objects are addressed by an [`ObjectId`] (cache key namespace and path,
//! identified by a SHA-1 digest) and parts by an [`ObjectIndex`].
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use zone_cache::{CacheZone, ContentRange, ByteRange, ObjectMetadata, ZoneConfig};
//! use tokio::io::AsyncReadExt;
//!
//! # async fn run() -> zone_cache::Result<()> {
//! let zone = CacheZone::open(&ZoneConfig::new("static", "/var/cache/static"), None).await?;
//! let id = zone.object_id("/logo.png");
//!
//! // Cache a response
//! zone.cache_metadata(&ObjectMetadata::new(id.clone(), 200, 13, 3600)).await?;
//! let mut writer = zone.part_writer(id.clone(), ContentRange::full(13));
//! writer.write(b"Hello, World!").await?;
//! writer.close().await?;
//!
//! // Serve a range of it
//! let mut body = Vec::new();
//! zone.part_reader(id, ByteRange::new(7, 11)?)
//!     .read_to_end(&mut body)
//!     .await?;
//! assert_eq!(body, b"World");
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! ```yaml
//! upstream_url: "http://origin.example.com"
//! upstream_timeout_secs: 30
//! zones:
//!   - id: static
//!     path: /var/cache/static
//!     part_size: 2097152       # 2MB parts
//!     storage_objects: 4096    # parts kept by the zone
//!     algorithm: lru
//! ```
//!
//! See [`CacheConfig`] and [`ZoneConfig`] for the validation rules.
//!
//! # Error Handling
//!
//! Every fallible operation returns [`CacheError`]. [`CacheError::NotExist`]
//! only means "not cached" and is expected on every cold read:
//!
//! ```rust,no_run
//! use zone_cache::{CacheError, CacheZone, ObjectIndex, Storage};
//!
//! # async fn run(zone: &CacheZone, idx: ObjectIndex) {
//! match zone.storage().get_part(&idx).await {
//!     Ok(part) => println!("cached"),
//!     Err(CacheError::NotExist) => println!("miss"),
//!     Err(e) => eprintln!("storage error: {}", e),
//! }
//! # }
//! ```

pub mod algorithm;
pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod part_reader;
pub mod part_writer;
pub mod restore;
pub mod scheduler;
pub mod storage;
pub mod upstream;
pub mod zone;

// Re-export commonly used types
pub use algorithm::{AlgorithmStats, CacheAlgorithm, TieredLru};
pub use config::{AlgorithmKind, CacheConfig, ZoneConfig};
pub use error::{CacheError, Result};
pub use metrics::{MetricsSnapshot, ZoneMetrics};
pub use models::{ByteRange, ContentRange, ObjectId, ObjectIndex, ObjectMetadata};
pub use part_reader::PartReader;
pub use part_writer::PartWriter;
pub use restore::{restore_zone, RestoreReport};
pub use scheduler::Scheduler;
pub use storage::{DiskStorage, ObjectEntry, PartStream, Storage, StoredPart, Walker};
pub use upstream::{HttpUpstream, Upstream};
pub use zone::CacheZone;

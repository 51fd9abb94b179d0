//! Tests for rebuilding zone state from disk

use bytes::Bytes;
use std::path::Path;
use zone_cache::{
    restore_zone, CacheAlgorithm, CacheError, CacheZone, ContentRange, ObjectIndex,
    ObjectMetadata, RestoreReport, Storage, ZoneConfig,
};

fn config(root: &Path) -> ZoneConfig {
    let mut config = ZoneConfig::new("restore", root);
    config.part_size = 5;
    config.storage_objects = 64;
    config
}

async fn cache_body(zone: &CacheZone, path: &str, body: &[u8], ttl_secs: i64) {
    let id = zone.object_id(path);
    zone.cache_metadata(&ObjectMetadata::new(id.clone(), 200, body.len() as u64, ttl_secs))
        .await
        .unwrap();
    let mut writer = zone.part_writer(id, ContentRange::full(body.len() as u64));
    writer.write(body).await.unwrap();
    writer.close().await.unwrap();
}

#[tokio::test]
async fn test_restore_registers_stored_parts() {
    let dir = tempfile::tempdir().unwrap();
    {
        let zone = CacheZone::open(&config(dir.path()), None).await.unwrap();
        cache_body(&zone, "/a", b"Hello, World!", 3600).await;
        cache_body(&zone, "/b", b"12345", 3600).await;
        zone.shutdown();
    }

    let zone = CacheZone::open(&config(dir.path()), None).await.unwrap();
    assert_eq!(zone.stats().objects, 0);

    let report = restore_zone(&zone).await.unwrap();
    assert_eq!(
        report,
        RestoreReport {
            objects: 2,
            parts: 4,
            ..Default::default()
        }
    );
    assert_eq!(zone.stats().objects, 4);
    assert!(zone.algorithm().lookup(&ObjectIndex::new(zone.object_id("/a"), 2)));
    assert!(zone.scheduler().contains(&zone.object_id("/b")).await);
}

#[tokio::test]
async fn test_restore_discards_expired_objects() {
    let dir = tempfile::tempdir().unwrap();
    let zone = CacheZone::open(&config(dir.path()), None).await.unwrap();
    let id = zone.object_id("/stale");

    // Already expired when stored
    zone.storage()
        .save_metadata(&ObjectMetadata::new(id.clone(), 200, 5, -10))
        .await
        .unwrap();
    zone.storage()
        .save_part(&ObjectIndex::new(id.clone(), 0), Bytes::from_static(b"stale"))
        .await
        .unwrap();

    let report = restore_zone(&zone).await.unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(report.objects, 0);
    assert_eq!(
        zone.storage().get_metadata(&id).await,
        Err(CacheError::NotExist)
    );
}

#[tokio::test]
async fn test_restore_discards_parts_that_do_not_fit() {
    let dir = tempfile::tempdir().unwrap();
    let zone = CacheZone::open(&config(dir.path()), None).await.unwrap();
    let id = zone.object_id("/odd");

    zone.storage()
        .save_metadata(&ObjectMetadata::new(id.clone(), 200, 8, 3600))
        .await
        .unwrap();
    let parts: [(u32, &'static [u8]); 3] = [
        (0, b"Hello"),
        // Last part should hold 3 bytes
        (1, b"Wo"),
        // Beyond the end of the object
        (2, b"extra"),
    ];
    for (part, data) in parts {
        zone.storage()
            .save_part(&ObjectIndex::new(id.clone(), part), Bytes::from_static(data))
            .await
            .unwrap();
    }

    let report = restore_zone(&zone).await.unwrap();
    assert_eq!(report.objects, 1);
    assert_eq!(report.parts, 1);
    assert_eq!(report.invalid_parts, 2);

    for part in [1, 2] {
        let idx = ObjectIndex::new(id.clone(), part);
        assert!(zone.storage().get_part(&idx).await.unwrap_err().is_not_exist());
    }
    assert!(zone.algorithm().lookup(&ObjectIndex::new(id, 0)));
}

#[tokio::test]
async fn test_restore_of_empty_zone() {
    let dir = tempfile::tempdir().unwrap();
    let zone = CacheZone::open(&config(dir.path()), None).await.unwrap();

    let report = restore_zone(&zone).await.unwrap();
    assert_eq!(report, RestoreReport::default());
}

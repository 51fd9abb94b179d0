//! Integration tests for HttpUpstream against a mock origin

use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use zone_cache::{
    ByteRange, CacheError, CacheZone, HttpUpstream, ObjectMetadata, Upstream, ZoneConfig,
};

const BODY: &[u8] = b"Hello, World!";

fn upstream(server: &MockServer) -> HttpUpstream {
    HttpUpstream::new(server.uri(), Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_partial_content() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/file.bin"))
        .and(header("Range", "bytes=5-9"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 5-9/13")
                .set_body_bytes(&BODY[5..10]),
        )
        .expect(1)
        .mount(&server)
        .await;

    let data = upstream(&server).fetch_range("/file.bin", 5, 9).await.unwrap();
    assert_eq!(&data[..], b", Wor");
}

#[tokio::test]
async fn test_clamped_last_part() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/file.bin"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 10-12/13")
                .set_body_bytes(&BODY[10..]),
        )
        .mount(&server)
        .await;

    let data = upstream(&server).fetch_range("/file.bin", 10, 14).await.unwrap();
    assert_eq!(&data[..], b"ld!");
}

#[tokio::test]
async fn test_full_response_is_sliced() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/file.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
        .mount(&server)
        .await;

    let data = upstream(&server).fetch_range("/file.bin", 7, 11).await.unwrap();
    assert_eq!(&data[..], b"World");
}

#[tokio::test]
async fn test_wrong_content_range_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/file.bin"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 0-4/13")
                .set_body_bytes(&BODY[..5]),
        )
        .mount(&server)
        .await;

    let err = upstream(&server).fetch_range("/file.bin", 5, 9).await.unwrap_err();
    assert!(matches!(err, CacheError::UpstreamFetch(_)));
}

#[tokio::test]
async fn test_error_status() {
    let server = MockServer::start().await;
    for (status, file) in [(404u16, "/missing"), (500, "/broken")] {
        Mock::given(method("GET"))
            .and(path(file))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;
    }

    let upstream = upstream(&server);
    for file in ["/missing", "/broken"] {
        let err = upstream.fetch_range(file, 0, 4).await.unwrap_err();
        assert!(matches!(err, CacheError::UpstreamFetch(_)));
    }
}

#[tokio::test]
async fn test_zone_reads_through_to_origin_once() {
    let server = MockServer::start().await;
    for (range, content_range, body) in [
        ("bytes=0-4", "bytes 0-4/13", &BODY[0..5]),
        ("bytes=5-9", "bytes 5-9/13", &BODY[5..10]),
        ("bytes=10-12", "bytes 10-12/13", &BODY[10..]),
    ] {
        Mock::given(method("GET"))
            .and(path("/hello.txt"))
            .and(header("Range", range))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", content_range)
                    .set_body_bytes(body),
            )
            .expect(1)
            .mount(&server)
            .await;
    }

    let dir = tempfile::tempdir().unwrap();
    let mut config = ZoneConfig::new("origin", dir.path());
    config.part_size = 5;
    config.storage_objects = 64;
    let origin: Arc<dyn Upstream> = Arc::new(upstream(&server));
    let zone = CacheZone::open(&config, Some(origin)).await.unwrap();

    let id = zone.object_id("/hello.txt");
    zone.cache_metadata(&ObjectMetadata::new(id.clone(), 200, 13, 3600))
        .await
        .unwrap();

    // First read downloads every part, the second is served from disk
    for _ in 0..2 {
        let mut body = Vec::new();
        zone.part_reader(id.clone(), ByteRange::new(0, 12).unwrap())
            .read_to_end(&mut body)
            .await
            .unwrap();
        assert_eq!(body, BODY);
    }

    let counters = zone.metrics().snapshot();
    assert_eq!(counters.upstream_fetches, 3);
    assert_eq!(counters.parts_saved, 3);
    assert_eq!(zone.stats().objects, 3);
}

//! Upstream fetch capability used to fill cache misses

use crate::error::{CacheError, Result};
use crate::models::{ByteRange, ContentRange};
use async_trait::async_trait;
use bytes::Bytes;
use http::{header, StatusCode};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

/// Source of object bytes for cache misses
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Fetch bytes `start..=end` of the object at `path`
    ///
    /// The returned body may be shorter than requested when `end` lies past
    /// the end of the object.
    async fn fetch_range(&self, path: &str, start: u64, end: u64) -> Result<Bytes>;
}

/// Upstream origin reached over HTTP Range requests
pub struct HttpUpstream {
    client: Client,
    base_url: String,
}

impl HttpUpstream {
    /// Create a new HttpUpstream
    ///
    /// # Arguments
    /// * `base_url` - Origin base URL; object paths are appended to it
    /// * `timeout` - Per request timeout
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| CacheError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(HttpUpstream {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// Check that a 206 response covers what was asked for
    ///
    /// The origin may clamp `end` to the last byte of the object.
    fn validate_content_range(content_range: &str, requested: &ByteRange) -> Result<()> {
        let received = ContentRange::from_header(content_range)?;
        let received_end = received.start + received.length - 1;

        let clamped_end = requested.end.min(received.object_size - 1);
        if received.start != requested.start || received_end != clamped_end {
            return Err(CacheError::UpstreamFetch(format!(
                "Content-Range mismatch: expected {}-{}, got {}",
                requested.start, clamped_end, content_range
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn fetch_range(&self, path: &str, start: u64, end: u64) -> Result<Bytes> {
        let requested = ByteRange::new(start, end)?;
        let url = self.url_for(path);
        debug!("Fetching {} bytes={}-{}", url, start, end);

        let response = self
            .client
            .get(&url)
            .header(header::RANGE, requested.to_header())
            .send()
            .await
            .map_err(|e| {
                warn!("Upstream request failed for {}: {}", url, e);
                CacheError::UpstreamFetch(format!("request failed: {}", e))
            })?;

        let status = response.status();
        match status {
            StatusCode::PARTIAL_CONTENT => {
                let content_range = response
                    .headers()
                    .get(header::CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
                    .ok_or_else(|| {
                        CacheError::UpstreamFetch(
                            "missing Content-Range header in 206 response".to_string(),
                        )
                    })?;
                Self::validate_content_range(&content_range, &requested)?;

                response
                    .bytes()
                    .await
                    .map_err(|e| CacheError::UpstreamFetch(format!("failed to read body: {}", e)))
            }
            StatusCode::OK => {
                // Origin ignored the Range header and sent the whole object
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| CacheError::UpstreamFetch(format!("failed to read body: {}", e)))?;
                let len = body.len() as u64;
                if start >= len {
                    return Err(CacheError::UpstreamFetch(format!(
                        "range start {} beyond object size {}",
                        start, len
                    )));
                }
                let stop = end.min(len - 1) + 1;
                Ok(body.slice(start as usize..stop as usize))
            }
            _ => {
                warn!("Upstream returned {} for {}", status, url);
                Err(CacheError::UpstreamFetch(format!(
                    "unexpected status {} for {}",
                    status, url
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_content_range() {
        let requested = ByteRange::new(0, 99).unwrap();
        assert!(HttpUpstream::validate_content_range("bytes 0-99/1000", &requested).is_ok());
        assert!(HttpUpstream::validate_content_range("bytes 0-49/1000", &requested).is_err());
        assert!(HttpUpstream::validate_content_range("bytes 1-99/1000", &requested).is_err());

        // Last part of a 60 byte object
        assert!(HttpUpstream::validate_content_range("bytes 0-59/60", &requested).is_ok());
    }

    #[test]
    fn test_url_for() {
        let upstream = HttpUpstream::new("http://origin/", Duration::from_secs(1)).unwrap();
        assert_eq!(upstream.url_for("/a/b"), "http://origin/a/b");
        assert_eq!(upstream.url_for("a"), "http://origin/a");
    }
}

//! Prometheus metrics for a cache zone
//!
//! Each zone registers its counters in its own [`Registry`] with a constant
//! `zone` label, so several zones (and tests) never collide in the default
//! registry.

use prometheus::{Encoder, IntCounter, Opts, Registry, TextEncoder};

/// Counters of one cache zone
#[derive(Clone)]
pub struct ZoneMetrics {
    registry: Registry,

    /// Upstream fetches started by the download coordinator
    pub upstream_fetches: IntCounter,

    /// Requests that joined a download already in flight
    pub downloads_joined: IntCounter,

    pub downloads_failed: IntCounter,

    /// Parts written to disk
    pub parts_saved: IntCounter,

    /// Parts dropped by the eviction algorithm
    pub evictions: IntCounter,

    pub purges: IntCounter,

    /// Objects discarded because their expiry time passed
    pub expirations: IntCounter,
}

/// Point-in-time copy of [`ZoneMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub upstream_fetches: u64,
    pub downloads_joined: u64,
    pub downloads_failed: u64,
    pub parts_saved: u64,
    pub evictions: u64,
    pub purges: u64,
    pub expirations: u64,
}

impl ZoneMetrics {
    /// Create metrics for the zone `zone_id` in a fresh registry
    pub fn new(zone_id: &str) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let counter = IntCounter::with_opts(
                Opts::new(format!("zone_cache_{}", name), help).const_label("zone", zone_id),
            )?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let upstream_fetches = counter(
            "upstream_fetches_total",
            "Number of part downloads started against the upstream",
        )?;
        let downloads_joined = counter(
            "downloads_joined_total",
            "Number of part requests served by a download already in flight",
        )?;
        let downloads_failed = counter(
            "downloads_failed_total",
            "Number of part downloads that failed",
        )?;
        let parts_saved = counter("parts_saved_total", "Number of parts written to disk")?;
        let evictions = counter("evictions_total", "Number of parts evicted")?;
        let purges = counter("purges_total", "Number of purged objects")?;
        let expirations = counter("expirations_total", "Number of expired objects discarded")?;

        Ok(ZoneMetrics {
            registry,
            upstream_fetches,
            downloads_joined,
            downloads_failed,
            parts_saved,
            evictions,
            purges,
            expirations,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            upstream_fetches: self.upstream_fetches.get(),
            downloads_joined: self.downloads_joined.get(),
            downloads_failed: self.downloads_failed.get(),
            parts_saved: self.parts_saved.get(),
            evictions: self.evictions.get(),
            purges: self.purges.get(),
            expirations: self.expirations.get(),
        }
    }

    /// Render all counters in the Prometheus text exposition format
    pub fn gather_text(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode zone metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_text() {
        let metrics = ZoneMetrics::new("videos").unwrap();
        metrics.upstream_fetches.inc();
        metrics.evictions.inc_by(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.upstream_fetches, 1);
        assert_eq!(snapshot.evictions, 3);
        assert_eq!(snapshot.purges, 0);

        let text = metrics.gather_text();
        assert!(text.contains("zone_cache_evictions_total{zone=\"videos\"} 3"));
    }

    #[test]
    fn test_two_zones_do_not_collide() {
        assert!(ZoneMetrics::new("a").is_ok());
        assert!(ZoneMetrics::new("a").is_ok());
    }
}

//! Zone Cache Server
//!
//! Opens the configured cache zones, restores their state from disk and keeps
//! them running until interrupted.

use anyhow::Context;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use zone_cache::{restore_zone, CacheConfig, CacheZone, HttpUpstream, Upstream};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Main entry point
///
/// # Usage
/// ```bash
/// # Start with default config (zone_cache.yaml)
/// zone-cache
///
/// # Start with custom config
/// zone-cache /path/to/config.yaml
/// ```
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting Zone Cache");

    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "zone_cache.yaml".to_string());

    info!("Loading configuration from: {}", config_path);
    let config = CacheConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path))?;

    info!("Configuration loaded successfully");
    info!("  - Upstream: {:?}", config.upstream_url);
    info!("  - Upstream timeout: {} seconds", config.upstream_timeout_secs);
    for zone in &config.zones {
        info!(
            "  - Zone {}: {} (part_size={} KB, storage_objects={})",
            zone.id,
            zone.path.display(),
            zone.part_size / 1024,
            zone.storage_objects
        );
    }

    let upstream: Option<Arc<dyn Upstream>> = match &config.upstream_url {
        Some(url) => Some(Arc::new(HttpUpstream::new(
            url.as_str(),
            Duration::from_secs(config.upstream_timeout_secs),
        )?)),
        None => None,
    };

    let zones = CacheZone::open_all(&config, upstream).await?;
    for zone in &zones {
        if let Err(e) = restore_zone(zone).await {
            error!("Failed to restore zone {}: {}", zone.id(), e);
        }
    }
    info!("{} zones ready", zones.len());

    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => log_stats(&zones),
            res = tokio::signal::ctrl_c() => {
                res.context("waiting for shutdown signal")?;
                break;
            }
        }
    }

    info!("Shutting down");
    log_stats(&zones);
    for zone in &zones {
        zone.shutdown();
    }
    Ok(())
}

fn log_stats(zones: &[CacheZone]) {
    for zone in zones {
        let stats = zone.stats();
        let counters = zone.metrics().snapshot();
        info!(
            "Zone {}: {} parts, {} bytes, hit ratio {:.2}, {} upstream fetches, {} evictions",
            zone.id(),
            stats.objects,
            stats.size,
            stats.hit_ratio(),
            counters.upstream_fetches,
            counters.evictions
        );
    }
}

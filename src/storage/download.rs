//! Deduplicated part downloads
//!
//! One coordinator task owns the table of in-flight downloads and is reached
//! only through its message queue. The first request for a part starts one
//! download task; later requests for the same part queue behind it. When the
//! download finishes the coordinator drops the table entry and hands the
//! result to every waiter in arrival order.
//!
//! The coordinator keeps only a weak handle to its own queue, so it stops as
//! soon as the storage is dropped and the downloads still running have
//! reported back.

use super::layout;
use crate::algorithm::CacheAlgorithm;
use crate::error::{CacheError, Result};
use crate::metrics::ZoneMetrics;
use crate::models::{ByteRange, ObjectIndex};
use crate::upstream::Upstream;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

type Waiter = oneshot::Sender<Result<Bytes>>;

enum DownloadMessage {
    Request {
        index: ObjectIndex,
        range: ByteRange,
        reply: Waiter,
    },
    Finished {
        index: ObjectIndex,
        result: Result<Bytes>,
    },
}

/// Everything a download task needs
pub(crate) struct DownloadContext {
    pub root: PathBuf,
    pub upstream: Arc<dyn Upstream>,
    pub algorithm: Arc<dyn CacheAlgorithm>,
    pub metrics: ZoneMetrics,
}

/// Handle to the download coordinator task
pub(crate) struct DownloadCoordinator {
    tx: mpsc::UnboundedSender<DownloadMessage>,
}

impl DownloadCoordinator {
    /// Spawn the coordinator task
    pub fn spawn(ctx: DownloadContext) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(coordinate(rx, tx.downgrade(), Arc::new(ctx)));
        DownloadCoordinator { tx }
    }

    /// Bytes of the part `index`, covering `range` of the object
    ///
    /// Joins a download already in flight for the same part.
    pub async fn fetch(&self, index: ObjectIndex, range: ByteRange) -> Result<Bytes> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DownloadMessage::Request { index, range, reply })
            .map_err(|_| CacheError::Shutdown)?;
        rx.await.map_err(|_| CacheError::Shutdown)?
    }
}

async fn coordinate(
    mut rx: mpsc::UnboundedReceiver<DownloadMessage>,
    tx: mpsc::WeakUnboundedSender<DownloadMessage>,
    ctx: Arc<DownloadContext>,
) {
    let mut downloading: HashMap<ObjectIndex, Vec<Waiter>> = HashMap::new();

    while let Some(msg) = rx.recv().await {
        match msg {
            DownloadMessage::Request { index, range, reply } => {
                if let Some(waiters) = downloading.get_mut(&index) {
                    debug!("Joining in-flight download of {}", index);
                    ctx.metrics.downloads_joined.inc();
                    waiters.push(reply);
                    continue;
                }

                let Some(tx) = tx.upgrade() else {
                    let _ = reply.send(Err(CacheError::Shutdown));
                    continue;
                };

                debug!("Starting download of {} ({}-{})", index, range.start, range.end);
                ctx.metrics.upstream_fetches.inc();
                downloading.insert(index.clone(), vec![reply]);
                tokio::spawn(download(ctx.clone(), index, range, tx));
            }
            DownloadMessage::Finished { index, result } => {
                let waiters = downloading.remove(&index).unwrap_or_default();
                if let Err(e) = &result {
                    ctx.metrics.downloads_failed.inc();
                    warn!(
                        "Download of {} failed for {} waiters: {}",
                        index,
                        waiters.len(),
                        e
                    );
                }
                for waiter in waiters {
                    // A waiter that gave up is not an error
                    let _ = waiter.send(result.clone());
                }
            }
        }
    }

    info!(
        "Download coordinator stopped ({} downloads abandoned)",
        downloading.len()
    );
}

async fn download(
    ctx: Arc<DownloadContext>,
    index: ObjectIndex,
    range: ByteRange,
    tx: mpsc::UnboundedSender<DownloadMessage>,
) {
    let result = fetch_and_store(&ctx, &index, range).await;
    let _ = tx.send(DownloadMessage::Finished { index, result });
}

async fn fetch_and_store(
    ctx: &DownloadContext,
    index: &ObjectIndex,
    range: ByteRange,
) -> Result<Bytes> {
    let data = ctx
        .upstream
        .fetch_range(index.object_id.path(), range.start, range.end)
        .await?;

    if data.len() as u64 != range.size() {
        return Err(CacheError::UpstreamFetch(format!(
            "expected {} bytes for {}, got {}",
            range.size(),
            index,
            data.len()
        )));
    }

    if !ctx.algorithm.should_keep(index) {
        debug!("Not keeping downloaded part {}", index);
        return Ok(data);
    }

    let path = layout::part_path(&ctx.root, index);
    match layout::write_new_file(&path, &data).await {
        Ok(()) => {
            ctx.metrics.parts_saved.inc();
            ctx.algorithm.promote_object(index);
        }
        Err(CacheError::AlreadyExists) => ctx.algorithm.promote_object(index),
        // The waiters still get the bytes; only caching failed
        Err(e) => warn!("Failed to store downloaded part {}: {}", index, e),
    }

    Ok(data)
}

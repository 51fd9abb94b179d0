//! Time-keyed expiration scheduler
//!
//! Runs a callback for a key once its delay elapses. Two tasks cooperate
//! over message queues and share no state:
//! - the table task owns `key -> (sequence, callback)`
//! - the timer task owns a min-heap of `(expiry, sequence)` and sleeps until
//!   the soonest one, then asks the table task to fire that key
//!
//! Every `add_event` gets a fresh sequence number. The table only runs a
//! callback when the fired sequence matches the stored one, so an expiry left
//! behind by a replaced or cleared event does nothing.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

/// Callback run when an event expires
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

enum TableMessage<K> {
    Insert { key: K, seq: u64, callback: Callback },
    Fire { key: K, seq: u64 },
    Contains { key: K, reply: oneshot::Sender<bool> },
    Clear,
    Shutdown,
}

enum TimerMessage<K> {
    Schedule { key: K, seq: u64, at: Instant },
    Clear,
    Shutdown,
}

/// Expiration service keyed by `K`
pub struct Scheduler<K> {
    table_tx: mpsc::UnboundedSender<TableMessage<K>>,
    timer_tx: mpsc::UnboundedSender<TimerMessage<K>>,
    next_seq: AtomicU64,
}

impl<K> Scheduler<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    /// Create a scheduler and spawn its two tasks
    ///
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let (table_tx, table_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::table_task(table_rx));
        tokio::spawn(Self::timer_task(timer_rx, table_tx.clone()));

        Scheduler {
            table_tx,
            timer_tx,
            next_seq: AtomicU64::new(0),
        }
    }

    /// Run `callback` after `delay`, replacing any pending event for `key`
    pub fn add_event<F>(&self, key: K, callback: F, delay: Duration)
    where
        F: FnOnce() + Send + 'static,
    {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let at = Instant::now() + delay;

        // Table first so the callback is in place before the timer can fire it
        let _ = self.table_tx.send(TableMessage::Insert {
            key: key.clone(),
            seq,
            callback: Box::new(callback),
        });
        let _ = self.timer_tx.send(TimerMessage::Schedule { key, seq, at });
    }

    /// Whether an event for `key` is pending
    pub async fn contains(&self, key: &K) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .table_tx
            .send(TableMessage::Contains {
                key: key.clone(),
                reply,
            })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Drop every pending event without running it
    pub fn cleanup(&self) {
        let _ = self.table_tx.send(TableMessage::Clear);
        let _ = self.timer_tx.send(TimerMessage::Clear);
    }

    /// Stop both tasks; pending events are dropped
    pub fn destroy(&self) {
        let _ = self.table_tx.send(TableMessage::Shutdown);
        let _ = self.timer_tx.send(TimerMessage::Shutdown);
    }

    async fn table_task(mut rx: mpsc::UnboundedReceiver<TableMessage<K>>) {
        let mut table: HashMap<K, (u64, Callback)> = HashMap::new();

        while let Some(msg) = rx.recv().await {
            match msg {
                TableMessage::Insert { key, seq, callback } => {
                    table.insert(key, (seq, callback));
                }
                TableMessage::Fire { key, seq } => {
                    let current = matches!(table.get(&key), Some((stored, _)) if *stored == seq);
                    if current {
                        if let Some((_, callback)) = table.remove(&key) {
                            callback();
                        }
                    } else {
                        trace!("Ignoring stale expiry with sequence {}", seq);
                    }
                }
                TableMessage::Contains { key, reply } => {
                    let _ = reply.send(table.contains_key(&key));
                }
                TableMessage::Clear => table.clear(),
                TableMessage::Shutdown => break,
            }
        }

        debug!("Scheduler table task stopped with {} pending events", table.len());
    }

    async fn timer_task(
        mut rx: mpsc::UnboundedReceiver<TimerMessage<K>>,
        table_tx: mpsc::UnboundedSender<TableMessage<K>>,
    ) {
        let mut heap: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
        let mut keys: HashMap<u64, K> = HashMap::new();

        loop {
            let next = heap.peek().map(|Reverse((at, _))| *at);

            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(TimerMessage::Schedule { key, seq, at }) => {
                        heap.push(Reverse((at, seq)));
                        keys.insert(seq, key);
                    }
                    Some(TimerMessage::Clear) => {
                        heap.clear();
                        keys.clear();
                    }
                    Some(TimerMessage::Shutdown) | None => break,
                },
                _ = sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                    let now = Instant::now();
                    while let Some(Reverse((at, seq))) = heap.peek().copied() {
                        if at > now {
                            break;
                        }
                        heap.pop();
                        if let Some(key) = keys.remove(&seq) {
                            if table_tx.send(TableMessage::Fire { key, seq }).is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }

        debug!("Scheduler timer task stopped");
    }
}

impl<K> Default for Scheduler<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Drop for Scheduler<K> {
    fn drop(&mut self) {
        let _ = self.table_tx.send(TableMessage::Shutdown);
        let _ = self.timer_tx.send(TimerMessage::Shutdown);
    }
}

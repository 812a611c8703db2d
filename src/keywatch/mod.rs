//! Long-poll primitive over keyspace notifications.
//!
//! # Responsibilities
//! - Maintain one pub/sub subscription for the watched key prefix
//! - Coalesce N concurrent waiters per key onto O(1) reads per event
//! - Answer WatchKey with one of four verdicts
//!
//! # Design Decisions
//! - The subscriber registry is one mutex-guarded map; the lock is held
//!   only around map operations and sends are non-blocking (capacity 1)
//! - Waiters tolerate a missed event: they compare the delivered value,
//!   and re-read the store when the channel closes under them
//! - The listener reconnects forever with jittered exponential backoff

pub mod backoff;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};

use crate::kvstore::KvStore;
use crate::observability::metrics;

use backoff::ReconnectBackoff;

const KEYSPACE_CHANNEL_MARKER: &str = "__:";

/// How WatchKey returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The watch timeout elapsed without a notification.
    Timeout,
    /// The caller's expected value was never current.
    AlreadyChanged,
    /// A notification arrived and the value differs from the expected one.
    SeenChange,
    /// A notification arrived but the value still matches.
    NoChange,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<String>,
}

/// Key → waiting subscribers. One per process.
struct Registry {
    map: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl Registry {
    fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn add(&self, key: &str, tx: mpsc::Sender<String>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut map = self.map.lock().unwrap();
        map.entry(key.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        metrics::keywatchers_add(1);
        id
    }

    fn remove(&self, key: &str, id: u64) {
        let mut map = self.map.lock().unwrap();
        if let Some(subs) = map.get_mut(key) {
            if let Some(pos) = subs.iter().position(|s| s.id == id) {
                subs.remove(pos);
                metrics::keywatchers_add(-1);
            }
            if subs.is_empty() {
                map.remove(key);
            }
        }
    }

    /// Detach every subscriber currently waiting on `key`.
    fn take(&self, key: &str) -> Vec<Subscriber> {
        let subs = self.map.lock().unwrap().remove(key).unwrap_or_default();
        metrics::keywatchers_add(-(subs.len() as i64));
        subs
    }

    fn count(&self) -> usize {
        self.map.lock().unwrap().values().map(Vec::len).sum()
    }
}

/// Coalescing key watcher backed by keyspace pub/sub notifications.
pub struct KeyWatcher {
    kv: KvStore,
    client: redis::Client,
    pattern: String,
    registry: Registry,
}

impl KeyWatcher {
    pub fn new(kv: KvStore, client: redis::Client, watch_prefix: &str) -> Self {
        Self {
            kv,
            client,
            pattern: format!("__keyspace@*__:{}*", watch_prefix),
            registry: Registry::new(),
        }
    }

    /// Number of registered watchers, across all keys.
    pub fn subscriber_count(&self) -> usize {
        self.registry.count()
    }

    /// Deliver the current value once to every waiter for `key`. Driven
    /// by the pub/sub listener; callable directly by alternative event
    /// sources.
    pub async fn notify(&self, key: &str) {
        let value = match self.kv.get_string(key).await {
            Ok(v) => v.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(key, "keywatch: read after notification: {}", e);
                String::new()
            }
        };

        for sub in self.registry.take(key) {
            // Capacity-1 channel: the send never blocks, and a full channel
            // means the waiter already has a wakeup pending.
            let _ = sub.tx.try_send(value.clone());
        }
    }

    /// Wait for `key` to move away from `expected`, or for the timeout.
    pub async fn watch_key(
        &self,
        key: &str,
        expected: &str,
        timeout: Duration,
    ) -> Result<WatchOutcome, redis::RedisError> {
        let (tx, rx) = mpsc::channel(1);
        let id = self.registry.add(key, tx);
        let outcome = self.watch_inner(key, expected, timeout, rx).await;
        self.registry.remove(key, id);
        outcome
    }

    async fn watch_inner(
        &self,
        key: &str,
        expected: &str,
        timeout: Duration,
        mut rx: mpsc::Receiver<String>,
    ) -> Result<WatchOutcome, redis::RedisError> {
        let current = self.kv.get_string(key).await?.unwrap_or_default();
        if current != expected {
            return Ok(WatchOutcome::AlreadyChanged);
        }

        tokio::select! {
            delivered = rx.recv() => {
                let value = match delivered {
                    Some(v) => v,
                    // Channel closed without a send: recheck the store.
                    None => self.kv.get_string(key).await?.unwrap_or_default(),
                };
                if value == expected {
                    Ok(WatchOutcome::NoChange)
                } else {
                    Ok(WatchOutcome::SeenChange)
                }
            }
            _ = tokio::time::sleep(timeout) => Ok(WatchOutcome::Timeout),
        }
    }

    /// Run the pub/sub listener until the serve loop signals stop.
    /// There Can Only Be One.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        let mut backoff = ReconnectBackoff::new();
        loop {
            tokio::select! {
                _ = stop.changed() => return,
                result = self.listen() => {
                    match result {
                        Ok(()) => backoff.reset(),
                        Err(e) => tracing::warn!("keywatch: pub/sub connection lost: {}", e),
                    }
                }
            }

            let delay = backoff.next_delay();
            tokio::select! {
                _ = stop.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn listen(&self) -> Result<(), redis::RedisError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(&self.pattern).await?;
        tracing::info!(pattern = %self.pattern, "keywatch: subscribed");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let channel = msg.get_channel_name().to_string();
            if let Some(key) = keyspace_key(&channel) {
                self.notify(key).await;
            }
        }
        Ok(())
    }
}

/// Extract the watched key from a keyspace channel name such as
/// `__keyspace@0__:runner:build_queue:token`.
fn keyspace_key(channel: &str) -> Option<&str> {
    channel
        .find(KEYSPACE_CHANNEL_MARKER)
        .map(|idx| &channel[idx + KEYSPACE_CHANNEL_MARKER.len()..])
        .filter(|key| !key.is_empty())
}

//! Shared key-value backend used by every process of the cluster.
//!
//! The backend offers the small Redis-like surface the match server needs:
//! TTL'd values, atomic set-if-absent, compare-and-delete, counters and a
//! pub/sub channel. Values are opaque bytes so that every read hands out a
//! fresh snapshot and nothing is shared by reference between processes.

use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Capacity of each in-memory pub/sub channel
const CHANNEL_CAPACITY: usize = 1024;

/// Backend errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to encode value for {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Corrupted value under {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Value under {0} is not a counter")]
    NotACounter(String),
}

/// Operations every shared backend must provide.
pub trait SharedBackend: Send + Sync + 'static {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Bytes>, StoreError>>;

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Stores the value only if the key is absent (or expired). Returns
    /// whether the write happened.
    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<bool, StoreError>>;

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, StoreError>>;

    /// Deletes the key only while it still holds `expected`.
    fn delete_if_equals<'a>(
        &'a self,
        key: &'a str,
        expected: Bytes,
    ) -> BoxFuture<'a, Result<bool, StoreError>>;

    /// Atomically increments a counter, starting from zero.
    fn incr<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<i64, StoreError>>;

    /// Publishes to every current subscriber of `channel`; returns how many
    /// received it.
    fn publish<'a>(&'a self, channel: &'a str, payload: Bytes)
        -> BoxFuture<'a, Result<usize, StoreError>>;

    /// Subscribes to `channel`. Messages published before this call are not
    /// replayed.
    fn subscribe<'a>(
        &'a self,
        channel: &'a str,
    ) -> BoxFuture<'a, Result<BoxStream<'static, Bytes>, StoreError>>;
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn new(value: Bytes, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// In-process backend. Several `AppState`s built over one `MemoryBackend`
/// behave like several processes sharing one store.
#[derive(Default)]
pub struct MemoryBackend {
    entries: DashMap<String, MemoryEntry>,
    channels: DashMap<String, broadcast::Sender<Bytes>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self, key: &str) -> Option<Bytes> {
        let now = Instant::now();
        // remove_if drops the entry lock before returning, so the read below is safe
        if self.entries.remove_if(key, |_, e| !e.is_live(now)).is_some() {
            debug!(key, "Evicted expired entry");
            return None;
        }
        self.entries.get(key).map(|e| e.value.clone())
    }

    fn write_if_absent(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> bool {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    false
                } else {
                    occupied.insert(MemoryEntry::new(value, ttl));
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(MemoryEntry::new(value, ttl));
                true
            }
        }
    }

    fn increment(&self, key: &str) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| MemoryEntry::new(Bytes::from_static(b"0"), None));
        let current: i64 = if entry.is_live(now) {
            std::str::from_utf8(&entry.value)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| StoreError::NotACounter(key.to_string()))?
        } else {
            0
        };
        let next = current + 1;
        *entry = MemoryEntry::new(Bytes::from(next.to_string()), None);
        Ok(next)
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Bytes> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Number of live keys (expired entries not yet evicted are skipped)
    #[cfg(test)]
    pub fn live_keys(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }
}

impl SharedBackend for MemoryBackend {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Bytes>, StoreError>> {
        future::ready(Ok(self.read(key))).boxed()
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        self.entries.insert(key.to_string(), MemoryEntry::new(value, ttl));
        future::ready(Ok(())).boxed()
    }

    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        future::ready(Ok(self.write_if_absent(key, value, ttl))).boxed()
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, StoreError>> {
        future::ready(Ok(self.entries.remove(key).is_some())).boxed()
    }

    fn delete_if_equals<'a>(
        &'a self,
        key: &'a str,
        expected: Bytes,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        let removed = self.entries.remove_if(key, |_, e| e.value == expected);
        future::ready(Ok(removed.is_some())).boxed()
    }

    fn incr<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<i64, StoreError>> {
        future::ready(self.increment(key)).boxed()
    }

    fn publish<'a>(
        &'a self,
        channel: &'a str,
        payload: Bytes,
    ) -> BoxFuture<'a, Result<usize, StoreError>> {
        // No subscribers is not an error for pub/sub
        let delivered = self.sender(channel).send(payload).unwrap_or(0);
        future::ready(Ok(delivered)).boxed()
    }

    fn subscribe<'a>(
        &'a self,
        channel: &'a str,
    ) -> BoxFuture<'a, Result<BoxStream<'static, Bytes>, StoreError>> {
        let rx = self.sender(channel).subscribe();
        let channel = channel.to_string();

        let messages = stream::unfold(rx, move |mut rx| {
            let channel = channel.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(payload) => return Some((payload, rx)),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(channel = %channel, lagged = n, "Subscriber lagged, dropping messages");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed();

        future::ready(Ok(messages)).boxed()
    }
}

//! Match snapshots in the shared store

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::game::model::Match;
use crate::util::time::{is_expired, unix_secs};

use super::backend::{SharedBackend, StoreError};

/// Stored wrapper around a match snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreEntry {
    #[serde(rename = "match")]
    pub snapshot: Match,
    pub created_at_epoch_sec: u64,
    pub ttl_seconds: u64,
}

impl StoreEntry {
    pub fn is_expired_at(&self, now_secs: u64) -> bool {
        is_expired(self.created_at_epoch_sec, self.ttl_seconds, now_secs)
    }
}

pub fn match_key(code: &str) -> String {
    format!("match:{}", code)
}

/// Reads and writes `match:{code}` entries.
///
/// Writes other than `create` must go through
/// [`MatchTransactions`](super::transaction::MatchTransactions).
#[derive(Clone)]
pub struct MatchStore {
    backend: Arc<dyn SharedBackend>,
    ttl_secs: u64,
}

impl MatchStore {
    pub fn new(backend: Arc<dyn SharedBackend>, ttl_secs: u64) -> Self {
        Self { backend, ttl_secs }
    }

    fn encode(&self, m: &Match) -> Result<Bytes, StoreError> {
        let entry = StoreEntry {
            snapshot: m.clone(),
            created_at_epoch_sec: unix_secs(),
            ttl_seconds: self.ttl_secs,
        };
        serde_json::to_vec(&entry)
            .map(Bytes::from)
            .map_err(|source| StoreError::Encode {
                key: match_key(&m.code),
                source,
            })
    }

    fn ttl(&self) -> Option<Duration> {
        (self.ttl_secs > 0).then(|| Duration::from_secs(self.ttl_secs))
    }

    /// Stores a brand-new match unless the code is taken. Returns whether
    /// the match was stored.
    pub async fn create(&self, m: &Match) -> Result<bool, StoreError> {
        let value = self.encode(m)?;
        self.backend
            .set_if_absent(&match_key(&m.code), value, self.ttl())
            .await
    }

    /// Overwrites the snapshot and refreshes its TTL
    pub async fn save(&self, m: &Match) -> Result<(), StoreError> {
        let value = self.encode(m)?;
        self.backend.set(&match_key(&m.code), value, self.ttl()).await
    }

    /// Current snapshot, or `None` if absent or logically expired
    pub async fn find_active(&self, code: &str) -> Result<Option<Match>, StoreError> {
        let code = code.trim();
        if code.is_empty() {
            return Ok(None);
        }

        let key = match_key(code);
        let Some(raw) = self.backend.get(&key).await? else {
            return Ok(None);
        };

        let entry: StoreEntry =
            serde_json::from_slice(&raw).map_err(|source| StoreError::Decode {
                key: key.clone(),
                source,
            })?;

        if entry.is_expired_at(unix_secs()) {
            self.backend.delete(&key).await?;
            debug!(code, "Expired match evicted from store");
            return Ok(None);
        }

        Ok(Some(entry.snapshot))
    }

    /// Next match id from the shared counter
    pub async fn next_id(&self) -> Result<i64, StoreError> {
        self.backend.incr("seq:match").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::model::fixtures::started_match;
    use crate::store::backend::MemoryBackend;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn create_refuses_taken_codes() {
        let store = MatchStore::new(Arc::new(MemoryBackend::new()), 60);
        let m = started_match("AAAAAA", 5);
        assert!(assert_ok!(store.create(&m).await));
        assert!(!assert_ok!(store.create(&m).await));
    }

    #[tokio::test]
    async fn find_active_returns_independent_snapshots() {
        let store = MatchStore::new(Arc::new(MemoryBackend::new()), 60);
        let m = started_match("BBBBBB", 5);
        assert_ok!(store.save(&m).await);

        let mut first = assert_ok!(store.find_active("BBBBBB").await).unwrap();
        first.fuel_percentage = 50.0;
        let second = assert_ok!(store.find_active("BBBBBB").await).unwrap();
        assert_eq!(second.fuel_percentage, 0.0);
    }

    #[tokio::test]
    async fn logically_expired_entries_are_absent() {
        let backend = Arc::new(MemoryBackend::new());
        let store = MatchStore::new(backend.clone(), 60);
        let entry = StoreEntry {
            snapshot: started_match("CCCCCC", 5),
            created_at_epoch_sec: unix_secs() - 120,
            ttl_seconds: 60,
        };
        let raw = Bytes::from(serde_json::to_vec(&entry).unwrap());
        assert_ok!(backend.set(&match_key("CCCCCC"), raw, None).await);

        assert!(assert_ok!(store.find_active("CCCCCC").await).is_none());
        assert_eq!(backend.live_keys(), 0);
    }

    #[tokio::test]
    async fn blank_code_is_absent() {
        let store = MatchStore::new(Arc::new(MemoryBackend::new()), 60);
        assert!(assert_ok!(store.find_active("  ").await).is_none());
    }
}

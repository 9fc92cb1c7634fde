//! Shared state: the key-value backend, match snapshots, sessions, the
//! per-match lock and the transaction built on top of them.

pub mod backend;
pub mod lock;
pub mod matches;
pub mod redis_backend;
pub mod sessions;
pub mod transaction;

use std::sync::Arc;

use tracing::info;

pub use backend::{MemoryBackend, SharedBackend, StoreError};
pub use lock::LockManager;
pub use matches::MatchStore;
pub use redis_backend::RedisBackend;
pub use sessions::SessionStore;
pub use transaction::MatchTransactions;

/// Redis when a URL is configured, otherwise a process-local store that is
/// only good for a single node.
pub async fn open_backend(redis_url: Option<&str>) -> Result<Arc<dyn SharedBackend>, StoreError> {
    match redis_url {
        Some(url) => Ok(Arc::new(RedisBackend::connect(url).await?)),
        None => {
            info!("No REDIS_URL set, using in-memory backend (single node only)");
            Ok(Arc::new(MemoryBackend::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn without_url_falls_back_to_memory() {
        let backend = assert_ok!(open_backend(None).await);
        assert_ok!(backend.set("k", Bytes::from_static(b"v"), None).await);
        assert_eq!(assert_ok!(backend.get("k").await), Some(Bytes::from_static(b"v")));
    }

    #[tokio::test]
    async fn unreachable_redis_fails_startup() {
        let result = open_backend(Some("redis://127.0.0.1:1/")).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}

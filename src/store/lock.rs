//! Per-match distributed lock on top of the shared backend.
//!
//! A lock is a `lock:match:{code}` key holding a random holder token, written
//! with set-if-absent and a lease TTL. Release deletes the key only while it
//! still holds our token, so a holder whose lease lapsed can never release a
//! lock someone else has since taken.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, warn};
use uuid::Uuid;

use super::backend::{SharedBackend, StoreError};

/// Pause between acquisition attempts
const RETRY_INTERVAL: Duration = Duration::from_millis(10);

pub fn lock_key(code: &str) -> String {
    format!("lock:match:{}", code)
}

/// Lock acquisition errors
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock {key}")]
    Timeout { key: String, waited: Duration },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Proof of holding a lock. Hand it back to [`LockManager::release`]; a
/// guard dropped without release (cancelled request future) releases in a
/// background task instead.
#[must_use = "a held lock must be released"]
pub struct LockGuard {
    key: String,
    token: Bytes,
    acquired_at: Instant,
    backend: Option<Arc<dyn SharedBackend>>,
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("held_for", &self.acquired_at.elapsed())
            .finish_non_exhaustive()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(backend) = self.backend.take() else {
            return;
        };
        let key = std::mem::take(&mut self.key);
        let token = self.token.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = backend.delete_if_equals(&key, token).await {
                    warn!(key = %key, error = %e, "Failed to release abandoned lock");
                }
            });
        }
    }
}

/// Hands out per-match locks shared by every process using the backend
#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn SharedBackend>,
    lease: Duration,
}

impl LockManager {
    pub fn new(backend: Arc<dyn SharedBackend>, lease: Duration) -> Self {
        Self { backend, lease }
    }

    /// Single attempt
    pub async fn try_acquire(&self, code: &str) -> Result<Option<LockGuard>, StoreError> {
        let key = lock_key(code);
        let token = Bytes::from(Uuid::new_v4().to_string());

        if self
            .backend
            .set_if_absent(&key, token.clone(), Some(self.lease))
            .await?
        {
            Ok(Some(LockGuard {
                key,
                token,
                acquired_at: Instant::now(),
                backend: Some(self.backend.clone()),
            }))
        } else {
            Ok(None)
        }
    }

    /// Polls until the lock is free or `wait` elapses
    pub async fn acquire(&self, code: &str, wait: Duration) -> Result<LockGuard, LockError> {
        let started = Instant::now();
        let deadline = started + wait;

        loop {
            if let Some(guard) = self.try_acquire(code).await? {
                return Ok(guard);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    key: lock_key(code),
                    waited: now - started,
                });
            }

            tokio::time::sleep(RETRY_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Releases the lock if we still own it
    pub async fn release(&self, mut guard: LockGuard) -> Result<(), StoreError> {
        guard.backend = None;
        let held_for = guard.acquired_at.elapsed();
        let released = self
            .backend
            .delete_if_equals(&guard.key, guard.token.clone())
            .await?;

        if released {
            debug!(key = %guard.key, held_ms = held_for.as_millis() as u64, "Lock released");
        } else {
            warn!(
                key = %guard.key,
                held_ms = held_for.as_millis() as u64,
                "Lock lease lapsed before release"
            );
        }
        Ok(())
    }
}

//! Lock-guarded read-modify-write over a match snapshot.
//!
//! Every change to a match, from any process, goes through
//! [`MatchTransactions::update`]. The snapshot is decoded fresh from the
//! backend inside the lock, mutated in memory, and written back before the
//! lock is released, so writers on one code are linearized and writers on
//! different codes never contend.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{MatchError, MatchResult};
use crate::game::model::Match;

use super::lock::{LockError, LockManager};
use super::matches::MatchStore;

#[derive(Clone)]
pub struct MatchTransactions {
    matches: MatchStore,
    locks: LockManager,
    lock_wait: Duration,
}

impl MatchTransactions {
    pub fn new(matches: MatchStore, locks: LockManager, lock_wait: Duration) -> Self {
        Self {
            matches,
            locks,
            lock_wait,
        }
    }

    /// Read-only access to snapshots
    pub fn matches(&self) -> &MatchStore {
        &self.matches
    }

    /// Runs `mutate` against the current snapshot of `code` while holding its
    /// lock and persists the result.
    ///
    /// Nothing is written if the match is absent or `mutate` fails. The lock
    /// is released on every path.
    pub async fn update<T, F>(&self, code: &str, mutate: F) -> MatchResult<T>
    where
        F: FnOnce(&mut Match) -> MatchResult<T> + Send,
        T: Send,
    {
        let code = code.trim();
        if code.is_empty() {
            return Err(MatchError::validation("Match code is required"));
        }

        let guard = self
            .locks
            .acquire(code, self.lock_wait)
            .await
            .map_err(|e| match e {
                LockError::Timeout { waited, .. } => {
                    warn!(code, waited_ms = waited.as_millis() as u64, "Lock wait exhausted");
                    MatchError::LockTimeout {
                        code: code.to_string(),
                    }
                }
                LockError::Store(e) => MatchError::Store(e),
            })?;

        let outcome = self.apply(code, mutate).await;

        if let Err(e) = self.locks.release(guard).await {
            warn!(code, error = %e, "Failed to release match lock");
        }
        outcome
    }

    async fn apply<T, F>(&self, code: &str, mutate: F) -> MatchResult<T>
    where
        F: FnOnce(&mut Match) -> MatchResult<T>,
    {
        let mut snapshot = self
            .matches
            .find_active(code)
            .await?
            .ok_or_else(|| MatchError::match_not_found(code))?;

        let result = mutate(&mut snapshot).map_err(|e| {
            debug!(code, error = %e, "Mutation rejected, nothing persisted");
            e
        })?;

        self.matches.save(&snapshot).await?;
        Ok(result)
    }
}

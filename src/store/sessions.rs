//! Player sessions in the shared store.
//!
//! A session is what the identity provider hands us after login: a named
//! player with a stable id. The match server only ever asks "which player is
//! this username", so this store is a thin stand-in for that boundary.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::game::model::Player;
use crate::util::time::{is_expired, unix_secs};

use super::backend::{SharedBackend, StoreError};

/// Tokens issued by the identity provider, kept opaque
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthTokens {
    pub access_token: String,
    pub id_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    pub player: Player,
    pub tokens: Option<AuthTokens>,
    pub created_at_epoch_sec: u64,
    pub ttl_seconds: u64,
}

pub fn session_key(username: &str) -> String {
    format!("session:{}", username)
}

#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn SharedBackend>,
    ttl_secs: u64,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn SharedBackend>, ttl_secs: u64) -> Self {
        Self { backend, ttl_secs }
    }

    /// Registers `username`. Returns `None` if a live session already
    /// holds that name.
    pub async fn create(
        &self,
        username: &str,
        tokens: Option<AuthTokens>,
    ) -> Result<Option<Player>, StoreError> {
        let key = session_key(username);
        if self.resolve(username).await?.is_some() {
            return Ok(None);
        }

        let id = self.backend.incr("seq:player").await?;
        let entry = SessionEntry {
            player: Player::new(id, username),
            tokens,
            created_at_epoch_sec: unix_secs(),
            ttl_seconds: self.ttl_secs,
        };
        let value = serde_json::to_vec(&entry)
            .map(Bytes::from)
            .map_err(|source| StoreError::Encode {
                key: key.clone(),
                source,
            })?;

        let ttl = (self.ttl_secs > 0).then(|| Duration::from_secs(self.ttl_secs));
        if !self.backend.set_if_absent(&key, value, ttl).await? {
            // Lost a race with another process registering the same name
            return Ok(None);
        }

        info!(username, player_id = id, "Session created");
        Ok(Some(entry.player))
    }

    /// Active player for `username`, if any
    pub async fn resolve(&self, username: &str) -> Result<Option<Player>, StoreError> {
        let username = username.trim();
        if username.is_empty() {
            return Ok(None);
        }

        let key = session_key(username);
        let Some(raw) = self.backend.get(&key).await? else {
            return Ok(None);
        };
        let entry: SessionEntry =
            serde_json::from_slice(&raw).map_err(|source| StoreError::Decode {
                key: key.clone(),
                source,
            })?;

        if is_expired(entry.created_at_epoch_sec, entry.ttl_seconds, unix_secs()) {
            self.backend.delete(&key).await?;
            debug!(username, "Expired session evicted");
            return Ok(None);
        }
        Ok(Some(entry.player))
    }

    pub async fn delete(&self, username: &str) -> Result<bool, StoreError> {
        let removed = self.backend.delete(&session_key(username.trim())).await?;
        if removed {
            info!(username, "Session removed");
        }
        Ok(removed)
    }
}

//! Application state shared across routes

use std::sync::Arc;

use crate::config::Config;
use crate::game::engine::GameEngine;
use crate::game::scheduler::Scheduler;
use crate::game::votes::VoteCoordinator;
use crate::lobby::MatchService;
use crate::store::{
    open_backend, LockManager, MatchStore, MatchTransactions, SessionStore, SharedBackend,
    StoreError,
};
use crate::ws::fanout::EventFanout;

/// Everything one process owns. Cloning shares the same services.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub scheduler: Scheduler,
    pub fanout: Arc<EventFanout>,
    pub engine: Arc<GameEngine>,
    pub votes: Arc<VoteCoordinator>,
    pub service: Arc<MatchService>,
}

impl AppState {
    /// Connects to the backend named by the config (Redis, or in-memory
    /// when no URL is set)
    pub async fn connect(config: Config) -> Result<Self, StoreError> {
        let backend = open_backend(config.redis_url.as_deref()).await?;
        Ok(Self::with_backend(config, backend))
    }

    /// Process attached to a (possibly shared) backend
    pub fn with_backend(config: Config, backend: Arc<dyn SharedBackend>) -> Self {
        let config = Arc::new(config);
        let rules = config.rules.clone();

        // Initialize stores
        let sessions = SessionStore::new(backend.clone(), config.session_ttl_secs);
        let matches = MatchStore::new(backend.clone(), config.match_ttl_secs);
        let locks = LockManager::new(backend.clone(), config.lock_lease);
        let tx = MatchTransactions::new(matches, locks, config.lock_wait);

        // Background machinery
        let scheduler = Scheduler::new();
        let fanout = Arc::new(EventFanout::new(config.instance_id.clone(), backend));
        let engine = Arc::new(GameEngine::new(
            tx.clone(),
            scheduler.clone(),
            fanout.clone(),
            rules.clone(),
        ));
        let votes = Arc::new(VoteCoordinator::new(
            tx.clone(),
            scheduler.clone(),
            fanout.clone(),
            engine.clone(),
            &rules,
        ));

        let service = Arc::new(MatchService::new(
            sessions,
            tx,
            fanout.clone(),
            engine.clone(),
            votes.clone(),
            rules,
        ));

        Self {
            config,
            scheduler,
            fanout,
            engine,
            votes,
            service,
        }
    }
}

//! Simulated processes for tests. Nodes built over one backend behave like
//! separate server processes sharing a store.

use std::ops::Deref;
use std::sync::Arc;

use tokio_test::assert_ok;

use crate::config::Config;
use crate::game::model::Match;
use crate::store::{MatchStore, SharedBackend};

use super::AppState;

/// A running process plus direct access to the match snapshots it shares
#[derive(Clone)]
pub struct Node {
    pub state: AppState,
    pub matches: MatchStore,
}

impl Deref for Node {
    type Target = AppState;

    fn deref(&self) -> &AppState {
        &self.state
    }
}

/// A running process: fast test config, event relay started
pub async fn node(backend: Arc<dyn SharedBackend>) -> Node {
    let config = Config::for_tests();
    let matches = MatchStore::new(backend.clone(), config.match_ttl_secs);
    let state = AppState::with_backend(config, backend);
    assert_ok!(state.fanout.start().await);
    Node { state, matches }
}

/// Writes `m` straight to the store, bypassing the lobby flow
pub async fn seed_match(node: &Node, m: &Match) {
    assert_ok!(node.matches.save(m).await);
}

/// Current snapshot of `code`; panics if it is gone
pub async fn stored_match(node: &Node, code: &str) -> Match {
    assert_ok!(node.matches.find_active(code).await).expect("match should be stored")
}

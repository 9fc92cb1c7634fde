//! Match service: lobby lifecycle and the in-game player actions.
//!
//! Every operation resolves the caller's session first, runs one
//! transaction on the match and publishes the resulting views once the
//! lock is released.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::GameRules;
use crate::error::{MatchError, MatchResult};
use crate::game::engine::GameEngine;
use crate::game::model::{
    Match, Player, Position, VoteResult, VoteTrigger, MSG_ALL_CASTAWAYS_GONE, MSG_BOAT_REPAIRED,
};
use crate::game::physics::PhysicsSystem;
use crate::game::snapshot::SnapshotBuilder;
use crate::game::votes::{quorum_round, VoteCoordinator};
use crate::store::{MatchTransactions, SessionStore};
use crate::util::rate_limit::MoveThrottle;
use crate::ws::fanout::EventFanout;
use crate::ws::protocol::{
    elimination_destination, game_destination, lobby_destination, EliminationEvent,
    FuelActionResponse, LobbyView, RoleView,
};

const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const CODE_LENGTH: usize = 6;
const CODE_ATTEMPTS: usize = 50;
const MAX_USERNAME_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FuelAction {
    Fill,
    Sabotage,
}

/// Random match code from `A-Z0-9`
pub fn generate_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..CODE_LENGTH)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

pub struct MatchService {
    sessions: SessionStore,
    tx: MatchTransactions,
    fanout: Arc<EventFanout>,
    engine: Arc<GameEngine>,
    votes: Arc<VoteCoordinator>,
    snapshots: SnapshotBuilder,
    rules: GameRules,
    move_throttle: MoveThrottle,
    rng: Mutex<ChaCha8Rng>,
}

impl MatchService {
    pub fn new(
        sessions: SessionStore,
        tx: MatchTransactions,
        fanout: Arc<EventFanout>,
        engine: Arc<GameEngine>,
        votes: Arc<VoteCoordinator>,
        rules: GameRules,
    ) -> Self {
        Self {
            sessions,
            tx,
            fanout,
            engine,
            votes,
            snapshots: SnapshotBuilder::new(rules.clone()),
            rules,
            move_throttle: MoveThrottle::default(),
            rng: Mutex::new(ChaCha8Rng::from_entropy()),
        }
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    pub async fn register(&self, username: &str) -> MatchResult<Player> {
        let username = username.trim();
        if username.is_empty() || username.len() > MAX_USERNAME_LEN {
            return Err(MatchError::Validation(format!(
                "Username must be between 1 and {} characters",
                MAX_USERNAME_LEN
            )));
        }
        if !username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(MatchError::validation(
                "Username may only contain letters, digits, '_' and '-'",
            ));
        }

        self.sessions
            .create(username, None)
            .await?
            .ok_or_else(|| MatchError::conflict("That username is already in use"))
    }

    pub async fn logout(&self, username: &str) -> MatchResult<()> {
        if self.sessions.delete(username).await? {
            Ok(())
        } else {
            Err(MatchError::NotFound(format!("No active session for {}", username.trim())))
        }
    }

    /// Player behind `username`'s session
    pub async fn resolve_player(&self, username: &str) -> MatchResult<Player> {
        self.sessions.resolve(username).await?.ok_or_else(|| {
            MatchError::Forbidden(format!("No active session for {}", username.trim()))
        })
    }

    // ------------------------------------------------------------------
    // Lobby
    // ------------------------------------------------------------------

    pub async fn create_match(&self, host_name: &str) -> MatchResult<LobbyView> {
        let host = self.resolve_player(host_name).await?;
        let id = self.tx.matches().next_id().await?;

        for _ in 0..CODE_ATTEMPTS {
            let code = generate_code(&mut *self.rng.lock());
            let m = Match::new(id, code.clone(), host.clone());
            if self.tx.matches().create(&m).await? {
                info!(code = %code, host = %host.username, "Match created");
                let lobby = self.snapshots.lobby(&m);
                self.fanout.publish(&lobby_destination(&code), &lobby).await;
                return Ok(lobby);
            }
        }

        warn!(attempts = CODE_ATTEMPTS, "No free match code found");
        Err(MatchError::conflict("Could not allocate a match code, try again"))
    }

    pub async fn join_match(&self, code: &str, username: &str) -> MatchResult<LobbyView> {
        let player = self.resolve_player(username).await?;
        let max = self.rules.max_players;

        let lobby = self
            .tx
            .update(code, |m| {
                m.add_player(player, max)?;
                Ok(self.snapshots.lobby(m))
            })
            .await
            .map_err(unknown_code)?;

        self.fanout.publish(&lobby_destination(&lobby.code), &lobby).await;
        Ok(lobby)
    }

    /// Host-only WAITING -> STARTED; starts this process's ticker for it
    pub async fn start_match(&self, code: &str, host_name: &str) -> MatchResult<LobbyView> {
        let (lobby, state) = self
            .tx
            .update(code, |m| {
                if m.host().map(|h| h.username.as_str()) != Some(host_name.trim()) {
                    return Err(MatchError::forbidden("Only the host can start the match"));
                }
                m.start(&self.rules, &mut *self.rng.lock())?;
                Ok((self.snapshots.lobby(m), self.snapshots.game_state(m)))
            })
            .await
            .map_err(unknown_code)?;

        self.engine.start_ticker(&lobby.code);
        self.fanout.publish(&lobby_destination(&lobby.code), &lobby).await;
        self.fanout.publish(&game_destination(&lobby.code), &state).await;
        Ok(lobby)
    }

    pub async fn get_match(&self, code: &str) -> MatchResult<LobbyView> {
        let m = self.find(code).await?;
        Ok(self.snapshots.lobby(&m))
    }

    /// The caller's own role; never broadcast
    pub async fn role(&self, code: &str, username: &str) -> MatchResult<RoleView> {
        let m = self.find(code).await?;
        let player = m
            .player(username.trim())
            .ok_or_else(|| MatchError::forbidden("You are not part of this match"))?;
        Ok(self.snapshots.role(player))
    }

    pub async fn last_vote_result(&self, code: &str) -> MatchResult<VoteResult> {
        self.votes
            .last_result(code)
            .await?
            .ok_or_else(|| MatchError::NotFound("No vote has concluded in this match yet".into()))
    }

    async fn find(&self, code: &str) -> MatchResult<Match> {
        self.tx
            .matches()
            .find_active(code)
            .await?
            .ok_or_else(|| MatchError::match_not_found(code.trim()))
    }

    // ------------------------------------------------------------------
    // In-game actions
    // ------------------------------------------------------------------

    /// Moves the caller's avatar one step. Returns false when the move was
    /// dropped by the per-avatar throttle.
    pub async fn move_player(
        &self,
        code: &str,
        username: &str,
        avatar_id: Option<i64>,
        dx: f64,
        dy: f64,
    ) -> MatchResult<bool> {
        let session = self.resolve_player(username).await?;
        if avatar_id.map_or(false, |id| id != session.id) {
            return Err(MatchError::forbidden("You can only move your own avatar"));
        }
        if !self.move_throttle.check(session.id) {
            return Ok(false);
        }

        let step = self.rules.island_radius * self.rules.move_step_ratio;
        let radius = self.rules.island_radius;

        let state = self
            .tx
            .update(code, |m| {
                m.ensure_running()?;
                let player = m
                    .player_mut(&session.username)
                    .ok_or_else(|| MatchError::forbidden("You are not part of this match"))?;
                if !player.alive {
                    return Err(MatchError::forbidden("Eliminated players cannot move"));
                }

                let from = player.position.unwrap_or_default();
                let next = PhysicsSystem::step_player(from, dx, dy, step, radius)
                    .ok_or_else(|| MatchError::validation("Invalid movement direction"))?;
                player.position = Some(next);
                Ok(self.snapshots.game_state(m))
            })
            .await?;

        self.fanout.publish(&game_destination(&state.code), &state).await;
        Ok(true)
    }

    /// The infiltrator eliminates a castaway within range
    pub async fn eliminate(
        &self,
        code: &str,
        username: &str,
        target_id: i64,
    ) -> MatchResult<EliminationEvent> {
        let range = self.rules.elimination_range;

        let (event, state, finished, quorum) = self
            .tx
            .update(code, |m| {
                m.ensure_running()?;
                let killer = m
                    .player(username.trim())
                    .ok_or_else(|| MatchError::forbidden("You are not part of this match"))?;
                if !killer.infiltrator || !killer.alive {
                    return Err(MatchError::forbidden("Only the infiltrator can eliminate"));
                }
                let killer_pos = killer.position;

                let target = m
                    .player_by_id(target_id)
                    .ok_or_else(|| MatchError::NotFound("Target not found".into()))?;
                if target.infiltrator {
                    return Err(MatchError::validation("Invalid target"));
                }
                if !target.alive {
                    return Err(MatchError::conflict("The target was already eliminated"));
                }
                if PhysicsSystem::distance(killer_pos, target.position) > range {
                    return Err(MatchError::forbidden("Target is out of range"));
                }

                let target_username = target.username.clone();
                if let Some(target) = m.player_by_id_mut(target_id) {
                    target.alive = false;
                }
                m.voting.ballots.remove(&target_username);

                let finished = m.alive_crew_count() == 0 && m.finish(MSG_ALL_CASTAWAYS_GONE);
                info!(code = %m.code, target = %target_username, "Castaway eliminated");

                let event = EliminationEvent {
                    target_id,
                    target_username,
                    message: "You have been eliminated".to_string(),
                };
                Ok((event, self.snapshots.game_state(m), finished, quorum_round(m)))
            })
            .await?;

        if finished {
            self.engine.stop_ticker(&state.code);
        }
        self.fanout.publish(&elimination_destination(&state.code), &event).await;
        self.fanout.publish(&game_destination(&state.code), &state).await;

        // The victim may have been the last castaway still to vote
        if let Some(round) = quorum {
            self.votes
                .close_in_background(&state.code, round, VoteTrigger::Quorum)
                .await;
        }
        Ok(event)
    }

    /// Fills (castaways) or drains (infiltrator) the boat's tank
    pub async fn adjust_fuel(
        &self,
        code: &str,
        username: &str,
        action: FuelAction,
        amount: Option<f64>,
    ) -> MatchResult<FuelActionResponse> {
        let step = amount.unwrap_or(self.rules.fuel_step).abs();
        if !step.is_finite() {
            return Err(MatchError::validation("Invalid fuel amount"));
        }
        let boat = Position::new(self.rules.boat_x, self.rules.boat_y);
        let boat_radius = self.rules.boat_interaction_radius;
        let cycle = self.rules.fuel_window_cycle_secs;

        let (response, state, finished) = self
            .tx
            .update(code, |m| {
                m.ensure_running()?;
                let actor = m
                    .player(username.trim())
                    .filter(|p| p.alive)
                    .ok_or_else(|| MatchError::forbidden("Not a valid player for this match"))?;

                let boat_distance = actor
                    .position
                    .map_or(f64::MAX, |p| PhysicsSystem::distance(Some(p), Some(boat)));
                if !actor.infiltrator && boat_distance > boat_radius {
                    return Err(MatchError::forbidden("Move closer to the boat"));
                }

                if !m.fuel_window_open(cycle) {
                    let seconds = m.fuel_window_seconds_remaining(cycle);
                    return Err(MatchError::Locked(if seconds > 0 {
                        format!("The fuel tank is locked. Available in {}s", seconds)
                    } else {
                        "The fuel tank is locked".to_string()
                    }));
                }

                let delta = match action {
                    FuelAction::Fill if actor.infiltrator => {
                        return Err(MatchError::forbidden("The infiltrator cannot fill the tank"))
                    }
                    FuelAction::Sabotage if !actor.infiltrator => {
                        return Err(MatchError::forbidden("Only the infiltrator can sabotage"))
                    }
                    FuelAction::Fill => step,
                    FuelAction::Sabotage => -step,
                };

                let before = m.fuel_percentage;
                let after = m.adjust_fuel(delta);
                let finished = before < 100.0 && after >= 100.0 && m.finish(MSG_BOAT_REPAIRED);

                let response = FuelActionResponse {
                    fuel_percentage: after,
                    status: m.status,
                    winner_message: m.winner_message.clone(),
                };
                Ok((response, self.snapshots.game_state(m), finished))
            })
            .await?;

        if finished {
            self.engine.stop_ticker(&state.code);
        }
        self.fanout.publish(&game_destination(&state.code), &state).await;
        Ok(response)
    }
}

/// Codes typed in by players: an unknown one is a bad request
fn unknown_code(e: MatchError) -> MatchError {
    match e {
        MatchError::NotFound(msg) => MatchError::Validation(msg),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::test_support::{node, seed_match, stored_match};
    use crate::game::model::fixtures::started_match;
    use crate::game::model::MatchStatus;
    use crate::store::MemoryBackend;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn codes_use_the_public_alphabet() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..100 {
            let code = generate_code(&mut rng);
            assert_eq!(code.len(), CODE_LENGTH);
            assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
        }
    }

    #[tokio::test]
    async fn lobby_flow_from_create_to_start() {
        let app = node(Arc::new(MemoryBackend::new())).await;
        for name in ["host", "a", "b", "c", "d"] {
            assert_ok!(app.service.register(name).await);
        }
        let err = assert_err!(app.service.register("host").await);
        assert!(matches!(err, MatchError::Conflict(_)));

        let lobby = assert_ok!(app.service.create_match("host").await);
        let code = lobby.code.clone();
        for name in ["a", "b", "c"] {
            assert_ok!(app.service.join_match(&code, name).await);
        }

        // four players are not enough
        let err = assert_err!(app.service.start_match(&code, "host").await);
        assert!(matches!(err, MatchError::Validation(_)));

        assert_ok!(app.service.join_match(&code, "d").await);
        let err = assert_err!(app.service.start_match(&code, "a").await);
        assert!(matches!(err, MatchError::Forbidden(_)));

        let started = assert_ok!(app.service.start_match(&code, "host").await);
        assert_eq!(started.status, MatchStatus::Started);
        assert!(app.engine.is_ticking(&code));

        let stored = stored_match(&app, &code).await;
        assert_eq!(stored.players.iter().filter(|p| p.infiltrator).count(), 1);
        assert_eq!(stored.npcs.len(), 3);
        assert!(stored.players.iter().all(|p| p.position.is_some()));

        let err = assert_err!(app.service.join_match("ZZZZZZ", "a").await);
        assert!(matches!(err, MatchError::Validation(_)));
        app.engine.stop_ticker(&code);
    }

    #[tokio::test]
    async fn elimination_respects_range() {
        let app = node(Arc::new(MemoryBackend::new())).await;
        let mut m = started_match("AAAAAA", 5);
        m.players[0].position = Some(Position::new(0.0, 0.0));
        m.players[1].position = Some(Position::new(25.0, 0.0));
        m.players[2].position = Some(Position::new(15.0, 0.0));
        seed_match(&app, &m).await;

        let err = assert_err!(app.service.eliminate("AAAAAA", "p1", 2).await);
        assert!(matches!(err, MatchError::Forbidden(_)));

        let event = assert_ok!(app.service.eliminate("AAAAAA", "p1", 3).await);
        assert_eq!(event.target_username, "p3");
        let stored = stored_match(&app, "AAAAAA").await;
        assert!(!stored.player("p3").unwrap().alive);
        assert!(stored.player("p2").unwrap().alive);

        let err = assert_err!(app.service.eliminate("AAAAAA", "p1", 3).await);
        assert!(matches!(err, MatchError::Conflict(_)));
        let err = assert_err!(app.service.eliminate("AAAAAA", "p2", 4).await);
        assert!(matches!(err, MatchError::Forbidden(_)));
    }

    #[tokio::test]
    async fn eliminating_the_last_castaway_ends_the_match() {
        let app = node(Arc::new(MemoryBackend::new())).await;
        let mut m = started_match("AAAAAA", 5);
        for p in m.players.iter_mut().skip(2) {
            p.alive = false;
        }
        seed_match(&app, &m).await;

        assert_ok!(app.service.eliminate("AAAAAA", "p1", 2).await);
        let stored = stored_match(&app, "AAAAAA").await;
        assert_eq!(stored.status, MatchStatus::Finished);
        assert_eq!(stored.winner_message.as_deref(), Some(MSG_ALL_CASTAWAYS_GONE));
    }

    #[tokio::test]
    async fn eliminating_the_last_pending_voter_closes_the_vote() {
        let app = node(Arc::new(MemoryBackend::new())).await;
        seed_match(&app, &started_match("AAAAAA", 5)).await;

        assert_ok!(app.votes.start_vote("AAAAAA", "p2").await);
        for voter in ["p2", "p3", "p4"] {
            assert_ok!(app.votes.submit_ballot("AAAAAA", voter, 8).await);
        }
        // p5 sits at (20, 0), exactly in range of p1 at the origin
        assert_ok!(app.service.eliminate("AAAAAA", "p1", 5).await);

        let stored = stored_match(&app, "AAAAAA").await;
        assert!(!stored.voting.active);
        assert_eq!(stored.voting.last_result.unwrap().expelled_id, Some(8));
    }

    #[tokio::test]
    async fn fuel_completion_and_closed_window() {
        let app = node(Arc::new(MemoryBackend::new())).await;
        let mut open = started_match("AAAAAA", 5);
        open.timer_seconds = 170; // second cycle: window open
        open.fuel_percentage = 97.0;
        open.players[1].position = Some(Position::new(100.0, 0.0));
        seed_match(&app, &open).await;

        let mut closed = open.clone();
        closed.code = "BBBBBB".to_string();
        closed.timer_seconds = 230; // first cycle: window closed
        seed_match(&app, &closed).await;

        let err = assert_err!(
            app.service
                .adjust_fuel("BBBBBB", "p2", FuelAction::Fill, Some(5.0))
                .await
        );
        assert!(matches!(err, MatchError::Locked(_)));
        let stored = stored_match(&app, "BBBBBB").await;
        assert_eq!(stored.fuel_percentage, 97.0);

        let response = assert_ok!(
            app.service
                .adjust_fuel("AAAAAA", "p2", FuelAction::Fill, Some(5.0))
                .await
        );
        assert_eq!(response.fuel_percentage, 100.0);
        assert_eq!(response.status, MatchStatus::Finished);
        assert_eq!(response.winner_message.as_deref(), Some(MSG_BOAT_REPAIRED));

        let err = assert_err!(
            app.service
                .adjust_fuel("AAAAAA", "p2", FuelAction::Fill, None)
                .await
        );
        assert!(matches!(err, MatchError::Conflict(_)));
    }

    #[tokio::test]
    async fn fuel_roles_and_proximity() {
        let app = node(Arc::new(MemoryBackend::new())).await;
        let mut m = started_match("AAAAAA", 5);
        m.timer_seconds = 170;
        m.fuel_percentage = 50.0;
        m.players[1].position = Some(Position::new(100.0, 0.0));
        seed_match(&app, &m).await;

        // p3 is far from the boat
        let err = assert_err!(app.service.adjust_fuel("AAAAAA", "p3", FuelAction::Fill, None).await);
        assert!(matches!(err, MatchError::Forbidden(_)));
        let err = assert_err!(app.service.adjust_fuel("AAAAAA", "p2", FuelAction::Sabotage, None).await);
        assert!(matches!(err, MatchError::Forbidden(_)));
        let err = assert_err!(app.service.adjust_fuel("AAAAAA", "p1", FuelAction::Fill, None).await);
        assert!(matches!(err, MatchError::Forbidden(_)));

        // the infiltrator may sabotage from anywhere
        let response = assert_ok!(
            app.service
                .adjust_fuel("AAAAAA", "p1", FuelAction::Sabotage, Some(80.0))
                .await
        );
        assert_eq!(response.fuel_percentage, 0.0);
    }

    #[tokio::test]
    async fn moves_are_own_avatar_only_and_stay_on_the_island() {
        let app = node(Arc::new(MemoryBackend::new())).await;
        let alice = assert_ok!(app.service.register("alice").await);
        let mut m = started_match("AAAAAA", 5);
        let mut player = alice.clone();
        player.position = Some(Position::new(99.0, 0.0));
        m.players.push(player);
        seed_match(&app, &m).await;

        let err = assert_err!(app.service.move_player("AAAAAA", "alice", Some(alice.id + 1), 1.0, 0.0).await);
        assert!(matches!(err, MatchError::Forbidden(_)));

        assert!(assert_ok!(app.service.move_player("AAAAAA", "alice", Some(alice.id), 1.0, 0.0).await));
        // immediate second move is throttled
        assert!(!assert_ok!(app.service.move_player("AAAAAA", "alice", None, 1.0, 0.0).await));

        let stored = stored_match(&app, "AAAAAA").await;
        let pos = stored.player("alice").unwrap().position.unwrap();
        assert!((pos.x - 99.5).abs() < 1e-9);
    }
}

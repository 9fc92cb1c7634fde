//! Match aggregate and its state machine
//!
//! A `Match` is a plain value: it is decoded from the shared store at the
//! start of every transaction, mutated in memory and written back. Nothing
//! outside a transaction holds on to one.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::GameRules;
use crate::error::{MatchError, MatchResult};

use super::physics::PhysicsSystem;

/// Ballot target meaning "abstain"; any negative id is treated the same
pub const ABSTAIN_TARGET: i64 = -1;

/// NPC ids (and infiltrator aliases) are numbered from here
pub const BASE_NPC_ID: i64 = 100_000;

/// Players and NPCs spawn within this fraction of the island radius
const SPAWN_RADIUS_RATIO: f64 = 0.7;

pub const MSG_INFILTRATOR_WINS_TIME: &str =
    "Time is up: the infiltrator wins, the castaways could not repair the boat";
pub const MSG_BOAT_REPAIRED: &str = "The boat was repaired in time! The castaways escape";
pub const MSG_INFILTRATOR_GONE: &str =
    "The infiltrator was eliminated before time ran out. The castaways win";
pub const MSG_MATCH_FINISHED: &str = "Match finished";
pub const MSG_INFILTRATOR_EXPELLED: &str =
    "The infiltrator was identified and expelled! The castaways win";
pub const MSG_ALL_NPCS_GONE: &str =
    "The infiltrator wins: every other NPC has been expelled";
pub const MSG_ALL_CASTAWAYS_GONE: &str =
    "The infiltrator wins by eliminating every castaway!";

/// Match lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchStatus {
    /// Lobby open, players may join
    Waiting,
    /// Roles assigned, timer running
    Started,
    /// Terminal
    Finished,
}

/// Point on the island plane
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Distance from the island centre
    pub fn radius(&self) -> f64 {
        self.x.hypot(self.y)
    }
}

/// Human participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub id: i64,
    pub username: String,
    pub alive: bool,
    pub infiltrator: bool,
    /// Name shown while disguised as an NPC
    #[serde(default)]
    pub npc_alias: Option<String>,
    #[serde(default)]
    pub position: Option<Position>,
}

impl Player {
    pub fn new(id: i64, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            alive: true,
            infiltrator: false,
            npc_alias: None,
            position: None,
        }
    }

    /// Alive castaway (may vote and start votes)
    pub fn is_alive_crew(&self) -> bool {
        self.alive && !self.infiltrator
    }

    pub fn disguise_name(&self) -> String {
        self.npc_alias
            .clone()
            .unwrap_or_else(|| format!("NPC-{}", BASE_NPC_ID + self.id))
    }
}

/// Non-player character wandering the island
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Npc {
    pub id: i64,
    pub active: bool,
    /// Cosmetic: styled like the infiltrator
    pub infiltrator: bool,
    pub position: Position,
    pub movement_speed: f64,
    pub display_name: String,
}

impl Npc {
    pub fn new(id: i64, position: Position, movement_speed: f64) -> Self {
        Self {
            id,
            active: true,
            infiltrator: false,
            position,
            movement_speed,
            display_name: format!("NPC-{}", id),
        }
    }
}

/// What ended a voting round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteTrigger {
    /// Every alive castaway voted
    Quorum,
    /// The vote duration elapsed
    Timeout,
}

/// Kind of avatar removed by a vote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpelledKind {
    Human,
    Npc,
    None,
}

/// Outcome of a voting round, kept on the match for late subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteResult {
    pub round: u64,
    /// Votes per target, abstentions excluded
    pub counts: BTreeMap<i64, u32>,
    pub expelled_id: Option<i64>,
    pub expelled_type: ExpelledKind,
    pub message: String,
    pub abstentions: u32,
    pub trigger: VoteTrigger,
    pub concluded_at: DateTime<Utc>,
}

/// Voting sub-state of a match
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VotingState {
    pub active: bool,
    /// Incremented on every start; timeouts carry the round they belong to
    pub round: u64,
    pub started_at_ms: u64,
    /// Voter username -> target id
    pub ballots: BTreeMap<String, i64>,
    pub last_result: Option<VoteResult>,
}

/// Root aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub id: i64,
    pub code: String,
    pub status: MatchStatus,
    pub timer_seconds: i32,
    /// Match length captured at start; drives the fuel window
    pub duration_seconds: i32,
    pub fuel_percentage: f64,
    pub players: Vec<Player>,
    pub npcs: Vec<Npc>,
    /// Id of the infiltrating player
    pub infiltrator: Option<i64>,
    #[serde(default)]
    pub voting: VotingState,
    pub winner_message: Option<String>,
}

impl Match {
    /// New lobby owned by `host`
    pub fn new(id: i64, code: impl Into<String>, host: Player) -> Self {
        let mut m = Self {
            id,
            code: code.into(),
            status: MatchStatus::Waiting,
            timer_seconds: 0,
            duration_seconds: 0,
            fuel_percentage: 0.0,
            players: Vec::new(),
            npcs: Vec::new(),
            infiltrator: None,
            voting: VotingState::default(),
            winner_message: None,
        };
        m.players.push(reset_for_lobby(host));
        m
    }

    pub fn host(&self) -> Option<&Player> {
        self.players.first()
    }

    pub fn is_started(&self) -> bool {
        self.status == MatchStatus::Started
    }

    /// Precondition for every in-game action
    pub fn ensure_running(&self) -> MatchResult<()> {
        match self.status {
            MatchStatus::Started => Ok(()),
            MatchStatus::Finished => Err(MatchError::conflict("The match already finished")),
            MatchStatus::Waiting => Err(MatchError::validation("The match is not in progress")),
        }
    }

    pub fn player(&self, username: &str) -> Option<&Player> {
        self.players.iter().find(|p| p.username == username)
    }

    pub fn player_by_id(&self, id: i64) -> Option<&Player> {
        self.players.iter().find(|p| p.id == id)
    }

    pub fn player_by_id_mut(&mut self, id: i64) -> Option<&mut Player> {
        self.players.iter_mut().find(|p| p.id == id)
    }

    pub fn player_mut(&mut self, username: &str) -> Option<&mut Player> {
        self.players.iter_mut().find(|p| p.username == username)
    }

    pub fn infiltrator(&self) -> Option<&Player> {
        self.infiltrator.and_then(|id| self.player_by_id(id))
    }

    pub fn infiltrator_alive(&self) -> bool {
        self.infiltrator().map_or(false, |p| p.alive)
    }

    /// Alive non-infiltrator humans; this is also the voting quorum
    pub fn alive_crew_count(&self) -> usize {
        self.players.iter().filter(|p| p.is_alive_crew()).count()
    }

    pub fn active_npc_count(&self) -> usize {
        self.npcs.iter().filter(|n| n.active).count()
    }

    /// Adds a player to the lobby
    pub fn add_player(&mut self, player: Player, max_players: usize) -> MatchResult<()> {
        if self.status != MatchStatus::Waiting {
            return Err(MatchError::validation("The match has already started"));
        }
        if self.players.len() >= max_players {
            return Err(MatchError::validation("The match is full"));
        }
        if self.player(&player.username).is_some() {
            return Err(MatchError::validation(
                "A player with that name is already in the match",
            ));
        }

        info!(code = %self.code, username = %player.username, "Player joined lobby");
        self.players.push(reset_for_lobby(player));
        Ok(())
    }

    /// Transition WAITING -> STARTED: pick the infiltrator, spawn NPCs,
    /// place everyone and start the clock.
    pub fn start<R: Rng + ?Sized>(&mut self, rules: &GameRules, rng: &mut R) -> MatchResult<()> {
        match self.status {
            MatchStatus::Waiting => {}
            MatchStatus::Started => {
                return Err(MatchError::conflict("The match has already started"))
            }
            MatchStatus::Finished => return Err(MatchError::conflict("The match already finished")),
        }
        if self.players.len() < rules.min_players {
            return Err(MatchError::Validation(format!(
                "Not enough players to start: {} human players are required",
                rules.min_players
            )));
        }

        self.assign_roles(rng);
        self.spawn_npcs(rules, rng);

        let spawn_radius = rules.island_radius * SPAWN_RADIUS_RATIO;
        for player in &mut self.players {
            if player.position.is_none() {
                player.position = Some(PhysicsSystem::random_point(rng, spawn_radius));
            }
        }

        self.fuel_percentage = 0.0;
        self.duration_seconds = rules.match_duration_secs;
        self.timer_seconds = rules.match_duration_secs;
        self.winner_message = None;
        self.voting = VotingState::default();
        self.status = MatchStatus::Started;

        info!(
            code = %self.code,
            players = self.players.len(),
            npcs = self.npcs.len(),
            timer = self.timer_seconds,
            "Match started"
        );
        Ok(())
    }

    fn assign_roles<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        for player in &mut self.players {
            player.infiltrator = false;
            player.npc_alias = None;
        }
        self.infiltrator = self.players.choose_mut(rng).map(|p| {
            p.infiltrator = true;
            p.id
        });
    }

    /// NPCs plus the infiltrator balance the castaways: `humans - 2` NPCs
    fn spawn_npcs<R: Rng + ?Sized>(&mut self, rules: &GameRules, rng: &mut R) {
        let count = self.players.len().saturating_sub(2);
        let spawn_radius = rules.island_radius * SPAWN_RADIUS_RATIO;

        self.npcs = (0..count)
            .map(|i| {
                let position = PhysicsSystem::random_point(rng, spawn_radius);
                Npc::new(BASE_NPC_ID + i as i64, position, rules.npc_base_speed)
            })
            .collect();

        let alias = format!("NPC-{}", BASE_NPC_ID + count as i64);
        if let Some(id) = self.infiltrator {
            if let Some(p) = self.player_by_id_mut(id) {
                p.npc_alias = Some(alias);
            }
        }
    }

    /// Applies `delta`, clamping into [0, 100]
    pub fn adjust_fuel(&mut self, delta: f64) -> f64 {
        self.fuel_percentage = (self.fuel_percentage + delta).clamp(0.0, 100.0);
        self.fuel_percentage
    }

    fn elapsed_secs(&self) -> i32 {
        (self.duration_seconds - self.timer_seconds).max(0)
    }

    /// The gauge is only reachable during odd-numbered cycles
    pub fn fuel_window_open(&self, cycle_secs: i32) -> bool {
        if !self.is_started() || self.timer_seconds <= 0 || cycle_secs <= 0 {
            return false;
        }
        (self.elapsed_secs() / cycle_secs) % 2 == 1
    }

    /// Seconds until the fuel window toggles, capped by the match timer
    pub fn fuel_window_seconds_remaining(&self, cycle_secs: i32) -> i32 {
        if !self.is_started() || self.timer_seconds <= 0 || cycle_secs <= 0 {
            return 0;
        }
        let remaining = cycle_secs - self.elapsed_secs() % cycle_secs;
        remaining.min(self.timer_seconds).max(0)
    }

    /// Terminal transition; the first winner message sticks.
    /// Returns false if the match had already finished.
    pub fn finish(&mut self, message: &str) -> bool {
        if self.status == MatchStatus::Finished {
            return false;
        }
        if self.winner_message.is_none() {
            self.winner_message = Some(message.to_string());
        }
        self.status = MatchStatus::Finished;
        self.voting.active = false;
        self.voting.ballots.clear();
        info!(code = %self.code, winner = ?self.winner_message, "Match finished");
        true
    }

    /// End-of-clock resolution
    pub fn resolve_time_up(&mut self) {
        let infiltrator_alive = self.infiltrator_alive();
        let message = if infiltrator_alive && self.fuel_percentage < 100.0 {
            MSG_INFILTRATOR_WINS_TIME
        } else if self.fuel_percentage >= 100.0 {
            MSG_BOAT_REPAIRED
        } else if !infiltrator_alive {
            MSG_INFILTRATOR_GONE
        } else {
            MSG_MATCH_FINISHED
        };
        self.finish(message);
    }
}

fn reset_for_lobby(mut player: Player) -> Player {
    player.alive = true;
    player.infiltrator = false;
    player.npc_alias = None;
    player.position = None;
    player
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Started match with `humans` players (ids 1..=humans, names p1..),
    /// player 1 as infiltrator and NPCs 8 and 9 at known positions.
    pub fn started_match(code: &str, humans: usize) -> Match {
        let mut m = Match::new(1, code, Player::new(1, "p1"));
        for i in 2..=humans as i64 {
            m.players.push(Player::new(i, format!("p{}", i)));
        }
        for (i, p) in m.players.iter_mut().enumerate() {
            p.position = Some(Position::new(i as f64 * 5.0, 0.0));
        }
        m.players[0].infiltrator = true;
        m.players[0].npc_alias = Some("NPC-100002".to_string());
        m.infiltrator = Some(1);
        m.npcs = vec![
            Npc::new(8, Position::new(-10.0, 0.0), 0.8),
            Npc::new(9, Position::new(0.0, -10.0), 0.8),
        ];
        m.status = MatchStatus::Started;
        m.duration_seconds = 240;
        m.timer_seconds = 240;
        m
    }
}

//! Client-facing views of a match

use crate::config::GameRules;
use crate::util::time::unix_millis;
use crate::ws::protocol::{
    AvatarKind, AvatarState, Boat, FuelWindow, GameState, Island, LobbyPlayer, LobbyView,
    RoleView,
};

use super::model::{Match, Npc, Player};

/// Builds the views published to clients. The infiltrator is always
/// rendered as an NPC under its alias, and no view carries the role flag.
#[derive(Clone)]
pub struct SnapshotBuilder {
    rules: GameRules,
}

impl SnapshotBuilder {
    pub fn new(rules: GameRules) -> Self {
        Self { rules }
    }

    /// Full state published on `game/{code}`
    pub fn game_state(&self, m: &Match) -> GameState {
        let cycle = self.rules.fuel_window_cycle_secs;
        GameState {
            code: m.code.clone(),
            timestamp: unix_millis(),
            timer_seconds: m.timer_seconds,
            island: Island {
                cx: 0.0,
                cy: 0.0,
                radius: self.rules.island_radius,
            },
            avatars: self.avatars(m),
            fuel_percentage: m.fuel_percentage,
            status: m.status,
            boat: Boat {
                x: self.rules.boat_x,
                y: self.rules.boat_y,
                interaction_radius: self.rules.boat_interaction_radius,
            },
            winner_message: m.winner_message.clone(),
            fuel_window: FuelWindow {
                open: m.fuel_window_open(cycle),
                seconds_remaining: m.fuel_window_seconds_remaining(cycle),
            },
            voting_active: m.voting.active,
        }
    }

    /// Castaways first, then everything that looks like an NPC
    pub fn avatars(&self, m: &Match) -> Vec<AvatarState> {
        let humans = m
            .players
            .iter()
            .filter(|p| !p.infiltrator)
            .map(human_avatar);
        let disguised = m.infiltrator().map(disguised_avatar);
        let npcs = m.npcs.iter().map(npc_avatar);

        humans.chain(disguised).chain(npcs).collect()
    }

    /// Targets a vote may expel: active NPCs and the alive infiltrator
    pub fn vote_options(&self, m: &Match) -> Vec<AvatarState> {
        let npcs = m.npcs.iter().filter(|n| n.active).map(npc_avatar);
        let disguised = m
            .infiltrator()
            .filter(|p| p.alive)
            .map(disguised_avatar);

        npcs.chain(disguised).collect()
    }

    pub fn lobby(&self, m: &Match) -> LobbyView {
        LobbyView {
            code: m.code.clone(),
            status: m.status,
            host: m.host().map(|p| p.username.clone()),
            players: m
                .players
                .iter()
                .map(|p| LobbyPlayer {
                    id: p.id,
                    username: p.username.clone(),
                    alive: p.alive,
                })
                .collect(),
            min_players: self.rules.min_players,
            max_players: self.rules.max_players,
            winner_message: m.winner_message.clone(),
        }
    }

    pub fn role(&self, player: &Player) -> RoleView {
        RoleView {
            username: player.username.clone(),
            player_id: player.id,
            infiltrator: player.infiltrator,
            npc_alias: player.npc_alias.clone(),
            alive: player.alive,
        }
    }
}

fn human_avatar(p: &Player) -> AvatarState {
    let pos = p.position.unwrap_or_default();
    AvatarState {
        id: p.id,
        kind: AvatarKind::Human,
        owner_username: Some(p.username.clone()),
        x: pos.x,
        y: pos.y,
        is_infiltrator: false,
        is_alive: p.alive,
        display_name: p.username.clone(),
    }
}

fn disguised_avatar(p: &Player) -> AvatarState {
    let pos = p.position.unwrap_or_default();
    AvatarState {
        id: p.id,
        kind: AvatarKind::Npc,
        owner_username: None,
        x: pos.x,
        y: pos.y,
        is_infiltrator: false,
        is_alive: p.alive,
        display_name: p.disguise_name(),
    }
}

fn npc_avatar(n: &Npc) -> AvatarState {
    AvatarState {
        id: n.id,
        kind: AvatarKind::Npc,
        owner_username: None,
        x: n.position.x,
        y: n.position.y,
        is_infiltrator: false,
        is_alive: n.active,
        display_name: n.display_name.clone(),
    }
}

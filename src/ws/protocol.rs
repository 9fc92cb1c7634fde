//! WebSocket and event wire types
//! Everything a client sees, either as a direct reply or as an event payload

use serde::{Deserialize, Serialize};

use crate::game::model::MatchStatus;

pub fn lobby_destination(code: &str) -> String {
    format!("lobby/{}", code)
}

pub fn game_destination(code: &str) -> String {
    format!("game/{}", code)
}

pub fn vote_start_destination(code: &str) -> String {
    format!("game/{}/vote/start", code)
}

pub fn vote_result_destination(code: &str) -> String {
    format!("game/{}/vote/result", code)
}

pub fn elimination_destination(code: &str) -> String {
    format!("game/{}/elimination", code)
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Start receiving events for a destination (`game/ABC123`, ...)
    Subscribe { destination: String },

    Unsubscribe { destination: String },

    /// Move own avatar one step
    Move {
        code: String,
        /// Must be the caller's own avatar when present
        avatar_id: Option<i64>,
        dx: f64,
        dy: f64,
    },

    /// Ping for latency measurement
    Ping {
        /// Client timestamp
        t: u64,
    },
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Welcome message after connection
    Welcome {
        username: String,
        player_id: i64,
        instance_id: String,
        server_time: u64,
    },

    /// An event published to a destination this client subscribed to
    Event {
        destination: String,
        payload: serde_json::Value,
    },

    /// Error message
    Error { code: String, message: String },

    /// Pong response
    Pong {
        /// Echo back client timestamp
        t: u64,
    },
}

impl ServerMsg {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvatarKind {
    Human,
    Npc,
}

/// One avatar as rendered to every client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvatarState {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: AvatarKind,
    /// None for NPCs and for the disguised infiltrator
    pub owner_username: Option<String>,
    pub x: f64,
    pub y: f64,
    /// Always false on the wire; roles are only revealed per player
    pub is_infiltrator: bool,
    pub is_alive: bool,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Island {
    pub cx: f64,
    pub cy: f64,
    pub radius: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Boat {
    pub x: f64,
    pub y: f64,
    pub interaction_radius: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FuelWindow {
    pub open: bool,
    /// Seconds until the window toggles
    pub seconds_remaining: i32,
}

/// Full game snapshot published on `game/{code}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameState {
    pub code: String,
    pub timestamp: u64,
    pub timer_seconds: i32,
    pub island: Island,
    pub avatars: Vec<AvatarState>,
    pub fuel_percentage: f64,
    pub status: MatchStatus,
    pub boat: Boat,
    pub winner_message: Option<String>,
    pub fuel_window: FuelWindow,
    pub voting_active: bool,
}

/// Published on `game/{code}/vote/start`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteStart {
    pub round: u64,
    pub options: Vec<AvatarState>,
    pub message: String,
    pub duration_seconds: u64,
    pub vote_ends_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteAck {
    pub username: String,
    pub message: String,
}

/// Published on `game/{code}/elimination`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EliminationEvent {
    pub target_id: i64,
    pub target_username: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuelActionResponse {
    pub fuel_percentage: f64,
    pub status: MatchStatus,
    pub winner_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbyPlayer {
    pub id: i64,
    pub username: String,
    pub alive: bool,
}

/// Public lobby view, published on `lobby/{code}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbyView {
    pub code: String,
    pub status: MatchStatus,
    pub host: Option<String>,
    pub players: Vec<LobbyPlayer>,
    pub min_players: usize,
    pub max_players: usize,
    pub winner_message: Option<String>,
}

/// A player's own role, never broadcast
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleView {
    pub username: String,
    pub player_id: i64,
    pub infiltrator: bool,
    pub npc_alias: Option<String>,
    pub alive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMatchResponse {
    pub code: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_use_tagged_snake_case() {
        let msg: ClientMsg =
            serde_json::from_str(r#"{"type":"move","code":"ABC123","avatar_id":4,"dx":1,"dy":0}"#)
                .unwrap();
        match msg {
            ClientMsg::Move { code, avatar_id, dx, .. } => {
                assert_eq!(code, "ABC123");
                assert_eq!(avatar_id, Some(4));
                assert_eq!(dx, 1.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn avatar_kind_is_serialized_as_type() {
        let avatar = AvatarState {
            id: 100_000,
            kind: AvatarKind::Npc,
            owner_username: None,
            x: 0.0,
            y: 0.0,
            is_infiltrator: false,
            is_alive: true,
            display_name: "NPC-100000".into(),
        };
        let json = serde_json::to_value(&avatar).unwrap();
        assert_eq!(json["type"], "npc");
    }
}

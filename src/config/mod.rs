//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Allowed client origins for CORS (comma-separated, `*` for any)
    pub client_origin: String,
    /// Identifies this process on the event channel
    pub instance_id: String,
    /// Shared Redis store; unset means a single in-memory node
    pub redis_url: Option<String>,

    /// Lifetime of a match entry, refreshed on every transaction
    pub match_ttl_secs: u64,
    /// Lifetime of a player session entry
    pub session_ttl_secs: u64,
    /// Bounded wait for the per-match lock
    pub lock_wait: Duration,
    /// Lease on a held lock, so a crashed holder cannot wedge a match
    pub lock_lease: Duration,

    /// Gameplay tunables
    pub rules: GameRules,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Render provides PORT env var, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        let defaults = GameRules::default();
        let rules = GameRules {
            match_duration_secs: parse_or("MATCH_DURATION_SECS", defaults.match_duration_secs)?,
            vote_duration_secs: parse_or("VOTE_DURATION_SECS", defaults.vote_duration_secs)?,
            tick_period: Duration::from_millis(parse_or("TICK_PERIOD_MS", 1000u64)?),
            ..defaults
        };

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            client_origin: env::var("CLIENT_ORIGIN").unwrap_or_else(|_| "*".to_string()),
            instance_id: env::var("INSTANCE_ID").unwrap_or_else(|_| Uuid::new_v4().to_string()),
            redis_url: env::var("REDIS_URL")
                .ok()
                .map(|url| url.trim().to_string())
                .filter(|url| !url.is_empty()),

            match_ttl_secs: parse_or("MATCH_TTL_SECS", 2 * 60 * 60)?,
            session_ttl_secs: parse_or("SESSION_TTL_SECS", 60 * 60)?,
            lock_wait: Duration::from_secs(parse_or("LOCK_WAIT_SECS", 5u64)?),
            lock_lease: Duration::from_secs(parse_or("LOCK_LEASE_SECS", 15u64)?),

            rules,
        })
    }
}

fn parse_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key)),
        Err(_) => Ok(default),
    }
}

/// Gameplay constants shared by the engine, the vote coordinator and the
/// request handlers.
#[derive(Clone, Debug)]
pub struct GameRules {
    /// Length of a match once started
    pub match_duration_secs: i32,
    /// Fuel window toggles open/closed every cycle
    pub fuel_window_cycle_secs: i32,
    /// Time a vote stays open before it is concluded by timeout
    pub vote_duration_secs: u64,
    /// Engine tick period
    pub tick_period: Duration,

    /// Island is a circle centred on the origin
    pub island_radius: f64,
    pub boat_x: f64,
    pub boat_y: f64,
    pub boat_interaction_radius: f64,

    /// Max distance between infiltrator and victim
    pub elimination_range: f64,
    /// Default fuel delta when a request omits the amount
    pub fuel_step: f64,
    /// Movement step as a fraction of the island radius
    pub move_step_ratio: f64,

    pub min_players: usize,
    pub max_players: usize,

    pub npc_speed_multiplier: f64,
    pub npc_base_speed: f64,
}

impl Default for GameRules {
    fn default() -> Self {
        Self {
            match_duration_secs: 4 * 60,
            fuel_window_cycle_secs: 60,
            vote_duration_secs: 20,
            tick_period: Duration::from_secs(1),
            island_radius: 100.0,
            boat_x: 112.0,
            boat_y: 0.0,
            boat_interaction_radius: 40.0,
            elimination_range: 20.0,
            fuel_step: 5.0,
            move_step_ratio: 0.035,
            min_players: 5,
            max_players: 8,
            npc_speed_multiplier: 3.0,
            npc_base_speed: 0.8,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}

#[cfg(test)]
impl Config {
    /// Fast settings for in-process tests
    pub fn for_tests() -> Self {
        Self {
            server_addr: ([127, 0, 0, 1], 0).into(),
            log_level: "debug".to_string(),
            client_origin: "*".to_string(),
            instance_id: Uuid::new_v4().to_string(),
            redis_url: None,
            match_ttl_secs: 2 * 60 * 60,
            session_ttl_secs: 60 * 60,
            lock_wait: Duration::from_secs(2),
            lock_lease: Duration::from_secs(10),
            rules: GameRules {
                vote_duration_secs: 1,
                tick_period: Duration::from_millis(20),
                ..GameRules::default()
            },
        }
    }
}

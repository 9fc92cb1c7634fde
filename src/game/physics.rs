//! Island geometry and movement constraints

use rand::Rng;

use super::model::Position;

/// Margin kept between wandering NPCs and the shoreline
pub const NPC_SHORE_MARGIN: f64 = 2.0;
/// Margin kept between players and the shoreline
pub const PLAYER_SHORE_MARGIN: f64 = 0.5;
/// NPC speed is clamped into this band before the multiplier applies
pub const NPC_SPEED_MIN: f64 = 0.15;
pub const NPC_SPEED_MAX: f64 = 0.55;
/// Distance at which an NPC counts as having reached its waypoint
pub const WAYPOINT_REACHED: f64 = 1.0;

/// Result of advancing one NPC for one tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NpcStep {
    /// Close enough to the waypoint; pick a new one
    Arrived,
    /// The step would run into the shoreline; pick a new waypoint
    Blocked,
    /// New position after the step
    Moved(Position),
}

/// Physics helpers for the circular island centred on the origin
pub struct PhysicsSystem;

impl PhysicsSystem {
    /// Euclidean distance; a missing position counts as the origin
    pub fn distance(a: Option<Position>, b: Option<Position>) -> f64 {
        let a = a.unwrap_or_default();
        let b = b.unwrap_or_default();
        (a.x - b.x).hypot(a.y - b.y)
    }

    /// Uniformly random angle, uniformly random distance in `[0, max_radius)`
    pub fn random_point<R: Rng + ?Sized>(rng: &mut R, max_radius: f64) -> Position {
        let angle = rng.gen_range(0.0..std::f64::consts::TAU);
        let distance = if max_radius > 0.0 {
            rng.gen_range(0.0..max_radius)
        } else {
            0.0
        };
        Position {
            x: angle.cos() * distance,
            y: angle.sin() * distance,
        }
    }

    /// Move a player one fixed step along `(dx, dy)`, pulling the result
    /// back inside the island when it would leave it.
    ///
    /// Returns `None` for a degenerate direction.
    pub fn step_player(
        pos: Position,
        dx: f64,
        dy: f64,
        step: f64,
        island_radius: f64,
    ) -> Option<Position> {
        let len = dx.hypot(dy);
        if !len.is_finite() || len < 1e-6 {
            return None;
        }

        let proposed = Position {
            x: pos.x + dx / len * step,
            y: pos.y + dy / len * step,
        };

        let limit = island_radius - PLAYER_SHORE_MARGIN;
        let dist = proposed.radius();
        if dist > limit {
            let scale = limit / dist;
            return Some(Position {
                x: proposed.x * scale,
                y: proposed.y * scale,
            });
        }

        Some(proposed)
    }

    /// Advance an NPC toward its waypoint by `speed * multiplier * dt`,
    /// never overshooting the waypoint.
    pub fn step_npc(
        pos: Position,
        waypoint: Position,
        speed: f64,
        multiplier: f64,
        dt: f64,
        island_radius: f64,
    ) -> NpcStep {
        let dx = waypoint.x - pos.x;
        let dy = waypoint.y - pos.y;
        let distance = dx.hypot(dy);

        if distance < WAYPOINT_REACHED {
            return NpcStep::Arrived;
        }

        let base = speed.clamp(NPC_SPEED_MIN, NPC_SPEED_MAX);
        let step = (base * multiplier * dt).min(distance);
        let next = Position {
            x: pos.x + dx / distance * step,
            y: pos.y + dy / distance * step,
        };

        if next.radius() >= island_radius - NPC_SHORE_MARGIN {
            return NpcStep::Blocked;
        }

        NpcStep::Moved(next)
    }
}

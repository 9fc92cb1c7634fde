//! Per-match tick engine.
//!
//! Each running match gets one repeating task on the scheduler. A firing is
//! one transaction: stop if the match is no longer running, resolve it if the
//! clock ran out, otherwise move the NPCs and take a second off the clock.
//! The resulting state is published on `game/{code}` after the lock is gone.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, error, info};

use crate::config::GameRules;
use crate::error::MatchResult;
use crate::store::MatchTransactions;
use crate::util::time::TICK_DELTA_SECS;
use crate::ws::fanout::EventFanout;
use crate::ws::protocol::{game_destination, GameState};

use super::model::{Match, Position};
use super::physics::{NpcStep, PhysicsSystem};
use super::scheduler::{Scheduler, TaskControl, TaskKey};
use super::snapshot::SnapshotBuilder;

/// NPC waypoints are drawn inside this fraction of the island radius
const WAYPOINT_RADIUS_RATIO: f64 = 0.9;

enum TickOutcome {
    /// Match not running any more; nothing changed
    Idle,
    Continue(GameState),
    Finished(GameState),
}

pub struct GameEngine {
    tx: MatchTransactions,
    scheduler: Scheduler,
    fanout: Arc<EventFanout>,
    snapshots: SnapshotBuilder,
    rules: GameRules,
    /// match code -> npc id -> waypoint; local to this process
    waypoints: Mutex<HashMap<String, HashMap<i64, Position>>>,
    rng: Mutex<ChaCha8Rng>,
}

impl GameEngine {
    pub fn new(
        tx: MatchTransactions,
        scheduler: Scheduler,
        fanout: Arc<EventFanout>,
        rules: GameRules,
    ) -> Self {
        Self {
            tx,
            scheduler,
            fanout,
            snapshots: SnapshotBuilder::new(rules.clone()),
            rules,
            waypoints: Mutex::new(HashMap::new()),
            rng: Mutex::new(ChaCha8Rng::from_entropy()),
        }
    }

    /// Starts (or restarts) the ticker for `code`
    pub fn start_ticker(self: &Arc<Self>, code: &str) {
        let engine = Arc::downgrade(self);
        let owned = code.to_string();

        self.scheduler.schedule_repeating(
            TaskKey::Ticker(code.to_string()),
            self.rules.tick_period,
            move || {
                let engine = engine.clone();
                let code = owned.clone();
                async move {
                    match engine.upgrade() {
                        Some(engine) => engine.tick(&code).await,
                        None => TaskControl::Stop,
                    }
                }
            },
        );
        info!(code, period_ms = self.rules.tick_period.as_millis() as u64, "Ticker started");
    }

    /// Idempotent
    pub fn stop_ticker(&self, code: &str) {
        if self.scheduler.cancel(&TaskKey::Ticker(code.to_string())) {
            info!(code, "Ticker stopped");
        }
        self.waypoints.lock().remove(code);
    }

    /// Matches whose ticker runs on this process
    pub fn running_matches(&self) -> usize {
        self.scheduler.count_where(|key| matches!(key, TaskKey::Ticker(_)))
    }

    pub fn is_ticking(&self, code: &str) -> bool {
        self.scheduler.is_scheduled(&TaskKey::Ticker(code.to_string()))
    }

    /// One engine step for `code`. Never fails: errors end or skip the tick.
    pub async fn tick(&self, code: &str) -> TaskControl {
        let outcome: MatchResult<TickOutcome> = self.tx.update(code, |m| Ok(self.advance(m))).await;

        match outcome {
            Ok(TickOutcome::Continue(state)) => {
                self.fanout.publish(&game_destination(code), &state).await;
                TaskControl::Continue
            }
            Ok(TickOutcome::Finished(state)) => {
                self.fanout.publish(&game_destination(code), &state).await;
                self.stop_ticker(code);
                TaskControl::Stop
            }
            Ok(TickOutcome::Idle) => {
                debug!(code, "Match no longer running, ticker exits");
                self.stop_ticker(code);
                TaskControl::Stop
            }
            Err(e) if e.ends_background_task() => {
                debug!(code, error = %e, "Ticker exits quietly");
                self.stop_ticker(code);
                TaskControl::Stop
            }
            Err(e) => {
                error!(code, error = %e, "Tick failed, retrying next period");
                TaskControl::Continue
            }
        }
    }

    fn advance(&self, m: &mut Match) -> TickOutcome {
        if !m.is_started() {
            return TickOutcome::Idle;
        }

        if m.timer_seconds <= 0 {
            m.resolve_time_up();
            return TickOutcome::Finished(self.snapshots.game_state(m));
        }

        self.move_npcs(m);
        m.timer_seconds -= 1;

        if m.timer_seconds <= 0 {
            m.resolve_time_up();
            return TickOutcome::Finished(self.snapshots.game_state(m));
        }

        TickOutcome::Continue(self.snapshots.game_state(m))
    }

    fn move_npcs(&self, m: &mut Match) {
        let radius = self.rules.island_radius;
        let waypoint_radius = radius * WAYPOINT_RADIUS_RATIO;

        let mut rng = self.rng.lock();
        let mut all = self.waypoints.lock();
        let waypoints = all.entry(m.code.clone()).or_default();
        waypoints.retain(|id, _| m.npcs.iter().any(|n| n.active && n.id == *id));

        for npc in m.npcs.iter_mut().filter(|n| n.active) {
            let waypoint = *waypoints
                .entry(npc.id)
                .or_insert_with(|| PhysicsSystem::random_point(&mut *rng, waypoint_radius));

            match PhysicsSystem::step_npc(
                npc.position,
                waypoint,
                npc.movement_speed,
                self.rules.npc_speed_multiplier,
                TICK_DELTA_SECS,
                radius,
            ) {
                NpcStep::Moved(next) => npc.position = next,
                NpcStep::Arrived | NpcStep::Blocked => {
                    waypoints.insert(npc.id, PhysicsSystem::random_point(&mut *rng, waypoint_radius));
                }
            }
        }
    }
}

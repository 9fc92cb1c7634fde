//! Timed group votes.
//!
//! A vote is opened by an alive castaway and closed exactly once, either
//! when every alive castaway has voted or when its timeout fires, whichever
//! gets the match lock first. Each round carries a number; a close request
//! for a round that is no longer open is a no-op, which is what makes the
//! two triggers safe to race.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::GameRules;
use crate::error::{MatchError, MatchResult};
use crate::store::MatchTransactions;
use crate::util::time::unix_millis;
use crate::ws::fanout::EventFanout;
use crate::ws::protocol::{
    game_destination, vote_result_destination, vote_start_destination, VoteAck, VoteStart,
};

use super::engine::GameEngine;
use super::model::{
    ExpelledKind, Match, MatchStatus, VoteResult, VoteTrigger, MSG_ALL_NPCS_GONE,
    MSG_INFILTRATOR_EXPELLED,
};
use super::scheduler::{Scheduler, TaskKey};
use super::snapshot::SnapshotBuilder;

const MSG_VOTE_STARTED: &str = "Vote started: choose who to expel from the island";
const MSG_NO_MAJORITY: &str = "No majority was reached. Nobody is expelled";

/// Ballot count for one round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tally {
    pub counts: BTreeMap<i64, u32>,
    pub abstentions: u32,
    /// Strict leader holding at least half of the counted votes
    pub leader: Option<i64>,
}

/// Counts ballots. Negative targets abstain and are left out of the total.
/// The leader must beat every other target outright and hold at least
/// `max(1, ceil(total / 2))` votes.
pub fn tally(ballots: &BTreeMap<String, i64>) -> Tally {
    let mut counts = BTreeMap::new();
    let mut abstentions = 0;
    for &target in ballots.values() {
        if target < 0 {
            abstentions += 1;
        } else {
            *counts.entry(target).or_insert(0u32) += 1;
        }
    }

    let total: u32 = counts.values().sum();
    let threshold = ((total + 1) / 2).max(1);

    let mut best = 0;
    let mut leader = None;
    let mut tied = false;
    for (&target, &votes) in &counts {
        if votes > best {
            best = votes;
            leader = Some(target);
            tied = false;
        } else if votes == best {
            tied = true;
        }
    }

    Tally {
        counts,
        abstentions,
        leader: leader.filter(|_| !tied && best >= threshold),
    }
}

/// Whether `target` may receive a (non-abstain) ballot
pub fn is_votable(m: &Match, target: i64) -> bool {
    m.npcs.iter().any(|n| n.active && n.id == target)
        || m.infiltrator().map_or(false, |p| p.alive && p.id == target)
}

/// Round to close if every alive castaway has a ballot in
pub fn quorum_round(m: &Match) -> Option<u64> {
    (m.voting.active && m.voting.ballots.len() >= m.alive_crew_count()).then_some(m.voting.round)
}

/// Applies the tally to the match and closes the round
fn resolve(m: &mut Match, trigger: VoteTrigger) -> VoteResult {
    let Tally {
        counts,
        abstentions,
        leader,
    } = tally(&m.voting.ballots);

    let (expelled_id, expelled_type, message) = match leader {
        None => (None, ExpelledKind::None, MSG_NO_MAJORITY.to_string()),
        Some(id) => expel(m, id),
    };

    m.voting.active = false;
    m.voting.ballots.clear();

    let result = VoteResult {
        round: m.voting.round,
        counts,
        expelled_id,
        expelled_type,
        message,
        abstentions,
        trigger,
        concluded_at: Utc::now(),
    };
    m.voting.last_result = Some(result.clone());
    result
}

fn expel(m: &mut Match, id: i64) -> (Option<i64>, ExpelledKind, String) {
    if let Some(player) = m.player_by_id_mut(id) {
        player.alive = false;
        let name = player.username.clone();
        if player.infiltrator {
            m.finish(MSG_INFILTRATOR_EXPELLED);
            return (Some(id), ExpelledKind::Human, MSG_INFILTRATOR_EXPELLED.to_string());
        }
        return (
            Some(id),
            ExpelledKind::Human,
            format!("{} was expelled, but was not the infiltrator", name),
        );
    }

    if let Some(idx) = m.npcs.iter().position(|n| n.id == id) {
        let npc = m.npcs.remove(idx);
        if m.active_npc_count() == 0 && m.infiltrator_alive() {
            m.finish(MSG_ALL_NPCS_GONE);
            return (Some(id), ExpelledKind::Npc, MSG_ALL_NPCS_GONE.to_string());
        }
        return (
            Some(id),
            ExpelledKind::Npc,
            format!("{} was expelled. It was only an NPC", npc.display_name),
        );
    }

    (None, ExpelledKind::None, MSG_NO_MAJORITY.to_string())
}

pub struct VoteCoordinator {
    tx: MatchTransactions,
    scheduler: Scheduler,
    fanout: Arc<EventFanout>,
    engine: Arc<GameEngine>,
    snapshots: SnapshotBuilder,
    vote_duration: Duration,
}

impl VoteCoordinator {
    pub fn new(
        tx: MatchTransactions,
        scheduler: Scheduler,
        fanout: Arc<EventFanout>,
        engine: Arc<GameEngine>,
        rules: &GameRules,
    ) -> Self {
        Self {
            tx,
            scheduler,
            fanout,
            engine,
            snapshots: SnapshotBuilder::new(rules.clone()),
            vote_duration: Duration::from_secs(rules.vote_duration_secs),
        }
    }

    /// Opens a round and schedules its timeout
    pub async fn start_vote(self: &Arc<Self>, code: &str, username: &str) -> MatchResult<VoteStart> {
        let code = code.trim().to_string();
        let coordinator = Arc::downgrade(self);
        let duration = self.vote_duration;

        let (start, state) = self
            .tx
            .update(&code, |m| {
                m.ensure_running()?;
                let player = m
                    .player(username)
                    .ok_or_else(|| MatchError::forbidden("You are not part of this match"))?;
                if !player.is_alive_crew() {
                    return Err(MatchError::forbidden("Only alive castaways can start a vote"));
                }
                if m.voting.active {
                    return Err(MatchError::validation("A vote is already in progress"));
                }

                let now = unix_millis();
                m.voting.active = true;
                m.voting.round += 1;
                m.voting.started_at_ms = now;
                m.voting.ballots.clear();
                let round = m.voting.round;

                // Scheduled under the lock; a round that never gets persisted
                // makes this timeout a no-op
                let timeout_code = code.clone();
                self.scheduler.schedule_once(
                    TaskKey::VoteTimeout(code.clone()),
                    duration,
                    move || async move {
                        if let Some(coordinator) = coordinator.upgrade() {
                            coordinator
                                .close_in_background(&timeout_code, round, VoteTrigger::Timeout)
                                .await;
                        }
                    },
                );

                info!(code = %m.code, username, round, "Vote started");
                let start = VoteStart {
                    round,
                    options: self.snapshots.vote_options(m),
                    message: MSG_VOTE_STARTED.to_string(),
                    duration_seconds: duration.as_secs(),
                    vote_ends_at_ms: now + duration.as_millis() as u64,
                };
                Ok((start, self.snapshots.game_state(m)))
            })
            .await?;

        self.fanout.publish(&vote_start_destination(&code), &start).await;
        self.fanout.publish(&game_destination(&code), &state).await;
        Ok(start)
    }

    /// Records or replaces the caller's ballot; closes the round once every
    /// alive castaway has voted.
    pub async fn submit_ballot(
        &self,
        code: &str,
        username: &str,
        target_id: i64,
    ) -> MatchResult<VoteAck> {
        let code = code.trim();
        let quorum = self
            .tx
            .update(code, |m| {
                m.ensure_running()?;
                if !m.voting.active {
                    return Err(MatchError::validation("There is no vote in progress"));
                }
                let player = m
                    .player(username)
                    .ok_or_else(|| MatchError::forbidden("You are not part of this match"))?;
                if !player.is_alive_crew() {
                    return Err(MatchError::forbidden("Only alive castaways can vote"));
                }
                if target_id >= 0 && !is_votable(m, target_id) {
                    return Err(MatchError::validation("That avatar cannot be voted for"));
                }

                m.voting.ballots.insert(username.to_string(), target_id);
                debug!(
                    code = %m.code,
                    username,
                    ballots = m.voting.ballots.len(),
                    needed = m.alive_crew_count(),
                    "Ballot recorded"
                );
                Ok(quorum_round(m))
            })
            .await?;

        if let Some(round) = quorum {
            self.close_in_background(code, round, VoteTrigger::Quorum).await;
        }

        Ok(VoteAck {
            username: username.to_string(),
            message: if target_id < 0 {
                "Abstention recorded".to_string()
            } else {
                "Vote recorded".to_string()
            },
        })
    }

    /// Closes `round` if it is still open. Returns the result only for the
    /// caller that actually closed it.
    pub async fn conclude(
        &self,
        code: &str,
        round: u64,
        trigger: VoteTrigger,
    ) -> MatchResult<Option<VoteResult>> {
        let closed = self
            .tx
            .update(code, |m| {
                if !m.voting.active || m.voting.round != round {
                    return Ok(None);
                }
                self.scheduler.cancel(&TaskKey::VoteTimeout(m.code.clone()));
                let result = resolve(m, trigger);
                info!(
                    code = %m.code,
                    round,
                    trigger = ?trigger,
                    expelled = ?result.expelled_id,
                    "Vote concluded"
                );
                Ok(Some((
                    result,
                    self.snapshots.game_state(m),
                    m.status == MatchStatus::Finished,
                )))
            })
            .await?;

        let Some((result, state, finished)) = closed else {
            debug!(code, round, trigger = ?trigger, "Round already closed");
            return Ok(None);
        };

        if finished {
            self.engine.stop_ticker(code);
        }
        self.fanout.publish(&vote_result_destination(code), &result).await;
        self.fanout.publish(&game_destination(code), &state).await;
        Ok(Some(result))
    }

    /// Conclusion from a trigger that has no caller to report to
    pub async fn close_in_background(&self, code: &str, round: u64, trigger: VoteTrigger) {
        match self.conclude(code, round, trigger).await {
            Ok(_) => {}
            Err(e) if e.ends_background_task() => {
                warn!(code, round, error = %e, "Vote could not be concluded");
            }
            Err(e) => error!(code, round, error = %e, "Vote conclusion failed"),
        }
    }

    /// Last stored result, for clients that missed the event
    pub async fn last_result(&self, code: &str) -> MatchResult<Option<VoteResult>> {
        let m = self
            .tx
            .matches()
            .find_active(code)
            .await?
            .ok_or_else(|| MatchError::match_not_found(code.trim()))?;
        Ok(m.voting.last_result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::test_support::{node, seed_match, stored_match};
    use crate::game::model::fixtures::started_match;
    use crate::game::model::ABSTAIN_TARGET;
    use crate::store::{MemoryBackend, SharedBackend};
    use tokio_test::{assert_err, assert_ok};

    fn ballots(votes: &[i64]) -> BTreeMap<String, i64> {
        votes
            .iter()
            .enumerate()
            .map(|(i, &t)| (format!("v{}", i), t))
            .collect()
    }

    #[test]
    fn clear_majority_leads() {
        let t = tally(&ballots(&[9, 9, 9, 8]));
        assert_eq!(t.leader, Some(9));
        assert_eq!(t.counts.get(&9), Some(&3));
    }

    #[test]
    fn ties_and_empty_rounds_have_no_leader() {
        assert_eq!(tally(&ballots(&[9, 9, 8, 8])).leader, None);
        assert_eq!(tally(&ballots(&[])).leader, None);

        let abstained = tally(&ballots(&[ABSTAIN_TARGET, -7, ABSTAIN_TARGET]));
        assert_eq!(abstained.leader, None);
        assert_eq!(abstained.abstentions, 3);
        assert!(abstained.counts.is_empty());
    }

    #[test]
    fn plurality_below_half_is_not_enough() {
        // 2 of 5 counted votes, threshold 3
        assert_eq!(tally(&ballots(&[9, 9, 8, 7, 6])).leader, None);
        // abstentions do not count toward the total
        assert_eq!(tally(&ballots(&[9, ABSTAIN_TARGET, ABSTAIN_TARGET])).leader, Some(9));
    }

    async fn open_vote(app: &crate::app::AppState, code: &str) -> u64 {
        let start = assert_ok!(app.votes.start_vote(code, "p2").await);
        start.round
    }

    #[tokio::test]
    async fn quorum_expels_the_last_npc_and_the_infiltrator_wins() {
        let app = node(Arc::new(MemoryBackend::new())).await;
        let mut m = started_match("AAAAAA", 5);
        // NPC 8 already gone, 9 is the last one
        m.npcs.retain(|n| n.id == 9);
        seed_match(&app, &m).await;

        open_vote(&app, "AAAAAA").await;
        for (voter, target) in [("p2", 9), ("p3", 9), ("p4", 9), ("p5", 1)] {
            assert_ok!(app.votes.submit_ballot("AAAAAA", voter, target).await);
        }

        let stored = stored_match(&app, "AAAAAA").await;
        assert!(stored.npcs.is_empty());
        assert_eq!(stored.status, MatchStatus::Finished);
        assert_eq!(stored.winner_message.as_deref(), Some(MSG_ALL_NPCS_GONE));

        let result = stored.voting.last_result.unwrap();
        assert_eq!(result.expelled_id, Some(9));
        assert_eq!(result.expelled_type, ExpelledKind::Npc);
        assert_eq!(result.trigger, VoteTrigger::Quorum);
        assert!(!stored.voting.active);
        assert!(stored.voting.ballots.is_empty());
        assert!(!app.scheduler.is_scheduled(&TaskKey::VoteTimeout("AAAAAA".into())));
    }

    #[tokio::test]
    async fn expelling_the_disguised_infiltrator_wins_for_the_crew() {
        let app = node(Arc::new(MemoryBackend::new())).await;
        seed_match(&app, &started_match("AAAAAA", 5)).await;
        app.engine.start_ticker("AAAAAA");

        open_vote(&app, "AAAAAA").await;
        for voter in ["p2", "p3", "p4", "p5"] {
            assert_ok!(app.votes.submit_ballot("AAAAAA", voter, 1).await);
        }

        let stored = stored_match(&app, "AAAAAA").await;
        assert_eq!(stored.status, MatchStatus::Finished);
        assert_eq!(stored.winner_message.as_deref(), Some(MSG_INFILTRATOR_EXPELLED));
        assert!(!stored.player("p1").unwrap().alive);
        assert!(!app.engine.is_ticking("AAAAAA"));
    }

    #[tokio::test]
    async fn timeout_closes_a_partial_round_without_expulsion() {
        let app = node(Arc::new(MemoryBackend::new())).await;
        seed_match(&app, &started_match("AAAAAA", 5)).await;

        open_vote(&app, "AAAAAA").await;
        assert_ok!(app.votes.submit_ballot("AAAAAA", "p2", 9).await);
        assert_ok!(app.votes.submit_ballot("AAAAAA", "p3", 8).await);

        // test config closes votes after one second
        tokio::time::sleep(Duration::from_millis(1_300)).await;

        let stored = stored_match(&app, "AAAAAA").await;
        let result = stored.voting.last_result.unwrap();
        assert_eq!(result.trigger, VoteTrigger::Timeout);
        assert_eq!(result.expelled_id, None);
        assert_eq!(stored.npcs.len(), 2);
        assert!(!stored.voting.active);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_triggers_close_the_round_once() {
        let backend: Arc<dyn SharedBackend> = Arc::new(MemoryBackend::new());
        let a = node(backend.clone()).await;
        let b = node(backend).await;
        seed_match(&a, &started_match("AAAAAA", 5)).await;

        let round = open_vote(&a, "AAAAAA").await;
        for voter in ["p2", "p3", "p4"] {
            assert_ok!(a.votes.submit_ballot("AAAAAA", voter, 9).await);
        }
        let mut results = a.fanout.subscribe_local();

        let quorum = {
            let votes = a.votes.clone();
            tokio::spawn(async move { votes.conclude("AAAAAA", round, VoteTrigger::Quorum).await })
        };
        let timeout = {
            let votes = b.votes.clone();
            tokio::spawn(async move { votes.conclude("AAAAAA", round, VoteTrigger::Timeout).await })
        };
        let closed = [
            assert_ok!(quorum.await.unwrap()),
            assert_ok!(timeout.await.unwrap()),
        ];
        assert_eq!(closed.iter().filter(|r| r.is_some()).count(), 1);

        let stored = stored_match(&a, "AAAAAA").await;
        assert_eq!(stored.npcs.len(), 1);

        let mut published = 0;
        while let Ok(Ok(event)) =
            tokio::time::timeout(Duration::from_millis(200), results.recv()).await
        {
            if event.destination == "game/AAAAAA/vote/result" {
                published += 1;
            }
        }
        assert_eq!(published, 1);
    }

    #[tokio::test]
    async fn stale_round_is_ignored() {
        let app = node(Arc::new(MemoryBackend::new())).await;
        seed_match(&app, &started_match("AAAAAA", 5)).await;
        let round = open_vote(&app, "AAAAAA").await;

        assert!(assert_ok!(app.votes.conclude("AAAAAA", round + 1, VoteTrigger::Timeout).await).is_none());
        assert!(assert_ok!(app.votes.conclude("AAAAAA", round, VoteTrigger::Timeout).await).is_some());
        assert!(assert_ok!(app.votes.conclude("AAAAAA", round, VoteTrigger::Timeout).await).is_none());
    }

    #[tokio::test]
    async fn only_alive_castaways_take_part() {
        let app = node(Arc::new(MemoryBackend::new())).await;
        let mut m = started_match("AAAAAA", 5);
        m.player_mut("p5").unwrap().alive = false;
        seed_match(&app, &m).await;

        let err = assert_err!(app.votes.start_vote("AAAAAA", "p1").await);
        assert!(matches!(err, MatchError::Forbidden(_)));
        let err = assert_err!(app.votes.start_vote("AAAAAA", "p5").await);
        assert!(matches!(err, MatchError::Forbidden(_)));

        open_vote(&app, "AAAAAA").await;
        // a second start while one is open is a bad request, not a conflict
        let err = assert_err!(app.votes.start_vote("AAAAAA", "p3").await);
        assert!(matches!(err, MatchError::Validation(_)));

        let err = assert_err!(app.votes.submit_ballot("AAAAAA", "p1", 9).await);
        assert!(matches!(err, MatchError::Forbidden(_)));
        // castaways are not valid targets
        let err = assert_err!(app.votes.submit_ballot("AAAAAA", "p2", 3).await);
        assert!(matches!(err, MatchError::Validation(_)));

        // three alive castaways: the third ballot reaches quorum
        assert_ok!(app.votes.submit_ballot("AAAAAA", "p2", ABSTAIN_TARGET).await);
        assert_ok!(app.votes.submit_ballot("AAAAAA", "p2", 8).await);
        assert_ok!(app.votes.submit_ballot("AAAAAA", "p3", 8).await);
        assert_ok!(app.votes.submit_ballot("AAAAAA", "p4", ABSTAIN_TARGET).await);

        let result = assert_ok!(app.votes.last_result("AAAAAA").await).unwrap();
        assert_eq!(result.expelled_id, Some(8));
        assert_eq!(result.abstentions, 1);
    }

    #[tokio::test]
    async fn vote_start_reaches_clients_of_every_process() {
        let backend: Arc<dyn SharedBackend> = Arc::new(MemoryBackend::new());
        let a = node(backend.clone()).await;
        let b = node(backend).await;
        seed_match(&a, &started_match("AAAAAA", 5)).await;
        let mut on_b = b.fanout.subscribe_local();

        let before = unix_millis();
        let round = open_vote(&a, "AAAAAA").await;

        let event = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let event = on_b.recv().await.unwrap();
                if event.destination == "game/AAAAAA/vote/start" {
                    return event;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(event.source_id, a.fanout.instance_id());
        let payload = &event.payload;
        assert_eq!(payload["round"], round);
        assert_eq!(payload["duration_seconds"], 1);
        let ends_at = payload["vote_ends_at_ms"].as_u64().unwrap();
        assert!(ends_at >= before + 1_000);

        // active NPCs first, then the infiltrator under its alias
        let options: Vec<i64> = payload["options"]
            .as_array()
            .unwrap()
            .iter()
            .map(|o| o["id"].as_i64().unwrap())
            .collect();
        assert_eq!(options, vec![8, 9, 1]);
        assert!(payload["options"]
            .as_array()
            .unwrap()
            .iter()
            .all(|o| o["is_infiltrator"] == false));
    }
}

//! Matchmaking loop (spec §4.5). Every tick, one instance (guarded by a
//! lease-based distributed lock so several instances can share one
//! `Store`) sorts the waiting queue by Elo, pairs feasible waiters
//! minimizing the Elo gap, injects the built-in agent for waiters who
//! have been patient enough to accept one, and expires stale entries.
//!
//! Background-loop idiom generalized to a `tokio::interval` task selecting
//! over a shutdown channel, matching `ClockService::run`.

use crate::error::CoreError;
use crate::game_service::{GameService, NewPlayer, NotificationSink};
use crate::model::{now_ms, AgentRating, AuthContext, OpponentType, QueueEntry, QueueStatus, TimeControlMode};
use crate::store::Store;
use crate::types::Color;
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Display name and rating-sheet key of the resident built-in agent.
pub const BUILTIN_AGENT_NAME: &str = "checkmate-bot";

const LOCK_KEY: &str = "matchmaking_process";
const LOCK_LEASE: Duration = Duration::from_secs(5);
const MAX_ELO_RANGE: i32 = 200;
/// Minimum wait, for a waiter whose `opponentType` is `ai`/`either`, before
/// they can be paired against an already-queued third-party agent. Distinct
/// from `builtin_agent_delay_ms`, which gates the separate bot-injection step.
const ANY_AGENT_DELAY_SECS: u64 = 10;

/// Side-effect seam for starting a move-driving loop once a game is
/// matched against the built-in agent. Implemented by the agent pool in
/// production; a no-op in tests so `Matchmaker` has no upward dependency
/// on the agent module.
pub trait AgentLauncher: Send + Sync {
    fn launch(&self, session_id: Uuid, agent_player_id: Uuid);
}

pub struct NullLauncher;

impl AgentLauncher for NullLauncher {
    fn launch(&self, _session_id: Uuid, _agent_player_id: Uuid) {}
}

pub struct Matchmaker {
    store: Arc<Store>,
    games: Arc<GameService>,
    notifier: Arc<dyn NotificationSink>,
    agents: Arc<dyn AgentLauncher>,
    instance_id: Uuid,
}

fn is_agent_entry(e: &QueueEntry) -> bool {
    e.is_builtin_agent || e.agent_name.is_some()
}

fn opponent_type_ok(mine: OpponentType, other_is_agent: bool) -> bool {
    match mine {
        OpponentType::Human => !other_is_agent,
        OpponentType::Ai => other_is_agent,
        OpponentType::Either => true,
    }
}

fn time_controls_overlap(a: &[TimeControlMode], b: &[TimeControlMode]) -> bool {
    if a.is_empty() || b.is_empty() {
        return true;
    }
    a.iter().any(|m| b.contains(m))
}

/// True unless `waiter` has `opponentType` `ai`/`either` and would be paired
/// against an already-queued third-party agent (`agent` entry, not the
/// built-in bot) before waiting `ANY_AGENT_DELAY_SECS`.
fn any_agent_delay_ok(waiter: &QueueEntry, agent: &QueueEntry, agent_is_agent: bool, now: u64) -> bool {
    if !agent_is_agent || agent.is_builtin_agent {
        return true;
    }
    if !matches!(waiter.opponent_type, OpponentType::Ai | OpponentType::Either) {
        return true;
    }
    waiter.waited_secs(now) >= ANY_AGENT_DELAY_SECS
}

fn feasible(p1: &QueueEntry, p2: &QueueEntry, now: u64) -> bool {
    if p1.is_ranked != p2.is_ranked {
        return false;
    }
    let p1_agent = is_agent_entry(p1);
    let p2_agent = is_agent_entry(p2);
    if !opponent_type_ok(p1.opponent_type, p2_agent) || !opponent_type_ok(p2.opponent_type, p1_agent) {
        return false;
    }
    if !any_agent_delay_ok(p1, p2, p2_agent, now) || !any_agent_delay_ok(p2, p1, p1_agent, now) {
        return false;
    }
    if !time_controls_overlap(&p1.time_controls, &p2.time_controls) {
        return false;
    }
    if let (Some(e1), Some(e2)) = (&p1.engine_name, &p2.engine_name)
        && !e1.is_empty()
        && e1 == e2
    {
        return false;
    }
    if p1.is_ranked {
        let gap = (p1.current_elo - p2.current_elo).abs();
        let tolerance = p1.elo_tolerance(now).max(p2.elo_tolerance(now));
        if gap > tolerance {
            return false;
        }
    }
    true
}

/// Searches outward from `entries[i]` in both directions, stopping once
/// the Elo gap exceeds `MAX_ELO_RANGE`, returning the feasible candidate
/// with the smallest gap.
fn find_best_match(entries: &[QueueEntry], i: usize, matched: &HashSet<Uuid>, now: u64) -> Option<usize> {
    let p1 = &entries[i];
    let mut best: Option<(usize, i32)> = None;

    for j in (i + 1)..entries.len() {
        let p2 = &entries[j];
        let gap = (p2.current_elo - p1.current_elo).abs();
        if gap > MAX_ELO_RANGE {
            break;
        }
        if matched.contains(&p2.id) {
            continue;
        }
        if feasible(p1, p2, now) && best.is_none_or(|(_, g)| gap < g) {
            best = Some((j, gap));
        }
    }
    for j in (0..i).rev() {
        let p2 = &entries[j];
        let gap = (p1.current_elo - p2.current_elo).abs();
        if gap > MAX_ELO_RANGE {
            break;
        }
        if matched.contains(&p2.id) {
            continue;
        }
        if feasible(p1, p2, now) && best.is_none_or(|(_, g)| gap < g) {
            best = Some((j, gap));
        }
    }
    best.map(|(j, _)| j)
}

/// Picks which side plays white: honors a single stated preference,
/// breaks a same-preference tie by join order, and otherwise flips a
/// cryptographic coin.
fn choose_white<'a>(p1: &'a QueueEntry, p2: &'a QueueEntry) -> (&'a QueueEntry, &'a QueueEntry) {
    match (p1.preferred_color, p2.preferred_color) {
        (Some(c1), Some(c2)) if c1 != c2 => {
            if c1 == Color::White { (p1, p2) } else { (p2, p1) }
        }
        (Some(c1), None) => {
            if c1 == Color::White { (p1, p2) } else { (p2, p1) }
        }
        (None, Some(c2)) => {
            if c2 == Color::White { (p2, p1) } else { (p1, p2) }
        }
        (Some(_), Some(_)) => {
            if p1.joined_at_ms <= p2.joined_at_ms { (p1, p2) } else { (p2, p1) }
        }
        (None, None) => {
            if OsRng.gen_bool(0.5) { (p1, p2) } else { (p2, p1) }
        }
    }
}

fn choose_time_control(white: &QueueEntry, black: &QueueEntry) -> TimeControlMode {
    let overlap: Vec<TimeControlMode> = if white.time_controls.is_empty() && black.time_controls.is_empty() {
        return TimeControlMode::Standard;
    } else if white.time_controls.is_empty() {
        black.time_controls.clone()
    } else if black.time_controls.is_empty() {
        white.time_controls.clone()
    } else {
        white.time_controls.iter().copied().filter(|m| black.time_controls.contains(m)).collect()
    };
    *overlap.choose(&mut OsRng).unwrap_or(&TimeControlMode::Standard)
}

/// Minimum wait, measured against the human's `joinedAt`, before the
/// built-in agent may be injected as that waiter's opponent.
fn builtin_agent_delay_ms(opponent_type: OpponentType) -> Option<u64> {
    match opponent_type {
        OpponentType::Ai => Some(10_000),
        OpponentType::Either => Some(20_000),
        OpponentType::Human => None,
    }
}

fn new_player_from_entry(e: &QueueEntry) -> NewPlayer {
    NewPlayer {
        user_id: e.user_id,
        display_name: e.display_name.clone(),
        agent_name: e.agent_name.clone(),
        client_software: None,
        engine_name: e.engine_name.clone(),
        elo_rating_at_join: e.current_elo,
    }
}

impl Matchmaker {
    pub fn new(store: Arc<Store>, games: Arc<GameService>, notifier: Arc<dyn NotificationSink>, agents: Arc<dyn AgentLauncher>, instance_id: Uuid) -> Self {
        Self { store, games, notifier, agents, instance_id }
    }

    fn auth_for(user_id: Option<Uuid>) -> AuthContext {
        AuthContext { user_id, is_api_key: false }
    }

    fn mark_entry(&self, entry: &mut QueueEntry, status: QueueStatus, matched_session_id: Option<Uuid>) -> Result<(), CoreError> {
        entry.status = status;
        entry.matched_session_id = matched_session_id;
        self.store.queue_entries()?.put(entry.id.as_bytes(), entry)
    }

    fn create_match(&self, white: &QueueEntry, black: &QueueEntry) -> Result<Uuid, CoreError> {
        let mode = choose_time_control(white, black);
        let game = self
            .games
            .create_game(&Self::auth_for(white.user_id), new_player_from_entry(white), mode, white.is_ranked)
            .map_err(|e| CoreError::transient(e.to_string()))?;
        let game = self
            .games
            .join_game(&Self::auth_for(black.user_id), game.session_id, None, new_player_from_entry(black))
            .map_err(|e| CoreError::transient(e.to_string()))?;

        self.notifier.notify_match_found(&white.connection_id, game.session_id, Color::White);
        self.notifier.notify_match_found(&black.connection_id, game.session_id, Color::Black);

        let white_player = game.player_slot(Color::White);
        let black_player = game.player_slot(Color::Black);
        if is_agent_entry(white) && let Some(p) = white_player {
            self.agents.launch(game.session_id, p.id);
        }
        if is_agent_entry(black) && let Some(p) = black_player {
            self.agents.launch(game.session_id, p.id);
        }
        Ok(game.session_id)
    }

    fn builtin_agent_rating(&self) -> Result<i32, CoreError> {
        let ratings = self.store.agent_ratings()?;
        Ok(ratings.get::<AgentRating>(BUILTIN_AGENT_NAME.as_bytes())?.map(|r| r.elo_rating).unwrap_or(1600))
    }

    fn synthetic_agent_entry(&self, human: &QueueEntry, now: u64) -> Result<QueueEntry, CoreError> {
        Ok(QueueEntry {
            id: Uuid::new_v4(),
            connection_id: String::new(),
            user_id: None,
            display_name: "Checkmate Bot".to_string(),
            agent_name: Some(BUILTIN_AGENT_NAME.to_string()),
            engine_name: None,
            is_ranked: human.is_ranked,
            current_elo: self.builtin_agent_rating()?,
            opponent_type: OpponentType::Ai,
            preferred_color: None,
            time_controls: human.time_controls.clone(),
            joined_at_ms: now,
            expires_at_ms: now,
            status: QueueStatus::Waiting,
            matched_session_id: None,
            is_builtin_agent: true,
        })
    }

    /// Runs a single tick: pairing, agent injection, and expiry sweep.
    /// Returns immediately without doing any work if another instance
    /// currently holds the lock.
    pub fn tick(&self) -> Result<(), CoreError> {
        let now = now_ms();
        let locks = self.store.locks()?;
        if !locks.try_acquire_lock(LOCK_KEY, &self.instance_id.to_string(), LOCK_LEASE, now)? {
            return Ok(());
        }

        let queue = self.store.queue_entries()?;
        let mut entries: Vec<QueueEntry> = queue.scan_prefix::<QueueEntry>([])?.into_iter().filter(|e| e.status == QueueStatus::Waiting).collect();
        entries.sort_by_key(|e| e.current_elo);

        let mut matched: HashSet<Uuid> = HashSet::new();
        for i in 0..entries.len() {
            if matched.contains(&entries[i].id) {
                continue;
            }
            let Some(j) = find_best_match(&entries, i, &matched, now) else { continue };

            let (p1, p2) = (entries[i].clone(), entries[j].clone());
            let (white, black) = choose_white(&p1, &p2);
            let session_id = self.create_match(white, black)?;

            matched.insert(p1.id);
            matched.insert(p2.id);

            let mut white_owned = if white.id == p1.id { p1.clone() } else { p2.clone() };
            let mut black_owned = if black.id == p1.id { p1.clone() } else { p2.clone() };
            self.mark_entry(&mut white_owned, QueueStatus::Matched, Some(session_id))?;
            self.mark_entry(&mut black_owned, QueueStatus::Matched, Some(session_id))?;
        }

        for entry in entries.iter() {
            if matched.contains(&entry.id) || is_agent_entry(entry) {
                continue;
            }
            let Some(delay_ms) = builtin_agent_delay_ms(entry.opponent_type) else { continue };
            if entry.waited_secs(now) * 1000 < delay_ms {
                continue;
            }
            let agent_entry = self.synthetic_agent_entry(entry, now)?;
            let (white, black) = choose_white(entry, &agent_entry);
            let session_id = self.create_match(white, black)?;
            let mut entry_owned = entry.clone();
            self.mark_entry(&mut entry_owned, QueueStatus::Matched, Some(session_id))?;
            matched.insert(entry.id);
        }

        for entry in entries.into_iter() {
            if matched.contains(&entry.id) {
                continue;
            }
            if now >= entry.expires_at_ms {
                let mut entry = entry;
                self.mark_entry(&mut entry, QueueStatus::Expired, None)?;
            }
        }

        if !matched.is_empty() {
            self.notifier.notify_lobby_update();
        }

        locks.delete(LOCK_KEY)?;
        Ok(())
    }

    /// Runs the tick loop until `shutdown` fires.
    pub async fn run(self: Arc<Self>, tick_ms: u64, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_millis(tick_ms));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick() {
                        log::warn!("matchmaker tick failed: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("matchmaker shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockService;
    use crate::game_service::NullSink;

    fn harness() -> (Arc<Store>, Arc<Matchmaker>) {
        let dir = std::env::temp_dir().join(format!("chesscore_mm_test_{}", Uuid::new_v4()));
        let store = Arc::new(Store::open(dir.to_str().unwrap()).unwrap());
        let (clock, _rx) = ClockService::new();
        let games = Arc::new(GameService::new(store.clone(), clock, Arc::new(NullSink), None, 300));
        let mm = Arc::new(Matchmaker::new(store.clone(), games, Arc::new(NullSink), Arc::new(NullLauncher), Uuid::new_v4()));
        (store, mm)
    }

    fn sample_entry(display_name: &str, elo: i32, joined_at_ms: u64) -> QueueEntry {
        QueueEntry {
            id: Uuid::new_v4(),
            connection_id: format!("conn-{display_name}"),
            user_id: None,
            display_name: display_name.to_string(),
            agent_name: None,
            engine_name: None,
            is_ranked: false,
            current_elo: elo,
            opponent_type: OpponentType::Either,
            preferred_color: None,
            time_controls: vec![],
            joined_at_ms,
            expires_at_ms: joined_at_ms + 5 * 60_000,
            status: QueueStatus::Waiting,
            matched_session_id: None,
            is_builtin_agent: false,
        }
    }

    #[test]
    fn pairs_two_compatible_waiters_by_elo_proximity() {
        let (store, mm) = harness();
        let queue = store.queue_entries().unwrap();
        let now = now_ms();
        let a = sample_entry("alice", 1500, now);
        let b = sample_entry("bob", 1520, now);
        queue.put(a.id.as_bytes(), &a).unwrap();
        queue.put(b.id.as_bytes(), &b).unwrap();

        mm.tick().unwrap();

        let reloaded: QueueEntry = queue.get(a.id.as_bytes()).unwrap().unwrap();
        assert_eq!(reloaded.status, QueueStatus::Matched);
        assert!(reloaded.matched_session_id.is_some());
    }

    #[test]
    fn elo_gap_beyond_max_range_leaves_both_waiting() {
        let (store, mm) = harness();
        let queue = store.queue_entries().unwrap();
        let now = now_ms();
        let a = sample_entry("alice", 1000, now);
        let b = sample_entry("bob", 1500, now);
        queue.put(a.id.as_bytes(), &a).unwrap();
        queue.put(b.id.as_bytes(), &b).unwrap();

        mm.tick().unwrap();

        let reloaded: QueueEntry = queue.get(a.id.as_bytes()).unwrap().unwrap();
        assert_eq!(reloaded.status, QueueStatus::Waiting);
    }

    #[test]
    fn expired_entry_is_marked_expired() {
        let (store, mm) = harness();
        let queue = store.queue_entries().unwrap();
        let mut a = sample_entry("alice", 1500, now_ms());
        a.expires_at_ms = now_ms().saturating_sub(1);
        queue.put(a.id.as_bytes(), &a).unwrap();

        mm.tick().unwrap();

        let reloaded: QueueEntry = queue.get(a.id.as_bytes()).unwrap().unwrap();
        assert_eq!(reloaded.status, QueueStatus::Expired);
    }

    #[test]
    fn human_waiting_past_delay_gets_builtin_agent() {
        let (store, mm) = harness();
        let queue = store.queue_entries().unwrap();
        let mut a = sample_entry("alice", 1500, now_ms() - 25_000);
        a.opponent_type = OpponentType::Either;
        a.expires_at_ms = now_ms() + 5 * 60_000;
        queue.put(a.id.as_bytes(), &a).unwrap();

        mm.tick().unwrap();

        let reloaded: QueueEntry = queue.get(a.id.as_bytes()).unwrap().unwrap();
        assert_eq!(reloaded.status, QueueStatus::Matched);
    }

    #[test]
    fn fresh_waiter_is_not_paired_against_third_party_agent() {
        let (store, mm) = harness();
        let queue = store.queue_entries().unwrap();
        let now = now_ms();
        let human = sample_entry("alice", 1500, now);
        let mut agent = sample_entry("stockbot", 1500, now);
        agent.agent_name = Some("stockbot".to_string());
        agent.engine_name = Some("stockfish".to_string());
        queue.put(human.id.as_bytes(), &human).unwrap();
        queue.put(agent.id.as_bytes(), &agent).unwrap();

        mm.tick().unwrap();

        let reloaded: QueueEntry = queue.get(human.id.as_bytes()).unwrap().unwrap();
        assert_eq!(reloaded.status, QueueStatus::Waiting);
    }

    #[test]
    fn waiter_past_ten_seconds_is_paired_against_third_party_agent() {
        let (store, mm) = harness();
        let queue = store.queue_entries().unwrap();
        let now = now_ms();
        let human = sample_entry("alice", 1500, now - 11_000);
        let mut agent = sample_entry("stockbot", 1500, now);
        agent.agent_name = Some("stockbot".to_string());
        agent.engine_name = Some("stockfish".to_string());
        queue.put(human.id.as_bytes(), &human).unwrap();
        queue.put(agent.id.as_bytes(), &agent).unwrap();

        mm.tick().unwrap();

        let reloaded: QueueEntry = queue.get(human.id.as_bytes()).unwrap().unwrap();
        assert_eq!(reloaded.status, QueueStatus::Matched);
    }
}

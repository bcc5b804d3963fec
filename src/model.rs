//! Server-facing data model: games, players, users, queue entries, match
//! history, and the cross-instance event envelope (spec §3).

use crate::types::Color;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use utoipa::ToSchema;
use uuid::Uuid;

/// Milliseconds since the Unix epoch, used throughout for all timestamp
/// fields so clocks are comparable without a timezone library.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    Waiting,
    Active,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum WinReason {
    Checkmate,
    Stalemate,
    Resignation,
    Timeout,
    DrawByAgreement,
    DrawByThreefoldRepetition,
    DrawByFiftyMoves,
    DrawByFivefoldRepetition,
    DrawBySeventyFiveMoveRule,
    DrawByInsufficientMaterial,
}

impl WinReason {
    /// True for reasons that end the game without a winner.
    pub fn is_draw(self) -> bool {
        !matches!(self, WinReason::Checkmate | WinReason::Resignation | WinReason::Timeout)
    }
}

/// One of the six bit-exact time-control modes (spec §6). All times in ms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TimeControlMode {
    Unlimited,
    Casual,
    Standard,
    Quick,
    Blitz,
    Tournament,
}

impl TimeControlMode {
    pub fn base_and_increment_ms(self) -> (u64, u64) {
        match self {
            TimeControlMode::Unlimited => (0, 0),
            TimeControlMode::Casual => (30 * 60_000, 0),
            TimeControlMode::Standard => (15 * 60_000, 10_000),
            TimeControlMode::Quick => (5 * 60_000, 3_000),
            TimeControlMode::Blitz => (3 * 60_000, 2_000),
            TimeControlMode::Tournament => (90 * 60_000, 30_000),
        }
    }

    pub fn is_unlimited(self) -> bool {
        matches!(self, TimeControlMode::Unlimited)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TimeControl {
    pub mode: TimeControlMode,
    pub base_ms: u64,
    pub increment_ms: u64,
}

impl TimeControl {
    pub fn new(mode: TimeControlMode) -> Self {
        let (base_ms, increment_ms) = mode.base_and_increment_ms();
        Self { mode, base_ms, increment_ms }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, ToSchema)]
pub struct PlayerTimes {
    pub white_remaining_ms: u64,
    pub black_remaining_ms: u64,
    pub white_last_move_at_ms: u64,
    pub black_last_move_at_ms: u64,
}

impl PlayerTimes {
    pub fn remaining(&self, color: Color) -> u64 {
        match color {
            Color::White => self.white_remaining_ms,
            Color::Black => self.black_remaining_ms,
        }
    }

    pub fn set_remaining(&mut self, color: Color, ms: u64) {
        match color {
            Color::White => self.white_remaining_ms = ms,
            Color::Black => self.black_remaining_ms = ms,
        }
    }

    pub fn last_move_at(&self, color: Color) -> u64 {
        match color {
            Color::White => self.white_last_move_at_ms,
            Color::Black => self.black_last_move_at_ms,
        }
    }

    pub fn set_last_move_at(&mut self, color: Color, ms: u64) {
        match color {
            Color::White => self.white_last_move_at_ms = ms,
            Color::Black => self.black_last_move_at_ms = ms,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct DrawOffers {
    pub white_offers_used: u8,
    pub black_offers_used: u8,
    pub pending_from_color: Option<Color>,
}

impl DrawOffers {
    pub fn offers_used(&self, color: Color) -> u8 {
        match color {
            Color::White => self.white_offers_used,
            Color::Black => self.black_offers_used,
        }
    }

    pub fn increment(&mut self, color: Color) {
        match color {
            Color::White => self.white_offers_used += 1,
            Color::Black => self.black_offers_used += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Player {
    pub id: Uuid,
    pub color: Color,
    pub user_id: Option<Uuid>,
    pub display_name: String,
    pub agent_name: Option<String>,
    pub client_software: Option<String>,
    pub engine_name: Option<String>,
    pub elo_rating_at_join: i32,
    pub joined_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EloChanges {
    pub white_change: i32,
    pub black_change: i32,
}

/// The authoritative per-session record. `boardState` is a full 6-field FEN.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Game {
    pub session_id: Uuid,
    pub players: Vec<Player>,
    pub status: GameStatus,
    pub current_turn: Color,
    pub board_state: String,
    pub move_count: u32,
    pub position_history: Vec<String>,
    pub time_control: Option<TimeControl>,
    pub player_times: PlayerTimes,
    pub draw_offers: DrawOffers,
    pub is_ranked: bool,
    pub winner: Option<Color>,
    pub win_reason: Option<WinReason>,
    pub elo_changes: Option<EloChanges>,
    pub created_at_ms: u64,
    pub started_at_ms: Option<u64>,
    pub updated_at_ms: u64,
    pub completed_at_ms: Option<u64>,
}

impl Game {
    pub fn player_slot(&self, color: Color) -> Option<&Player> {
        self.players.iter().find(|p| p.color == color)
    }

    pub fn player_by_id(&self, player_id: Uuid) -> Option<&Player> {
        self.players.iter().find(|p| p.id == player_id)
    }

    pub fn is_complete(&self) -> bool {
        self.status == GameStatus::Complete
    }
}

/// One entry in the append-only move log, keyed by `(session_id, move_number)`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MoveRecord {
    pub session_id: Uuid,
    pub move_number: u32,
    pub color: Color,
    pub from: String,
    pub to: String,
    pub piece: String,
    pub notation: String,
    pub capture: bool,
    pub check: bool,
    pub checkmate: bool,
    pub promotion: Option<String>,
    pub created_at_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UserPreferences {
    pub auto_decline_draws: bool,
    pub preferred_time_controls: Vec<TimeControlMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    pub auth_methods: Vec<String>,
    pub email_verified: bool,
    pub elo_rating: i32,
    pub ranked_wins: u32,
    pub ranked_losses: u32,
    pub ranked_draws: u32,
    pub ranked_games_played: u32,
    pub total_games_played: u32,
    pub failed_login_attempts: u32,
    pub account_locked_until_ms: Option<u64>,
    pub preferences: UserPreferences,
    pub display_name_changes: u32,
    pub last_display_name_change_ms: Option<u64>,
}

impl User {
    pub fn new(id: Uuid, email: String, display_name: String) -> Self {
        Self {
            id,
            email: email.to_lowercase(),
            display_name,
            auth_methods: Vec::new(),
            email_verified: false,
            elo_rating: 1600,
            ranked_wins: 0,
            ranked_losses: 0,
            ranked_draws: 0,
            ranked_games_played: 0,
            total_games_played: 0,
            failed_login_attempts: 0,
            account_locked_until_ms: None,
            preferences: UserPreferences::default(),
            display_name_changes: 0,
            last_display_name_change_ms: None,
        }
    }

    /// Valid display names are 3-20 chars, alphanumeric plus underscore.
    pub fn is_valid_display_name(name: &str) -> bool {
        let len = name.chars().count();
        (3..=20).contains(&len) && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    pub fn is_locked(&self, now: u64) -> bool {
        self.account_locked_until_ms.is_some_and(|t| t > now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AgentRating {
    pub owner_user_id: Uuid,
    pub agent_name: String,
    pub elo_rating: i32,
    pub ranked_wins: u32,
    pub ranked_losses: u32,
    pub ranked_draws: u32,
    pub ranked_games_played: u32,
}

impl AgentRating {
    pub fn new(owner_user_id: Uuid, agent_name: String) -> Self {
        Self {
            owner_user_id,
            agent_name,
            elo_rating: 1600,
            ranked_wins: 0,
            ranked_losses: 0,
            ranked_draws: 0,
            ranked_games_played: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum OpponentType {
    Human,
    Ai,
    Either,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Waiting,
    Matched,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct QueueEntry {
    pub id: Uuid,
    pub connection_id: String,
    pub user_id: Option<Uuid>,
    pub display_name: String,
    pub agent_name: Option<String>,
    pub engine_name: Option<String>,
    pub is_ranked: bool,
    pub current_elo: i32,
    pub opponent_type: OpponentType,
    pub preferred_color: Option<Color>,
    pub time_controls: Vec<TimeControlMode>,
    pub joined_at_ms: u64,
    pub expires_at_ms: u64,
    pub status: QueueStatus,
    pub matched_session_id: Option<Uuid>,
    pub is_builtin_agent: bool,
}

impl QueueEntry {
    /// Seconds waited as of `now`, used by the Elo-tolerance ladder and the
    /// agent-delay ladder.
    pub fn waited_secs(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.joined_at_ms) / 1000
    }

    /// Elo tolerance grows from 50 by 25 every 10 seconds, capped at 200.
    pub fn elo_tolerance(&self, now_ms: u64) -> i32 {
        let steps = (self.waited_secs(now_ms) / 10) as i32;
        (50 + steps * 25).min(200)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MatchHistory {
    pub id: Uuid,
    pub session_id: Uuid,
    pub white_player_id: Uuid,
    pub black_player_id: Uuid,
    pub white_display_name: String,
    pub black_display_name: String,
    pub white_start_elo: i32,
    pub black_start_elo: i32,
    pub white_elo_delta: i32,
    pub black_elo_delta: i32,
    pub winner: Option<Color>,
    pub win_reason: Option<WinReason>,
    pub is_ranked: bool,
    pub move_count: u32,
    pub duration_ms: u64,
    pub created_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WsEventType {
    Broadcast,
    MatchNotification,
}

/// Cross-instance envelope replayed by the event bus (spec §4.8). TTL of
/// 60 seconds after insertion.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WsEvent {
    pub id: Uuid,
    pub origin_instance_id: Uuid,
    pub event_type: WsEventType,
    pub session_id: Option<Uuid>,
    pub payload: Option<serde_json::Value>,
    pub exclude_player_id: Option<Uuid>,
    pub connection_id: Option<String>,
    pub match_session_id: Option<Uuid>,
    pub created_at_ms: u64,
}

impl WsEvent {
    pub fn is_expired(&self, now_ms: u64, ttl_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at_ms) > ttl_ms
    }
}

/// Authentication outcome resolved by the (external) bearer-token verifier
/// before a handler runs. The core only compares `user_id` against a
/// player slot's bound identity; it never verifies passwords or issues
/// tokens itself.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub user_id: Option<Uuid>,
    pub is_api_key: bool,
}

impl AuthContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// A player slot bound to a `user_id` may only be acted on by a request
    /// authenticated as that same user.
    pub fn authorize_slot(&self, slot_user_id: Option<Uuid>) -> bool {
        match slot_user_id {
            None => true,
            Some(uid) => self.user_id == Some(uid),
        }
    }
}

/// Runtime configuration, populated from CLI flags layered over
/// `CHESSCORE_`-prefixed environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: String,
    pub matchmaker_tick_ms: u64,
    pub queue_timeout_ms: u64,
    pub position_history_cap: usize,
    pub clock_tick_ms: u64,
    pub event_bus_ttl_ms: u64,
    pub instance_id: Uuid,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            data_dir: "data".to_string(),
            matchmaker_tick_ms: 2_000,
            queue_timeout_ms: 5 * 60_000,
            position_history_cap: 300,
            clock_tick_ms: 1_000,
            event_bus_ttl_ms: 60_000,
            instance_id: Uuid::new_v4(),
        }
    }
}

/// Paginated list envelope shared by the `/games/*` and `/users/{id}/games`
/// read endpoints.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

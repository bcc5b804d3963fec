//! Completion processing: invoked the moment a game transitions to
//! `complete` (spec §4.9). Computes Elo deltas for ranked games, updates
//! win/loss/draw counters, and appends a `MatchHistory` record.

use crate::elo;
use crate::error::CoreError;
use crate::model::{AgentRating, EloChanges, Game, MatchHistory, MoveRecord, User};
use crate::storage::{ArchiveStore, GameArchive};
use crate::store::Store;
use crate::types::{Color, MoveJson};
use uuid::Uuid;

/// Either side of a `(rating, ranked_games_played)` pair, regardless of
/// whether the player is a registered user or a named built-in agent.
struct RatingSubject {
    rating: i32,
    ranked_games_played: u32,
}

fn load_rating_subject(store: &Store, user_id: Option<Uuid>, agent_name: Option<&str>) -> Result<RatingSubject, CoreError> {
    if let Some(uid) = user_id {
        let users = store.users()?;
        let user: Option<User> = users.get(uid.as_bytes())?;
        return Ok(match user {
            Some(u) => RatingSubject { rating: u.elo_rating, ranked_games_played: u.ranked_games_played },
            None => RatingSubject { rating: 1600, ranked_games_played: 0 },
        });
    }
    if let Some(name) = agent_name {
        let ratings = store.agent_ratings()?;
        let rating: Option<AgentRating> = ratings.get(name.as_bytes())?;
        return Ok(match rating {
            Some(r) => RatingSubject { rating: r.elo_rating, ranked_games_played: r.ranked_games_played },
            None => RatingSubject { rating: 1600, ranked_games_played: 0 },
        });
    }
    Ok(RatingSubject { rating: 1600, ranked_games_played: 0 })
}

fn apply_outcome(user: &mut User, score: f64, new_rating: i32) {
    user.elo_rating = new_rating;
    user.ranked_games_played += 1;
    user.total_games_played += 1;
    if score > 0.5 {
        user.ranked_wins += 1;
    } else if score < 0.5 {
        user.ranked_losses += 1;
    } else {
        user.ranked_draws += 1;
    }
}

fn apply_agent_outcome(rating: &mut AgentRating, score: f64, new_rating: i32) {
    rating.elo_rating = new_rating;
    rating.ranked_games_played += 1;
    if score > 0.5 {
        rating.ranked_wins += 1;
    } else if score < 0.5 {
        rating.ranked_losses += 1;
    } else {
        rating.ranked_draws += 1;
    }
}

fn store_rating_update(store: &Store, user_id: Option<Uuid>, agent_name: Option<&str>, score: f64, new_rating: i32) -> Result<(), CoreError> {
    if let Some(uid) = user_id {
        let users = store.users()?;
        let mut user: User = users.get(uid.as_bytes())?.unwrap_or_else(|| User::new(uid, format!("{uid}@unknown.local"), "player".to_string()));
        apply_outcome(&mut user, score, new_rating);
        users.put(uid.as_bytes(), &user)?;
        return Ok(());
    }
    if let Some(name) = agent_name {
        let ratings = store.agent_ratings()?;
        let mut rating: AgentRating = ratings.get(name.as_bytes())?.unwrap_or_else(|| AgentRating::new(Uuid::nil(), name.to_string()));
        apply_agent_outcome(&mut rating, score, new_rating);
        ratings.put(name.as_bytes(), &rating)?;
    }
    Ok(())
}

fn bump_unranked_total(store: &Store, user_id: Option<Uuid>) -> Result<(), CoreError> {
    if let Some(uid) = user_id {
        let users = store.users()?;
        if let Some(mut user) = users.get::<User>(uid.as_bytes())? {
            user.total_games_played += 1;
            users.put(uid.as_bytes(), &user)?;
        }
    }
    Ok(())
}

/// Finalizes a just-completed game: Elo updates (ranked only), counter
/// bookkeeping, a persisted `MatchHistory` row, and (when `archive` is
/// configured) a compact on-disk archive of the full move log. `game.status`
/// must already be `Complete` with `winner`/`win_reason` set.
pub fn finalize(store: &Store, archive: Option<&ArchiveStore>, game: &mut Game, now_ms: u64) -> Result<(), CoreError> {
    let completed_at = game.completed_at_ms.unwrap_or(now_ms);
    game.completed_at_ms = Some(completed_at);

    let white = game.player_slot(Color::White).cloned().ok_or_else(|| CoreError::fatal("game has no white player"))?;
    let black = game.player_slot(Color::Black).cloned().ok_or_else(|| CoreError::fatal("game has no black player"))?;
    let started_at = game.started_at_ms.unwrap_or(game.created_at_ms);
    let duration_ms = completed_at.saturating_sub(started_at);

    let (white_elo_delta, black_elo_delta) = if game.is_ranked {
        let white_subject = load_rating_subject(store, white.user_id, white.agent_name.as_deref())?;
        let black_subject = load_rating_subject(store, black.user_id, black.agent_name.as_deref())?;

        let white_score = match game.winner {
            Some(Color::White) => 1.0,
            Some(Color::Black) => 0.0,
            None => 0.5,
        };
        let (white_new, black_new) = elo::apply_result(
            white_subject.rating,
            white_subject.ranked_games_played,
            black_subject.rating,
            black_subject.ranked_games_played,
            white_score,
        );

        store_rating_update(store, white.user_id, white.agent_name.as_deref(), white_score, white_new)?;
        store_rating_update(store, black.user_id, black.agent_name.as_deref(), 1.0 - white_score, black_new)?;

        (white_new - white_subject.rating, black_new - black_subject.rating)
    } else {
        bump_unranked_total(store, white.user_id)?;
        bump_unranked_total(store, black.user_id)?;
        (0, 0)
    };

    game.elo_changes = Some(EloChanges { white_change: white_elo_delta, black_change: black_elo_delta });

    let history = MatchHistory {
        id: Uuid::new_v4(),
        session_id: game.session_id,
        white_player_id: white.id,
        black_player_id: black.id,
        white_display_name: white.display_name.clone(),
        black_display_name: black.display_name.clone(),
        white_start_elo: white.elo_rating_at_join,
        black_start_elo: black.elo_rating_at_join,
        white_elo_delta,
        black_elo_delta,
        winner: game.winner,
        win_reason: game.win_reason,
        is_ranked: game.is_ranked,
        move_count: game.move_count,
        duration_ms,
        created_at_ms: completed_at,
    };
    let match_history = store.match_history()?;
    match_history.put(history.id.as_bytes(), &history)?;

    if let Some(archive) = archive {
        let moves: Vec<MoveJson> = store
            .moves()?
            .scan_prefix::<MoveRecord>(format!("{}:", game.session_id))?
            .into_iter()
            .map(|r| MoveJson { from: r.from, to: r.to, promotion: r.promotion })
            .collect();
        let game_archive = GameArchive { session_id: game.session_id, start_ms: started_at, end_ms: completed_at, winner: game.winner, win_reason: game.win_reason, moves };
        if let Err(e) = archive.archive(&game_archive) {
            log::warn!("failed to archive completed game {}: {e}", game.session_id);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DrawOffers, GameStatus, Player, PlayerTimes, TimeControl, TimeControlMode, WinReason};

    fn sample_game(is_ranked: bool) -> Game {
        let now = crate::model::now_ms();
        Game {
            session_id: Uuid::new_v4(),
            players: vec![
                Player {
                    id: Uuid::new_v4(),
                    color: Color::White,
                    user_id: Some(Uuid::new_v4()),
                    display_name: "alice".into(),
                    agent_name: None,
                    client_software: None,
                    engine_name: None,
                    elo_rating_at_join: 1600,
                    joined_at_ms: now,
                },
                Player {
                    id: Uuid::new_v4(),
                    color: Color::Black,
                    user_id: Some(Uuid::new_v4()),
                    display_name: "bob".into(),
                    agent_name: None,
                    client_software: None,
                    engine_name: None,
                    elo_rating_at_join: 1600,
                    joined_at_ms: now,
                },
            ],
            status: GameStatus::Complete,
            current_turn: Color::White,
            board_state: crate::types::Position::starting().to_fen(),
            move_count: 40,
            position_history: vec![],
            time_control: Some(TimeControl::new(TimeControlMode::Blitz)),
            player_times: PlayerTimes::default(),
            draw_offers: DrawOffers::default(),
            is_ranked,
            winner: Some(Color::White),
            win_reason: Some(WinReason::Checkmate),
            elo_changes: None,
            created_at_ms: now,
            started_at_ms: Some(now),
            updated_at_ms: now,
            completed_at_ms: None,
        }
    }

    #[test]
    fn ranked_completion_sets_elo_changes_and_history() {
        let dir = std::env::temp_dir().join(format!("chesscore_completion_test_{}", Uuid::new_v4()));
        let store = Store::open(dir.to_str().unwrap()).unwrap();
        let mut game = sample_game(true);
        finalize(&store, None, &mut game, crate::model::now_ms()).unwrap();
        let changes = game.elo_changes.unwrap();
        assert!(changes.white_change > 0);
        assert!(changes.black_change < 0);

        let history = store.match_history().unwrap();
        let all: Vec<MatchHistory> = history.scan_prefix([]).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].session_id, game.session_id);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unranked_completion_skips_elo() {
        let dir = std::env::temp_dir().join(format!("chesscore_completion_test_{}", Uuid::new_v4()));
        let store = Store::open(dir.to_str().unwrap()).unwrap();
        let mut game = sample_game(false);
        finalize(&store, None, &mut game, crate::model::now_ms()).unwrap();
        let changes = game.elo_changes.unwrap();
        assert_eq!(changes.white_change, 0);
        assert_eq!(changes.black_change, 0);
        let _ = std::fs::remove_dir_all(&dir);
    }
}

//! Built-in agent (spec §4.6): a resident per-game driver that plays moves
//! by calling the same public move API an external client would use.
//!
//! Grounded on `reqwest::Client::builder()` usage in
//! `JosunLP-checkai/src/update.rs` (originally the self-update checker),
//! repurposed here for the agent's own outbound HTTP calls.

use crate::matchmaker::AgentLauncher;
use crate::model::GameStatus;
use crate::types::{Board, ChessMove, Color, MoveJson, Piece, PieceKind, Position};
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

const SAFETY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONSECUTIVE_FAILURES: u32 = 5;
const SCORE_TOLERANCE_CP: i32 = 30;
const SEARCH_DEPTH: u32 = 2;

fn backoff_ms(failures: u32) -> u64 {
    match failures {
        0 | 1 => 1000,
        2 => 2000,
        3 => 4000,
        4 => 8000,
        _ => 16000,
    }
}

// ---------------------------------------------------------------------------
// Evaluation: material + piece-square tables, white's perspective
// ---------------------------------------------------------------------------

const PAWN_PST: [i32; 64] = [
    0, 0, 0, 0, 0, 0, 0, 0, 5, 10, 10, -20, -20, 10, 10, 5, 5, -5, -10, 0, 0, -10, -5, 5, 0, 0, 0,
    20, 20, 0, 0, 0, 5, 5, 10, 25, 25, 10, 5, 5, 10, 10, 20, 30, 30, 20, 10, 10, 50, 50, 50, 50,
    50, 50, 50, 50, 0, 0, 0, 0, 0, 0, 0, 0,
];
const KNIGHT_PST: [i32; 64] = [
    -50, -40, -30, -30, -30, -30, -40, -50, -40, -20, 0, 5, 5, 0, -20, -40, -30, 5, 10, 15, 15,
    10, 5, -30, -30, 0, 15, 20, 20, 15, 0, -30, -30, 5, 15, 20, 20, 15, 5, -30, -30, 0, 10, 15,
    15, 10, 0, -30, -40, -20, 0, 0, 0, 0, -20, -40, -50, -40, -30, -30, -30, -30, -40, -50,
];
const BISHOP_PST: [i32; 64] = [
    -20, -10, -10, -10, -10, -10, -10, -20, -10, 5, 0, 0, 0, 0, 5, -10, -10, 10, 10, 10, 10, 10,
    10, -10, -10, 0, 10, 10, 10, 10, 0, -10, -10, 5, 5, 10, 10, 5, 5, -10, -10, 0, 5, 10, 10, 5,
    0, -10, -10, 0, 0, 0, 0, 0, 0, -10, -20, -10, -10, -10, -10, -10, -10, -20,
];
const ROOK_PST: [i32; 64] = [
    0, 0, 0, 5, 5, 0, 0, 0, -5, 0, 0, 0, 0, 0, 0, -5, -5, 0, 0, 0, 0, 0, 0, -5, -5, 0, 0, 0, 0, 0,
    0, -5, -5, 0, 0, 0, 0, 0, 0, -5, -5, 0, 0, 0, 0, 0, 0, -5, 5, 10, 10, 10, 10, 10, 10, 5, 0, 0,
    0, 0, 0, 0, 0, 0,
];
const QUEEN_PST: [i32; 64] = [
    -20, -10, -10, -5, -5, -10, -10, -20, -10, 0, 0, 0, 0, 0, 0, -10, -10, 0, 5, 5, 5, 5, 0, -10,
    -5, 0, 5, 5, 5, 5, 0, -5, 0, 0, 5, 5, 5, 5, 0, -5, -10, 5, 5, 5, 5, 5, 0, -10, -10, 0, 5, 0, 0,
    0, 0, -10, -20, -10, -10, -5, -5, -10, -10, -20,
];
const KING_PST: [i32; 64] = [
    20, 30, 10, 0, 0, 10, 30, 20, 20, 20, 0, 0, 0, 0, 20, 20, -10, -20, -20, -20, -20, -20, -20,
    -10, -20, -30, -30, -40, -40, -30, -30, -20, -30, -40, -40, -50, -50, -40, -40, -30, -30, -40,
    -40, -50, -50, -40, -40, -30, -30, -40, -40, -50, -50, -40, -40, -30, -30, -40, -40, -50, -50,
    -40, -40, -30,
];

fn piece_value(kind: PieceKind) -> i32 {
    match kind {
        PieceKind::Pawn => 100,
        PieceKind::Knight => 320,
        PieceKind::Bishop => 330,
        PieceKind::Rook => 500,
        PieceKind::Queen => 900,
        PieceKind::King => 0,
    }
}

fn pst_value(kind: PieceKind, index: usize) -> i32 {
    match kind {
        PieceKind::Pawn => PAWN_PST[index],
        PieceKind::Knight => KNIGHT_PST[index],
        PieceKind::Bishop => BISHOP_PST[index],
        PieceKind::Rook => ROOK_PST[index],
        PieceKind::Queen => QUEEN_PST[index],
        PieceKind::King => KING_PST[index],
    }
}

fn piece_score(piece: Piece, board_index: usize) -> i32 {
    let pst_index = match piece.color {
        Color::White => 63 - board_index,
        Color::Black => board_index,
    };
    piece_value(piece.kind) + pst_value(piece.kind, pst_index)
}

/// Static evaluation from the perspective of `side_to_move` (positive is
/// good for that side).
fn evaluate(board: &Board, side_to_move: Color) -> i32 {
    let mut white_score = 0;
    for (index, square) in board.squares.iter().enumerate() {
        if let Some(piece) = square {
            let s = piece_score(*piece, index);
            match piece.color {
                Color::White => white_score += s,
                Color::Black => white_score -= s,
            }
        }
    }
    match side_to_move {
        Color::White => white_score,
        Color::Black => -white_score,
    }
}

fn child_position(position: &Position, mv: &ChessMove) -> Position {
    let mut board = position.board.clone();
    crate::rules::movegen::apply_move_to_board(&mut board, mv, position.turn);
    Position {
        board,
        turn: position.turn.opponent(),
        castling: position.castling,
        en_passant: None,
        halfmove_clock: position.halfmove_clock + 1,
        fullmove_number: position.fullmove_number,
    }
}

fn negamax(position: &Position, depth: u32, mut alpha: i32, beta: i32) -> i32 {
    if depth == 0 {
        return evaluate(&position.board, position.turn);
    }
    let moves = crate::rules::movegen::generate_legal_moves(&position.board, position.turn, &position.castling, position.en_passant);
    if moves.is_empty() {
        return if crate::rules::movegen::is_in_check(&position.board, position.turn) { -100_000 } else { 0 };
    }
    let mut best = i32::MIN + 1;
    for mv in moves {
        let child = child_position(position, &mv);
        let score = -negamax(&child, depth - 1, -beta, -alpha);
        if score > best {
            best = score;
        }
        if best > alpha {
            alpha = best;
        }
        if alpha >= beta {
            break;
        }
    }
    best
}

/// Picks a move via 2-ply negamax, breaking near-ties (within
/// [`SCORE_TOLERANCE_CP`] centipawns of the best) with a uniform random
/// draw so the agent doesn't always play the textbook line.
pub fn best_move(position: &Position) -> Option<ChessMove> {
    let moves = crate::rules::movegen::generate_legal_moves(&position.board, position.turn, &position.castling, position.en_passant);
    if moves.is_empty() {
        return None;
    }
    let scored: Vec<(ChessMove, i32)> = moves
        .into_iter()
        .map(|mv| {
            let child = child_position(position, &mv);
            let score = -negamax(&child, SEARCH_DEPTH - 1, i32::MIN + 1, i32::MAX - 1);
            (mv, score)
        })
        .collect();
    let best_score = scored.iter().map(|(_, s)| *s).max()?;
    let candidates: Vec<ChessMove> = scored.into_iter().filter(|(_, s)| best_score - *s <= SCORE_TOLERANCE_CP).map(|(mv, _)| mv).collect();
    candidates.choose(&mut OsRng).copied()
}

// ---------------------------------------------------------------------------
// HTTP driver
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GameResponse {
    #[allow(dead_code)]
    session_id: Uuid,
    status: GameStatus,
    current_turn: Color,
    board_state: String,
    players: Vec<PlayerResponse>,
    draw_offers: DrawOffersResponse,
}

#[derive(Debug, Deserialize)]
struct PlayerResponse {
    id: Uuid,
    color: Color,
}

#[derive(Debug, Deserialize)]
struct DrawOffersResponse {
    pending_from_color: Option<Color>,
}

fn agent_color(game: &GameResponse, agent_player_id: Uuid) -> Option<Color> {
    game.players.iter().find(|p| p.id == agent_player_id).map(|p| p.color)
}

/// Builds the bearer token the agent authenticates its own HTTP calls
/// with. `api.rs` recognizes this scheme as a trusted internal identity
/// rather than forwarding it to an external token verifier.
pub fn issue_agent_token(agent_user_id: Uuid) -> String {
    format!("agent:{agent_user_id}")
}

async fn fetch_game(client: &reqwest::Client, base_url: &str, session_id: Uuid, token: &str) -> Result<GameResponse, reqwest::Error> {
    client
        .get(format!("{base_url}/games/{session_id}"))
        .bearer_auth(token)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await
}

async fn submit_move(client: &reqwest::Client, base_url: &str, session_id: Uuid, token: &str, mv: MoveJson) -> Result<(), reqwest::Error> {
    client
        .post(format!("{base_url}/games/{session_id}/move"))
        .bearer_auth(token)
        .json(&mv)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

async fn decline_draw(client: &reqwest::Client, base_url: &str, session_id: Uuid, token: &str) -> Result<(), reqwest::Error> {
    client
        .post(format!("{base_url}/games/{session_id}/respond-draw"))
        .bearer_auth(token)
        .json(&serde_json::json!({ "accept": false }))
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

async fn think_delay() {
    let ms: u64 = OsRng.gen_range(500..=1500);
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

async fn drive_game(client: reqwest::Client, base_url: String, session_id: Uuid, agent_player_id: Uuid, agent_user_id: Uuid, wake: Arc<Notify>) {
    let token = issue_agent_token(agent_user_id);
    let mut consecutive_failures = 0u32;

    loop {
        let game = match fetch_game(&client, &base_url, session_id, &token).await {
            Ok(g) => {
                consecutive_failures = 0;
                g
            }
            Err(e) => {
                consecutive_failures += 1;
                log::warn!("agent driver for {session_id}: fetch failed ({consecutive_failures}/{MAX_CONSECUTIVE_FAILURES}): {e}");
                if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    log::error!("agent driver for {session_id}: abandoning after repeated failures");
                    return;
                }
                tokio::time::sleep(Duration::from_millis(backoff_ms(consecutive_failures))).await;
                continue;
            }
        };

        if game.status == GameStatus::Complete {
            return;
        }

        let Some(my_color) = agent_color(&game, agent_player_id) else {
            return;
        };

        if let Some(pending) = game.draw_offers.pending_from_color
            && pending != my_color
            && let Err(e) = decline_draw(&client, &base_url, session_id, &token).await
        {
            log::warn!("agent driver for {session_id}: failed to decline draw: {e}");
        }

        if game.current_turn == my_color {
            if let Ok(position) = Position::from_fen(&game.board_state)
                && let Some(mv) = best_move(&position)
            {
                think_delay().await;
                if let Err(e) = submit_move(&client, &base_url, session_id, &token, mv.to_json()).await {
                    log::warn!("agent driver for {session_id}: move submission failed: {e}");
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(SAFETY_TIMEOUT) => {}
            _ = wake.notified() => {}
        }
    }
}

/// Resident pool of per-game driver tasks. Implements [`AgentLauncher`] so
/// the matchmaker can start a driver the moment a game is matched against
/// the built-in agent, with no dependency in the other direction.
pub struct AgentPool {
    client: reqwest::Client,
    base_url: String,
    agent_user_id: Uuid,
    wakers: DashMap<Uuid, Arc<Notify>>,
}

impl AgentPool {
    pub fn new(base_url: String, agent_user_id: Uuid) -> Self {
        let client = reqwest::Client::builder().timeout(Duration::from_secs(10)).build().expect("reqwest client config is valid");
        Self { client, base_url, agent_user_id, wakers: DashMap::new() }
    }

    /// Signals a resident driver that it may be its turn, short-circuiting
    /// the 5-second safety timeout.
    pub fn notify_turn(&self, session_id: Uuid) {
        if let Some(waker) = self.wakers.get(&session_id) {
            waker.notify_one();
        }
    }

    /// Scans active games for sessions where the built-in agent holds a
    /// slot but has no resident driver, and restarts them. Catches driver
    /// tasks that panicked or were dropped by a process restart.
    pub async fn resume_active_games(&self, store: &crate::store::Store) {
        let games = match store.games() {
            Ok(g) => g,
            Err(e) => {
                log::warn!("agent sweeper: could not open games collection: {e}");
                return;
            }
        };
        let all: Vec<crate::model::Game> = match games.scan_prefix::<crate::model::Game>([]) {
            Ok(g) => g,
            Err(e) => {
                log::warn!("agent sweeper: scan failed: {e}");
                return;
            }
        };
        for game in all {
            if game.status != GameStatus::Active {
                continue;
            }
            for player in &game.players {
                if player.agent_name.as_deref() == Some(crate::matchmaker::BUILTIN_AGENT_NAME) && !self.wakers.contains_key(&game.session_id) {
                    self.launch(game.session_id, player.id);
                }
            }
        }
    }
}

impl AgentLauncher for AgentPool {
    fn launch(&self, session_id: Uuid, agent_player_id: Uuid) {
        if self.wakers.contains_key(&session_id) {
            return;
        }
        let waker = Arc::new(Notify::new());
        self.wakers.insert(session_id, waker.clone());
        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let agent_user_id = self.agent_user_id;
        tokio::spawn(async move {
            drive_game(client, base_url, session_id, agent_player_id, agent_user_id, waker).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_mate_in_one_from_back_rank() {
        // White: Ra8 delivers back-rank mate on a black king trapped by its own pawns.
        let position = Position::from_fen("6k1/5ppp/8/8/8/8/8/R6K w - - 0 1").unwrap();
        let mv = best_move(&position).unwrap();
        let child = child_position(&position, &mv);
        assert!(crate::rules::movegen::is_checkmate(&child.board, child.turn, &child.castling, child.en_passant));
    }

    #[test]
    fn evaluate_favors_material_advantage() {
        let up_a_queen = Position::from_fen("4k3/8/8/8/8/8/8/Q3K3 w - - 0 1").unwrap();
        let even = Position::from_fen("4k3/8/8/8/8/8/8/4K3 w - - 0 1").unwrap();
        assert!(evaluate(&up_a_queen.board, Color::White) > evaluate(&even.board, Color::White));
    }

    #[test]
    fn backoff_grows_then_caps() {
        assert!(backoff_ms(1) < backoff_ms(2));
        assert!(backoff_ms(5) == backoff_ms(6));
    }
}

//! Game lifecycle operations (spec §4.4): create, join, read, move, resign,
//! and the draw-offer state machine. Grounded on the scoped-borrow →
//! persist → notify pattern of `JosunLP-checkai/src/game.rs`'s
//! `GameManager`, generalized from an in-process `HashMap` to the durable
//! `Store` and split so that rating/history bookkeeping lives in
//! [`crate::completion`].

use crate::clock::ClockService;
use crate::completion;
use crate::error::{CodedCoreError, CoreError, ErrorCode};
use crate::model::{now_ms, AuthContext, DrawOffers, Game, GameStatus, MoveRecord, Player, TimeControl, TimeControlMode, User, WinReason};
use crate::rules::movegen::{apply_move_to_board, generate_legal_moves, is_checkmate, is_insufficient_material, is_stalemate, validate_move};
use crate::rules::san::generate_san;
use crate::storage::ArchiveStore;
use crate::store::Store;
use crate::types::{Color, MoveJson, PieceKind, Position, Square};
use std::sync::Arc;
use uuid::Uuid;

/// Side-effect seam for realtime fan-out and agent wake-up. Implemented by
/// `RealtimeHub` in production and by a no-op stub in tests, keeping
/// `GameService` free of a direct dependency on the actor/WebSocket layer.
pub trait NotificationSink: Send + Sync {
    fn broadcast(&self, session_id: Uuid, event: serde_json::Value, exclude_player_id: Option<Uuid>);
    fn notify_agent_turn(&self, session_id: Uuid, player_id: Uuid);
    /// Pushes a `match_found` message directly to a matchmaking client,
    /// identified by the `connectionId` it registered with rather than a
    /// game session (no session-scoped registry entry exists for it yet).
    fn notify_match_found(&self, connection_id: &str, session_id: Uuid, color: crate::types::Color);
    /// Broadcasts a fresh lobby snapshot to every lobby subscriber.
    fn notify_lobby_update(&self);
}

/// Discards every notification. Used where a `NotificationSink` is
/// required but no realtime layer is wired up (unit tests, offline tools).
pub struct NullSink;

impl NotificationSink for NullSink {
    fn broadcast(&self, _session_id: Uuid, _event: serde_json::Value, _exclude_player_id: Option<Uuid>) {}
    fn notify_agent_turn(&self, _session_id: Uuid, _player_id: Uuid) {}
    fn notify_match_found(&self, _connection_id: &str, _session_id: Uuid, _color: crate::types::Color) {}
    fn notify_lobby_update(&self) {}
}

#[derive(Debug, Clone)]
pub struct NewPlayer {
    pub user_id: Option<Uuid>,
    pub display_name: String,
    pub agent_name: Option<String>,
    pub client_software: Option<String>,
    pub engine_name: Option<String>,
    pub elo_rating_at_join: i32,
}

pub struct GameService {
    store: Arc<Store>,
    clock: Arc<ClockService>,
    notifier: Arc<dyn NotificationSink>,
    archive: Option<Arc<ArchiveStore>>,
    position_history_cap: usize,
}

fn game_key(session_id: Uuid) -> [u8; 16] {
    *session_id.as_bytes()
}

fn move_key(session_id: Uuid, move_number: u32) -> Vec<u8> {
    format!("{session_id}:{move_number:06}").into_bytes()
}

fn piece_kind_letter(kind: PieceKind) -> char {
    match kind {
        PieceKind::King => 'K',
        PieceKind::Queen => 'Q',
        PieceKind::Rook => 'R',
        PieceKind::Bishop => 'B',
        PieceKind::Knight => 'N',
        PieceKind::Pawn => 'P',
    }
}

impl GameService {
    pub fn new(
        store: Arc<Store>,
        clock: Arc<ClockService>,
        notifier: Arc<dyn NotificationSink>,
        archive: Option<Arc<ArchiveStore>>,
        position_history_cap: usize,
    ) -> Self {
        Self { store, clock, notifier, archive, position_history_cap }
    }

    fn load_game(&self, session_id: Uuid) -> Result<Game, CodedCoreError> {
        let games = self.store.games()?;
        games
            .get::<Game>(game_key(session_id))?
            .ok_or_else(|| CoreError::not_found(format!("game {session_id} not found")).into())
    }

    fn save_game(&self, game: &Game) -> Result<(), CoreError> {
        self.store.games()?.put(game_key(game.session_id), game)
    }

    fn authorize(&self, auth: &AuthContext, player: &Player) -> Result<(), CodedCoreError> {
        if !auth.authorize_slot(player.user_id) {
            return Err(CoreError::authorization("not authorized to act on this player slot").into());
        }
        Ok(())
    }

    /// Resolves clock expiry against the side to move, computed from
    /// `game.player_times` (the durable ground truth) rather than the
    /// advisory in-memory `ClockService`, so a process restart cannot leave
    /// an already-expired game silently active until its next move/join.
    /// Returns `true` if the game was just transitioned to `complete` by
    /// timeout.
    fn resolve_timeout(&self, game: &mut Game) -> Result<bool, CoreError> {
        if game.status != GameStatus::Active {
            return Ok(false);
        }
        let Some(tc) = game.time_control else { return Ok(false) };
        if tc.mode.is_unlimited() {
            return Ok(false);
        }
        let now = now_ms();
        let elapsed = now.saturating_sub(game.player_times.last_move_at(game.current_turn));
        let remaining = game.player_times.remaining(game.current_turn) as i64 - elapsed as i64;
        if remaining > 0 {
            return Ok(false);
        }
        let winner = game.current_turn.opponent();
        game.status = GameStatus::Complete;
        game.winner = Some(winner);
        game.win_reason = Some(WinReason::Timeout);
        game.player_times.set_remaining(game.current_turn, 0);
        self.clock.stop(game.session_id);
        completion::finalize(&self.store, self.archive.as_deref(), game, now)?;
        Ok(true)
    }

    /// CreateGame: inserts a new `waiting` game with one white player.
    pub fn create_game(&self, auth: &AuthContext, white: NewPlayer, mode: TimeControlMode, is_ranked: bool) -> Result<Game, CodedCoreError> {
        if !auth.authorize_slot(white.user_id) {
            return Err(CoreError::authorization("cannot create a game on behalf of another user").into());
        }
        if let Some(uid) = white.user_id {
            let user: Option<User> = self.store.users()?.get(uid.as_bytes())?;
            if let Some(user) = user {
                crate::users::require_verified_email(&user)?;
            }
        }
        let now = now_ms();
        let tc = TimeControl::new(mode);
        let position = Position::starting();
        let game = Game {
            session_id: Uuid::new_v4(),
            players: vec![Player {
                id: Uuid::new_v4(),
                color: Color::White,
                user_id: white.user_id,
                display_name: white.display_name,
                agent_name: white.agent_name,
                client_software: white.client_software,
                engine_name: white.engine_name,
                elo_rating_at_join: white.elo_rating_at_join,
                joined_at_ms: now,
            }],
            status: GameStatus::Waiting,
            current_turn: Color::White,
            board_state: position.to_fen(),
            move_count: 0,
            position_history: vec![position.position_key()],
            time_control: Some(tc),
            player_times: crate::model::PlayerTimes {
                white_remaining_ms: tc.base_ms,
                black_remaining_ms: tc.base_ms,
                white_last_move_at_ms: now,
                black_last_move_at_ms: now,
            },
            draw_offers: DrawOffers::default(),
            is_ranked,
            winner: None,
            win_reason: None,
            elo_changes: None,
            created_at_ms: now,
            started_at_ms: None,
            updated_at_ms: now,
            completed_at_ms: None,
        };
        self.save_game(&game)?;
        Ok(game)
    }

    /// JoinGame: appends a black player to an open slot, or returns the
    /// existing game unchanged if the requester already holds a slot.
    pub fn join_game(&self, _auth: &AuthContext, session_id: Uuid, requesting_player_id: Option<Uuid>, black: NewPlayer) -> Result<Game, CodedCoreError> {
        let mut game = self.load_game(session_id)?;

        if let Some(pid) = requesting_player_id
            && game.player_by_id(pid).is_some()
        {
            return Ok(game);
        }

        if game.players.len() >= 2 {
            return Err(CoreError::conflict("game already has two players").into());
        }

        if let Some(uid) = black.user_id {
            let user: Option<User> = self.store.users()?.get(uid.as_bytes())?;
            if let Some(user) = user {
                crate::users::require_verified_email(&user)?;
            }
        }

        let now = now_ms();
        game.players.push(Player {
            id: Uuid::new_v4(),
            color: Color::Black,
            user_id: black.user_id,
            display_name: black.display_name,
            agent_name: black.agent_name,
            client_software: black.client_software,
            engine_name: black.engine_name,
            elo_rating_at_join: black.elo_rating_at_join,
            joined_at_ms: now,
        });
        game.status = GameStatus::Active;
        game.started_at_ms = Some(now);
        game.player_times.white_last_move_at_ms = now;
        game.player_times.black_last_move_at_ms = now;
        game.updated_at_ms = now;

        if let Some(tc) = game.time_control
            && !tc.mode.is_unlimited()
        {
            self.clock.start(session_id, tc.base_ms, tc.base_ms, Color::White, tc);
        }

        self.save_game(&game)?;
        self.notifier.broadcast(session_id, serde_json::json!({"type": "player_joined", "serverTime": now}), None);
        Ok(game)
    }

    /// GetGame: reads the game, first resolving any clock-expiry timeout.
    pub fn get_game(&self, session_id: Uuid) -> Result<Game, CodedCoreError> {
        let mut game = self.load_game(session_id)?;
        if self.resolve_timeout(&mut game)? {
            self.save_game(&game)?;
            self.notifier.broadcast(session_id, serde_json::json!({"type": "game_over", "serverTime": now_ms()}), None);
        }
        Ok(game)
    }

    /// Boot-time recovery (spec §2 "resume-on-start"): re-seeds the advisory
    /// `ClockService` for every active timed game from its `player_times`
    /// document, and runs a zero-threshold finalize pass for any that
    /// already ran out during downtime, before the server starts accepting
    /// moves against stale in-memory clock state.
    pub fn rebuild_clocks_on_boot(&self) -> Result<(), CoreError> {
        let games = self.store.games()?.scan_prefix::<Game>([])?;
        for mut game in games {
            if game.status != GameStatus::Active {
                continue;
            }
            let session_id = game.session_id;
            if self.resolve_timeout(&mut game)? {
                self.save_game(&game)?;
                self.notifier.broadcast(session_id, serde_json::json!({"type": "game_over", "serverTime": now_ms()}), None);
                continue;
            }
            let Some(tc) = game.time_control else { continue };
            if tc.mode.is_unlimited() {
                continue;
            }
            let now = now_ms();
            let elapsed = now.saturating_sub(game.player_times.last_move_at(game.current_turn));
            let active_remaining = game.player_times.remaining(game.current_turn).saturating_sub(elapsed);
            let (white_ms, black_ms) = match game.current_turn {
                Color::White => (active_remaining, game.player_times.remaining(Color::Black)),
                Color::Black => (game.player_times.remaining(Color::White), active_remaining),
            };
            self.clock.start(session_id, white_ms, black_ms, game.current_turn, tc);
        }
        Ok(())
    }

    /// True if the current position has recurred at least `threshold` times.
    fn repetition_count(history: &[String]) -> usize {
        match history.last() {
            Some(current) => history.iter().filter(|p| *p == current).count(),
            None => 0,
        }
    }

    pub fn can_claim_threefold(game: &Game) -> bool {
        Self::repetition_count(&game.position_history) >= 3
    }

    pub fn can_claim_fifty_moves(position: &Position) -> bool {
        position.halfmove_clock >= 100
    }

    /// MakeMove: validates, applies, commits via compare-and-swap on
    /// `(sessionId, currentTurn, moveCount)`, runs Completion if the game
    /// just ended, and notifies listeners.
    pub fn make_move(&self, auth: &AuthContext, session_id: Uuid, player_id: Uuid, mv: MoveJson) -> Result<Game, CodedCoreError> {
        let mut game = self.load_game(session_id)?;
        if game.status != GameStatus::Active {
            return Err(CoreError::lifecycle("game is not active").into());
        }
        let player = game.player_by_id(player_id).cloned().ok_or_else(|| CoreError::not_found("no such player in this game"))?;
        self.authorize(auth, &player)?;

        if self.resolve_timeout(&mut game)? {
            self.save_game(&game)?;
            self.notifier.broadcast(session_id, serde_json::json!({"type": "game_over", "serverTime": now_ms()}), None);
            return Err(CoreError::lifecycle("game ended on time before this move was processed").into());
        }

        if player.color != game.current_turn {
            return Err(CoreError::validation("it is not your turn").into());
        }

        let pre_move_count = game.move_count;
        let pre_turn = game.current_turn;

        let position = Position::from_fen(&game.board_state)?;
        let from = Square::from_algebraic(&mv.from).ok_or_else(|| CoreError::validation(format!("invalid square: {}", mv.from)))?;
        let to = Square::from_algebraic(&mv.to).ok_or_else(|| CoreError::validation(format!("invalid square: {}", mv.to)))?;
        let promotion = match &mv.promotion {
            Some(p) => {
                let c = p.chars().next().ok_or_else(|| CoreError::validation("empty promotion letter"))?;
                Some(PieceKind::from_promotion_letter(c).ok_or_else(|| CoreError::validation(format!("invalid promotion piece: {p}")))?)
            }
            None => None,
        };

        let chess_move = validate_move(&position.board, position.turn, &position.castling, position.en_passant, from, to, promotion)?;

        let moving_piece = position.board.get(from).ok_or_else(|| CoreError::fatal("validated move has no piece on from-square"))?;
        let is_pawn_move = moving_piece.kind == PieceKind::Pawn;
        let is_capture = position.board.get(to).is_some() || chess_move.is_en_passant;

        let mut new_board = position.board.clone();
        apply_move_to_board(&mut new_board, &chess_move, pre_turn);

        let mut new_castling = position.castling;
        if moving_piece.kind == PieceKind::King {
            new_castling.for_color_mut(pre_turn).kingside = false;
            new_castling.for_color_mut(pre_turn).queenside = false;
        }
        for sq in [from, to] {
            if sq == Square::new(7, 0) {
                new_castling.white.kingside = false;
            }
            if sq == Square::new(0, 0) {
                new_castling.white.queenside = false;
            }
            if sq == Square::new(7, 7) {
                new_castling.black.kingside = false;
            }
            if sq == Square::new(0, 7) {
                new_castling.black.queenside = false;
            }
        }

        let mut new_en_passant = None;
        if is_pawn_move && (to.rank as i8 - from.rank as i8).abs() == 2 {
            let ep_rank = (from.rank as i8 + pre_turn.pawn_direction()) as u8;
            new_en_passant = Some(Square::new(from.file, ep_rank));
        }

        let new_halfmove_clock = if is_pawn_move || is_capture { 0 } else { position.halfmove_clock + 1 };
        let new_turn = pre_turn.opponent();
        let new_fullmove_number = if new_turn == Color::White { position.fullmove_number + 1 } else { position.fullmove_number };

        let sanitation = generate_san(&position.board, pre_turn, &position.castling, position.en_passant, chess_move, &new_board, &new_castling);

        let new_position = Position {
            board: new_board,
            turn: new_turn,
            castling: new_castling,
            en_passant: new_en_passant,
            halfmove_clock: new_halfmove_clock,
            fullmove_number: new_fullmove_number,
        };

        let in_check = crate::rules::movegen::is_in_check(&new_position.board, new_turn);
        let checkmate = is_checkmate(&new_position.board, new_turn, &new_position.castling, new_position.en_passant);
        let stalemate = is_stalemate(&new_position.board, new_turn, &new_position.castling, new_position.en_passant);

        let now = now_ms();
        let move_record = MoveRecord {
            session_id,
            move_number: pre_move_count + 1,
            color: pre_turn,
            from: from.to_algebraic(),
            to: to.to_algebraic(),
            piece: piece_kind_letter(moving_piece.kind).to_string(),
            notation: sanitation,
            capture: is_capture,
            check: in_check && !checkmate,
            checkmate,
            promotion: mv.promotion.clone(),
            created_at_ms: now,
        };
        self.store.moves()?.put(move_key(session_id, move_record.move_number), &move_record)?;

        let mut history = game.position_history.clone();
        history.push(new_position.position_key());
        if history.len() > self.position_history_cap {
            let overflow = history.len() - self.position_history_cap;
            history.drain(0..overflow);
        }

        self.clock.switch_turn(session_id, new_turn, pre_turn);
        if let Some(remaining) = self.clock.remaining(session_id, pre_turn) {
            game.player_times.set_remaining(pre_turn, remaining.max(0) as u64);
        }
        game.player_times.set_last_move_at(new_turn, now);

        game.board_state = new_position.to_fen();
        game.current_turn = new_turn;
        game.move_count = pre_move_count + 1;
        game.position_history = history;
        game.draw_offers = DrawOffers::default();
        game.updated_at_ms = now;

        if checkmate {
            game.status = GameStatus::Complete;
            game.winner = Some(pre_turn);
            game.win_reason = Some(WinReason::Checkmate);
        } else if stalemate {
            game.status = GameStatus::Complete;
            game.winner = None;
            game.win_reason = Some(WinReason::Stalemate);
        } else if is_insufficient_material(&new_position.board) {
            game.status = GameStatus::Complete;
            game.winner = None;
            game.win_reason = Some(WinReason::DrawByInsufficientMaterial);
        } else if Self::repetition_count(&game.position_history) >= 5 {
            game.status = GameStatus::Complete;
            game.winner = None;
            game.win_reason = Some(WinReason::DrawByFivefoldRepetition);
        } else if new_halfmove_clock >= 150 {
            game.status = GameStatus::Complete;
            game.winner = None;
            game.win_reason = Some(WinReason::DrawBySeventyFiveMoveRule);
        }

        if game.is_complete() {
            self.clock.stop(session_id);
            completion::finalize(&self.store, self.archive.as_deref(), &mut game, now)?;
        }

        let games = self.store.games()?;
        let committed: Option<Game> = games.compare_and_swap(game_key(session_id), |existing: Option<Game>| {
            match existing {
                Some(g) if g.current_turn == pre_turn && g.move_count == pre_move_count => Ok(game.clone()),
                Some(_) => Err(CoreError::conflict("game state changed concurrently, re-read and retry")),
                None => Err(CoreError::not_found("game disappeared during move commit")),
            }
        })?;

        let final_game = committed.ok_or_else(|| CoreError::conflict("concurrent move commit, re-read and retry"))?;

        self.notifier.broadcast(session_id, serde_json::json!({"type": "move", "move": mv, "serverTime": now}), None);
        if final_game.is_complete() {
            self.notifier.broadcast(session_id, serde_json::json!({"type": "game_over", "serverTime": now}), None);
        } else if let Some(next_player) = final_game.player_slot(final_game.current_turn) {
            self.notifier.notify_agent_turn(session_id, next_player.id);
        }

        Ok(final_game)
    }

    /// ResignGame: ends the game immediately with the resigning side's
    /// opponent as winner.
    pub fn resign_game(&self, auth: &AuthContext, session_id: Uuid, player_id: Uuid) -> Result<Game, CodedCoreError> {
        let mut game = self.load_game(session_id)?;
        if game.status != GameStatus::Active {
            return Err(CoreError::lifecycle("game is not active").into());
        }
        let player = game.player_by_id(player_id).cloned().ok_or_else(|| CoreError::not_found("no such player in this game"))?;
        self.authorize(auth, &player)?;

        let now = now_ms();
        let resignation_record = MoveRecord {
            session_id,
            move_number: game.move_count + 1,
            color: player.color,
            from: String::new(),
            to: String::new(),
            piece: String::new(),
            notation: format!("{} resigns", player.color),
            capture: false,
            check: false,
            checkmate: false,
            promotion: None,
            created_at_ms: now,
        };
        self.store.moves()?.put(move_key(session_id, resignation_record.move_number), &resignation_record)?;

        game.status = GameStatus::Complete;
        game.winner = Some(player.color.opponent());
        game.win_reason = Some(WinReason::Resignation);
        game.updated_at_ms = now;
        self.clock.stop(session_id);
        completion::finalize(&self.store, self.archive.as_deref(), &mut game, now)?;
        self.save_game(&game)?;
        self.notifier.broadcast(session_id, serde_json::json!({"type": "resignation", "serverTime": now}), None);
        self.notifier.broadcast(session_id, serde_json::json!({"type": "game_over", "serverTime": now}), None);
        Ok(game)
    }

    /// OfferDraw: `NoPending -> PendingFromX`, subject to the 3-offer cap
    /// and the opponent's `autoDeclineDraws` preference.
    pub fn offer_draw(&self, auth: &AuthContext, session_id: Uuid, player_id: Uuid) -> Result<Game, CodedCoreError> {
        let mut game = self.load_game(session_id)?;
        if game.status != GameStatus::Active {
            return Err(CoreError::lifecycle("game is not active").into());
        }
        let player = game.player_by_id(player_id).cloned().ok_or_else(|| CoreError::not_found("no such player in this game"))?;
        self.authorize(auth, &player)?;

        if game.draw_offers.pending_from_color.is_some() {
            return Err(CoreError::conflict("a draw offer is already pending").with_code(ErrorCode::OfferAlreadyPending));
        }
        if game.draw_offers.offers_used(player.color) >= 3 {
            return Err(CoreError::conflict("draw offer limit reached").with_code(ErrorCode::OfferLimitReached));
        }

        game.draw_offers.increment(player.color);
        let opponent = game.player_slot(player.color.opponent()).cloned();
        let auto_decline = match opponent.as_ref().and_then(|p| p.user_id) {
            Some(uid) => self.store.users()?.get::<User>(uid.as_bytes())?.map(|u| u.preferences.auto_decline_draws).unwrap_or(false),
            None => false,
        };

        let now = now_ms();
        if auto_decline {
            game.draw_offers.pending_from_color = None;
            self.save_game(&game)?;
            self.notifier.broadcast(session_id, serde_json::json!({"type": "draw_declined", "auto": true, "serverTime": now}), None);
        } else {
            game.draw_offers.pending_from_color = Some(player.color);
            self.save_game(&game)?;
            self.notifier.broadcast(session_id, serde_json::json!({"type": "draw_offered", "by": player.color, "serverTime": now}), None);
        }
        Ok(game)
    }

    /// RespondToDraw: accept completes the game as `drawByAgreement`;
    /// decline returns to `NoPending`.
    pub fn respond_to_draw(&self, auth: &AuthContext, session_id: Uuid, player_id: Uuid, accept: bool) -> Result<Game, CodedCoreError> {
        let mut game = self.load_game(session_id)?;
        let player = game.player_by_id(player_id).cloned().ok_or_else(|| CoreError::not_found("no such player in this game"))?;
        self.authorize(auth, &player)?;

        let Some(pending_color) = game.draw_offers.pending_from_color else {
            return Err(CoreError::conflict("no draw offer is pending").with_code(ErrorCode::NoOfferPending));
        };
        if pending_color == player.color {
            return Err(CoreError::authorization("cannot respond to your own draw offer").with_code(ErrorCode::NotYourOffer));
        }

        let now = now_ms();
        if accept {
            game.status = GameStatus::Complete;
            game.winner = None;
            game.win_reason = Some(WinReason::DrawByAgreement);
            game.updated_at_ms = now;
            self.clock.stop(session_id);
            completion::finalize(&self.store, self.archive.as_deref(), &mut game, now)?;
            self.save_game(&game)?;
            self.notifier.broadcast(session_id, serde_json::json!({"type": "game_over", "serverTime": now}), None);
        } else {
            game.draw_offers.pending_from_color = None;
            game.updated_at_ms = now;
            self.save_game(&game)?;
            self.notifier.broadcast(session_id, serde_json::json!({"type": "draw_declined", "auto": false, "serverTime": now}), None);
        }
        Ok(game)
    }

    /// ClaimDraw: threefold repetition or the fifty-move rule, only if the
    /// corresponding condition currently holds.
    pub fn claim_draw(&self, auth: &AuthContext, session_id: Uuid, player_id: Uuid, reason: DrawClaimReason) -> Result<Game, CodedCoreError> {
        let mut game = self.load_game(session_id)?;
        if game.status != GameStatus::Active {
            return Err(CoreError::lifecycle("game is not active").into());
        }
        let player = game.player_by_id(player_id).cloned().ok_or_else(|| CoreError::not_found("no such player in this game"))?;
        self.authorize(auth, &player)?;

        let position = Position::from_fen(&game.board_state)?;
        let (win_reason, ok) = match reason {
            DrawClaimReason::ThreefoldRepetition => (WinReason::DrawByThreefoldRepetition, Self::can_claim_threefold(&game)),
            DrawClaimReason::FiftyMoveRule => (WinReason::DrawByFiftyMoves, Self::can_claim_fifty_moves(&position)),
        };
        if !ok {
            return Err(CoreError::validation("the claimed draw condition does not currently hold").with_code(ErrorCode::ClaimNotAvailable));
        }

        let now = now_ms();
        game.status = GameStatus::Complete;
        game.winner = None;
        game.win_reason = Some(win_reason);
        game.updated_at_ms = now;
        self.clock.stop(session_id);
        completion::finalize(&self.store, self.archive.as_deref(), &mut game, now)?;
        self.save_game(&game)?;
        self.notifier.broadcast(session_id, serde_json::json!({"type": "game_over", "serverTime": now}), None);
        Ok(game)
    }

    /// Invoked by the clock's timeout channel the instant a tracked
    /// session's active side crosses zero, so a timed-out game ends
    /// immediately rather than waiting for the next read or move attempt
    /// to stumble into [`Self::resolve_timeout`].
    pub fn force_timeout(&self, session_id: Uuid, winner: Color) -> Result<(), CoreError> {
        let mut game = match self.load_game(session_id) {
            Ok(g) => g,
            Err(_) => return Ok(()),
        };
        if game.status != GameStatus::Active {
            return Ok(());
        }
        let now = now_ms();
        game.status = GameStatus::Complete;
        game.winner = Some(winner);
        game.win_reason = Some(WinReason::Timeout);
        game.player_times.set_remaining(winner.opponent(), 0);
        game.updated_at_ms = now;
        completion::finalize(&self.store, self.archive.as_deref(), &mut game, now)?;
        self.save_game(&game)?;
        self.notifier.broadcast(session_id, serde_json::json!({"type": "game_over", "serverTime": now}), None);
        Ok(())
    }

    pub fn legal_moves(&self, session_id: Uuid) -> Result<Vec<MoveJson>, CodedCoreError> {
        let game = self.load_game(session_id)?;
        let position = Position::from_fen(&game.board_state)?;
        let moves = generate_legal_moves(&position.board, position.turn, &position.castling, position.en_passant);
        Ok(moves.into_iter().map(|m| m.to_json()).collect())
    }

    pub fn move_history(&self, session_id: Uuid) -> Result<Vec<MoveRecord>, CodedCoreError> {
        let prefix = format!("{session_id}:");
        Ok(self.store.moves()?.scan_prefix::<MoveRecord>(prefix)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawClaimReason {
    ThreefoldRepetition,
    FiftyMoveRule,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> GameService {
        let dir = std::env::temp_dir().join(format!("chesscore_gs_test_{}", Uuid::new_v4()));
        let store = Arc::new(Store::open(dir.to_str().unwrap()).unwrap());
        let (clock, _rx) = ClockService::new();
        GameService::new(store, clock, Arc::new(NullSink), None, 300)
    }

    fn new_player(name: &str) -> NewPlayer {
        NewPlayer { user_id: None, display_name: name.to_string(), agent_name: None, client_software: None, engine_name: None, elo_rating_at_join: 1600 }
    }

    #[test]
    fn create_then_join_activates_game() {
        let svc = service();
        let auth = AuthContext::anonymous();
        let game = svc.create_game(&auth, new_player("white"), TimeControlMode::Blitz, false).unwrap();
        assert_eq!(game.status, GameStatus::Waiting);
        let joined = svc.join_game(&auth, game.session_id, None, new_player("black")).unwrap();
        assert_eq!(joined.status, GameStatus::Active);
        assert_eq!(joined.players.len(), 2);
    }

    #[test]
    fn make_move_rejects_out_of_turn() {
        let svc = service();
        let auth = AuthContext::anonymous();
        let game = svc.create_game(&auth, new_player("white"), TimeControlMode::Unlimited, false).unwrap();
        let joined = svc.join_game(&auth, game.session_id, None, new_player("black")).unwrap();
        let black_id = joined.player_slot(Color::Black).unwrap().id;
        let result = svc.make_move(&auth, joined.session_id, black_id, MoveJson { from: "e7".into(), to: "e5".into(), promotion: None });
        assert!(result.is_err());
    }

    #[test]
    fn make_move_applies_legal_move() {
        let svc = service();
        let auth = AuthContext::anonymous();
        let game = svc.create_game(&auth, new_player("white"), TimeControlMode::Unlimited, false).unwrap();
        let joined = svc.join_game(&auth, game.session_id, None, new_player("black")).unwrap();
        let white_id = joined.player_slot(Color::White).unwrap().id;
        let moved = svc.make_move(&auth, joined.session_id, white_id, MoveJson { from: "e2".into(), to: "e4".into(), promotion: None }).unwrap();
        assert_eq!(moved.move_count, 1);
        assert_eq!(moved.current_turn, Color::Black);
    }

    #[test]
    fn resign_completes_game_with_opponent_as_winner() {
        let svc = service();
        let auth = AuthContext::anonymous();
        let game = svc.create_game(&auth, new_player("white"), TimeControlMode::Unlimited, false).unwrap();
        let joined = svc.join_game(&auth, game.session_id, None, new_player("black")).unwrap();
        let white_id = joined.player_slot(Color::White).unwrap().id;
        let resigned = svc.resign_game(&auth, joined.session_id, white_id).unwrap();
        assert_eq!(resigned.status, GameStatus::Complete);
        assert_eq!(resigned.winner, Some(Color::Black));
        assert_eq!(resigned.win_reason, Some(WinReason::Resignation));
    }

    #[test]
    fn draw_offer_limit_is_enforced() {
        let svc = service();
        let auth = AuthContext::anonymous();
        let game = svc.create_game(&auth, new_player("white"), TimeControlMode::Unlimited, false).unwrap();
        let joined = svc.join_game(&auth, game.session_id, None, new_player("black")).unwrap();
        let white_id = joined.player_slot(Color::White).unwrap().id;
        let black_id = joined.player_slot(Color::Black).unwrap().id;
        for _ in 0..3 {
            svc.offer_draw(&auth, joined.session_id, white_id).unwrap();
            svc.respond_to_draw(&auth, joined.session_id, black_id, false).unwrap();
        }
        let err = svc.offer_draw(&auth, joined.session_id, white_id);
        assert!(err.is_err());
    }
}

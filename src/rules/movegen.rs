//! Move generation, legality, and terminal-condition detection (spec §4.1).
//!
//! Pseudo-legal generation follows piece movement patterns only; legal
//! generation additionally filters out moves that leave the mover's own
//! king in check.

use crate::error::CoreError;
use crate::types::*;

// ---------------------------------------------------------------------------
// Attack detection
// ---------------------------------------------------------------------------

/// Returns `true` if the given square is attacked by any piece of `attacker_color`.
pub fn is_square_attacked(board: &Board, sq: Square, attacker_color: Color) -> bool {
    let knight_offsets: [(i8, i8); 8] =
        [(-2, -1), (-2, 1), (-1, -2), (-1, 2), (1, -2), (1, 2), (2, -1), (2, 1)];
    for &(df, dr) in &knight_offsets {
        if let Some(from) = sq.offset(df, dr)
            && let Some(piece) = board.get(from)
            && piece.color == attacker_color
            && piece.kind == PieceKind::Knight
        {
            return true;
        }
    }

    for df in -1..=1i8 {
        for dr in -1..=1i8 {
            if df == 0 && dr == 0 {
                continue;
            }
            if let Some(from) = sq.offset(df, dr)
                && let Some(piece) = board.get(from)
                && piece.color == attacker_color
                && piece.kind == PieceKind::King
            {
                return true;
            }
        }
    }

    let pawn_dir: i8 = match attacker_color {
        Color::White => 1,
        Color::Black => -1,
    };
    for df in [-1i8, 1] {
        if let Some(from) = sq.offset(df, -pawn_dir)
            && let Some(piece) = board.get(from)
            && piece.color == attacker_color
            && piece.kind == PieceKind::Pawn
        {
            return true;
        }
    }

    for &(df, dr) in &BISHOP_DIRS {
        let mut cur = sq;
        loop {
            match cur.offset(df, dr) {
                None => break,
                Some(next) => {
                    if let Some(piece) = board.get(next) {
                        if piece.color == attacker_color
                            && (piece.kind == PieceKind::Bishop || piece.kind == PieceKind::Queen)
                        {
                            return true;
                        }
                        break;
                    }
                    cur = next;
                }
            }
        }
    }

    for &(df, dr) in &ROOK_DIRS {
        let mut cur = sq;
        loop {
            match cur.offset(df, dr) {
                None => break,
                Some(next) => {
                    if let Some(piece) = board.get(next) {
                        if piece.color == attacker_color
                            && (piece.kind == PieceKind::Rook || piece.kind == PieceKind::Queen)
                        {
                            return true;
                        }
                        break;
                    }
                    cur = next;
                }
            }
        }
    }

    false
}

/// Returns `true` if the king of the given color is currently in check.
pub fn is_in_check(board: &Board, color: Color) -> bool {
    match board.find_king(color) {
        Some(king_sq) => is_square_attacked(board, king_sq, color.opponent()),
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Pseudo-legal move generation
// ---------------------------------------------------------------------------

const ROOK_DIRS: [(i8, i8); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];
const BISHOP_DIRS: [(i8, i8); 4] = [(-1, -1), (-1, 1), (1, -1), (1, 1)];
const QUEEN_DIRS: [(i8, i8); 8] = [(-1, 0), (1, 0), (0, -1), (0, 1), (-1, -1), (-1, 1), (1, -1), (1, 1)];

fn generate_pseudo_legal_moves(
    board: &Board,
    turn: Color,
    castling: &CastlingRights,
    en_passant: Option<Square>,
) -> Vec<ChessMove> {
    let mut moves = Vec::with_capacity(64);
    for rank in 0..8u8 {
        for file in 0..8u8 {
            let from = Square::new(file, rank);
            let piece = match board.get(from) {
                Some(p) if p.color == turn => p,
                _ => continue,
            };
            match piece.kind {
                PieceKind::King => generate_king_moves(board, from, turn, castling, &mut moves),
                PieceKind::Queen => generate_sliding_moves(board, from, turn, &QUEEN_DIRS, &mut moves),
                PieceKind::Rook => generate_sliding_moves(board, from, turn, &ROOK_DIRS, &mut moves),
                PieceKind::Bishop => generate_sliding_moves(board, from, turn, &BISHOP_DIRS, &mut moves),
                PieceKind::Knight => generate_knight_moves(board, from, turn, &mut moves),
                PieceKind::Pawn => generate_pawn_moves(board, from, turn, en_passant, &mut moves),
            }
        }
    }
    moves
}

fn generate_sliding_moves(board: &Board, from: Square, color: Color, directions: &[(i8, i8)], moves: &mut Vec<ChessMove>) {
    for &(df, dr) in directions {
        let mut cur = from;
        loop {
            match cur.offset(df, dr) {
                None => break,
                Some(to) => match board.get(to) {
                    None => {
                        moves.push(ChessMove::simple(from, to));
                        cur = to;
                    }
                    Some(target) => {
                        if target.color != color {
                            moves.push(ChessMove::simple(from, to));
                        }
                        break;
                    }
                },
            }
        }
    }
}

fn generate_knight_moves(board: &Board, from: Square, color: Color, moves: &mut Vec<ChessMove>) {
    let offsets: [(i8, i8); 8] = [(-2, -1), (-2, 1), (-1, -2), (-1, 2), (1, -2), (1, 2), (2, -1), (2, 1)];
    for &(df, dr) in &offsets {
        if let Some(to) = from.offset(df, dr) {
            match board.get(to) {
                None => moves.push(ChessMove::simple(from, to)),
                Some(target) => {
                    if target.color != color {
                        moves.push(ChessMove::simple(from, to));
                    }
                }
            }
        }
    }
}

fn generate_king_moves(board: &Board, from: Square, color: Color, castling: &CastlingRights, moves: &mut Vec<ChessMove>) {
    for df in -1..=1i8 {
        for dr in -1..=1i8 {
            if df == 0 && dr == 0 {
                continue;
            }
            if let Some(to) = from.offset(df, dr) {
                match board.get(to) {
                    None => moves.push(ChessMove::simple(from, to)),
                    Some(target) => {
                        if target.color != color {
                            moves.push(ChessMove::simple(from, to));
                        }
                    }
                }
            }
        }
    }

    let rights = castling.for_color(color);
    let rank = match color {
        Color::White => 0u8,
        Color::Black => 7u8,
    };
    let king_start = Square::new(4, rank);
    if from != king_start {
        return;
    }
    if is_square_attacked(board, from, color.opponent()) {
        return;
    }

    if rights.kingside {
        let f_sq = Square::new(5, rank);
        let g_sq = Square::new(6, rank);
        let rook_sq = Square::new(7, rank);
        let path_clear = board.get(f_sq).is_none() && board.get(g_sq).is_none();
        let rook_present =
            matches!(board.get(rook_sq), Some(Piece { kind: PieceKind::Rook, color: c }) if c == color);
        let safe = !is_square_attacked(board, f_sq, color.opponent()) && !is_square_attacked(board, g_sq, color.opponent());
        if path_clear && rook_present && safe {
            moves.push(ChessMove { from, to: g_sq, promotion: None, is_castling: true, is_en_passant: false });
        }
    }

    if rights.queenside {
        let d_sq = Square::new(3, rank);
        let c_sq = Square::new(2, rank);
        let b_sq = Square::new(1, rank);
        let rook_sq = Square::new(0, rank);
        let path_clear = board.get(d_sq).is_none() && board.get(c_sq).is_none() && board.get(b_sq).is_none();
        let rook_present =
            matches!(board.get(rook_sq), Some(Piece { kind: PieceKind::Rook, color: c }) if c == color);
        let safe = !is_square_attacked(board, d_sq, color.opponent()) && !is_square_attacked(board, c_sq, color.opponent());
        if path_clear && rook_present && safe {
            moves.push(ChessMove { from, to: c_sq, promotion: None, is_castling: true, is_en_passant: false });
        }
    }
}

fn generate_pawn_moves(board: &Board, from: Square, color: Color, en_passant: Option<Square>, moves: &mut Vec<ChessMove>) {
    let dir = color.pawn_direction();
    let start_rank = color.pawn_start_rank();
    let promo_rank = color.promotion_rank();

    let mut add_move = |from: Square, to: Square, is_ep: bool| {
        if to.rank == promo_rank {
            for kind in [PieceKind::Queen, PieceKind::Rook, PieceKind::Bishop, PieceKind::Knight] {
                moves.push(ChessMove { from, to, promotion: Some(kind), is_castling: false, is_en_passant: false });
            }
        } else {
            moves.push(ChessMove { from, to, promotion: None, is_castling: false, is_en_passant: is_ep });
        }
    };

    if let Some(one_ahead) = from.offset(0, dir)
        && board.get(one_ahead).is_none()
    {
        add_move(from, one_ahead, false);
        if from.rank == start_rank
            && let Some(two_ahead) = from.offset(0, dir * 2)
            && board.get(two_ahead).is_none()
        {
            add_move(from, two_ahead, false);
        }
    }

    for df in [-1i8, 1] {
        if let Some(to) = from.offset(df, dir) {
            if let Some(target) = board.get(to)
                && target.color != color
            {
                add_move(from, to, false);
            }
            if let Some(ep_sq) = en_passant
                && to == ep_sq
            {
                add_move(from, to, true);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Legal move generation
// ---------------------------------------------------------------------------

pub fn generate_legal_moves(board: &Board, turn: Color, castling: &CastlingRights, en_passant: Option<Square>) -> Vec<ChessMove> {
    let pseudo_moves = generate_pseudo_legal_moves(board, turn, castling, en_passant);
    let mut legal_moves = Vec::with_capacity(pseudo_moves.len());
    for mv in pseudo_moves {
        let mut test_board = board.clone();
        apply_move_to_board(&mut test_board, &mv, turn);
        if !is_in_check(&test_board, turn) {
            legal_moves.push(mv);
        }
    }
    legal_moves
}

/// Applies a move to a board in place: handles castling rook hop, en-passant
/// capture removal, and promotion. Caller is responsible for everything
/// position-level (en-passant target, clocks, turn, history).
pub fn apply_move_to_board(board: &mut Board, mv: &ChessMove, color: Color) {
    let piece = match board.get(mv.from) {
        Some(p) => p,
        None => return,
    };
    board.set(mv.from, None);

    if mv.is_castling {
        let rank = mv.from.rank;
        if mv.to.file == 6 {
            let rook = board.get(Square::new(7, rank));
            board.set(Square::new(7, rank), None);
            board.set(Square::new(5, rank), rook);
        } else if mv.to.file == 2 {
            let rook = board.get(Square::new(0, rank));
            board.set(Square::new(0, rank), None);
            board.set(Square::new(3, rank), rook);
        }
    }

    if mv.is_en_passant {
        let captured_rank = match color {
            Color::White => mv.to.rank - 1,
            Color::Black => mv.to.rank + 1,
        };
        board.set(Square::new(mv.to.file, captured_rank), None);
    }

    let placed_piece = match mv.promotion {
        Some(promo_kind) => Piece::new(promo_kind, color),
        None => piece,
    };
    board.set(mv.to, Some(placed_piece));
}

// ---------------------------------------------------------------------------
// Insufficient material
// ---------------------------------------------------------------------------

pub fn is_insufficient_material(board: &Board) -> bool {
    let mut white_non_king: Vec<(PieceKind, Square)> = Vec::new();
    let mut black_non_king: Vec<(PieceKind, Square)> = Vec::new();

    for rank in 0..8u8 {
        for file in 0..8u8 {
            let sq = Square::new(file, rank);
            if let Some(piece) = board.get(sq)
                && piece.kind != PieceKind::King
            {
                match piece.color {
                    Color::White => white_non_king.push((piece.kind, sq)),
                    Color::Black => black_non_king.push((piece.kind, sq)),
                }
            }
        }
    }

    let wc = white_non_king.len();
    let bc = black_non_king.len();

    if wc == 0 && bc == 0 {
        return true;
    }
    if wc == 0 && bc == 1 {
        let kind = black_non_king[0].0;
        if kind == PieceKind::Bishop || kind == PieceKind::Knight {
            return true;
        }
    }
    if bc == 0 && wc == 1 {
        let kind = white_non_king[0].0;
        if kind == PieceKind::Bishop || kind == PieceKind::Knight {
            return true;
        }
    }
    if wc == 1 && bc == 1 {
        let (wk, wsq) = white_non_king[0];
        let (bk, bsq) = black_non_king[0];
        if wk == PieceKind::Bishop && bk == PieceKind::Bishop {
            let w_color = (wsq.file + wsq.rank) % 2;
            let b_color = (bsq.file + bsq.rank) % 2;
            if w_color == b_color {
                return true;
            }
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Terminal detection
// ---------------------------------------------------------------------------

pub fn is_checkmate(board: &Board, turn: Color, castling: &CastlingRights, en_passant: Option<Square>) -> bool {
    is_in_check(board, turn) && generate_legal_moves(board, turn, castling, en_passant).is_empty()
}

pub fn is_stalemate(board: &Board, turn: Color, castling: &CastlingRights, en_passant: Option<Square>) -> bool {
    !is_in_check(board, turn) && generate_legal_moves(board, turn, castling, en_passant).is_empty()
}

// ---------------------------------------------------------------------------
// Move validation
// ---------------------------------------------------------------------------

/// Validates and resolves `(from, to, promotion)` against the current
/// position, returning the matching legal `ChessMove` or the specific
/// reason validation failed (spec §4.1).
pub fn validate_move(
    board: &Board,
    turn: Color,
    castling: &CastlingRights,
    en_passant: Option<Square>,
    from: Square,
    to: Square,
    promotion: Option<PieceKind>,
) -> Result<ChessMove, CoreError> {
    let piece = board.get(from).ok_or_else(|| CoreError::validation("no piece on the from-square"))?;

    if piece.color != turn {
        return Err(CoreError::validation("it is not that piece's turn to move"));
    }

    if let Some(target) = board.get(to)
        && target.color == turn
    {
        return Err(CoreError::validation("destination square holds a piece of the same color"));
    }

    let attempting_castle = piece.kind == PieceKind::King && (to.file as i8 - from.file as i8).abs() == 2;

    let pseudo = generate_pseudo_legal_moves(board, turn, castling, en_passant);
    let shape_match = pseudo.iter().any(|m| m.from == from && m.to == to);

    if !shape_match {
        if attempting_castle {
            return Err(CoreError::validation(
                "castling is not available: rights missing, path blocked, king in check, or travel square attacked",
            ));
        }
        return Err(CoreError::validation("movement pattern is illegal for this piece"));
    }

    let legal = generate_legal_moves(board, turn, castling, en_passant);
    let candidates: Vec<_> = legal.into_iter().filter(|m| m.from == from && m.to == to).collect();

    if candidates.is_empty() {
        return Err(CoreError::validation("move leaves the moving side's king in check"));
    }

    match promotion {
        Some(kind) => candidates
            .into_iter()
            .find(|m| m.promotion == Some(kind))
            .ok_or_else(|| CoreError::validation("invalid promotion piece for this move")),
        None => Ok(candidates[0]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starting_position_has_20_moves() {
        let board = Board::starting_position();
        let castling = CastlingRights::default();
        let moves = generate_legal_moves(&board, Color::White, &castling, None);
        assert_eq!(moves.len(), 20);
    }

    #[test]
    fn starting_position_not_in_check() {
        let board = Board::starting_position();
        assert!(!is_in_check(&board, Color::White));
        assert!(!is_in_check(&board, Color::Black));
    }

    #[test]
    fn insufficient_material_k_vs_k() {
        let mut board = Board::default();
        board.set(Square::new(4, 0), Some(Piece::new(PieceKind::King, Color::White)));
        board.set(Square::new(4, 7), Some(Piece::new(PieceKind::King, Color::Black)));
        assert!(is_insufficient_material(&board));
    }

    #[test]
    fn insufficient_material_kb_vs_k() {
        let mut board = Board::default();
        board.set(Square::new(4, 0), Some(Piece::new(PieceKind::King, Color::White)));
        board.set(Square::new(2, 2), Some(Piece::new(PieceKind::Bishop, Color::White)));
        board.set(Square::new(4, 7), Some(Piece::new(PieceKind::King, Color::Black)));
        assert!(is_insufficient_material(&board));
    }

    #[test]
    fn not_insufficient_with_rook() {
        let mut board = Board::default();
        board.set(Square::new(4, 0), Some(Piece::new(PieceKind::King, Color::White)));
        board.set(Square::new(0, 0), Some(Piece::new(PieceKind::Rook, Color::White)));
        board.set(Square::new(4, 7), Some(Piece::new(PieceKind::King, Color::Black)));
        assert!(!is_insufficient_material(&board));
    }

    #[test]
    fn en_passant_move_generated() {
        let mut board = Board::default();
        board.set(Square::new(4, 0), Some(Piece::new(PieceKind::King, Color::White)));
        board.set(Square::new(4, 7), Some(Piece::new(PieceKind::King, Color::Black)));
        board.set(Square::new(4, 4), Some(Piece::new(PieceKind::Pawn, Color::White)));
        board.set(Square::new(3, 4), Some(Piece::new(PieceKind::Pawn, Color::Black)));
        let castling = CastlingRights {
            white: SideCastlingRights { kingside: false, queenside: false },
            black: SideCastlingRights { kingside: false, queenside: false },
        };
        let ep = Some(Square::new(3, 5));
        let moves = generate_legal_moves(&board, Color::White, &castling, ep);
        let ep_moves: Vec<_> = moves.iter().filter(|m| m.is_en_passant).collect();
        assert_eq!(ep_moves.len(), 1);
        assert_eq!(ep_moves[0].from, Square::new(4, 4));
        assert_eq!(ep_moves[0].to, Square::new(3, 5));
    }

    #[test]
    fn castling_available_in_clear_position() {
        let mut board = Board::default();
        board.set(Square::new(4, 0), Some(Piece::new(PieceKind::King, Color::White)));
        board.set(Square::new(7, 0), Some(Piece::new(PieceKind::Rook, Color::White)));
        board.set(Square::new(0, 0), Some(Piece::new(PieceKind::Rook, Color::White)));
        board.set(Square::new(4, 7), Some(Piece::new(PieceKind::King, Color::Black)));
        let castling = CastlingRights {
            white: SideCastlingRights { kingside: true, queenside: true },
            black: SideCastlingRights { kingside: false, queenside: false },
        };
        let moves = generate_legal_moves(&board, Color::White, &castling, None);
        let castling_moves: Vec<_> = moves.iter().filter(|m| m.is_castling).collect();
        assert_eq!(castling_moves.len(), 2);
    }

    #[test]
    fn validate_move_rejects_wrong_turn() {
        let board = Board::starting_position();
        let castling = CastlingRights::default();
        let from = Square::from_algebraic("e7").unwrap();
        let to = Square::from_algebraic("e5").unwrap();
        let err = validate_move(&board, Color::White, &castling, None, from, to, None);
        assert!(err.is_err());
    }

    #[test]
    fn validate_move_accepts_e4() {
        let board = Board::starting_position();
        let castling = CastlingRights::default();
        let from = Square::from_algebraic("e2").unwrap();
        let to = Square::from_algebraic("e4").unwrap();
        assert!(validate_move(&board, Color::White, &castling, None, from, to, None).is_ok());
    }
}

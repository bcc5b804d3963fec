//! Standard Algebraic Notation generation (spec §4.1).
//!
//! SAN is computed against the board *before* the move is applied (for
//! disambiguation and capture detection) plus the board *after* (for
//! check/checkmate suffixes), following the current board's evaluation as
//! the source of truth for promotion suffixes too (SPEC_FULL open question b).

use crate::rules::movegen::{generate_legal_moves, is_checkmate, is_in_check};
use crate::types::{Board, CastlingRights, ChessMove, Color, PieceKind, Square};

/// Generates the SAN string for `mv`, played by `turn` from `board_before`.
/// `board_after` is `board_before` with `mv` already applied, used for the
/// check/checkmate suffix.
pub fn generate_san(
    board_before: &Board,
    turn: Color,
    castling: &CastlingRights,
    en_passant: Option<Square>,
    mv: ChessMove,
    board_after: &Board,
    castling_after: &CastlingRights,
) -> String {
    let piece = board_before.get(mv.from).expect("SAN requires a piece on the from-square");
    let en_passant_after = if piece.kind == PieceKind::Pawn && (mv.to.rank as i8 - mv.from.rank as i8).abs() == 2 {
        Some(Square::new(mv.from.file, (mv.from.rank as i8 + turn.pawn_direction()) as u8))
    } else {
        None
    };

    if mv.is_castling {
        let base = if mv.to.file == 6 { "O-O" } else { "O-O-O" };
        return format!("{base}{}", check_suffix(board_after, turn, castling_after, en_passant_after));
    }

    let is_capture = board_before.get(mv.to).is_some() || mv.is_en_passant;

    let mut san = String::new();
    match piece.kind {
        PieceKind::Pawn => {
            if is_capture {
                san.push((b'a' + mv.from.file) as char);
                san.push('x');
            }
            san.push_str(&mv.to.to_algebraic());
            if let Some(promo) = mv.promotion {
                san.push('=');
                san.push(promo.promotion_letter().to_ascii_uppercase());
            }
        }
        _ => {
            san.push(piece_letter(piece.kind));
            san.push_str(&disambiguation(board_before, turn, castling, en_passant, piece.kind, mv));
            if is_capture {
                san.push('x');
            }
            san.push_str(&mv.to.to_algebraic());
        }
    }

    san.push_str(&check_suffix(board_after, turn, castling_after, en_passant_after));
    san
}

fn piece_letter(kind: PieceKind) -> char {
    match kind {
        PieceKind::King => 'K',
        PieceKind::Queen => 'Q',
        PieceKind::Rook => 'R',
        PieceKind::Bishop => 'B',
        PieceKind::Knight => 'N',
        PieceKind::Pawn => unreachable!("pawns do not use a piece letter"),
    }
}

/// File-only disambiguation first, rank-only if the file alone is still
/// ambiguous, both if even that remains ambiguous.
fn disambiguation(
    board: &Board,
    turn: Color,
    castling: &CastlingRights,
    en_passant: Option<Square>,
    kind: PieceKind,
    mv: ChessMove,
) -> String {
    let others: Vec<Square> = generate_legal_moves(board, turn, castling, en_passant)
        .into_iter()
        .filter(|m| m.to == mv.to && m.from != mv.from)
        .filter(|m| board.get(m.from).is_some_and(|p| p.kind == kind))
        .map(|m| m.from)
        .collect();

    if others.is_empty() {
        return String::new();
    }

    let file_unique = !others.iter().any(|sq| sq.file == mv.from.file);
    if file_unique {
        return ((b'a' + mv.from.file) as char).to_string();
    }

    let rank_unique = !others.iter().any(|sq| sq.rank == mv.from.rank);
    if rank_unique {
        return (mv.from.rank + 1).to_string();
    }

    mv.from.to_algebraic()
}

fn check_suffix(board_after: &Board, mover: Color, castling_after: &CastlingRights, en_passant_after: Option<Square>) -> String {
    let opponent = mover.opponent();
    if !is_in_check(board_after, opponent) {
        return String::new();
    }
    if is_checkmate(board_after, opponent, castling_after, en_passant_after) {
        "#".to_string()
    } else {
        "+".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::movegen::apply_move_to_board;

    fn san_for(fen: &str, from: &str, to: &str, promo: Option<PieceKind>) -> String {
        let pos = crate::types::Position::from_fen(fen).unwrap();
        let from_sq = Square::from_algebraic(from).unwrap();
        let to_sq = Square::from_algebraic(to).unwrap();
        let mv = crate::rules::movegen::validate_move(
            &pos.board,
            pos.turn,
            &pos.castling,
            pos.en_passant,
            from_sq,
            to_sq,
            promo,
        )
        .unwrap();
        let mut after = pos.board.clone();
        apply_move_to_board(&mut after, &mv, pos.turn);
        let castling_after = pos.castling;
        generate_san(&pos.board, pos.turn, &pos.castling, pos.en_passant, mv, &after, &castling_after)
    }

    #[test]
    fn pawn_push_has_no_prefix() {
        assert_eq!(san_for("rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1", "e2", "e4", None), "e4");
    }

    #[test]
    fn pawn_capture_includes_file() {
        let fen = "rnbqkbnr/ppp1pppp/8/3p4/4P3/8/PPPP1PPP/RNBQKBNR w KQkq - 0 2";
        assert_eq!(san_for(fen, "e4", "d5", None), "exd5");
    }

    #[test]
    fn castling_is_o_o() {
        let fen = "r3k2r/8/8/8/8/8/8/R3K2R w KQkq - 0 1";
        assert_eq!(san_for(fen, "e1", "g1", None), "O-O");
    }
}

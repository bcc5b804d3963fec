//! Core chess primitives: piece/board representation, the FEN codec, and the
//! wire-level move type shared by the rules engine, the game service, and the
//! built-in agent.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

// ---------------------------------------------------------------------------
// Piece & Color
// ---------------------------------------------------------------------------

/// Represents the color (side) of a chess piece or player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    White,
    Black,
}

impl Color {
    pub fn opponent(self) -> Color {
        match self {
            Color::White => Color::Black,
            Color::Black => Color::White,
        }
    }

    /// Home rank index (0-based) for pawns of this color.
    pub fn pawn_start_rank(self) -> u8 {
        match self {
            Color::White => 1,
            Color::Black => 6,
        }
    }

    /// Promotion rank index (0-based).
    pub fn promotion_rank(self) -> u8 {
        match self {
            Color::White => 7,
            Color::Black => 0,
        }
    }

    pub fn pawn_direction(self) -> i8 {
        match self {
            Color::White => 1,
            Color::Black => -1,
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Color::White => write!(f, "white"),
            Color::Black => write!(f, "black"),
        }
    }
}

/// A chess piece type, without color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum PieceKind {
    King,
    Queen,
    Rook,
    Bishop,
    Knight,
    Pawn,
}

impl PieceKind {
    /// Parses a promotion-piece letter (`q|r|b|n`, case-insensitive).
    pub fn from_promotion_letter(c: char) -> Option<Self> {
        match c.to_ascii_lowercase() {
            'q' => Some(PieceKind::Queen),
            'r' => Some(PieceKind::Rook),
            'b' => Some(PieceKind::Bishop),
            'n' => Some(PieceKind::Knight),
            _ => None,
        }
    }

    pub fn promotion_letter(self) -> char {
        match self {
            PieceKind::Queen => 'q',
            PieceKind::Rook => 'r',
            PieceKind::Bishop => 'b',
            PieceKind::Knight => 'n',
            _ => '?',
        }
    }
}

/// A chess piece with both kind and color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Piece {
    pub kind: PieceKind,
    pub color: Color,
}

impl Piece {
    pub fn new(kind: PieceKind, color: Color) -> Self {
        Self { kind, color }
    }

    /// Uppercase for White, lowercase for Black.
    pub fn to_fen_char(self) -> char {
        let c = match self.kind {
            PieceKind::King => 'K',
            PieceKind::Queen => 'Q',
            PieceKind::Rook => 'R',
            PieceKind::Bishop => 'B',
            PieceKind::Knight => 'N',
            PieceKind::Pawn => 'P',
        };
        match self.color {
            Color::White => c,
            Color::Black => c.to_ascii_lowercase(),
        }
    }

    pub fn from_fen_char(c: char) -> Option<Self> {
        let color = if c.is_uppercase() { Color::White } else { Color::Black };
        let kind = match c.to_ascii_uppercase() {
            'K' => PieceKind::King,
            'Q' => PieceKind::Queen,
            'R' => PieceKind::Rook,
            'B' => PieceKind::Bishop,
            'N' => PieceKind::Knight,
            'P' => PieceKind::Pawn,
            _ => return None,
        };
        Some(Piece { kind, color })
    }
}

// ---------------------------------------------------------------------------
// Square
// ---------------------------------------------------------------------------

/// A square identified by 0-based file (a=0..h=7) and rank (1=0..8=7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Square {
    pub file: u8,
    pub rank: u8,
}

impl Square {
    pub fn new(file: u8, rank: u8) -> Self {
        debug_assert!(file < 8 && rank < 8, "square out of bounds");
        Self { file, rank }
    }

    pub fn from_algebraic(s: &str) -> Option<Self> {
        let bytes = s.as_bytes();
        if bytes.len() != 2 {
            return None;
        }
        let file = bytes[0].wrapping_sub(b'a');
        let rank = bytes[1].wrapping_sub(b'1');
        if file < 8 && rank < 8 {
            Some(Square { file, rank })
        } else {
            None
        }
    }

    pub fn to_algebraic(self) -> String {
        format!("{}{}", (b'a' + self.file) as char, self.rank + 1)
    }

    pub fn offset(self, df: i8, dr: i8) -> Option<Square> {
        let f = self.file as i8 + df;
        let r = self.rank as i8 + dr;
        if (0..8).contains(&f) && (0..8).contains(&r) {
            Some(Square::new(f as u8, r as u8))
        } else {
            None
        }
    }

    pub fn index(self) -> usize {
        (self.rank as usize) * 8 + self.file as usize
    }
}

impl fmt::Display for Square {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_algebraic())
    }
}

// ---------------------------------------------------------------------------
// Castling rights
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct SideCastlingRights {
    pub kingside: bool,
    pub queenside: bool,
}

impl Default for SideCastlingRights {
    fn default() -> Self {
        Self { kingside: true, queenside: true }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct CastlingRights {
    pub white: SideCastlingRights,
    pub black: SideCastlingRights,
}

impl CastlingRights {
    pub fn for_color(&self, color: Color) -> &SideCastlingRights {
        match color {
            Color::White => &self.white,
            Color::Black => &self.black,
        }
    }

    pub fn for_color_mut(&mut self, color: Color) -> &mut SideCastlingRights {
        match color {
            Color::White => &mut self.white,
            Color::Black => &mut self.black,
        }
    }

    /// Parses a FEN castling field. Unrecognized letters are ignored rather
    /// than rejected, per FEN's historical looseness about this field.
    pub fn from_fen_field(field: &str) -> Self {
        let mut rights = CastlingRights {
            white: SideCastlingRights { kingside: false, queenside: false },
            black: SideCastlingRights { kingside: false, queenside: false },
        };
        if field == "-" {
            return rights;
        }
        for c in field.chars() {
            match c {
                'K' => rights.white.kingside = true,
                'Q' => rights.white.queenside = true,
                'k' => rights.black.kingside = true,
                'q' => rights.black.queenside = true,
                _ => {}
            }
        }
        rights
    }

    pub fn to_fen(&self) -> String {
        let mut s = String::new();
        if self.white.kingside {
            s.push('K');
        }
        if self.white.queenside {
            s.push('Q');
        }
        if self.black.kingside {
            s.push('k');
        }
        if self.black.queenside {
            s.push('q');
        }
        if s.is_empty() { "-".to_string() } else { s }
    }
}

// ---------------------------------------------------------------------------
// Board
// ---------------------------------------------------------------------------

/// Flat 64-element piece placement. Index mapping: `rank * 8 + file`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Board {
    pub squares: [Option<Piece>; 64],
}

impl Default for Board {
    fn default() -> Self {
        Self { squares: [None; 64] }
    }
}

impl Board {
    pub fn get(&self, sq: Square) -> Option<Piece> {
        self.squares[sq.index()]
    }

    pub fn set(&mut self, sq: Square, piece: Option<Piece>) {
        self.squares[sq.index()] = piece;
    }

    pub fn starting_position() -> Self {
        let mut board = Board::default();
        let mut place = |file: u8, rank: u8, kind: PieceKind, color: Color| {
            board.set(Square::new(file, rank), Some(Piece::new(kind, color)));
        };

        place(0, 0, PieceKind::Rook, Color::White);
        place(1, 0, PieceKind::Knight, Color::White);
        place(2, 0, PieceKind::Bishop, Color::White);
        place(3, 0, PieceKind::Queen, Color::White);
        place(4, 0, PieceKind::King, Color::White);
        place(5, 0, PieceKind::Bishop, Color::White);
        place(6, 0, PieceKind::Knight, Color::White);
        place(7, 0, PieceKind::Rook, Color::White);
        for f in 0..8 {
            place(f, 1, PieceKind::Pawn, Color::White);
        }
        for f in 0..8 {
            place(f, 6, PieceKind::Pawn, Color::Black);
        }
        place(0, 7, PieceKind::Rook, Color::Black);
        place(1, 7, PieceKind::Knight, Color::Black);
        place(2, 7, PieceKind::Bishop, Color::Black);
        place(3, 7, PieceKind::Queen, Color::Black);
        place(4, 7, PieceKind::King, Color::Black);
        place(5, 7, PieceKind::Bishop, Color::Black);
        place(6, 7, PieceKind::Knight, Color::Black);
        place(7, 7, PieceKind::Rook, Color::Black);
        board
    }

    pub fn find_king(&self, color: Color) -> Option<Square> {
        for rank in 0..8u8 {
            for file in 0..8u8 {
                let sq = Square::new(file, rank);
                if let Some(piece) = self.get(sq)
                    && piece.kind == PieceKind::King
                    && piece.color == color
                {
                    return Some(sq);
                }
            }
        }
        None
    }

    fn placement_field(&self) -> String {
        let mut fen = String::new();
        for rank in (0..8).rev() {
            let mut empty_count = 0;
            for file in 0..8u8 {
                let sq = Square::new(file, rank);
                match self.get(sq) {
                    Some(piece) => {
                        if empty_count > 0 {
                            fen.push_str(&empty_count.to_string());
                            empty_count = 0;
                        }
                        fen.push(piece.to_fen_char());
                    }
                    None => empty_count += 1,
                }
            }
            if empty_count > 0 {
                fen.push_str(&empty_count.to_string());
            }
            if rank > 0 {
                fen.push('/');
            }
        }
        fen
    }

    fn from_placement_field(field: &str) -> Result<Self, CoreError> {
        let mut board = Board::default();
        let ranks: Vec<&str> = field.split('/').collect();
        if ranks.len() != 8 {
            return Err(CoreError::validation("FEN placement must have 8 ranks"));
        }
        for (i, rank_str) in ranks.iter().enumerate() {
            let rank = 7 - i as u8;
            let mut file = 0u8;
            for c in rank_str.chars() {
                if let Some(d) = c.to_digit(10) {
                    file += d as u8;
                } else {
                    let piece = Piece::from_fen_char(c)
                        .ok_or_else(|| CoreError::validation(format!("invalid FEN piece '{c}'")))?;
                    if file >= 8 {
                        return Err(CoreError::validation("FEN rank overflows 8 files"));
                    }
                    board.set(Square::new(file, rank), Some(piece));
                    file += 1;
                }
            }
            if file != 8 {
                return Err(CoreError::validation("FEN rank does not sum to 8 files"));
            }
        }
        Ok(board)
    }

    /// Position key used for repetition comparison: placement + side to
    /// move + castling rights + en-passant target (halfmove/fullmove
    /// counters excluded).
    pub fn position_key(&self, turn: Color, castling: &CastlingRights, en_passant: Option<Square>) -> String {
        let mut key = self.placement_field();
        key.push(' ');
        key.push(match turn {
            Color::White => 'w',
            Color::Black => 'b',
        });
        key.push(' ');
        key.push_str(&castling.to_fen());
        key.push(' ');
        match en_passant {
            Some(sq) => key.push_str(&sq.to_algebraic()),
            None => key.push('-'),
        }
        key
    }
}

// ---------------------------------------------------------------------------
// FEN codec
// ---------------------------------------------------------------------------

/// A fully parsed position: board + side to move + castling + en-passant
/// target + halfmove clock + fullmove number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub board: Board,
    pub turn: Color,
    pub castling: CastlingRights,
    pub en_passant: Option<Square>,
    pub halfmove_clock: u32,
    pub fullmove_number: u32,
}

impl Position {
    pub fn starting() -> Self {
        Self {
            board: Board::starting_position(),
            turn: Color::White,
            castling: CastlingRights::default(),
            en_passant: None,
            halfmove_clock: 0,
            fullmove_number: 1,
        }
    }

    /// Encodes the position as a complete six-field FEN string.
    pub fn to_fen(&self) -> String {
        format!(
            "{} {} {} {} {} {}",
            self.board.placement_field(),
            match self.turn {
                Color::White => 'w',
                Color::Black => 'b',
            },
            self.castling.to_fen(),
            self.en_passant.map(|s| s.to_algebraic()).unwrap_or_else(|| "-".to_string()),
            self.halfmove_clock,
            self.fullmove_number,
        )
    }

    /// Parses a complete FEN string. Rejects any FEN whose field count is
    /// not exactly six. Halfmove/fullmove must be non-negative integers;
    /// out-of-range castling letters are ignored, not rejected.
    pub fn from_fen(fen: &str) -> Result<Self, CoreError> {
        let fields: Vec<&str> = fen.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(CoreError::validation(format!(
                "FEN must have exactly 6 fields, got {}",
                fields.len()
            )));
        }
        let board = Board::from_placement_field(fields[0])?;
        let turn = match fields[1] {
            "w" => Color::White,
            "b" => Color::Black,
            other => return Err(CoreError::validation(format!("invalid side to move '{other}'"))),
        };
        let castling = CastlingRights::from_fen_field(fields[2]);
        let en_passant = match fields[3] {
            "-" => None,
            sq => Some(
                Square::from_algebraic(sq)
                    .ok_or_else(|| CoreError::validation(format!("invalid en-passant square '{sq}'")))?,
            ),
        };
        let halfmove_clock: u32 = fields[4]
            .parse()
            .map_err(|_| CoreError::validation("halfmove clock must be a non-negative integer"))?;
        let fullmove_number: u32 = fields[5]
            .parse()
            .map_err(|_| CoreError::validation("fullmove number must be a non-negative integer"))?;
        Ok(Position { board, turn, castling, en_passant, halfmove_clock, fullmove_number })
    }

    pub fn position_key(&self) -> String {
        self.board.position_key(self.turn, &self.castling, self.en_passant)
    }
}

// ---------------------------------------------------------------------------
// Move wire type
// ---------------------------------------------------------------------------

/// A move as submitted by a client: two algebraic squares plus an optional
/// promotion letter (`q|r|b|n`, lowercase).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MoveJson {
    pub from: String,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promotion: Option<String>,
}

/// Internal move representation used by the rules engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChessMove {
    pub from: Square,
    pub to: Square,
    pub promotion: Option<PieceKind>,
    pub is_castling: bool,
    pub is_en_passant: bool,
}

impl ChessMove {
    pub fn simple(from: Square, to: Square) -> Self {
        Self { from, to, promotion: None, is_castling: false, is_en_passant: false }
    }

    pub fn to_json(&self) -> MoveJson {
        MoveJson {
            from: self.from.to_algebraic(),
            to: self.to.to_algebraic(),
            promotion: self.promotion.map(|k| k.promotion_letter().to_ascii_uppercase().to_string()),
        }
    }

    pub fn from_json(mj: &MoveJson) -> Result<Self, CoreError> {
        let from = Square::from_algebraic(&mj.from)
            .ok_or_else(|| CoreError::validation(format!("invalid from square: {}", mj.from)))?;
        let to = Square::from_algebraic(&mj.to)
            .ok_or_else(|| CoreError::validation(format!("invalid to square: {}", mj.to)))?;
        let promotion = match &mj.promotion {
            Some(p) => {
                let c = p.chars().next().ok_or_else(|| CoreError::validation("empty promotion"))?;
                Some(
                    PieceKind::from_promotion_letter(c)
                        .ok_or_else(|| CoreError::validation(format!("invalid promotion piece: {p}")))?,
                )
            }
            None => None,
        };
        Ok(ChessMove { from, to, promotion, is_castling: false, is_en_passant: false })
    }
}

impl fmt::Display for ChessMove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.from.to_algebraic(), self.to.to_algebraic())?;
        if let Some(promo) = self.promotion {
            write!(f, "={}", promo.promotion_letter().to_ascii_uppercase())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fen_round_trip_starting_position() {
        let pos = Position::starting();
        let fen = pos.to_fen();
        assert_eq!(fen, "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1");
        let parsed = Position::from_fen(&fen).unwrap();
        assert_eq!(parsed, pos);
    }

    #[test]
    fn fen_rejects_wrong_field_count() {
        let err = Position::from_fen("rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq -");
        assert!(err.is_err());
    }

    #[test]
    fn fen_ignores_out_of_range_castling_letters() {
        let pos = Position::from_fen("8/8/8/8/8/8/8/8 w XYZk - 0 1").unwrap();
        assert!(!pos.castling.white.kingside);
        assert!(pos.castling.black.kingside);
    }

    #[test]
    fn square_algebraic_round_trip() {
        for file in 0..8u8 {
            for rank in 0..8u8 {
                let sq = Square::new(file, rank);
                assert_eq!(Square::from_algebraic(&sq.to_algebraic()), Some(sq));
            }
        }
    }
}

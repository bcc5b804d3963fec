//! Compact binary archive for completed games (spec §4.10 / Persistence).
//!
//! Active games live in the durable key-value store (see [`crate::store`]);
//! this module only handles the completed-game archive, reusing the
//! fixed-header-plus-packed-moves format and zstd compression that keep a
//! full game down to a couple hundred bytes.
//!
//! ```text
//! Offset  Size   Field
//! ──────  ────   ─────
//! 0       4      Magic bytes: "CKAI"
//! 4       1      Format version
//! 5       16     Session UUID
//! 21      8      Start timestamp (unix ms, big-endian u64)
//! 29      8      End timestamp (big-endian u64)
//! 37      1      Winner: 0=none/draw, 1=white, 2=black
//! 38      1      Win reason code
//! 39      2      Move count (big-endian u16)
//! 41..    2×N    Packed moves (2 bytes each, see encode_move)
//! ```

use crate::error::CoreError;
use crate::model::WinReason;
use crate::rules::movegen::{apply_move_to_board, is_checkmate, validate_move};
use crate::types::{MoveJson, PieceKind, Position, Square};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const MAGIC: &[u8; 4] = b"CKAI";
const FORMAT_VERSION: u8 = 1;
const ZSTD_COMPRESSION_LEVEL: i32 = 19;

// ---------------------------------------------------------------------------
// Compact move encoding (2 bytes per move)
// ---------------------------------------------------------------------------

pub fn encode_move(mv: &MoveJson) -> Result<u16, CoreError> {
    let from = Square::from_algebraic(&mv.from).ok_or_else(|| CoreError::validation(format!("invalid from square: {}", mv.from)))?;
    let to = Square::from_algebraic(&mv.to).ok_or_else(|| CoreError::validation(format!("invalid to square: {}", mv.to)))?;
    let from_idx = from.index() as u16;
    let to_idx = to.index() as u16;
    let promo_bits: u16 = match mv.promotion.as_deref() {
        None => 0,
        Some("Q") => 1,
        Some("R") => 2,
        Some("B") => 3,
        Some("N") => 4,
        Some(other) => return Err(CoreError::validation(format!("invalid promotion piece: {other}"))),
    };
    Ok(from_idx | (to_idx << 6) | (promo_bits << 12))
}

pub fn decode_move(encoded: u16) -> MoveJson {
    let from_idx = (encoded & 0x3F) as usize;
    let to_idx = ((encoded >> 6) & 0x3F) as usize;
    let promo = (encoded >> 12) & 0x07;

    let from_sq = Square::new((from_idx % 8) as u8, (from_idx / 8) as u8);
    let to_sq = Square::new((to_idx % 8) as u8, (to_idx / 8) as u8);
    let promotion = match promo {
        1 => Some("Q".to_string()),
        2 => Some("R".to_string()),
        3 => Some("B".to_string()),
        4 => Some("N".to_string()),
        _ => None,
    };
    MoveJson { from: from_sq.to_algebraic(), to: to_sq.to_algebraic(), promotion }
}

fn encode_winner(winner: Option<crate::types::Color>) -> u8 {
    match winner {
        None => 0,
        Some(crate::types::Color::White) => 1,
        Some(crate::types::Color::Black) => 2,
    }
}

fn decode_winner(byte: u8) -> Option<crate::types::Color> {
    match byte {
        1 => Some(crate::types::Color::White),
        2 => Some(crate::types::Color::Black),
        _ => None,
    }
}

fn encode_win_reason(reason: Option<WinReason>) -> u8 {
    match reason {
        None => 0,
        Some(WinReason::Checkmate) => 1,
        Some(WinReason::Stalemate) => 2,
        Some(WinReason::Resignation) => 3,
        Some(WinReason::Timeout) => 4,
        Some(WinReason::DrawByAgreement) => 5,
        Some(WinReason::DrawByThreefoldRepetition) => 6,
        Some(WinReason::DrawByFiftyMoves) => 7,
        Some(WinReason::DrawByFivefoldRepetition) => 8,
        Some(WinReason::DrawBySeventyFiveMoveRule) => 9,
        Some(WinReason::DrawByInsufficientMaterial) => 10,
    }
}

fn decode_win_reason(byte: u8) -> Option<WinReason> {
    match byte {
        1 => Some(WinReason::Checkmate),
        2 => Some(WinReason::Stalemate),
        3 => Some(WinReason::Resignation),
        4 => Some(WinReason::Timeout),
        5 => Some(WinReason::DrawByAgreement),
        6 => Some(WinReason::DrawByThreefoldRepetition),
        7 => Some(WinReason::DrawByFiftyMoves),
        8 => Some(WinReason::DrawByFivefoldRepetition),
        9 => Some(WinReason::DrawBySeventyFiveMoveRule),
        10 => Some(WinReason::DrawByInsufficientMaterial),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// GameArchive
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GameArchive {
    pub session_id: Uuid,
    pub start_ms: u64,
    pub end_ms: u64,
    pub winner: Option<crate::types::Color>,
    pub win_reason: Option<WinReason>,
    pub moves: Vec<MoveJson>,
}

impl GameArchive {
    pub fn move_count(&self) -> usize {
        self.moves.len()
    }

    pub fn raw_size(&self) -> usize {
        41 + self.moves.len() * 2
    }

    pub fn serialize(&self) -> Result<Vec<u8>, CoreError> {
        if self.moves.len() > u16::MAX as usize {
            return Err(CoreError::fatal("game has too many moves to archive"));
        }
        let mut buf = Vec::with_capacity(self.raw_size());
        buf.extend_from_slice(MAGIC);
        buf.push(FORMAT_VERSION);
        buf.extend_from_slice(self.session_id.as_bytes());
        buf.extend_from_slice(&self.start_ms.to_be_bytes());
        buf.extend_from_slice(&self.end_ms.to_be_bytes());
        buf.push(encode_winner(self.winner));
        buf.push(encode_win_reason(self.win_reason));
        buf.extend_from_slice(&(self.moves.len() as u16).to_be_bytes());
        for mv in &self.moves {
            buf.extend_from_slice(&encode_move(mv)?.to_le_bytes());
        }
        Ok(buf)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, CoreError> {
        if data.len() < 41 {
            return Err(CoreError::validation("archive header too short"));
        }
        if &data[0..4] != MAGIC {
            return Err(CoreError::validation("bad archive magic bytes"));
        }
        let version = data[4];
        if version != FORMAT_VERSION {
            return Err(CoreError::validation(format!("unsupported archive version {version}")));
        }
        let session_id = Uuid::from_bytes(data[5..21].try_into().unwrap());
        let start_ms = u64::from_be_bytes(data[21..29].try_into().unwrap());
        let end_ms = u64::from_be_bytes(data[29..37].try_into().unwrap());
        let winner = decode_winner(data[37]);
        let win_reason = decode_win_reason(data[38]);
        let move_count = u16::from_be_bytes(data[39..41].try_into().unwrap()) as usize;
        let expected_len = 41 + move_count * 2;
        if data.len() < expected_len {
            return Err(CoreError::validation("archive move data truncated"));
        }
        let mut moves = Vec::with_capacity(move_count);
        for i in 0..move_count {
            let offset = 41 + i * 2;
            let encoded = u16::from_le_bytes(data[offset..offset + 2].try_into().unwrap());
            moves.push(decode_move(encoded));
        }
        Ok(GameArchive { session_id, start_ms, end_ms, winner, win_reason, moves })
    }

    /// Replays the first `up_to_move` half-moves from the starting
    /// position and returns the resulting FEN.
    pub fn replay(&self, up_to_move: usize) -> Result<Position, CoreError> {
        let mut pos = Position::starting();
        let limit = up_to_move.min(self.moves.len());
        for mv_json in self.moves.iter().take(limit) {
            let from = Square::from_algebraic(&mv_json.from).ok_or_else(|| CoreError::fatal("corrupt archive move"))?;
            let to = Square::from_algebraic(&mv_json.to).ok_or_else(|| CoreError::fatal("corrupt archive move"))?;
            let promotion = mv_json.promotion.as_deref().and_then(|p| PieceKind::from_promotion_letter(p.chars().next()?));
            let chess_move = validate_move(&pos.board, pos.turn, &pos.castling, pos.en_passant, from, to, promotion)?;

            let is_pawn_move = pos.board.get(from).is_some_and(|p| p.kind == PieceKind::Pawn);
            let is_capture = pos.board.get(to).is_some() || chess_move.is_en_passant;

            apply_move_to_board(&mut pos.board, &chess_move, pos.turn);

            if chess_move.is_castling {
                pos.castling.for_color_mut(pos.turn).kingside = false;
                pos.castling.for_color_mut(pos.turn).queenside = false;
            }
            pos.en_passant = None;
            if is_pawn_move && (to.rank as i8 - from.rank as i8).abs() == 2 {
                pos.en_passant = Square::new(from.file, (from.rank + to.rank) / 2).into();
            }
            pos.halfmove_clock = if is_pawn_move || is_capture { 0 } else { pos.halfmove_clock + 1 };
            if pos.turn == crate::types::Color::Black {
                pos.fullmove_number += 1;
            }
            pos.turn = pos.turn.opponent();
        }
        Ok(pos)
    }

    pub fn replay_full(&self) -> Result<Position, CoreError> {
        self.replay(self.moves.len())
    }
}

/// Checks whether the replayed endpoint is checkmate, used only by tests
/// and the replay API to decorate the response.
pub fn replay_is_checkmate(pos: &Position) -> bool {
    is_checkmate(&pos.board, pos.turn, &pos.castling, pos.en_passant)
}

// ---------------------------------------------------------------------------
// On-disk archive manager
// ---------------------------------------------------------------------------

pub struct ArchiveStore {
    archive_dir: PathBuf,
}

impl ArchiveStore {
    pub fn new(base_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let archive_dir = base_dir.as_ref().join("archive");
        fs::create_dir_all(&archive_dir)?;
        Ok(Self { archive_dir })
    }

    fn path(&self, session_id: &Uuid) -> PathBuf {
        self.archive_dir.join(format!("{session_id}.cai.zst"))
    }

    pub fn archive(&self, archive: &GameArchive) -> Result<usize, CoreError> {
        let raw = archive.serialize()?;
        let raw_size = raw.len();
        let compressed = zstd::encode_all(raw.as_slice(), ZSTD_COMPRESSION_LEVEL)
            .map_err(|e| CoreError::transient(format!("zstd compression failed: {e}")))?;
        let compressed_size = compressed.len();
        fs::write(self.path(&archive.session_id), &compressed).map_err(|e| CoreError::transient(format!("archive write failed: {e}")))?;
        log::info!(
            "archived game {}: {} -> {} bytes ({:.1}%), {} moves",
            archive.session_id,
            raw_size,
            compressed_size,
            100.0 * compressed_size as f64 / raw_size.max(1) as f64,
            archive.move_count()
        );
        Ok(compressed_size)
    }

    pub fn load(&self, session_id: &Uuid) -> Result<GameArchive, CoreError> {
        let compressed = fs::read(self.path(session_id)).map_err(|_| CoreError::not_found(format!("archived game {session_id} not found")))?;
        let raw = zstd::decode_all(compressed.as_slice()).map_err(|e| CoreError::fatal(format!("zstd decompression failed: {e}")))?;
        GameArchive::deserialize(&raw)
    }

    pub fn list(&self) -> Result<Vec<Uuid>, CoreError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.archive_dir).map_err(|e| CoreError::transient(e.to_string()))? {
            let entry = entry.map_err(|e| CoreError::transient(e.to_string()))?;
            let filename = entry.file_name().to_string_lossy().to_string();
            if let Some(id_str) = filename.strip_suffix(".cai.zst")
                && let Ok(id) = Uuid::parse_str(id_str)
            {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    pub fn file_size(&self, session_id: &Uuid) -> Option<u64> {
        fs::metadata(self.path(session_id)).ok().map(|m| m.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Color;

    fn sample_archive() -> GameArchive {
        GameArchive {
            session_id: Uuid::new_v4(),
            start_ms: 1_000,
            end_ms: 5_000,
            winner: Some(Color::White),
            win_reason: Some(WinReason::Checkmate),
            moves: vec![
                MoveJson { from: "e2".into(), to: "e4".into(), promotion: None },
                MoveJson { from: "e7".into(), to: "e5".into(), promotion: None },
                MoveJson { from: "f1".into(), to: "c4".into(), promotion: None },
                MoveJson { from: "b8".into(), to: "c6".into(), promotion: None },
                MoveJson { from: "d1".into(), to: "h5".into(), promotion: None },
                MoveJson { from: "g8".into(), to: "f6".into(), promotion: None },
                MoveJson { from: "h5".into(), to: "f7".into(), promotion: None },
            ],
        }
    }

    #[test]
    fn move_encode_decode_roundtrip() {
        let moves = vec![
            MoveJson { from: "e2".into(), to: "e4".into(), promotion: None },
            MoveJson { from: "e7".into(), to: "e8".into(), promotion: Some("Q".into()) },
            MoveJson { from: "a1".into(), to: "h8".into(), promotion: None },
        ];
        for mv in &moves {
            let encoded = encode_move(mv).unwrap();
            let decoded = decode_move(encoded);
            assert_eq!(mv.from, decoded.from);
            assert_eq!(mv.to, decoded.to);
            assert_eq!(mv.promotion, decoded.promotion);
        }
    }

    #[test]
    fn serialize_deserialize_roundtrip() {
        let archive = sample_archive();
        let data = archive.serialize().unwrap();
        let decoded = GameArchive::deserialize(&data).unwrap();
        assert_eq!(decoded.session_id, archive.session_id);
        assert_eq!(decoded.moves.len(), 7);
        assert_eq!(decoded.winner, Some(Color::White));
    }

    #[test]
    fn replay_reaches_scholars_mate_checkmate() {
        let archive = sample_archive();
        let pos = archive.replay_full().unwrap();
        assert!(replay_is_checkmate(&pos));
    }

    #[test]
    fn on_disk_roundtrip() {
        let dir = std::env::temp_dir().join(format!("chesscore_test_{}", Uuid::new_v4()));
        let store = ArchiveStore::new(&dir).unwrap();
        let archive = sample_archive();
        let size = store.archive(&archive).unwrap();
        assert!(size > 0);
        let loaded = store.load(&archive.session_id).unwrap();
        assert_eq!(loaded.moves.len(), 7);
        let _ = fs::remove_dir_all(&dir);
    }
}

//! Elo rating updates with tiered K-factor (spec §4.2).

/// K-factor shrinks as a player accrues ranked games, per spec.
pub fn k_factor(ranked_games_played: u32) -> f64 {
    if ranked_games_played < 30 {
        32.0
    } else if ranked_games_played < 100 {
        24.0
    } else {
        16.0
    }
}

fn expected_score(self_rating: i32, opponent_rating: i32) -> f64 {
    1.0 / (1.0 + 10f64.powf((opponent_rating - self_rating) as f64 / 400.0))
}

/// Score from the perspective of the player being rated: 1 for a win,
/// 0.5 for a draw, 0 for a loss.
pub fn new_rating(rating: i32, opponent_rating: i32, score: f64, ranked_games_played: u32) -> i32 {
    let k = k_factor(ranked_games_played);
    let e = expected_score(rating, opponent_rating);
    let updated = (rating as f64 + k * (score - e)).round() as i32;
    updated.clamp(100, 3000)
}

/// Computes both sides' new ratings for a single game result. `white_score`
/// is 1/0.5/0 from white's perspective; black's score is its complement.
pub fn apply_result(
    white_rating: i32,
    white_games: u32,
    black_rating: i32,
    black_games: u32,
    white_score: f64,
) -> (i32, i32) {
    let black_score = 1.0 - white_score;
    let white_new = new_rating(white_rating, black_rating, white_score, white_games);
    let black_new = new_rating(black_rating, white_rating, black_score, black_games);
    (white_new, black_new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn k_factor_tiers() {
        assert_eq!(k_factor(0), 32.0);
        assert_eq!(k_factor(29), 32.0);
        assert_eq!(k_factor(30), 24.0);
        assert_eq!(k_factor(99), 24.0);
        assert_eq!(k_factor(100), 16.0);
    }

    #[test]
    fn equal_ratings_draw_is_unchanged() {
        let updated = new_rating(1600, 1600, 0.5, 0);
        assert_eq!(updated, 1600);
    }

    #[test]
    fn win_raises_rating_loss_lowers_it() {
        let winner = new_rating(1600, 1600, 1.0, 0);
        let loser = new_rating(1600, 1600, 0.0, 0);
        assert!(winner > 1600);
        assert!(loser < 1600);
    }

    #[test]
    fn rating_is_clamped() {
        assert_eq!(new_rating(95, 2000, 0.0, 0), 100);
        assert_eq!(new_rating(2995, 100, 1.0, 0), 3000);
    }
}

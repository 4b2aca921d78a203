//! Rating formula
//!
//! Pure weighted sum over an aggregate's counters.

use crate::model::PersonRating;

pub const STARS_EARNED_WEIGHT: f64 = 0.30;
pub const REACTIONS_EARNED_WEIGHT: f64 = 0.05;
pub const STARS_GIVEN_WEIGHT: f64 = 0.05;
pub const REACTIONS_GIVEN_WEIGHT: f64 = 0.02;
pub const CREATES_WEIGHT: f64 = 0.03;
pub const UPDATES_WEIGHT: f64 = 0.01;
pub const DELETES_WEIGHT: f64 = 0.02;
pub const MONTHS_ACTIVE_WEIGHT: f64 = 0.05;

/// Score an aggregate
pub fn score(rating: &PersonRating) -> f64 {
    let total = rating.total_activity();
    rating.stars_earned as f64 * STARS_EARNED_WEIGHT
        + rating.reactions_earned as f64 * REACTIONS_EARNED_WEIGHT
        + rating.stars_given as f64 * STARS_GIVEN_WEIGHT
        + rating.reactions_given as f64 * REACTIONS_GIVEN_WEIGHT
        + total.creates as f64 * CREATES_WEIGHT
        + total.updates as f64 * UPDATES_WEIGHT
        + total.deletes as f64 * DELETES_WEIGHT
        + (rating.months_active() as f64 + 1.0) * MONTHS_ACTIVE_WEIGHT
}

/// Recompute and store the score
pub fn apply(rating: &mut PersonRating) {
    rating.rating = score(rating);
}

/// Rating rounded to two decimals, as compared for notifications
pub fn rounded(value: f64) -> i64 {
    (value * 100.0).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChangeKind, Reaction};

    const TS: i64 = 1_715_342_400_000;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_empty_aggregate() {
        let rating = PersonRating::new("acc");
        assert!(approx(score(&rating), 0.05));
    }

    #[test]
    fn test_weights() {
        let mut rating = PersonRating::new("acc");
        rating.record_activity(TS, ChangeKind::Create, Some("task"), None);
        rating.record_activity(TS, ChangeKind::Update, Some("task"), None);
        rating.record_activity(TS, ChangeKind::Delete, Some("task"), None);
        rating.earn_reaction(&Reaction::Star { value: 5 });
        rating.earn_reaction(&Reaction::Emoji);
        rating.give_reaction(&Reaction::Star { value: 2 });
        rating.give_reaction(&Reaction::Emoji);

        let expected = 5.0 * 0.30 + 0.05 + 2.0 * 0.05 + 0.02 + 0.03 + 0.01 + 0.02 + 2.0 * 0.05;
        assert!(approx(score(&rating), expected));
    }

    #[test]
    fn test_monotonic_and_pure() {
        let mut rating = PersonRating::new("acc");
        let mut previous = score(&rating);
        for i in 0..20 {
            match i % 4 {
                0 => rating.record_activity(TS + i * 40 * 86_400_000, ChangeKind::Create, None, None),
                1 => rating.earn_reaction(&Reaction::Star { value: 1 }),
                2 => rating.give_reaction(&Reaction::Emoji),
                _ => rating.record_activity(TS, ChangeKind::Update, None, None),
            }
            let current = score(&rating);
            assert!(current > previous);
            assert!(approx(score(&rating), current));
            previous = current;
        }
    }

    #[test]
    fn test_rounding() {
        assert_eq!(rounded(0.054), 5);
        assert_eq!(rounded(0.056), 6);
        assert_eq!(rounded(1.0), 100);
    }
}

//! Derived cluster fields.
//!
//! | field              | formula                                                       |
//! |--------------------|---------------------------------------------------------------|
//! | `emotionalContext` | Σ wᵢ·vᵢ / Σ wᵢ, wᵢ = 2^(−ageᵢ / half_life), age from newest  |
//! | `phaseContext`     | most frequent phase, ties → phase seen most recently          |
//! | `strengthScore`    | (0.5·size + 0.5·consistency) · (0.3 + 0.7·recency)            |
//!
//! with `size = 1 − e^(−n/3)`, `consistency = 1 / (1 + 4·var(valence))` and
//! `recency = 2^(−days_since_last_addition / half_life)`.

use chrono::{DateTime, Utc};
use reverie_types::PhaseTag;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Fractional days from `from` to `to`, never negative.
pub fn days_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    ((to - from).num_milliseconds().max(0) as f64 / 1000.0) / SECONDS_PER_DAY
}

/// Population variance.  `0.0` for fewer than two values.
pub fn variance(values: &[f32]) -> f32 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n
}

/// Recency-weighted mean valence.  `members` yields `(timestamp, valence)`.
pub fn emotional_context(members: &[(DateTime<Utc>, f32)], half_life_days: f64) -> f32 {
    let Some(newest) = members.iter().map(|(ts, _)| *ts).max() else {
        return 0.0;
    };
    let mut weighted = 0.0f64;
    let mut total = 0.0f64;
    for (ts, valence) in members {
        let w = 0.5f64.powf(days_between(*ts, newest) / half_life_days);
        weighted += w * *valence as f64;
        total += w;
    }
    if total == 0.0 {
        0.0
    } else {
        (weighted / total) as f32
    }
}

/// Most frequent phase.  `phases` must be in timestamp order; on a tie the
/// phase whose latest occurrence is most recent wins.
pub fn phase_context(phases: &[PhaseTag]) -> PhaseTag {
    let mut best: Option<(usize, usize, PhaseTag)> = None;
    for tag in PhaseTag::ALL {
        let count = phases.iter().filter(|p| **p == tag).count();
        if count == 0 {
            continue;
        }
        let last = phases.iter().rposition(|p| *p == tag).unwrap_or(0);
        let candidate = (count, last, tag);
        best = match best {
            Some(b) if (b.0, b.1) >= (count, last) => Some(b),
            _ => Some(candidate),
        };
    }
    best.map(|(_, _, tag)| tag).unwrap_or_default()
}

/// Composite strength in `[0, 1]`.
pub fn strength(member_count: usize, valences: &[f32], days_since_last: f64, half_life_days: f64) -> f32 {
    let size = 1.0 - (-(member_count as f64) / 3.0).exp();
    let consistency = 1.0 / (1.0 + 4.0 * variance(valences) as f64);
    let recency = 0.5f64.powf(days_since_last.max(0.0) / half_life_days);
    let score = (0.5 * size + 0.5 * consistency) * (0.3 + 0.7 * recency);
    score.clamp(0.0, 1.0) as f32
}

/// Least-squares slope of `samples` against their index.  Positive when the
/// series is rising.
pub fn trend(samples: &[f32]) -> f32 {
    if samples.len() < 2 {
        return 0.0;
    }
    let n = samples.len() as f32;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = samples.iter().sum::<f32>() / n;
    let mut num = 0.0f32;
    let mut den = 0.0f32;
    for (i, y) in samples.iter().enumerate() {
        let dx = i as f32 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    if den == 0.0 { 0.0 } else { num / den }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn variance_of_constant_series_is_zero() {
        assert_eq!(variance(&[0.4, 0.4, 0.4]), 0.0);
        assert!((variance(&[-1.0, 1.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn emotional_context_weights_recent_members_more() {
        let now = Utc::now();
        let members = [(now - Duration::days(14), -1.0), (now, 1.0)];
        let ctx = emotional_context(&members, 7.0);
        // Weights 0.25 and 1.0 → (−0.25 + 1.0) / 1.25 = 0.6
        assert!((ctx - 0.6).abs() < 1e-4);
        assert_eq!(emotional_context(&[], 7.0), 0.0);
    }

    #[test]
    fn phase_context_tie_goes_to_most_recent() {
        use PhaseTag::*;
        assert_eq!(phase_context(&[Expansion, Expansion, Renewal]), Expansion);
        assert_eq!(phase_context(&[Renewal, Expansion]), Expansion);
        assert_eq!(phase_context(&[Expansion, Renewal]), Renewal);
        assert_eq!(phase_context(&[]), Unknown);
    }

    #[test]
    fn strength_is_bounded_and_grows_with_size() {
        let small = strength(1, &[0.5], 0.0, 7.0);
        let large = strength(6, &[0.5; 6], 0.0, 7.0);
        assert!(small < large);
        assert!((0.0..=1.0).contains(&large));
    }

    #[test]
    fn strength_decays_with_inactivity() {
        let fresh = strength(5, &[0.3; 5], 0.0, 7.0);
        let stale = strength(5, &[0.3; 5], 28.0, 7.0);
        assert!(stale < fresh);
        // Floor of the recency factor keeps 30 % of the base.
        assert!(stale > 0.3 * fresh - 0.01);
    }

    #[test]
    fn trend_sign_follows_direction() {
        assert!(trend(&[0.2, 0.3, 0.5]) > 0.0);
        assert!(trend(&[0.5, 0.3, 0.2]) < 0.0);
        assert_eq!(trend(&[0.5]), 0.0);
    }
}

//! Confidence-scored predictions derived from detected patterns.
//!
//! ```text
//! confidence = min(cap(type), base × recency × consistency) × 100
//!
//! base        = 1 / (1 + e^(−0.6 · (frequency − 3)))
//! recency     = 2^(−days_since_last_occurrence / 14)
//! consistency = 1 / (1 + 2 · var(occurrence magnitudes))
//! ```
//!
//! | pattern type          | cap  |
//! |-----------------------|------|
//! | `emotional_cycle`     | 0.85 |
//! | `recurring_challenge` | 0.80 |
//! | `growth_accelerator`  | 0.75 |
//! | `breakthrough_moment` | 0.60 |
//!
//! Patterns supported by fewer than `min_support` memories never produce a
//! prediction.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use reverie_types::{Pattern, PatternType, Prediction};
use uuid::Uuid;

use crate::config::InsightConfig;

const RECENCY_HALF_LIFE_DAYS: f32 = 14.0;

/// Upper bound on the unscaled confidence of each pattern type.
pub fn confidence_cap(pattern_type: PatternType) -> f32 {
    match pattern_type {
        PatternType::EmotionalCycle => 0.85,
        PatternType::RecurringChallenge => 0.80,
        PatternType::GrowthAccelerator => 0.75,
        PatternType::BreakthroughMoment => 0.60,
    }
}

fn variance(values: &[f32]) -> f32 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n
}

pub struct PredictionGenerator {
    min_support: usize,
    expiry: Duration,
    half_life_hours: f32,
}

impl PredictionGenerator {
    pub fn new(config: &InsightConfig) -> Self {
        Self {
            min_support: config.min_support.max(1),
            expiry: Duration::days(config.prediction_expiry_days),
            half_life_hours: config.prediction_half_life_hours,
        }
    }

    /// Confidence in `[0, 100]` for `pattern` at `now`, or `None` when the
    /// pattern lacks support.
    pub fn confidence(&self, pattern: &Pattern, now: DateTime<Utc>) -> Option<f32> {
        if pattern.frequency < self.min_support {
            return None;
        }
        let base = 1.0 / (1.0 + (-0.6 * (pattern.frequency as f32 - 3.0)).exp());
        let last = pattern.last_occurrence.unwrap_or(pattern.detected_at);
        let days = (now - last).num_seconds().max(0) as f32 / 86_400.0;
        let recency = 0.5f32.powf(days / RECENCY_HALF_LIFE_DAYS);
        let consistency = 1.0 / (1.0 + 2.0 * variance(&pattern.occurrence_magnitudes));
        let score = (base * recency * consistency).min(confidence_cap(pattern.pattern_type));
        Some((score * 100.0).clamp(0.0, 100.0))
    }

    /// One prediction per sufficiently supported pattern, most confident
    /// first.
    pub fn generate<'a>(
        &self,
        patterns: impl IntoIterator<Item = &'a Pattern>,
        now: DateTime<Utc>,
    ) -> Vec<Prediction> {
        let mut predictions: Vec<Prediction> = patterns
            .into_iter()
            .filter_map(|pattern| {
                let confidence = self.confidence(pattern, now)?;
                Some(Prediction {
                    id: Uuid::new_v4(),
                    user_id: pattern.user_id.clone(),
                    pattern_id: pattern.id,
                    prediction_text: prediction_text(pattern),
                    confidence,
                    generated_at: now,
                    expires_at: now + self.expiry,
                    half_life_hours: self.half_life_hours,
                })
            })
            .collect();
        predictions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        predictions
    }

    /// [`generate`][Self::generate] over a detector result map.
    pub fn generate_all(
        &self,
        patterns: &HashMap<PatternType, Vec<Pattern>>,
        now: DateTime<Utc>,
    ) -> Vec<Prediction> {
        self.generate(patterns.values().flatten(), now)
    }
}

fn prediction_text(pattern: &Pattern) -> String {
    let theme = pattern.themes.first().map(String::as_str);
    match (pattern.pattern_type, theme) {
        (PatternType::EmotionalCycle, Some(t)) => {
            format!("Your mood is likely to swing again this week, especially around {t}")
        }
        (PatternType::EmotionalCycle, None) => {
            "Your mood is likely to swing again within the next week".to_string()
        }
        (PatternType::RecurringChallenge, Some(t)) => {
            format!("{t} is likely to come up again as a difficulty soon")
        }
        (PatternType::RecurringChallenge, None) => {
            "A familiar difficulty is likely to resurface soon".to_string()
        }
        (PatternType::GrowthAccelerator, Some(t)) => {
            format!("Returning to {t} is likely to lift your mood in the following days")
        }
        (PatternType::GrowthAccelerator, None) => {
            "Returning to what has helped before is likely to lift your mood".to_string()
        }
        (PatternType::BreakthroughMoment, Some(t)) => {
            format!("Another breakthrough may follow renewed attention to {t}")
        }
        (PatternType::BreakthroughMoment, None) => {
            "Another breakthrough may follow when you revisit a recurring theme".to_string()
        }
    }
}

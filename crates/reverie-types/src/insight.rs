//! Detected patterns, the predictions derived from them, and the timeframes
//! they are computed over.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ReverieError;

// ─────────────────────────────────────────────────────────────────────────────
// PatternType
// ─────────────────────────────────────────────────────────────────────────────

/// The four recurring structures the detector looks for.
///
/// Both the singular (`emotional_cycle`) and the plural query spelling
/// (`emotional_cycles`) are accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    #[serde(alias = "emotional_cycles")]
    EmotionalCycle,
    #[serde(alias = "breakthrough_moments")]
    BreakthroughMoment,
    #[serde(alias = "recurring_challenges")]
    RecurringChallenge,
    #[serde(alias = "growth_accelerators")]
    GrowthAccelerator,
}

impl PatternType {
    pub const ALL: [PatternType; 4] = [
        PatternType::EmotionalCycle,
        PatternType::BreakthroughMoment,
        PatternType::RecurringChallenge,
        PatternType::GrowthAccelerator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::EmotionalCycle => "emotional_cycle",
            PatternType::BreakthroughMoment => "breakthrough_moment",
            PatternType::RecurringChallenge => "recurring_challenge",
            PatternType::GrowthAccelerator => "growth_accelerator",
        }
    }
}

impl FromStr for PatternType {
    type Err = ReverieError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "emotional_cycle" | "emotional_cycles" => Ok(PatternType::EmotionalCycle),
            "breakthrough_moment" | "breakthrough_moments" => Ok(PatternType::BreakthroughMoment),
            "recurring_challenge" | "recurring_challenges" => Ok(PatternType::RecurringChallenge),
            "growth_accelerator" | "growth_accelerators" => Ok(PatternType::GrowthAccelerator),
            other => Err(ReverieError::validation(format!("unknown pattern type '{other}'"))),
        }
    }
}

impl std::fmt::Display for PatternType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Timeframe
// ─────────────────────────────────────────────────────────────────────────────

/// Query window.  A window reaching past the retained history simply covers
/// all available data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeframe {
    Week,
    Month,
    All,
}

impl Timeframe {
    pub const ALL: [Timeframe; 3] = [Timeframe::Week, Timeframe::Month, Timeframe::All];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::Week => "week",
            Timeframe::Month => "month",
            Timeframe::All => "all",
        }
    }

    pub fn span(&self) -> Option<Duration> {
        match self {
            Timeframe::Week => Some(Duration::days(7)),
            Timeframe::Month => Some(Duration::days(30)),
            Timeframe::All => None,
        }
    }

    /// Inclusive lower bound of the window ending at `now`; `None` means
    /// unbounded.
    pub fn start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.span().map(|span| now - span)
    }
}

impl FromStr for Timeframe {
    type Err = ReverieError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "week" => Ok(Timeframe::Week),
            "month" => Ok(Timeframe::Month),
            "all" | "" => Ok(Timeframe::All),
            other => Err(ReverieError::validation(format!("unknown timeframe '{other}'"))),
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pattern
// ─────────────────────────────────────────────────────────────────────────────

/// A recurring structure found in one user's stream and clusters.
///
/// `frequency` is always the length of `supporting_memory_ids`; the only
/// constructor derives it from the id list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pattern {
    pub id: Uuid,
    pub user_id: String,
    pub pattern_type: PatternType,
    pub description: String,
    pub frequency: usize,
    pub supporting_memory_ids: Vec<String>,
    /// Short observations derived from the evidence, most important first.
    pub insights: Vec<String>,
    pub detected_at: DateTime<Utc>,
    /// Dominant concepts of the clusters involved, if any.
    #[serde(default)]
    pub themes: Vec<String>,
    /// Timestamp of the most recent supporting memory.
    #[serde(default)]
    pub last_occurrence: Option<DateTime<Utc>>,
    /// One magnitude per occurrence (run amplitude, valence lift, …).
    #[serde(default)]
    pub occurrence_magnitudes: Vec<f32>,
}

impl Pattern {
    pub fn new(
        user_id: impl Into<String>,
        pattern_type: PatternType,
        description: impl Into<String>,
        supporting_memory_ids: Vec<String>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            pattern_type,
            description: description.into(),
            frequency: supporting_memory_ids.len(),
            supporting_memory_ids,
            insights: Vec::new(),
            detected_at,
            themes: Vec::new(),
            last_occurrence: None,
            occurrence_magnitudes: Vec::new(),
        }
    }

    pub fn with_insights(mut self, insights: Vec<String>) -> Self {
        self.insights = insights;
        self
    }

    pub fn with_themes(mut self, themes: Vec<String>) -> Self {
        self.themes = themes;
        self
    }

    pub fn with_evidence(mut self, last_occurrence: DateTime<Utc>, magnitudes: Vec<f32>) -> Self {
        self.last_occurrence = Some(last_occurrence);
        self.occurrence_magnitudes = magnitudes;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Prediction
// ─────────────────────────────────────────────────────────────────────────────

/// A forward-looking statement derived from a [`Pattern`].
///
/// `confidence` is the value at `generated_at`.  Use
/// [`Prediction::confidence_at`] for the time-decayed value: it halves every
/// `half_life_hours` and drops to zero at `expires_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub id: Uuid,
    pub user_id: String,
    pub pattern_id: Uuid,
    pub prediction_text: String,
    /// Confidence in `[0, 100]` at generation time.
    pub confidence: f32,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub half_life_hours: f32,
}

impl Prediction {
    /// Confidence at `now`.  Monotone non-increasing in `now`.
    pub fn confidence_at(&self, now: DateTime<Utc>) -> f32 {
        if now >= self.expires_at {
            return 0.0;
        }
        let elapsed_hours = (now - self.generated_at).num_seconds().max(0) as f32 / 3600.0;
        let decay = if self.half_life_hours > 0.0 {
            0.5f32.powf(elapsed_hours / self.half_life_hours)
        } else {
            1.0
        };
        (self.confidence * decay).clamp(0.0, 100.0)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_type_accepts_plural_query_spelling() {
        assert_eq!(
            "emotional_cycles".parse::<PatternType>().unwrap(),
            PatternType::EmotionalCycle
        );
        assert_eq!(
            "Growth_Accelerator".parse::<PatternType>().unwrap(),
            PatternType::GrowthAccelerator
        );
        let back: PatternType = serde_json::from_str("\"recurring_challenges\"").unwrap();
        assert_eq!(back, PatternType::RecurringChallenge);
    }

    #[test]
    fn unknown_pattern_type_is_validation_error() {
        let err = "mood_swings".parse::<PatternType>().unwrap_err();
        assert!(matches!(err, ReverieError::Validation(_)));
    }

    #[test]
    fn timeframe_bounds() {
        let now = Utc::now();
        assert_eq!(Timeframe::Week.start(now), Some(now - Duration::days(7)));
        assert_eq!(Timeframe::Month.start(now), Some(now - Duration::days(30)));
        assert_eq!(Timeframe::All.start(now), None);
        assert!("fortnight".parse::<Timeframe>().is_err());
    }

    #[test]
    fn pattern_frequency_derived_from_support() {
        let p = Pattern::new(
            "u",
            PatternType::EmotionalCycle,
            "swings",
            vec!["a".into(), "b".into(), "c".into()],
            Utc::now(),
        );
        assert_eq!(p.frequency, p.supporting_memory_ids.len());
    }

    fn prediction(confidence: f32) -> Prediction {
        let now = Utc::now();
        Prediction {
            id: Uuid::new_v4(),
            user_id: "u".into(),
            pattern_id: Uuid::new_v4(),
            prediction_text: "more of the same".into(),
            confidence,
            generated_at: now,
            expires_at: now + Duration::days(7),
            half_life_hours: 72.0,
        }
    }

    #[test]
    fn confidence_decays_monotonically() {
        let p = prediction(80.0);
        let mut last = p.confidence_at(p.generated_at);
        assert!((last - 80.0).abs() < 1e-4);
        for hours in [1, 12, 24, 72, 100, 160] {
            let c = p.confidence_at(p.generated_at + Duration::hours(hours));
            assert!(c <= last, "confidence rose at {hours}h");
            last = c;
        }
        let half = p.confidence_at(p.generated_at + Duration::hours(72));
        assert!((half - 40.0).abs() < 0.01);
    }

    #[test]
    fn confidence_is_zero_after_expiry() {
        let p = prediction(90.0);
        assert_eq!(p.confidence_at(p.expires_at), 0.0);
        assert!(p.is_expired(p.expires_at + Duration::seconds(1)));
    }
}

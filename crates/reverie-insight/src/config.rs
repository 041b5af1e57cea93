//! Thresholds of the pattern detectors and the prediction model.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use reverie_types::ReverieError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InsightConfig {
    /// Width of one amplitude band when bucketing same-sign runs.
    pub cycle_band_width: f32,
    /// Number of times a run signature must occur to count as a cycle.
    pub cycle_min_repeats: usize,
    /// Valence lift over the trailing baseline that marks a breakthrough.
    pub breakthrough_lift: f32,
    /// Hours before a breakthrough in which a cluster must have grown.
    pub breakthrough_window_hours: i64,
    /// Days of history averaged into a memory's valence baseline.  Also how
    /// far before the query window memories are loaded.
    pub baseline_days: i64,
    /// Additions within the window needed for a recurring challenge.
    pub challenge_min_additions: usize,
    /// Hours after a cluster member during which follow-up memories count.
    pub growth_lookahead_hours: i64,
    /// Lift of follow-up valence over the cluster baseline.
    pub growth_lift: f32,
    /// Patterns with less support never produce a prediction.
    pub min_support: usize,
    pub prediction_expiry_days: i64,
    pub prediction_half_life_hours: f32,
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            cycle_band_width: 0.25,
            cycle_min_repeats: 2,
            breakthrough_lift: 0.4,
            breakthrough_window_hours: 24,
            baseline_days: 7,
            challenge_min_additions: 3,
            growth_lookahead_hours: 72,
            growth_lift: 0.1,
            min_support: 2,
            prediction_expiry_days: 7,
            prediction_half_life_hours: 72.0,
        }
    }
}

impl InsightConfig {
    pub fn validate(&self) -> Result<(), ReverieError> {
        if self.cycle_band_width <= 0.0 {
            return Err(ReverieError::validation("cycle_band_width must be positive"));
        }
        if self.baseline_days <= 0 || self.prediction_expiry_days <= 0 {
            return Err(ReverieError::validation(
                "baseline_days and prediction_expiry_days must be positive",
            ));
        }
        if self.prediction_half_life_hours <= 0.0 {
            return Err(ReverieError::validation("prediction_half_life_hours must be positive"));
        }
        Ok(())
    }

    pub fn lookback(&self) -> Duration {
        Duration::days(self.baseline_days)
    }
}

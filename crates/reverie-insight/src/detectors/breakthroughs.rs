//! Breakthrough moments: a sharp valence lift right after a cluster grew.
//!
//! A memory qualifies when its valence exceeds the mean of the preceding
//! `baseline_days` by more than `breakthrough_lift`, and some cluster gained a
//! non-founding member (other than the memory itself) within the preceding
//! `breakthrough_window_hours`.  All qualifying memories of the window form a
//! single pattern.

use chrono::Duration;
use reverie_types::{Pattern, PatternType};

use crate::config::InsightConfig;
use crate::detector::{DetectionInput, Detector, mean};

pub struct BreakthroughDetector {
    lift: f32,
    window: Duration,
    baseline: Duration,
}

impl BreakthroughDetector {
    pub fn new(config: &InsightConfig) -> Self {
        Self {
            lift: config.breakthrough_lift,
            window: Duration::hours(config.breakthrough_window_hours),
            baseline: config.lookback(),
        }
    }
}

impl Detector for BreakthroughDetector {
    fn name(&self) -> &str {
        "breakthrough_moments"
    }

    fn pattern_type(&self) -> PatternType {
        PatternType::BreakthroughMoment
    }

    fn detect(&self, input: &DetectionInput<'_>) -> Vec<Pattern> {
        let mut ids = Vec::new();
        let mut lifts = Vec::new();
        let mut triggers: Vec<String> = Vec::new();
        let mut last = None;

        for memory in input.window_memories() {
            let from = memory.timestamp - self.baseline;
            let prior: Vec<f32> = input
                .memories
                .iter()
                .filter(|m| m.timestamp >= from && m.timestamp < memory.timestamp)
                .map(|m| m.emotional_valence)
                .collect();
            let Some(baseline) = mean(&prior) else {
                continue;
            };
            let lift = memory.emotional_valence - baseline;
            if lift <= self.lift {
                continue;
            }

            let since = memory.timestamp - self.window;
            let trigger = input.clusters.iter().find_map(|snapshot| {
                snapshot
                    .cluster
                    .member_ids
                    .iter()
                    .zip(&snapshot.member_timestamps)
                    .skip(1)
                    .find(|(id, ts)| **id != memory.id && **ts >= since && **ts <= memory.timestamp)
                    .map(|(id, _)| id.clone())
            });
            let Some(trigger) = trigger else {
                continue;
            };

            ids.push(memory.id.clone());
            lifts.push(lift);
            triggers.push(trigger);
            last = Some(memory.timestamp);
        }

        let Some(last) = last else {
            return Vec::new();
        };
        let themes = input.themes_for(&triggers, 3);
        let peak = lifts.iter().copied().fold(f32::MIN, f32::max);
        let mut insights = vec![
            format!(
                "{} moment{} of sharply improved mood",
                ids.len(),
                if ids.len() == 1 { "" } else { "s" }
            ),
            format!("Largest lift over the weekly baseline: +{peak:.2}"),
        ];
        if !themes.is_empty() {
            insights.push(format!("Followed renewed attention to: {}", themes.join(", ")));
        }
        vec![
            Pattern::new(
                input.user_id,
                PatternType::BreakthroughMoment,
                "Mood lifts sharply shortly after revisiting a recurring theme",
                ids,
                input.now,
            )
            .with_insights(insights)
            .with_themes(themes)
            .with_evidence(last, lifts),
        ]
    }
}

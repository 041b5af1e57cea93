//! Emotional cycles: repeated same-sign valence runs of similar shape.
//!
//! The window's memories are cut into maximal runs of the same valence sign
//! (neutral memories are skipped and do not break a run).  Each run gets a
//! signature `(length, amplitude band)` where the amplitude is the largest
//! |valence| in the run.  A signature seen at least `cycle_min_repeats` times
//! is a cycle; its supporting memories are every memory of every matching
//! run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use reverie_types::{Memory, Pattern, PatternType};

use crate::config::InsightConfig;
use crate::detector::{DetectionInput, Detector, describe_span};

const NEUTRAL_EPSILON: f32 = 1e-6;

#[derive(Debug)]
struct Run<'a> {
    positive: bool,
    members: Vec<&'a Memory>,
    amplitude: f32,
}

impl Run<'_> {
    fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.members.last().map(|m| m.timestamp)
    }
}

pub struct EmotionalCycleDetector {
    band_width: f32,
    min_repeats: usize,
}

impl EmotionalCycleDetector {
    pub fn new(config: &InsightConfig) -> Self {
        Self {
            band_width: config.cycle_band_width,
            min_repeats: config.cycle_min_repeats.max(2),
        }
    }

    fn band(&self, amplitude: f32) -> u32 {
        let top = (1.0 / self.band_width).ceil() as u32;
        ((amplitude / self.band_width).floor() as u32).min(top.saturating_sub(1))
    }

    fn runs<'a>(&self, memories: impl Iterator<Item = &'a Memory>) -> Vec<Run<'a>> {
        let mut runs: Vec<Run<'a>> = Vec::new();
        for memory in memories {
            let v = memory.emotional_valence;
            if v.abs() < NEUTRAL_EPSILON {
                continue;
            }
            let positive = v > 0.0;
            match runs.last_mut() {
                Some(run) if run.positive == positive => {
                    run.members.push(memory);
                    run.amplitude = run.amplitude.max(v.abs());
                }
                _ => runs.push(Run {
                    positive,
                    members: vec![memory],
                    amplitude: v.abs(),
                }),
            }
        }
        runs
    }
}

impl Detector for EmotionalCycleDetector {
    fn name(&self) -> &str {
        "emotional_cycles"
    }

    fn pattern_type(&self) -> PatternType {
        PatternType::EmotionalCycle
    }

    fn detect(&self, input: &DetectionInput<'_>) -> Vec<Pattern> {
        let runs = self.runs(input.window_memories());

        let mut by_signature: BTreeMap<(usize, u32), Vec<&Run<'_>>> = BTreeMap::new();
        for run in &runs {
            by_signature
                .entry((run.members.len(), self.band(run.amplitude)))
                .or_default()
                .push(run);
        }

        let mut patterns = Vec::new();
        for ((length, band), group) in by_signature {
            if group.len() < self.min_repeats {
                continue;
            }
            let mut members: Vec<&Memory> = group.iter().flat_map(|r| r.members.iter().copied()).collect();
            members.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
            let ids: Vec<String> = members.iter().map(|m| m.id.clone()).collect();
            let (Some(first), Some(last)) = (members.first(), members.last()) else {
                continue;
            };
            let last_occurrence = group
                .iter()
                .filter_map(|r| r.last_timestamp())
                .max()
                .unwrap_or(last.timestamp);

            let positive = group.iter().filter(|r| r.positive).count();
            let negative = group.len() - positive;
            let low = band as f32 * self.band_width;
            let high = (low + self.band_width).min(1.0);
            let entries = if length == 1 { "entry" } else { "entries" };

            let mut insights = vec![
                format!(
                    "{} swings of {length} {entries} each, intensity {low:.2}–{high:.2}",
                    group.len()
                ),
                format!("{positive} positive and {negative} negative stretches"),
                format!("Observed over {}", describe_span(first.timestamp, last.timestamp)),
            ];
            let themes = input.themes_for(&ids, 3);
            if !themes.is_empty() {
                insights.push(format!("Often around: {}", themes.join(", ")));
            }

            let magnitudes: Vec<f32> = group.iter().map(|r| r.amplitude).collect();
            patterns.push(
                Pattern::new(
                    input.user_id,
                    PatternType::EmotionalCycle,
                    format!("Mood alternates in {length}-{entries} stretches of similar intensity"),
                    ids,
                    input.now,
                )
                .with_insights(insights)
                .with_themes(themes)
                .with_evidence(last_occurrence, magnitudes),
            );
        }
        patterns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{daily_memories, input};

    fn detector() -> EmotionalCycleDetector {
        EmotionalCycleDetector::new(&InsightConfig::default())
    }

    #[test]
    fn alternating_valence_over_ten_days_is_a_cycle() {
        let valences: Vec<f32> = (0..10).map(|i| if i % 2 == 0 { 0.8 } else { -0.8 }).collect();
        let memories = daily_memories(&valences);
        let patterns = detector().detect(&input(&memories, &[], None));
        assert_eq!(patterns.len(), 1);
        let p = &patterns[0];
        assert!(p.frequency >= 4);
        assert_eq!(p.frequency, p.supporting_memory_ids.len());
        assert_eq!(p.occurrence_magnitudes.len(), 10);
        assert_eq!(p.last_occurrence, Some(memories[9].timestamp));
    }

    #[test]
    fn neutral_entries_do_not_break_runs() {
        let memories = daily_memories(&[0.6, 0.0, 0.6, -0.6, -0.6, 0.6, 0.6]);
        let patterns = detector().detect(&input(&memories, &[], None));
        // Three runs of length 2 in the 0.50–0.75 band.
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].frequency, 6);
        assert!(!patterns[0].supporting_memory_ids.contains(&memories[1].id));
    }

    #[test]
    fn unrepeated_signatures_are_not_cycles() {
        let memories = daily_memories(&[0.9, -0.1, -0.1, -0.1]);
        assert!(detector().detect(&input(&memories, &[], None)).is_empty());
    }

    #[test]
    fn steady_mood_is_not_a_cycle() {
        let memories = daily_memories(&[0.5; 8]);
        assert!(detector().detect(&input(&memories, &[], None)).is_empty());
    }

    #[test]
    fn support_is_limited_to_window() {
        let valences: Vec<f32> = (0..10).map(|i| if i % 2 == 0 { 0.8 } else { -0.8 }).collect();
        let memories = daily_memories(&valences);
        let start = memories[6].timestamp;
        let patterns = detector().detect(&input(&memories, &[], Some(start)));
        assert_eq!(patterns[0].frequency, 4);
        let inp = input(&memories, &[], Some(start));
        assert!(patterns[0]
            .supporting_memory_ids
            .iter()
            .all(|id| inp.memory(id).is_some_and(|m| inp.in_window(m.timestamp))));
    }

    #[test]
    fn amplitude_one_falls_in_top_band() {
        let d = detector();
        assert_eq!(d.band(1.0), 3);
        assert_eq!(d.band(0.8), 3);
        assert_eq!(d.band(0.3), 1);
    }
}

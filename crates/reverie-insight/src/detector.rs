//! [`PatternDetector`] – registry of pattern [`Detector`]s.
//!
//! A sweep builds one [`DetectionInput`] per user and timeframe and hands it
//! to every registered detector.  Detectors are pure: they read the memory
//! slice and the cluster snapshots and return the patterns they found.  The
//! registry collects the results into a `PatternType → Vec<Pattern>` map,
//! leaving out types that found nothing.
//!
//! Four detectors are registered by [`PatternDetector::with_defaults`]:
//!
//! | detector                   | pattern type          |
//! |----------------------------|-----------------------|
//! | [`EmotionalCycleDetector`]   | `emotional_cycle`     |
//! | [`BreakthroughDetector`]     | `breakthrough_moment` |
//! | [`RecurringChallengeDetector`] | `recurring_challenge` |
//! | [`GrowthAcceleratorDetector`]  | `growth_accelerator`  |
//!
//! [`EmotionalCycleDetector`]: crate::detectors::EmotionalCycleDetector
//! [`BreakthroughDetector`]: crate::detectors::BreakthroughDetector
//! [`RecurringChallengeDetector`]: crate::detectors::RecurringChallengeDetector
//! [`GrowthAcceleratorDetector`]: crate::detectors::GrowthAcceleratorDetector

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use reverie_types::{ClusterSnapshot, Memory, Pattern, PatternType};
use tracing::debug;

use crate::config::InsightConfig;
use crate::detectors::{
    BreakthroughDetector, EmotionalCycleDetector, GrowthAcceleratorDetector,
    RecurringChallengeDetector,
};

// ─────────────────────────────────────────────────────────────────────────────
// DetectionInput
// ─────────────────────────────────────────────────────────────────────────────

/// Everything a detector may look at for one user.
#[derive(Debug, Clone, Copy)]
pub struct DetectionInput<'a> {
    pub user_id: &'a str,
    /// Memories of the window plus the look-back period, timestamp order.
    pub memories: &'a [Memory],
    pub clusters: &'a [ClusterSnapshot],
    /// Inclusive lower bound of the window; `None` means all history.
    pub window_start: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

impl<'a> DetectionInput<'a> {
    pub fn in_window(&self, ts: DateTime<Utc>) -> bool {
        self.window_start.is_none_or(|start| ts >= start)
    }

    /// Memories inside the window, timestamp order.
    pub fn window_memories(&self) -> impl Iterator<Item = &'a Memory> + '_ {
        self.memories.iter().filter(|m| self.in_window(m.timestamp))
    }

    pub fn memory(&self, id: &str) -> Option<&'a Memory> {
        self.memories.iter().find(|m| m.id == id)
    }

    /// Concepts of the clusters holding any of `memory_ids`, first seen
    /// first, at most `limit`.
    pub fn themes_for(&self, memory_ids: &[String], limit: usize) -> Vec<String> {
        let mut themes: Vec<String> = Vec::new();
        for snapshot in self.clusters {
            let holds_any = snapshot
                .cluster
                .member_ids
                .iter()
                .any(|id| memory_ids.contains(id));
            if !holds_any {
                continue;
            }
            for concept in &snapshot.cluster.concepts {
                if themes.len() >= limit {
                    return themes;
                }
                if !themes.contains(concept) {
                    themes.push(concept.clone());
                }
            }
        }
        themes
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Detector trait
// ─────────────────────────────────────────────────────────────────────────────

/// A single kind of recurring structure.
///
/// Implement this trait to add a detector and register it on a
/// [`PatternDetector`] via [`PatternDetector::add_detector`].
pub trait Detector: Send + Sync {
    fn name(&self) -> &str;

    fn pattern_type(&self) -> PatternType;

    /// Every pattern of this type in `input`.  Supporting memory ids must lie
    /// inside the window.
    fn detect(&self, input: &DetectionInput<'_>) -> Vec<Pattern>;
}

// ─────────────────────────────────────────────────────────────────────────────
// PatternDetector
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct PatternDetector {
    detectors: Vec<Box<dyn Detector>>,
}

impl PatternDetector {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the four built-in detectors.
    pub fn with_defaults(config: &InsightConfig) -> Self {
        let mut detector = Self::new();
        detector.add_detector(Box::new(EmotionalCycleDetector::new(config)));
        detector.add_detector(Box::new(BreakthroughDetector::new(config)));
        detector.add_detector(Box::new(RecurringChallengeDetector::new(config)));
        detector.add_detector(Box::new(GrowthAcceleratorDetector::new(config)));
        detector
    }

    /// Register a detector.  Detectors run in insertion order.
    pub fn add_detector(&mut self, detector: Box<dyn Detector>) {
        self.detectors.push(detector);
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }

    /// Run every detector.  Types with no findings are absent from the map.
    pub fn detect(&self, input: &DetectionInput<'_>) -> HashMap<PatternType, Vec<Pattern>> {
        let mut found: HashMap<PatternType, Vec<Pattern>> = HashMap::new();
        for detector in &self.detectors {
            let patterns = detector.detect(input);
            debug!(
                user_id = input.user_id,
                detector = detector.name(),
                patterns = patterns.len(),
                "detector finished"
            );
            if !patterns.is_empty() {
                found.entry(detector.pattern_type()).or_default().extend(patterns);
            }
        }
        for patterns in found.values_mut() {
            patterns.sort_by(|a, b| {
                b.frequency
                    .cmp(&a.frequency)
                    .then_with(|| b.last_occurrence.cmp(&a.last_occurrence))
            });
        }
        found
    }

    /// Run only the detectors of `pattern_type`.
    pub fn detect_type(&self, input: &DetectionInput<'_>, pattern_type: PatternType) -> Vec<Pattern> {
        self.detectors
            .iter()
            .filter(|d| d.pattern_type() == pattern_type)
            .flat_map(|d| d.detect(input))
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared helpers
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn mean(values: &[f32]) -> Option<f32> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f32>() / values.len() as f32)
    }
}

/// `"3.5 days"` style span between the first and last timestamp.
pub(crate) fn describe_span(first: DateTime<Utc>, last: DateTime<Utc>) -> String {
    let hours = (last - first).num_hours();
    if hours < 48 {
        format!("{hours} hours")
    } else {
        format!("{:.1} days", hours as f32 / 24.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{daily_memories, input};
    use chrono::Duration;

    struct Fixed(PatternType, usize);

    impl Detector for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        fn pattern_type(&self) -> PatternType {
            self.0
        }

        fn detect(&self, input: &DetectionInput<'_>) -> Vec<Pattern> {
            let ids: Vec<String> = input
                .window_memories()
                .take(self.1)
                .map(|m| m.id.clone())
                .collect();
            if ids.is_empty() {
                return Vec::new();
            }
            vec![Pattern::new(input.user_id, self.0, "fixed", ids, input.now)]
        }
    }

    #[test]
    fn empty_registry_finds_nothing() {
        let memories = daily_memories(&[0.5, -0.5]);
        let detector = PatternDetector::new();
        assert!(detector.is_empty());
        assert!(detector.detect(&input(&memories, &[], None)).is_empty());
    }

    #[test]
    fn custom_detectors_are_grouped_by_type_and_sorted() {
        let memories = daily_memories(&[0.5, -0.5, 0.5, -0.5]);
        let mut detector = PatternDetector::new();
        detector.add_detector(Box::new(Fixed(PatternType::GrowthAccelerator, 1)));
        detector.add_detector(Box::new(Fixed(PatternType::GrowthAccelerator, 3)));
        let found = detector.detect(&input(&memories, &[], None));
        let growth = &found[&PatternType::GrowthAccelerator];
        assert_eq!(growth.len(), 2);
        assert_eq!(growth[0].frequency, 3);
        assert!(!found.contains_key(&PatternType::EmotionalCycle));
    }

    #[test]
    fn empty_stream_yields_empty_mapping() {
        let detector = PatternDetector::with_defaults(&InsightConfig::default());
        assert_eq!(detector.len(), 4);
        assert!(detector.detect(&input(&[], &[], None)).is_empty());
    }

    #[test]
    fn window_excludes_older_memories() {
        let memories = daily_memories(&[0.5, -0.5, 0.5, -0.5]);
        let start = memories[2].timestamp;
        let inp = input(&memories, &[], Some(start));
        assert_eq!(inp.window_memories().count(), 2);
        assert!(!inp.in_window(start - Duration::seconds(1)));
    }

    #[test]
    fn span_formatting() {
        let t0 = Utc::now();
        assert_eq!(describe_span(t0, t0 + Duration::hours(5)), "5 hours");
        assert_eq!(describe_span(t0, t0 + Duration::hours(84)), "3.5 days");
    }
}

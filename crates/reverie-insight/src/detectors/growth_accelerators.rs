//! Growth accelerators: strengthening clusters whose members are followed by
//! better-than-usual mood.
//!
//! For every member of a cluster with a positive strength trend, the
//! non-member memories of the next `growth_lookahead_hours` are collected.
//! If their mean valence beats the cluster's own emotional context by more
//! than `growth_lift`, the cluster is an accelerator and the members that had
//! follow-ups are its support.

use std::collections::HashSet;

use chrono::Duration;
use reverie_types::{ClusterState, Pattern, PatternType};

use crate::config::InsightConfig;
use crate::detector::{DetectionInput, Detector, mean};

pub struct GrowthAcceleratorDetector {
    lookahead: Duration,
    lift: f32,
}

impl GrowthAcceleratorDetector {
    pub fn new(config: &InsightConfig) -> Self {
        Self {
            lookahead: Duration::hours(config.growth_lookahead_hours),
            lift: config.growth_lift,
        }
    }
}

impl Detector for GrowthAcceleratorDetector {
    fn name(&self) -> &str {
        "growth_accelerators"
    }

    fn pattern_type(&self) -> PatternType {
        PatternType::GrowthAccelerator
    }

    fn detect(&self, input: &DetectionInput<'_>) -> Vec<Pattern> {
        let mut patterns = Vec::new();
        for snapshot in input.clusters {
            let cluster = &snapshot.cluster;
            if cluster.state == ClusterState::Pruned || snapshot.strength_trend <= 0.0 {
                continue;
            }
            let member_set: HashSet<&str> = cluster.member_ids.iter().map(String::as_str).collect();
            let baseline = cluster.emotional_context;

            let mut ids = Vec::new();
            let mut lifts = Vec::new();
            let mut followers: HashSet<&str> = HashSet::new();
            let mut follower_valences = Vec::new();
            let mut last = None;

            for (member_id, ts) in snapshot.members_since(input.window_start) {
                let until = ts + self.lookahead;
                let after: Vec<f32> = input
                    .memories
                    .iter()
                    .filter(|m| m.timestamp > ts && m.timestamp <= until)
                    .filter(|m| !member_set.contains(m.id.as_str()))
                    .inspect(|m| {
                        if followers.insert(m.id.as_str()) {
                            follower_valences.push(m.emotional_valence);
                        }
                    })
                    .map(|m| m.emotional_valence)
                    .collect();
                let Some(avg) = mean(&after) else {
                    continue;
                };
                ids.push(member_id.to_string());
                lifts.push(avg - baseline);
                last = Some(ts);
            }

            let (Some(last), Some(overall)) = (last, mean(&follower_valences)) else {
                continue;
            };
            if overall - baseline <= self.lift {
                continue;
            }

            let topic = cluster.concepts.iter().take(3).cloned().collect::<Vec<_>>();
            let mut insights = vec![
                format!(
                    "Mood in the {} h after these entries averages {overall:.2} versus {baseline:.2}",
                    self.lookahead.num_hours()
                ),
                format!("{} follow-up entries observed", followers.len()),
                format!("Theme is gaining strength (trend +{:.3})", snapshot.strength_trend),
            ];
            if !topic.is_empty() {
                insights.insert(0, format!("Engaging with {} tends to lift you", topic.join(", ")));
            }
            patterns.push(
                Pattern::new(
                    input.user_id,
                    PatternType::GrowthAccelerator,
                    "Time spent on this theme is followed by better days",
                    ids,
                    input.now,
                )
                .with_insights(insights)
                .with_themes(topic)
                .with_evidence(last, lifts),
            );
        }
        patterns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{clustered, daily_memories, input};

    fn detector() -> GrowthAcceleratorDetector {
        GrowthAcceleratorDetector::new(&InsightConfig::default())
    }

    #[test]
    fn members_followed_by_better_mood_accelerate_growth() {
        // Even days: practice entries (clustered, neutral-ish).
        // Odd days: unrelated entries with high valence.
        let mut memories = daily_memories(&[0.1, 0.7, 0.0, 0.8, 0.1, 0.7]);
        for m in memories.iter_mut().skip(1).step_by(2) {
            m.embedding = vec![0.0, 1.0];
            m.content = "unrelated evening".to_string();
        }
        let practice: Vec<_> = memories.iter().step_by(2).cloned().collect();
        let clusters = clustered(&practice);
        assert!(clusters[0].strength_trend > 0.0);

        let patterns = detector().detect(&input(&memories, &clusters, None));
        assert_eq!(patterns.len(), 1);
        let p = &patterns[0];
        assert_eq!(p.frequency, 3);
        assert!(p.occurrence_magnitudes.iter().all(|l| *l > 0.1));
        assert!(p.themes.contains(&"deadline".to_string()));
    }

    #[test]
    fn no_followers_means_no_accelerator() {
        let memories = daily_memories(&[0.1, 0.2, 0.1]);
        let clusters = clustered(&memories);
        assert!(detector().detect(&input(&memories, &clusters, None)).is_empty());
    }

    #[test]
    fn followers_without_lift_are_ignored() {
        let mut memories = daily_memories(&[0.5, 0.5, 0.5, 0.5]);
        for m in memories.iter_mut().skip(1).step_by(2) {
            m.embedding = vec![0.0, 1.0];
        }
        let practice: Vec<_> = memories.iter().step_by(2).cloned().collect();
        let clusters = clustered(&practice);
        assert!(detector().detect(&input(&memories, &clusters, None)).is_empty());
    }
}

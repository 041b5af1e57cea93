//! Recurring challenges: negatively-toned clusters that keep growing.

use reverie_types::{ClusterState, Pattern, PatternType};

use crate::config::InsightConfig;
use crate::detector::{DetectionInput, Detector, describe_span};

pub struct RecurringChallengeDetector {
    min_additions: usize,
}

impl RecurringChallengeDetector {
    pub fn new(config: &InsightConfig) -> Self {
        Self {
            min_additions: config.challenge_min_additions.max(1),
        }
    }
}

impl Detector for RecurringChallengeDetector {
    fn name(&self) -> &str {
        "recurring_challenges"
    }

    fn pattern_type(&self) -> PatternType {
        PatternType::RecurringChallenge
    }

    fn detect(&self, input: &DetectionInput<'_>) -> Vec<Pattern> {
        let mut patterns = Vec::new();
        for snapshot in input.clusters {
            let cluster = &snapshot.cluster;
            if cluster.state == ClusterState::Pruned || cluster.emotional_context >= 0.0 {
                continue;
            }
            let additions = snapshot.additions_since(input.window_start).count();
            if additions < self.min_additions {
                continue;
            }

            let members: Vec<(&str, _)> = snapshot.members_since(input.window_start).collect();
            let (Some((_, first)), Some((_, last))) = (members.first(), members.last()) else {
                continue;
            };
            let ids: Vec<String> = members.iter().map(|(id, _)| id.to_string()).collect();
            let magnitudes: Vec<f32> = ids
                .iter()
                .filter_map(|id| input.memory(id))
                .map(|m| m.emotional_valence.abs())
                .collect();

            let topic = if cluster.concepts.is_empty() {
                "the same difficulty".to_string()
            } else {
                cluster.concepts.iter().take(3).cloned().collect::<Vec<_>>().join(", ")
            };
            let insights = vec![
                format!("Came up {additions} more times within {}", describe_span(*first, *last)),
                format!("Average tone {:.2} ({})", cluster.emotional_context, cluster.phase_context),
                format!("Cluster strength {:.2}", cluster.strength_score),
            ];
            patterns.push(
                Pattern::new(
                    input.user_id,
                    PatternType::RecurringChallenge,
                    format!("Keeps returning to a difficult theme: {topic}"),
                    ids,
                    input.now,
                )
                .with_insights(insights)
                .with_themes(cluster.concepts.iter().take(3).cloned().collect())
                .with_evidence(*last, magnitudes),
            );
        }
        patterns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{clustered, daily_memories, input};

    fn detector() -> RecurringChallengeDetector {
        RecurringChallengeDetector::new(&InsightConfig::default())
    }

    #[test]
    fn growing_negative_cluster_is_a_challenge() {
        let memories = daily_memories(&[-0.6, -0.5, -0.7, -0.4, -0.6]);
        let clusters = clustered(&memories);
        let patterns = detector().detect(&input(&memories, &clusters, None));
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].frequency, 5);
        assert_eq!(patterns[0].occurrence_magnitudes.len(), 5);
        assert!(patterns[0].description.contains("deadline"));
    }

    #[test]
    fn positive_cluster_is_not_a_challenge() {
        let memories = daily_memories(&[0.6, 0.5, 0.7, 0.4]);
        let clusters = clustered(&memories);
        assert!(detector().detect(&input(&memories, &clusters, None)).is_empty());
    }

    #[test]
    fn additions_are_counted_inside_the_window_only() {
        let memories = daily_memories(&[-0.6, -0.5, -0.7, -0.4, -0.6]);
        let clusters = clustered(&memories);
        let start = memories[3].timestamp;
        assert!(detector().detect(&input(&memories, &clusters, Some(start))).is_empty());

        let start = memories[2].timestamp;
        let patterns = detector().detect(&input(&memories, &clusters, Some(start)));
        assert_eq!(patterns[0].frequency, 3);
    }
}

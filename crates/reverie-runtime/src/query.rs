//! Shapes sweep results and cluster views into the two read contracts.
//!
//! Pure functions: the [`Engine`][crate::engine::Engine] gathers the inputs
//! (latest sweep, supporting memories, published view) and these build the
//! response.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use reverie_types::{
    ClusterQueryResponse, ClusterState, ClusterSummary, Memory, Pattern, PatternQueryResponse,
    PatternSummary, PatternType, PredictionSummary,
};
use uuid::Uuid;

use crate::actor::ClusterView;
use crate::sweep::SweepResult;

/// Supporting memory ids of `patterns`, first occurrence first.
pub fn supporting_ids(patterns: &[Pattern]) -> Vec<String> {
    let mut seen = HashSet::new();
    patterns
        .iter()
        .flat_map(|p| p.supporting_memory_ids.iter())
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

/// Pattern query response for `pattern_type` from a committed sweep.
///
/// `memories` are the supporting records fetched from the store; only the
/// most recent `max_memories` are returned, in timestamp order.  Predictions
/// are decayed to `now`; expired ones are dropped.
pub fn pattern_response(
    result: &SweepResult,
    pattern_type: PatternType,
    mut memories: Vec<Memory>,
    now: DateTime<Utc>,
    max_memories: usize,
) -> PatternQueryResponse {
    let patterns = result.patterns_of(pattern_type);
    let pattern_ids: HashSet<Uuid> = patterns.iter().map(|p| p.id).collect();

    memories.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    if memories.len() > max_memories {
        memories.drain(..memories.len() - max_memories);
    }

    let mut predictions: Vec<PredictionSummary> = result
        .predictions
        .iter()
        .filter(|p| pattern_ids.contains(&p.pattern_id) && !p.is_expired(now))
        .map(|p| PredictionSummary {
            prediction: p.prediction_text.clone(),
            confidence: p.confidence_at(now),
        })
        .filter(|p| p.confidence > 0.0)
        .collect();
    predictions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    PatternQueryResponse {
        memories,
        patterns: patterns
            .iter()
            .map(|p| PatternSummary {
                pattern: p.description.clone(),
                frequency: p.frequency,
                insights: p.insights.clone(),
            })
            .collect(),
        predictions,
    }
}

/// Cluster query response from a published view.  Pruned clusters are left
/// out; the rest are listed strongest first.
pub fn cluster_response(view: &ClusterView, emergent_strength: f32) -> ClusterQueryResponse {
    let mut live: Vec<_> = view
        .clusters
        .iter()
        .filter(|s| s.cluster.state != ClusterState::Pruned)
        .collect();
    live.sort_by(|a, b| b.cluster.strength_score.total_cmp(&a.cluster.strength_score));

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for snapshot in &live {
        let c = &snapshot.cluster;
        if c.state != ClusterState::Active || c.strength_score <= emergent_strength {
            continue;
        }
        for (concept, count) in &snapshot.concept_counts {
            *counts.entry(concept.as_str()).or_insert(0) += count;
        }
    }
    let mut themes: Vec<(&str, usize)> = counts.into_iter().collect();
    themes.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    ClusterQueryResponse {
        clusters: live
            .iter()
            .map(|s| ClusterSummary {
                id: s.cluster.id.to_string(),
                concepts: s.cluster.concepts.clone(),
                emotional_context: s.cluster.emotional_context,
                phase_context: s.cluster.phase_context.as_str().to_string(),
                strength_score: s.cluster.strength_score,
            })
            .collect(),
        emergent_themes: themes.into_iter().map(|(t, _)| t.to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use reverie_types::{ClusterSnapshot, MemoryCluster, PhaseTag, Prediction, SourceType, Timeframe};

    use crate::sweep::Ticket;

    fn memory(id: &str, ts: DateTime<Utc>) -> Memory {
        Memory {
            id: id.to_string(),
            user_id: "u1".to_string(),
            content: "Quiet morning".to_string(),
            embedding: vec![1.0, 0.0],
            timestamp: ts,
            emotional_valence: 0.2,
            dominant_emotion: "calm".to_string(),
            phase_tag: PhaseTag::Renewal,
            source_type: SourceType::Journal,
            supersedes: None,
        }
    }

    fn snapshot(state: ClusterState, strength: f32, counts: &[(&str, usize)]) -> ClusterSnapshot {
        ClusterSnapshot {
            cluster: MemoryCluster {
                id: Uuid::new_v4(),
                user_id: "u1".to_string(),
                centroid: vec![1.0, 0.0],
                member_ids: vec!["m1".to_string()],
                concepts: counts.iter().map(|(c, _)| c.to_string()).collect(),
                emotional_context: 0.3,
                phase_context: PhaseTag::Expansion,
                strength_score: strength,
                state,
                last_updated: Utc::now(),
            },
            member_timestamps: vec![Utc::now()],
            concept_counts: counts.iter().map(|(c, n)| (c.to_string(), *n)).collect(),
            strength_trend: 0.0,
        }
    }

    fn view(clusters: Vec<ClusterSnapshot>) -> ClusterView {
        ClusterView {
            user_id: "u1".to_string(),
            version: 1,
            clusters,
            published_at: Utc::now(),
        }
    }

    fn sweep(patterns: Vec<Pattern>, predictions: Vec<Prediction>, now: DateTime<Utc>) -> SweepResult {
        let mut map = HashMap::new();
        map.insert(PatternType::RecurringChallenge, patterns);
        SweepResult {
            user_id: "u1".to_string(),
            timeframe: Timeframe::All,
            ticket: Ticket { requested_at: now, seq: 0 },
            window_start: None,
            patterns: map,
            predictions,
            completed_at: now,
        }
    }

    fn prediction(pattern_id: Uuid, confidence: f32, generated_at: DateTime<Utc>) -> Prediction {
        Prediction {
            id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            pattern_id,
            prediction_text: format!("p{confidence}"),
            confidence,
            generated_at,
            expires_at: generated_at + Duration::days(7),
            half_life_hours: 72.0,
        }
    }

    #[test]
    fn supporting_ids_are_deduplicated() {
        let now = Utc::now();
        let a = Pattern::new("u1", PatternType::EmotionalCycle, "a", vec!["m1".into(), "m2".into()], now);
        let b = Pattern::new("u1", PatternType::EmotionalCycle, "b", vec!["m2".into(), "m3".into()], now);
        assert_eq!(supporting_ids(&[a, b]), vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn memories_are_capped_to_the_most_recent() {
        let now = Utc::now();
        let result = sweep(Vec::new(), Vec::new(), now);
        let memories = (0..5).map(|i| memory(&format!("m{i}"), now - Duration::days(5 - i))).collect();
        let resp = pattern_response(&result, PatternType::RecurringChallenge, memories, now, 3);
        let ids: Vec<&str> = resp.memories.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn predictions_follow_their_patterns_and_decay() {
        let now = Utc::now();
        let pattern = Pattern::new("u1", PatternType::RecurringChallenge, "work", vec!["m1".into()], now);
        let predictions = vec![
            prediction(pattern.id, 40.0, now - Duration::hours(72)),
            prediction(pattern.id, 60.0, now - Duration::days(8)),
            prediction(Uuid::new_v4(), 90.0, now),
        ];
        let result = sweep(vec![pattern], predictions, now);
        let resp = pattern_response(&result, PatternType::RecurringChallenge, Vec::new(), now, 50);
        assert_eq!(resp.patterns.len(), 1);
        assert_eq!(resp.patterns[0].frequency, 1);
        assert_eq!(resp.predictions.len(), 1);
        assert!((resp.predictions[0].confidence - 20.0).abs() < 0.1);
    }

    #[test]
    fn other_pattern_types_yield_empty_sections() {
        let now = Utc::now();
        let pattern = Pattern::new("u1", PatternType::RecurringChallenge, "work", vec!["m1".into()], now);
        let result = sweep(vec![pattern], Vec::new(), now);
        let resp = pattern_response(&result, PatternType::EmotionalCycle, Vec::new(), now, 50);
        assert!(resp.is_empty());
    }

    #[test]
    fn emergent_themes_come_from_strong_active_clusters() {
        let v = view(vec![
            snapshot(ClusterState::Active, 0.8, &[("career", 3), ("mentor", 1)]),
            snapshot(ClusterState::Active, 0.7, &[("mentor", 2), ("budget", 3)]),
            snapshot(ClusterState::Active, 0.4, &[("garden", 9)]),
            snapshot(ClusterState::Dormant, 0.9, &[("travel", 9)]),
        ]);
        let resp = cluster_response(&v, 0.5);
        assert_eq!(resp.clusters.len(), 4);
        assert_eq!(resp.clusters[0].strength_score, 0.9);
        assert_eq!(resp.emergent_themes, vec!["budget", "career", "mentor"]);
    }

    #[test]
    fn pruned_clusters_are_hidden() {
        let v = view(vec![
            snapshot(ClusterState::Pruned, 0.1, &[("old", 1)]),
            snapshot(ClusterState::Forming, 0.3, &[("new", 1)]),
        ]);
        let resp = cluster_response(&v, 0.5);
        assert_eq!(resp.clusters.len(), 1);
        assert_eq!(resp.clusters[0].phase_context, "expansion");
        assert!(resp.emergent_themes.is_empty());
    }

    #[test]
    fn empty_view_yields_empty_response() {
        assert_eq!(cluster_response(&view(Vec::new()), 0.5), ClusterQueryResponse::default());
    }
}

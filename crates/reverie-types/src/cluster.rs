//! Semantic clusters of memories and their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::memory::PhaseTag;

/// Lifecycle of a [`MemoryCluster`].
///
/// ```text
/// Forming ──(≥ 3 members)──▶ Active ──(inactive)──▶ Dormant ──(weak)──▶ Pruned
///                              ▲                       │
///                              └──(matching memory)────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterState {
    Forming,
    Active,
    Dormant,
    Pruned,
}

impl ClusterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterState::Forming => "forming",
            ClusterState::Active => "active",
            ClusterState::Dormant => "dormant",
            ClusterState::Pruned => "pruned",
        }
    }

    pub fn from_label(s: &str) -> Option<Self> {
        match s {
            "forming" => Some(ClusterState::Forming),
            "active" => Some(ClusterState::Active),
            "dormant" => Some(ClusterState::Dormant),
            "pruned" => Some(ClusterState::Pruned),
            _ => None,
        }
    }

    /// Clusters in these states may receive new members.
    pub fn accepts_members(&self) -> bool {
        !matches!(self, ClusterState::Pruned)
    }
}

/// A semantic grouping of one user's memories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryCluster {
    pub id: Uuid,
    pub user_id: String,
    /// Running mean of member embeddings.
    pub centroid: Vec<f32>,
    /// Member memory ids, most recent last.
    pub member_ids: Vec<String>,
    /// Top keywords across member content, most frequent first.
    pub concepts: Vec<String>,
    /// Recency-weighted mean valence of members.
    pub emotional_context: f32,
    /// Most frequent phase tag among members.
    pub phase_context: PhaseTag,
    /// Composite of size, emotional consistency and recency in `[0, 1]`.
    pub strength_score: f32,
    pub state: ClusterState,
    pub last_updated: DateTime<Utc>,
}

/// Read-only view of a cluster published by the clustering engine.
///
/// Carries the evidence pattern detectors need without giving them access to
/// the engine's mutable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSnapshot {
    pub cluster: MemoryCluster,
    /// Timestamp of each member, aligned with `cluster.member_ids`.
    pub member_timestamps: Vec<DateTime<Utc>>,
    /// Term counts behind `cluster.concepts`, same order.
    pub concept_counts: Vec<(String, usize)>,
    /// Slope of strength samples taken on membership changes.  Positive when
    /// the cluster has been getting stronger.
    pub strength_trend: f32,
}

impl ClusterSnapshot {
    /// Member timestamps at or after `since`, excluding the founding member.
    ///
    /// These are the moments at which the cluster *gained* a member.
    pub fn additions_since(&self, since: Option<DateTime<Utc>>) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        self.member_timestamps
            .iter()
            .skip(1)
            .copied()
            .filter(move |ts| since.is_none_or(|s| *ts >= s))
    }

    /// `(memory_id, timestamp)` pairs of members at or after `since`.
    pub fn members_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> impl Iterator<Item = (&str, DateTime<Utc>)> + '_ {
        self.cluster
            .member_ids
            .iter()
            .zip(self.member_timestamps.iter().copied())
            .filter(move |(_, ts)| since.is_none_or(|s| *ts >= s))
            .map(|(id, ts)| (id.as_str(), ts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn snapshot() -> ClusterSnapshot {
        let t0 = Utc::now() - Duration::days(10);
        ClusterSnapshot {
            cluster: MemoryCluster {
                id: Uuid::new_v4(),
                user_id: "u".to_string(),
                centroid: vec![1.0, 0.0],
                member_ids: vec!["a".into(), "b".into(), "c".into()],
                concepts: vec!["career".into()],
                emotional_context: 0.1,
                phase_context: PhaseTag::Renewal,
                strength_score: 0.6,
                state: ClusterState::Active,
                last_updated: t0 + Duration::days(8),
            },
            member_timestamps: vec![t0, t0 + Duration::days(4), t0 + Duration::days(8)],
            concept_counts: vec![("career".into(), 3)],
            strength_trend: 0.1,
        }
    }

    #[test]
    fn state_label_roundtrip() {
        for state in [
            ClusterState::Forming,
            ClusterState::Active,
            ClusterState::Dormant,
            ClusterState::Pruned,
        ] {
            assert_eq!(ClusterState::from_label(state.as_str()), Some(state));
        }
        assert!(!ClusterState::Pruned.accepts_members());
        assert!(ClusterState::Dormant.accepts_members());
    }

    #[test]
    fn additions_skip_founding_member() {
        let snap = snapshot();
        assert_eq!(snap.additions_since(None).count(), 2);
        let cutoff = snap.member_timestamps[2];
        assert_eq!(snap.additions_since(Some(cutoff)).count(), 1);
    }

    #[test]
    fn members_since_filters_by_timestamp() {
        let snap = snapshot();
        let cutoff = snap.member_timestamps[1];
        let ids: Vec<&str> = snap.members_since(Some(cutoff)).map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }
}

//! Incremental per-user clustering.
//!
//! [`UserClusters`] owns every cluster of one user.  It is a plain,
//! synchronous state machine: the runtime wraps it in a per-user actor so
//! there is exactly one writer.
//!
//! # Assignment
//!
//! For each memory, the centroid of every cluster that still accepts members
//! (Forming, Active, Dormant) is compared by cosine similarity.  The memory
//! joins the best cluster at or above `similarity_threshold`; otherwise it
//! founds a new Forming cluster.  Equal similarities are resolved in favour of
//! the cluster with the most recent `last_updated`.
//!
//! Centroids are kept as a running `(sum, count)` pair so an insertion costs
//! O(d) regardless of cluster size.
//!
//! # Lifecycle
//!
//! ```text
//! Forming ──(activation_size members)──▶ Active ──(idle ≥ inactivity)──▶ Dormant
//! Dormant ──(matching memory)──▶ Active
//! Dormant ──(strength < prune_floor)──▶ Pruned  (members released)
//! ```
//!
//! Forming clusters that stay idle past the inactivity window also turn
//! Dormant so weak singletons eventually get pruned.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use reverie_types::{
    ClusterSnapshot, ClusterState, Memory, MemoryCluster, PhaseTag, ReverieError,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::concepts::{count_terms, tokenize, top_concepts};
use crate::derive::{days_between, emotional_context, phase_context, strength, trend};
use crate::similarity::{accumulate, cosine_similarity, mean_of, withdraw};

/// Strength samples kept per cluster for the trend estimate.
const STRENGTH_HISTORY: usize = 16;

/// Relative tolerance when comparing a running sum against its members.
const SUM_TOLERANCE: f64 = 1e-3;

// ─────────────────────────────────────────────────────────────────────────────
// ClusterConfig
// ─────────────────────────────────────────────────────────────────────────────

/// Tunables of the clustering engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Minimum cosine similarity (τ) for joining an existing cluster.
    pub similarity_threshold: f32,
    /// Minimum centroid similarity for merging two Active clusters.  Must be
    /// greater than `similarity_threshold`.
    pub merge_threshold: f32,
    /// Member count at which a Forming cluster becomes Active.
    pub activation_size: usize,
    /// Days without a new member before a cluster turns Dormant.
    pub inactivity_days: i64,
    /// Dormant clusters weaker than this are pruned.
    pub prune_floor: f32,
    /// Maximum number of concepts kept per cluster.
    pub max_concepts: usize,
    /// Half-life, in days, of both the emotional-context weighting and the
    /// recency factor of the strength score.
    pub half_life_days: f64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.78,
            merge_threshold: 0.90,
            activation_size: 3,
            inactivity_days: 14,
            prune_floor: 0.25,
            max_concepts: 8,
            half_life_days: 7.0,
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<(), ReverieError> {
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            return Err(ReverieError::validation("similarity_threshold must be within [-1, 1]"));
        }
        if self.merge_threshold <= self.similarity_threshold || self.merge_threshold > 1.0 {
            return Err(ReverieError::validation(
                "merge_threshold must be greater than similarity_threshold and at most 1",
            ));
        }
        if self.activation_size == 0 {
            return Err(ReverieError::validation("activation_size must be at least 1"));
        }
        if self.inactivity_days <= 0 || self.half_life_days <= 0.0 {
            return Err(ReverieError::validation(
                "inactivity_days and half_life_days must be positive",
            ));
        }
        Ok(())
    }

    pub fn inactivity(&self) -> Duration {
        Duration::days(self.inactivity_days)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outcomes
// ─────────────────────────────────────────────────────────────────────────────

/// Where a memory ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    Joined {
        cluster_id: Uuid,
        similarity: f32,
        /// The cluster was Dormant before this memory arrived.
        reactivated: bool,
    },
    Created { cluster_id: Uuid },
    /// The memory was already a member; nothing changed.
    AlreadyMember { cluster_id: Uuid },
}

impl Assignment {
    pub fn cluster_id(&self) -> Uuid {
        match self {
            Assignment::Joined { cluster_id, .. }
            | Assignment::Created { cluster_id }
            | Assignment::AlreadyMember { cluster_id } => *cluster_id,
        }
    }
}

/// Result of [`UserClusters::assign`].
#[derive(Debug, Clone, PartialEq)]
pub struct AssignOutcome {
    pub assignment: Assignment,
    /// Clusters whose persisted form changed.
    pub touched: Vec<Uuid>,
    /// Clusters that lost their last member and no longer exist.
    pub removed: Vec<Uuid>,
}

/// Result of [`UserClusters::tick`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub dormant: Vec<Uuid>,
    pub pruned: Vec<Uuid>,
    /// Memories freed by pruning.  They are never clustered again.
    pub released: Vec<String>,
}

/// One merge performed by [`UserClusters::merge_pass`].
#[derive(Debug, Clone, PartialEq)]
pub struct MergeEvent {
    pub survivor: Uuid,
    pub absorbed: Uuid,
    pub similarity: f32,
}

// ─────────────────────────────────────────────────────────────────────────────
// ClusterRecord
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct MemberSummary {
    memory_id: String,
    timestamp: DateTime<Utc>,
    valence: f32,
    phase: PhaseTag,
    embedding: Vec<f32>,
    terms: Vec<String>,
}

impl MemberSummary {
    fn from_memory(memory: &Memory) -> Self {
        Self {
            memory_id: memory.id.clone(),
            timestamp: memory.timestamp,
            valence: memory.emotional_valence,
            phase: memory.phase_tag,
            embedding: memory.embedding.clone(),
            terms: tokenize(&memory.content),
        }
    }

    fn sort_key(&self) -> (DateTime<Utc>, &str) {
        (self.timestamp, self.memory_id.as_str())
    }
}

#[derive(Debug, Clone)]
struct ClusterRecord {
    id: Uuid,
    state: ClusterState,
    sum: Vec<f64>,
    count: usize,
    /// Timestamp order, most recent last.
    members: Vec<MemberSummary>,
    last_updated: DateTime<Utc>,
    /// Instant the derived fields were last computed for.
    evaluated_at: DateTime<Utc>,
    centroid: Vec<f32>,
    concepts: Vec<(String, usize)>,
    emotional_context: f32,
    phase_context: PhaseTag,
    strength_score: f32,
    strength_history: Vec<f32>,
}

impl ClusterRecord {
    fn found(member: MemberSummary, config: &ClusterConfig) -> Self {
        let at = member.timestamp;
        let mut record = Self {
            id: Uuid::new_v4(),
            state: ClusterState::Forming,
            sum: vec![0.0; member.embedding.len()],
            count: 0,
            members: Vec::new(),
            last_updated: at,
            evaluated_at: at,
            centroid: Vec::new(),
            concepts: Vec::new(),
            emotional_context: 0.0,
            phase_context: PhaseTag::Unknown,
            strength_score: 0.0,
            strength_history: Vec::new(),
        };
        record.insert_member(member);
        record.promote(config);
        record.refresh(config, at);
        record.sample_strength();
        record
    }

    fn insert_member(&mut self, member: MemberSummary) {
        accumulate(&mut self.sum, &member.embedding);
        self.count += 1;
        self.last_updated = self.last_updated.max(member.timestamp);
        let pos = self
            .members
            .partition_point(|m| m.sort_key() <= member.sort_key());
        self.members.insert(pos, member);
    }

    fn remove_member(&mut self, memory_id: &str) -> Option<MemberSummary> {
        let pos = self.members.iter().position(|m| m.memory_id == memory_id)?;
        let member = self.members.remove(pos);
        withdraw(&mut self.sum, &member.embedding);
        self.count = self.count.saturating_sub(1);
        Some(member)
    }

    fn promote(&mut self, config: &ClusterConfig) {
        if self.state == ClusterState::Forming && self.members.len() >= config.activation_size {
            self.state = ClusterState::Active;
        }
    }

    /// Recompute every derived field as of `now` (never earlier than the
    /// previous evaluation).
    fn refresh(&mut self, config: &ClusterConfig, now: DateTime<Utc>) {
        self.evaluated_at = self.evaluated_at.max(now);
        self.centroid = mean_of(&self.sum, self.count);

        let counts = count_terms(self.members.iter().map(|m| m.terms.as_slice()));
        self.concepts = top_concepts(&counts, config.max_concepts);

        let weighted: Vec<(DateTime<Utc>, f32)> =
            self.members.iter().map(|m| (m.timestamp, m.valence)).collect();
        self.emotional_context = emotional_context(&weighted, config.half_life_days);

        let phases: Vec<PhaseTag> = self.members.iter().map(|m| m.phase).collect();
        self.phase_context = phase_context(&phases);

        let valences: Vec<f32> = self.members.iter().map(|m| m.valence).collect();
        self.strength_score = strength(
            self.members.len(),
            &valences,
            days_between(self.last_updated, self.evaluated_at),
            config.half_life_days,
        );
    }

    fn sample_strength(&mut self) {
        self.strength_history.push(self.strength_score);
        if self.strength_history.len() > STRENGTH_HISTORY {
            self.strength_history.remove(0);
        }
    }

    /// Rebuild `(sum, count)` from the member list.
    fn rebuild_running_mean(&mut self) {
        let dims = self.members.first().map(|m| m.embedding.len()).unwrap_or(self.sum.len());
        self.sum = vec![0.0; dims];
        for m in &self.members {
            accumulate(&mut self.sum, &m.embedding);
        }
        self.count = self.members.len();
    }

    /// Describe a violated `(sum, count)` invariant, if any.
    fn running_mean_violation(&self) -> Option<String> {
        if self.count != self.members.len() {
            return Some(format!(
                "count {} does not match {} members",
                self.count,
                self.members.len()
            ));
        }
        let mut expected = vec![0.0f64; self.sum.len()];
        for m in &self.members {
            accumulate(&mut expected, &m.embedding);
        }
        let drift = self
            .sum
            .iter()
            .zip(&expected)
            .map(|(a, b)| (a - b).abs() / b.abs().max(1.0))
            .fold(0.0f64, f64::max);
        (drift > SUM_TOLERANCE).then(|| format!("running sum drifted by {drift:.4}"))
    }

    fn to_cluster(&self, user_id: &str) -> MemoryCluster {
        MemoryCluster {
            id: self.id,
            user_id: user_id.to_string(),
            centroid: self.centroid.clone(),
            member_ids: self.members.iter().map(|m| m.memory_id.clone()).collect(),
            concepts: self.concepts.iter().map(|(t, _)| t.clone()).collect(),
            emotional_context: self.emotional_context,
            phase_context: self.phase_context,
            strength_score: self.strength_score,
            state: self.state,
            last_updated: self.last_updated,
        }
    }

    fn snapshot(&self, user_id: &str) -> ClusterSnapshot {
        ClusterSnapshot {
            cluster: self.to_cluster(user_id),
            member_timestamps: self.members.iter().map(|m| m.timestamp).collect(),
            concept_counts: self.concepts.clone(),
            strength_trend: trend(&self.strength_history),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// UserClusters
// ─────────────────────────────────────────────────────────────────────────────

/// Every cluster of one user plus the memory → cluster index.
#[derive(Debug, Clone)]
pub struct UserClusters {
    user_id: String,
    config: ClusterConfig,
    clusters: Vec<ClusterRecord>,
    membership: HashMap<String, Uuid>,
}

impl UserClusters {
    pub fn new(user_id: impl Into<String>, config: ClusterConfig) -> Self {
        Self {
            user_id: user_id.into(),
            config,
            clusters: Vec::new(),
            membership: HashMap::new(),
        }
    }

    /// Rebuild a user's clusters from persisted rows and the member memories
    /// they reference.
    ///
    /// Members that are missing from `memories` (superseded since the row was
    /// written) are dropped; clusters left empty are skipped.  Any mismatch
    /// between the persisted centroid or member list and the rebuilt state is
    /// reported as [`ReverieError::ClusteringInconsistency`] and healed.
    pub fn restore(
        user_id: impl Into<String>,
        config: ClusterConfig,
        persisted: Vec<MemoryCluster>,
        memories: &[Memory],
    ) -> (Self, Vec<ReverieError>) {
        let mut engine = Self::new(user_id, config);
        let by_id: HashMap<&str, &Memory> = memories.iter().map(|m| (m.id.as_str(), m)).collect();
        let mut issues = Vec::new();

        for row in persisted {
            if row.state == ClusterState::Pruned {
                continue;
            }
            let mut record: Option<ClusterRecord> = None;
            let mut dropped = 0usize;
            for member_id in &row.member_ids {
                let Some(memory) = by_id.get(member_id.as_str()) else {
                    dropped += 1;
                    continue;
                };
                if engine.membership.contains_key(member_id) {
                    dropped += 1;
                    continue;
                }
                let summary = MemberSummary::from_memory(memory);
                match record.as_mut() {
                    Some(r) => r.insert_member(summary),
                    None => {
                        let mut r = ClusterRecord::found(summary, &engine.config);
                        r.id = row.id;
                        record = Some(r);
                    }
                }
                engine.membership.insert(member_id.clone(), row.id);
            }
            let Some(mut record) = record else {
                continue;
            };
            record.state = row.state;
            record.last_updated = record.last_updated.max(row.last_updated);
            record.evaluated_at = record.last_updated;
            record.refresh(&engine.config, record.last_updated);
            record.strength_history = vec![row.strength_score, record.strength_score];

            let centroid_drift = row.centroid.len() != record.centroid.len()
                || cosine_similarity(&row.centroid, &record.centroid) < 0.999;
            if dropped > 0 || centroid_drift {
                let details = format!(
                    "restored with {dropped} dropped member(s){}",
                    if centroid_drift { ", centroid recomputed" } else { "" }
                );
                warn!(user_id = %engine.user_id, cluster_id = %record.id, %details, "healed persisted cluster");
                issues.push(ReverieError::ClusteringInconsistency {
                    cluster_id: record.id.to_string(),
                    details,
                });
            }
            engine.clusters.push(record);
        }
        (engine, issues)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Number of live (non-pruned) clusters.
    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Cluster currently holding `memory_id`.
    pub fn cluster_of(&self, memory_id: &str) -> Option<Uuid> {
        self.membership.get(memory_id).copied()
    }

    pub fn get(&self, id: Uuid) -> Option<MemoryCluster> {
        self.record(id).map(|r| r.to_cluster(&self.user_id))
    }

    pub fn clusters(&self) -> Vec<MemoryCluster> {
        self.clusters.iter().map(|r| r.to_cluster(&self.user_id)).collect()
    }

    /// Read-only views for detectors and queries.
    pub fn snapshot(&self) -> Vec<ClusterSnapshot> {
        self.clusters.iter().map(|r| r.snapshot(&self.user_id)).collect()
    }

    fn record(&self, id: Uuid) -> Option<&ClusterRecord> {
        self.clusters.iter().find(|r| r.id == id)
    }

    fn index_of(&self, id: Uuid) -> Option<usize> {
        self.clusters.iter().position(|r| r.id == id)
    }

    /// Assign `memory` to a cluster.
    ///
    /// Idempotent: a memory that is already a member is left where it is.  A
    /// correction (`supersedes = Some(x)`) first withdraws `x` from its
    /// cluster.
    ///
    /// # Errors
    ///
    /// [`ReverieError::Validation`] when the memory belongs to another user or
    /// its embedding length differs from the existing centroids.
    pub fn assign(&mut self, memory: &Memory) -> Result<AssignOutcome, ReverieError> {
        if memory.user_id != self.user_id {
            return Err(ReverieError::validation(format!(
                "memory {} belongs to {}, not {}",
                memory.id, memory.user_id, self.user_id
            )));
        }
        if let Some(cluster_id) = self.cluster_of(&memory.id) {
            return Ok(AssignOutcome {
                assignment: Assignment::AlreadyMember { cluster_id },
                touched: Vec::new(),
                removed: Vec::new(),
            });
        }
        if let Some(dims) = self.clusters.first().map(|r| r.centroid.len()) {
            if dims != memory.embedding.len() {
                return Err(ReverieError::validation(format!(
                    "embedding has {} dimensions, clusters use {dims}",
                    memory.embedding.len()
                )));
            }
        }

        let mut touched = Vec::new();
        let mut removed = Vec::new();
        let released = memory
            .supersedes
            .as_deref()
            .and_then(|old| self.release(old, memory.timestamp));
        match released {
            Some((cluster_id, true)) => removed.push(cluster_id),
            Some((cluster_id, false)) => touched.push(cluster_id),
            None => {}
        }

        let mut best: Option<(usize, f32)> = None;
        for (idx, record) in self.clusters.iter().enumerate() {
            if !record.state.accepts_members() {
                continue;
            }
            let sim = cosine_similarity(&memory.embedding, &record.centroid);
            if sim < self.config.similarity_threshold {
                continue;
            }
            let better = match best {
                None => true,
                Some((b, best_sim)) => {
                    sim > best_sim
                        || (sim == best_sim && record.last_updated > self.clusters[b].last_updated)
                }
            };
            if better {
                best = Some((idx, sim));
            }
        }

        let summary = MemberSummary::from_memory(memory);
        let assignment = match best {
            Some((idx, similarity)) => {
                let config = &self.config;
                let record = &mut self.clusters[idx];
                let reactivated = record.state == ClusterState::Dormant;
                record.insert_member(summary);
                if reactivated {
                    record.state = if record.members.len() >= config.activation_size {
                        ClusterState::Active
                    } else {
                        ClusterState::Forming
                    };
                    info!(user_id = %self.user_id, cluster_id = %record.id, "cluster reactivated");
                }
                record.promote(config);
                record.refresh(config, memory.timestamp);
                record.sample_strength();
                debug!(
                    user_id = %self.user_id,
                    memory_id = %memory.id,
                    cluster_id = %record.id,
                    similarity,
                    "memory joined cluster"
                );
                Assignment::Joined {
                    cluster_id: record.id,
                    similarity,
                    reactivated,
                }
            }
            None => {
                let record = ClusterRecord::found(summary, &self.config);
                let cluster_id = record.id;
                self.clusters.push(record);
                debug!(
                    user_id = %self.user_id,
                    memory_id = %memory.id,
                    %cluster_id,
                    "memory founded cluster"
                );
                Assignment::Created { cluster_id }
            }
        };
        let cluster_id = assignment.cluster_id();
        self.membership.insert(memory.id.clone(), cluster_id);
        if !touched.contains(&cluster_id) {
            touched.push(cluster_id);
        }
        Ok(AssignOutcome {
            assignment,
            touched,
            removed,
        })
    }

    /// Withdraw `memory_id` from its cluster.  Returns the cluster id and
    /// whether the cluster was emptied (and therefore removed).
    fn release(&mut self, memory_id: &str, at: DateTime<Utc>) -> Option<(Uuid, bool)> {
        let cluster_id = self.membership.remove(memory_id)?;
        let idx = self.index_of(cluster_id)?;
        let record = &mut self.clusters[idx];
        record.remove_member(memory_id);
        debug!(user_id = %self.user_id, %memory_id, %cluster_id, "superseded memory withdrawn");
        if record.members.is_empty() {
            self.clusters.remove(idx);
            return Some((cluster_id, true));
        }
        record.refresh(&self.config, at);
        record.sample_strength();
        Some((cluster_id, false))
    }

    /// Advance the lifecycle to `now`: refresh strength scores, move idle
    /// clusters to Dormant and prune weak Dormant clusters.
    pub fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let inactivity = self.config.inactivity();

        for record in &mut self.clusters {
            record.refresh(&self.config, now);
            let idle = now - record.last_updated >= inactivity;
            if idle && matches!(record.state, ClusterState::Forming | ClusterState::Active) {
                record.state = ClusterState::Dormant;
                report.dormant.push(record.id);
            }
            if record.state == ClusterState::Dormant && record.strength_score < self.config.prune_floor {
                record.state = ClusterState::Pruned;
                report.pruned.push(record.id);
            }
        }

        let (pruned, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.clusters)
            .into_iter()
            .partition(|r| r.state == ClusterState::Pruned);
        self.clusters = live;
        for record in pruned {
            for member in &record.members {
                self.membership.remove(&member.memory_id);
                report.released.push(member.memory_id.clone());
            }
            info!(
                user_id = %self.user_id,
                cluster_id = %record.id,
                strength = record.strength_score,
                members = record.members.len(),
                "cluster pruned"
            );
        }
        report
    }

    /// Merge Active clusters whose centroids are at least `merge_threshold`
    /// similar, most similar pair first, until no pair qualifies.
    pub fn merge_pass(&mut self) -> Vec<MergeEvent> {
        let mut events = Vec::new();
        while let Some((a, b, similarity)) = self.most_similar_active_pair() {
            let (survivor, absorbed) = {
                let (ra, rb) = (&self.clusters[a], &self.clusters[b]);
                let a_wins = (ra.members.len(), ra.last_updated) >= (rb.members.len(), rb.last_updated);
                if a_wins { (a, b) } else { (b, a) }
            };
            let absorbed_record = self.clusters.remove(absorbed);
            let survivor = if absorbed < survivor { survivor - 1 } else { survivor };
            let record = &mut self.clusters[survivor];
            for member in absorbed_record.members {
                self.membership.insert(member.memory_id.clone(), record.id);
                record.insert_member(member);
            }
            record.evaluated_at = record.evaluated_at.max(absorbed_record.evaluated_at);
            let at = record.evaluated_at;
            record.refresh(&self.config, at);
            record.sample_strength();
            info!(
                user_id = %self.user_id,
                survivor = %record.id,
                absorbed = %absorbed_record.id,
                similarity,
                "clusters merged"
            );
            events.push(MergeEvent {
                survivor: record.id,
                absorbed: absorbed_record.id,
                similarity,
            });
        }
        events
    }

    fn most_similar_active_pair(&self) -> Option<(usize, usize, f32)> {
        let mut best: Option<(usize, usize, f32)> = None;
        for i in 0..self.clusters.len() {
            if self.clusters[i].state != ClusterState::Active {
                continue;
            }
            for j in (i + 1)..self.clusters.len() {
                if self.clusters[j].state != ClusterState::Active {
                    continue;
                }
                let sim = cosine_similarity(&self.clusters[i].centroid, &self.clusters[j].centroid);
                if sim >= self.config.merge_threshold && best.is_none_or(|(_, _, s)| sim > s) {
                    best = Some((i, j, sim));
                }
            }
        }
        best
    }

    /// Check every cluster's running mean and the membership index against
    /// the member lists, rebuilding whatever disagrees.
    ///
    /// Returns one [`ReverieError::ClusteringInconsistency`] per healed
    /// cluster; the engine is consistent again when this returns.
    pub fn verify_and_heal(&mut self) -> Vec<ReverieError> {
        let mut issues = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut index: HashMap<String, Uuid> = HashMap::new();

        for record in &mut self.clusters {
            let mut problems = Vec::new();
            let before = record.members.len();
            record.members.retain(|m| seen.insert(m.memory_id.clone()));
            if record.members.len() != before {
                problems.push(format!(
                    "{} member(s) also held by another cluster",
                    before - record.members.len()
                ));
            }
            if let Some(violation) = record.running_mean_violation() {
                problems.push(violation);
            }
            for m in &record.members {
                if self.membership.get(&m.memory_id) != Some(&record.id) {
                    problems.push(format!("index does not point {} here", m.memory_id));
                }
                index.insert(m.memory_id.clone(), record.id);
            }
            if problems.is_empty() {
                continue;
            }
            let details = problems.join("; ");
            warn!(user_id = %self.user_id, cluster_id = %record.id, %details, "clustering inconsistency healed");
            record.rebuild_running_mean();
            let at = record.evaluated_at;
            record.refresh(&self.config, at);
            issues.push(ReverieError::ClusteringInconsistency {
                cluster_id: record.id.to_string(),
                details,
            });
        }
        self.clusters.retain(|r| !r.members.is_empty());

        if index.len() != self.membership.len() {
            warn!(
                user_id = %self.user_id,
                indexed = self.membership.len(),
                actual = index.len(),
                "stale membership entries dropped"
            );
        }
        self.membership = index;
        issues
    }
}

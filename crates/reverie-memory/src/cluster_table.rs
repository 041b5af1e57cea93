//! Persisted cluster state.
//!
//! Clusters are derived data: the engine can always rebuild them from the
//! memory log, but persisting them lets a restart resume without replaying
//! every user's history.  Rows are keyed by cluster id and overwritten on
//! every membership change.
//!
//! Memories freed by pruning are recorded in `released_memories`.  A pruned
//! cluster's row is deleted, so the marker is what keeps its members out of
//! the replay that clusters not-yet-held memories after a restart.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use reverie_types::{ClusterState, MemoryCluster, PhaseTag};
use rusqlite::params;
use uuid::Uuid;

use crate::store::{
    MemoryStore, StoreError, bytes_to_embedding, embedding_to_bytes, micros_to_datetime,
};

/// Columns as read back from SQLite, before JSON decoding.
struct ClusterRow {
    id: String,
    user_id: String,
    centroid: Vec<u8>,
    member_ids: String,
    concepts: String,
    emotional_context: f64,
    phase_context: String,
    strength_score: f64,
    state: String,
    last_updated: DateTime<Utc>,
}

impl ClusterRow {
    fn decode(self) -> Result<MemoryCluster, StoreError> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| StoreError::Corrupt(format!("cluster id {}: {e}", self.id)))?;
        let member_ids: Vec<String> = serde_json::from_str(&self.member_ids)
            .map_err(|e| StoreError::Corrupt(format!("cluster {id} member_ids: {e}")))?;
        let concepts: Vec<String> = serde_json::from_str(&self.concepts)
            .map_err(|e| StoreError::Corrupt(format!("cluster {id} concepts: {e}")))?;
        let state = ClusterState::from_label(&self.state)
            .ok_or_else(|| StoreError::Corrupt(format!("cluster {id} state '{}'", self.state)))?;
        Ok(MemoryCluster {
            id,
            user_id: self.user_id,
            centroid: bytes_to_embedding(&self.centroid),
            member_ids,
            concepts,
            emotional_context: self.emotional_context as f32,
            phase_context: PhaseTag::from_label(&self.phase_context),
            strength_score: self.strength_score as f32,
            state,
            last_updated: self.last_updated,
        })
    }
}

impl MemoryStore {
    /// Insert or overwrite a cluster row.
    pub fn upsert_cluster(&self, cluster: &MemoryCluster) -> Result<(), StoreError> {
        let member_ids = serde_json::to_string(&cluster.member_ids)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let concepts = serde_json::to_string(&cluster.concepts)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.lock()?.execute(
            "INSERT INTO memory_clusters
                 (id, user_id, centroid, member_ids, concepts, emotional_context,
                  phase_context, strength_score, state, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                 centroid          = excluded.centroid,
                 member_ids        = excluded.member_ids,
                 concepts          = excluded.concepts,
                 emotional_context = excluded.emotional_context,
                 phase_context     = excluded.phase_context,
                 strength_score    = excluded.strength_score,
                 state             = excluded.state,
                 last_updated      = excluded.last_updated",
            params![
                cluster.id.to_string(),
                cluster.user_id,
                embedding_to_bytes(&cluster.centroid),
                member_ids,
                concepts,
                cluster.emotional_context as f64,
                cluster.phase_context.as_str(),
                cluster.strength_score as f64,
                cluster.state.as_str(),
                cluster.last_updated.timestamp_micros(),
            ],
        )?;
        Ok(())
    }

    /// Remove a cluster row.  Returns `true` if a row was deleted.
    pub fn delete_cluster(&self, id: Uuid) -> Result<bool, StoreError> {
        let n = self
            .lock()?
            .execute("DELETE FROM memory_clusters WHERE id = ?1", params![id.to_string()])?;
        Ok(n > 0)
    }

    /// Every persisted cluster of `user_id`, oldest update first.
    pub fn load_clusters_for_user(&self, user_id: &str) -> Result<Vec<MemoryCluster>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, centroid, member_ids, concepts, emotional_context,
                    phase_context, strength_score, state, last_updated
             FROM memory_clusters
             WHERE user_id = ?1
             ORDER BY last_updated ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            let ts: i64 = row.get(9)?;
            Ok(ClusterRow {
                id: row.get(0)?,
                user_id: row.get(1)?,
                centroid: row.get(2)?,
                member_ids: row.get(3)?,
                concepts: row.get(4)?,
                emotional_context: row.get(5)?,
                phase_context: row.get(6)?,
                strength_score: row.get(7)?,
                state: row.get(8)?,
                last_updated: micros_to_datetime(9, ts)?,
            })
        })?;
        let raw = rows.collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(ClusterRow::decode).collect()
    }

    /// Record that pruning released `memory_ids` of `user_id` at `at`.
    /// Already released ids keep their first timestamp.
    pub fn mark_released(&self, user_id: &str, memory_ids: &[String], at: DateTime<Utc>) -> Result<(), StoreError> {
        if memory_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO released_memories (memory_id, user_id, released_at)
                 VALUES (?1, ?2, ?3)",
            )?;
            for id in memory_ids {
                stmt.execute(params![id, user_id, at.timestamp_micros()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Ids of every memory of `user_id` released by pruning.
    pub fn released_ids_for_user(&self, user_id: &str) -> Result<HashSet<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT memory_id FROM released_memories WHERE user_id = ?1")?;
        let rows = stmt.query_map(params![user_id], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<HashSet<_>, _>>()?)
    }
}

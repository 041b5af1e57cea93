//! Per-user actors.
//!
//! Each user's [`UserClusters`] lives inside exactly one task, so all
//! mutations of one user are serialised without a lock while different users
//! proceed in parallel.  The actor owns the write path:
//!
//! 1. append the memory to the [`MemoryStore`] (idempotent),
//! 2. assign it to a cluster,
//! 3. persist the touched clusters,
//! 4. publish a fresh [`ClusterView`] on its `watch` channel.
//!
//! Readers never talk to the actor.  They borrow the last published view, so
//! a query never waits behind ingestion.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use reverie_cluster::{Assignment, MergeEvent, TickReport, UserClusters};
use reverie_memory::store::{MemoryStore, StoreError};
use reverie_types::{ClusterSnapshot, Memory, ReverieError};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::events::{EngineEvent, EventBus};

// ─────────────────────────────────────────────────────────────────────────────
// Published state
// ─────────────────────────────────────────────────────────────────────────────

/// Immutable cluster state of one user as of `version`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterView {
    pub user_id: String,
    /// Incremented on every publish.
    pub version: u64,
    pub clusters: Vec<ClusterSnapshot>,
    pub published_at: DateTime<Utc>,
}

/// What happened to one ingested memory.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestReceipt {
    pub memory_id: String,
    /// Cluster now holding the memory.  `None` for a duplicate of a memory
    /// that is no longer clustered.
    pub cluster_id: Option<Uuid>,
    pub duplicate: bool,
    /// `None` for duplicates.
    pub assignment: Option<Assignment>,
}

#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub tick: TickReport,
    pub merges: Vec<MergeEvent>,
    pub healed: Vec<ReverieError>,
}

/// Run a store call on the blocking pool.
pub(crate) async fn blocking<T, F>(store: &Arc<MemoryStore>, f: F) -> Result<T, ReverieError>
where
    T: Send + 'static,
    F: FnOnce(&MemoryStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| ReverieError::Channel(format!("store task failed: {e}")))?
        .map_err(ReverieError::from)
}

// ─────────────────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────────────────

enum Command {
    Ingest {
        memory: Memory,
        reply: oneshot::Sender<Result<IngestReceipt, ReverieError>>,
    },
    Maintain {
        now: DateTime<Utc>,
        reply: oneshot::Sender<Result<MaintenanceReport, ReverieError>>,
    },
}

/// Cheaply cloneable handle to a running [`UserActor`].
#[derive(Clone)]
pub struct UserHandle {
    user_id: String,
    tx: mpsc::Sender<Command>,
    view: watch::Receiver<Arc<ClusterView>>,
}

impl UserHandle {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The most recently published view.  Never blocks on the actor.
    pub fn view(&self) -> Arc<ClusterView> {
        Arc::clone(&self.view.borrow())
    }

    pub fn watch(&self) -> watch::Receiver<Arc<ClusterView>> {
        self.view.clone()
    }

    /// `true` once the actor task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn ingest(&self, memory: Memory) -> Result<IngestReceipt, ReverieError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Ingest { memory, reply }).await?;
        rx.await.map_err(|_| self.gone())?
    }

    pub async fn maintain(&self, now: DateTime<Utc>) -> Result<MaintenanceReport, ReverieError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Maintain { now, reply }).await?;
        rx.await.map_err(|_| self.gone())?
    }

    async fn send(&self, command: Command) -> Result<(), ReverieError> {
        self.tx.send(command).await.map_err(|_| self.gone())
    }

    fn gone(&self) -> ReverieError {
        ReverieError::Channel(format!("actor for user {} has stopped", self.user_id))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Actor
// ─────────────────────────────────────────────────────────────────────────────

pub struct UserActor {
    engine: UserClusters,
    store: Arc<MemoryStore>,
    events: EventBus,
    view: watch::Sender<Arc<ClusterView>>,
    version: u64,
}

impl UserActor {
    /// Start the actor task for `engine`'s user and return its handle.  The
    /// task stops when every handle has been dropped.
    pub fn spawn(engine: UserClusters, store: Arc<MemoryStore>, events: EventBus, queue: usize) -> UserHandle {
        let user_id = engine.user_id().to_string();
        let initial = Arc::new(ClusterView {
            user_id: user_id.clone(),
            version: 0,
            clusters: engine.snapshot(),
            published_at: Utc::now(),
        });
        let (view_tx, view_rx) = watch::channel(initial);
        let (tx, rx) = mpsc::channel(queue.max(1));

        let actor = UserActor {
            engine,
            store,
            events,
            view: view_tx,
            version: 0,
        };
        tokio::spawn(actor.run(rx));

        UserHandle {
            user_id,
            tx,
            view: view_rx,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        debug!(user_id = %self.engine.user_id(), "user actor started");
        while let Some(command) = rx.recv().await {
            match command {
                Command::Ingest { memory, reply } => {
                    let result = self.ingest(memory).await;
                    let _ = reply.send(result);
                }
                Command::Maintain { now, reply } => {
                    let result = self.maintain(now).await;
                    let _ = reply.send(result);
                }
            }
        }
        debug!(user_id = %self.engine.user_id(), "user actor stopped");
    }

    async fn ingest(&mut self, memory: Memory) -> Result<IngestReceipt, ReverieError> {
        if memory.user_id != self.engine.user_id() {
            return Err(ReverieError::validation(format!(
                "memory {} belongs to {}, not {}",
                memory.id,
                memory.user_id,
                self.engine.user_id()
            )));
        }

        let outcome = blocking(&self.store, move |s| s.append(memory)).await?;
        let duplicate = outcome.is_duplicate();
        let memory = outcome.into_memory();

        let receipt = if duplicate {
            IngestReceipt {
                cluster_id: self.engine.cluster_of(&memory.id),
                memory_id: memory.id,
                duplicate: true,
                assignment: None,
            }
        } else {
            let outcome = self.engine.assign(&memory).inspect_err(|e| {
                // The record is stored; the next restore re-clusters it.
                error!(user_id = %memory.user_id, memory_id = %memory.id, error = %e, "clustering failed");
            })?;
            self.persist(&outcome.touched, &outcome.removed).await?;
            self.publish();
            IngestReceipt {
                memory_id: memory.id,
                cluster_id: Some(outcome.assignment.cluster_id()),
                duplicate: false,
                assignment: Some(outcome.assignment),
            }
        };

        self.events.publish(EngineEvent::MemoryIngested {
            user_id: self.engine.user_id().to_string(),
            memory_id: receipt.memory_id.clone(),
            cluster_id: receipt.cluster_id,
            duplicate,
        });
        Ok(receipt)
    }

    async fn maintain(&mut self, now: DateTime<Utc>) -> Result<MaintenanceReport, ReverieError> {
        let tick = self.engine.tick(now);
        let merges = self.engine.merge_pass();
        let healed = self.engine.verify_and_heal();

        let live: Vec<Uuid> = self.engine.clusters().iter().map(|c| c.id).collect();
        let gone: Vec<Uuid> = tick
            .pruned
            .iter()
            .copied()
            .chain(merges.iter().map(|m| m.absorbed))
            .collect();
        if !tick.released.is_empty() {
            // Markers go in before the pruned rows are deleted.
            let user_id = self.engine.user_id().to_string();
            let released = tick.released.clone();
            blocking(&self.store, move |s| s.mark_released(&user_id, &released, now)).await?;
        }
        self.persist(&live, &gone).await?;
        self.publish();

        let user_id = self.engine.user_id().to_string();
        for cluster_id in &tick.dormant {
            self.events.publish(EngineEvent::ClusterDormant {
                user_id: user_id.clone(),
                cluster_id: *cluster_id,
            });
        }
        for cluster_id in &tick.pruned {
            self.events.publish(EngineEvent::ClusterPruned {
                user_id: user_id.clone(),
                cluster_id: *cluster_id,
            });
        }
        for merge in &merges {
            self.events.publish(EngineEvent::ClustersMerged {
                user_id: user_id.clone(),
                survivor: merge.survivor,
                absorbed: merge.absorbed,
            });
        }
        for issue in &healed {
            self.events.publish(EngineEvent::InconsistencyHealed {
                user_id: user_id.clone(),
                details: issue.to_string(),
            });
        }

        if !(tick.dormant.is_empty() && tick.pruned.is_empty() && merges.is_empty() && healed.is_empty()) {
            info!(
                %user_id,
                dormant = tick.dormant.len(),
                pruned = tick.pruned.len(),
                merged = merges.len(),
                healed = healed.len(),
                "maintenance applied"
            );
        }
        Ok(MaintenanceReport { tick, merges, healed })
    }

    async fn persist(&self, upserts: &[Uuid], deletes: &[Uuid]) -> Result<(), ReverieError> {
        let clusters: Vec<_> = upserts.iter().filter_map(|id| self.engine.get(*id)).collect();
        let deletes = deletes.to_vec();
        blocking(&self.store, move |s| {
            for cluster in &clusters {
                s.upsert_cluster(cluster)?;
            }
            for id in deletes {
                s.delete_cluster(id)?;
            }
            Ok(())
        })
        .await
        .inspect_err(|e| warn!(user_id = %self.engine.user_id(), error = %e, "cluster persistence failed"))
    }

    fn publish(&mut self) {
        self.version += 1;
        self.view.send_replace(Arc::new(ClusterView {
            user_id: self.engine.user_id().to_string(),
            version: self.version,
            clusters: self.engine.snapshot(),
            published_at: Utc::now(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use reverie_cluster::ClusterConfig;
    use reverie_types::{ClusterState, PhaseTag, SourceType};

    fn memory(id: &str, ts: DateTime<Utc>, embedding: Vec<f32>) -> Memory {
        Memory {
            id: id.to_string(),
            user_id: "u1".to_string(),
            content: "Evening run by the river".to_string(),
            embedding,
            timestamp: ts,
            emotional_valence: 0.5,
            dominant_emotion: "calm".to_string(),
            phase_tag: PhaseTag::Expansion,
            source_type: SourceType::Journal,
            supersedes: None,
        }
    }

    fn spawn() -> (UserHandle, Arc<MemoryStore>, EventBus) {
        let store = Arc::new(MemoryStore::open_in_memory(2).unwrap());
        let events = EventBus::default();
        let handle = UserActor::spawn(
            UserClusters::new("u1", ClusterConfig::default()),
            Arc::clone(&store),
            events.clone(),
            8,
        );
        (handle, store, events)
    }

    #[tokio::test]
    async fn similar_memories_share_a_persisted_cluster() {
        let (handle, store, _) = spawn();
        let now = Utc::now();
        let mut ids = Vec::new();
        for (i, e) in [[1.0, 0.0], [0.99, 0.05], [0.98, 0.1]].iter().enumerate() {
            let receipt = handle
                .ingest(memory(&format!("m{i}"), now + Duration::minutes(i as i64), e.to_vec()))
                .await
                .unwrap();
            ids.push(receipt.cluster_id.unwrap());
        }
        assert!(ids.iter().all(|id| *id == ids[0]));

        let view = handle.view();
        assert_eq!(view.version, 3);
        assert_eq!(view.clusters.len(), 1);
        assert_eq!(view.clusters[0].cluster.state, ClusterState::Active);

        let rows = store.load_clusters_for_user("u1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].member_ids.len(), 3);
    }

    #[tokio::test]
    async fn duplicate_ingest_changes_nothing() {
        let (handle, _, events) = spawn();
        let mut rx = events.subscribe();
        let m = memory("m1", Utc::now(), vec![1.0, 0.0]);
        let first = handle.ingest(m.clone()).await.unwrap();
        let second = handle.ingest(m).await.unwrap();
        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(second.cluster_id, first.cluster_id);
        assert!(second.assignment.is_none());
        assert_eq!(handle.view().version, 1);

        rx.recv().await.unwrap();
        match rx.recv().await.unwrap() {
            EngineEvent::MemoryIngested { duplicate, .. } => assert!(duplicate),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn correction_replaces_the_original_member() {
        let (handle, _, _) = spawn();
        let now = Utc::now();
        handle.ingest(memory("m1", now, vec![1.0, 0.0])).await.unwrap();
        let mut fix = memory("m1-fix", now + Duration::minutes(1), vec![1.0, 0.0]);
        fix.supersedes = Some("m1".to_string());
        handle.ingest(fix).await.unwrap();

        let view = handle.view();
        let members: Vec<&String> = view.clusters.iter().flat_map(|s| &s.cluster.member_ids).collect();
        assert_eq!(members, vec!["m1-fix"]);
    }

    #[tokio::test]
    async fn foreign_user_is_rejected() {
        let (handle, _, _) = spawn();
        let mut m = memory("m1", Utc::now(), vec![1.0, 0.0]);
        m.user_id = "u2".to_string();
        let err = handle.ingest(m).await.unwrap_err();
        assert!(matches!(err, ReverieError::Validation(_)));
    }

    #[tokio::test]
    async fn maintenance_prunes_idle_singletons() {
        let (handle, store, events) = spawn();
        let mut rx = events.subscribe();
        let now = Utc::now();
        handle.ingest(memory("m1", now, vec![1.0, 0.0])).await.unwrap();
        rx.recv().await.unwrap();

        let report = handle.maintain(now + Duration::days(90)).await.unwrap();
        assert_eq!(report.tick.dormant.len(), 1);
        assert_eq!(report.tick.pruned.len(), 1);
        assert!(handle.view().clusters.is_empty());
        assert!(store.load_clusters_for_user("u1").unwrap().is_empty());
        assert!(store.released_ids_for_user("u1").unwrap().contains("m1"));
        assert!(matches!(rx.recv().await.unwrap(), EngineEvent::ClusterDormant { .. }));
        assert!(matches!(rx.recv().await.unwrap(), EngineEvent::ClusterPruned { .. }));
    }

    #[tokio::test]
    async fn view_outlives_dropped_handle() {
        let (handle, _, _) = spawn();
        let watcher = handle.watch();
        assert!(!handle.is_closed());
        drop(handle);
        assert_eq!(watcher.borrow().version, 0);
    }
}

//! [`Engine`] – the ingestion and query front door.
//!
//! | Operation | Path |
//! |---|---|
//! | [`Engine::ingest`] | user actor: store → cluster → persist → publish |
//! | [`Engine::ingest_raw`] | enrichment (with retry) then `ingest` |
//! | [`Engine::pattern_query`] | latest committed sweep, cold sweep if none |
//! | [`Engine::cluster_query`] | latest published cluster view |
//! | [`Engine::maintain_all`] | tick + merge + heal per user, refresh sweeps |
//!
//! Actors are created lazily on first use.  A user with persisted clusters is
//! restored from them; a user without any is rebuilt by replaying the memory
//! stream.  Memories released by pruning are never replayed.  Each user loads
//! behind its own [`OnceCell`], so one user's load never holds up another
//! user's operations.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use reverie_cluster::{ClusterConfig, UserClusters};
use reverie_insight::{DetectionInput, PatternDetector, PredictionGenerator};
use reverie_memory::store::MemoryStore;
use reverie_types::{
    ClusterQuery, ClusterQueryResponse, Memory, PatternQuery, PatternQueryResponse, PatternType,
    RawMemory, ReverieError, Timeframe,
};
use tokio::sync::{OnceCell, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::actor::{ClusterView, IngestReceipt, MaintenanceReport, UserActor, UserHandle, blocking};
use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventBus};
use crate::query;
use crate::retry::{Enricher, PendingRetries};
use crate::sweep::{SweepBoard, SweepResult, Ticket};

/// Outcome of [`Engine::ingest_raw`].
#[derive(Debug, Clone, PartialEq)]
pub enum IngestStatus {
    Ingested(IngestReceipt),
    /// Enrichment failed transiently; the record is parked and will be
    /// retried in the background.
    Deferred { memory_id: String, retry_in: Duration },
}

struct Inner {
    store: Arc<MemoryStore>,
    config: EngineConfig,
    users: Mutex<HashMap<String, Arc<OnceCell<UserHandle>>>>,
    sweeps: SweepBoard,
    sweep_limiter: DefaultKeyedRateLimiter<String>,
    events: EventBus,
    detector: PatternDetector,
    predictor: PredictionGenerator,
    enricher: Option<Arc<dyn Enricher>>,
    pending: PendingRetries,
}

/// Cheaply cloneable engine handle.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Build an engine over `store`.
    ///
    /// # Errors
    ///
    /// [`ReverieError::Validation`] when `config` is invalid or its embedding
    /// dimension differs from the store's.
    pub fn new(store: Arc<MemoryStore>, config: EngineConfig) -> Result<Self, ReverieError> {
        Self::build(store, config, None)
    }

    /// Like [`new`][Self::new], with an enricher for records that arrive
    /// without an embedding or valence.
    pub fn with_enricher(
        store: Arc<MemoryStore>,
        config: EngineConfig,
        enricher: Arc<dyn Enricher>,
    ) -> Result<Self, ReverieError> {
        Self::build(store, config, Some(enricher))
    }

    fn build(
        store: Arc<MemoryStore>,
        config: EngineConfig,
        enricher: Option<Arc<dyn Enricher>>,
    ) -> Result<Self, ReverieError> {
        config.validate()?;
        if store.dimensions() != config.dimensions {
            return Err(ReverieError::validation(format!(
                "store uses {} dimensions, config expects {}",
                store.dimensions(),
                config.dimensions
            )));
        }
        let per_minute = NonZeroU32::new(config.sweep.max_sweeps_per_minute).unwrap_or(NonZeroU32::MIN);
        let inner = Inner {
            store,
            users: Mutex::new(HashMap::new()),
            sweeps: SweepBoard::new(),
            sweep_limiter: RateLimiter::keyed(Quota::per_minute(per_minute)),
            events: EventBus::default(),
            detector: PatternDetector::with_defaults(&config.insight),
            predictor: PredictionGenerator::new(&config.insight),
            enricher,
            pending: PendingRetries::default(),
            config,
        };
        Ok(Self { inner: Arc::new(inner) })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.inner.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub fn pending_retries(&self) -> &PendingRetries {
        &self.inner.pending
    }

    // ─────────────────────────────────────────────────────────────────────
    // Actors
    // ─────────────────────────────────────────────────────────────────────

    /// The actor handle of `user_id`, starting the actor if needed.
    ///
    /// Concurrent callers for the same user share one load; callers for other
    /// users do not wait on it.
    pub async fn handle(&self, user_id: &str) -> Result<UserHandle, ReverieError> {
        let slot = self.slot(user_id);
        let handle = slot
            .get_or_try_init(|| async {
                let engine = self.load_user(user_id).await?;
                Ok::<_, ReverieError>(UserActor::spawn(
                    engine,
                    Arc::clone(&self.inner.store),
                    self.inner.events.clone(),
                    self.inner.config.actor_queue,
                ))
            })
            .await?;
        Ok(handle.clone())
    }

    fn users(&self) -> MutexGuard<'_, HashMap<String, Arc<OnceCell<UserHandle>>>> {
        self.inner.users.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The load slot of `user_id`.  A slot whose actor has stopped is
    /// replaced.  The map lock is never held across an `.await`.
    fn slot(&self, user_id: &str) -> Arc<OnceCell<UserHandle>> {
        let mut users = self.users();
        match users.get(user_id) {
            Some(slot) if !slot.get().is_some_and(|h| h.is_closed()) => Arc::clone(slot),
            _ => {
                let slot = Arc::new(OnceCell::new());
                users.insert(user_id.to_string(), Arc::clone(&slot));
                slot
            }
        }
    }

    async fn load_user(&self, user_id: &str) -> Result<UserClusters, ReverieError> {
        let store = Arc::clone(&self.inner.store);
        let config = self.inner.config.cluster.clone();
        let uid = user_id.to_string();
        let loaded = tokio::task::spawn_blocking(move || load_clusters(&store, &uid, config))
            .await
            .map_err(|e| ReverieError::Channel(format!("load task failed: {e}")))??;

        for issue in loaded.issues {
            self.inner.events.publish(EngineEvent::InconsistencyHealed {
                user_id: user_id.to_string(),
                details: issue.to_string(),
            });
        }
        info!(
            user_id,
            clusters = loaded.engine.len(),
            replayed = loaded.replayed,
            released = loaded.released,
            "user loaded"
        );
        Ok(loaded.engine)
    }

    /// `true` when the user has a running actor or any stored memory.
    async fn is_known(&self, user_id: &str) -> Result<bool, ReverieError> {
        let loaded = self.users().get(user_id).is_some_and(|slot| slot.initialized());
        if loaded {
            return Ok(true);
        }
        let uid = user_id.to_string();
        Ok(blocking(&self.inner.store, move |s| s.count_for_user(&uid)).await? > 0)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Ingestion
    // ─────────────────────────────────────────────────────────────────────

    /// Store and cluster a fully enriched memory.
    pub async fn ingest(&self, memory: Memory) -> Result<IngestReceipt, ReverieError> {
        require_user(&memory.user_id)?;
        self.handle(&memory.user_id).await?.ingest(memory).await
    }

    /// Ingest a client record, enriching it first when it lacks an embedding
    /// or valence.
    ///
    /// A transient enrichment failure parks the record and retries it in the
    /// background with exponential backoff; the caller gets
    /// [`IngestStatus::Deferred`] immediately.
    pub async fn ingest_raw(&self, raw: RawMemory) -> Result<IngestStatus, ReverieError> {
        require_user(&raw.user_id)?;
        if let Some(memory) = raw.ready() {
            return self.ingest(memory).await.map(IngestStatus::Ingested);
        }
        let Some(enricher) = self.inner.enricher.clone() else {
            return Err(ReverieError::validation(format!(
                "memory {} has no embedding and no enrichment service is configured",
                raw.id
            )));
        };

        match enrich(&enricher, &raw).await {
            Ok(memory) => self.ingest(memory).await.map(IngestStatus::Ingested),
            Err(e) if e.is_retryable() => {
                let retry_in = self.inner.config.retry.delay(1);
                let memory_id = raw.id.clone();
                self.defer(raw, enricher, e);
                Ok(IngestStatus::Deferred { memory_id, retry_in })
            }
            Err(e) => Err(e),
        }
    }

    fn defer(&self, raw: RawMemory, enricher: Arc<dyn Enricher>, first_error: ReverieError) {
        let engine = self.clone();
        let policy = self.inner.config.retry.clone();
        self.inner.pending.park(&raw.user_id);

        tokio::spawn(async move {
            let events = &engine.inner.events;
            let mut attempt = 1u32;
            let mut last_error = first_error;
            let outcome = loop {
                if !policy.allows(attempt) {
                    break Err(last_error);
                }
                let delay = policy.delay(attempt);
                warn!(
                    user_id = %raw.user_id,
                    memory_id = %raw.id,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "enrichment deferred"
                );
                events.publish(EngineEvent::EnrichmentDeferred {
                    user_id: raw.user_id.clone(),
                    memory_id: raw.id.clone(),
                    attempt,
                    retry_in_ms: delay.as_millis() as u64,
                });
                tokio::time::sleep(delay).await;
                attempt += 1;
                match enrich(&enricher, &raw).await {
                    Ok(memory) => break engine.ingest(memory).await.map(|_| ()),
                    Err(e) if e.is_retryable() => last_error = e,
                    Err(e) => break Err(e),
                }
            };
            engine.inner.pending.release(&raw.user_id);
            if let Err(e) = outcome {
                warn!(user_id = %raw.user_id, memory_id = %raw.id, attempt, error = %e, "enrichment abandoned");
                events.publish(EngineEvent::EnrichmentAbandoned {
                    user_id: raw.user_id.clone(),
                    memory_id: raw.id.clone(),
                    reason: e.to_string(),
                });
            }
        });
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sweeps
    // ─────────────────────────────────────────────────────────────────────

    /// Start a sweep for `(user_id, timeframe)` in the background unless the
    /// user's sweep budget is exhausted.  Returns whether a sweep started.
    pub fn request_sweep(&self, user_id: &str, timeframe: Timeframe) -> bool {
        let key = format!("{user_id}:{timeframe}");
        if self.inner.sweep_limiter.check_key(&key).is_err() {
            debug!(user_id, %timeframe, "sweep request rate limited");
            return false;
        }
        self.start_sweep(user_id, timeframe, Utc::now());
        true
    }

    /// Run a sweep and wait for it.  Returns the committed result, which is
    /// a newer sweep's when this one was superseded while running.
    pub async fn sweep_now(&self, user_id: &str, timeframe: Timeframe) -> Result<Option<Arc<SweepResult>>, ReverieError> {
        require_user(user_id)?;
        let (ticket, task) = self.start_sweep(user_id, timeframe, Utc::now());
        match task.await {
            Ok(Err(e)) => return Err(e),
            Ok(Ok(())) => {}
            Err(e) if e.is_cancelled() => debug!(user_id, seq = ticket.seq, "sweep superseded"),
            Err(e) => return Err(ReverieError::Channel(format!("sweep task failed: {e}"))),
        }
        Ok(self.inner.sweeps.latest(user_id, timeframe))
    }

    /// Issue a ticket and spawn the sweep task for it.
    fn start_sweep(
        &self,
        user_id: &str,
        timeframe: Timeframe,
        requested_at: DateTime<Utc>,
    ) -> (Ticket, JoinHandle<Result<(), ReverieError>>) {
        let (ticket, _) = self.inner.sweeps.issue(user_id, timeframe, requested_at);
        let engine = self.clone();
        let uid = user_id.to_string();
        let task = tokio::spawn(async move {
            let result = engine.run_sweep(&uid, timeframe, ticket).await?;
            let (patterns, predictions) = (result.pattern_count(), result.predictions.len());
            if engine.inner.sweeps.commit(result) {
                info!(user_id = %uid, %timeframe, patterns, predictions, "sweep committed");
                engine.inner.events.publish(EngineEvent::SweepCompleted {
                    user_id: uid,
                    timeframe: timeframe.to_string(),
                    patterns,
                    predictions,
                });
            }
            Ok(())
        });
        self.inner.sweeps.attach(user_id, timeframe, ticket, task.abort_handle());
        (ticket, task)
    }

    async fn run_sweep(&self, user_id: &str, timeframe: Timeframe, ticket: Ticket) -> Result<SweepResult, ReverieError> {
        let view = self.handle(user_id).await?.view();
        let now = Utc::now();
        let window_start = timeframe.start(now);
        let since = window_start.map(|s| s - self.inner.config.insight.lookback());

        let uid = user_id.to_string();
        let memories = blocking(&self.inner.store, move |s| {
            s.stream_since(&uid, since).collect::<Result<Vec<_>, _>>()
        })
        .await?;

        let engine = self.clone();
        let uid = user_id.to_string();
        tokio::task::spawn_blocking(move || {
            let input = DetectionInput {
                user_id: &uid,
                memories: &memories,
                clusters: &view.clusters,
                window_start,
                now,
            };
            let patterns = engine.inner.detector.detect(&input);
            let predictions = engine.inner.predictor.generate_all(&patterns, now);
            SweepResult {
                user_id: uid.clone(),
                timeframe,
                ticket,
                window_start,
                patterns,
                predictions,
                completed_at: Utc::now(),
            }
        })
        .await
        .map_err(|e| ReverieError::Channel(format!("detection task failed: {e}")))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────

    /// Answer a pattern query from the latest committed sweep.
    ///
    /// With no sweep yet, one is started and awaited for at most
    /// `sweep.cold_query_timeout_ms`; past that an empty response is
    /// returned.  A stale result is served as-is while a refresh runs in the
    /// background.
    ///
    /// # Errors
    ///
    /// [`ReverieError::Validation`] for a missing user, an unknown pattern
    /// type or an unknown timeframe.
    pub async fn pattern_query(&self, query: &PatternQuery) -> Result<PatternQueryResponse, ReverieError> {
        require_user(&query.user_id)?;
        let pattern_type: PatternType = query.pattern.parse()?;
        let timeframe: Timeframe = query.timeframe.parse()?;
        let user_id = query.user_id.as_str();
        if !self.is_known(user_id).await? {
            return Ok(PatternQueryResponse::default());
        }

        let now = Utc::now();
        let sweep = self.inner.sweeps.latest(user_id, timeframe);
        let Some(result) = (match sweep {
            Some(result) => {
                if now - result.completed_at > self.inner.config.sweep.stale_after() {
                    self.request_sweep(user_id, timeframe);
                }
                Some(result)
            }
            None => self.cold_sweep(user_id, timeframe).await,
        }) else {
            return Ok(PatternQueryResponse::default());
        };

        let ids = query::supporting_ids(result.patterns_of(pattern_type));
        let memories = blocking(&self.inner.store, move |s| {
            let mut memories = s.get_many(&ids)?;
            let mut live = Vec::with_capacity(memories.len());
            for m in memories.drain(..) {
                if !s.is_superseded(&m.id)? {
                    live.push(m);
                }
            }
            Ok(live)
        })
        .await?;

        Ok(query::pattern_response(
            &result,
            pattern_type,
            memories,
            Utc::now(),
            self.inner.config.sweep.max_response_memories,
        ))
    }

    async fn cold_sweep(&self, user_id: &str, timeframe: Timeframe) -> Option<Arc<SweepResult>> {
        let mut rx = self.inner.sweeps.watch(user_id, timeframe);
        if !self.inner.sweeps.in_flight(user_id, timeframe) {
            self.start_sweep(user_id, timeframe, Utc::now());
        }
        let timeout = self.inner.config.sweep.cold_query_timeout();
        match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(result)) => result.clone(),
            Ok(Err(_)) => None,
            Err(_) => {
                debug!(user_id, %timeframe, timeout_ms = timeout.as_millis() as u64, "cold pattern query timed out");
                None
            }
        }
    }

    /// Answer a cluster query from the latest published view.
    pub async fn cluster_query(&self, query: &ClusterQuery) -> Result<ClusterQueryResponse, ReverieError> {
        require_user(&query.user_id)?;
        match self.cluster_view(&query.user_id).await? {
            Some(view) => Ok(query::cluster_response(&view, self.inner.config.sweep.emergent_theme_strength)),
            None => Ok(ClusterQueryResponse::default()),
        }
    }

    /// The latest published cluster view, or `None` for a user with no
    /// stored memories.
    pub async fn cluster_view(&self, user_id: &str) -> Result<Option<Arc<ClusterView>>, ReverieError> {
        if !self.is_known(user_id).await? {
            return Ok(None);
        }
        Ok(Some(self.handle(user_id).await?.view()))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────

    /// Tick, merge and heal every stored user's clusters at `now`, then
    /// refresh every committed sweep.
    pub async fn maintain_all(&self, now: DateTime<Utc>) -> Result<Vec<(String, MaintenanceReport)>, ReverieError> {
        let users = blocking(&self.inner.store, |s| s.users()).await?;
        let mut reports = Vec::with_capacity(users.len());
        for user_id in users {
            match self.handle(&user_id).await?.maintain(now).await {
                Ok(report) => reports.push((user_id, report)),
                Err(e) => warn!(%user_id, error = %e, "maintenance failed"),
            }
        }
        for (user_id, timeframe) in self.inner.sweeps.committed_slots() {
            self.start_sweep(&user_id, timeframe, now);
        }
        Ok(reports)
    }

    /// Run [`maintain_all`][Self::maintain_all] every
    /// `maintenance_interval_secs` until `shutdown` turns `true`.
    pub fn spawn_maintenance(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let engine = self.clone();
        let period = self.inner.config.maintenance_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = engine.maintain_all(Utc::now()).await {
                            warn!(error = %e, "scheduled maintenance failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("maintenance scheduler stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}

struct LoadedUser {
    engine: UserClusters,
    issues: Vec<ReverieError>,
    replayed: usize,
    released: usize,
}

/// Restore `user_id` from its persisted clusters, then cluster every live
/// memory that is neither held by a cluster nor released by pruning.  Only
/// clusters the load changed are written back.
fn load_clusters(store: &MemoryStore, user_id: &str, config: ClusterConfig) -> Result<LoadedUser, ReverieError> {
    let persisted = store.load_clusters_for_user(user_id)?;
    let released = store.released_ids_for_user(user_id)?;
    let memories = store.stream_since(user_id, None).collect::<Result<Vec<_>, _>>()?;

    let persisted_ids: Vec<Uuid> = persisted.iter().map(|c| c.id).collect();
    let (mut engine, issues) = if persisted.is_empty() {
        (UserClusters::new(user_id, config), Vec::new())
    } else {
        UserClusters::restore(user_id, config, persisted, &memories)
    };

    let mut replayed = 0usize;
    let mut touched = HashSet::new();
    let mut removed = Vec::new();
    for memory in &memories {
        if engine.cluster_of(&memory.id).is_some() || released.contains(&memory.id) {
            continue;
        }
        let outcome = engine.assign(memory)?;
        touched.extend(outcome.touched);
        removed.extend(outcome.removed);
        replayed += 1;
    }

    let healed = !issues.is_empty();
    let clusters = engine.clusters();
    let live: HashSet<Uuid> = clusters.iter().map(|c| c.id).collect();
    for cluster in clusters.iter().filter(|c| healed || touched.contains(&c.id)) {
        store.upsert_cluster(cluster)?;
    }
    for id in persisted_ids.into_iter().chain(removed).filter(|id| !live.contains(id)) {
        store.delete_cluster(id)?;
    }
    Ok(LoadedUser {
        engine,
        issues,
        replayed,
        released: released.len(),
    })
}

fn require_user(user_id: &str) -> Result<(), ReverieError> {
    if user_id.trim().is_empty() {
        return Err(ReverieError::validation("userId must not be empty"));
    }
    Ok(())
}

async fn enrich(enricher: &Arc<dyn Enricher>, raw: &RawMemory) -> Result<Memory, ReverieError> {
    let enricher = Arc::clone(enricher);
    let mut raw = raw.clone();
    let enrichment = {
        let raw = raw.clone();
        tokio::task::spawn_blocking(move || enricher.enrich(&raw))
            .await
            .map_err(|e| ReverieError::Channel(format!("enrichment task failed: {e}")))??
    };
    if raw.dominant_emotion.is_none() {
        raw.dominant_emotion = enrichment.dominant_emotion;
    }
    Ok(raw.into_memory(enrichment.embedding, enrichment.valence))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use reverie_types::{PhaseTag, SourceType};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::oneshot;

    use crate::retry::{Enrichment, RetryPolicy};

    fn config() -> EngineConfig {
        EngineConfig {
            dimensions: 2,
            ..EngineConfig::default()
        }
    }

    fn engine() -> Engine {
        let store = Arc::new(MemoryStore::open_in_memory(2).unwrap());
        Engine::new(store, config()).unwrap()
    }

    fn memory(id: &str, user: &str, ts: DateTime<Utc>, embedding: Vec<f32>, valence: f32, content: &str) -> Memory {
        Memory {
            id: id.to_string(),
            user_id: user.to_string(),
            content: content.to_string(),
            embedding,
            timestamp: ts,
            emotional_valence: valence,
            dominant_emotion: "mixed".to_string(),
            phase_tag: PhaseTag::Expansion,
            source_type: SourceType::Journal,
            supersedes: None,
        }
    }

    fn raw(id: &str) -> RawMemory {
        RawMemory {
            id: id.to_string(),
            user_id: "u1".to_string(),
            content: "Called my sister".to_string(),
            timestamp: Utc::now(),
            embedding: None,
            emotional_valence: None,
            dominant_emotion: None,
            phase_tag: PhaseTag::Renewal,
            source_type: SourceType::Chat,
            supersedes: None,
        }
    }

    /// Fails with `DependencyUnavailable` for the first `failures` calls.
    struct FlakyEnricher {
        failures: u32,
        calls: AtomicU32,
    }

    impl Enricher for FlakyEnricher {
        fn enrich(&self, _raw: &RawMemory) -> Result<Enrichment, ReverieError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(ReverieError::DependencyUnavailable("embedding service down".into()));
            }
            Ok(Enrichment {
                embedding: vec![0.6, 0.8],
                valence: 0.3,
                dominant_emotion: Some("warmth".to_string()),
            })
        }
    }

    fn flaky_engine(failures: u32, max_attempts: u32) -> Engine {
        let store = Arc::new(MemoryStore::open_in_memory(2).unwrap());
        let config = EngineConfig {
            retry: RetryPolicy {
                base_delay_ms: 10,
                max_delay_ms: 20,
                max_attempts,
            },
            ..config()
        };
        let enricher = Arc::new(FlakyEnricher {
            failures,
            calls: AtomicU32::new(0),
        });
        Engine::with_enricher(store, config, enricher).unwrap()
    }

    async fn wait_for_event(
        rx: &mut broadcast::Receiver<EngineEvent>,
        pred: impl Fn(&EngineEvent) -> bool,
    ) -> EngineEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let store = Arc::new(MemoryStore::open_in_memory(3).unwrap());
        assert!(matches!(
            Engine::new(store, config()),
            Err(ReverieError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn unknown_user_gets_empty_responses() {
        let engine = engine();
        let patterns = engine
            .pattern_query(&PatternQuery {
                user_id: "nobody".into(),
                pattern: "emotional_cycles".into(),
                timeframe: "week".into(),
            })
            .await
            .unwrap();
        assert!(patterns.is_empty());

        let clusters = engine.cluster_query(&ClusterQuery { user_id: "nobody".into() }).await.unwrap();
        assert!(clusters.clusters.is_empty());
        assert!(clusters.emergent_themes.is_empty());
        assert!(engine.users().is_empty());
    }

    #[tokio::test]
    async fn bad_queries_are_validation_errors() {
        let engine = engine();
        let bad_pattern = PatternQuery {
            user_id: "u1".into(),
            pattern: "horoscopes".into(),
            timeframe: "all".into(),
        };
        assert!(matches!(engine.pattern_query(&bad_pattern).await, Err(ReverieError::Validation(_))));
        let bad_timeframe = PatternQuery {
            pattern: "breakthroughs".into(),
            timeframe: "decade".into(),
            ..bad_pattern.clone()
        };
        assert!(matches!(engine.pattern_query(&bad_timeframe).await, Err(ReverieError::Validation(_))));
        let no_user = ClusterQuery { user_id: " ".into() };
        assert!(matches!(engine.cluster_query(&no_user).await, Err(ReverieError::Validation(_))));
    }

    #[tokio::test]
    async fn career_memories_form_one_visible_cluster() {
        let engine = engine();
        let now = Utc::now();
        let entries = [
            ("m1", [1.0, 0.0], "Interview for the senior career role went well"),
            ("m2", [0.97, 0.24], "Career mentor meeting about the promotion"),
            ("m3", [0.95, 0.31], "Negotiated the offer for my new career step"),
        ];
        for (i, (id, e, text)) in entries.iter().enumerate() {
            engine
                .ingest(memory(id, "u1", now - ChronoDuration::hours(3 - i as i64), e.to_vec(), 0.6, text))
                .await
                .unwrap();
        }
        let resp = engine.cluster_query(&ClusterQuery { user_id: "u1".into() }).await.unwrap();
        assert_eq!(resp.clusters.len(), 1);
        assert!(resp.clusters[0].concepts.contains(&"career".to_string()));
        assert_eq!(resp.clusters[0].phase_context, "expansion");
        assert!(resp.emergent_themes.contains(&"career".to_string()));
    }

    #[tokio::test]
    async fn alternating_mood_surfaces_as_cycles() {
        let engine = engine();
        let start = Utc::now() - ChronoDuration::days(6);
        let valences = [0.7, 0.6, -0.6, -0.7, 0.7, 0.6, -0.6, -0.7, 0.6, 0.7];
        for (i, v) in valences.iter().enumerate() {
            let ts = start + ChronoDuration::hours(12 * i as i64);
            let m = memory(&format!("m{i:02}"), "u1", ts, vec![1.0, 0.0], *v, "Long day at the studio");
            engine.ingest(m).await.unwrap();
        }
        let resp = engine
            .pattern_query(&PatternQuery {
                user_id: "u1".into(),
                pattern: "emotional_cycles".into(),
                timeframe: "week".into(),
            })
            .await
            .unwrap();
        assert!(!resp.patterns.is_empty());
        assert!(resp.patterns[0].frequency >= 4);
        assert!(!resp.memories.is_empty());
        assert!(resp.memories.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn second_sweep_replaces_the_first() {
        let engine = engine();
        engine
            .ingest(memory("m1", "u1", Utc::now(), vec![1.0, 0.0], 0.1, "Quiet evening"))
            .await
            .unwrap();
        let first = engine.sweep_now("u1", Timeframe::Week).await.unwrap().unwrap();
        let second = engine.sweep_now("u1", Timeframe::Week).await.unwrap().unwrap();
        assert!(second.ticket > first.ticket);
        let latest = engine.inner.sweeps.latest("u1", Timeframe::Week).unwrap();
        assert_eq!(latest.ticket, second.ticket);
    }

    #[tokio::test]
    async fn concurrent_sweeps_keep_only_the_last_request() {
        let engine = engine();
        engine
            .ingest(memory("m1", "u1", Utc::now(), vec![1.0, 0.0], 0.1, "Quiet evening"))
            .await
            .unwrap();
        // Neither task has been polled yet on the test's single thread.
        let (first, first_task) = engine.start_sweep("u1", Timeframe::Week, Utc::now());
        let (second, second_task) = engine.start_sweep("u1", Timeframe::Week, Utc::now());
        assert!(second > first);

        assert!(first_task.await.unwrap_err().is_cancelled());
        second_task.await.unwrap().unwrap();
        let latest = engine.inner.sweeps.latest("u1", Timeframe::Week).unwrap();
        assert_eq!(latest.ticket, second);
    }

    #[tokio::test]
    async fn loading_one_user_does_not_block_another() {
        let engine = engine();
        let now = Utc::now();
        engine
            .ingest(memory("s1", "small", now, vec![1.0, 0.0], 0.2, "Short note"))
            .await
            .unwrap();

        // Hold "big" in the middle of its load.
        let (started_tx, started_rx) = oneshot::channel();
        let slot = engine.slot("big");
        let loading = tokio::spawn(async move {
            slot.get_or_try_init(|| async move {
                let _ = started_tx.send(());
                std::future::pending::<Result<UserHandle, ReverieError>>().await
            })
            .await
            .map(|_| ())
        });
        started_rx.await.unwrap();

        let within = Duration::from_secs(5);
        let clusters = tokio::time::timeout(within, engine.cluster_query(&ClusterQuery { user_id: "small".into() }))
            .await
            .expect("cluster query waited on another user's load")
            .unwrap();
        assert_eq!(clusters.clusters.len(), 1);
        let receipt = tokio::time::timeout(
            within,
            engine.ingest(memory("s2", "small", now, vec![1.0, 0.0], 0.2, "Another note")),
        )
        .await
        .expect("ingest waited on another user's load")
        .unwrap();
        assert!(!receipt.duplicate);
        let query = PatternQuery {
            user_id: "small".into(),
            pattern: "breakthroughs".into(),
            timeframe: "all".into(),
        };
        tokio::time::timeout(within, engine.pattern_query(&query))
            .await
            .expect("pattern query waited on another user's load")
            .unwrap();

        assert!(!engine.is_known("big").await.unwrap());
        loading.abort();
    }

    #[tokio::test]
    async fn cluster_reads_do_not_wait_for_ingestion() {
        let engine = engine();
        engine
            .ingest(memory("m0", "u1", Utc::now(), vec![1.0, 0.0], 0.1, "Warm up"))
            .await
            .unwrap();
        let writer = {
            let engine = engine.clone();
            tokio::spawn(async move {
                for i in 1..40 {
                    let m = memory(&format!("m{i}"), "u1", Utc::now(), vec![1.0, 0.0], 0.1, "Steady work");
                    engine.ingest(m).await.unwrap();
                }
            })
        };
        let view = engine.cluster_view("u1").await.unwrap().unwrap();
        assert!(view.version >= 1);
        writer.await.unwrap();
        let view = engine.cluster_view("u1").await.unwrap().unwrap();
        assert_eq!(view.clusters[0].cluster.member_ids.len(), 40);
    }

    #[tokio::test]
    async fn restart_restores_persisted_clusters() {
        let store = Arc::new(MemoryStore::open_in_memory(2).unwrap());
        let now = Utc::now();
        let cluster_id = {
            let engine = Engine::new(Arc::clone(&store), config()).unwrap();
            let receipt = engine
                .ingest(memory("m1", "u1", now, vec![1.0, 0.0], 0.2, "Garden notes"))
                .await
                .unwrap();
            receipt.cluster_id.unwrap()
        };
        let engine = Engine::new(store, config()).unwrap();
        let view = engine.cluster_view("u1").await.unwrap().unwrap();
        assert_eq!(view.clusters.len(), 1);
        assert_eq!(view.clusters[0].cluster.id, cluster_id);
    }

    #[tokio::test]
    async fn restart_keeps_pruned_memories_released() {
        let store = Arc::new(MemoryStore::open_in_memory(2).unwrap());
        let now = Utc::now();
        {
            let engine = Engine::new(Arc::clone(&store), config()).unwrap();
            engine
                .ingest(memory("m1", "u1", now - ChronoDuration::days(90), vec![1.0, 0.0], 0.1, "Old garden plans"))
                .await
                .unwrap();
            engine
                .ingest(memory("m2", "u1", now, vec![0.0, 1.0], 0.1, "Budget review"))
                .await
                .unwrap();
            let reports = engine.maintain_all(now).await.unwrap();
            assert_eq!(reports[0].1.tick.pruned.len(), 1);
            assert_eq!(engine.cluster_view("u1").await.unwrap().unwrap().clusters.len(), 1);
        }

        let engine = Engine::new(Arc::clone(&store), config()).unwrap();
        let view = engine.cluster_view("u1").await.unwrap().unwrap();
        assert_eq!(view.clusters.len(), 1);
        assert_eq!(view.clusters[0].cluster.member_ids, vec!["m2".to_string()]);
        assert_eq!(store.load_clusters_for_user("u1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fully_pruned_user_is_not_rebuilt_on_restart() {
        let store = Arc::new(MemoryStore::open_in_memory(2).unwrap());
        let now = Utc::now();
        {
            let engine = Engine::new(Arc::clone(&store), config()).unwrap();
            engine
                .ingest(memory("m1", "u1", now - ChronoDuration::days(90), vec![1.0, 0.0], 0.1, "Old garden plans"))
                .await
                .unwrap();
            engine.maintain_all(now).await.unwrap();
        }
        let engine = Engine::new(Arc::clone(&store), config()).unwrap();
        let view = engine.cluster_view("u1").await.unwrap().unwrap();
        assert!(view.clusters.is_empty());
        assert!(store.load_clusters_for_user("u1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn ready_raw_records_skip_enrichment() {
        let engine = engine();
        let mut record = raw("r1");
        record.embedding = Some(vec![1.0, 0.0]);
        record.emotional_valence = Some(0.4);
        let status = engine.ingest_raw(record).await.unwrap();
        assert!(matches!(status, IngestStatus::Ingested(_)));

        let err = engine.ingest_raw(raw("r2")).await.unwrap_err();
        assert!(matches!(err, ReverieError::Validation(_)));
    }

    #[tokio::test]
    async fn unavailable_enrichment_is_retried() {
        let engine = flaky_engine(2, 8);
        let mut rx = engine.subscribe();
        let status = engine.ingest_raw(raw("r1")).await.unwrap();
        assert!(matches!(status, IngestStatus::Deferred { .. }));
        assert_eq!(engine.pending_retries().for_user("u1"), 1);

        let event = wait_for_event(&mut rx, |e| matches!(e, EngineEvent::MemoryIngested { .. })).await;
        assert_eq!(event.user_id(), "u1");
        let stored = engine.store().get("r1").unwrap().unwrap();
        assert_eq!(stored.dominant_emotion, "warmth");
        // The counter is released right after the final ingest returns.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.pending_retries().total(), 0);
    }

    #[tokio::test]
    async fn retries_stop_after_max_attempts() {
        let engine = flaky_engine(u32::MAX, 3);
        let mut rx = engine.subscribe();
        engine.ingest_raw(raw("r1")).await.unwrap();
        let event = wait_for_event(&mut rx, |e| matches!(e, EngineEvent::EnrichmentAbandoned { .. })).await;
        assert_eq!(event.user_id(), "u1");
        assert!(engine.store().get("r1").unwrap().is_none());
    }

    #[tokio::test]
    async fn maintenance_covers_every_stored_user() {
        let engine = engine();
        let now = Utc::now();
        engine.ingest(memory("a1", "alice", now, vec![1.0, 0.0], 0.1, "Alice notes")).await.unwrap();
        engine.ingest(memory("b1", "bob", now, vec![0.0, 1.0], 0.1, "Bob notes")).await.unwrap();
        let reports = engine.maintain_all(now + ChronoDuration::days(90)).await.unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|(_, r)| r.tick.pruned.len() == 1));
    }

    #[tokio::test]
    async fn maintenance_scheduler_stops_on_shutdown() {
        let engine = engine();
        let (tx, rx) = watch::channel(false);
        let task = engine.spawn_maintenance(rx);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}

//! `reverie-runtime` – The Engine Room.
//!
//! Wires the store, the clustering engine and the pattern reader into a
//! concurrent service and answers the two read contracts.
//!
//! # Modules
//!
//! - [`engine`] – [`Engine`][engine::Engine]: ingestion, lazy per-user
//!   actors, sweeps, the pattern and cluster queries, and the maintenance
//!   scheduler.
//! - [`actor`] – [`UserActor`][actor::UserActor]: one task per user owning
//!   its [`UserClusters`][reverie_cluster::UserClusters].  Every committed
//!   mutation is published as an immutable
//!   [`ClusterView`][actor::ClusterView] on a `watch` channel, so readers
//!   never wait for writers.
//! - [`sweep`] – [`SweepBoard`][sweep::SweepBoard]: ticketed,
//!   last-sweep-wins coordination of pattern detection runs.
//! - [`query`] – pure builders of
//!   [`PatternQueryResponse`][reverie_types::PatternQueryResponse] and
//!   [`ClusterQueryResponse`][reverie_types::ClusterQueryResponse].
//! - [`retry`] – the [`Enricher`][retry::Enricher] seam and the exponential
//!   backoff [`RetryPolicy`][retry::RetryPolicy].
//! - [`events`] – [`EngineEvent`][events::EngineEvent] broadcast on an
//!   [`EventBus`][events::EventBus].
//! - [`config`] – [`EngineConfig`][config::EngineConfig], aggregating the
//!   clustering and insight thresholds.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: console
//!   logging plus optional OTLP span export when
//!   `OTEL_EXPORTER_OTLP_ENDPOINT` is set.

pub mod actor;
pub mod config;
pub mod engine;
pub mod events;
pub mod query;
pub mod retry;
pub mod sweep;
pub mod telemetry;

pub use actor::{ClusterView, IngestReceipt, MaintenanceReport, UserHandle};
pub use config::{EngineConfig, SweepConfig};
pub use engine::{Engine, IngestStatus};
pub use events::{EngineEvent, EventBus};
pub use retry::{Enricher, Enrichment, RetryPolicy};
pub use sweep::{SweepBoard, SweepResult};
pub use telemetry::{TracerProviderGuard, init_tracing};

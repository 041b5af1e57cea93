//! Runtime configuration.
//!
//! [`EngineConfig`] aggregates the clustering and insight thresholds with the
//! knobs that only the runtime cares about (sweep caching, rate limiting,
//! retry backoff, maintenance cadence).  The CLI builds one from its TOML
//! config file.

use std::time::Duration;

use reverie_cluster::ClusterConfig;
use reverie_insight::InsightConfig;
use reverie_types::ReverieError;
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// How long a cold pattern query waits for the sweep it triggered.
    pub cold_query_timeout_ms: u64,
    /// Cached sweep results older than this are refreshed in the background.
    pub stale_after_secs: u64,
    /// Query-triggered sweeps allowed per user per minute.
    pub max_sweeps_per_minute: u32,
    /// Cap on `memories` in a pattern query response.
    pub max_response_memories: usize,
    /// Active clusters above this strength contribute emergent themes.
    pub emergent_theme_strength: f32,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            cold_query_timeout_ms: 2_000,
            stale_after_secs: 300,
            max_sweeps_per_minute: 6,
            max_response_memories: 50,
            emergent_theme_strength: 0.5,
        }
    }
}

impl SweepConfig {
    pub fn cold_query_timeout(&self) -> Duration {
        Duration::from_millis(self.cold_query_timeout_ms)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Embedding length every memory must have.
    pub dimensions: usize,
    pub cluster: ClusterConfig,
    pub insight: InsightConfig,
    pub sweep: SweepConfig,
    pub retry: RetryPolicy,
    /// Period of the tick / merge / heal / re-sweep cycle.
    pub maintenance_interval_secs: u64,
    /// Capacity of each per-user command queue.
    pub actor_queue: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dimensions: 768,
            cluster: ClusterConfig::default(),
            insight: InsightConfig::default(),
            sweep: SweepConfig::default(),
            retry: RetryPolicy::default(),
            maintenance_interval_secs: 3_600,
            actor_queue: 64,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ReverieError> {
        if self.dimensions == 0 {
            return Err(ReverieError::validation("dimensions must be positive"));
        }
        if self.actor_queue == 0 {
            return Err(ReverieError::validation("actor_queue must be positive"));
        }
        self.cluster.validate()?;
        self.insight.validate()?;
        self.retry.validate()
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }
}

//! Enrichment with exponential backoff.
//!
//! Records that arrive without an embedding or valence are passed to an
//! [`Enricher`] (the embedding / emotion-tagging service).  When it reports
//! [`ReverieError::DependencyUnavailable`] the record is parked and retried
//! after `base · 2^(attempt − 1)`, capped at `max_delay`, for at most
//! `max_attempts` attempts.  Each parked record is its own task, so one
//! user's backlog never delays another user's ingestion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reverie_types::{RawMemory, ReverieError};
use serde::{Deserialize, Serialize};

/// What the upstream service produces for a piece of text.
#[derive(Debug, Clone, PartialEq)]
pub struct Enrichment {
    pub embedding: Vec<f32>,
    pub valence: f32,
    pub dominant_emotion: Option<String>,
}

/// Embedding / emotion-tagging collaborator.
///
/// Implementations may block; the runtime calls them on the blocking pool.
pub trait Enricher: Send + Sync {
    fn enrich(&self, raw: &RawMemory) -> Result<Enrichment, ReverieError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 300_000,
            max_attempts: 8,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), ReverieError> {
        if self.base_delay_ms == 0 || self.max_delay_ms < self.base_delay_ms {
            return Err(ReverieError::validation(
                "retry delays must be positive with max_delay_ms >= base_delay_ms",
            ));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let ms = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms.min(self.max_delay_ms))
    }

    /// `true` while another attempt is allowed after `attempt` failures.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Parked records per user, for observability and tests.
#[derive(Debug, Clone, Default)]
pub struct PendingRetries {
    inner: Arc<Mutex<HashMap<String, usize>>>,
}

impl PendingRetries {
    pub fn park(&self, user_id: &str) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *map.entry(user_id.to_string()).or_insert(0) += 1;
    }

    pub fn release(&self, user_id: &str) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(n) = map.get_mut(user_id) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                map.remove(user_id);
            }
        }
    }

    pub fn for_user(&self, user_id: &str) -> usize {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.get(user_id).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.values().sum()
    }
}

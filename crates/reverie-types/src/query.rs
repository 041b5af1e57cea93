//! Wire shapes of the two read contracts.
//!
//! Requests keep `pattern` and `timeframe` as plain strings so that an
//! unknown value reaches the query layer and is reported as a validation
//! error instead of failing deserialisation of the whole frame.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::memory::Memory;

/// `{ userId, pattern, timeframe }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PatternQuery {
    pub user_id: String,
    pub pattern: String,
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
}

fn default_timeframe() -> String {
    "all".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PatternSummary {
    pub pattern: String,
    pub frequency: usize,
    pub insights: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PredictionSummary {
    pub prediction: String,
    pub confidence: f32,
}

/// `{ memories, patterns, predictions }` – always well-formed, possibly empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PatternQueryResponse {
    pub memories: Vec<Memory>,
    pub patterns: Vec<PatternSummary>,
    pub predictions: Vec<PredictionSummary>,
}

impl PatternQueryResponse {
    pub fn is_empty(&self) -> bool {
        self.memories.is_empty() && self.patterns.is_empty() && self.predictions.is_empty()
    }
}

/// `{ userId }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterQuery {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSummary {
    pub id: String,
    pub concepts: Vec<String>,
    pub emotional_context: f32,
    pub phase_context: String,
    pub strength_score: f32,
}

/// `{ clusters, emergentThemes }`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterQueryResponse {
    pub clusters: Vec<ClusterSummary>,
    pub emergent_themes: Vec<String>,
}

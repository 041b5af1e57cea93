//! The atomic reflective record and the shape it has before enrichment.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ReverieError;

// ─────────────────────────────────────────────────────────────────────────────
// PhaseTag / SourceType
// ─────────────────────────────────────────────────────────────────────────────

/// Life-phase annotation attached upstream to every memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PhaseTag {
    Expansion,
    Contraction,
    Renewal,
    #[default]
    Unknown,
}

impl PhaseTag {
    pub const ALL: [PhaseTag; 4] = [
        PhaseTag::Expansion,
        PhaseTag::Contraction,
        PhaseTag::Renewal,
        PhaseTag::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseTag::Expansion => "expansion",
            PhaseTag::Contraction => "contraction",
            PhaseTag::Renewal => "renewal",
            PhaseTag::Unknown => "unknown",
        }
    }

    /// Parse a stored label.  Unrecognised labels map to
    /// [`PhaseTag::Unknown`].
    pub fn from_label(s: &str) -> Self {
        match s {
            "expansion" => PhaseTag::Expansion,
            "contraction" => PhaseTag::Contraction,
            "renewal" => PhaseTag::Renewal,
            _ => PhaseTag::Unknown,
        }
    }
}

impl std::fmt::Display for PhaseTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a memory was captured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum SourceType {
    #[default]
    #[serde(rename = "chat")]
    Chat,
    #[serde(rename = "journal")]
    Journal,
    #[serde(rename = "check-in", alias = "check_in", alias = "checkin")]
    CheckIn,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Chat => "chat",
            SourceType::Journal => "journal",
            SourceType::CheckIn => "check-in",
        }
    }

    pub fn from_label(s: &str) -> Option<Self> {
        match s {
            "chat" => Some(SourceType::Chat),
            "journal" => Some(SourceType::Journal),
            "check-in" | "check_in" | "checkin" => Some(SourceType::CheckIn),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory
// ─────────────────────────────────────────────────────────────────────────────

/// One reflective unit: a chat turn, journal entry or mood check-in, already
/// embedded and emotionally tagged.
///
/// The `id` is assigned by the caller and doubles as the idempotency key of
/// the memory store.  A memory is never deleted; a later record whose
/// `supersedes` names it replaces it in every derived view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    pub id: String,
    pub user_id: String,
    pub content: String,
    /// Fixed-length embedding.  Immutable once stored.
    pub embedding: Vec<f32>,
    pub timestamp: DateTime<Utc>,
    /// Emotional polarity in `[-1.0, 1.0]`.
    pub emotional_valence: f32,
    pub dominant_emotion: String,
    #[serde(default)]
    pub phase_tag: PhaseTag,
    #[serde(default)]
    pub source_type: SourceType,
    /// Id of the memory this record corrects, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<String>,
}

impl Memory {
    /// Check the structural invariants of a record against the configured
    /// embedding dimension.
    pub fn validate(&self, dimensions: usize) -> Result<(), ReverieError> {
        if self.id.trim().is_empty() {
            return Err(ReverieError::validation("memory id must not be empty"));
        }
        if self.user_id.trim().is_empty() {
            return Err(ReverieError::validation("userId must not be empty"));
        }
        if self.embedding.len() != dimensions {
            return Err(ReverieError::validation(format!(
                "embedding has {} dimensions, expected {dimensions}",
                self.embedding.len()
            )));
        }
        if self.embedding.iter().any(|x| !x.is_finite()) {
            return Err(ReverieError::validation("embedding contains non-finite values"));
        }
        if !(-1.0..=1.0).contains(&self.emotional_valence) {
            return Err(ReverieError::validation(format!(
                "emotional valence {} outside [-1, 1]",
                self.emotional_valence
            )));
        }
        if self.supersedes.as_deref() == Some(self.id.as_str()) {
            return Err(ReverieError::validation("a memory cannot supersede itself"));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RawMemory
// ─────────────────────────────────────────────────────────────────────────────

/// A record as it arrives from a client, before the embedding service has
/// run.  Records that already carry an embedding skip enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMemory {
    pub id: String,
    pub user_id: String,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub emotional_valence: Option<f32>,
    #[serde(default)]
    pub dominant_emotion: Option<String>,
    #[serde(default)]
    pub phase_tag: PhaseTag,
    #[serde(default)]
    pub source_type: SourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<String>,
}

impl RawMemory {
    /// Combine the raw record with an embedding and valence produced
    /// upstream.  Values already present on the record win.
    pub fn into_memory(self, embedding: Vec<f32>, valence: f32) -> Memory {
        Memory {
            id: self.id,
            user_id: self.user_id,
            content: self.content,
            embedding: self.embedding.unwrap_or(embedding),
            timestamp: self.timestamp,
            emotional_valence: self.emotional_valence.unwrap_or(valence),
            dominant_emotion: self
                .dominant_emotion
                .unwrap_or_else(|| "neutral".to_string()),
            phase_tag: self.phase_tag,
            source_type: self.source_type,
            supersedes: self.supersedes,
        }
    }

    /// Returns the finished [`Memory`] when no enrichment is needed.
    pub fn ready(&self) -> Option<Memory> {
        match (&self.embedding, self.emotional_valence) {
            (Some(embedding), Some(valence)) => {
                Some(self.clone().into_memory(embedding.clone(), valence))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory(embedding: Vec<f32>, valence: f32) -> Memory {
        Memory {
            id: "m-1".to_string(),
            user_id: "u-1".to_string(),
            content: "Started the new job today".to_string(),
            embedding,
            timestamp: Utc::now(),
            emotional_valence: valence,
            dominant_emotion: "joy".to_string(),
            phase_tag: PhaseTag::Expansion,
            source_type: SourceType::Journal,
            supersedes: None,
        }
    }

    #[test]
    fn validate_accepts_well_formed_memory() {
        assert!(memory(vec![0.1, 0.2, 0.3], 0.5).validate(3).is_ok());
    }

    #[test]
    fn validate_rejects_wrong_embedding_length() {
        let err = memory(vec![0.1, 0.2], 0.5).validate(3).unwrap_err();
        assert!(matches!(err, ReverieError::Validation(_)));
    }

    #[test]
    fn validate_rejects_out_of_range_valence() {
        let err = memory(vec![0.1, 0.2, 0.3], 1.5).validate(3).unwrap_err();
        assert!(matches!(err, ReverieError::Validation(_)));
    }

    #[test]
    fn validate_rejects_missing_user() {
        let mut m = memory(vec![0.1, 0.2, 0.3], 0.0);
        m.user_id = "  ".to_string();
        assert!(m.validate(3).is_err());
    }

    #[test]
    fn source_type_uses_kebab_case_on_the_wire() {
        let json = serde_json::to_string(&SourceType::CheckIn).unwrap();
        assert_eq!(json, "\"check-in\"");
        let back: SourceType = serde_json::from_str("\"check_in\"").unwrap();
        assert_eq!(back, SourceType::CheckIn);
    }

    #[test]
    fn memory_serializes_camel_case() {
        let json = serde_json::to_value(memory(vec![1.0], 0.2)).unwrap();
        assert!(json.get("userId").is_some());
        assert!(json.get("emotionalValence").is_some());
        assert!(json.get("supersedes").is_none());
    }

    #[test]
    fn raw_memory_ready_only_when_fully_tagged() {
        let raw: RawMemory = serde_json::from_str(
            r#"{"id":"r1","userId":"u1","content":"hello","embedding":[1.0,0.0]}"#,
        )
        .unwrap();
        assert!(raw.ready().is_none());

        let mut tagged = raw.clone();
        tagged.emotional_valence = Some(-0.3);
        let m = tagged.ready().unwrap();
        assert_eq!(m.embedding, vec![1.0, 0.0]);
        assert_eq!(m.dominant_emotion, "neutral");
    }

    #[test]
    fn phase_tag_label_roundtrip() {
        for tag in PhaseTag::ALL {
            assert_eq!(PhaseTag::from_label(tag.as_str()), tag);
        }
        assert_eq!(PhaseTag::from_label("sideways"), PhaseTag::Unknown);
    }
}

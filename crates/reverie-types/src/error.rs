use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error taxonomy shared by every Reverie crate.
///
/// "Nothing found" is deliberately absent: empty users and empty timeframes
/// are answered with empty collections.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReverieError {
    /// Malformed input (bad embedding length, unknown pattern type, missing
    /// user id).  Surfaced to the caller, never retried.
    #[error("Validation Error: {0}")]
    Validation(String),

    /// The upstream embedding / emotion-tagging service could not be reached.
    #[error("Dependency Unavailable: {0}")]
    DependencyUnavailable(String),

    /// A cluster's running sum / count no longer matches its members.
    #[error("Clustering Inconsistency in {cluster_id}: {details}")]
    ClusteringInconsistency { cluster_id: String, details: String },

    #[error("Storage Error: {0}")]
    Storage(String),

    /// A per-user actor or background task is gone (usually shutdown).
    #[error("Channel Error: {0}")]
    Channel(String),
}

impl ReverieError {
    /// Shorthand for [`ReverieError::Validation`].
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// `true` for failures that the ingestion retry queue should re-attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DependencyUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_dependency_errors_are_retryable() {
        assert!(ReverieError::DependencyUnavailable("ollama down".into()).is_retryable());
        assert!(!ReverieError::validation("bad").is_retryable());
        assert!(!ReverieError::Storage("disk".into()).is_retryable());
    }

    #[test]
    fn display_includes_cluster_id() {
        let err = ReverieError::ClusteringInconsistency {
            cluster_id: "c-1".to_string(),
            details: "count mismatch".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("c-1"));
        assert!(text.contains("count mismatch"));
    }

    #[test]
    fn error_serialization_roundtrip() {
        let err = ReverieError::validation("unknown pattern type 'x'");
        let json = serde_json::to_string(&err).unwrap();
        let back: ReverieError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }
}

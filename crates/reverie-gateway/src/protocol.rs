//! Wire protocol of the gateway.
//!
//! Every text frame carries one JSON object tagged by `type`.
//!
//! | Request `type` | Body | Response `type` |
//! |---|---|---|
//! | `pattern_query` | `{ userId, pattern, timeframe }` | `pattern_query_result` |
//! | `cluster_query` | `{ userId }` | `cluster_query_result` |
//! | `subscribe` | `{ userId }` | `subscribed`, then `event` frames |
//! | `schema` | – | `schema` |
//!
//! Failures are answered with `{ "type": "error", "kind", "message" }`.

use reverie_runtime::{Engine, EngineEvent};
use reverie_types::{
    ClusterQuery, ClusterQueryResponse, Memory, PatternQuery, PatternQueryResponse,
    ReverieError,
};
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    PatternQuery(PatternQuery),
    ClusterQuery(ClusterQuery),
    Subscribe {
        #[serde(rename = "userId")]
        user_id: String,
    },
    Schema,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    PatternQueryResult(PatternQueryResponse),
    ClusterQueryResult(ClusterQueryResponse),
    Subscribed {
        #[serde(rename = "userId")]
        user_id: String,
    },
    Schema { schemas: Value },
    Event { event: EngineEvent },
    Error { kind: String, message: String },
}

impl Response {
    pub fn error(kind: &str, message: impl Into<String>) -> Self {
        Response::Error {
            kind: kind.to_string(),
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","kind":"serialization","message":"{e}"}}"#)
        })
    }
}

impl From<ReverieError> for Response {
    fn from(err: ReverieError) -> Self {
        Response::error(error_kind(&err), err.to_string())
    }
}

/// Stable snake_case name of an error variant.
pub fn error_kind(err: &ReverieError) -> &'static str {
    match err {
        ReverieError::Validation(_) => "validation",
        ReverieError::DependencyUnavailable(_) => "dependency_unavailable",
        ReverieError::ClusteringInconsistency { .. } => "clustering_inconsistency",
        ReverieError::Storage(_) => "storage",
        ReverieError::Channel(_) => "channel",
    }
}

/// JSON Schemas of every wire type, keyed by type name.
pub fn schemas() -> Value {
    fn entry<T: JsonSchema>(map: &mut Map<String, Value>, name: &str) {
        let schema = serde_json::to_value(schema_for!(T)).unwrap_or(Value::Null);
        map.insert(name.to_string(), schema);
    }
    let mut map = Map::new();
    entry::<Request>(&mut map, "Request");
    entry::<PatternQuery>(&mut map, "PatternQuery");
    entry::<PatternQueryResponse>(&mut map, "PatternQueryResponse");
    entry::<ClusterQuery>(&mut map, "ClusterQuery");
    entry::<ClusterQueryResponse>(&mut map, "ClusterQueryResponse");
    entry::<Memory>(&mut map, "Memory");
    Value::Object(map)
}

/// Answer one text frame.
pub async fn handle_request(engine: &Engine, text: &str) -> Response {
    let request: Request = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => return Response::error("invalid_request", e.to_string()),
    };
    debug!(?request, "gateway request");
    match request {
        Request::PatternQuery(q) => match engine.pattern_query(&q).await {
            Ok(resp) => Response::PatternQueryResult(resp),
            Err(e) => e.into(),
        },
        Request::ClusterQuery(q) => match engine.cluster_query(&q).await {
            Ok(resp) => Response::ClusterQueryResult(resp),
            Err(e) => e.into(),
        },
        Request::Subscribe { user_id } if user_id.trim().is_empty() => {
            ReverieError::validation("userId must not be empty").into()
        }
        Request::Subscribe { user_id } => Response::Subscribed { user_id },
        Request::Schema => Response::Schema { schemas: schemas() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use reverie_memory::MemoryStore;
    use reverie_runtime::EngineConfig;
    use reverie_types::{PhaseTag, SourceType};

    fn engine() -> Engine {
        let store = Arc::new(MemoryStore::open_in_memory(2).unwrap());
        Engine::new(
            store,
            EngineConfig {
                dimensions: 2,
                ..EngineConfig::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn requests_are_tagged_by_type() {
        let req: Request =
            serde_json::from_str(r#"{"type":"pattern_query","userId":"u1","pattern":"breakthroughs","timeframe":"month"}"#)
                .unwrap();
        assert_eq!(
            req,
            Request::PatternQuery(PatternQuery {
                user_id: "u1".into(),
                pattern: "breakthroughs".into(),
                timeframe: "month".into(),
            })
        );
        let req: Request = serde_json::from_str(r#"{"type":"subscribe","userId":"u1"}"#).unwrap();
        assert_eq!(req, Request::Subscribe { user_id: "u1".into() });
        let req: Request = serde_json::from_str(r#"{"type":"schema"}"#).unwrap();
        assert_eq!(req, Request::Schema);
    }

    #[test]
    fn responses_carry_their_type() {
        let json: Value =
            serde_json::from_str(&Response::ClusterQueryResult(ClusterQueryResponse::default()).to_json()).unwrap();
        assert_eq!(json["type"], "cluster_query_result");
        assert!(json["emergentThemes"].is_array());

        let json: Value = serde_json::from_str(&Response::from(ReverieError::validation("bad")).to_json()).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["kind"], "validation");
    }

    #[test]
    fn schema_covers_request_and_response_types() {
        let schemas = schemas();
        for name in ["Request", "PatternQuery", "PatternQueryResponse", "ClusterQueryResponse", "Memory"] {
            assert!(schemas.get(name).is_some_and(|s| !s.is_null()), "missing {name}");
        }
        // Records are ingested through the CLI, never over the gateway.
        assert!(schemas.get("RawMemory").is_none());
    }

    #[tokio::test]
    async fn malformed_frames_are_reported() {
        let engine = engine();
        let resp = handle_request(&engine, "not json").await;
        assert!(matches!(resp, Response::Error { ref kind, .. } if kind == "invalid_request"));
        let resp = handle_request(&engine, r#"{"type":"teleport"}"#).await;
        assert!(matches!(resp, Response::Error { ref kind, .. } if kind == "invalid_request"));
    }

    #[tokio::test]
    async fn unknown_pattern_is_a_validation_error() {
        let engine = engine();
        let resp = handle_request(
            &engine,
            r#"{"type":"pattern_query","userId":"u1","pattern":"astrology"}"#,
        )
        .await;
        assert!(matches!(resp, Response::Error { ref kind, .. } if kind == "validation"));
    }

    #[tokio::test]
    async fn cluster_query_reflects_ingested_memories() {
        let engine = engine();
        engine
            .ingest(Memory {
                id: "m1".into(),
                user_id: "u1".into(),
                content: "First pottery class".into(),
                embedding: vec![1.0, 0.0],
                timestamp: Utc::now(),
                emotional_valence: 0.5,
                dominant_emotion: "joy".into(),
                phase_tag: PhaseTag::Renewal,
                source_type: SourceType::CheckIn,
                supersedes: None,
            })
            .await
            .unwrap();
        match handle_request(&engine, r#"{"type":"cluster_query","userId":"u1"}"#).await {
            Response::ClusterQueryResult(resp) => assert_eq!(resp.clusters.len(), 1),
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscribe_requires_a_user() {
        let engine = engine();
        let resp = handle_request(&engine, r#"{"type":"subscribe","userId":""}"#).await;
        assert!(matches!(resp, Response::Error { .. }));
        let resp = handle_request(&engine, r#"{"type":"subscribe","userId":"u1"}"#).await;
        assert_eq!(resp, Response::Subscribed { user_id: "u1".into() });
    }
}

//! Ollama helpers: model discovery and the embedding [`Enricher`].
//!
//! `/api/tags` lists locally downloaded models; `/api/embeddings` turns a
//! record's content into the vector the clustering engine works on.

use std::time::Duration;

use reverie_runtime::{Enricher, Enrichment};
use reverie_types::{RawMemory, ReverieError};
use serde::{Deserialize, Serialize};

/// A single model entry returned by Ollama's `/api/tags` endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct OllamaModel {
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<OllamaModel>,
}

/// Ping the Ollama server and return the list of available models.
pub fn fetch_models(base_url: &str) -> Result<Vec<OllamaModel>, String> {
    let url = format!("{}/api/tags", base_url.trim_end_matches('/'));
    let response = reqwest::blocking::get(&url).map_err(|e| format!("Ollama unreachable at {}: {}", url, e))?;

    if !response.status().is_success() {
        return Err(format!("Ollama returned HTTP {}", response.status()));
    }

    let tags: TagsResponse = response
        .json()
        .map_err(|e| format!("Failed to parse Ollama response: {}", e))?;

    Ok(tags.models)
}

// ─────────────────────────────────────────────────────────────────────────────
// Embedding enricher
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

/// Embeds record content through a local Ollama model.
///
/// Ollama does not tag emotion, so a record without a valence is treated as
/// neutral (`0.0`) and keeps whatever `dominant_emotion` it arrived with.
pub struct OllamaEmbedder {
    base_url: String,
    model: String,
    dimensions: usize,
    client: reqwest::blocking::Client,
}

impl OllamaEmbedder {
    pub fn new(base_url: &str, model: &str, dimensions: usize) -> Result<Self, String> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            dimensions,
            client,
        })
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, ReverieError> {
        let url = format!("{}/api/embeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&EmbeddingRequest {
                model: &self.model,
                prompt: text,
            })
            .send()
            .map_err(|e| ReverieError::DependencyUnavailable(format!("Ollama unreachable at {}: {}", url, e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ReverieError::validation(format!(
                "embedding model '{}' is not available in Ollama",
                self.model
            )));
        }
        if !status.is_success() {
            return Err(ReverieError::DependencyUnavailable(format!("Ollama returned HTTP {}", status)));
        }
        let body: EmbeddingResponse = response
            .json()
            .map_err(|e| ReverieError::DependencyUnavailable(format!("Failed to parse Ollama response: {}", e)))?;
        check_dimensions(&body.embedding, self.dimensions, &self.model)?;
        Ok(body.embedding)
    }
}

impl Enricher for OllamaEmbedder {
    fn enrich(&self, raw: &RawMemory) -> Result<Enrichment, ReverieError> {
        let embedding = match &raw.embedding {
            Some(embedding) => embedding.clone(),
            None => self.embed(&raw.content)?,
        };
        Ok(Enrichment {
            embedding,
            valence: raw.emotional_valence.unwrap_or(0.0),
            dominant_emotion: raw.dominant_emotion.clone(),
        })
    }
}

fn check_dimensions(embedding: &[f32], expected: usize, model: &str) -> Result<(), ReverieError> {
    if embedding.len() != expected {
        return Err(ReverieError::validation(format!(
            "model '{}' produced {} dimensions, the store expects {}",
            model,
            embedding.len(),
            expected
        )));
    }
    Ok(())
}

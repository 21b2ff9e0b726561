//! Remote text embedding backend.
//!
//! Calls an OpenAI-compatible `/v1/embeddings` endpoint. Photos have no
//! caption, so the image side embeds a synthesized description (filename,
//! folder, shot year) instead of pixels. Credentials come from an env var;
//! a missing key is a configuration error that moves the fallback ladder on.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::config::RemoteEmbedderConfig;
use crate::embed::{synthesize_description, EmbedBackend, EmbedError};

pub struct RemoteTextEmbedder {
    client: reqwest::blocking::Client,
    endpoint: String,
    model: String,
    api_key: String,
    backend_id: String,
    dimensions: usize,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl RemoteTextEmbedder {
    /// Create the backend and probe the service once.
    ///
    /// The probe both validates the credentials and discovers the model's
    /// dimensionality, so a dead service is caught at ladder-evaluation time
    /// rather than mid-search.
    pub fn new(config: &RemoteEmbedderConfig) -> Result<Self, EmbedError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            EmbedError::Configuration(format!("env var {} is not set", config.api_key_env))
        })?;
        if api_key.trim().is_empty() {
            return Err(EmbedError::Configuration(format!(
                "env var {} is empty",
                config.api_key_env
            )));
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EmbedError::Configuration(e.to_string()))?;

        let mut backend = Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
            backend_id: format!("remote:{}", config.model),
            dimensions: 0,
        };

        let probe = backend.request_embedding("dimension probe")?;
        if probe.is_empty() {
            return Err(EmbedError::Configuration(
                "embedding service returned an empty vector".to_string(),
            ));
        }
        backend.dimensions = probe.len();

        Ok(backend)
    }

    fn request_embedding(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": self.model, "input": text }))
            .send()
            .map_err(|e| EmbedError::Engine(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(EmbedError::Configuration(format!(
                "embedding service rejected credentials ({status})"
            )));
        }
        if !status.is_success() {
            return Err(EmbedError::Engine(format!(
                "embedding service returned {status}"
            )));
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .map_err(|e| EmbedError::Engine(format!("malformed embedding response: {e}")))?;

        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| EmbedError::Engine("no embedding in response".to_string()))
    }
}

impl EmbedBackend for RemoteTextEmbedder {
    fn id(&self) -> &str {
        &self.backend_id
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let v = self.request_embedding(text)?;
        if v.len() != self.dimensions {
            return Err(EmbedError::Engine(format!(
                "service changed dimensionality: expected {}, got {}",
                self.dimensions,
                v.len()
            )));
        }
        Ok(v)
    }

    fn embed_image(&self, path: &Path) -> Result<Vec<f32>, EmbedError> {
        let mtime = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(|e| EmbedError::Engine(format!("{}: {e}", path.display())))?;
        let description = synthesize_description(path, mtime);
        self.embed_text(&description)
    }
}

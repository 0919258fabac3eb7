//! External ports: text generation and embedding.
//!
//! The engine never talks to a provider directly — everything goes through
//! the [`LlmPort`] and [`EmbeddingPort`] trait objects so the memory crates
//! stay provider-agnostic.  The bundled [`OllamaClient`] implements both
//! against a local Ollama server.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

/// Sampling options forwarded verbatim to the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub repeat_penalty: f32,
    pub stop: Vec<String>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_tokens: 2048,
            temperature: 0.7,
            top_p: 0.9,
            repeat_penalty: 1.1,
            stop: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerateResponse {
    pub content: String,
}

/// Text-generation port.  One in-flight call at a time per session.
#[async_trait]
pub trait LlmPort: Send + Sync {
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<GenerateResponse>;
}

/// Embedding port.  Output order matches input order; all vectors share one
/// dimension within an index.
#[async_trait]
pub trait EmbeddingPort: Send + Sync {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

// ── Ollama client ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    embed_model: String,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, embed_model: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(180))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
            embed_model: embed_model.into(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl LlmPort for OllamaClient {
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<GenerateResponse> {
        let payload = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "num_predict": options.max_tokens,
                "temperature": options.temperature,
                "top_p": options.top_p,
                "repeat_penalty": options.repeat_penalty,
                "stop": options.stop,
            }
        });

        let response = self
            .client
            .post(self.endpoint("/api/generate"))
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("LLM transport failure against {}", self.base_url))?;

        let status = response.status();
        let body: serde_json::Value = response.json().await.context("reading LLM response body")?;
        if !status.is_success() {
            bail!("LLM provider error ({status}): {body}");
        }

        let content = body
            .get("response")
            .and_then(|value| value.as_str())
            .map(ToString::to_string)
            .with_context(|| format!("LLM response missing text field: {body}"))?;

        debug!(model = %self.model, prompt_len = prompt.len(), reply_len = content.len(), "generation complete");
        Ok(GenerateResponse { content })
    }
}

#[async_trait]
impl EmbeddingPort for OllamaClient {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let payload = json!({
            "model": self.embed_model,
            "input": texts,
        });

        let response = self
            .client
            .post(self.endpoint("/api/embed"))
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("embedding transport failure against {}", self.base_url))?;

        let status = response.status();
        let body: serde_json::Value = response.json().await.context("reading embedding response body")?;
        if !status.is_success() {
            bail!("embedding provider error ({status}): {body}");
        }

        let vectors = body
            .get("embeddings")
            .and_then(|value| value.as_array())
            .with_context(|| format!("embedding response missing vectors: {body}"))?
            .iter()
            .map(|row| {
                row.as_array()
                    .map(|values| {
                        values
                            .iter()
                            .filter_map(|v| v.as_f64().map(|f| f as f32))
                            .collect::<Vec<f32>>()
                    })
                    .context("embedding row is not an array")
            })
            .collect::<Result<Vec<_>>>()?;

        if vectors.len() != texts.len() {
            bail!(
                "embedding count mismatch: {} inputs, {} vectors",
                texts.len(),
                vectors.len()
            );
        }

        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_engine_expectations() {
        let options = GenerateOptions::default();
        assert!(options.stop.is_empty());
        assert!(options.temperature > 0.0 && options.temperature < 1.0);
    }

    #[test]
    fn endpoint_joins_without_double_slash() {
        let client = OllamaClient::new("http://localhost:11434/", "m", "e");
        assert_eq!(client.endpoint("/api/generate"), "http://localhost:11434/api/generate");
    }
}

use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;
use crate::error::{PipelineError, Result};

/// Contract for the external embedding collaborator. Errors are always
/// transient from the pipeline's perspective; callers retry via redelivery.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>>;

    /// Fixed vector length for this deployment.
    fn dimensions(&self) -> usize;

    async fn health_check(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum EmbeddingProvider {
    OpenAI,
    Ollama,
    /// Deterministic embeddings for tests; no network.
    Mock,
}

#[derive(Debug, Clone)]
pub struct SimpleEmbedder {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    provider: EmbeddingProvider,
    dimensions: usize,
}

#[derive(Debug, Serialize)]
struct OpenAIEmbeddingRequest<'a> {
    input: &'a str,
    model: &'a str,
    dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingResponse {
    data: Vec<OpenAIEmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct OllamaEmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

impl SimpleEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let provider = match config.provider.as_str() {
            "openai" => EmbeddingProvider::OpenAI,
            "ollama" => EmbeddingProvider::Ollama,
            "mock" => EmbeddingProvider::Mock,
            other => {
                return Err(PipelineError::Configuration(format!(
                    "unknown embedding provider: {other}"
                )))
            }
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| PipelineError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            base_url: config.base_url.clone(),
            provider,
            dimensions: config.dimensions,
        })
    }

    pub fn new_mock(dimensions: usize) -> Self {
        Self {
            client: Client::new(),
            api_key: String::new(),
            model: "mock-model".to_string(),
            base_url: String::new(),
            provider: EmbeddingProvider::Mock,
            dimensions,
        }
    }

    async fn generate_internal(&self, text: &str) -> Result<Vec<f32>> {
        match self.provider {
            EmbeddingProvider::OpenAI => self.generate_openai(text).await,
            EmbeddingProvider::Ollama => self.generate_ollama(text).await,
            EmbeddingProvider::Mock => Ok(mock_embedding(text, self.dimensions)),
        }
    }

    async fn generate_openai(&self, text: &str) -> Result<Vec<f32>> {
        let request = OpenAIEmbeddingRequest {
            input: text,
            model: &self.model,
            dimensions: self.dimensions,
        };

        let response = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::EmbeddingUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PipelineError::EmbeddingUnavailable(format!(
                "OpenAI API error: {}",
                response.status()
            )));
        }

        let body: OpenAIEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::EmbeddingUnavailable(e.to_string()))?;

        body.data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| {
                PipelineError::EmbeddingUnavailable("empty embedding response".to_string())
            })
    }

    async fn generate_ollama(&self, text: &str) -> Result<Vec<f32>> {
        let request = OllamaEmbeddingRequest {
            model: &self.model,
            prompt: text,
        };

        let response = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::EmbeddingUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PipelineError::EmbeddingUnavailable(format!(
                "Ollama API error: {}",
                response.status()
            )));
        }

        let body: OllamaEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::EmbeddingUnavailable(e.to_string()))?;

        Ok(body.embedding)
    }
}

#[async_trait]
impl EmbeddingService for SimpleEmbedder {
    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>> {
        debug!("Generating embedding for text of length {}", text.len());

        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(60)),
            ..Default::default()
        };

        let embedding = retry(backoff, || async {
            match self.generate_internal(text).await {
                Ok(embedding) => Ok(embedding),
                Err(e) => {
                    warn!("Embedding request failed, will retry: {e}");
                    Err(backoff::Error::transient(e))
                }
            }
        })
        .await?;

        if embedding.len() != self.dimensions {
            return Err(PipelineError::EmbeddingUnavailable(format!(
                "expected {} dimensions, got {}",
                self.dimensions,
                embedding.len()
            )));
        }

        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn health_check(&self) -> Result<()> {
        match self.provider {
            EmbeddingProvider::Mock => Ok(()),
            _ => self.generate_internal("ping").await.map(|_| ()),
        }
    }
}

/// Deterministic unit-norm embedding derived from the text bytes.
fn mock_embedding(text: &str, dimensions: usize) -> Vec<f32> {
    let mut embedding = vec![0.0f32; dimensions];
    for (i, byte) in text.as_bytes().iter().enumerate() {
        embedding[i % dimensions] += f32::from(*byte) / 255.0;
    }
    let magnitude = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for value in embedding.iter_mut() {
            *value /= magnitude;
        }
    }
    embedding
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_embedder_is_deterministic() {
        let embedder = SimpleEmbedder::new_mock(64);
        let a = embedder.generate_embedding("fixing a null pointer bug").await.unwrap();
        let b = embedder.generate_embedding("fixing a null pointer bug").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn mock_embedding_is_unit_norm() {
        let embedder = SimpleEmbedder::new_mock(32);
        let v = embedder.generate_embedding("hello").await.unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn rejects_unknown_provider() {
        let config = EmbeddingConfig {
            provider: "carrier-pigeon".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(SimpleEmbedder::new(&config).is_err());
    }
}

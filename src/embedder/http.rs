//! HTTP client for an OpenAI-compatible embedding service hosting a protein language model.

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{EmbedContext, EmbedError, Embedder};

/// Blocking embeddings client that talks to `/embeddings` endpoints.
///
/// Requests are not retried: a failed call fails the batch and with it the
/// embedding stage.
#[derive(Clone)]
pub struct HttpEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    batch_size: usize,
}

impl HttpEmbedder {
    /// Builds a new embeddings client.
    ///
    /// # Arguments
    /// * `base_url` - Service root, e.g. `http://127.0.0.1:8080/v1`
    /// * `api_key` - Optional bearer token
    /// * `model` - Model identifier advertised by the service (e.g. `prottrans_t5_xl_u50`)
    pub fn new(
        base_url: &str,
        api_key: Option<&str>,
        model: String,
        timeout: Duration,
        batch_size: usize,
    ) -> Result<Self, EmbedError> {
        if model.trim().is_empty() {
            return Err(EmbedError::Config("missing model name".to_string()));
        }
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(EmbedError::Config(format!(
                "endpoint must be an http(s) URL, got {base_url}"
            )));
        }
        let mut headers = HeaderMap::new();
        if let Some(key) = api_key.map(str::trim).filter(|key| !key.is_empty()) {
            let auth = format!("Bearer {key}");
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth)
                    .map_err(|_| EmbedError::Config("invalid API key".to_string()))?,
            );
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|err| EmbedError::Config(format!("failed to build HTTP client: {err}")))?;
        let endpoint = format!("{}/embeddings", base_url.trim_end_matches('/'));
        Ok(Self {
            client,
            endpoint,
            model,
            batch_size: batch_size.max(1),
        })
    }

    /// Maximum batch size configured for this client.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Full embeddings endpoint URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Embedder for HttpEmbedder {
    fn model_variant(&self) -> &str {
        &self.model
    }

    fn embed_many(
        &self,
        ctx: &EmbedContext,
        sequences: &[&str],
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        if sequences.is_empty() {
            return Ok(Vec::new());
        }
        if sequences.len() > self.batch_size {
            return Err(EmbedError::Config(format!(
                "batch of {} exceeds configured max {}",
                sequences.len(),
                self.batch_size
            )));
        }

        let request = EmbeddingRequest {
            model: &self.model,
            input: sequences,
            precision: ctx.precision().is_reduced().then_some("half"),
        };
        debug!(endpoint = %self.endpoint, count = sequences.len(), "posting embedding batch");
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .map_err(|err| EmbedError::Backend(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(EmbedError::Backend(format!("{status}: {body}")));
        }
        let parsed: EmbeddingResponse = response
            .json()
            .map_err(|err| EmbedError::Backend(format!("unparseable response: {err}")))?;
        order_embeddings(parsed, sequences.len())
    }
}

fn order_embeddings(
    mut parsed: EmbeddingResponse,
    requested: usize,
) -> Result<Vec<Vec<f32>>, EmbedError> {
    if parsed.data.len() != requested {
        return Err(EmbedError::CountMismatch {
            requested,
            returned: parsed.data.len(),
        });
    }
    parsed.data.sort_by_key(|entry| entry.index);
    if parsed
        .data
        .iter()
        .enumerate()
        .any(|(position, entry)| entry.index != position)
    {
        return Err(EmbedError::Backend(
            "response indices do not cover the batch".to_string(),
        ));
    }
    Ok(parsed
        .data
        .into_iter()
        .map(|entry| entry.embedding)
        .collect())
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    #[serde(borrow)]
    input: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    precision: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

//! Anthropic Messages API client.
//!
//! Implements both [`LlmProvider`] (one request per call) and
//! [`BatchProvider`] (the Message Batches API). HTTP 429 and
//! `rate_limit_error` responses map to [`LlmError::RateLimited`].

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use super::batch::{BatchEntry, BatchEntryOutcome, BatchProvider, BatchRequest, BatchStatus};
use super::types::{GenerationRequest, GenerationResponse, LlmProvider};
use crate::error::LlmError;

/// Default Anthropic API endpoint.
pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";

/// API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Default model to use if none specified.
pub const DEFAULT_MODEL: &str = "claude-3-7-sonnet-20250219";

/// Request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 300;

/// Client for the Anthropic Messages and Message Batches APIs.
pub struct AnthropicClient {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: String,
}

impl AnthropicClient {
    /// Create a client with the default base URL and model.
    ///
    /// # Errors
    ///
    /// Returns `LlmError::MissingApiKey` for an empty key and
    /// `LlmError::RequestFailed` if the HTTP client cannot be built.
    pub fn new(api_key: impl Into<String>) -> Result<Self, LlmError> {
        Self::with_custom_url(api_key, ANTHROPIC_BASE_URL, DEFAULT_MODEL)
    }

    /// Create a client with a custom base URL and default model.
    ///
    /// Useful for testing or for API-compatible proxies.
    pub fn with_custom_url(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, LlmError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(LlmError::MissingApiKey);
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| LlmError::RequestFailed(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_model: model.into(),
        })
    }

    /// Create a client from environment variables.
    ///
    /// - `ANTHROPIC_API_KEY`: API key (required)
    /// - `ANTHROPIC_API_BASE`: Base URL (default: `https://api.anthropic.com/v1`)
    /// - `ANTHROPIC_MODEL`: Default model
    pub fn from_env() -> Result<Self, LlmError> {
        let api_key = env::var("ANTHROPIC_API_KEY").map_err(|_| LlmError::MissingApiKey)?;
        let base_url =
            env::var("ANTHROPIC_API_BASE").unwrap_or_else(|_| ANTHROPIC_BASE_URL.to_string());
        let model = env::var("ANTHROPIC_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Self::with_custom_url(api_key, base_url, model)
    }

    /// Get the API key (for debugging, returns masked value).
    pub fn api_key_masked(&self) -> String {
        let chars: Vec<char> = self.api_key.chars().collect();
        if chars.len() <= 8 {
            "*".repeat(chars.len())
        } else {
            let head: String = chars[..4].iter().collect();
            let tail: String = chars[chars.len() - 4..].iter().collect();
            format!("{}...{}", head, tail)
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response, LlmError> {
        let response = self
            .authorized(builder)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status_code = response.status().as_u16();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error response".to_string());
        Err(classify_error(status_code, &error_text))
    }

    async fn fetch_batch(&self, batch_id: &str) -> Result<ApiBatch, LlmError> {
        let url = format!("{}/messages/batches/{}", self.base_url, batch_id);
        self.send(self.client.get(&url))
            .await?
            .json()
            .await
            .map_err(|e| LlmError::ParseError(format!("Failed to parse batch status: {}", e)))
    }
}

/// Maps a failed HTTP response to an error.
///
/// Rate limiting is recognized by status 429 or by the `rate_limit_error`
/// error type in the body.
fn classify_error(status_code: u16, body: &str) -> LlmError {
    match serde_json::from_str::<ApiErrorResponse>(body) {
        Ok(parsed) => {
            if status_code == 429 || parsed.error.error_type == "rate_limit_error" {
                LlmError::RateLimited(parsed.error.message)
            } else {
                LlmError::ApiError {
                    code: status_code,
                    message: format!("{}: {}", parsed.error.error_type, parsed.error.message),
                }
            }
        }
        Err(_) if status_code == 429 => LlmError::RateLimited(body.to_string()),
        Err(_) => LlmError::ApiError {
            code: status_code,
            message: body.to_string(),
        },
    }
}

/// Parses the JSON Lines body of a batch's results.
fn parse_results(body: &str) -> Result<Vec<BatchEntry>, LlmError> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let line: ApiResultLine = serde_json::from_str(line)
                .map_err(|e| LlmError::ParseError(format!("Invalid batch result line: {}", e)))?;
            let outcome = match line.result {
                ApiResult::Succeeded { message } => BatchEntryOutcome::Succeeded(message),
                ApiResult::Errored { error } => {
                    let detail = error.error.unwrap_or(ApiErrorDetail {
                        error_type: error.error_type,
                        message: String::new(),
                    });
                    BatchEntryOutcome::Errored {
                        error_type: detail.error_type,
                        message: detail.message,
                    }
                }
                ApiResult::Canceled => BatchEntryOutcome::Canceled,
                ApiResult::Expired => BatchEntryOutcome::Expired,
            };
            Ok(BatchEntry {
                custom_id: line.custom_id,
                outcome,
            })
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(rename = "type")]
    error_type: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Serialize)]
struct ApiBatchCreate<'a> {
    requests: &'a [BatchRequest],
}

#[derive(Debug, Deserialize)]
struct ApiBatch {
    id: String,
    processing_status: BatchStatus,
    #[serde(default)]
    results_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResultLine {
    custom_id: String,
    result: ApiResult,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiResult {
    Succeeded { message: GenerationResponse },
    Errored { error: ApiBatchError },
    Canceled,
    Expired,
}

/// Error wrapper inside a batch result line.
#[derive(Debug, Deserialize)]
struct ApiBatchError {
    #[serde(rename = "type", default)]
    error_type: String,
    #[serde(default)]
    error: Option<ApiErrorDetail>,
}

#[async_trait]
impl LlmProvider for AnthropicClient {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let request = request.with_default_model(&self.default_model);
        let url = format!("{}/messages", self.base_url);

        self.send(self.client.post(&url).json(&request))
            .await?
            .json()
            .await
            .map_err(|e| LlmError::ParseError(format!("Failed to parse API response: {}", e)))
    }
}

#[async_trait]
impl BatchProvider for AnthropicClient {
    async fn submit(&self, requests: Vec<BatchRequest>) -> Result<String, LlmError> {
        let requests: Vec<BatchRequest> = requests
            .into_iter()
            .map(|r| BatchRequest {
                custom_id: r.custom_id,
                params: r.params.with_default_model(&self.default_model),
            })
            .collect();
        let url = format!("{}/messages/batches", self.base_url);

        let batch: ApiBatch = self
            .send(self.client.post(&url).json(&ApiBatchCreate { requests: &requests }))
            .await?
            .json()
            .await
            .map_err(|e| LlmError::ParseError(format!("Failed to parse batch creation: {}", e)))?;

        tracing::debug!(batch_id = %batch.id, requests = requests.len(), "Created message batch");
        Ok(batch.id)
    }

    async fn status(&self, batch_id: &str) -> Result<BatchStatus, LlmError> {
        Ok(self.fetch_batch(batch_id).await?.processing_status)
    }

    async fn results(&self, batch_id: &str) -> Result<Vec<BatchEntry>, LlmError> {
        let batch = self.fetch_batch(batch_id).await?;
        let results_url = batch.results_url.ok_or_else(|| LlmError::Batch {
            batch_id: batch_id.to_string(),
            message: format!("no results available (status {})", batch.processing_status),
        })?;

        let body = self
            .send(self.client.get(&results_url))
            .await?
            .text()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;
        parse_results(&body)
    }
}

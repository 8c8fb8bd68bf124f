//! Description enhancement through the Anthropic Messages API.
//!
//! [`Enhancer`] is the boundary the processor depends on; [`ClaudeClient`]
//! is the HTTP implementation. Callers go through [`enhance_within`], which
//! bounds the call with a local timeout regardless of how the client is
//! configured internally.

use crate::prompt::{self, SYSTEM_PROMPT};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::ImageCounts;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Backoff base between request retries.
const REQUEST_RETRY_BASE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum EnhanceError {
    #[error("enhancement timed out after {0:?}")]
    Timeout(Duration),

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

#[async_trait]
pub trait Enhancer: Send + Sync {
    /// Rewrite `original` as a client-facing description. Never substitutes
    /// text on failure.
    async fn enhance(
        &self,
        original: &str,
        title: &str,
        images: ImageCounts,
    ) -> Result<String, EnhanceError>;
}

/// Run `enhancer` but give up after `limit`. Dropping the in-flight future
/// cancels the underlying request.
pub async fn enhance_within(
    enhancer: &dyn Enhancer,
    limit: Duration,
    original: &str,
    title: &str,
    images: ImageCounts,
) -> Result<String, EnhanceError> {
    match timeout(limit, enhancer.enhance(original, title, images)).await {
        Ok(result) => result,
        Err(_) => Err(EnhanceError::Timeout(limit)),
    }
}

#[derive(Debug, Clone)]
pub struct ClaudeConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    /// Per-request timeout of the HTTP client.
    pub request_timeout: Duration,
    /// Retries on transport errors, 429 and 5xx.
    pub max_retries: u32,
}

pub struct ClaudeClient {
    client: reqwest::Client,
    config: ClaudeConfig,
    retry: RetryPolicy,
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}

impl ClaudeClient {
    pub fn new(config: ClaudeConfig) -> Result<Self, EnhanceError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let retry = RetryPolicy {
            max_attempts: config.max_retries.saturating_add(1),
            base_delay: REQUEST_RETRY_BASE,
        };
        Ok(Self {
            client,
            config,
            retry,
        })
    }

    async fn send(&self, body: &MessagesRequest<'_>) -> Result<MessagesResponse, EnhanceError> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.config.api_url))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EnhanceError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| EnhanceError::MalformedResponse(e.to_string()))
    }
}

fn is_retryable(err: &EnhanceError) -> bool {
    match err {
        EnhanceError::Transport(e) => e.is_connect() || e.is_timeout() || e.is_request(),
        EnhanceError::Api { status, .. } => *status == 429 || *status >= 500,
        _ => false,
    }
}

fn first_text(response: MessagesResponse) -> Result<String, EnhanceError> {
    match response.content.into_iter().next() {
        Some(ContentBlock::Text { text }) => Ok(text),
        Some(ContentBlock::Other) => Err(EnhanceError::MalformedResponse(
            "first content block is not text".into(),
        )),
        None => Err(EnhanceError::MalformedResponse("empty content".into())),
    }
}

#[async_trait]
impl Enhancer for ClaudeClient {
    async fn enhance(
        &self,
        original: &str,
        title: &str,
        images: ImageCounts,
    ) -> Result<String, EnhanceError> {
        let user_prompt = prompt::user_prompt(title, original, images);
        let body = MessagesRequest {
            model: &self.config.model,
            max_tokens: self.config.max_tokens,
            system: SYSTEM_PROMPT,
            messages: vec![Message {
                role: "user",
                content: &user_prompt,
            }],
        };

        let mut attempts_made = 0;
        let response = loop {
            attempts_made += 1;
            match self.send(&body).await {
                Ok(response) => break response,
                Err(err) if is_retryable(&err) => match self.retry.decide(attempts_made) {
                    RetryDecision::Retry(delay) => {
                        warn!(message = "Retrying enhancement request", attempts_made, error = %err);
                        sleep(delay).await;
                    }
                    RetryDecision::GiveUp => return Err(err),
                },
                Err(err) => return Err(err),
            }
        };

        let tokens_used = response.usage.input_tokens + response.usage.output_tokens;
        debug!(input_tokens = response.usage.input_tokens, output_tokens = response.usage.output_tokens);
        let enhanced = first_text(response)?;

        info!(
            message = "Description enhanced",
            input_length = original.chars().count(),
            output_length = enhanced.chars().count(),
            tokens_used
        );

        Ok(enhanced)
    }
}

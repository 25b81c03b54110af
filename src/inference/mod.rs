//! Inference provider abstraction and the bounded retry loop around it.

mod gemini;
mod openai;

pub use gemini::GeminiClient;
pub use openai::OpenAiCompatibleClient;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{InferenceBackend, InferenceSection};
use crate::document::Document;
use crate::error::GatewayError;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Temporary capacity problem; the only retryable case.
    #[error("model overloaded: {0}")]
    Overloaded(String),

    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("empty response from model")]
    EmptyResponse,

    #[error("unexpected response shape: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Classify a non-success HTTP answer from a provider.
    pub fn from_status(status: u16, body: String) -> Self {
        // 503 is Gemini's "model is overloaded", 529 the Anthropic-style variant
        if matches!(status, 503 | 529) || reports_overload(&body) {
            ProviderError::Overloaded(body)
        } else {
            ProviderError::Status { status, body }
        }
    }
}

/// Some gateways wrap capacity errors in another status; trust the body.
fn reports_overload(body: &str) -> bool {
    let body = body.to_ascii_lowercase();
    body.contains("overloaded") || body.contains("\"unavailable\"")
}

/// A hosted multimodal model that answers a prompt plus one inlined document.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// Model identifier, recorded in the usage ledger.
    fn model(&self) -> &str;

    /// One attempt. Returns the raw completion text.
    async fn generate(&self, prompt: &str, document: &Document) -> Result<String, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Fixed wait after an overloaded answer; no growth, no jitter.
    pub overload_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            overload_delay: Duration::from_secs(2),
        }
    }
}

impl From<&InferenceSection> for RetryPolicy {
    fn from(section: &InferenceSection) -> Self {
        Self {
            max_attempts: section.max_attempts.max(1),
            overload_delay: Duration::from_millis(section.overload_delay_ms),
        }
    }
}

/// Call the provider, retrying only overloaded answers, up to `max_attempts` total.
pub async fn generate_with_retry(
    provider: &dyn InferenceProvider,
    policy: &RetryPolicy,
    prompt: &str,
    document: &Document,
) -> Result<String, GatewayError> {
    let attempts = policy.max_attempts.max(1);
    let mut last_overload = String::new();

    for attempt in 1..=attempts {
        match provider.generate(prompt, document).await {
            Ok(text) => {
                info!(attempt, model = provider.model(), chars = text.len(), "Model responded");
                return Ok(text);
            }
            Err(ProviderError::Overloaded(body)) => {
                warn!(attempt, max_attempts = attempts, "Model overloaded");
                last_overload = body;
                if attempt < attempts {
                    tokio::time::sleep(policy.overload_delay).await;
                }
            }
            Err(e) => {
                warn!(attempt, error = %e, "Inference call failed");
                return Err(GatewayError::Inference(e.to_string()));
            }
        }
    }

    Err(GatewayError::Inference(format!(
        "model still overloaded after {attempts} attempts: {last_overload}"
    )))
}

/// Build the configured provider client.
pub fn build_provider(
    section: &InferenceSection,
    api_key: &str,
) -> Result<Arc<dyn InferenceProvider>, reqwest::Error> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(section.timeout_secs))
        .build()?;

    let provider: Arc<dyn InferenceProvider> = match section.backend {
        InferenceBackend::Gemini => {
            info!(url = %section.base_url, model = %section.model, "Using Gemini backend");
            Arc::new(GeminiClient::new(
                client,
                &section.base_url,
                &section.model,
                api_key,
            ))
        }
        InferenceBackend::OpenAi | InferenceBackend::Ollama => {
            info!(
                url = %section.base_url,
                model = %section.model,
                backend = ?section.backend,
                "Using OpenAI-compatible backend"
            );
            Arc::new(OpenAiCompatibleClient::new(
                client,
                &section.base_url,
                &section.model,
                api_key,
            ))
        }
    };
    Ok(provider)
}

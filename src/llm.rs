//! Generation provider interface and the OpenAI-backed client.
//!
//! Transport failures (network errors, 429, 5xx) are retried a bounded,
//! configured number of times. Validation failures, including an
//! empty/whitespace-only completion, are never retried.

use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::{Creds, RetryPolicy};
use crate::state::TokenUsage;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("model returned empty text")]
    EmptyResponse,
    #[error("malformed provider response: {0}")]
    Parse(String),
    #[error("LLM configuration error: {0}")]
    Config(String),
}

impl LlmError {
    /// Transient failures worth retrying: network trouble, rate limits,
    /// server errors. Empty or malformed completions are hard failures.
    fn is_transient(&self) -> bool {
        match self {
            LlmError::Transport(_) => true,
            LlmError::Api { status, .. } => *status == 429 || (500..=599).contains(status),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub provider: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Generation {
    pub fn usage(&self, stage: &str) -> TokenUsage {
        TokenUsage {
            stage: stage.to_string(),
            provider: self.provider.clone(),
            model: self.model.clone(),
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GenerateOptions {
    pub temperature: f32,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self { temperature: 0.7 }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    fn provider_name(&self) -> &str;
    fn model_name(&self) -> &str;
    async fn generate(&self, prompt: &str, opts: GenerateOptions) -> Result<Generation, LlmError>;
}

pub fn create_llm_client(
    model: &str,
    creds: &Creds,
    retry: &RetryPolicy,
) -> Result<Box<dyn LlmClient>, LlmError> {
    let api_key = creds.openai_api_key.as_deref().ok_or_else(|| {
        LlmError::Config(
            "no OpenAI API key found; add one of 'openai_api_key', 'OPENAI_KEY', \
             'OPEN_AI', or 'OPENAI_API_KEY' to config/creds.json"
                .to_string(),
        )
    })?;
    Ok(Box::new(OpenAiClient::new(api_key, model, None, *retry)))
}

// --- OpenAI ---

pub struct OpenAiClient {
    api_key: String,
    model: String,
    base_url: String,
    retry: RetryPolicy,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(api_key: &str, model: &str, base_url: Option<&str>, retry: RetryPolicy) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            retry,
            client: reqwest::Client::new(),
        }
    }

    async fn request_once(&self, prompt: &str, opts: GenerateOptions) -> Result<Generation, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = OpenAiRequest {
            model: self.model.clone(),
            messages: vec![OpenAiMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature: opts.temperature,
        };

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: OpenAiResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;
        extract_generation("openai", &self.model, parsed)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn provider_name(&self) -> &str {
        "openai"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, opts: GenerateOptions) -> Result<Generation, LlmError> {
        let mut attempt = 0usize;
        loop {
            match self.request_once(prompt, opts).await {
                Ok(generation) => return Ok(generation),
                Err(e) if e.is_transient() && attempt < self.retry.count => {
                    attempt += 1;
                    warn!(
                        "transient LLM failure (attempt {attempt}/{}): {e}; retrying",
                        self.retry.count
                    );
                    tokio::time::sleep(Duration::from_secs(self.retry.delay_seconds)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[derive(Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    temperature: f32,
}

#[derive(Serialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessageResponse,
}

#[derive(Deserialize)]
struct OpenAiMessageResponse {
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

fn extract_generation(
    provider: &str,
    model: &str,
    response: OpenAiResponse,
) -> Result<Generation, LlmError> {
    let choice = response
        .choices
        .first()
        .ok_or_else(|| LlmError::Parse("response has no choices".to_string()))?;
    let content = choice
        .message
        .content
        .as_deref()
        .ok_or_else(|| LlmError::Parse("response choice has no content".to_string()))?;
    if content.trim().is_empty() {
        return Err(LlmError::EmptyResponse);
    }

    let usage = response.usage.unwrap_or_default();
    let total = if usage.total_tokens > 0 {
        usage.total_tokens
    } else {
        usage.prompt_tokens + usage.completion_tokens
    };
    Ok(Generation {
        text: content.to_string(),
        provider: provider.to_string(),
        model: model.to_string(),
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: total,
    })
}

// --- Pricing ---

/// USD per million tokens (input, output). Models missing from the table
/// produce a token summary without a cost estimate.
const PRICING_PER_MTOK: &[(&str, f64, f64)] = &[
    ("gpt-4.1", 2.00, 8.00),
    ("gpt-4.1-mini", 0.40, 1.60),
    ("gpt-4.1-nano", 0.10, 0.40),
    ("gpt-4o", 2.50, 10.00),
    ("gpt-4o-mini", 0.15, 0.60),
];

#[derive(Debug, Clone)]
pub struct RunCost {
    pub model: Option<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: Option<f64>,
}

pub fn estimate_run_cost(usage: &[TokenUsage]) -> RunCost {
    let model = usage.first().map(|u| u.model.clone());
    let prompt_tokens: u64 = usage.iter().map(|u| u.prompt_tokens).sum();
    let completion_tokens: u64 = usage.iter().map(|u| u.completion_tokens).sum();
    let total_tokens: u64 = usage.iter().map(|u| u.total_tokens).sum();

    let cost_usd = model.as_deref().and_then(|m| {
        PRICING_PER_MTOK
            .iter()
            .find(|(name, _, _)| *name == m)
            .map(|(_, input, output)| {
                (prompt_tokens as f64 / 1_000_000.0) * input
                    + (completion_tokens as f64 / 1_000_000.0) * output
            })
    });

    RunCost {
        model,
        prompt_tokens,
        completion_tokens,
        total_tokens,
        cost_usd,
    }
}

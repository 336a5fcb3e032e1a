//! Speech-synthesis provider interface and HTTP-backed clients.

use async_trait::async_trait;
use log::warn;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

use crate::config::{Creds, NarrationSettings, RetryPolicy};

pub const DEFAULT_ELEVENLABS_VOICE_ID: &str = "6FiCmD8eY5VyjOdG5Zjk";
pub const DEFAULT_ELEVENLABS_MODEL_ID: &str = "eleven_multilingual_v2";

#[derive(Debug, Error)]
pub enum TtsError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("synthesis returned no audio data")]
    EmptyAudio,
    #[error("TTS configuration error: {0}")]
    Config(String),
}

impl TtsError {
    fn is_transient(&self) -> bool {
        match self {
            TtsError::Transport(_) => true,
            TtsError::Api { status, .. } => *status == 429 || (500..=599).contains(status),
            _ => false,
        }
    }
}

/// Result of one synthesis call. Usage is the character count sent to the
/// backend, which is what speech APIs bill by.
#[derive(Debug, Clone)]
pub struct Synthesis {
    pub audio: Vec<u8>,
    pub characters_billed: usize,
    pub provider: String,
    pub model: String,
    pub voice: String,
}

#[async_trait]
pub trait TtsClient: Send + Sync {
    fn provider_name(&self) -> &str;
    fn model_name(&self) -> &str;
    fn voice_name(&self) -> &str;
    fn audio_ext(&self) -> &str {
        "mp3"
    }
    async fn synthesize(&self, text: &str) -> Result<Synthesis, TtsError>;
}

pub fn create_tts_client(
    narration: &NarrationSettings,
    creds: &Creds,
    retry: &RetryPolicy,
) -> Result<Box<dyn TtsClient>, TtsError> {
    match narration.provider.as_str() {
        "openai" => {
            let api_key = creds.openai_api_key.as_deref().ok_or_else(|| {
                TtsError::Config(
                    "no OpenAI API key found for TTS; add it to config/creds.json".to_string(),
                )
            })?;
            Ok(Box::new(OpenAiTtsClient::new(
                api_key,
                &narration.model,
                &narration.voice,
                *retry,
            )))
        }
        "elevenlabs" => {
            let api_key = creds.elevenlabs_api_key.as_deref().ok_or_else(|| {
                TtsError::Config(
                    "no ElevenLabs API key found; add ELEVENLABS_API_KEY to config/creds.json"
                        .to_string(),
                )
            })?;
            Ok(Box::new(ElevenLabsTtsClient::new(
                api_key,
                Some(&narration.model),
                &narration.voice,
                *retry,
            )))
        }
        other => Err(TtsError::Config(format!(
            "unsupported TTS provider '{other}'; supported: 'openai', 'elevenlabs'"
        ))),
    }
}

async fn with_retry<F, Fut>(retry: RetryPolicy, mut call: F) -> Result<Synthesis, TtsError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Synthesis, TtsError>>,
{
    let mut attempt = 0usize;
    loop {
        match call().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() && attempt < retry.count => {
                attempt += 1;
                warn!(
                    "transient TTS failure (attempt {attempt}/{}): {e}; retrying",
                    retry.count
                );
                tokio::time::sleep(Duration::from_secs(retry.delay_seconds)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

// --- OpenAI ---

pub struct OpenAiTtsClient {
    api_key: String,
    model: String,
    voice: String,
    retry: RetryPolicy,
    client: reqwest::Client,
}

impl OpenAiTtsClient {
    pub fn new(api_key: &str, model: &str, voice: &str, retry: RetryPolicy) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            // The API requires lowercase voice names; configs may say "Onyx".
            voice: voice.to_lowercase(),
            retry,
            client: reqwest::Client::new(),
        }
    }

    async fn request_once(&self, text: &str) -> Result<Synthesis, TtsError> {
        let body = json!({
            "model": self.model,
            "voice": self.voice,
            "input": text,
        });
        let resp = self
            .client
            .post("https://api.openai.com/v1/audio/speech")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| TtsError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(TtsError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let audio = resp
            .bytes()
            .await
            .map_err(|e| TtsError::Transport(e.to_string()))?
            .to_vec();
        if audio.is_empty() {
            return Err(TtsError::EmptyAudio);
        }
        Ok(Synthesis {
            audio,
            characters_billed: text.chars().count(),
            provider: "openai".to_string(),
            model: self.model.clone(),
            voice: self.voice.clone(),
        })
    }
}

#[async_trait]
impl TtsClient for OpenAiTtsClient {
    fn provider_name(&self) -> &str {
        "openai"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn voice_name(&self) -> &str {
        &self.voice
    }

    async fn synthesize(&self, text: &str) -> Result<Synthesis, TtsError> {
        with_retry(self.retry, || self.request_once(text)).await
    }
}

// --- ElevenLabs ---

const OPENAI_TTS_MODEL_PREFIXES: &[&str] = &["tts-", "gpt-4o-mini", "gpt-4o-"];

fn is_openai_tts_model(model: &str) -> bool {
    let model = model.trim().to_lowercase();
    OPENAI_TTS_MODEL_PREFIXES
        .iter()
        .any(|p| model.starts_with(p))
}

/// Use the configured model only if it looks like an ElevenLabs model; the
/// pipeline may pass an OpenAI TTS model name when the user switched provider.
pub fn elevenlabs_model_from_config(configured: Option<&str>) -> String {
    match configured.map(str::trim) {
        Some(model) if !model.is_empty() && !is_openai_tts_model(model) => model.to_string(),
        _ => DEFAULT_ELEVENLABS_MODEL_ID.to_string(),
    }
}

pub struct ElevenLabsTtsClient {
    api_key: String,
    model: String,
    voice: String,
    retry: RetryPolicy,
    client: reqwest::Client,
}

impl ElevenLabsTtsClient {
    pub fn new(api_key: &str, model: Option<&str>, voice: &str, retry: RetryPolicy) -> Self {
        let voice = voice.trim();
        Self {
            api_key: api_key.to_string(),
            model: elevenlabs_model_from_config(model),
            voice: if voice.is_empty() {
                DEFAULT_ELEVENLABS_VOICE_ID.to_string()
            } else {
                voice.to_string()
            },
            retry,
            client: reqwest::Client::new(),
        }
    }

    async fn request_once(&self, text: &str) -> Result<Synthesis, TtsError> {
        let url = format!(
            "https://api.elevenlabs.io/v1/text-to-speech/{}?output_format=mp3_44100_128",
            self.voice
        );
        let body = json!({
            "text": text,
            "model_id": self.model,
        });
        let resp = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| TtsError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(TtsError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let audio = resp
            .bytes()
            .await
            .map_err(|e| TtsError::Transport(e.to_string()))?
            .to_vec();
        if audio.is_empty() {
            return Err(TtsError::EmptyAudio);
        }
        Ok(Synthesis {
            audio,
            characters_billed: text.chars().count(),
            provider: "elevenlabs".to_string(),
            model: self.model.clone(),
            voice: self.voice.clone(),
        })
    }
}

#[async_trait]
impl TtsClient for ElevenLabsTtsClient {
    fn provider_name(&self) -> &str {
        "elevenlabs"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn voice_name(&self) -> &str {
        &self.voice
    }

    async fn synthesize(&self, text: &str) -> Result<Synthesis, TtsError> {
        with_retry(self.retry, || self.request_once(text)).await
    }
}

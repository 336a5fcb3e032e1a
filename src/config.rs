//! App configuration, credentials, and run settings resolution.
//!
//! All settings are resolved before the orchestrator runs and passed in as a
//! single immutable `RunSettings` value.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::cli::CliArgs;
use crate::tts::{DEFAULT_ELEVENLABS_MODEL_ID, DEFAULT_ELEVENLABS_VOICE_ID};

pub const MIN_BEATS: usize = 1;
pub const MAX_BEATS: usize = 20;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid run settings: {0}")]
    InvalidSettings(String),
    #[error("invalid config in {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

fn default_beats() -> usize {
    5
}
fn default_section_length() -> String {
    "400-600".to_string()
}
fn default_model() -> String {
    "gpt-4.1-mini".to_string()
}
fn default_language() -> String {
    "en".to_string()
}
fn default_tts_provider() -> String {
    "openai".to_string()
}
fn default_tts_model() -> String {
    "gpt-4o-mini-tts".to_string()
}
fn default_tts_voice() -> String {
    "onyx".to_string()
}
fn default_retry_count() -> usize {
    3
}
fn default_retry_delay() -> u64 {
    10
}

/// Merged app configuration: `apps/default_config.yaml` overridden by
/// `apps/<app>/app_config.yaml`, both optional.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_beats")]
    pub beats: usize,

    #[serde(default = "default_section_length")]
    pub section_length: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_language")]
    pub language: String,

    #[serde(default = "default_tts_provider", alias = "tts-provider")]
    pub tts_provider: String,

    #[serde(default = "default_tts_model", alias = "tts-model")]
    pub tts_model: String,

    #[serde(default = "default_tts_voice", alias = "tts-voice")]
    pub tts_voice: String,

    #[serde(default = "default_retry_count")]
    pub retry_count: usize,

    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            beats: default_beats(),
            section_length: default_section_length(),
            model: default_model(),
            language: default_language(),
            tts_provider: default_tts_provider(),
            tts_model: default_tts_model(),
            tts_voice: default_tts_voice(),
            retry_count: default_retry_count(),
            retry_delay_seconds: default_retry_delay(),
        }
    }
}

fn load_yaml_map(path: &Path) -> Result<serde_yaml_ng::Mapping, ConfigError> {
    if !path.exists() {
        return Ok(serde_yaml_ng::Mapping::new());
    }
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value: serde_yaml_ng::Value =
        serde_yaml_ng::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    match value {
        serde_yaml_ng::Value::Mapping(map) => Ok(map),
        serde_yaml_ng::Value::Null => Ok(serde_yaml_ng::Mapping::new()),
        other => Err(ConfigError::Parse {
            path: path.to_path_buf(),
            message: format!("expected a mapping, got {other:?}"),
        }),
    }
}

/// Load defaults plus app overrides; overrides replace top-level keys only.
pub fn load_app_config(base_dir: &Path, app: &str) -> Result<AppConfig, ConfigError> {
    let defaults_path = base_dir.join("apps").join("default_config.yaml");
    let overrides_path = base_dir.join("apps").join(app).join("app_config.yaml");

    let mut merged = load_yaml_map(&defaults_path)?;
    for (key, value) in load_yaml_map(&overrides_path)? {
        if !value.is_null() {
            merged.insert(key, value);
        }
    }

    serde_yaml_ng::from_value(serde_yaml_ng::Value::Mapping(merged)).map_err(|e| {
        ConfigError::Parse {
            path: overrides_path,
            message: e.to_string(),
        }
    })
}

/// API credentials from `config/creds.json`. Several historical key
/// spellings are accepted for the OpenAI key.
#[derive(Debug, Clone, Default)]
pub struct Creds {
    pub openai_api_key: Option<String>,
    pub elevenlabs_api_key: Option<String>,
}

pub fn load_creds(config_dir: &Path) -> Result<Creds, ConfigError> {
    let path = config_dir.join("creds.json");
    if !path.exists() {
        return Ok(Creds::default());
    }
    let content = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    let value: serde_json::Value =
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path,
            message: e.to_string(),
        })?;

    let pick = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| value.get(*k).and_then(|v| v.as_str()))
            .map(|s| s.to_string())
    };

    Ok(Creds {
        openai_api_key: pick(&["openai_api_key", "OPENAI_KEY", "OPEN_AI", "OPENAI_API_KEY"]),
        elevenlabs_api_key: pick(&["ELEVENLABS_API_KEY", "elevenlabs_api_key"]),
    })
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub count: usize,
    pub delay_seconds: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            count: default_retry_count(),
            delay_seconds: default_retry_delay(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NarrationSettings {
    pub provider: String,
    pub model: String,
    pub voice: String,
}

/// Everything the pipeline needs, resolved once, immutable afterwards.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub app: String,
    pub app_dir: PathBuf,
    pub context_dir: PathBuf,
    pub config_dir: PathBuf,
    pub seed: String,
    pub beats: usize,
    pub section_length: String,
    pub model: String,
    pub language: String,
    pub word_count: Option<usize>,
    pub run_id: Option<String>,
    pub retry: RetryPolicy,
    /// None when narration is disabled; the run then ends at the critic.
    pub narration: Option<NarrationSettings>,
}

/// Midpoint of a "lo-hi" section length hint; falls back to 500.
pub fn section_length_midpoint(hint: &str) -> usize {
    let hint = hint.trim();
    if let Some((lo, hi)) = hint.split_once('-') {
        if let (Ok(lo), Ok(hi)) = (lo.trim().parse::<usize>(), hi.trim().parse::<usize>()) {
            if lo > 0 && hi >= lo {
                return (lo + hi) / 2;
            }
        }
    }
    hint.parse().unwrap_or(500)
}

fn length_window(per_section: f64) -> String {
    let lo = (per_section * 0.8) as usize;
    let hi = (per_section * 1.2) as usize;
    format!("{lo}-{hi}")
}

fn tts_provider_defaults(provider: &str) -> (&'static str, &'static str) {
    match provider {
        "elevenlabs" => (DEFAULT_ELEVENLABS_MODEL_ID, DEFAULT_ELEVENLABS_VOICE_ID),
        _ => ("gpt-4o-mini-tts", "onyx"),
    }
}

/// Build `RunSettings` from CLI args and the merged app config.
///
/// When a target word count is given, the beat count is derived from it
/// (clamped to 1-20) and the per-section length window is 0.8-1.2x of
/// `word_count / beats`.
pub fn resolve_run_settings(
    base_dir: &Path,
    cli: &CliArgs,
    app_config: &AppConfig,
) -> Result<RunSettings, ConfigError> {
    let app = cli
        .app
        .clone()
        .ok_or_else(|| ConfigError::InvalidSettings("app name is required".to_string()))?;
    let seed = cli
        .seed
        .clone()
        .ok_or_else(|| ConfigError::InvalidSettings("seed text is required".to_string()))?;
    if seed.trim().is_empty() {
        return Err(ConfigError::InvalidSettings(
            "seed text must not be empty".to_string(),
        ));
    }

    let app_dir = base_dir.join("apps").join(&app);
    if !app_dir.is_dir() {
        return Err(ConfigError::InvalidSettings(format!(
            "unknown app '{}': {} not found",
            app,
            app_dir.display()
        )));
    }

    if let Some(beats) = cli.beats {
        if !(MIN_BEATS..=MAX_BEATS).contains(&beats) {
            return Err(ConfigError::InvalidSettings(format!(
                "beats must be between {MIN_BEATS} and {MAX_BEATS}, got {beats}"
            )));
        }
    }

    let (beats, section_length) = match cli.word_count {
        Some(word_count) => {
            if let Some(beats) = cli.beats {
                (beats, length_window(word_count as f64 / beats as f64))
            } else {
                let baseline = cli
                    .section_length
                    .unwrap_or_else(|| section_length_midpoint(&app_config.section_length));
                let derived = (word_count as f64 / baseline as f64).round() as usize;
                let beats = derived.clamp(MIN_BEATS, MAX_BEATS);
                (beats, length_window(word_count as f64 / beats as f64))
            }
        }
        None => {
            let beats = cli.beats.unwrap_or(app_config.beats);
            if !(MIN_BEATS..=MAX_BEATS).contains(&beats) {
                return Err(ConfigError::InvalidSettings(format!(
                    "configured beats must be between {MIN_BEATS} and {MAX_BEATS}, got {beats}"
                )));
            }
            let section_length = match cli.section_length {
                Some(n) => length_window(n as f64),
                None => app_config.section_length.clone(),
            };
            (beats, section_length)
        }
    };

    let narration = if cli.no_narration {
        None
    } else {
        let provider = cli
            .tts_provider
            .clone()
            .unwrap_or_else(|| app_config.tts_provider.clone());
        // An explicit provider switch pulls that provider's defaults for any
        // missing model/voice; otherwise the app config supplies them.
        let use_provider_defaults = cli.tts_provider.is_some();
        let (default_model, default_voice) = tts_provider_defaults(&provider);
        let model = cli.tts_model.clone().unwrap_or_else(|| {
            if use_provider_defaults {
                default_model.to_string()
            } else {
                app_config.tts_model.clone()
            }
        });
        let voice = cli.tts_voice.clone().unwrap_or_else(|| {
            if use_provider_defaults {
                default_voice.to_string()
            } else {
                app_config.tts_voice.clone()
            }
        });
        Some(NarrationSettings {
            provider,
            model,
            voice,
        })
    };

    Ok(RunSettings {
        context_dir: app_dir.join("context"),
        config_dir: base_dir.join("config"),
        app_dir,
        app,
        seed,
        beats,
        section_length,
        model: cli.model.clone().unwrap_or_else(|| app_config.model.clone()),
        language: app_config.language.clone(),
        word_count: cli.word_count,
        run_id: cli.run_id.clone(),
        retry: RetryPolicy {
            count: app_config.retry_count,
            delay_seconds: app_config.retry_delay_seconds,
        },
        narration,
    })
}

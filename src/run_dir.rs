//! Run directory layout, atomic initialization, and the run log.
//!
//! A run directory is created in a build location and renamed into place, so
//! a failed initialization never leaves a partial run behind.

use chrono::Utc;
use log::warn;
use serde_json::json;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::RunSettings;
use crate::state::{RunState, TokenUsage};

#[derive(Debug, Error)]
pub enum RunDirError {
    #[error("run directory already exists: {0}")]
    AlreadyExists(PathBuf),
    #[error("failed to initialize run: {0}")]
    Init(String),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Write bytes to `path` via a temp file in `dir` plus an atomic rename.
pub fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub fn generate_run_id() -> String {
    format!("run-{}", Utc::now().format("%Y%m%d-%H%M%S"))
}

/// Paths inside one run directory.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub root: PathBuf,
}

impl RunPaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn run_id(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join("state.json")
    }

    pub fn inputs_path(&self) -> PathBuf {
        self.root.join("inputs.json")
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join("run.log")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join("artifacts")
    }

    pub fn llm_io_dir(&self, stage: &str) -> PathBuf {
        self.root.join("llm_io").join(stage)
    }

    pub fn tts_prompts_dir(&self) -> PathBuf {
        self.root.join("tts").join("prompts")
    }

    pub fn tts_outputs_dir(&self) -> PathBuf {
        self.root.join("tts").join("outputs")
    }

    pub fn voiceover_dir(&self) -> PathBuf {
        self.root.join("voiceover")
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> RunDirError {
    let path = path.to_path_buf();
    move |source| RunDirError::Io { path, source }
}

/// Create `runs/<run_id>/` with inputs.json, the initial state, an empty run
/// log, and the artifacts directory. Built under a temp name and renamed into
/// place; any failure removes the partial build.
pub fn initialize_run(
    base_dir: &Path,
    settings: &RunSettings,
    run_id: &str,
    initial_state: &RunState,
) -> Result<RunPaths, RunDirError> {
    let runs_dir = base_dir.join("runs");
    fs::create_dir_all(&runs_dir).map_err(io_err(&runs_dir))?;

    let final_dir = runs_dir.join(run_id);
    if final_dir.exists() {
        return Err(RunDirError::AlreadyExists(final_dir));
    }

    let build_dir = runs_dir.join(format!("_build_{run_id}"));
    if build_dir.exists() {
        fs::remove_dir_all(&build_dir).map_err(io_err(&build_dir))?;
    }

    let result = (|| -> Result<(), RunDirError> {
        fs::create_dir_all(build_dir.join("artifacts")).map_err(io_err(&build_dir))?;

        let inputs = json!({
            "run_id": run_id,
            "app": settings.app,
            "seed": settings.seed,
            "beats": settings.beats,
            "word_count": settings.word_count,
            "model": settings.model,
            "timestamp": Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            "context_dir": settings.context_dir.to_string_lossy(),
        });
        let inputs_path = build_dir.join("inputs.json");
        fs::write(
            &inputs_path,
            serde_json::to_string_pretty(&inputs)
                .map_err(|e| RunDirError::Init(e.to_string()))?,
        )
        .map_err(io_err(&inputs_path))?;

        let state_path = build_dir.join("state.json");
        let state_json = initial_state
            .to_pretty_json()
            .map_err(|e| RunDirError::Init(e.to_string()))?;
        fs::write(&state_path, state_json).map_err(io_err(&state_path))?;

        let log_path = build_dir.join("run.log");
        File::create(&log_path).map_err(io_err(&log_path))?;
        Ok(())
    })();

    if let Err(e) = result {
        let _ = fs::remove_dir_all(&build_dir);
        return Err(e);
    }

    fs::rename(&build_dir, &final_dir).map_err(|source| {
        let _ = fs::remove_dir_all(&build_dir);
        RunDirError::Io {
            path: final_dir.clone(),
            source,
        }
    })?;

    Ok(RunPaths::new(final_dir))
}

/// Append-only per-run log. Write failures are downgraded to warnings so a
/// full disk cannot mask the real stage error.
pub struct RunLog {
    file: File,
}

impl RunLog {
    pub fn open(path: &Path) -> Result<Self, RunDirError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_err(path))?;
        Ok(Self { file })
    }

    fn write_line(&mut self, level: &str, message: &str) {
        let stamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        if let Err(e) = writeln!(self.file, "{stamp} {level:<5} {message}") {
            warn!("run.log write failed: {e}");
        }
    }

    pub fn info(&mut self, message: &str) {
        self.write_line("INFO", message);
    }

    pub fn warn(&mut self, message: &str) {
        self.write_line("WARN", message);
    }

    pub fn error(&mut self, message: &str) {
        self.write_line("ERROR", message);
    }

    pub fn stage_start(&mut self, stage: &str) {
        self.write_line("INFO", &format!("stage {stage}: start"));
    }

    pub fn stage_end(&mut self, stage: &str, success: bool) {
        let outcome = if success { "ok" } else { "failed" };
        self.write_line("INFO", &format!("stage {stage}: {outcome}"));
    }

    pub fn artifact(&mut self, rel_path: &str, size_bytes: u64) {
        self.write_line("INFO", &format!("artifact {rel_path} ({size_bytes} bytes)"));
    }

    pub fn token_usage(&mut self, usage: &TokenUsage) {
        self.write_line(
            "INFO",
            &format!(
                "usage {}: {} {} prompt={} completion={} total={}",
                usage.stage,
                usage.provider,
                usage.model,
                usage.prompt_tokens,
                usage.completion_tokens,
                usage.total_tokens
            ),
        );
    }
}

/// Persist one stage's raw prompt/response pair plus metadata under
/// `llm_io/<stage>/`. Response is omitted while the call is pending or failed.
pub fn save_llm_io(
    paths: &RunPaths,
    stage: &str,
    prompt: &str,
    response: Option<&str>,
    meta: serde_json::Value,
) -> std::io::Result<()> {
    let dir = paths.llm_io_dir(stage);
    fs::create_dir_all(&dir)?;
    fs::write(dir.join("prompt.txt"), prompt)?;
    fs::write(
        dir.join("meta.json"),
        serde_json::to_string_pretty(&meta).unwrap_or_else(|_| "{}".to_string()),
    )?;
    if let Some(text) = response {
        fs::write(dir.join("response.txt"), text)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunSettings;

    fn settings(base: &Path) -> RunSettings {
        RunSettings {
            app: "demo".to_string(),
            app_dir: base.join("apps/demo"),
            context_dir: base.join("apps/demo/context"),
            config_dir: base.join("config"),
            seed: "A keeper finds a map.".to_string(),
            beats: 3,
            section_length: "400-600".to_string(),
            model: "gpt-4.1-mini".to_string(),
            language: "en".to_string(),
            word_count: None,
            run_id: None,
            retry: Default::default(),
            narration: None,
        }
    }

    #[test]
    fn test_initialize_run_creates_layout() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let base = tmp.path();
        let state = RunState::new("demo", "A keeper finds a map.");
        let paths = initialize_run(base, &settings(base), "run-20260101-000000", &state)?;

        assert!(paths.state_path().exists());
        assert!(paths.inputs_path().exists());
        assert!(paths.log_path().exists());
        assert!(paths.artifacts_dir().is_dir());
        // No build directory left behind.
        assert!(!base.join("runs").join("_build_run-20260101-000000").exists());
        Ok(())
    }

    #[test]
    fn test_initialize_run_rejects_duplicate_id() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let base = tmp.path();
        let state = RunState::new("demo", "seed");
        initialize_run(base, &settings(base), "run-x", &state)?;
        let err = initialize_run(base, &settings(base), "run-x", &state).unwrap_err();
        assert!(matches!(err, RunDirError::AlreadyExists(_)));
        Ok(())
    }

    #[test]
    fn test_save_llm_io_layout() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let paths = RunPaths::new(tmp.path().to_path_buf());
        save_llm_io(
            &paths,
            "outline",
            "prompt text",
            Some("response text"),
            json!({"status": "success"}),
        )?;
        let dir = paths.llm_io_dir("outline");
        assert_eq!(fs::read_to_string(dir.join("prompt.txt"))?, "prompt text");
        assert_eq!(
            fs::read_to_string(dir.join("response.txt"))?,
            "response text"
        );
        assert!(fs::read_to_string(dir.join("meta.json"))?.contains("success"));
        Ok(())
    }

    #[test]
    fn test_run_id_format() {
        let id = generate_run_id();
        assert!(id.starts_with("run-"));
        assert_eq!(id.len(), "run-YYYYMMDD-HHMMSS".len());
    }
}

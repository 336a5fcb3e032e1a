//! Run state document and its store.
//!
//! The state is the only carrier of cross-stage memory. It is replaced as a
//! whole document, atomically, and only after a stage has fully succeeded.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::run_dir::write_atomic;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file not found: {0}")]
    Missing(PathBuf),
    #[error("malformed state in {path}: {message}")]
    Malformed { path: PathBuf, message: String },
    #[error("error reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("error writing {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Context files selected for a run (basenames, for reproducibility).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectedContext {
    pub location: Option<String>,
    pub characters: Vec<String>,
    pub world_files: Vec<String>,
}

/// One ordered unit of the narrative outline. Ids are 1-based and sequential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlineBeat {
    pub beat_id: usize,
    pub title: String,
    pub summary: String,
}

/// Structured metadata extracted from a generated section's frontmatter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionMeta {
    pub section_id: usize,
    pub local_summary: String,
    #[serde(default)]
    pub new_entities: Vec<String>,
    #[serde(default)]
    pub new_locations: Vec<String>,
    #[serde(default)]
    pub unresolved_threads: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionSummary {
    pub section_id: usize,
    pub summary: String,
    #[serde(default)]
    pub continuity_updates: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub stage: String,
    pub provider: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentUsage {
    pub segment_id: usize,
    pub characters_billed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrationState {
    pub provider: String,
    pub model: String,
    pub voice: String,
    #[serde(default)]
    pub segments: Vec<SegmentUsage>,
    #[serde(default)]
    pub artifact_path: Option<String>,
}

/// The whole-run state document, persisted as `state.json` in the run directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub app: String,
    pub seed: String,
    #[serde(default)]
    pub selected_context: SelectedContext,
    #[serde(default)]
    pub outline: Vec<OutlineBeat>,
    #[serde(default)]
    pub sections: Vec<SectionMeta>,
    #[serde(default)]
    pub summaries: Vec<SectionSummary>,
    #[serde(default)]
    pub continuity_ledger: BTreeMap<String, String>,
    #[serde(default)]
    pub token_usage: Vec<TokenUsage>,
    #[serde(default)]
    pub final_script_path: Option<String>,
    #[serde(default)]
    pub editor_report_path: Option<String>,
    #[serde(default)]
    pub narration: Option<NarrationState>,
}

impl RunState {
    pub fn new(app: &str, seed: &str) -> Self {
        Self {
            app: app.to_string(),
            seed: seed.to_string(),
            selected_context: SelectedContext::default(),
            outline: Vec::new(),
            sections: Vec::new(),
            summaries: Vec::new(),
            continuity_ledger: BTreeMap::new(),
            token_usage: Vec::new(),
            final_script_path: None,
            editor_report_path: None,
            narration: None,
        }
    }

    pub fn to_pretty_json(&self) -> Result<String, StateError> {
        serde_json::to_string_pretty(self).map_err(|e| StateError::Malformed {
            path: PathBuf::from("state.json"),
            message: e.to_string(),
        })
    }
}

/// Loads and commits the run state. The single writer is the orchestrator;
/// commits are write-to-temp-then-rename so a crash never leaves half a state.
pub struct StateStore {
    run_dir: PathBuf,
}

impl StateStore {
    pub fn new(run_dir: &Path) -> Self {
        Self {
            run_dir: run_dir.to_path_buf(),
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.run_dir.join("state.json")
    }

    pub fn load(&self) -> Result<RunState, StateError> {
        let path = self.state_path();
        if !path.exists() {
            return Err(StateError::Missing(path));
        }
        let content = fs::read_to_string(&path).map_err(|source| StateError::Read {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|e| StateError::Malformed {
            path,
            message: e.to_string(),
        })
    }

    pub fn commit(&self, state: &RunState) -> Result<(), StateError> {
        let path = self.state_path();
        let content = state.to_pretty_json()?;
        write_atomic(&self.run_dir, &path, content.as_bytes()).map_err(|source| {
            StateError::Write {
                path: path.clone(),
                source,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> RunState {
        let mut state = RunState::new("demo", "A lighthouse keeper finds a map.");
        state.outline.push(OutlineBeat {
            beat_id: 1,
            title: "The map".to_string(),
            summary: "The keeper discovers a sealed chart.".to_string(),
        });
        state
            .continuity_ledger
            .insert("keeper".to_string(), "curious, on the tower".to_string());
        state
    }

    #[test]
    fn test_commit_then_load_roundtrip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = StateStore::new(dir.path());
        let state = sample_state();

        store.commit(&state)?;
        let loaded = store.load()?;
        assert_eq!(loaded, state);
        Ok(())
    }

    #[test]
    fn test_load_missing_fails_loudly() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert!(matches!(store.load(), Err(StateError::Missing(_))));
    }

    #[test]
    fn test_load_malformed_fails_loudly() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = StateStore::new(dir.path());
        fs::write(store.state_path(), b"{ not json")?;
        assert!(matches!(store.load(), Err(StateError::Malformed { .. })));
        Ok(())
    }

    #[test]
    fn test_commit_replaces_whole_document() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = StateStore::new(dir.path());
        let mut state = sample_state();
        store.commit(&state)?;

        state.summaries.push(SectionSummary {
            section_id: 1,
            summary: "The keeper opens the chart and sets a course.".to_string(),
            continuity_updates: BTreeMap::new(),
        });
        store.commit(&state)?;

        let loaded = store.load()?;
        assert_eq!(loaded.summaries.len(), 1);
        Ok(())
    }
}

//! Stage executors. Each one assembles a call payload from the run state,
//! invokes a provider, validates the structured response, writes its
//! artifacts, and returns the next state. A failing executor returns an
//! error without the orchestrator ever committing, so the persisted state is
//! untouched.

pub mod audio_prep;
pub mod critic;
pub mod narrate;
pub mod outline;
pub mod section;
pub mod summarize;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StepError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Llm(#[from] crate::llm::LlmError),
    #[error(transparent)]
    Tts(#[from] crate::tts::TtsError),
    #[error(transparent)]
    Audio(#[from] crate::audio::AudioError),
    #[error(transparent)]
    State(#[from] crate::state::StateError),
    #[error(transparent)]
    Context(#[from] crate::context::ContextError),
    #[error(transparent)]
    Chunk(#[from] crate::chunk::ChunkError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Strip a markdown code fence wrapper if the model added one.
pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if s.starts_with("```json") {
        s.trim_start_matches("```json")
            .trim_end_matches("```")
            .trim()
            .to_string()
    } else if s.starts_with("```") {
        s.trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
            .to_string()
    } else {
        s.to_string()
    }
}

/// Split a markdown document into (frontmatter YAML, body). Requires the
/// `---` markers at the very top.
pub fn split_frontmatter(content: &str) -> Result<(String, String), StepError> {
    let content = content.trim_start_matches('\u{feff}').trim_start();
    let rest = content.strip_prefix("---").ok_or_else(|| {
        StepError::Validation(
            "section content missing YAML frontmatter (expected --- markers)".to_string(),
        )
    })?;
    let rest = rest
        .strip_prefix("\r\n")
        .or_else(|| rest.strip_prefix('\n'))
        .ok_or_else(|| {
            StepError::Validation("frontmatter opening marker must end the line".to_string())
        })?;
    let end = rest.find("\n---").ok_or_else(|| {
        StepError::Validation(
            "section content missing closing frontmatter marker".to_string(),
        )
    })?;
    let yaml = rest[..end].trim_end_matches('\r').to_string();
    let body = rest[end + 4..].trim_start().to_string();
    Ok((yaml, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_blocks() {
        assert_eq!(strip_code_blocks("json"), "json");
        assert_eq!(strip_code_blocks("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("```\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("  ```json  \n  {}  \n  ```  "), "{}");
    }

    #[test]
    fn test_split_frontmatter() {
        let content = "---\nsection_id: 1\nlocal_summary: text\n---\n\nThe body.";
        let (yaml, body) = split_frontmatter(content).unwrap();
        assert_eq!(yaml, "section_id: 1\nlocal_summary: text");
        assert_eq!(body, "The body.");
    }

    #[test]
    fn test_split_frontmatter_missing_markers() {
        assert!(split_frontmatter("no frontmatter here").is_err());
        assert!(split_frontmatter("---\nunterminated: yes\n").is_err());
    }
}

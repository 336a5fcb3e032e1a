//! Summarize stage: compress one generated section and extract continuity
//! updates for the ledger.

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;

use crate::continuity::merge_ledger;
use crate::llm::{GenerateOptions, LlmClient};
use crate::run_dir::{save_llm_io, RunLog, RunPaths};
use crate::state::{RunState, SectionSummary};
use crate::steps::{section, strip_code_blocks, StepError};

pub const MIN_SUMMARY_CHARS: usize = 40;
pub const MAX_LEDGER_UPDATES: usize = 32;

pub fn stage_name(section_id: usize) -> String {
    format!("summarize_{section_id:02}")
}

#[derive(Deserialize)]
struct SummaryResponse {
    summary: String,
    #[serde(default)]
    continuity_updates: BTreeMap<String, String>,
}

fn build_prompt(section_id: usize, section_content: &str) -> String {
    format!(
        "Summarize section {section_id} below for use as rolling context in\n\
         later sections. Respond with JSON only, matching exactly:\n\
         {{\"section_id\": {section_id}, \"summary\": \"...\",\n\
          \"continuity_updates\": {{\"<dimension>\": \"<short fact>\"}}}}\n\
         The summary must cover plot, character state, and open threads in\n\
         3-5 sentences. continuity_updates keys name a continuity dimension\n\
         (a character's state, the current location, an open thread) and\n\
         values are short present-tense facts.\n\n\
         # Section\n{section_content}\n"
    )
}

fn validate_summary(
    raw: &str,
    section_id: usize,
) -> Result<SectionSummary, StepError> {
    let payload: SummaryResponse = serde_json::from_str(raw)
        .map_err(|e| StepError::Validation(format!("invalid JSON in summary response: {e}")))?;

    if payload.summary.trim().chars().count() < MIN_SUMMARY_CHARS {
        return Err(StepError::Validation(format!(
            "summary too short (minimum {MIN_SUMMARY_CHARS} characters)"
        )));
    }
    if payload.continuity_updates.len() > MAX_LEDGER_UPDATES {
        return Err(StepError::Validation(format!(
            "continuity_updates has {} entries; limit is {MAX_LEDGER_UPDATES}",
            payload.continuity_updates.len()
        )));
    }
    if payload.continuity_updates.keys().any(|k| k.trim().is_empty()) {
        return Err(StepError::Validation(
            "continuity_updates contains an empty key".to_string(),
        ));
    }

    Ok(SectionSummary {
        section_id,
        summary: payload.summary,
        continuity_updates: payload.continuity_updates,
    })
}

pub async fn execute(
    state: &RunState,
    llm: &dyn LlmClient,
    paths: &RunPaths,
    log: &mut RunLog,
    section_index: usize,
) -> Result<RunState, StepError> {
    let section_id = section_index + 1;
    let stage = stage_name(section_id);

    let artifact_path = paths.artifacts_dir().join(section::artifact_name(section_id));
    if !artifact_path.exists() {
        return Err(StepError::Validation(format!(
            "section artifact not found: {}",
            artifact_path.display()
        )));
    }
    let section_content = fs::read_to_string(&artifact_path)?;

    let prompt = build_prompt(section_id, &section_content);

    if let Err(e) = save_llm_io(
        paths,
        &stage,
        &prompt,
        None,
        json!({
            "status": "pending",
            "provider": llm.provider_name(),
            "model": llm.model_name(),
            "timestamp": Utc::now().to_rfc3339(),
        }),
    ) {
        log.warn(&format!("failed to save prompt for {stage}: {e}"));
    }

    // Lower temperature for summarization.
    let opts = GenerateOptions { temperature: 0.5 };
    let generation = match llm.generate(&prompt, opts).await {
        Ok(generation) => generation,
        Err(e) => {
            let _ = save_llm_io(
                paths,
                &stage,
                &prompt,
                None,
                json!({
                    "status": "error",
                    "provider": llm.provider_name(),
                    "model": llm.model_name(),
                    "error": e.to_string(),
                    "timestamp": Utc::now().to_rfc3339(),
                }),
            );
            return Err(e.into());
        }
    };

    if let Err(e) = save_llm_io(
        paths,
        &stage,
        &prompt,
        Some(&generation.text),
        json!({
            "status": "success",
            "provider": generation.provider,
            "model": generation.model,
            "prompt_tokens": generation.prompt_tokens,
            "completion_tokens": generation.completion_tokens,
            "total_tokens": generation.total_tokens,
            "timestamp": Utc::now().to_rfc3339(),
        }),
    ) {
        log.warn(&format!("failed to save response for {stage}: {e}"));
    }

    let cleaned = strip_code_blocks(&generation.text);
    let summary = validate_summary(&cleaned, section_id)?;
    let merged = merge_ledger(&state.continuity_ledger, &summary.continuity_updates);

    let usage = generation.usage(&stage);
    log.token_usage(&usage);

    let mut next = state.clone();
    next.summaries.push(summary);
    next.continuity_ledger = merged;
    next.token_usage.push(usage);
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD_SUMMARY: &str = "The keeper deciphers the chart, learns of the drowned city, \
and resolves to sail at first light despite the apprentice's warning.";

    #[test]
    fn test_valid_summary_accepted() {
        let raw = format!(
            r#"{{"section_id": 1, "summary": "{GOOD_SUMMARY}",
                "continuity_updates": {{"keeper": "resolved to sail"}}}}"#
        );
        let summary = validate_summary(&raw, 1).unwrap();
        assert_eq!(summary.section_id, 1);
        assert_eq!(
            summary.continuity_updates.get("keeper").map(String::as_str),
            Some("resolved to sail")
        );
    }

    #[test]
    fn test_short_summary_rejected() {
        let raw = r#"{"summary": "Too short.", "continuity_updates": {}}"#;
        let err = validate_summary(raw, 1).unwrap_err();
        assert!(err.to_string().contains("summary too short"));
    }

    #[test]
    fn test_invalid_json_rejected() {
        assert!(validate_summary("not json", 1).is_err());
    }

    #[test]
    fn test_empty_ledger_key_rejected() {
        let raw = format!(
            r#"{{"summary": "{GOOD_SUMMARY}", "continuity_updates": {{"": "oops"}}}}"#
        );
        assert!(validate_summary(&raw, 1).is_err());
    }

    #[test]
    fn test_missing_updates_default_empty() {
        let raw = format!(r#"{{"summary": "{GOOD_SUMMARY}"}}"#);
        let summary = validate_summary(&raw, 2).unwrap();
        assert!(summary.continuity_updates.is_empty());
    }
}

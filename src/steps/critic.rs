//! Critic stage: review the assembled draft, produce the corrected final
//! script plus a structured editor report.
//!
//! The model must answer in a strict two-block format:
//! ```text
//! ===FINAL_SCRIPT===
//! <markdown>
//! ===EDITOR_REPORT_JSON===
//! <JSON>
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs;

use crate::config::RunSettings;
use crate::context::PromptContext;
use crate::llm::{GenerateOptions, LlmClient};
use crate::run_dir::{save_llm_io, write_atomic, RunLog, RunPaths};
use crate::state::RunState;
use crate::steps::{section, split_frontmatter, StepError};

pub const STAGE: &str = "critic";

const FINAL_SCRIPT_MARKER: &str = "===FINAL_SCRIPT===";
const EDITOR_REPORT_MARKER: &str = "===EDITOR_REPORT_JSON===";

pub const FINAL_SCRIPT_REL: &str = "artifacts/final_script.md";
pub const EDITOR_REPORT_REL: &str = "artifacts/editor_report.json";

/// Exact top-level key set; additional keys are rejected.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EditorReport {
    pub issues_found: Vec<serde_json::Value>,
    pub changes_applied: Vec<serde_json::Value>,
}

/// Verify every section 1..=expected exists before the critic may run.
fn check_section_coverage(
    state: &RunState,
    paths: &RunPaths,
    expected: usize,
) -> Result<(), StepError> {
    let artifacts_dir = paths.artifacts_dir();
    let missing: Vec<String> = (1..=expected)
        .filter(|id| {
            let in_state = state.sections.iter().any(|s| s.section_id == *id);
            let on_disk = artifacts_dir.join(section::artifact_name(*id)).exists();
            !(in_state && on_disk)
        })
        .map(|id| id.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(StepError::Validation(format!(
            "section numbering has gaps; missing section ids: {}",
            missing.join(", ")
        )));
    }
    Ok(())
}

/// Concatenate all section bodies (frontmatter stripped) into the full draft.
fn load_full_draft(paths: &RunPaths, expected: usize) -> Result<String, StepError> {
    let mut parts = Vec::with_capacity(expected);
    for id in 1..=expected {
        let path = paths.artifacts_dir().join(section::artifact_name(id));
        let content = fs::read_to_string(&path)?;
        let (_, body) = split_frontmatter(&content).map_err(|e| {
            StepError::Validation(format!("section {id} artifact is malformed: {e}"))
        })?;
        parts.push(body);
    }
    Ok(parts.join("\n\n"))
}

pub fn parse_two_block_response(content: &str) -> Result<(String, EditorReport), StepError> {
    let script_start = content.find(FINAL_SCRIPT_MARKER).ok_or_else(|| {
        StepError::Validation(format!(
            "response missing required block marker {FINAL_SCRIPT_MARKER}"
        ))
    })?;
    let report_start = content.find(EDITOR_REPORT_MARKER).ok_or_else(|| {
        StepError::Validation(format!(
            "response missing required block marker {EDITOR_REPORT_MARKER}"
        ))
    })?;
    if report_start <= script_start {
        return Err(StepError::Validation(format!(
            "block markers in wrong order: {EDITOR_REPORT_MARKER} must come after {FINAL_SCRIPT_MARKER}"
        )));
    }

    let script = content[script_start + FINAL_SCRIPT_MARKER.len()..report_start].trim();
    if script.is_empty() {
        return Err(StepError::Validation(
            "final script block is empty".to_string(),
        ));
    }

    let report_raw = content[report_start + EDITOR_REPORT_MARKER.len()..].trim();
    let report: EditorReport = serde_json::from_str(report_raw).map_err(|e| {
        StepError::Validation(format!("invalid editor report JSON: {e}"))
    })?;

    Ok((script.to_string(), report))
}

fn build_prompt(state: &RunState, ctx: &PromptContext, full_draft: &str, outline_json: &str) -> String {
    format!(
        "You are the story's editor. Review the full draft below against the\n\
         outline, lore, and style rules. Fix continuity errors, repetition,\n\
         and style violations, then output the corrected full document.\n\
         Respond in exactly this two-block format and nothing else:\n\
         {FINAL_SCRIPT_MARKER}\n\
         <the corrected full story as markdown>\n\
         {EDITOR_REPORT_MARKER}\n\
         {{\"issues_found\": [\"...\"], \"changes_applied\": [\"...\"]}}\n\
         The JSON object must contain exactly those two keys.\n\n\
         # Seed\n{seed}\n\n\
         # Outline\n{outline}\n\n\
         # Lore\n{lore}\n\n\
         # Style rules\n{style}\n\n\
         # Location\n{location}\n\n\
         # Characters\n{characters}\n\n\
         # Full draft\n{draft}\n",
        seed = state.seed,
        outline = outline_json,
        lore = ctx.lore_bible,
        style = ctx.style_rules,
        location = ctx.location_context,
        characters = ctx.character_context,
        draft = full_draft,
    )
}

pub async fn execute(
    state: &RunState,
    _settings: &RunSettings,
    ctx: &PromptContext,
    llm: &dyn LlmClient,
    paths: &RunPaths,
    log: &mut RunLog,
) -> Result<RunState, StepError> {
    let expected = state.outline.len();
    if expected == 0 {
        return Err(StepError::Validation(
            "outline is empty; nothing to review".to_string(),
        ));
    }
    check_section_coverage(state, paths, expected)?;

    let full_draft = load_full_draft(paths, expected)?;
    let outline_json = serde_json::to_string_pretty(&state.outline)
        .map_err(|e| StepError::Validation(format!("outline serialization failed: {e}")))?;
    let prompt = build_prompt(state, ctx, &full_draft, &outline_json);

    if let Err(e) = save_llm_io(
        paths,
        STAGE,
        &prompt,
        None,
        json!({
            "status": "pending",
            "provider": llm.provider_name(),
            "model": llm.model_name(),
            "timestamp": Utc::now().to_rfc3339(),
        }),
    ) {
        log.warn(&format!("failed to save prompt for {STAGE}: {e}"));
    }

    let generation = match llm.generate(&prompt, GenerateOptions::default()).await {
        Ok(generation) => generation,
        Err(e) => {
            let _ = save_llm_io(
                paths,
                STAGE,
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
        STAGE,
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
        log.warn(&format!("failed to save response for {STAGE}: {e}"));
    }

    // Raw response kept as an artifact for post-mortems.
    let artifacts_dir = paths.artifacts_dir();
    if let Err(e) = fs::write(
        artifacts_dir.join("30_critic_raw_response.txt"),
        &generation.text,
    ) {
        log.warn(&format!("failed to write critic raw response artifact: {e}"));
    }

    let (final_script, report) = parse_two_block_response(&generation.text)?;

    write_atomic(
        &artifacts_dir,
        &artifacts_dir.join("final_script.md"),
        final_script.as_bytes(),
    )?;
    log.artifact(FINAL_SCRIPT_REL, final_script.len() as u64);

    let report_json = serde_json::to_string_pretty(&report)
        .map_err(|e| StepError::Validation(format!("report serialization failed: {e}")))?;
    write_atomic(
        &artifacts_dir,
        &artifacts_dir.join("editor_report.json"),
        report_json.as_bytes(),
    )?;
    log.artifact(EDITOR_REPORT_REL, report_json.len() as u64);

    let usage = generation.usage(STAGE);
    log.token_usage(&usage);

    let mut next = state.clone();
    next.final_script_path = Some(FINAL_SCRIPT_REL.to_string());
    next.editor_report_path = Some(EDITOR_REPORT_REL.to_string());
    next.token_usage.push(usage);
    Ok(next)
}

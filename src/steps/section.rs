//! Section stage: expand one outline beat into prose, carrying the rolling
//! summary and continuity ledger for consistency.

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::config::RunSettings;
use crate::context::PromptContext;
use crate::continuity::{build_rolling_summary, format_ledger, ROLLING_SUMMARY_MAX_CHARS};
use crate::llm::{GenerateOptions, LlmClient};
use crate::run_dir::{save_llm_io, write_atomic, RunLog, RunPaths};
use crate::state::{RunState, SectionMeta};
use crate::steps::{split_frontmatter, StepError};

pub const MIN_LOCAL_SUMMARY_CHARS: usize = 20;
pub const MAX_METADATA_ITEMS: usize = 20;

pub fn stage_name(section_id: usize) -> String {
    format!("section_{section_id:02}")
}

pub fn artifact_name(section_id: usize) -> String {
    format!("20_section_{section_id:02}.md")
}

#[derive(Deserialize)]
struct SectionFrontmatter {
    #[serde(default)]
    #[allow(dead_code)]
    section_id: Option<usize>,
    local_summary: String,
    #[serde(default)]
    new_entities: Vec<String>,
    #[serde(default)]
    new_locations: Vec<String>,
    #[serde(default)]
    unresolved_threads: Vec<String>,
}

fn build_prompt(
    state: &RunState,
    settings: &RunSettings,
    ctx: &PromptContext,
    section_id: usize,
    beat_json: &str,
    rolling_summary: &str,
    continuity: &str,
) -> String {
    format!(
        "You are writing section {section_id} of a story. Expand the outline\n\
         beat below into prose of about {length} words, in {language}.\n\
         Respond as markdown with YAML frontmatter between --- markers:\n\
         ---\n\
         section_id: {section_id}\n\
         local_summary: <2-3 sentence summary of this section>\n\
         new_entities: []\n\
         new_locations: []\n\
         unresolved_threads: []\n\
         ---\n\
         <section prose>\n\n\
         # Seed\n{seed}\n\n\
         # Outline beat\n{beat}\n\n\
         # Story so far\n{rolling}\n\n\
         # Continuity facts\n{continuity}\n\n\
         # Lore\n{lore}\n\n\
         # Style rules\n{style}\n\n\
         # Location\n{location}\n\n\
         # Characters\n{characters}\n",
        length = settings.section_length,
        language = settings.language,
        seed = state.seed,
        beat = beat_json,
        rolling = rolling_summary,
        lore = ctx.lore_bible,
        style = ctx.style_rules,
        location = ctx.location_context,
        characters = ctx.character_context,
    )
}

fn validate_frontmatter(
    yaml: &str,
    section_id: usize,
) -> Result<SectionMeta, StepError> {
    let parsed: SectionFrontmatter = serde_yaml_ng::from_str(yaml)
        .map_err(|e| StepError::Validation(format!("invalid YAML frontmatter: {e}")))?;

    if parsed.local_summary.trim().chars().count() < MIN_LOCAL_SUMMARY_CHARS {
        return Err(StepError::Validation(format!(
            "local_summary too short (minimum {MIN_LOCAL_SUMMARY_CHARS} characters)"
        )));
    }
    for (name, list) in [
        ("new_entities", &parsed.new_entities),
        ("new_locations", &parsed.new_locations),
        ("unresolved_threads", &parsed.unresolved_threads),
    ] {
        if list.len() > MAX_METADATA_ITEMS {
            return Err(StepError::Validation(format!(
                "{name} has {} entries; limit is {MAX_METADATA_ITEMS}",
                list.len()
            )));
        }
    }

    Ok(SectionMeta {
        section_id,
        local_summary: parsed.local_summary,
        new_entities: parsed.new_entities,
        new_locations: parsed.new_locations,
        unresolved_threads: parsed.unresolved_threads,
    })
}

pub async fn execute(
    state: &RunState,
    settings: &RunSettings,
    ctx: &PromptContext,
    llm: &dyn LlmClient,
    paths: &RunPaths,
    log: &mut RunLog,
    section_index: usize,
) -> Result<RunState, StepError> {
    let beat = state.outline.get(section_index).ok_or_else(|| {
        StepError::Validation(format!(
            "section index {section_index} out of range (outline has {} beats)",
            state.outline.len()
        ))
    })?;
    let section_id = section_index + 1;
    let stage = stage_name(section_id);

    let rolling = build_rolling_summary(&state.summaries, ROLLING_SUMMARY_MAX_CHARS);
    let continuity = format_ledger(&state.continuity_ledger);
    let beat_json = serde_json::to_string_pretty(beat)
        .map_err(|e| StepError::Validation(format!("beat serialization failed: {e}")))?;
    let prompt = build_prompt(
        state,
        settings,
        ctx,
        section_id,
        &beat_json,
        &rolling,
        &continuity,
    );

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

    let generation = match llm.generate(&prompt, GenerateOptions::default()).await {
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

    let (yaml, body) = split_frontmatter(&generation.text)?;
    let meta = validate_frontmatter(&yaml, section_id)?;
    if body.trim().is_empty() {
        return Err(StepError::Validation(
            "section body is empty after frontmatter".to_string(),
        ));
    }

    // Reconstruct the artifact with normalized frontmatter so downstream
    // stages can rely on the field set.
    let frontmatter = serde_yaml_ng::to_string(&meta)
        .map_err(|e| StepError::Validation(format!("frontmatter serialization failed: {e}")))?;
    let artifact = format!("---\n{}\n---\n\n{}", frontmatter.trim_end(), body);

    let artifacts_dir = paths.artifacts_dir();
    let rel = format!("artifacts/{}", artifact_name(section_id));
    write_atomic(
        &artifacts_dir,
        &artifacts_dir.join(artifact_name(section_id)),
        artifact.as_bytes(),
    )?;
    log.artifact(&rel, artifact.len() as u64);

    let usage = generation.usage(&stage);
    log.token_usage(&usage);

    let mut next = state.clone();
    next.sections.push(meta);
    next.token_usage.push(usage);
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frontmatter_validation_accepts_good_metadata() {
        let yaml = "section_id: 1\nlocal_summary: The keeper opens the sealed chart at last.\nnew_entities: [chart]\n";
        let meta = validate_frontmatter(yaml, 1).unwrap();
        assert_eq!(meta.section_id, 1);
        assert_eq!(meta.new_entities, vec!["chart"]);
        assert!(meta.unresolved_threads.is_empty());
    }

    #[test]
    fn test_frontmatter_overrides_model_section_id() {
        let yaml = "section_id: 99\nlocal_summary: The keeper opens the sealed chart at last.\n";
        let meta = validate_frontmatter(yaml, 4).unwrap();
        assert_eq!(meta.section_id, 4);
    }

    #[test]
    fn test_short_local_summary_rejected() {
        let yaml = "local_summary: too short\n";
        let err = validate_frontmatter(yaml, 1).unwrap_err();
        assert!(err.to_string().contains("local_summary too short"));
    }

    #[test]
    fn test_missing_local_summary_rejected() {
        let yaml = "section_id: 1\nnew_entities: []\n";
        assert!(validate_frontmatter(yaml, 1).is_err());
    }

    #[test]
    fn test_oversized_list_rejected() {
        let entities: Vec<String> = (0..25).map(|i| format!("- e{i}")).collect();
        let yaml = format!(
            "local_summary: The keeper opens the sealed chart at last.\nnew_entities:\n{}\n",
            entities.join("\n")
        );
        let err = validate_frontmatter(&yaml, 1).unwrap_err();
        assert!(err.to_string().contains("new_entities"));
    }

    #[test]
    fn test_stage_and_artifact_names() {
        assert_eq!(stage_name(3), "section_03");
        assert_eq!(artifact_name(12), "20_section_12.md");
    }
}

//! Outline stage: turn the seed into a fixed number of narrative beats.

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::config::RunSettings;
use crate::context::PromptContext;
use crate::llm::{GenerateOptions, LlmClient};
use crate::run_dir::{save_llm_io, write_atomic, RunLog, RunPaths};
use crate::state::{OutlineBeat, RunState};
use crate::steps::{strip_code_blocks, StepError};

pub const STAGE: &str = "outline";

#[derive(Deserialize)]
struct OutlineResponse {
    beats: Vec<BeatPayload>,
}

#[derive(Deserialize)]
struct BeatPayload {
    beat_id: usize,
    title: String,
    summary: String,
}

fn build_prompt(state: &RunState, settings: &RunSettings, ctx: &PromptContext) -> String {
    format!(
        "You are a story planner. Produce a narrative outline for the seed below.\n\
         Respond with JSON only, no prose, matching exactly:\n\
         {{\"beats\": [{{\"beat_id\": 1, \"title\": \"...\", \"summary\": \"...\"}}]}}\n\
         Rules: exactly {beats} beats, beat_id sequential starting at 1, every\n\
         title and summary non-empty. Write in {language}.\n\n\
         # Seed\n{seed}\n\n\
         # Lore\n{lore}\n\n\
         # Style rules\n{style}\n\n\
         # Location\n{location}\n\n\
         # Characters\n{characters}\n",
        beats = settings.beats,
        language = settings.language,
        seed = state.seed,
        lore = ctx.lore_bible,
        style = ctx.style_rules,
        location = ctx.location_context,
        characters = ctx.character_context,
    )
}

fn validate_beats(payload: OutlineResponse, requested: usize) -> Result<Vec<OutlineBeat>, StepError> {
    let returned = payload.beats.len();
    if returned != requested {
        return Err(StepError::Validation(format!(
            "outline returned {returned} beats, but {requested} were requested"
        )));
    }
    let mut beats = Vec::with_capacity(returned);
    for (position, beat) in payload.beats.into_iter().enumerate() {
        let expected_id = position + 1;
        if beat.beat_id != expected_id {
            return Err(StepError::Validation(format!(
                "outline beat ids must be sequential starting at 1; \
                 position {expected_id} has id {}",
                beat.beat_id
            )));
        }
        if beat.title.trim().is_empty() || beat.summary.trim().is_empty() {
            return Err(StepError::Validation(format!(
                "outline beat {expected_id} has an empty title or summary"
            )));
        }
        beats.push(OutlineBeat {
            beat_id: beat.beat_id,
            title: beat.title,
            summary: beat.summary,
        });
    }
    Ok(beats)
}

pub async fn execute(
    state: &RunState,
    settings: &RunSettings,
    ctx: &PromptContext,
    llm: &dyn LlmClient,
    paths: &RunPaths,
    log: &mut RunLog,
) -> Result<RunState, StepError> {
    let prompt = build_prompt(state, settings, ctx);

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

    let cleaned = strip_code_blocks(&generation.text);
    let payload: OutlineResponse = serde_json::from_str(&cleaned)
        .map_err(|e| StepError::Validation(format!("invalid JSON in outline response: {e}")))?;
    let beats = validate_beats(payload, settings.beats)?;

    let artifact = serde_json::to_string_pretty(&json!({ "beats": &beats }))
        .map_err(|e| StepError::Validation(format!("outline serialization failed: {e}")))?;
    let artifacts_dir = paths.artifacts_dir();
    let artifact_path = artifacts_dir.join("10_outline.json");
    write_atomic(&artifacts_dir, &artifact_path, artifact.as_bytes())?;
    log.artifact("artifacts/10_outline.json", artifact.len() as u64);

    let usage = generation.usage(STAGE);
    log.token_usage(&usage);

    let mut next = state.clone();
    next.outline = beats;
    next.token_usage.push(usage);
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(json: &str) -> OutlineResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_exact_beat_count_required() {
        let response = payload(
            r#"{"beats": [
                {"beat_id": 1, "title": "One", "summary": "First."},
                {"beat_id": 2, "title": "Two", "summary": "Second."}
            ]}"#,
        );
        let err = validate_beats(response, 3).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("returned 2 beats"), "{message}");
        assert!(message.contains("3 were requested"), "{message}");
    }

    #[test]
    fn test_sequential_ids_required() {
        let response = payload(
            r#"{"beats": [
                {"beat_id": 1, "title": "One", "summary": "First."},
                {"beat_id": 3, "title": "Three", "summary": "Third."}
            ]}"#,
        );
        let err = validate_beats(response, 2).unwrap_err();
        assert!(err.to_string().contains("sequential"));
    }

    #[test]
    fn test_empty_title_rejected() {
        let response = payload(
            r#"{"beats": [{"beat_id": 1, "title": "  ", "summary": "First."}]}"#,
        );
        assert!(validate_beats(response, 1).is_err());
    }

    #[test]
    fn test_valid_beats_accepted() {
        let response = payload(
            r#"{"beats": [
                {"beat_id": 1, "title": "One", "summary": "First."},
                {"beat_id": 2, "title": "Two", "summary": "Second."},
                {"beat_id": 3, "title": "Three", "summary": "Third."}
            ]}"#,
        );
        let beats = validate_beats(response, 3).unwrap();
        assert_eq!(beats.len(), 3);
        assert_eq!(beats[2].beat_id, 3);
    }
}

//! Assembly stage: stitch the synthesized segments, polish the voiceover,
//! loop and envelope the background music, and mix the final narration file.

use std::fs;
use std::path::PathBuf;

use crate::audio::{
    apply_envelope, loop_with_crossfade, mix, polish_voiceover, probe_duration, resolve_bg_music,
    stitch, PAD_END, PAD_START,
};
use crate::chunk::MAX_SEGMENTS;
use crate::config::RunSettings;
use crate::run_dir::{RunLog, RunPaths};
use crate::state::RunState;
use crate::steps::StepError;

pub const STAGE: &str = "audio_prep";

const SEGMENT_EXTS: &[&str] = &["mp3", "wav", "m4a", "ogg"];

/// Replace characters unsafe in filenames with underscores.
pub fn sanitize_filename_part(part: &str) -> String {
    let cleaned: String = part
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

/// Extract (dd, mm) from a `run-YYYYMMDD-...` id; ("00", "00") otherwise.
pub fn parse_run_id_day_month(run_id: &str) -> (String, String) {
    let digits = match run_id.trim().strip_prefix("run-") {
        Some(rest) if rest.len() >= 8 && rest[..8].chars().all(|c| c.is_ascii_digit()) => &rest[..8],
        _ => return ("00".to_string(), "00".to_string()),
    };
    (digits[6..8].to_string(), digits[4..6].to_string())
}

/// Final artifact name: story-<app>-<llm_model>-<tts_model>-<tts_voice>-<dd>-<mm>.<ext>
pub fn narration_artifact_name(
    app: &str,
    llm_model: &str,
    tts_model: &str,
    tts_voice: &str,
    run_id: &str,
    ext: &str,
) -> String {
    let (dd, mm) = parse_run_id_day_month(run_id);
    format!(
        "story-{}-{}-{}-{}-{dd}-{mm}.{ext}",
        sanitize_filename_part(app),
        sanitize_filename_part(llm_model),
        sanitize_filename_part(tts_model),
        sanitize_filename_part(tts_voice),
    )
}

/// Segment files from the synthesis stage, in order, with their extension.
fn discover_segments(paths: &RunPaths) -> Result<(Vec<PathBuf>, String), StepError> {
    let outputs_dir = paths.tts_outputs_dir();
    if !outputs_dir.is_dir() {
        return Err(StepError::Validation(format!(
            "tts outputs directory not found: {}",
            outputs_dir.display()
        )));
    }

    let mut ext: Option<String> = None;
    let mut segments = Vec::new();
    for id in 1..=MAX_SEGMENTS {
        match &ext {
            None => {
                let found = SEGMENT_EXTS.iter().find_map(|e| {
                    let p = outputs_dir.join(format!("segment_{id:02}.{e}"));
                    p.exists().then(|| (p, e.to_string()))
                });
                match found {
                    Some((path, e)) => {
                        segments.push(path);
                        ext = Some(e);
                    }
                    None if id == 1 => {
                        return Err(StepError::Validation(format!(
                            "no segment_01.* found in {}",
                            outputs_dir.display()
                        )))
                    }
                    None => break,
                }
            }
            Some(e) => {
                let path = outputs_dir.join(format!("segment_{id:02}.{e}"));
                if !path.exists() {
                    break;
                }
                segments.push(path);
            }
        }
    }

    match ext {
        Some(ext) if !segments.is_empty() => Ok((segments, ext)),
        _ => Err(StepError::Validation(format!(
            "no segment files found in {}",
            outputs_dir.display()
        ))),
    }
}

pub fn execute(
    state: &RunState,
    settings: &RunSettings,
    paths: &RunPaths,
    log: &mut RunLog,
    base_dir: &std::path::Path,
) -> Result<RunState, StepError> {
    let narration = state.narration.as_ref().ok_or_else(|| {
        StepError::Validation(
            "narration state missing; the synthesis stage must run first".to_string(),
        )
    })?;

    let (segments, ext) = discover_segments(paths)?;
    log.info(&format!("stitching {} segments", segments.len()));

    let voiceover_dir = paths.voiceover_dir();
    fs::create_dir_all(&voiceover_dir)?;
    let voiceover_path = voiceover_dir.join(format!("voiceover.{ext}"));
    let list_path = voiceover_dir.join("concat_list.txt");
    stitch(&segments, &list_path, &voiceover_path)?;

    let polished_path = voiceover_dir.join(format!("voiceover_polished.{ext}"));
    polish_voiceover(&voiceover_path, &polished_path)?;
    fs::rename(&polished_path, &voiceover_path)?;
    log.info("voiceover polish applied");

    let voice_duration = probe_duration(&voiceover_path)?;
    log.info(&format!("voiceover duration: {voice_duration:.2}s"));

    let bg_path = resolve_bg_music(base_dir, &state.app)?;
    log.info(&format!("background music: {}", bg_path.display()));
    let bg_duration = probe_duration(&bg_path)?;

    let bg_target = voice_duration + PAD_START + PAD_END;
    let looped_path = voiceover_dir.join("bg_looped.wav");
    loop_with_crossfade(&bg_path, bg_duration, bg_target, &looped_path)?;

    let enveloped_path = voiceover_dir.join("bg_enveloped.wav");
    apply_envelope(&looped_path, voice_duration, &enveloped_path)?;

    let out_name = narration_artifact_name(
        &state.app,
        &settings.model,
        &narration.model,
        &narration.voice,
        &paths.run_id(),
        &ext,
    );
    let out_path = paths.artifacts_dir().join(&out_name);
    mix(&voiceover_path, &enveloped_path, &out_path, &ext)?;

    let size = fs::metadata(&out_path).map(|m| m.len()).unwrap_or(0);
    let rel = format!("artifacts/{out_name}");
    log.artifact(&rel, size);
    log.info(&format!("audio prep complete: {}", out_path.display()));

    let mut next = state.clone();
    if let Some(n) = next.narration.as_mut() {
        n.artifact_path = Some(rel);
    }
    Ok(next)
}

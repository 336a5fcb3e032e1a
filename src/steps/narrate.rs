//! Synthesis stage: chunk the final script and synthesize each segment in
//! order, recording per-segment character usage.

use log::info;
use std::fs;

use crate::chunk::{chunk_script, ChunkLimits};
use crate::run_dir::{RunLog, RunPaths};
use crate::state::{NarrationState, RunState, SegmentUsage};
use crate::steps::StepError;
use crate::tts::TtsClient;

pub const STAGE: &str = "tts";

pub fn segment_prompt_name(segment_id: usize) -> String {
    format!("segment_{segment_id:02}.txt")
}

pub fn segment_output_name(segment_id: usize, ext: &str) -> String {
    format!("segment_{segment_id:02}.{ext}")
}

fn load_final_script(state: &RunState, paths: &RunPaths) -> Result<String, StepError> {
    let rel = state
        .final_script_path
        .as_deref()
        .unwrap_or(super::critic::FINAL_SCRIPT_REL);
    let path = paths.root.join(rel);
    if !path.exists() {
        return Err(StepError::Validation(format!(
            "final script not found: {}",
            path.display()
        )));
    }
    Ok(fs::read_to_string(&path)?)
}

pub async fn execute(
    state: &RunState,
    tts: &dyn TtsClient,
    paths: &RunPaths,
    log: &mut RunLog,
) -> Result<RunState, StepError> {
    let script = load_final_script(state, paths)?;
    let segments = chunk_script(&script, ChunkLimits::default())?;

    let prompts_dir = paths.tts_prompts_dir();
    let outputs_dir = paths.tts_outputs_dir();
    fs::create_dir_all(&prompts_dir)?;
    fs::create_dir_all(&outputs_dir)?;

    let total = segments.len();
    let ext = tts.audio_ext().to_string();
    let mut usage = Vec::with_capacity(total);

    for (index, segment) in segments.iter().enumerate() {
        let segment_id = index + 1;
        info!("synthesizing segment {segment_id}/{total}");
        log.info(&format!("tts segment {segment_id}/{total}"));
        if segment.imperfect {
            log.warn(&format!(
                "tts segment {segment_id}: no line break found in the cut window; \
                 cut at the word bound"
            ));
        }

        let prompt_path = prompts_dir.join(segment_prompt_name(segment_id));
        fs::write(&prompt_path, &segment.text)?;
        log.artifact(
            &format!("tts/prompts/{}", segment_prompt_name(segment_id)),
            segment.text.len() as u64,
        );

        let synthesis = tts.synthesize(&segment.text).await?;

        let out_path = outputs_dir.join(segment_output_name(segment_id, &ext));
        fs::write(&out_path, &synthesis.audio)?;
        log.artifact(
            &format!("tts/outputs/{}", segment_output_name(segment_id, &ext)),
            synthesis.audio.len() as u64,
        );
        log.info(&format!(
            "tts segment {segment_id}: {} characters billed ({})",
            synthesis.characters_billed, synthesis.provider
        ));

        usage.push(SegmentUsage {
            segment_id,
            characters_billed: synthesis.characters_billed,
        });
    }

    let total_characters: usize = usage.iter().map(|u| u.characters_billed).sum();
    log.info(&format!(
        "tts complete: {total} segments, {total_characters} characters billed"
    ));

    let mut next = state.clone();
    next.narration = Some(NarrationState {
        provider: tts.provider_name().to_string(),
        model: tts.model_name().to_string(),
        voice: tts.voice_name().to_string(),
        segments: usage,
        artifact_path: None,
    });
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tts::{Synthesis, TtsError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockTts {
        calls: AtomicUsize,
        fail_on: Option<usize>,
    }

    impl MockTts {
        fn new(fail_on: Option<usize>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_on,
            }
        }
    }

    #[async_trait]
    impl TtsClient for MockTts {
        fn provider_name(&self) -> &str {
            "mock"
        }
        fn model_name(&self) -> &str {
            "mock-tts"
        }
        fn voice_name(&self) -> &str {
            "narrator"
        }
        async fn synthesize(&self, text: &str) -> Result<Synthesis, TtsError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on == Some(call) {
                return Err(TtsError::EmptyAudio);
            }
            Ok(Synthesis {
                audio: vec![0u8; 16],
                characters_billed: text.chars().count(),
                provider: "mock".to_string(),
                model: "mock-tts".to_string(),
                voice: "narrator".to_string(),
            })
        }
    }

    fn run_paths_with_script(script: &str) -> (tempfile::TempDir, RunPaths, RunState) {
        let tmp = tempfile::tempdir().unwrap();
        let paths = RunPaths::new(tmp.path().to_path_buf());
        fs::create_dir_all(paths.artifacts_dir()).unwrap();
        fs::write(paths.artifacts_dir().join("final_script.md"), script).unwrap();
        let mut state = RunState::new("demo", "seed");
        state.final_script_path = Some("artifacts/final_script.md".to_string());
        (tmp, paths, state)
    }

    #[tokio::test]
    async fn test_synthesizes_all_segments_in_order() {
        let (_tmp, paths, state) = run_paths_with_script("A short story about a map.");
        let mut log = RunLog::open(&paths.root.join("run.log")).unwrap();
        let tts = MockTts::new(None);

        let next = execute(&state, &tts, &paths, &mut log).await.unwrap();
        let narration = next.narration.unwrap();
        assert_eq!(narration.provider, "mock");
        assert_eq!(narration.segments.len(), 1);
        assert_eq!(narration.segments[0].segment_id, 1);
        assert!(narration.segments[0].characters_billed > 0);
        assert!(paths.tts_outputs_dir().join("segment_01.mp3").exists());
        assert!(paths.tts_prompts_dir().join("segment_01.txt").exists());
    }

    #[tokio::test]
    async fn test_synthesis_failure_leaves_state_untouched() {
        let (_tmp, paths, state) = run_paths_with_script("A short story about a map.");
        let mut log = RunLog::open(&paths.root.join("run.log")).unwrap();
        let tts = MockTts::new(Some(1));

        let before = state.clone();
        let result = execute(&state, &tts, &paths, &mut log).await;
        assert!(result.is_err());
        assert_eq!(state, before);
        assert!(state.narration.is_none());
    }

    #[tokio::test]
    async fn test_missing_script_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = RunPaths::new(tmp.path().to_path_buf());
        let mut log = RunLog::open(&paths.root.join("run.log")).unwrap();
        let state = RunState::new("demo", "seed");
        let tts = MockTts::new(None);

        let err = execute(&state, &tts, &paths, &mut log).await.unwrap_err();
        assert!(err.to_string().contains("final script not found"));
    }
}

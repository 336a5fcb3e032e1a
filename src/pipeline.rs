//! Pipeline orchestrator: a linear state machine over the run stages.
//!
//! `Init → Outline → {Section(i) → Summarize(i)}* → Critic → [Tts →
//! AudioPrep]? → Done`, with any stage failure absorbing the run. No stage
//! runs until its predecessor has committed, and the state store is only
//! ever written here: executors compute the next state, the orchestrator
//! persists it.

use log::info;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::RunSettings;
use crate::context::{build_prompt_context, select_context, ContextError};
use crate::llm::LlmClient;
use crate::run_dir::{generate_run_id, initialize_run, RunDirError, RunLog, RunPaths};
use crate::state::{RunState, StateStore};
use crate::steps::{self, StepError};
use crate::tts::TtsClient;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuration failures surface before any run artifacts exist.
    #[error("context selection failed: {0}")]
    Context(#[from] ContextError),
    #[error(transparent)]
    Init(#[from] RunDirError),
    #[error("stage {stage} failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: StepError,
    },
}

#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub state: RunState,
}

fn finish_stage(
    store: &StateStore,
    log: &mut RunLog,
    stage: &str,
    result: Result<RunState, StepError>,
) -> Result<RunState, PipelineError> {
    match result {
        Ok(next) => match store.commit(&next) {
            Ok(()) => {
                log.stage_end(stage, true);
                Ok(next)
            }
            Err(e) => {
                log.stage_end(stage, false);
                Err(PipelineError::Stage {
                    stage: stage.to_string(),
                    source: e.into(),
                })
            }
        },
        Err(e) => {
            log.error(&format!("stage {stage} failed: {e}"));
            log.stage_end(stage, false);
            Err(PipelineError::Stage {
                stage: stage.to_string(),
                source: e,
            })
        }
    }
}

pub async fn run_pipeline(
    base_dir: &Path,
    settings: &RunSettings,
    llm: Box<dyn LlmClient>,
    tts: Option<Box<dyn TtsClient>>,
) -> Result<RunOutcome, PipelineError> {
    // Configuration work happens before the run directory exists, so a
    // failure here leaves nothing behind.
    let selected = select_context(&settings.context_dir)?;

    let run_id = settings
        .run_id
        .clone()
        .unwrap_or_else(generate_run_id);
    let mut initial = RunState::new(&settings.app, &settings.seed);
    initial.selected_context = selected;

    let paths: RunPaths = initialize_run(base_dir, settings, &run_id, &initial)?;
    let store = StateStore::new(&paths.root);
    let mut log = RunLog::open(&paths.log_path())?;
    log.info(&format!(
        "initialized run '{run_id}' for app '{}'",
        settings.app
    ));
    info!("run directory: {}", paths.root.display());

    let prompt_ctx = build_prompt_context(&settings.context_dir, &initial.selected_context)
        .map_err(|e| PipelineError::Stage {
            stage: "context".to_string(),
            source: e.into(),
        })?;

    let mut state = initial;

    log.stage_start(steps::outline::STAGE);
    let result =
        steps::outline::execute(&state, settings, &prompt_ctx, llm.as_ref(), &paths, &mut log)
            .await;
    state = finish_stage(&store, &mut log, steps::outline::STAGE, result)?;

    let beat_count = state.outline.len();
    info!("generating {beat_count} section(s)");
    for index in 0..beat_count {
        let stage = steps::section::stage_name(index + 1);
        log.stage_start(&stage);
        let result = steps::section::execute(
            &state,
            settings,
            &prompt_ctx,
            llm.as_ref(),
            &paths,
            &mut log,
            index,
        )
        .await;
        state = finish_stage(&store, &mut log, &stage, result)?;

        let stage = steps::summarize::stage_name(index + 1);
        log.stage_start(&stage);
        let result =
            steps::summarize::execute(&state, llm.as_ref(), &paths, &mut log, index).await;
        state = finish_stage(&store, &mut log, &stage, result)?;
    }

    log.stage_start(steps::critic::STAGE);
    let result =
        steps::critic::execute(&state, settings, &prompt_ctx, llm.as_ref(), &paths, &mut log)
            .await;
    state = finish_stage(&store, &mut log, steps::critic::STAGE, result)?;

    match tts {
        Some(tts) => {
            log.stage_start(steps::narrate::STAGE);
            let result = steps::narrate::execute(&state, tts.as_ref(), &paths, &mut log).await;
            state = finish_stage(&store, &mut log, steps::narrate::STAGE, result)?;

            log.stage_start(steps::audio_prep::STAGE);
            let result = steps::audio_prep::execute(&state, settings, &paths, &mut log, base_dir);
            state = finish_stage(&store, &mut log, steps::audio_prep::STAGE, result)?;
        }
        None => {
            log.info("narration disabled; run complete at critic");
        }
    }

    log.info("pipeline completed successfully");
    Ok(RunOutcome {
        run_id,
        run_dir: paths.root,
        state,
    })
}

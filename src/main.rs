use anyhow::{Context, Result};

use storytell::llm::estimate_run_cost;
use storytell::{cli, config, llm, pipeline, tts};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = cli::parse_args(std::env::args().skip(1))?;
    let base_dir = std::env::current_dir().context("cannot determine working directory")?;

    let app_config = config::load_app_config(&base_dir, args.app.as_deref().unwrap_or_default())?;
    let settings = config::resolve_run_settings(&base_dir, &args, &app_config)?;
    let creds = config::load_creds(&settings.config_dir)?;

    let llm_client = llm::create_llm_client(&settings.model, &creds, &settings.retry)?;
    let tts_client = match &settings.narration {
        Some(narration) => Some(tts::create_tts_client(narration, &creds, &settings.retry)?),
        None => None,
    };

    println!(
        "[storytell] Starting run for app '{}' ({} beats)...",
        settings.app, settings.beats
    );

    let outcome = pipeline::run_pipeline(&base_dir, &settings, llm_client, tts_client).await?;

    println!("[storytell] Run complete: {}", outcome.run_id);
    println!("[storytell] Run directory: {}", outcome.run_dir.display());

    let cost = estimate_run_cost(&outcome.state.token_usage);
    if let Some(model) = &cost.model {
        println!("[storytell] Model: {model}");
    }
    if cost.total_tokens > 0 {
        println!(
            "[storytell] Tokens: {} prompt, {} completion ({} total)",
            cost.prompt_tokens, cost.completion_tokens, cost.total_tokens
        );
    }
    match cost.cost_usd {
        Some(usd) => println!("[storytell] Estimated cost: ~${usd:.4} (standard pricing)"),
        None if cost.model.is_some() => {
            println!("[storytell] Estimated cost: N/A (model not in pricing table)")
        }
        None => {}
    }
    if let Some(narration) = &outcome.state.narration {
        let characters: usize = narration.segments.iter().map(|s| s.characters_billed).sum();
        println!(
            "[storytell] Narration: {} segments, {characters} characters ({})",
            narration.segments.len(),
            narration.provider
        );
    }
    println!(
        "[storytell] Artifacts are in: {}",
        outcome.run_dir.join("artifacts").display()
    );

    Ok(())
}

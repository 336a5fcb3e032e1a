//! Thin command-line surface. Everything here is resolved into a single
//! immutable `RunSettings` before the orchestrator is invoked.

use anyhow::{anyhow, bail, Result};

pub const USAGE: &str = "\
Usage: storytell --app <name> --seed <text> [options]

Options:
  --app <name>            App profile under apps/ (required)
  --seed <text>           Story seed (required)
  --beats <n>             Outline beat count (1-20)
  --word-count <n>        Target total word count (derives beats)
  --section-length <n>    Target words per section
  --model <id>            LLM model override
  --tts-provider <id>     TTS provider (openai, elevenlabs)
  --tts-model <id>        TTS model override
  --tts-voice <id>        TTS voice override
  --no-narration          Stop after the critic stage
  --run-id <id>           Run id override (default: run-YYYYMMDD-HHMMSS)
";

pub const MIN_WORD_COUNT: usize = 100;
pub const MAX_WORD_COUNT: usize = 50_000;

#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub app: Option<String>,
    pub seed: Option<String>,
    pub beats: Option<usize>,
    pub word_count: Option<usize>,
    pub section_length: Option<usize>,
    pub model: Option<String>,
    pub tts_provider: Option<String>,
    pub tts_model: Option<String>,
    pub tts_voice: Option<String>,
    pub no_narration: bool,
    pub run_id: Option<String>,
}

pub fn parse_args<I>(args: I) -> Result<CliArgs>
where
    I: IntoIterator<Item = String>,
{
    let mut parsed = CliArgs::default();
    let mut iter = args.into_iter();

    fn value(iter: &mut impl Iterator<Item = String>, flag: &str) -> Result<String> {
        iter.next()
            .ok_or_else(|| anyhow!("missing value for {flag}\n\n{USAGE}"))
    }

    fn number(raw: &str, flag: &str) -> Result<usize> {
        raw.parse()
            .map_err(|_| anyhow!("{flag} expects a number, got '{raw}'"))
    }

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--app" => parsed.app = Some(value(&mut iter, "--app")?),
            "--seed" => parsed.seed = Some(value(&mut iter, "--seed")?),
            "--beats" => {
                parsed.beats = Some(number(&value(&mut iter, "--beats")?, "--beats")?);
            }
            "--word-count" => {
                let n = number(&value(&mut iter, "--word-count")?, "--word-count")?;
                if !(MIN_WORD_COUNT..=MAX_WORD_COUNT).contains(&n) {
                    bail!(
                        "--word-count must be between {MIN_WORD_COUNT} and {MAX_WORD_COUNT}, got {n}"
                    );
                }
                parsed.word_count = Some(n);
            }
            "--section-length" => {
                parsed.section_length = Some(number(
                    &value(&mut iter, "--section-length")?,
                    "--section-length",
                )?);
            }
            "--model" => parsed.model = Some(value(&mut iter, "--model")?),
            "--tts-provider" => parsed.tts_provider = Some(value(&mut iter, "--tts-provider")?),
            "--tts-model" => parsed.tts_model = Some(value(&mut iter, "--tts-model")?),
            "--tts-voice" => parsed.tts_voice = Some(value(&mut iter, "--tts-voice")?),
            "--no-narration" => parsed.no_narration = true,
            "--run-id" => parsed.run_id = Some(value(&mut iter, "--run-id")?),
            "--help" | "-h" => bail!("{USAGE}"),
            other => bail!("unknown argument '{other}'\n\n{USAGE}"),
        }
    }

    if parsed.app.is_none() || parsed.seed.is_none() {
        bail!("--app and --seed are required\n\n{USAGE}");
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<CliArgs> {
        parse_args(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_minimal_args() {
        let args = parse(&["--app", "demo", "--seed", "a map"]).unwrap();
        assert_eq!(args.app.as_deref(), Some("demo"));
        assert_eq!(args.seed.as_deref(), Some("a map"));
        assert!(!args.no_narration);
    }

    #[test]
    fn test_all_flags() {
        let args = parse(&[
            "--app",
            "demo",
            "--seed",
            "s",
            "--beats",
            "3",
            "--model",
            "gpt-4.1",
            "--tts-provider",
            "elevenlabs",
            "--no-narration",
            "--run-id",
            "run-x",
        ])
        .unwrap();
        assert_eq!(args.beats, Some(3));
        assert_eq!(args.model.as_deref(), Some("gpt-4.1"));
        assert_eq!(args.tts_provider.as_deref(), Some("elevenlabs"));
        assert!(args.no_narration);
        assert_eq!(args.run_id.as_deref(), Some("run-x"));
    }

    #[test]
    fn test_missing_required_args() {
        assert!(parse(&["--app", "demo"]).is_err());
        assert!(parse(&["--seed", "s"]).is_err());
    }

    #[test]
    fn test_word_count_range() {
        assert!(parse(&["--app", "a", "--seed", "s", "--word-count", "5"]).is_err());
        assert!(parse(&["--app", "a", "--seed", "s", "--word-count", "5000"]).is_ok());
    }

    #[test]
    fn test_unknown_flag_rejected() {
        assert!(parse(&["--app", "a", "--seed", "s", "--frobnicate"]).is_err());
    }

    #[test]
    fn test_bad_number_rejected() {
        assert!(parse(&["--app", "a", "--seed", "s", "--beats", "three"]).is_err());
    }
}

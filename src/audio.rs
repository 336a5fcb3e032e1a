//! External audio processing: stitching, looping with crossfade, volume
//! envelope, and the final mix. All heavy lifting is delegated to ffmpeg and
//! ffprobe; any non-zero exit is fatal for the stage.

use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// Crossfade at loop boundaries when extending background music.
pub const BG_LOOP_CROSSFADE: f64 = 2.0;
/// Music-only intro before the voiceover starts.
pub const PAD_START: f64 = 3.0;
/// Music-only outro after the voiceover ends.
pub const PAD_END: f64 = 3.0;
/// How long the background holds its opening level before fading down.
pub const ENVELOPE_INTRO_HOLD: f64 = 1.5;
/// Closing fade-up duration after the narration ends.
pub const ENVELOPE_CLOSE_FADE: f64 = 2.0;
pub const LEVEL_HIGH: f64 = 0.65;
pub const LEVEL_UNDER_NARRATION: f64 = 0.05;
pub const LEVEL_CLOSING: f64 = 0.70;

/// Voiceover gain relative to the background in the final mix.
pub const VOICE_GAIN: f64 = 1.75;

/// Single-pass voiceover polish: clean rumble/harshness, normalize, light
/// reverb, de-ess, limit.
pub const VOICEOVER_POLISH_FILTER: &str = "highpass=f=80,lowpass=f=16000,\
equalizer=f=3000:t=q:w=1.2:g=-2,dynaudnorm=f=150:g=7,\
aecho=0.8:0.88:20|40:0.15|0.10,highpass=f=80,\
equalizer=f=7500:t=q:w=1.0:g=-4,equalizer=f=9500:t=q:w=1.0:g=-2,\
alimiter=limit=0.97";

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("failed to launch {tool}: {source} (is it installed?)")]
    ToolMissing {
        tool: &'static str,
        source: std::io::Error,
    },
    #[error("{context}: {tool} exited with {status}; stderr: {stderr}")]
    ToolFailed {
        context: String,
        tool: &'static str,
        status: i32,
        stderr: String,
    },
    #[error("no background music found: tried {app_pattern} and {default_path}")]
    MissingMusic {
        app_pattern: String,
        default_path: PathBuf,
    },
    #[error("invalid duration reported by ffprobe for {path}: {raw}")]
    BadDuration { path: PathBuf, raw: String },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

fn run_tool(tool: &'static str, args: &[String], context: &str) -> Result<String, AudioError> {
    let output = Command::new(tool)
        .args(args)
        .output()
        .map_err(|source| AudioError::ToolMissing { tool, source })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(AudioError::ToolFailed {
            context: context.to_string(),
            tool,
            status: output.status.code().unwrap_or(-1),
            stderr: if stderr.is_empty() {
                "(no stderr)".to_string()
            } else {
                stderr
            },
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn run_ffmpeg(args: &[String], context: &str) -> Result<(), AudioError> {
    let mut full = vec!["-y".to_string()];
    full.extend_from_slice(args);
    run_tool("ffmpeg", &full, context).map(|_| ())
}

fn run_ffprobe(args: &[String], context: &str) -> Result<String, AudioError> {
    run_tool("ffprobe", args, context)
}

fn s(value: impl ToString) -> String {
    value.to_string()
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

pub fn probe_duration(path: &Path) -> Result<f64, AudioError> {
    let raw = run_ffprobe(
        &[
            s("-v"),
            s("error"),
            s("-show_entries"),
            s("format=duration"),
            s("-of"),
            s("default=noprint_wrappers=1:nokey=1"),
            path_arg(path),
        ],
        &format!("get duration of {}", path.display()),
    )?;
    raw.trim().parse::<f64>().map_err(|_| AudioError::BadDuration {
        path: path.to_path_buf(),
        raw,
    })
}

/// Concatenate segment files into one track via the concat demuxer. The list
/// file is written next to the output.
pub fn stitch(inputs: &[PathBuf], list_path: &Path, out: &Path) -> Result<(), AudioError> {
    let lines: Vec<String> = inputs
        .iter()
        .map(|p| format!("file '{}'", path_arg(p).replace('\'', "'\\''")))
        .collect();
    fs::write(list_path, lines.join("\n") + "\n").map_err(|source| AudioError::Io {
        path: list_path.to_path_buf(),
        source,
    })?;

    run_ffmpeg(
        &[
            s("-f"),
            s("concat"),
            s("-safe"),
            s("0"),
            s("-i"),
            path_arg(list_path),
            s("-c"),
            s("copy"),
            path_arg(out),
        ],
        "stitch segments",
    )
}

pub fn polish_voiceover(input: &Path, out: &Path) -> Result<(), AudioError> {
    run_ffmpeg(
        &[
            s("-i"),
            path_arg(input),
            s("-af"),
            s(VOICEOVER_POLISH_FILTER),
            path_arg(out),
        ],
        "voiceover polish (clean, reverb, de-ess, limit)",
    )
}

/// Number of source copies needed so that n copies crossfaded by `crossfade`
/// cover `total` seconds: n*duration - (n-1)*crossfade >= total.
pub fn crossfade_copy_count(duration: f64, total: f64, crossfade: f64) -> usize {
    if duration <= crossfade {
        return ((total / duration) as usize).max(1) + 1;
    }
    let n = ((total - crossfade) / (duration - crossfade)).floor() as usize + 1;
    n.max(1)
}

/// Extend the background track to `total` seconds, crossfading at loop
/// points. Sources shorter than the crossfade window are looped plainly.
pub fn loop_with_crossfade(
    bg: &Path,
    bg_duration: f64,
    total: f64,
    out: &Path,
) -> Result<(), AudioError> {
    let d = BG_LOOP_CROSSFADE;

    if bg_duration <= d {
        let n = crossfade_copy_count(bg_duration, total, d);
        run_ffmpeg(
            &[
                s("-stream_loop"),
                s(n),
                s("-i"),
                path_arg(bg),
                s("-t"),
                s(total),
                s("-c"),
                s("copy"),
                path_arg(out),
            ],
            "loop background (no crossfade)",
        )?;
    } else {
        let n = crossfade_copy_count(bg_duration, total, d);
        if n == 1 {
            run_ffmpeg(
                &[
                    s("-i"),
                    path_arg(bg),
                    s("-t"),
                    s(total),
                    s("-c"),
                    s("copy"),
                    path_arg(out),
                ],
                "trim single background copy",
            )?;
        } else {
            let mut args: Vec<String> = Vec::new();
            for _ in 0..n {
                args.push(s("-i"));
                args.push(path_arg(bg));
            }
            let mut parts = vec![format!("[0:a][1:a]acrossfade=d={d}:c1=tri:c2=tri[o1]")];
            for i in 2..n {
                parts.push(format!(
                    "[o{}][{i}:a]acrossfade=d={d}:c1=tri:c2=tri[o{i}]",
                    i - 1
                ));
            }
            parts.push(format!(
                "[o{}]atrim=0:{total},asetpts=PTS-STARTPTS[out]",
                n - 1
            ));
            args.extend([
                s("-filter_complex"),
                parts.join(";"),
                s("-map"),
                s("[out]"),
                s("-c:a"),
                s("pcm_s16le"),
                path_arg(out),
            ]);
            run_ffmpeg(&args, "loop background with crossfade")?;
        }
    }
    info!("looped background music to {total}s");
    Ok(())
}

/// Piecewise gain curve for the background under narration. Four control
/// points: hold the opening level, fade down before the voice starts, stay
/// low under the voice, fade up to the closing level once it ends.
pub fn envelope_expr(voice_duration: f64) -> String {
    let fade_down_end = PAD_START;
    let fade_down_span = PAD_START - ENVELOPE_INTRO_HOLD;
    let drop = LEVEL_HIGH - LEVEL_UNDER_NARRATION;
    let flat_end = PAD_START + voice_duration;
    let close_end = flat_end + ENVELOPE_CLOSE_FADE;
    let rise = LEVEL_CLOSING - LEVEL_UNDER_NARRATION;
    format!(
        "if(lt(t,{ENVELOPE_INTRO_HOLD}),{LEVEL_HIGH},\
if(lt(t,{fade_down_end}),{LEVEL_HIGH}-(t-{ENVELOPE_INTRO_HOLD})/{fade_down_span}*{drop},\
if(lt(t,{flat_end}),{LEVEL_UNDER_NARRATION},\
if(lt(t,{close_end}),{LEVEL_UNDER_NARRATION}+(t-{flat_end})/{ENVELOPE_CLOSE_FADE}*{rise},\
{LEVEL_CLOSING}))))"
    )
}

pub fn apply_envelope(input: &Path, voice_duration: f64, out: &Path) -> Result<(), AudioError> {
    // Commas inside -af separate filters; escape them so ffmpeg parses a
    // single volume filter.
    let expr = envelope_expr(voice_duration).replace(',', "\\,");
    run_ffmpeg(
        &[
            s("-i"),
            path_arg(input),
            s("-af"),
            format!("volume={expr}"),
            s("-c:a"),
            s("pcm_s16le"),
            path_arg(out),
        ],
        "apply background volume envelope",
    )
}

/// Mix voiceover and background into the final track. The voiceover sits
/// from PAD_START to PAD_START + its duration; the background supplies the
/// intro and outro.
pub fn mix(voice: &Path, bg: &Path, out: &Path, ext: &str) -> Result<(), AudioError> {
    let codec: &[&str] = if ext.eq_ignore_ascii_case("wav") {
        &["-c:a", "pcm_s16le"]
    } else {
        &["-c:a", "libmp3lame", "-q:a", "2"]
    };
    let delay_ms = (PAD_START * 1000.0) as u64;
    let filter = format!(
        "[0:a]volume={VOICE_GAIN},adelay={delay_ms}|{delay_ms},apad=pad_dur={PAD_END}[vo];\
[vo][1:a]amix=inputs=2:duration=first[aout]"
    );
    let mut args = vec![
        s("-i"),
        path_arg(voice),
        s("-i"),
        path_arg(bg),
        s("-filter_complex"),
        filter,
        s("-map"),
        s("[aout]"),
    ];
    args.extend(codec.iter().map(|c| c.to_string()));
    args.push(path_arg(out));
    run_ffmpeg(&args, "mix voiceover and background")
}

/// Resolve the background music source: app override first, then the
/// platform default.
pub fn resolve_bg_music(base_dir: &Path, app: &str) -> Result<PathBuf, AudioError> {
    let app_assets = base_dir.join("apps").join(app).join("assets");
    if app_assets.is_dir() {
        let mut matches: Vec<PathBuf> = fs::read_dir(&app_assets)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| {
                        p.file_name()
                            .map(|n| n.to_string_lossy().starts_with("bg-music."))
                            .unwrap_or(false)
                    })
                    .collect()
            })
            .unwrap_or_default();
        matches.sort();
        if let Some(first) = matches.into_iter().next() {
            return Ok(first);
        }
    }
    let default_path = base_dir.join("assets").join("default-bg-music.wav");
    if default_path.exists() {
        return Ok(default_path);
    }
    Err(AudioError::MissingMusic {
        app_pattern: app_assets.join("bg-music.*").display().to_string(),
        default_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crossfade_copy_count_covers_target() {
        // n copies crossfaded by d must cover the target length.
        for (duration, total) in [(30.0, 95.0), (10.0, 10.0), (8.0, 100.0), (45.0, 44.0)] {
            let n = crossfade_copy_count(duration, total, BG_LOOP_CROSSFADE);
            let covered = n as f64 * duration - (n as f64 - 1.0) * BG_LOOP_CROSSFADE;
            assert!(
                covered >= total,
                "duration={duration} total={total}: {n} copies cover only {covered}s"
            );
        }
    }

    #[test]
    fn test_crossfade_copy_count_short_source() {
        // Source shorter than the crossfade window: plain loop count.
        let n = crossfade_copy_count(1.5, 10.0, BG_LOOP_CROSSFADE);
        assert!(n as f64 * 1.5 >= 10.0);
    }

    #[test]
    fn test_envelope_control_points() {
        let expr = envelope_expr(60.0);
        // Opening hold, fade-down boundary, flat end, close end.
        assert!(expr.contains("lt(t,1.5)"));
        assert!(expr.contains("lt(t,3)"));
        assert!(expr.contains("lt(t,63)"));
        assert!(expr.contains("lt(t,65)"));
        assert!(expr.contains("0.65"));
        assert!(expr.contains("0.05"));
        assert!(expr.ends_with("0.7))))"));
    }

    #[test]
    fn test_envelope_expr_has_no_raw_commas_after_escape() {
        let escaped = envelope_expr(10.0).replace(',', "\\,");
        assert!(!escaped
            .replace("\\,", "")
            .contains(','));
    }

    #[test]
    fn test_resolve_bg_music_prefers_app_override() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let base = tmp.path();
        fs::create_dir_all(base.join("apps/demo/assets"))?;
        fs::create_dir_all(base.join("assets"))?;
        fs::write(base.join("apps/demo/assets/bg-music.mp3"), b"x")?;
        fs::write(base.join("assets/default-bg-music.wav"), b"x")?;

        let resolved = resolve_bg_music(base, "demo")?;
        assert!(resolved.ends_with("apps/demo/assets/bg-music.mp3"));
        Ok(())
    }

    #[test]
    fn test_resolve_bg_music_falls_back_to_default() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let base = tmp.path();
        fs::create_dir_all(base.join("assets"))?;
        fs::write(base.join("assets/default-bg-music.wav"), b"x")?;

        let resolved = resolve_bg_music(base, "demo")?;
        assert!(resolved.ends_with("assets/default-bg-music.wav"));
        Ok(())
    }

    #[test]
    fn test_resolve_bg_music_missing_everywhere_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let err = resolve_bg_music(tmp.path(), "demo").unwrap_err();
        assert!(matches!(err, AudioError::MissingMusic { .. }));
    }
}

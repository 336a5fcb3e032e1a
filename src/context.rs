//! Deterministic context selection for a run.
//!
//! Selection is a pure function of the files under the app's context
//! directory: no randomness, no wall clock. The lore bible and at least one
//! character file are required; locations and world fragments are optional.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::state::SelectedContext;

/// Maximum number of character files included (first alphabetically).
pub const MAX_CHARACTERS: usize = 3;

/// Separator used when folding world/*.md into the lore text, kept visible
/// so the fold is traceable in prompts and logs.
pub const WORLD_FOLD_SEPARATOR: &str = "\n\n---\n## World context (from world/*.md)\n\n";

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("missing required context: {0}")]
    MissingRequiredContext(String),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Context text blocks assembled for a single generation call.
#[derive(Debug, Clone)]
pub struct PromptContext {
    pub lore_bible: String,
    pub style_rules: String,
    pub location_context: String,
    pub character_context: String,
}

fn read_text(path: &Path) -> Result<String, ContextError> {
    fs::read_to_string(path).map_err(|source| ContextError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Markdown files directly under `dir`, sorted by file name. Missing or
/// non-directory paths yield an empty list.
fn sorted_md_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "md"))
            .collect(),
        Err(_) => Vec::new(),
    };
    files.sort();
    files
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Select context files for a run: required lore bible and characters,
/// optional location and world fragments, all chosen lexicographically.
pub fn select_context(context_dir: &Path) -> Result<SelectedContext, ContextError> {
    let lore_path = context_dir.join("lore_bible.md");
    if !lore_path.exists() {
        return Err(ContextError::MissingRequiredContext(
            "lore_bible.md".to_string(),
        ));
    }

    let character_files = sorted_md_files(&context_dir.join("characters"));
    if character_files.is_empty() {
        return Err(ContextError::MissingRequiredContext(
            "characters/*.md (at least one character file is required)".to_string(),
        ));
    }
    let characters: Vec<String> = character_files
        .iter()
        .take(MAX_CHARACTERS)
        .map(|p| file_name(p))
        .collect();

    let location = sorted_md_files(&context_dir.join("locations"))
        .first()
        .map(|p| file_name(p));

    let world_files: Vec<String> = sorted_md_files(&context_dir.join("world"))
        .iter()
        .map(|p| file_name(p))
        .collect();

    Ok(SelectedContext {
        location,
        characters,
        world_files,
    })
}

/// Assemble the prompt context blocks from a stored selection. World
/// fragments are folded into the lore text behind the visible separator;
/// style files are always included, sorted.
pub fn build_prompt_context(
    context_dir: &Path,
    selected: &SelectedContext,
) -> Result<PromptContext, ContextError> {
    let lore_path = context_dir.join("lore_bible.md");
    if !lore_path.exists() {
        return Err(ContextError::MissingRequiredContext(
            "lore_bible.md".to_string(),
        ));
    }
    let mut lore_bible = read_text(&lore_path)?;

    if !selected.world_files.is_empty() {
        let world_dir = context_dir.join("world");
        let mut parts = Vec::new();
        let mut names = selected.world_files.clone();
        names.sort();
        for name in names {
            let path = world_dir.join(&name);
            if path.exists() {
                parts.push(read_text(&path)?);
            }
        }
        if !parts.is_empty() {
            lore_bible = format!(
                "{}{}{}",
                lore_bible.trim_end(),
                WORLD_FOLD_SEPARATOR,
                parts.join("\n\n")
            );
        }
    }

    let mut style_parts = Vec::new();
    for path in sorted_md_files(&context_dir.join("style")) {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        style_parts.push(format!("## {}\n\n{}", stem, read_text(&path)?));
    }
    let style_rules = style_parts.join("\n\n");

    let location_context = match &selected.location {
        Some(name) => {
            let path = context_dir.join("locations").join(name);
            if path.exists() {
                read_text(&path)?
            } else {
                String::new()
            }
        }
        None => String::new(),
    };

    let mut character_parts = Vec::new();
    for name in &selected.characters {
        let path = context_dir.join("characters").join(name);
        if path.exists() {
            character_parts.push(format!("## {}\n\n{}", name, read_text(&path)?));
        }
    }
    let character_context = character_parts.join("\n\n");

    Ok(PromptContext {
        lore_bible,
        style_rules,
        location_context,
        character_context,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn minimal_context(dir: &Path) {
        write(dir, "lore_bible.md", "# Lore\nThe sea is old.");
        write(dir, "characters/keeper.md", "The keeper.");
    }

    #[test]
    fn test_selection_is_deterministic() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        minimal_context(dir);
        write(dir, "characters/apprentice.md", "The apprentice.");
        write(dir, "locations/tower.md", "The tower.");
        write(dir, "locations/harbor.md", "The harbor.");
        write(dir, "world/tides.md", "Tides.");

        let first = select_context(dir).unwrap();
        let second = select_context(dir).unwrap();
        assert_eq!(first, second);
        // Lexicographically first location wins.
        assert_eq!(first.location.as_deref(), Some("harbor.md"));
        assert_eq!(first.characters, vec!["apprentice.md", "keeper.md"]);
        assert_eq!(first.world_files, vec!["tides.md"]);
    }

    #[test]
    fn test_character_selection_caps_at_max() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        write(dir, "lore_bible.md", "lore");
        for name in ["a.md", "b.md", "c.md", "d.md", "e.md"] {
            write(dir, &format!("characters/{name}"), "c");
        }
        let selected = select_context(dir).unwrap();
        assert_eq!(selected.characters, vec!["a.md", "b.md", "c.md"]);
    }

    #[test]
    fn test_missing_lore_bible_fails() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "characters/keeper.md", "c");
        let err = select_context(tmp.path()).unwrap_err();
        assert!(matches!(err, ContextError::MissingRequiredContext(_)));
        assert!(err.to_string().contains("lore_bible.md"));
    }

    #[test]
    fn test_missing_characters_fails() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "lore_bible.md", "lore");
        let err = select_context(tmp.path()).unwrap_err();
        assert!(matches!(err, ContextError::MissingRequiredContext(_)));
        assert!(err.to_string().contains("characters"));
    }

    #[test]
    fn test_optional_categories_absent_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        minimal_context(tmp.path());
        let selected = select_context(tmp.path()).unwrap();
        assert!(selected.location.is_none());
        assert!(selected.world_files.is_empty());
    }

    #[test]
    fn test_world_files_folded_into_lore_with_separator() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        minimal_context(dir);
        write(dir, "world/currents.md", "Currents run north.");
        write(dir, "world/birds.md", "Gulls nest in spring.");

        let selected = select_context(dir).unwrap();
        let ctx = build_prompt_context(dir, &selected).unwrap();
        assert!(ctx.lore_bible.contains("## World context"));
        let birds = ctx.lore_bible.find("Gulls nest").unwrap();
        let currents = ctx.lore_bible.find("Currents run").unwrap();
        assert!(birds < currents, "world files folded alphabetically");
    }

    #[test]
    fn test_style_files_included_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        minimal_context(dir);
        write(dir, "style/20_voice.md", "Second person never.");
        write(dir, "style/10_tone.md", "Keep it quiet.");

        let selected = select_context(dir).unwrap();
        let ctx = build_prompt_context(dir, &selected).unwrap();
        let tone = ctx.style_rules.find("10_tone").unwrap();
        let voice = ctx.style_rules.find("20_voice").unwrap();
        assert!(tone < voice);
    }
}

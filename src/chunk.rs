//! Word-bounded chunking of the final script for speech synthesis.
//!
//! Greedy segmentation: accumulate words up to a lower bound, then cut at the
//! next line break found before the upper bound. If no line break appears the
//! cut lands exactly at the upper bound and the segment is flagged as an
//! imperfect split (non-fatal). When the raw segment count exceeds the
//! maximum, the tail is merged left-to-right into the final segment.

use thiserror::Error;

pub const MIN_WORDS: usize = 700;
pub const MAX_WORDS: usize = 1000;
pub const MAX_SEGMENTS: usize = 22;

#[derive(Debug, Clone, Copy)]
pub struct ChunkLimits {
    pub min_words: usize,
    pub max_words: usize,
    pub max_segments: usize,
}

impl Default for ChunkLimits {
    fn default() -> Self {
        Self {
            min_words: MIN_WORDS,
            max_words: MAX_WORDS,
            max_segments: MAX_SEGMENTS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Segment {
    pub text: String,
    /// True when the cut landed at the word bound because no line break
    /// was found in the search window.
    pub imperfect: bool,
}

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("script text is empty")]
    EmptyInput,
    #[error("chunking produced {count} segments; limit is {max}")]
    TooManySegments { count: usize, max: usize },
}

/// Byte spans of whitespace-delimited words, in order.
fn word_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;
    for (idx, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if let Some(s) = start.take() {
                spans.push((s, idx));
            }
        } else if start.is_none() {
            start = Some(idx);
        }
    }
    if let Some(s) = start {
        spans.push((s, text.len()));
    }
    spans
}

pub fn chunk_script(text: &str, limits: ChunkLimits) -> Result<Vec<Segment>, ChunkError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ChunkError::EmptyInput);
    }

    let words = word_spans(text);
    let n = words.len();
    let mut segments: Vec<Segment> = Vec::new();
    let mut i = 0usize;

    while i < n {
        let start = words[i].0;
        let j_min = (i + limits.min_words).min(n);
        let j_max = (i + limits.max_words).min(n);
        let end_min = words[j_min - 1].1;
        let end_max = words[j_max - 1].1;

        let newline = text[end_min..].find('\n').map(|p| p + end_min);
        match newline {
            Some(pos) if pos < end_max => {
                let cut = pos + 1;
                segments.push(Segment {
                    text: text[start..cut].to_string(),
                    imperfect: false,
                });
                while i < n && words[i].0 < cut {
                    i += 1;
                }
            }
            _ => {
                // No break before the word bound. Running out of input is a
                // natural terminus, not an imperfect cut.
                let is_tail = j_max == n;
                segments.push(Segment {
                    text: text[start..end_max].to_string(),
                    imperfect: !is_tail,
                });
                i = j_max;
            }
        }
    }

    if segments.len() > limits.max_segments {
        // Stable left-to-right merge: keep the first max-1 segments, fold the
        // whole remainder into the last one. No re-search of the bounds.
        let tail = segments.split_off(limits.max_segments - 1);
        let imperfect = tail.iter().any(|s| s.imperfect);
        let joined = tail
            .iter()
            .map(|s| s.text.trim_end())
            .collect::<Vec<_>>()
            .join("\n\n");
        segments.push(Segment {
            text: joined,
            imperfect,
        });
    }

    if segments.is_empty() {
        return Err(ChunkError::EmptyInput);
    }
    if segments.len() > limits.max_segments {
        return Err(ChunkError::TooManySegments {
            count: segments.len(),
            max: limits.max_segments,
        });
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(min_words: usize, max_words: usize, max_segments: usize) -> ChunkLimits {
        ChunkLimits {
            min_words,
            max_words,
            max_segments,
        }
    }

    fn word_count(s: &str) -> usize {
        s.split_whitespace().count()
    }

    #[test]
    fn test_empty_input_fails() {
        assert!(matches!(
            chunk_script("   \n  ", ChunkLimits::default()),
            Err(ChunkError::EmptyInput)
        ));
    }

    #[test]
    fn test_short_text_is_single_clean_segment() {
        let segments = chunk_script("one two three", limits(5, 8, 22)).unwrap();
        assert_eq!(segments.len(), 1);
        assert!(!segments[0].imperfect);
        assert_eq!(segments[0].text, "one two three");
    }

    #[test]
    fn test_cut_at_line_break_after_lower_bound() {
        // 4 words, newline, 4 words; lower bound 3, upper bound 10.
        let text = "w1 w2 w3 w4\nw5 w6 w7 w8";
        let segments = chunk_script(text, limits(3, 10, 22)).unwrap();
        assert_eq!(segments.len(), 2);
        assert!(!segments[0].imperfect);
        assert_eq!(segments[0].text, "w1 w2 w3 w4\n");
        assert_eq!(segments[1].text, "w5 w6 w7 w8");
    }

    #[test]
    fn test_no_line_break_cuts_at_upper_bound_and_flags() {
        let words: Vec<String> = (0..12).map(|i| format!("w{i}")).collect();
        let text = words.join(" ");
        let segments = chunk_script(&text, limits(3, 5, 22)).unwrap();
        // 12 words, cuts of exactly 5 except the tail.
        assert_eq!(segments.len(), 3);
        assert!(segments[0].imperfect);
        assert_eq!(word_count(&segments[0].text), 5);
        assert!(segments[1].imperfect);
        assert_eq!(word_count(&segments[1].text), 5);
        // Natural end of input, not an imperfect cut.
        assert!(!segments[2].imperfect);
        assert_eq!(word_count(&segments[2].text), 2);
    }

    #[test]
    fn test_overflow_merges_left_to_right_preserving_order() {
        // 10 lines of 2 words each; bounds force one segment per line.
        let text = (0..10)
            .map(|i| format!("a{i} b{i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let segments = chunk_script(&text, limits(2, 4, 3)).unwrap();
        assert_eq!(segments.len(), 3);
        // First segments untouched, tail folded into the last in order.
        assert!(segments[0].text.starts_with("a0"));
        assert!(segments[1].text.starts_with("a1"));
        assert!(segments[2].text.contains("a2"));
        assert!(segments[2].text.contains("a9"));
        let pos2 = segments[2].text.find("a2").unwrap();
        let pos9 = segments[2].text.find("a9").unwrap();
        assert!(pos2 < pos9);
    }

    #[test]
    fn test_segment_count_within_limits_for_large_input() {
        let text = (0..200)
            .map(|i| format!("word{i}"))
            .collect::<Vec<_>>()
            .join(" ");
        let lim = limits(10, 15, 5);
        let segments = chunk_script(&text, lim).unwrap();
        assert!(!segments.is_empty());
        assert!(segments.len() <= lim.max_segments);
        let total: usize = segments.iter().map(|s| word_count(&s.text)).sum();
        assert_eq!(total, 200);
    }
}

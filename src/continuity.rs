//! Rolling summaries and the continuity ledger.
//!
//! Both operations are pure; the orchestrator persists their results.

use std::collections::BTreeMap;

use crate::state::SectionSummary;

/// Upper bound (characters) on the rolling summary fed into section prompts.
pub const ROLLING_SUMMARY_MAX_CHARS: usize = 3600;

const NO_PREVIOUS_SECTIONS: &str = "No previous sections.";
const NO_CONTINUITY: &str = "No continuity information available.";

/// Build a rolling summary from the most recent section summaries.
///
/// Walks newest-first, keeping entries while they fit under `max_chars`, then
/// emits the kept entries in chronological order. The result never exceeds
/// `max_chars`: if even the newest entry alone is too large it is truncated
/// on a char boundary.
pub fn build_rolling_summary(summaries: &[SectionSummary], max_chars: usize) -> String {
    if summaries.is_empty() {
        return truncate_chars(NO_PREVIOUS_SECTIONS, max_chars);
    }

    let mut selected: Vec<String> = Vec::new();
    let mut total = 0usize;
    for summary in summaries.iter().rev() {
        let entry = format!("Section {:02}: {}", summary.section_id, summary.summary);
        let joiner = if selected.is_empty() { 0 } else { 2 }; // "\n\n"
        let cost = entry.chars().count() + joiner;
        if total + cost > max_chars {
            break;
        }
        total += cost;
        selected.push(entry);
    }

    if selected.is_empty() {
        // Newest entry alone exceeds the bound.
        let newest = summaries.last().expect("non-empty summaries");
        let entry = format!("Section {:02}: {}", newest.section_id, newest.summary);
        return truncate_chars(&entry, max_chars);
    }

    selected.reverse();
    selected.join("\n\n")
}

/// Merge continuity updates into the ledger: last writer wins per key,
/// untouched keys are preserved.
pub fn merge_ledger(
    ledger: &BTreeMap<String, String>,
    updates: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = ledger.clone();
    for (key, value) in updates {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Format the ledger for prompt inclusion: sorted `- key: value` lines.
pub fn format_ledger(ledger: &BTreeMap<String, String>) -> String {
    if ledger.is_empty() {
        return NO_CONTINUITY.to_string();
    }
    ledger
        .iter()
        .map(|(key, value)| format!("- {}: {}", key, value))
        .collect::<Vec<_>>()
        .join("\n")
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(id: usize, text: &str) -> SectionSummary {
        SectionSummary {
            section_id: id,
            summary: text.to_string(),
            continuity_updates: BTreeMap::new(),
        }
    }

    #[test]
    fn test_rolling_summary_empty() {
        assert_eq!(build_rolling_summary(&[], 100), "No previous sections.");
    }

    #[test]
    fn test_rolling_summary_prefers_recent_and_keeps_order() {
        let summaries = vec![
            summary(1, "The keeper finds the map."),
            summary(2, "The keeper sails at dawn."),
            summary(3, "A storm scatters the fleet."),
        ];
        let rolling = build_rolling_summary(&summaries, 10_000);
        let pos1 = rolling.find("Section 01").unwrap();
        let pos3 = rolling.find("Section 03").unwrap();
        assert!(pos1 < pos3, "chronological order expected: {rolling}");
    }

    #[test]
    fn test_rolling_summary_trims_oldest_first() {
        let summaries = vec![
            summary(1, &"a".repeat(60)),
            summary(2, &"b".repeat(60)),
            summary(3, &"c".repeat(60)),
        ];
        // Room for roughly two entries only.
        let rolling = build_rolling_summary(&summaries, 160);
        assert!(!rolling.contains("Section 01"));
        assert!(rolling.contains("Section 03"));
    }

    #[test]
    fn test_rolling_summary_never_exceeds_bound() {
        let summaries = vec![summary(1, &"x".repeat(500))];
        for bound in [1usize, 10, 50, 200, 1000] {
            let rolling = build_rolling_summary(&summaries, bound);
            assert!(
                rolling.chars().count() <= bound,
                "bound {bound} violated: got {}",
                rolling.chars().count()
            );
        }
    }

    #[test]
    fn test_ledger_last_write_wins() {
        let mut ledger = BTreeMap::new();
        ledger.insert("keeper".to_string(), "asleep".to_string());
        ledger.insert("weather".to_string(), "calm".to_string());

        let mut first = BTreeMap::new();
        first.insert("keeper".to_string(), "v1".to_string());
        let merged = merge_ledger(&ledger, &first);

        let mut second = BTreeMap::new();
        second.insert("keeper".to_string(), "v2".to_string());
        let merged = merge_ledger(&merged, &second);

        assert_eq!(merged.get("keeper").map(String::as_str), Some("v2"));
        assert_eq!(merged.get("weather").map(String::as_str), Some("calm"));
        // Inputs untouched.
        assert_eq!(ledger.get("keeper").map(String::as_str), Some("asleep"));
    }

    #[test]
    fn test_format_ledger() {
        assert_eq!(
            format_ledger(&BTreeMap::new()),
            "No continuity information available."
        );
        let mut ledger = BTreeMap::new();
        ledger.insert("b_key".to_string(), "two".to_string());
        ledger.insert("a_key".to_string(), "one".to_string());
        assert_eq!(format_ledger(&ledger), "- a_key: one\n- b_key: two");
    }
}

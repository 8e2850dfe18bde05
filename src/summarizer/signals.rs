//! Local, deterministic signal classification.
//!
//! No model calls here: keyword frequency extraction and a couple of cheap
//! scores. Determinism matters because redelivered messages must produce the
//! same summary they produced the first time.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::graph::PatternSignals;

/// Keyword categories counted over the lowercased text. Category names are
/// the canonical keys stored in `keyword_frequencies`.
const CATEGORIES: &[(&str, &str)] = &[
    ("error", r"\b(error|exception|fail|crash|bug)\b"),
    ("debug", r"\b(debug|trace|log|console)\b"),
    ("fix", r"\b(fix|patch|resolve|solve)\b"),
    ("issue", r"\b(issue|problem|trouble|wrong)\b"),
    ("learn", r"\b(learn|study|understand|research)\b"),
    ("implement", r"\b(implement|build|create|develop)\b"),
    ("understand", r"\b(understand|comprehend|grasp)\b"),
    ("architecture", r"\b(architecture|structure|design)\b"),
    ("pattern", r"\b(pattern|paradigm|approach)\b"),
    ("system", r"\b(system|infrastructure|framework)\b"),
    ("component", r"\b(component|module|service)\b"),
    ("refactor", r"\b(refactor|restructure|reorganize)\b"),
    ("improve", r"\b(improve|enhance|optimize)\b"),
    ("clean", r"\b(clean|tidy|organize)\b"),
    ("investigate", r"\b(investigate|diagnose|root cause|why)\b"),
    ("test", r"\b(test|testing|spec|unit)\b"),
    ("deploy", r"\b(deploy|deployment|production)\b"),
    ("performance", r"\b(performance|speed|latency|optimize)\b"),
    ("security", r"\b(security|auth|authentication|permission)\b"),
];

const TECH_TERMS: &str =
    r"\b(api|database|function|class|method|variable|async|promise|query|schema)\b";

/// Categories whose hits raise the urgency score.
const URGENT_CATEGORIES: &[&str] = &["error", "fix", "issue"];

fn compiled_categories() -> &'static Vec<(&'static str, Regex)> {
    static CATEGORIES_RE: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    CATEGORIES_RE.get_or_init(|| {
        CATEGORIES
            .iter()
            .map(|(name, pattern)| (*name, Regex::new(pattern).expect("static regex compiles")))
            .collect()
    })
}

fn tech_terms_re() -> &'static Regex {
    static TECH_RE: OnceLock<Regex> = OnceLock::new();
    TECH_RE.get_or_init(|| Regex::new(TECH_TERMS).expect("static regex compiles"))
}

/// Count keyword category hits. BTreeMap so the stored JSON is stable.
pub fn extract_keywords(text: &str) -> BTreeMap<&'static str, usize> {
    let lower = text.to_lowercase();
    let mut counts = BTreeMap::new();
    for (name, re) in compiled_categories() {
        let hits = re.find_iter(&lower).count();
        if hits > 0 {
            counts.insert(*name, hits);
        }
    }
    counts
}

/// Rough 0..1 complexity estimate from length, code blocks and tech vocabulary.
pub fn complexity_score(text: &str) -> f32 {
    if text.is_empty() {
        return 0.0;
    }
    let length = (text.len() as f32 / 1000.0).min(1.0) * 0.3;
    let code_blocks = text.matches("```").count() as f32 / 10.0 * 0.3;
    let lower = text.to_lowercase();
    let tech = tech_terms_re().find_iter(&lower).count() as f32 / 20.0 * 0.4;
    (length + code_blocks + tech).min(1.0)
}

/// 0..1 urgency estimate from debugging-flavored keyword density.
pub fn urgency_score(keywords: &BTreeMap<&'static str, usize>) -> f32 {
    let urgent: usize = URGENT_CATEGORIES
        .iter()
        .filter_map(|k| keywords.get(k))
        .sum();
    (urgent as f32 / 10.0).min(1.0)
}

/// Derive the full signal set for a piece of text.
pub fn classify(text: &str) -> (PatternSignals, BTreeMap<&'static str, usize>) {
    let keywords = extract_keywords(text);
    let count = |k: &str| keywords.get(k).copied().unwrap_or(0);

    let signals = PatternSignals {
        is_debugging: count("error") > 0 || count("fix") > 0 || count("issue") > 0,
        is_learning: count("learn") > 0 || count("understand") > 0,
        is_refactoring: count("refactor") > 0 || count("improve") > 0 || count("clean") > 0,
        is_architecture: count("architecture") > 0 || count("pattern") > 0 || count("system") > 0,
        is_problem_solving: count("investigate") > 0 || (count("issue") > 0 && count("fix") > 0),
        complexity_score: complexity_score(text),
        urgency_score: urgency_score(&keywords),
    };

    (signals, keywords)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debugging_text_sets_debugging_flag() {
        let (signals, keywords) =
            classify("Hit a null pointer error, added a fix after tracing the crash");
        assert!(signals.is_debugging);
        assert!(!signals.is_learning);
        assert!(keywords["error"] >= 2); // "error" and "crash"
        assert!(keywords["fix"] >= 1);
    }

    #[test]
    fn learning_text_sets_learning_flag() {
        let (signals, _) = classify("Spent the morning trying to understand the borrow checker");
        assert!(signals.is_learning);
        assert!(!signals.is_debugging);
    }

    #[test]
    fn refactoring_and_architecture_are_independent() {
        let (signals, _) = classify("refactor the session module to improve the design");
        assert!(signals.is_refactoring);
        assert!(signals.is_architecture); // "design"
    }

    #[test]
    fn investigation_implies_problem_solving() {
        let (signals, _) = classify("need to investigate the root cause of this slowdown");
        assert!(signals.is_problem_solving);
    }

    #[test]
    fn empty_text_yields_no_signals() {
        let (signals, keywords) = classify("");
        assert_eq!(signals, PatternSignals::default());
        assert!(keywords.is_empty());
    }

    #[test]
    fn classification_is_deterministic() {
        let text = "debugging a flaky test, probably a race in the queue fix";
        assert_eq!(classify(text), classify(text));
    }

    #[test]
    fn urgency_scales_with_keyword_density() {
        let calm = classify("wrote some documentation today").0;
        let urgent =
            classify("error error error crash bug, fix fix fix, serious issue and problem").0;
        assert_eq!(calm.urgency_score, 0.0);
        assert!(urgent.urgency_score > 0.5);
    }

    #[test]
    fn complexity_counts_code_blocks_and_terms() {
        let plain = complexity_score("short note");
        let dense = complexity_score(
            "```rust\nasync fn query(db: &Database) {}\n```\n\
             The api wraps the database query in an async function with a schema class",
        );
        assert!(dense > plain);
        assert!(dense <= 1.0);
    }
}

//! Pure clustering arithmetic: cosine similarity, time bucketing, scope
//! grouping and candidate merging. Nothing in here touches the database,
//! which is what keeps the threshold behavior unit-testable.

use chrono::{DateTime, Datelike, Duration, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::graph::{scope_id_for, PatternCandidate, ScopeData, SignalKind};
use crate::graph::store::SimilarMatch;

/// Cosine similarity `dot / (‖a‖·‖b‖)`. Zero-norm or mismatched inputs
/// yield 0 rather than NaN.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Calendar-week bucket: the Monday of the week containing `at`, as a date
/// string. Part of the pattern scope key, so the format never changes.
pub fn week_bucket(at: DateTime<Utc>) -> String {
    let date = at.date_naive();
    let monday = date - Duration::days(i64::from(date.weekday().num_days_from_monday()));
    monday.format("%Y-%m-%d").to_string()
}

/// Day bucket used by the keyword fallback path.
pub fn day_bucket(at: DateTime<Utc>) -> String {
    at.date_naive().format("%Y-%m-%d").to_string()
}

/// A scope-level cluster assembled from similarity matches.
#[derive(Debug, Clone)]
pub struct MatchGroup {
    pub scope_id: String,
    pub user_id: Option<String>,
    pub workspace_id: Option<String>,
    pub project: String,
    /// Week bucket (Monday date).
    pub period: String,
    /// Member entity ids, strongest similarity first.
    pub members: Vec<Uuid>,
    pub avg_similarity: f64,
}

/// Group matches by `(scope, project, week)`, dropping members at or below
/// `threshold` and groups below `min_members`.
///
/// Matches may repeat an entity when several seeds retrieved it; each entity
/// counts once per group, keeping its best similarity.
pub fn group_by_week(
    matches: &[SimilarMatch],
    threshold: f64,
    min_members: usize,
) -> Vec<MatchGroup> {
    type Key = (String, String, String);
    let mut grouped: HashMap<Key, (Option<String>, Option<String>, HashMap<Uuid, f64>)> =
        HashMap::new();

    for m in matches {
        if m.similarity <= threshold {
            continue;
        }
        let scope_id = scope_id_for(m.user_id.as_deref(), m.workspace_id.as_deref());
        let key = (scope_id, m.project_name.clone(), week_bucket(m.occurred_at));
        let entry = grouped
            .entry(key)
            .or_insert_with(|| (m.user_id.clone(), m.workspace_id.clone(), HashMap::new()));
        let best = entry.2.entry(m.entity_id).or_insert(m.similarity);
        if m.similarity > *best {
            *best = m.similarity;
        }
    }

    let mut groups: Vec<MatchGroup> = grouped
        .into_iter()
        .filter(|(_, (_, _, members))| members.len() >= min_members)
        .map(|((scope_id, project, period), (user_id, workspace_id, members))| {
            let avg = members.values().sum::<f64>() / members.len() as f64;
            let mut ranked: Vec<(Uuid, f64)> = members.into_iter().collect();
            ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            MatchGroup {
                scope_id,
                user_id,
                workspace_id,
                project,
                period,
                members: ranked.into_iter().map(|(id, _)| id).collect(),
                avg_similarity: avg,
            }
        })
        .collect();

    groups.sort_by(|a, b| {
        (&a.scope_id, &a.project, &a.period).cmp(&(&b.scope_id, &b.project, &b.period))
    });
    groups
}

/// Semantic confidence: `min(avg_similarity × members / divisor, cap)`.
pub fn semantic_confidence(kind: SignalKind, avg_similarity: f64, members: usize) -> f64 {
    (avg_similarity * members as f64 / kind.confidence_divisor()).min(kind.confidence_cap())
}

/// Collapse semantic and keyword candidates that landed on the same scope key.
/// Semantic takes the slot outright; a keyword candidate folding into an
/// occupied slot contributes its frequency and confidence via `max`, never a
/// sum, so double counting cannot inflate a pattern.
pub fn merge_candidates(candidates: Vec<PatternCandidate>) -> Vec<PatternCandidate> {
    let mut merged: HashMap<(String, String, String), PatternCandidate> = HashMap::new();
    let mut order: Vec<(String, String, String)> = Vec::new();

    for candidate in candidates {
        let key = candidate.merge_key();
        match merged.get_mut(&key) {
            None => {
                order.push(key.clone());
                merged.insert(key, candidate);
            }
            Some(existing) => {
                if candidate.metadata.is_semantic() {
                    let frequency = existing.frequency.max(candidate.frequency);
                    let confidence = existing.confidence.max(candidate.confidence);
                    *existing = candidate;
                    existing.frequency = frequency;
                    existing.confidence = confidence;
                } else {
                    existing.frequency = existing.frequency.max(candidate.frequency);
                    existing.confidence = existing.confidence.max(candidate.confidence);
                }
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| merged.remove(&key))
        .collect()
}

/// Temporal intensive-session confidence: `min(count / 20, 0.9)`.
pub fn temporal_confidence(members: i64) -> f64 {
    (members as f64 / 20.0).min(0.9)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PatternMetadata;
    use approx::assert_relative_eq;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn m(entity: Uuid, similarity: f64, at: DateTime<Utc>) -> SimilarMatch {
        SimilarMatch {
            summary_id: Uuid::new_v4(),
            entity_id: entity,
            user_id: Some("u1".to_string()),
            workspace_id: None,
            project_name: "api".to_string(),
            occurred_at: at,
            similarity,
        }
    }

    #[test]
    fn identical_vectors_have_similarity_one() {
        let v = vec![0.3, -0.5, 0.8];
        assert_relative_eq!(cosine_similarity(&v, &v), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn opposite_vectors_have_similarity_negative_one() {
        let v = vec![0.3, -0.5, 0.8];
        let neg: Vec<f32> = v.iter().map(|x| -x).collect();
        assert_relative_eq!(cosine_similarity(&v, &neg), -1.0, epsilon = 1e-9);
    }

    #[test]
    fn zero_vector_has_similarity_zero() {
        let zero = vec![0.0; 3];
        let v = vec![1.0, 2.0, 3.0];
        assert_eq!(cosine_similarity(&zero, &v), 0.0);
        assert_eq!(cosine_similarity(&v, &zero), 0.0);
    }

    #[test]
    fn mismatched_lengths_yield_zero() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0, 2.0, 3.0]), 0.0);
    }

    proptest! {
        #[test]
        fn similarity_is_bounded(v in prop::collection::vec(-100.0f32..100.0, 16),
                                 w in prop::collection::vec(-100.0f32..100.0, 16)) {
            let s = cosine_similarity(&v, &w);
            prop_assert!((-1.0 - 1e-6..=1.0 + 1e-6).contains(&s));
        }

        #[test]
        fn similarity_is_symmetric(v in prop::collection::vec(-10.0f32..10.0, 8),
                                   w in prop::collection::vec(-10.0f32..10.0, 8)) {
            let a = cosine_similarity(&v, &w);
            let b = cosine_similarity(&w, &v);
            prop_assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn week_bucket_truncates_to_monday() {
        // 2026-08-23 is a Sunday; its week started Monday 2026-08-17.
        let sunday = Utc.with_ymd_and_hms(2026, 8, 23, 15, 0, 0).unwrap();
        assert_eq!(week_bucket(sunday), "2026-08-17");
        let monday = Utc.with_ymd_and_hms(2026, 8, 17, 0, 30, 0).unwrap();
        assert_eq!(week_bucket(monday), "2026-08-17");
    }

    #[test]
    fn threshold_keeps_three_of_four_matches() {
        let at = Utc.with_ymd_and_hms(2026, 8, 19, 10, 0, 0).unwrap();
        let matches: Vec<SimilarMatch> = [0.9, 0.8, 0.4, 0.66]
            .iter()
            .map(|s| m(Uuid::new_v4(), *s, at))
            .collect();

        let groups = group_by_week(&matches, 0.65, 3);
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.members.len(), 3);
        assert_relative_eq!(group.avg_similarity, 0.787, epsilon = 1e-3);
    }

    #[test]
    fn two_members_never_materialize_three_do() {
        let at = Utc.with_ymd_and_hms(2026, 8, 19, 10, 0, 0).unwrap();
        let two: Vec<SimilarMatch> = (0..2).map(|_| m(Uuid::new_v4(), 0.9, at)).collect();
        assert!(group_by_week(&two, 0.65, 3).is_empty());

        let three: Vec<SimilarMatch> = (0..3).map(|_| m(Uuid::new_v4(), 0.9, at)).collect();
        assert_eq!(group_by_week(&three, 0.65, 3).len(), 1);
    }

    #[test]
    fn repeated_entity_across_seeds_counts_once() {
        let at = Utc.with_ymd_and_hms(2026, 8, 19, 10, 0, 0).unwrap();
        let shared = Uuid::new_v4();
        let matches = vec![
            m(shared, 0.7, at),
            m(shared, 0.9, at), // same entity retrieved by a second seed
            m(Uuid::new_v4(), 0.8, at),
            m(Uuid::new_v4(), 0.75, at),
        ];
        let groups = group_by_week(&matches, 0.65, 3);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].members.len(), 3);
        // The duplicate keeps its best similarity.
        assert_relative_eq!(
            groups[0].avg_similarity,
            (0.9 + 0.8 + 0.75) / 3.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn matches_split_across_weeks_do_not_pool() {
        let week_a = Utc.with_ymd_and_hms(2026, 8, 19, 10, 0, 0).unwrap();
        let week_b = Utc.with_ymd_and_hms(2026, 8, 26, 10, 0, 0).unwrap();
        let matches = vec![
            m(Uuid::new_v4(), 0.9, week_a),
            m(Uuid::new_v4(), 0.9, week_a),
            m(Uuid::new_v4(), 0.9, week_b),
        ];
        assert!(group_by_week(&matches, 0.65, 3).is_empty());
    }

    #[test]
    fn semantic_confidence_caps_per_kind() {
        // 10 members at 0.99 average overflows every cap.
        assert_eq!(
            semantic_confidence(SignalKind::Debugging, 0.99, 10),
            0.95
        );
        assert_eq!(semantic_confidence(SignalKind::Learning, 0.99, 20), 0.90);
        // Below the cap the formula applies directly.
        assert_relative_eq!(
            semantic_confidence(SignalKind::Debugging, 0.787, 3),
            0.787 * 3.0 / 10.0,
            epsilon = 1e-9
        );
    }

    fn candidate(frequency: i64, confidence: f64, metadata: PatternMetadata) -> PatternCandidate {
        PatternCandidate {
            pattern_type: "debugging".to_string(),
            pattern_name: "debugging-session".to_string(),
            scope_id: "u1".to_string(),
            scope: ScopeData {
                project: "api".to_string(),
                period: Some("2026-08-17".to_string()),
            },
            user_id: Some("u1".to_string()),
            workspace_id: None,
            confidence,
            frequency,
            metadata,
        }
    }

    #[test]
    fn semantic_wins_scope_collisions() {
        let keyword = candidate(
            8,
            0.4,
            PatternMetadata::Keyword {
                matched_signals: vec!["is_debugging".to_string()],
            },
        );
        let semantic = candidate(
            3,
            0.7,
            PatternMetadata::Semantic {
                avg_similarity: 0.787,
                sample_entity_ids: vec![],
                seed_id: None,
            },
        );

        let merged = merge_candidates(vec![keyword, semantic]);
        assert_eq!(merged.len(), 1);
        assert!(merged[0].metadata.is_semantic());
        // Frequencies merge via max, never a sum.
        assert_eq!(merged[0].frequency, 8);
        assert_relative_eq!(merged[0].confidence, 0.7);
    }

    #[test]
    fn keyword_folding_into_semantic_never_sums() {
        let semantic = candidate(
            5,
            0.8,
            PatternMetadata::Semantic {
                avg_similarity: 0.8,
                sample_entity_ids: vec![],
                seed_id: None,
            },
        );
        let keyword = candidate(
            3,
            0.3,
            PatternMetadata::Keyword {
                matched_signals: vec![],
            },
        );

        let merged = merge_candidates(vec![semantic, keyword]);
        assert_eq!(merged.len(), 1);
        assert!(merged[0].metadata.is_semantic());
        assert_eq!(merged[0].frequency, 5);
    }

    #[test]
    fn distinct_scopes_never_merge() {
        let a = candidate(
            3,
            0.5,
            PatternMetadata::Keyword {
                matched_signals: vec![],
            },
        );
        let mut b = a.clone();
        b.scope.period = Some("2026-08-18".to_string());
        assert_eq!(merge_candidates(vec![a, b]).len(), 2);
    }
}

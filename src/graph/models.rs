use chrono::{DateTime, Utc};
use pgvector::Vector;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PipelineError, Result};

/// Raw entity kinds owned by the producing collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Memory,
    Code,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Memory => "memory",
            EntityType::Code => "code",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "memory" => Ok(EntityType::Memory),
            "code" => Ok(EntityType::Code),
            other => Err(PipelineError::Configuration(format!(
                "unknown entity type: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a raw entity; the queue message payload for summarization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEntityRef {
    pub entity_id: Uuid,
    pub entity_type: EntityType,
    pub enqueued_at: DateTime<Utc>,
}

/// Queue payload nudging the detector after an ingestion batch lands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionTrigger {
    pub batch_id: Uuid,
    pub requested_at: DateTime<Utc>,
}

/// A raw entity resolved from storage. Immutable once created; the pipeline
/// only reads these.
#[derive(Debug, Clone)]
pub struct RawEntity {
    pub id: Uuid,
    pub entity_type: EntityType,
    pub user_id: Option<String>,
    pub workspace_id: Option<String>,
    pub project_name: String,
    /// `occurred_at` preferred, creation time as fallback.
    pub occurred_at: DateTime<Utc>,
    /// Code entities carry name/path context for embedding text.
    pub title: Option<String>,
    pub content: String,
}

impl RawEntity {
    /// Text handed to the embedding service.
    pub fn embedding_text(&self) -> String {
        match &self.title {
            Some(title) => format!("{title} {}", head(&self.content, 500)),
            None => self.content.clone(),
        }
    }
}

fn head(text: &str, chars: usize) -> &str {
    match text.char_indices().nth(chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Deterministic boolean flags computed by the local signal classifier.
///
/// This is the canonical shape: callers can never write free-form key names,
/// which is what allowed `entityId`/`entity_id` style drift historically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternSignals {
    #[serde(default)]
    pub is_debugging: bool,
    #[serde(default)]
    pub is_learning: bool,
    #[serde(default)]
    pub is_refactoring: bool,
    #[serde(default)]
    pub is_architecture: bool,
    #[serde(default)]
    pub is_problem_solving: bool,
    #[serde(default)]
    pub complexity_score: f32,
    #[serde(default)]
    pub urgency_score: f32,
}

/// Signal kinds the detector seeds from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Debugging,
    Learning,
    Refactoring,
    ProblemSolving,
}

impl SignalKind {
    pub const ALL: [SignalKind; 4] = [
        SignalKind::Debugging,
        SignalKind::Learning,
        SignalKind::Refactoring,
        SignalKind::ProblemSolving,
    ];

    /// JSON key within `pattern_signals`.
    pub fn flag_key(&self) -> &'static str {
        match self {
            SignalKind::Debugging => "is_debugging",
            SignalKind::Learning => "is_learning",
            SignalKind::Refactoring => "is_refactoring",
            SignalKind::ProblemSolving => "is_problem_solving",
        }
    }

    pub fn pattern_type(&self) -> &'static str {
        match self {
            SignalKind::Debugging => "debugging",
            SignalKind::Learning => "learning",
            SignalKind::Refactoring => "refactoring",
            SignalKind::ProblemSolving => "problem_solving",
        }
    }

    /// Detection-method-qualified pattern name for the semantic path.
    pub fn semantic_pattern_name(&self) -> &'static str {
        match self {
            SignalKind::Debugging => "debugging-session-semantic",
            SignalKind::Learning => "research-session-semantic",
            SignalKind::Refactoring => "code-improvement-semantic",
            SignalKind::ProblemSolving => "investigation-semantic",
        }
    }

    pub fn keyword_pattern_name(&self) -> &'static str {
        match self {
            SignalKind::Debugging => "debugging-session",
            SignalKind::Learning => "research-session",
            SignalKind::Refactoring => "code-improvement",
            SignalKind::ProblemSolving => "investigation",
        }
    }

    /// Confidence scaling: `min(avg_similarity * members / divisor, cap)`.
    pub fn confidence_divisor(&self) -> f64 {
        match self {
            SignalKind::Debugging => 10.0,
            SignalKind::Learning => 15.0,
            SignalKind::Refactoring => 10.0,
            SignalKind::ProblemSolving => 8.0,
        }
    }

    pub fn confidence_cap(&self) -> f64 {
        match self {
            SignalKind::Debugging => 0.95,
            SignalKind::Learning => 0.90,
            SignalKind::Refactoring => 0.85,
            SignalKind::ProblemSolving => 0.85,
        }
    }

    /// Keyword path confidence: `min(members / divisor, cap)`.
    pub fn keyword_confidence(&self, members: i64) -> f64 {
        let divisor = match self {
            SignalKind::Debugging => 20.0,
            SignalKind::Learning => 15.0,
            SignalKind::Refactoring => 10.0,
            SignalKind::ProblemSolving => 8.0,
        };
        (members as f64 / divisor).min(self.confidence_cap())
    }
}

impl PatternSignals {
    pub fn has(&self, kind: SignalKind) -> bool {
        match kind {
            SignalKind::Debugging => self.is_debugging,
            SignalKind::Learning => self.is_learning,
            SignalKind::Refactoring => self.is_refactoring,
            SignalKind::ProblemSolving => self.is_problem_solving,
        }
    }
}

/// Derived, embedding-bearing summary of one raw entity.
/// Exactly one row exists per `(entity_id, entity_type)`.
#[derive(Debug, Clone)]
pub struct EntitySummary {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub entity_type: EntityType,
    pub embedding: Option<Vector>,
    pub pattern_signals: PatternSignals,
    pub user_id: Option<String>,
    pub workspace_id: Option<String>,
    pub project_name: String,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Scope the pattern applies to; part of the uniqueness key, so serialization
/// must be deterministic (fixed field order, serialized once via `key_string`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeData {
    pub project: String,
    pub period: Option<String>,
}

impl ScopeData {
    /// Canonical serialized form stored in the `scope_data` column.
    pub fn key_string(&self) -> String {
        // Struct field order is fixed, so this is stable for a given scope.
        serde_json::to_string(self).expect("scope data serializes")
    }
}

/// Detection provenance, modeled as a tagged union so merge logic stays
/// type-safe instead of pattern-matching on untyped blobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "detection_method", rename_all = "snake_case")]
pub enum PatternMetadata {
    Semantic {
        avg_similarity: f64,
        /// Bounded sample for explainability, never the full member set.
        sample_entity_ids: Vec<Uuid>,
        seed_id: Option<Uuid>,
    },
    Keyword {
        matched_signals: Vec<String>,
    },
    CrossEntity {
        avg_similarity: f64,
        sample_memory_ids: Vec<Uuid>,
        sample_code_ids: Vec<Uuid>,
    },
    TemporalDensity {
        hour: String,
        sample_entity_ids: Vec<Uuid>,
    },
}

impl PatternMetadata {
    pub fn is_semantic(&self) -> bool {
        !matches!(self, PatternMetadata::Keyword { .. })
    }
}

/// A group that met the materialization threshold, ready to be merged into
/// a `PatternSummary`.
#[derive(Debug, Clone)]
pub struct PatternCandidate {
    pub pattern_type: String,
    pub pattern_name: String,
    pub scope_id: String,
    pub scope: ScopeData,
    pub user_id: Option<String>,
    pub workspace_id: Option<String>,
    pub confidence: f64,
    pub frequency: i64,
    pub metadata: PatternMetadata,
}

impl PatternCandidate {
    /// Scope identity used when merging semantic and keyword results for the
    /// same pattern type: the detection-method suffix on the name is ignored.
    pub fn merge_key(&self) -> (String, String, String) {
        (
            self.pattern_type.clone(),
            self.scope_id.clone(),
            self.scope.key_string(),
        )
    }
}

/// Discovered recurring pattern as stored. `frequency` only ever grows.
#[derive(Debug, Clone)]
pub struct PatternSummary {
    pub id: Uuid,
    pub pattern_type: String,
    pub pattern_name: String,
    pub scope_id: String,
    pub scope_data: String,
    pub confidence: f64,
    pub frequency: i64,
    pub first_detected: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub batch_id: Uuid,
    pub metadata: PatternMetadata,
}

/// Scope identity for patterns: the owning user, else the workspace, else
/// global.
pub fn scope_id_for(user_id: Option<&str>, workspace_id: Option<&str>) -> String {
    user_id
        .or(workspace_id)
        .unwrap_or("global")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_data_key_is_deterministic() {
        let scope = ScopeData {
            project: "mnemograph".to_string(),
            period: Some("2026-08-17".to_string()),
        };
        assert_eq!(scope.key_string(), scope.clone().key_string());
        assert_eq!(
            scope.key_string(),
            r#"{"project":"mnemograph","period":"2026-08-17"}"#
        );
    }

    #[test]
    fn scope_without_period_serializes_null() {
        let scope = ScopeData {
            project: "api".to_string(),
            period: None,
        };
        assert_eq!(scope.key_string(), r#"{"project":"api","period":null}"#);
    }

    #[test]
    fn metadata_tags_detection_method() {
        let meta = PatternMetadata::Keyword {
            matched_signals: vec!["is_debugging".to_string()],
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["detection_method"], "keyword");
        assert!(!meta.is_semantic());

        let meta = PatternMetadata::Semantic {
            avg_similarity: 0.8,
            sample_entity_ids: vec![],
            seed_id: None,
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["detection_method"], "semantic");
        assert!(meta.is_semantic());
    }

    #[test]
    fn pattern_signals_round_trip() {
        let signals = PatternSignals {
            is_debugging: true,
            urgency_score: 0.4,
            ..Default::default()
        };
        let json = serde_json::to_string(&signals).unwrap();
        let back: PatternSignals = serde_json::from_str(&json).unwrap();
        assert_eq!(signals, back);
    }

    #[test]
    fn scope_id_prefers_user_then_workspace() {
        assert_eq!(scope_id_for(Some("u1"), Some("w1")), "u1");
        assert_eq!(scope_id_for(None, Some("w1")), "w1");
        assert_eq!(scope_id_for(None, None), "global");
    }

    #[test]
    fn entity_type_parses_canonical_names_only() {
        assert_eq!(EntityType::parse("memory").unwrap(), EntityType::Memory);
        assert_eq!(EntityType::parse("code").unwrap(), EntityType::Code);
        assert!(EntityType::parse("Memory").is_err());
    }
}

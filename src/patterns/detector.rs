//! Pattern detection over the summary corpus.
//!
//! Every detection path ends in the same idempotent pattern upsert, so the
//! detector is safe to run from the scheduler, the HTTP trigger and the
//! ingestion nudge at the same time. There is no batch lock on purpose.

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::DetectorSettings;
use crate::error::Result;
use crate::graph::{
    EntityStore, PatternCandidate, PatternMetadata, ScopeData, SignalKind, SimilarMatch,
    scope_id_for,
};
use crate::patterns::similarity::{
    day_bucket, group_by_week, merge_candidates, semantic_confidence, temporal_confidence,
};

/// Counts for one detection batch. Numbers, not raw errors: this is what
/// operators see.
#[derive(Debug, Default, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub patterns_created: usize,
    pub patterns_updated: usize,
    pub seeds_processed: usize,
    pub seeds_skipped: usize,
}

pub struct PatternDetector {
    store: EntityStore,
    settings: DetectorSettings,
}

impl PatternDetector {
    pub fn new(store: EntityStore, settings: DetectorSettings) -> Self {
        Self { store, settings }
    }

    /// Run all detection paths and merge their findings into pattern nodes.
    pub async fn detect_patterns(&self, batch_id: Uuid) -> Result<BatchReport> {
        let mut report = BatchReport {
            batch_id,
            ..Default::default()
        };

        for kind in SignalKind::ALL {
            let semantic = self.detect_semantic(kind, &mut report).await?;
            let keyword = self.detect_keyword(kind).await?;
            let candidates = merge_candidates(semantic.into_iter().chain(keyword).collect());
            self.materialize(&candidates, batch_id, &mut report).await?;
        }

        let cross = self.detect_memory_code().await?;
        self.materialize(&cross, batch_id, &mut report).await?;

        let temporal = self.detect_temporal().await?;
        self.materialize(&temporal, batch_id, &mut report).await?;

        info!(
            batch_id = %batch_id,
            created = report.patterns_created,
            updated = report.patterns_updated,
            seeds_processed = report.seeds_processed,
            seeds_skipped = report.seeds_skipped,
            "Pattern detection batch finished"
        );
        Ok(report)
    }

    /// Seed-based similarity clustering for one signal kind. A failing seed
    /// only loses its own contribution.
    async fn detect_semantic(
        &self,
        kind: SignalKind,
        report: &mut BatchReport,
    ) -> Result<Vec<PatternCandidate>> {
        let seeds = self
            .store
            .recent_seeds(kind, self.settings.seed_limit)
            .await?;
        if seeds.is_empty() {
            info!(
                signal = kind.flag_key(),
                "No seeds with embeddings, keyword-only detection"
            );
            return Ok(Vec::new());
        }

        let mut matches: Vec<SimilarMatch> = Vec::new();
        for seed in &seeds {
            let found = self
                .store
                .similar_summaries(
                    &seed.embedding,
                    seed.id,
                    self.settings.lookback_days,
                    self.settings.cluster_threshold,
                    self.settings.candidate_limit,
                )
                .await;
            match found {
                Ok(mut rows) => {
                    matches.append(&mut rows);
                    report.seeds_processed += 1;
                }
                Err(e) => {
                    warn!(signal = kind.flag_key(), seed_id = %seed.id,
                          "Seed similarity search failed, skipping: {e}");
                    report.seeds_skipped += 1;
                }
            }
        }

        let groups = group_by_week(
            &matches,
            self.settings.cluster_threshold,
            self.settings.min_members,
        );

        Ok(groups
            .into_iter()
            .map(|group| {
                let members = group.members.len();
                let sample: Vec<Uuid> = group
                    .members
                    .iter()
                    .take(self.settings.sample_size)
                    .copied()
                    .collect();
                PatternCandidate {
                    pattern_type: kind.pattern_type().to_string(),
                    pattern_name: kind.semantic_pattern_name().to_string(),
                    scope_id: group.scope_id,
                    scope: ScopeData {
                        project: group.project,
                        period: Some(group.period),
                    },
                    user_id: group.user_id,
                    workspace_id: group.workspace_id,
                    confidence: semantic_confidence(kind, group.avg_similarity, members),
                    frequency: members as i64,
                    metadata: PatternMetadata::Semantic {
                        avg_similarity: group.avg_similarity,
                        sample_entity_ids: sample,
                        seed_id: None,
                    },
                }
            })
            .collect())
    }

    /// Flag-count aggregation; works with no embeddings at all.
    async fn detect_keyword(&self, kind: SignalKind) -> Result<Vec<PatternCandidate>> {
        let groups = self
            .store
            .signal_day_counts(
                kind,
                self.settings.min_members as i64,
                self.settings.candidate_limit,
            )
            .await?;

        Ok(groups
            .into_iter()
            .map(|group| PatternCandidate {
                pattern_type: kind.pattern_type().to_string(),
                pattern_name: kind.keyword_pattern_name().to_string(),
                scope_id: scope_id_for(group.user_id.as_deref(), group.workspace_id.as_deref()),
                scope: ScopeData {
                    project: group.project_name,
                    period: Some(day_bucket(group.day)),
                },
                user_id: group.user_id,
                workspace_id: group.workspace_id,
                confidence: kind.keyword_confidence(group.members),
                frequency: group.members,
                metadata: PatternMetadata::Keyword {
                    matched_signals: vec![kind.flag_key().to_string()],
                },
            })
            .collect())
    }

    /// Memory-code relationship detection, aggregated per project with the
    /// higher similarity floor.
    async fn detect_memory_code(&self) -> Result<Vec<PatternCandidate>> {
        let groups = self
            .store
            .memory_code_groups(
                self.settings.relationship_threshold,
                self.settings.min_members as i64,
            )
            .await?;

        Ok(groups
            .into_iter()
            .map(|group| PatternCandidate {
                pattern_type: "memory_code_relationship".to_string(),
                pattern_name: "documentation-implementation".to_string(),
                scope_id: scope_id_for(group.user_id.as_deref(), group.workspace_id.as_deref()),
                scope: ScopeData {
                    project: group.project_name,
                    period: None,
                },
                user_id: group.user_id,
                workspace_id: group.workspace_id,
                confidence: (group.avg_similarity * (group.pairs as f64 / 10.0)).min(0.9),
                frequency: group.pairs,
                metadata: PatternMetadata::CrossEntity {
                    avg_similarity: group.avg_similarity,
                    sample_memory_ids: group.memory_samples,
                    sample_code_ids: group.code_samples,
                },
            })
            .collect())
    }

    /// Hour-bucket activity density: many summaries in one hour marks an
    /// intensive working session.
    async fn detect_temporal(&self) -> Result<Vec<PatternCandidate>> {
        let groups = self
            .store
            .activity_hour_counts(
                self.settings.lookback_days,
                self.settings.temporal_min_activity,
                self.settings.candidate_limit,
            )
            .await?;

        Ok(groups
            .into_iter()
            .map(|group| PatternCandidate {
                pattern_type: "temporal".to_string(),
                pattern_name: "intensive-session".to_string(),
                scope_id: scope_id_for(group.user_id.as_deref(), group.workspace_id.as_deref()),
                scope: ScopeData {
                    project: group.project_name,
                    period: Some(day_bucket(group.day)),
                },
                user_id: group.user_id,
                workspace_id: group.workspace_id,
                confidence: temporal_confidence(group.members),
                frequency: group.members,
                metadata: PatternMetadata::TemporalDensity {
                    hour: group.hour.format("%Y-%m-%dT%H:00Z").to_string(),
                    sample_entity_ids: group.sample_ids,
                },
            })
            .collect())
    }

    async fn materialize(
        &self,
        candidates: &[PatternCandidate],
        batch_id: Uuid,
        report: &mut BatchReport,
    ) -> Result<()> {
        for candidate in candidates {
            match self.store.upsert_pattern(candidate, batch_id).await {
                Ok(true) => report.patterns_created += 1,
                Ok(false) => report.patterns_updated += 1,
                // A concurrent batch created the row between arbitration and
                // commit; its merge carried our frequency semantics.
                Err(e) if e.is_merge() => report.patterns_updated += 1,
                Err(e) => {
                    warn!(
                        pattern_type = %candidate.pattern_type,
                        scope_id = %candidate.scope_id,
                        "Pattern upsert failed, skipping candidate: {e}"
                    );
                }
            }
        }
        Ok(())
    }
}

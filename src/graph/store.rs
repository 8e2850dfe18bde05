//! Typed access layer over the entity store.
//!
//! Every write the pipeline performs goes through here and is expressed as a
//! single atomic conditional upsert against a uniqueness constraint. There is
//! deliberately no "check then insert" helper: that pattern is the documented
//! root cause of duplicate summary nodes under concurrent workers.

use chrono::{DateTime, Utc};
use pgvector::Vector;
use serde::Serialize;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use super::models::{
    EntitySummary, EntityType, PatternCandidate, PatternSignals, PatternSummary, RawEntity,
    SignalKind,
};
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct EntityStore {
    pool: PgPool,
}

/// Input for the summary upsert. The summary id is only used on first insert;
/// a concurrent winner's id is returned instead when the row already exists.
#[derive(Debug, Clone)]
pub struct NewSummary {
    pub entity_id: Uuid,
    pub entity_type: EntityType,
    pub embedding: Vector,
    pub pattern_signals: PatternSignals,
    pub keyword_frequencies: serde_json::Value,
    pub user_id: Option<String>,
    pub workspace_id: Option<String>,
    pub project_name: String,
    pub occurred_at: DateTime<Utc>,
}

/// A seed for similarity search: a recent summary with the signal flag set.
#[derive(Debug, Clone)]
pub struct SeedSummary {
    pub id: Uuid,
    pub embedding: Vector,
}

/// One row retained by a similarity search, above the membership threshold.
#[derive(Debug, Clone)]
pub struct SimilarMatch {
    pub summary_id: Uuid,
    pub entity_id: Uuid,
    pub user_id: Option<String>,
    pub workspace_id: Option<String>,
    pub project_name: String,
    pub occurred_at: DateTime<Utc>,
    pub similarity: f64,
}

/// Flag-count aggregation for the keyword fallback path (no embeddings).
#[derive(Debug, Clone)]
pub struct KeywordGroup {
    pub user_id: Option<String>,
    pub workspace_id: Option<String>,
    pub project_name: String,
    pub day: DateTime<Utc>,
    pub members: i64,
    pub sample_ids: Vec<Uuid>,
}

/// Hour-bucket activity density for temporal cluster detection.
#[derive(Debug, Clone)]
pub struct TemporalGroup {
    pub user_id: Option<String>,
    pub workspace_id: Option<String>,
    pub project_name: String,
    pub day: DateTime<Utc>,
    pub hour: DateTime<Utc>,
    pub members: i64,
    pub sample_ids: Vec<Uuid>,
}

/// Per-project aggregation of memory-code similarity pairs.
#[derive(Debug, Clone)]
pub struct MemoryCodeGroup {
    pub user_id: Option<String>,
    pub workspace_id: Option<String>,
    pub project_name: String,
    pub pairs: i64,
    pub avg_similarity: f64,
    pub memory_samples: Vec<Uuid>,
    pub code_samples: Vec<Uuid>,
}

/// Summaries sharing an `(entity_id, entity_type)` key. Should be structurally
/// impossible under the uniqueness constraint; the maintenance job exists for
/// databases where the constraint arrived after the defect did.
#[derive(Debug, Clone)]
pub struct DuplicateGroup {
    pub entity_id: Uuid,
    pub entity_type: String,
    /// Ordered earliest `created_at` first, ties broken by lowest id.
    pub summary_ids: Vec<Uuid>,
}

impl DuplicateGroup {
    pub fn keeper(&self) -> Option<Uuid> {
        self.summary_ids.first().copied()
    }

    pub fn victims(&self) -> &[Uuid] {
        if self.summary_ids.len() > 1 {
            &self.summary_ids[1..]
        } else {
            &[]
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrphanSummary {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub entity_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrphanReport {
    pub total: i64,
    pub sample: Vec<OrphanSummary>,
}

impl EntityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    /// Resolve a raw entity from its owning table. `None` means the producing
    /// transaction has not committed yet (or never will); callers retry.
    pub async fn fetch_raw_entity(
        &self,
        entity_id: Uuid,
        entity_type: EntityType,
    ) -> Result<Option<RawEntity>> {
        let row = match entity_type {
            EntityType::Memory => {
                sqlx::query(
                    r#"
                    SELECT id, user_id, workspace_id, project_name, content,
                           COALESCE(occurred_at, created_at) AS occurred_at
                    FROM memories
                    WHERE id = $1
                    "#,
                )
                .bind(entity_id)
                .fetch_optional(&self.pool)
                .await?
            }
            EntityType::Code => {
                sqlx::query(
                    r#"
                    SELECT id, user_id, workspace_id, project_name, content,
                           created_at AS occurred_at,
                           TRIM(COALESCE(name, '') || ' ' || COALESCE(file_path, '')) AS title
                    FROM code_entities
                    WHERE id = $1
                    "#,
                )
                .bind(entity_id)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        let Some(row) = row else {
            return Ok(None);
        };

        let title = match entity_type {
            EntityType::Memory => None,
            EntityType::Code => {
                let t: String = row.try_get("title")?;
                (!t.is_empty()).then_some(t)
            }
        };

        Ok(Some(RawEntity {
            id: row.try_get("id")?,
            entity_type,
            user_id: row.try_get("user_id")?,
            workspace_id: row.try_get("workspace_id")?,
            project_name: row.try_get("project_name")?,
            occurred_at: row.try_get("occurred_at")?,
            title,
            content: row.try_get("content")?,
        }))
    }

    /// Atomic upsert keyed on `(entity_id, entity_type)`. On conflict the
    /// embedding, signals and `updated_at` are overwritten; identity fields
    /// and `created_at` are left untouched. Returns the surviving summary id.
    pub async fn upsert_summary(&self, summary: &NewSummary) -> Result<Uuid> {
        let signals = serde_json::to_value(summary.pattern_signals)?;

        let row = sqlx::query(
            r#"
            INSERT INTO entity_summaries (
                id, entity_id, entity_type, embedding, pattern_signals,
                keyword_frequencies, user_id, workspace_id, project_name,
                occurred_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW(), NOW())
            ON CONFLICT (entity_id, entity_type) DO UPDATE SET
                embedding = EXCLUDED.embedding,
                pattern_signals = EXCLUDED.pattern_signals,
                keyword_frequencies = EXCLUDED.keyword_frequencies,
                updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(summary.entity_id)
        .bind(summary.entity_type.as_str())
        .bind(&summary.embedding)
        .bind(signals)
        .bind(&summary.keyword_frequencies)
        .bind(&summary.user_id)
        .bind(&summary.workspace_id)
        .bind(&summary.project_name)
        .bind(summary.occurred_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    /// Read back the summary for one entity key, if any.
    pub async fn get_summary(
        &self,
        entity_id: Uuid,
        entity_type: EntityType,
    ) -> Result<Option<EntitySummary>> {
        let row = sqlx::query(
            r#"
            SELECT id, entity_id, entity_type, embedding, pattern_signals,
                   user_id, workspace_id, project_name, occurred_at,
                   created_at, updated_at
            FROM entity_summaries
            WHERE entity_id = $1 AND entity_type = $2
            "#,
        )
        .bind(entity_id)
        .bind(entity_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let signals: serde_json::Value = row.try_get("pattern_signals")?;
        Ok(Some(EntitySummary {
            id: row.try_get("id")?,
            entity_id: row.try_get("entity_id")?,
            entity_type: EntityType::parse(row.try_get::<String, _>("entity_type")?.as_str())?,
            embedding: row.try_get("embedding")?,
            pattern_signals: serde_json::from_value(signals)?,
            user_id: row.try_get("user_id")?,
            workspace_id: row.try_get("workspace_id")?,
            project_name: row.try_get("project_name")?,
            occurred_at: row.try_get("occurred_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    /// Number of summary rows for one entity key. Anything above 1 violates
    /// the uniqueness contract.
    pub async fn summary_count(&self, entity_id: Uuid, entity_type: EntityType) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM entity_summaries
             WHERE entity_id = $1 AND entity_type = $2",
        )
        .bind(entity_id)
        .bind(entity_type.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("n")?)
    }

    /// Read back one pattern by its full uniqueness key.
    pub async fn get_pattern(
        &self,
        pattern_type: &str,
        pattern_name: &str,
        scope_id: &str,
        scope_data: &str,
    ) -> Result<Option<PatternSummary>> {
        let row = sqlx::query(
            r#"
            SELECT id, pattern_type, pattern_name, scope_id, scope_data,
                   confidence, frequency, first_detected, last_updated,
                   batch_id, metadata
            FROM pattern_summaries
            WHERE pattern_type = $1 AND pattern_name = $2
              AND scope_id = $3 AND scope_data = $4
            "#,
        )
        .bind(pattern_type)
        .bind(pattern_name)
        .bind(scope_id)
        .bind(scope_data)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let metadata: serde_json::Value = row.try_get("metadata")?;
        Ok(Some(PatternSummary {
            id: row.try_get("id")?,
            pattern_type: row.try_get("pattern_type")?,
            pattern_name: row.try_get("pattern_name")?,
            scope_id: row.try_get("scope_id")?,
            scope_data: row.try_get("scope_data")?,
            confidence: row.try_get("confidence")?,
            frequency: row.try_get("frequency")?,
            first_detected: row.try_get("first_detected")?,
            last_updated: row.try_get("last_updated")?,
            batch_id: row.try_get("batch_id")?,
            metadata: serde_json::from_value(metadata)?,
        }))
    }

    /// Most-recent summaries carrying the signal flag, with embeddings.
    pub async fn recent_seeds(&self, kind: SignalKind, limit: i64) -> Result<Vec<SeedSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT id, embedding
            FROM entity_summaries
            WHERE (pattern_signals ->> $1)::boolean IS TRUE
              AND embedding IS NOT NULL
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(kind.flag_key())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(SeedSummary {
                    id: row.try_get("id")?,
                    embedding: row.try_get("embedding")?,
                })
            })
            .collect()
    }

    /// Cosine similarity search against the corpus. With a vector index this
    /// is approximate; without one pgvector evaluates the same operator as an
    /// exact sequential scan.
    pub async fn similar_summaries(
        &self,
        embedding: &Vector,
        exclude_id: Uuid,
        lookback_days: i32,
        floor: f64,
        limit: i64,
    ) -> Result<Vec<SimilarMatch>> {
        let rows = sqlx::query(
            r#"
            SELECT id, entity_id, user_id, workspace_id, project_name, occurred_at,
                   1 - (embedding <=> $1) AS similarity
            FROM entity_summaries
            WHERE id <> $2
              AND embedding IS NOT NULL
              AND occurred_at > NOW() - make_interval(days => $3)
              AND 1 - (embedding <=> $1) > $4
            ORDER BY similarity DESC
            LIMIT $5
            "#,
        )
        .bind(embedding)
        .bind(exclude_id)
        .bind(lookback_days)
        .bind(floor)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(SimilarMatch {
                    summary_id: row.try_get("id")?,
                    entity_id: row.try_get("entity_id")?,
                    user_id: row.try_get("user_id")?,
                    workspace_id: row.try_get("workspace_id")?,
                    project_name: row.try_get("project_name")?,
                    occurred_at: row.try_get("occurred_at")?,
                    similarity: row.try_get("similarity")?,
                })
            })
            .collect()
    }

    /// Pure flag-count aggregation by day for the keyword fallback path.
    pub async fn signal_day_counts(
        &self,
        kind: SignalKind,
        min_members: i64,
        limit: i64,
    ) -> Result<Vec<KeywordGroup>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, workspace_id, project_name,
                   date_trunc('day', occurred_at) AS day,
                   COUNT(*) AS members,
                   (ARRAY_AGG(entity_id ORDER BY occurred_at DESC))[1:5] AS sample_ids
            FROM entity_summaries
            WHERE (pattern_signals ->> $1)::boolean IS TRUE
            GROUP BY user_id, workspace_id, project_name, day
            HAVING COUNT(*) >= $2
            ORDER BY members DESC
            LIMIT $3
            "#,
        )
        .bind(kind.flag_key())
        .bind(min_members)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(KeywordGroup {
                    user_id: row.try_get("user_id")?,
                    workspace_id: row.try_get("workspace_id")?,
                    project_name: row.try_get("project_name")?,
                    day: row.try_get("day")?,
                    members: row.try_get("members")?,
                    sample_ids: row.try_get("sample_ids")?,
                })
            })
            .collect()
    }

    /// Hour buckets with dense activity over the lookback window.
    pub async fn activity_hour_counts(
        &self,
        lookback_days: i32,
        min_activity: i64,
        limit: i64,
    ) -> Result<Vec<TemporalGroup>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, workspace_id, project_name,
                   date_trunc('day', occurred_at) AS day,
                   date_trunc('hour', occurred_at) AS hour,
                   COUNT(*) AS members,
                   (ARRAY_AGG(entity_id ORDER BY occurred_at DESC))[1:10] AS sample_ids
            FROM entity_summaries
            WHERE occurred_at > NOW() - make_interval(days => $1)
            GROUP BY user_id, workspace_id, project_name, day, hour
            HAVING COUNT(*) >= $2
            ORDER BY members DESC
            LIMIT $3
            "#,
        )
        .bind(lookback_days)
        .bind(min_activity)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(TemporalGroup {
                    user_id: row.try_get("user_id")?,
                    workspace_id: row.try_get("workspace_id")?,
                    project_name: row.try_get("project_name")?,
                    day: row.try_get("day")?,
                    hour: row.try_get("hour")?,
                    members: row.try_get("members")?,
                    sample_ids: row.try_get("sample_ids")?,
                })
            })
            .collect()
    }

    /// Memory-code pairs above the relationship floor, aggregated per project.
    /// Pairs never cross tenant boundaries: workspace match, or personal data
    /// of the same user.
    pub async fn memory_code_groups(
        &self,
        floor: f64,
        min_members: i64,
    ) -> Result<Vec<MemoryCodeGroup>> {
        let rows = sqlx::query(
            r#"
            SELECT m.user_id, m.workspace_id, m.project_name,
                   COUNT(*) AS pairs,
                   AVG(1 - (m.embedding <=> c.embedding)) AS avg_similarity,
                   (ARRAY_AGG(DISTINCT m.entity_id ORDER BY m.entity_id))[1:5] AS memory_samples,
                   (ARRAY_AGG(DISTINCT c.entity_id ORDER BY c.entity_id))[1:5] AS code_samples
            FROM entity_summaries m
            JOIN entity_summaries c
              ON c.entity_type = 'code'
             AND c.embedding IS NOT NULL
             AND c.project_name = m.project_name
             AND (
                   (m.workspace_id IS NOT NULL AND m.workspace_id = c.workspace_id)
                OR (m.user_id IS NOT NULL AND m.user_id = c.user_id)
             )
             AND 1 - (m.embedding <=> c.embedding) > $1
            WHERE m.entity_type = 'memory'
              AND m.embedding IS NOT NULL
            GROUP BY m.user_id, m.workspace_id, m.project_name
            HAVING COUNT(*) >= $2
            "#,
        )
        .bind(floor)
        .bind(min_members)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(MemoryCodeGroup {
                    user_id: row.try_get("user_id")?,
                    workspace_id: row.try_get("workspace_id")?,
                    project_name: row.try_get("project_name")?,
                    pairs: row.try_get("pairs")?,
                    avg_similarity: row.try_get("avg_similarity")?,
                    memory_samples: row.try_get("memory_samples")?,
                    code_samples: row.try_get("code_samples")?,
                })
            })
            .collect()
    }

    /// MERGE a pattern on its uniqueness key. On create the candidate's
    /// confidence and frequency are taken as-is; on match frequency is
    /// incremented additively (never decremented) and confidence keeps its
    /// maximum. Returns true when a new pattern row was created.
    pub async fn upsert_pattern(
        &self,
        candidate: &PatternCandidate,
        batch_id: Uuid,
    ) -> Result<bool> {
        let metadata = serde_json::to_value(&candidate.metadata)?;

        let row = sqlx::query(
            r#"
            INSERT INTO pattern_summaries (
                id, pattern_type, pattern_name, scope_id, scope_data,
                confidence, frequency, first_detected, last_updated,
                batch_id, metadata, user_id, workspace_id, project_name
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), NOW(), $8, $9, $10, $11, $12)
            ON CONFLICT (pattern_type, pattern_name, scope_id, scope_data) DO UPDATE SET
                frequency = pattern_summaries.frequency + EXCLUDED.frequency,
                confidence = GREATEST(pattern_summaries.confidence, EXCLUDED.confidence),
                last_updated = NOW(),
                batch_id = EXCLUDED.batch_id,
                metadata = EXCLUDED.metadata
            RETURNING (xmax = 0) AS created
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&candidate.pattern_type)
        .bind(&candidate.pattern_name)
        .bind(&candidate.scope_id)
        .bind(candidate.scope.key_string())
        .bind(candidate.confidence)
        .bind(candidate.frequency)
        .bind(batch_id)
        .bind(metadata)
        .bind(&candidate.user_id)
        .bind(&candidate.workspace_id)
        .bind(&candidate.scope.project)
        .fetch_one(&self.pool)
        .await?;

        let created: bool = row.try_get("created")?;
        debug!(
            pattern_type = %candidate.pattern_type,
            pattern_name = %candidate.pattern_name,
            scope_id = %candidate.scope_id,
            frequency = candidate.frequency,
            created,
            "Merged pattern"
        );
        Ok(created)
    }

    /// Next batch of duplicate groups, members ordered oldest-first (ties by
    /// lowest id) so the first element is always the keeper.
    pub async fn find_duplicate_groups(&self, limit: i64) -> Result<Vec<DuplicateGroup>> {
        let rows = sqlx::query(
            r#"
            SELECT entity_id, entity_type,
                   ARRAY_AGG(id ORDER BY created_at ASC, id ASC) AS summary_ids
            FROM entity_summaries
            GROUP BY entity_id, entity_type
            HAVING COUNT(*) > 1
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(DuplicateGroup {
                    entity_id: row.try_get("entity_id")?,
                    entity_type: row.try_get("entity_type")?,
                    summary_ids: row.try_get("summary_ids")?,
                })
            })
            .collect()
    }

    /// Destructive: removes the given summaries. Callers re-derive anything
    /// that referenced them from the surviving node.
    pub async fn delete_summaries(&self, ids: &[Uuid]) -> Result<u64> {
        let result = sqlx::query("DELETE FROM entity_summaries WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Summaries whose raw entity no longer resolves (zero SUMMARIZES edges).
    /// Advisory only; nothing is deleted here.
    pub async fn orphan_report(&self, sample_limit: i64) -> Result<OrphanReport> {
        let total_row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
            FROM entity_summaries s
            LEFT JOIN memories m
              ON s.entity_type = 'memory' AND m.id = s.entity_id
            LEFT JOIN code_entities c
              ON s.entity_type = 'code' AND c.id = s.entity_id
            WHERE m.id IS NULL AND c.id IS NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(
            r#"
            SELECT s.id, s.entity_id, s.entity_type
            FROM entity_summaries s
            LEFT JOIN memories m
              ON s.entity_type = 'memory' AND m.id = s.entity_id
            LEFT JOIN code_entities c
              ON s.entity_type = 'code' AND c.id = s.entity_id
            WHERE m.id IS NULL AND c.id IS NULL
            ORDER BY s.created_at ASC
            LIMIT $1
            "#,
        )
        .bind(sample_limit)
        .fetch_all(&self.pool)
        .await?;

        let sample = rows
            .into_iter()
            .map(|row| {
                Ok(OrphanSummary {
                    id: row.try_get("id")?,
                    entity_id: row.try_get("entity_id")?,
                    entity_type: row.try_get("entity_type")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(OrphanReport {
            total: total_row.try_get("total")?,
            sample,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(ids: Vec<Uuid>) -> DuplicateGroup {
        DuplicateGroup {
            entity_id: Uuid::new_v4(),
            entity_type: "memory".to_string(),
            summary_ids: ids,
        }
    }

    #[test]
    fn duplicate_group_keeps_first_member() {
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        let g = group(ids.clone());
        assert_eq!(g.keeper(), Some(ids[0]));
        assert_eq!(g.victims(), &ids[1..]);
        assert_eq!(g.victims().len(), 4);
    }

    #[test]
    fn singleton_group_has_no_victims() {
        let g = group(vec![Uuid::new_v4()]);
        assert!(g.victims().is_empty());
    }
}

use sqlx::PgPool;
use tracing::{info, warn};

use crate::error::Result;

/// Idempotent schema setup for the pipeline-owned tables.
///
/// The raw `memories` / `code_entities` tables belong to the producing
/// collaborators; they are created here only so a fresh database is usable
/// for local development. The uniqueness constraints are the load-bearing
/// part: all concurrent-writer correctness hangs off them.
pub struct GraphSchema<'a> {
    pool: &'a PgPool,
    dimensions: usize,
}

impl<'a> GraphSchema<'a> {
    pub fn new(pool: &'a PgPool, dimensions: usize) -> Self {
        Self { pool, dimensions }
    }

    pub async fn ensure(&self) -> Result<()> {
        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(self.pool)
            .await?;

        self.ensure_raw_tables().await?;
        self.ensure_entity_summaries().await?;
        self.ensure_pattern_summaries().await?;
        self.ensure_vector_index().await;

        info!("Graph schema ensured ({} dim embeddings)", self.dimensions);
        Ok(())
    }

    async fn ensure_raw_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS memories (
                id UUID PRIMARY KEY,
                user_id TEXT,
                workspace_id TEXT,
                project_name TEXT NOT NULL DEFAULT 'default',
                content TEXT NOT NULL,
                occurred_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS code_entities (
                id UUID PRIMARY KEY,
                user_id TEXT,
                workspace_id TEXT,
                project_name TEXT NOT NULL DEFAULT 'default',
                name TEXT,
                file_path TEXT,
                content TEXT NOT NULL,
                language TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(self.pool)
        .await?;

        Ok(())
    }

    async fn ensure_entity_summaries(&self) -> Result<()> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS entity_summaries (
                id UUID PRIMARY KEY,
                entity_id UUID NOT NULL,
                entity_type TEXT NOT NULL CHECK (entity_type IN ('memory', 'code')),
                embedding vector({dims}),
                pattern_signals JSONB NOT NULL DEFAULT '{{}}',
                keyword_frequencies JSONB NOT NULL DEFAULT '{{}}',
                user_id TEXT,
                workspace_id TEXT,
                project_name TEXT NOT NULL,
                occurred_at TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                CONSTRAINT entity_summaries_entity_key UNIQUE (entity_id, entity_type)
            )
            "#,
            dims = self.dimensions
        );
        sqlx::query(&ddl).execute(self.pool).await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS entity_summaries_occurred_idx
             ON entity_summaries (occurred_at DESC)",
        )
        .execute(self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS entity_summaries_signals_idx
             ON entity_summaries USING GIN (pattern_signals)",
        )
        .execute(self.pool)
        .await?;

        Ok(())
    }

    async fn ensure_pattern_summaries(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pattern_summaries (
                id UUID PRIMARY KEY,
                pattern_type TEXT NOT NULL,
                pattern_name TEXT NOT NULL,
                scope_id TEXT NOT NULL,
                scope_data TEXT NOT NULL,
                confidence DOUBLE PRECISION NOT NULL,
                frequency BIGINT NOT NULL,
                first_detected TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                last_updated TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                batch_id UUID NOT NULL,
                metadata JSONB NOT NULL,
                user_id TEXT,
                workspace_id TEXT,
                project_name TEXT,
                CONSTRAINT pattern_summaries_scope_key
                    UNIQUE (pattern_type, pattern_name, scope_id, scope_data)
            )
            "#,
        )
        .execute(self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS pattern_summaries_scope_idx
             ON pattern_summaries (scope_id, pattern_type)",
        )
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Best-effort approximate index. pgvector caps indexed vectors at 2000
    /// dimensions, so with larger embeddings this fails and similarity queries
    /// run as exact sequential scans, which is the documented fallback path.
    async fn ensure_vector_index(&self) {
        let result = sqlx::query(
            "CREATE INDEX IF NOT EXISTS entity_summaries_embedding_idx
             ON entity_summaries USING hnsw (embedding vector_cosine_ops)",
        )
        .execute(self.pool)
        .await;

        if let Err(e) = result {
            warn!("Vector index unavailable, similarity search will use exact scans: {e}");
        }
    }
}

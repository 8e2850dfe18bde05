//! Storage-level invariant tests.
//!
//! These verify the guarantees that hang off the database's uniqueness
//! constraints and conditional upserts: concurrent summarization leaves one
//! row, pattern frequency accumulates in place, and the maintenance job
//! keeps the earliest of a duplicate group.
//!
//! Requires PostgreSQL with the pgvector extension. Set TEST_DATABASE_URL
//! (or DATABASE_URL) to run; the tests skip themselves otherwise. They
//! recreate the pipeline-owned tables, so point them at a throwaway database.

use std::env;
use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use pgvector::Vector;
use sqlx::PgPool;
use uuid::Uuid;

use mnemograph::embedding::{EmbeddingService, SimpleEmbedder};
use mnemograph::graph::{
    EntityStore, EntityType, GraphSchema, PatternCandidate, PatternMetadata, RawEntityRef,
    ScopeData, SignalKind,
};
use mnemograph::maintenance::MaintenanceJob;
use mnemograph::summarizer::Summarizer;

const DIMS: usize = 8;

// The tests share table names, so they serialize on this lock.
static DB_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

async fn test_pool() -> Option<PgPool> {
    let url = env::var("TEST_DATABASE_URL")
        .or_else(|_| env::var("DATABASE_URL"))
        .ok();
    let Some(url) = url else {
        println!("skipping: TEST_DATABASE_URL / DATABASE_URL not set");
        return None;
    };
    match PgPool::connect(&url).await {
        Ok(pool) => Some(pool),
        Err(e) => {
            println!("skipping: cannot connect to test database: {e}");
            None
        }
    }
}

async fn fresh_store(pool: &PgPool) -> Result<EntityStore> {
    sqlx::query("DROP TABLE IF EXISTS entity_summaries")
        .execute(pool)
        .await?;
    sqlx::query("DROP TABLE IF EXISTS pattern_summaries")
        .execute(pool)
        .await?;
    GraphSchema::new(pool, DIMS).ensure().await?;
    Ok(EntityStore::new(pool.clone()))
}

async fn seed_memory(pool: &PgPool, content: &str) -> Result<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO memories (id, user_id, project_name, content, occurred_at)
         VALUES ($1, 'u1', 'api', $2, NOW())",
    )
    .bind(id)
    .bind(content)
    .execute(pool)
    .await?;
    Ok(id)
}

#[tokio::test]
async fn concurrent_summarization_leaves_one_summary() -> Result<()> {
    let _guard = DB_LOCK.lock().await;
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let store = fresh_store(&pool).await?;
    let memory_id = seed_memory(
        &pool,
        "debugging a startup error, fix landed after tracing the crash",
    )
    .await?;

    let embedder: Arc<dyn EmbeddingService> = Arc::new(SimpleEmbedder::new_mock(DIMS));
    let summarizer = Summarizer::new(store.clone(), embedder);
    let entity_ref = RawEntityRef {
        entity_id: memory_id,
        entity_type: EntityType::Memory,
        enqueued_at: Utc::now(),
    };

    let mut handles = Vec::new();
    for _ in 0..8 {
        let summarizer = summarizer.clone();
        let entity_ref = entity_ref.clone();
        handles.push(tokio::spawn(
            async move { summarizer.summarize(&entity_ref).await },
        ));
    }
    for handle in handles {
        handle.await?.expect("summarize succeeds under contention");
    }

    assert_eq!(store.summary_count(memory_id, EntityType::Memory).await?, 1);

    let summary = store
        .get_summary(memory_id, EntityType::Memory)
        .await?
        .expect("summary exists");
    assert_eq!(summary.entity_id, memory_id);
    assert_eq!(summary.entity_type, EntityType::Memory);
    assert!(summary.pattern_signals.has(SignalKind::Debugging));
    assert!(summary.embedding.is_some());
    Ok(())
}

#[tokio::test]
async fn rerunning_a_batch_accumulates_frequency_in_one_row() -> Result<()> {
    let _guard = DB_LOCK.lock().await;
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let store = fresh_store(&pool).await?;

    let candidate = PatternCandidate {
        pattern_type: "debugging".to_string(),
        pattern_name: "debugging-session-semantic".to_string(),
        scope_id: "u1".to_string(),
        scope: ScopeData {
            project: "api".to_string(),
            period: Some("2026-08-17".to_string()),
        },
        user_id: Some("u1".to_string()),
        workspace_id: None,
        confidence: 0.24,
        frequency: 3,
        metadata: PatternMetadata::Semantic {
            avg_similarity: 0.787,
            sample_entity_ids: vec![],
            seed_id: None,
        },
    };

    let created = store.upsert_pattern(&candidate, Uuid::new_v4()).await?;
    assert!(created);
    let created = store.upsert_pattern(&candidate, Uuid::new_v4()).await?;
    assert!(!created);

    let pattern = store
        .get_pattern(
            "debugging",
            "debugging-session-semantic",
            "u1",
            &candidate.scope.key_string(),
        )
        .await?
        .expect("pattern exists");
    assert_eq!(pattern.frequency, 6);
    assert!(pattern.metadata.is_semantic());

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pattern_summaries")
        .fetch_one(&pool)
        .await?;
    assert_eq!(rows, 1);

    // Frequency never moves downward, even when a later batch is smaller.
    let mut smaller = candidate.clone();
    smaller.frequency = 2;
    store.upsert_pattern(&smaller, Uuid::new_v4()).await?;
    let pattern = store
        .get_pattern(
            "debugging",
            "debugging-session-semantic",
            "u1",
            &candidate.scope.key_string(),
        )
        .await?
        .expect("pattern exists");
    assert_eq!(pattern.frequency, 8);
    Ok(())
}

async fn seed_summary(
    pool: &PgPool,
    entity_type: &str,
    embedding: &Vector,
) -> Result<Uuid> {
    let entity_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO entity_summaries
             (id, entity_id, entity_type, embedding, pattern_signals,
              keyword_frequencies, user_id, project_name, occurred_at)
         VALUES ($1, $2, $3, $4, '{}', '{}', 'u1', 'api', NOW())",
    )
    .bind(Uuid::new_v4())
    .bind(entity_id)
    .bind(entity_type)
    .bind(embedding)
    .execute(pool)
    .await?;
    Ok(entity_id)
}

#[tokio::test]
async fn memory_code_samples_are_distinct_and_ordered() -> Result<()> {
    let _guard = DB_LOCK.lock().await;
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let store = fresh_store(&pool).await?;

    // Identical embeddings so every memory-code pair clears the floor. The
    // 2x3 join fans each entity out over multiple pairs; the samples must
    // still list each entity once, in a stable order.
    let embedding = Vector::from(vec![1.0; DIMS]);
    let mut memory_ids = vec![
        seed_summary(&pool, "memory", &embedding).await?,
        seed_summary(&pool, "memory", &embedding).await?,
    ];
    let mut code_ids = vec![
        seed_summary(&pool, "code", &embedding).await?,
        seed_summary(&pool, "code", &embedding).await?,
        seed_summary(&pool, "code", &embedding).await?,
    ];
    memory_ids.sort();
    code_ids.sort();

    let groups = store.memory_code_groups(0.7, 3).await?;
    assert_eq!(groups.len(), 1);
    let group = &groups[0];
    assert_eq!(group.pairs, 6);
    assert_eq!(group.memory_samples, memory_ids);
    assert_eq!(group.code_samples, code_ids);
    Ok(())
}

#[tokio::test]
async fn dedup_keeps_earliest_of_five_duplicates() -> Result<()> {
    let _guard = DB_LOCK.lock().await;
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let store = fresh_store(&pool).await?;

    // Reproduce a pre-constraint corpus: the duplicates this job exists for
    // were written before the uniqueness key was in place.
    sqlx::query("ALTER TABLE entity_summaries DROP CONSTRAINT entity_summaries_entity_key")
        .execute(&pool)
        .await?;

    let entity_id = Uuid::new_v4();
    let base = Utc::now() - Duration::days(5);
    let mut summary_ids = Vec::new();
    for day in 0..5i64 {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO entity_summaries
                 (id, entity_id, entity_type, pattern_signals, keyword_frequencies,
                  project_name, occurred_at, created_at, updated_at)
             VALUES ($1, $2, 'memory', '{}', '{}', 'api', $3, $3, $3)",
        )
        .bind(id)
        .bind(entity_id)
        .bind(base + Duration::days(day))
        .execute(&pool)
        .await?;
        summary_ids.push(id);
    }

    let report = MaintenanceJob::new(store.clone()).dedupe_summaries().await?;
    assert_eq!(report.groups_processed, 1);
    assert_eq!(report.summaries_deleted, 4);

    let survivor = store
        .get_summary(entity_id, EntityType::Memory)
        .await?
        .expect("one summary survives");
    assert_eq!(survivor.id, summary_ids[0]);
    assert_eq!(store.summary_count(entity_id, EntityType::Memory).await?, 1);
    Ok(())
}

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use mnemograph::api::{self, AppState};
use mnemograph::config::Config;
use mnemograph::embedding::{EmbeddingService, SimpleEmbedder};
use mnemograph::graph::{DetectionTrigger, EntityStore, GraphSchema, RawEntityRef};
use mnemograph::maintenance::MaintenanceJob;
use mnemograph::patterns::PatternDetector;
use mnemograph::queue::DurableQueue;
use mnemograph::summarizer::{shutdown_requested, Summarizer, SummarizerWorker};

#[derive(Parser)]
#[command(name = "mnemograph")]
#[command(about = "Entity summarization and pattern mining pipeline")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline: workers, scheduler and HTTP trigger API
    Start,
    /// Run one pattern detection batch and exit
    Detect,
    /// Collapse duplicate entity summaries and report orphans
    Dedupe {
        /// Report what would be deleted without deleting anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Create tables, constraints and indexes, then exit
    InitSchema,
    /// Check database and embedding service connectivity
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "mnemograph=info,tower_http=info".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("failed to load configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await
        .context("failed to connect to PostgreSQL")?;

    let store = EntityStore::new(pool.clone());
    let embedder: Arc<dyn EmbeddingService> =
        Arc::new(SimpleEmbedder::new(&config.embedding).context("failed to build embedder")?);

    match cli.command {
        Commands::InitSchema => {
            GraphSchema::new(&pool, embedder.dimensions())
                .ensure()
                .await?;
            ensure_queues(&pool, &config).await?;
            info!("Schema initialized");
        }
        Commands::Health => {
            store.health_check().await.context("database unreachable")?;
            info!("Database: ok");
            match embedder.health_check().await {
                Ok(()) => info!("Embedding service: ok"),
                Err(e) => warn!("Embedding service: unavailable ({e})"),
            }
        }
        Commands::Detect => {
            let detector = PatternDetector::new(store, config.detector.clone());
            let report = detector.detect_patterns(Uuid::new_v4()).await?;
            info!(
                created = report.patterns_created,
                updated = report.patterns_updated,
                seeds_processed = report.seeds_processed,
                seeds_skipped = report.seeds_skipped,
                "Detection batch complete"
            );
        }
        Commands::Dedupe { dry_run } => {
            let job = if dry_run {
                MaintenanceJob::dry_run(store)
            } else {
                MaintenanceJob::new(store)
            };
            let report = job.run().await?;
            info!(
                groups = report.groups_processed,
                deleted = report.summaries_deleted,
                "Maintenance complete"
            );
        }
        Commands::Start => {
            run_pipeline(pool, store, embedder, config).await?;
        }
    }

    Ok(())
}

async fn ensure_queues(
    pool: &sqlx::PgPool,
    config: &Config,
) -> Result<(
    DurableQueue<RawEntityRef>,
    DurableQueue<RawEntityRef>,
    DurableQueue<DetectionTrigger>,
)> {
    let memory_queue =
        DurableQueue::<RawEntityRef>::new(pool.clone(), "memory_ingestion", config.queue.clone())?;
    let code_queue =
        DurableQueue::<RawEntityRef>::new(pool.clone(), "code_ingestion", config.queue.clone())?;
    let trigger_queue = DurableQueue::<DetectionTrigger>::new(
        pool.clone(),
        "pattern_detection",
        config.queue.clone(),
    )?;
    memory_queue.ensure().await?;
    code_queue.ensure().await?;
    trigger_queue.ensure().await?;
    Ok((memory_queue, code_queue, trigger_queue))
}

async fn run_pipeline(
    pool: sqlx::PgPool,
    store: EntityStore,
    embedder: Arc<dyn EmbeddingService>,
    config: Config,
) -> Result<()> {
    GraphSchema::new(&pool, embedder.dimensions())
        .ensure()
        .await?;
    let (memory_queue, code_queue, trigger_queue) = ensure_queues(&pool, &config).await?;

    let summarizer = Summarizer::new(store.clone(), embedder.clone());
    let detector = Arc::new(PatternDetector::new(store.clone(), config.detector.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut worker_handles = Vec::new();
    for queue in [&memory_queue, &code_queue] {
        for _ in 0..config.summarizer_workers {
            let worker = SummarizerWorker::new(
                summarizer.clone(),
                queue.clone(),
                trigger_queue.clone(),
                config.queue.clone(),
            );
            let rx = shutdown_rx.clone();
            worker_handles.push(tokio::spawn(async move { worker.run(rx).await }));
        }
    }

    // Trigger consumer: ingestion nudges collapse into one detection run per
    // drained batch of triggers.
    {
        let detector = detector.clone();
        let triggers = trigger_queue.clone();
        let mut rx = shutdown_rx.clone();
        let poll = Duration::from_secs(config.queue.poll_interval_seconds);
        worker_handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if shutdown_requested(changed, &rx) {
                            return;
                        }
                    }
                    _ = tokio::time::sleep(poll) => {
                        match triggers.read_batch().await {
                            Ok(messages) if !messages.is_empty() => {
                                let batch_id = messages[0].payload.batch_id;
                                if let Err(e) = detector.detect_patterns(batch_id).await {
                                    error!("Triggered detection failed: {e}");
                                    continue;
                                }
                                for message in &messages {
                                    if let Err(e) = triggers.delete(message.msg_id).await {
                                        warn!("Failed to ack trigger {}: {e}", message.msg_id);
                                    }
                                }
                            }
                            Ok(_) => {}
                            Err(e) => error!("Trigger queue read failed: {e}"),
                        }
                    }
                }
            }
        }));
    }

    let scheduler = JobScheduler::new()
        .await
        .map_err(|e| anyhow::anyhow!("failed to initialize job scheduler: {e}"))?;

    {
        let detector = detector.clone();
        let job = Job::new_async(config.detection_schedule.as_str(), move |_uuid, _l| {
            let detector = detector.clone();
            Box::pin(async move {
                let batch_id = Uuid::new_v4();
                match detector.detect_patterns(batch_id).await {
                    Ok(report) => info!(
                        batch_id = %batch_id,
                        created = report.patterns_created,
                        updated = report.patterns_updated,
                        "Scheduled detection run complete"
                    ),
                    Err(e) => error!("Scheduled detection run failed: {e}"),
                }
            })
        })
        .map_err(|e| anyhow::anyhow!("invalid detection schedule: {e}"))?;
        scheduler
            .add(job)
            .await
            .map_err(|e| anyhow::anyhow!("failed to schedule detection job: {e}"))?;
    }

    {
        let store = store.clone();
        let job = Job::new_async(config.maintenance_schedule.as_str(), move |_uuid, _l| {
            let store = store.clone();
            Box::pin(async move {
                match MaintenanceJob::new(store).run().await {
                    Ok(report) => info!(
                        groups = report.groups_processed,
                        deleted = report.summaries_deleted,
                        "Scheduled maintenance run complete"
                    ),
                    Err(e) => error!("Scheduled maintenance run failed: {e}"),
                }
            })
        })
        .map_err(|e| anyhow::anyhow!("invalid maintenance schedule: {e}"))?;
        scheduler
            .add(job)
            .await
            .map_err(|e| anyhow::anyhow!("failed to schedule maintenance job: {e}"))?;
    }

    scheduler
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("failed to start scheduler: {e}"))?;

    let state = AppState {
        store,
        embedder,
        detector,
        memory_queue: Arc::new(memory_queue),
        code_queue: Arc::new(code_queue),
        trigger_queue: Arc::new(trigger_queue),
    };
    let http = tokio::spawn(api::serve(state, config.http_port));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    shutdown_tx.send(true).ok();
    for handle in worker_handles {
        handle.abort();
    }
    http.abort();

    Ok(())
}

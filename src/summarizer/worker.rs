//! Summarizer worker: drains an ingestion queue into `entity_summaries`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::embedding::EmbeddingService;
use crate::error::{PipelineError, Result};
use crate::graph::{DetectionTrigger, EntityStore, NewSummary, RawEntityRef};
use crate::queue::DurableQueue;
use crate::summarizer::signals;

/// Turns one raw entity reference into a summary node.
#[derive(Clone)]
pub struct Summarizer {
    store: EntityStore,
    embedder: Arc<dyn EmbeddingService>,
}

impl Summarizer {
    pub fn new(store: EntityStore, embedder: Arc<dyn EmbeddingService>) -> Self {
        Self { store, embedder }
    }

    /// Summarize one entity. Safe to call any number of times for the same
    /// reference: the write is an upsert keyed on `(entity_id, entity_type)`.
    pub async fn summarize(&self, entity_ref: &RawEntityRef) -> Result<Uuid> {
        let entity = self
            .store
            .fetch_raw_entity(entity_ref.entity_id, entity_ref.entity_type)
            .await?
            .ok_or_else(|| PipelineError::EntityNotFound {
                entity_id: entity_ref.entity_id,
                entity_type: entity_ref.entity_type.to_string(),
            })?;

        let (pattern_signals, keywords) = signals::classify(&entity.content);
        let embedding = self
            .embedder
            .generate_embedding(&entity.embedding_text())
            .await?;

        let summary = NewSummary {
            entity_id: entity.id,
            entity_type: entity.entity_type,
            embedding: embedding.into(),
            pattern_signals,
            keyword_frequencies: serde_json::to_value(&keywords)?,
            user_id: entity.user_id.clone(),
            workspace_id: entity.workspace_id.clone(),
            project_name: entity.project_name.clone(),
            occurred_at: entity.occurred_at,
        };

        match self.store.upsert_summary(&summary).await {
            Ok(id) => {
                debug!(entity_id = %entity.id, entity_type = %entity.entity_type, summary_id = %id,
                       "Summarized entity");
                Ok(id)
            }
            // A concurrent worker won the insert race between our statement's
            // conflict arbitration and commit. Re-running the upsert takes the
            // update path and returns the surviving row's id.
            Err(e) if e.is_merge() => {
                debug!(entity_id = %entity.id, "Summary merged by concurrent writer");
                self.store.upsert_summary(&summary).await
            }
            Err(e) => Err(e),
        }
    }
}

/// Stop when the flag flips to true or the sender side is gone. A closed
/// channel must read as shutdown, otherwise `changed()` resolves with `Err`
/// on every iteration and the poll loop spins hot.
pub fn shutdown_requested(
    changed: std::result::Result<(), watch::error::RecvError>,
    shutdown: &watch::Receiver<bool>,
) -> bool {
    changed.is_err() || *shutdown.borrow()
}

/// Outcome counts for one drained batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct BatchOutcome {
    pub processed: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
}

/// Polling loop around a `Summarizer` and one ingestion queue.
pub struct SummarizerWorker {
    summarizer: Summarizer,
    queue: DurableQueue<RawEntityRef>,
    trigger_queue: DurableQueue<DetectionTrigger>,
    config: QueueConfig,
}

impl SummarizerWorker {
    pub fn new(
        summarizer: Summarizer,
        queue: DurableQueue<RawEntityRef>,
        trigger_queue: DurableQueue<DetectionTrigger>,
        config: QueueConfig,
    ) -> Self {
        Self {
            summarizer,
            queue,
            trigger_queue,
            config,
        }
    }

    /// Poll until `shutdown` flips. Errors from a single batch are logged and
    /// the loop keeps going; redelivery handles the rest.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(queue = %self.queue.name(), "Summarizer worker started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if shutdown_requested(changed, &shutdown) {
                        info!(queue = %self.queue.name(), "Summarizer worker stopping");
                        return;
                    }
                }
                result = self.drain_batch() => {
                    match result {
                        Ok(outcome) if outcome.processed + outcome.dead_lettered > 0 => {
                            info!(
                                queue = %self.queue.name(),
                                processed = outcome.processed,
                                requeued = outcome.requeued,
                                dead_lettered = outcome.dead_lettered,
                                "Drained batch"
                            );
                        }
                        Ok(_) => {
                            tokio::time::sleep(self.poll_delay()).await;
                        }
                        Err(e) => {
                            error!(queue = %self.queue.name(), "Batch failed: {e}");
                            tokio::time::sleep(self.poll_delay()).await;
                        }
                    }
                }
            }
        }
    }

    /// Poll interval with jitter so idle workers don't hit the table in
    /// lockstep.
    fn poll_delay(&self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0..500);
        Duration::from_secs(self.config.poll_interval_seconds) + Duration::from_millis(jitter)
    }

    /// Claim and process one batch. Successes are acked, retryable failures
    /// are left for redelivery, exhausted messages are dead-lettered.
    pub async fn drain_batch(&self) -> Result<BatchOutcome> {
        let messages = self.queue.read_batch().await?;
        let mut outcome = BatchOutcome::default();

        for message in &messages {
            if message.exhausted(self.config.max_attempts) {
                self.queue
                    .dead_letter(message, "retry budget exhausted")
                    .await?;
                outcome.dead_lettered += 1;
                continue;
            }

            match self.summarizer.summarize(&message.payload).await {
                Ok(_) => {
                    self.queue.delete(message.msg_id).await?;
                    outcome.processed += 1;
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        msg_id = message.msg_id,
                        read_ct = message.read_ct,
                        "Summarization failed, leaving for redelivery: {e}"
                    );
                    outcome.requeued += 1;
                }
                Err(e) => {
                    self.queue.dead_letter(message, &e.to_string()).await?;
                    outcome.dead_lettered += 1;
                }
            }
        }

        // Fresh summaries may complete a pattern; nudge the detector.
        if outcome.processed > 0 {
            let trigger = DetectionTrigger {
                batch_id: Uuid::new_v4(),
                requested_at: Utc::now(),
            };
            self.trigger_queue.send(&trigger).await?;
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropped_shutdown_sender_reads_as_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        let changed = rx.changed().await;
        assert!(changed.is_err());
        assert!(shutdown_requested(changed, &rx));
    }

    #[tokio::test]
    async fn explicit_shutdown_signal_stops_loop() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        let changed = rx.changed().await;
        assert!(shutdown_requested(changed, &rx));
    }

    #[tokio::test]
    async fn spurious_wakeup_keeps_running() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(false).unwrap();
        let changed = rx.changed().await;
        assert!(!shutdown_requested(changed, &rx));
    }
}

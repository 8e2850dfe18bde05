//! Maintenance: duplicate summary cleanup and orphan reporting.
//!
//! With the uniqueness constraint in place new duplicates cannot appear, so
//! this job is for databases that accumulated them before the constraint
//! existed. The keep policy is fixed: earliest `created_at` survives, ties
//! broken by lowest id, and the deletion runs in bounded batches so a large
//! backlog never produces one giant transaction.

use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::graph::{EntityStore, OrphanReport};

const GROUP_BATCH: i64 = 200;
const DELETE_BATCH: usize = 100;

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct DedupReport {
    pub groups_processed: usize,
    pub summaries_deleted: u64,
}

pub struct MaintenanceJob {
    store: EntityStore,
    /// When set, duplicates are reported but nothing is deleted.
    dry_run: bool,
}

impl MaintenanceJob {
    pub fn new(store: EntityStore) -> Self {
        Self {
            store,
            dry_run: false,
        }
    }

    pub fn dry_run(store: EntityStore) -> Self {
        Self {
            store,
            dry_run: true,
        }
    }

    /// Collapse every duplicate group down to its keeper.
    pub async fn dedupe_summaries(&self) -> Result<DedupReport> {
        let mut report = DedupReport::default();

        loop {
            let groups = self.store.find_duplicate_groups(GROUP_BATCH).await?;
            if groups.is_empty() {
                break;
            }

            let mut victims = Vec::new();
            for group in &groups {
                report.groups_processed += 1;
                info!(
                    entity_id = %group.entity_id,
                    entity_type = %group.entity_type,
                    duplicates = group.victims().len(),
                    keeper = ?group.keeper(),
                    "Duplicate summary group"
                );
                victims.extend_from_slice(group.victims());
            }

            if self.dry_run {
                info!(
                    groups = groups.len(),
                    would_delete = victims.len(),
                    "Dry run, leaving duplicates in place"
                );
                break;
            }

            for chunk in victims.chunks(DELETE_BATCH) {
                report.summaries_deleted += self.store.delete_summaries(chunk).await?;
            }
        }

        info!(
            groups = report.groups_processed,
            deleted = report.summaries_deleted,
            "Summary deduplication finished"
        );
        Ok(report)
    }

    /// Report summaries whose raw entity is gone. Advisory: deleting them is
    /// an operator decision, not something the job does on its own.
    pub async fn report_orphans(&self) -> Result<OrphanReport> {
        let report = self.store.orphan_report(20).await?;
        if report.total > 0 {
            warn!(
                orphans = report.total,
                "Summaries without a resolvable raw entity"
            );
        }
        Ok(report)
    }

    /// Full maintenance pass: dedupe, then orphan report.
    pub async fn run(&self) -> Result<DedupReport> {
        let report = self.dedupe_summaries().await?;
        self.report_orphans().await?;
        Ok(report)
    }
}

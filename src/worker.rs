use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::background::SingleRun;
use crate::config::{LibrarianConfig, ProcessorConfig};
use crate::feeds;
use crate::librarian;
use crate::library;
use crate::ontology::{self, TagNormalizer};
use crate::processors::Processor;
use crate::types::{Entry, Error, Result};

/// Whether a processor may touch an entry, given where the entry came from.
/// Collection feeds and subscriber feeds are funded differently, so each is
/// gated by its own flag.
pub fn entry_is_eligible(config: &ProcessorConfig, in_collection: bool) -> bool {
    if in_collection {
        config.allowed_for_collections
    } else {
        config.allowed_for_users
    }
}

enum Outcome {
    Tagged(Vec<String>),
    Retry,
    Failed,
}

/// One background worker per configured processor. Each run tops up the
/// queue from the entry stream, pulls a batch and processes it
/// concurrently; entries are removed from the queue only after their
/// outcome is settled.
pub struct EntriesProcessor {
    pool: PgPool,
    config: ProcessorConfig,
    librarian: LibrarianConfig,
    processor: Arc<dyn Processor>,
    normalizer: Arc<dyn TagNormalizer>,
}

impl EntriesProcessor {
    pub fn new(
        pool: PgPool,
        config: ProcessorConfig,
        librarian: LibrarianConfig,
        processor: Arc<dyn Processor>,
        normalizer: Arc<dyn TagNormalizer>,
    ) -> Self {
        Self {
            pool,
            config,
            librarian,
            processor,
            normalizer,
        }
    }

    async fn entry_in_collection(&self, entry: &Entry) -> Result<bool> {
        let feed_ids = feeds::feed_ids_for_source(&self.pool, entry.source_id).await?;
        feeds::any_feed_in_collection(&self.pool, &feed_ids).await
    }

    async fn process_entry(&self, entry: &Entry) -> Outcome {
        match self.processor.process(entry).await {
            Ok(tags) => Outcome::Tagged(tags),
            Err(Error::SkipAndContinueLater) => {
                debug!(entry_id = %entry.id, processor = %self.config.name, "entry_postponed");
                Outcome::Retry
            }
            Err(error) => {
                warn!(entry_id = %entry.id, processor = %self.config.name, %error, "entry_processing_failed");
                Outcome::Failed
            }
        }
    }

    async fn settle(&self, entry_id: Uuid, outcome: Outcome) -> Result<()> {
        match outcome {
            Outcome::Tagged(tags) => {
                ontology::apply_tags_to_entry(
                    &self.pool,
                    self.normalizer.as_ref(),
                    entry_id,
                    self.config.id,
                    tags,
                )
                .await?;

                librarian::remove_entries_from_queue(&self.pool, self.config.id, &[entry_id]).await
            }
            Outcome::Retry => librarian::requeue_entry(&self.pool, self.config.id, entry_id).await,
            Outcome::Failed => {
                librarian::add_entries_to_failed_storage(&self.pool, self.config.id, &[entry_id]).await?;
                librarian::remove_entries_from_queue(&self.pool, self.config.id, &[entry_id]).await
            }
        }
    }
}

#[async_trait]
impl SingleRun for EntriesProcessor {
    async fn single_run(&self) -> Result<()> {
        let concurrency = self.config.concurrency as i64;

        librarian::plan_processor_queue(&self.pool, self.config.id, concurrency, self.librarian.chunk).await?;

        let queued_ids = librarian::pull_queue_entries(&self.pool, self.config.id, concurrency).await?;

        if queued_ids.is_empty() {
            return Ok(());
        }

        let entries = library::get_entries_by_ids(&self.pool, &queued_ids).await?;

        let entries: HashMap<Uuid, Entry> = entries.into_iter().map(|entry| (entry.id, entry)).collect();

        // Queue rows can outlive their entries (source trimmed, entry gone).
        // Such rows are dropped without processing.
        let vanished: Vec<Uuid> = queued_ids
            .iter()
            .copied()
            .filter(|id| !entries.contains_key(id))
            .collect();

        if !vanished.is_empty() {
            debug!(processor = %self.config.name, vanished = vanished.len(), "queued_entries_vanished");
            librarian::remove_entries_from_queue(&self.pool, self.config.id, &vanished).await?;
        }

        let mut batch = Vec::new();
        let mut ineligible = Vec::new();

        for entry in entries.values() {
            let in_collection = self.entry_in_collection(entry).await?;

            if entry_is_eligible(&self.config, in_collection) {
                batch.push(entry);
            } else {
                ineligible.push(entry.id);
            }
        }

        if !ineligible.is_empty() {
            librarian::remove_entries_from_queue(&self.pool, self.config.id, &ineligible).await?;
        }

        if batch.is_empty() {
            return Ok(());
        }

        // One entry failing must never take down its siblings: outcomes are
        // settled per entry, and only infrastructure errors (database,
        // queue) abort the run.
        let outcomes = join_all(batch.iter().map(|entry| self.process_entry(entry))).await;

        let mut tagged = 0;

        for (entry, outcome) in batch.iter().zip(outcomes) {
            if matches!(outcome, Outcome::Tagged(_)) {
                tagged += 1;
            }

            self.settle(entry.id, outcome).await?;
        }

        info!(processor = %self.config.name, processed = batch.len(), tagged, "processor_run_finished");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessorKind;

    fn config(for_collections: bool, for_users: bool) -> ProcessorConfig {
        ProcessorConfig {
            id: 1,
            name: "test".to_string(),
            kind: ProcessorKind::Domain,
            enabled: true,
            concurrency: 4,
            allowed_for_collections: for_collections,
            allowed_for_users: for_users,
            llm: None,
        }
    }

    #[test]
    fn collection_entries_gated_by_collections_flag() {
        assert!(entry_is_eligible(&config(true, false), true));
        assert!(!entry_is_eligible(&config(false, true), true));
    }

    #[test]
    fn user_entries_gated_by_users_flag() {
        assert!(entry_is_eligible(&config(false, true), false));
        assert!(!entry_is_eligible(&config(true, false), false));
    }
}

//! Sweep stage: per-shard anti-join, batched deletion, and write-back.
//!
//! Each shard is processed independently: candidate rows stream in blocks,
//! every block becomes one deletion batch, and only paths whose deletion the
//! object store confirmed are written back as active=false. A failed
//! deletion leaves its row active, so the next sweep retries it.

use crate::config::GcConfig;
use crate::models::{InventoryRecord, SweepStats};
use crate::query::{CandidateQuery, TableName};
use crate::storage::traits::{ObjectStore, ReferenceIndex};
use crate::{Error, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Safely converts a Duration to milliseconds as u64, capping at `u64::MAX`.
#[inline]
fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Converts u64 to f64 for metrics, capping at `u32::MAX`.
///
/// Uses a u32 intermediate to avoid precision loss (`u32` fits exactly in
/// `f64`).
#[inline]
fn u64_to_f64(value: u64) -> f64 {
    let capped = u32::try_from(value).unwrap_or(u32::MAX);
    f64::from(capped)
}

/// Reconciles the inventory against the reference index and deletes
/// unreferenced objects.
pub struct Sweeper {
    store: Arc<dyn ObjectStore>,
    index: Arc<dyn ReferenceIndex>,
    config: GcConfig,
    table: TableName,
}

/// Outcome of one deletion batch.
struct BatchOutcome {
    /// Records whose deletion the store confirmed.
    removed: Vec<InventoryRecord>,
    /// Deletions attempted and failed.
    failed: u64,
}

impl Sweeper {
    /// Creates a sweeper over the given backends.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the table name is invalid.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        index: Arc<dyn ReferenceIndex>,
        config: GcConfig,
    ) -> Result<Self> {
        let table = config.table_name()?;
        Ok(Self {
            store,
            index,
            config,
            table,
        })
    }

    /// Returns the inventory table this sweeper reads from.
    #[must_use]
    pub const fn table(&self) -> &TableName {
        &self.table
    }

    /// Runs the sweep over every shard in order.
    ///
    /// A `use_total` cap bounds the number of candidates processed across
    /// the whole run, not per shard; once it is exhausted the remaining
    /// shards are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connectivity`] or [`Error::Query`] on a fatal
    /// failure of the candidate query or the write-back. Per-object
    /// deletion failures are accumulated, never propagated.
    #[tracing::instrument(skip(self), fields(table = %self.table, dry_run = self.config.dry_run))]
    pub fn run(&self) -> Result<SweepStats> {
        let mut totals = SweepStats {
            dry_run: self.config.dry_run,
            ..Default::default()
        };
        let mut remaining = self.config.use_total;

        for shard in 0..self.config.samples {
            if remaining == Some(0) {
                tracing::info!(shard, "candidate cap reached, skipping remaining shards");
                break;
            }
            let query = CandidateQuery {
                table: &self.table,
                disk: &self.config.disk_name,
                cluster: self.config.cluster.as_deref(),
                samples: self.config.samples,
                after: self.config.use_after.as_deref(),
                age_hours: self.config.age_gate(),
                limit: remaining,
            };
            let started = Instant::now();
            let shard_stats = self.sweep_shard(&query, shard)?;
            metrics::histogram!("gc_sweep_duration_ms")
                .record(u64_to_f64(duration_to_millis(started.elapsed())));

            if let Some(left) = remaining.as_mut() {
                *left = left
                    .saturating_sub(shard_stats.objects_removed + shard_stats.deletions_failed);
            }
            totals.absorb(&shard_stats);
        }

        tracing::info!(
            removed = totals.objects_removed,
            bytes = totals.bytes_removed,
            failed = totals.deletions_failed,
            shards = totals.shards_processed,
            "sweep finished"
        );
        Ok(totals)
    }

    fn sweep_shard(&self, query: &CandidateQuery<'_>, shard: u32) -> Result<SweepStats> {
        let mut stats = SweepStats {
            shards_processed: 1,
            dry_run: self.config.dry_run,
            ..Default::default()
        };
        let blocks = self
            .index
            .stream_candidates(query, shard, self.config.sweep_block_rows)?;

        for block in blocks {
            let block = block?;
            if block.is_empty() {
                continue;
            }
            if self.config.dry_run {
                stats.objects_removed += block.len() as u64;
                stats.bytes_removed += block.iter().map(|r| r.size).sum::<u64>();
                continue;
            }

            let outcome = self.delete_batch(&block)?;
            stats.deletions_failed += outcome.failed;
            metrics::counter!("gc_deletions_failed_total").increment(outcome.failed);
            if outcome.removed.is_empty() {
                continue;
            }

            let deactivated: Vec<InventoryRecord> =
                outcome.removed.iter().map(InventoryRecord::deactivated).collect();
            self.index.insert_records(&self.table, &deactivated)?;

            let bytes: u64 = outcome.removed.iter().map(|r| r.size).sum();
            stats.objects_removed += outcome.removed.len() as u64;
            stats.bytes_removed += bytes;
            metrics::counter!("gc_objects_removed_total").increment(outcome.removed.len() as u64);
            metrics::counter!("gc_bytes_removed_total").increment(bytes);
            tracing::debug!(
                shard,
                removed = outcome.removed.len(),
                failed = outcome.failed,
                "deletion batch done"
            );
        }
        Ok(stats)
    }

    /// Deletes one batch, returning the records the store confirmed gone.
    fn delete_batch(&self, block: &[InventoryRecord]) -> Result<BatchOutcome> {
        if self.store.supports_bulk_delete() {
            self.delete_bulk(block)
        } else {
            self.delete_sequential(block)
        }
    }

    fn delete_bulk(&self, block: &[InventoryRecord]) -> Result<BatchOutcome> {
        let paths: Vec<String> = block.iter().map(|r| r.path.clone()).collect();
        let failures = self.store.delete_many(&self.config.s3.bucket, &paths)?;
        for failure in &failures {
            tracing::warn!(path = %failure.path, cause = %failure.cause, "deletion failed");
        }
        let failed_paths: HashSet<&str> =
            failures.iter().map(|f| f.path.as_str()).collect();
        let removed = block
            .iter()
            .filter(|r| !failed_paths.contains(r.path.as_str()))
            .cloned()
            .collect();
        Ok(BatchOutcome {
            removed,
            failed: failures.len() as u64,
        })
    }

    /// Sequential fallback: one failed deletion abandons the rest of the
    /// batch (those rows stay active and are retried next sweep), but never
    /// the shard loop.
    fn delete_sequential(&self, block: &[InventoryRecord]) -> Result<BatchOutcome> {
        let mut removed = Vec::with_capacity(block.len());
        let mut failed = 0;
        for record in block {
            match self.store.delete_one(&self.config.s3.bucket, &record.path) {
                Ok(()) => removed.push(record.clone()),
                Err(Error::Deletion { path, cause }) => {
                    tracing::warn!(path = %path, cause = %cause, "deletion failed, abandoning batch");
                    failed += 1;
                    break;
                },
                Err(other) => return Err(other),
            }
        }
        Ok(BatchOutcome { removed, failed })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::models::ObjectInfo;
    use crate::query;
    use crate::storage::memory::{MemoryIndex, MemoryObjectStore};
    use chrono::{Duration, Utc};

    fn setup(config: GcConfig) -> (Arc<MemoryObjectStore>, Arc<MemoryIndex>, Sweeper) {
        let store = Arc::new(MemoryObjectStore::new());
        let index = Arc::new(MemoryIndex::new());
        let sweeper = Sweeper::new(store.clone(), index.clone(), config).unwrap();
        (store, index, sweeper)
    }

    fn seed(
        store: &MemoryObjectStore,
        index: &MemoryIndex,
        table: &TableName,
        paths: &[&str],
        samples: u32,
    ) {
        index.execute(&query::create_table(table, samples)).unwrap();
        let records: Vec<InventoryRecord> = paths
            .iter()
            .map(|path| {
                let obj = ObjectInfo {
                    path: (*path).to_string(),
                    size: 100,
                    last_modified: Utc::now() - Duration::hours(10),
                };
                store.put(obj.clone());
                InventoryRecord::from_object(&obj)
            })
            .collect();
        index.insert_records(table, &records).unwrap();
    }

    #[test]
    fn test_sweep_removes_unreferenced_and_flips_rows() {
        let (store, index, sweeper) = setup(GcConfig::default());
        seed(&store, &index, sweeper.table(), &["data/a", "data/b"], 4);
        index.add_reference("data/a", "s3");

        let stats = sweeper.run().unwrap();
        assert_eq!(stats.objects_removed, 1);
        assert_eq!(stats.bytes_removed, 100);
        assert_eq!(stats.deletions_failed, 0);
        assert_eq!(stats.shards_processed, 4);

        assert!(store.contains("data/a"));
        assert!(!store.contains("data/b"));
        assert!(index.get(sweeper.table(), "data/a").unwrap().active);
        assert!(!index.get(sweeper.table(), "data/b").unwrap().active);
    }

    #[test]
    fn test_failed_deletion_keeps_row_active() {
        let (store, index, sweeper) = setup(GcConfig::default());
        seed(&store, &index, sweeper.table(), &["data/a", "data/b"], 1);
        store.fail_deletes_for("data/a");

        let stats = sweeper.run().unwrap();
        assert_eq!(stats.objects_removed, 1);
        assert_eq!(stats.deletions_failed, 1);

        // The failed path stays active for the next sweep to retry.
        assert!(index.get(sweeper.table(), "data/a").unwrap().active);
        assert!(!index.get(sweeper.table(), "data/b").unwrap().active);

        // The retry succeeds once the store recovers.
        let store2 = Arc::new(MemoryObjectStore::new());
        store2.put(ObjectInfo {
            path: "data/a".to_string(),
            size: 100,
            last_modified: Utc::now() - Duration::hours(10),
        });
        let retry = Sweeper::new(store2, index.clone(), GcConfig::default()).unwrap();
        let stats = retry.run().unwrap();
        assert_eq!(stats.objects_removed, 1);
        assert!(!index.get(retry.table(), "data/a").unwrap().active);
    }

    #[test]
    fn test_sequential_fallback_abandons_batch_not_loop() {
        // One shard so all three paths land in the same deletion batch.
        let config = GcConfig {
            samples: 1,
            ..Default::default()
        };
        let (store, index, sweeper) = setup(config);
        store.disable_bulk_delete();
        seed(
            &store,
            &index,
            sweeper.table(),
            &["data/a", "data/b", "data/c"],
            1,
        );
        store.fail_deletes_for("data/a");

        let stats = sweeper.run().unwrap();
        // data/a fails and abandons the rest of its batch; nothing else in
        // the shard is attempted this run, but the run itself succeeds.
        assert_eq!(stats.deletions_failed, 1);
        assert!(index.get(sweeper.table(), "data/a").unwrap().active);
        assert!(index.get(sweeper.table(), "data/b").unwrap().active);
    }

    #[test]
    fn test_dry_run_makes_no_calls_and_no_writes() {
        let config = GcConfig {
            dry_run: true,
            ..Default::default()
        };
        let (store, index, sweeper) = setup(config);
        seed(&store, &index, sweeper.table(), &["data/a", "data/b"], 2);

        let stats = sweeper.run().unwrap();
        assert!(stats.dry_run);
        assert_eq!(stats.objects_removed, 2);
        assert_eq!(stats.bytes_removed, 200);

        assert_eq!(store.delete_calls(), 0);
        assert_eq!(store.len(), 2);
        assert!(index.rows(sweeper.table()).iter().all(|r| r.active));
    }

    #[test]
    fn test_use_total_caps_across_shards() {
        let config = GcConfig {
            use_total: Some(2),
            samples: 4,
            ..Default::default()
        };
        let (store, index, sweeper) = setup(config);
        seed(
            &store,
            &index,
            sweeper.table(),
            &["data/a", "data/b", "data/c", "data/d", "data/e"],
            4,
        );

        let stats = sweeper.run().unwrap();
        assert_eq!(stats.objects_removed, 2);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_use_after_cursor_skips_earlier_paths() {
        let config = GcConfig {
            use_after: Some("data/b".to_string()),
            samples: 1,
            ..Default::default()
        };
        let (store, index, sweeper) = setup(config);
        seed(&store, &index, sweeper.table(), &["data/a", "data/b", "data/c"], 1);

        let stats = sweeper.run().unwrap();
        assert_eq!(stats.objects_removed, 1);
        assert!(store.contains("data/a"));
        assert!(store.contains("data/b"));
        assert!(!store.contains("data/c"));
    }

    #[test]
    fn test_metric_conversions_cap_instead_of_wrapping() {
        assert_eq!(
            duration_to_millis(std::time::Duration::from_millis(1500)),
            1500
        );
        assert_eq!(duration_to_millis(std::time::Duration::MAX), u64::MAX);
        assert!((u64_to_f64(1500) - 1500.0).abs() < f64::EPSILON);
        assert!((u64_to_f64(u64::MAX) - f64::from(u32::MAX)).abs() < f64::EPSILON);
    }

    #[test]
    fn test_deleting_absent_object_is_not_an_error() {
        let (store, index, sweeper) = setup(GcConfig::default());
        seed(&store, &index, sweeper.table(), &["data/a"], 1);
        // The object vanished between collect and sweep.
        store.delete_one("root", "data/a").unwrap();
        let calls_before = store.delete_calls();

        let stats = sweeper.run().unwrap();
        assert!(store.delete_calls() > calls_before);
        assert_eq!(stats.objects_removed, 1);
        assert_eq!(stats.deletions_failed, 0);
        assert!(!index.get(sweeper.table(), "data/a").unwrap().active);
    }
}

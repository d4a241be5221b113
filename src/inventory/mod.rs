//! Collect stage: walk the object store listing into the inventory table.
//!
//! The collector owns the inventory table lifecycle (create, recreate,
//! namespace) and the batched listing walk. Re-collecting an overlapping
//! range is safe: rows are keyed by path with last-write-wins semantics, so
//! a second pass over the same objects just refreshes them.

use crate::config::GcConfig;
use crate::models::{CollectStats, InventoryRecord};
use crate::query::{self, TableName};
use crate::storage::traits::{ObjectStore, ReferenceIndex};
use crate::{Error, Result};
use chrono::Utc;
use std::sync::Arc;

/// Walks the bucket listing into the inventory table.
pub struct InventoryCollector {
    store: Arc<dyn ObjectStore>,
    index: Arc<dyn ReferenceIndex>,
    config: GcConfig,
    table: TableName,
}

impl InventoryCollector {
    /// Creates a collector over the given backends.
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

    /// Returns the inventory table this collector writes to.
    #[must_use]
    pub const fn table(&self) -> &TableName {
        &self.table
    }

    /// Creates the namespace (database) for a namespaced table name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the table is namespaced but the
    /// namespace-creation flag is off; query/connectivity errors otherwise.
    pub fn ensure_namespace(&self) -> Result<()> {
        let Some(namespace) = self.table.namespace() else {
            return Ok(());
        };
        if !self.config.create_namespace {
            return Err(Error::Configuration(format!(
                "namespace '{namespace}' requires --create-namespace"
            )));
        }
        self.index.execute(&query::create_namespace(namespace))
    }

    /// Creates the inventory table if it does not exist, dropping it first
    /// when a fresh generation was requested.
    ///
    /// The shard count is baked into the partition expression at creation
    /// time; changing `samples` later requires `--recreate-table`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Query`] or [`Error::Connectivity`] from the DDL.
    pub fn ensure_table(&self) -> Result<()> {
        self.ensure_namespace()?;
        if self.config.recreate_table {
            tracing::info!(table = %self.table, "dropping inventory table for a fresh generation");
            self.index.execute(&query::drop_table(&self.table))?;
        }
        self.index
            .execute(&query::create_table(&self.table, self.config.samples))
    }

    /// Walks the listing and bulk-inserts inventory records.
    ///
    /// Objects younger than the age gate are skipped. The walk stops at
    /// listing exhaustion or once `total` objects were inserted; in the
    /// latter case the last seen path is reported as the resume cursor for
    /// a follow-up invocation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connectivity`] if the listing cannot be started or
    /// fails mid-walk, [`Error::Query`] if an insert fails. Inserts are
    /// all-or-nothing per batch; a failed insert is fatal to the pass.
    #[tracing::instrument(skip(self), fields(table = %self.table))]
    pub fn collect(&self) -> Result<CollectStats> {
        let mut stats = CollectStats::default();
        let gate = self.config.age_gate();
        let now = Utc::now();
        let batch_size = self.config.collect_batch_size;

        let listing = self.store.list(
            &self.config.s3.bucket,
            &self.config.s3.prefix,
            self.config.collect_after.as_deref(),
        )?;

        let mut batch: Vec<InventoryRecord> = Vec::with_capacity(batch_size);
        let mut last_seen: Option<String> = None;
        let mut capped = false;

        for item in listing {
            let obj = item?;
            last_seen = Some(obj.path.clone());

            if let Some(hours) = gate {
                if obj.age_hours(now) < hours {
                    tracing::trace!(path = %obj.path, "skipping too-recent object");
                    stats.objects_skipped += 1;
                    continue;
                }
            }

            batch.push(InventoryRecord::from_object(&obj));
            if batch.len() >= batch_size {
                self.flush(&mut batch, &mut stats)?;
            }
            if let Some(total) = self.config.total {
                if stats.objects_collected + batch.len() as u64 >= total {
                    capped = true;
                    break;
                }
            }
        }
        if !batch.is_empty() {
            self.flush(&mut batch, &mut stats)?;
        }
        if capped {
            stats.resume_cursor = last_seen;
        }

        tracing::info!(
            collected = stats.objects_collected,
            skipped = stats.objects_skipped,
            batches = stats.batches_written,
            "collect pass finished"
        );
        Ok(stats)
    }

    fn flush(&self, batch: &mut Vec<InventoryRecord>, stats: &mut CollectStats) -> Result<()> {
        self.index.insert_records(&self.table, batch)?;
        stats.objects_collected += batch.len() as u64;
        stats.batches_written += 1;
        metrics::counter!("gc_objects_collected_total").increment(batch.len() as u64);
        tracing::debug!(rows = batch.len(), "inventory batch written");
        batch.clear();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::models::ObjectInfo;
    use crate::storage::memory::{MemoryIndex, MemoryObjectStore};
    use chrono::Duration;

    fn setup(config: GcConfig) -> (Arc<MemoryObjectStore>, Arc<MemoryIndex>, InventoryCollector) {
        let store = Arc::new(MemoryObjectStore::new());
        let index = Arc::new(MemoryIndex::new());
        let collector = InventoryCollector::new(store.clone(), index.clone(), config).unwrap();
        (store, index, collector)
    }

    fn obj(path: &str, size: u64, age_hours: i64) -> ObjectInfo {
        ObjectInfo {
            path: path.to_string(),
            size,
            last_modified: Utc::now() - Duration::hours(age_hours),
        }
    }

    #[test]
    fn test_collect_inserts_all_objects() {
        let (store, index, collector) = setup(GcConfig::default());
        for i in 0..5 {
            store.put(obj(&format!("data/obj{i}"), 10, 5));
        }
        collector.ensure_table().unwrap();
        let stats = collector.collect().unwrap();

        assert_eq!(stats.objects_collected, 5);
        assert_eq!(stats.objects_skipped, 0);
        assert_eq!(stats.resume_cursor, None);
        let rows = index.rows(collector.table());
        assert_eq!(rows.len(), 5);
        assert!(rows.iter().all(|r| r.active));
    }

    #[test]
    fn test_collect_respects_age_gate() {
        let config = GcConfig {
            age_hours: 10,
            ..Default::default()
        };
        let (store, index, collector) = setup(config);
        store.put(obj("data/old", 10, 20));
        store.put(obj("data/young", 10, 1));
        collector.ensure_table().unwrap();

        let stats = collector.collect().unwrap();
        assert_eq!(stats.objects_collected, 1);
        assert_eq!(stats.objects_skipped, 1);
        assert!(index.get(collector.table(), "data/old").is_some());
        assert!(index.get(collector.table(), "data/young").is_none());
    }

    #[test]
    fn test_collect_batching() {
        let config = GcConfig {
            collect_batch_size: 2,
            ..Default::default()
        };
        let (store, _index, collector) = setup(config);
        for i in 0..5 {
            store.put(obj(&format!("data/obj{i}"), 10, 5));
        }
        collector.ensure_table().unwrap();

        let stats = collector.collect().unwrap();
        assert_eq!(stats.objects_collected, 5);
        // Two full batches plus the final partial one.
        assert_eq!(stats.batches_written, 3);
    }

    #[test]
    fn test_collect_total_cap_reports_resume_cursor() {
        let config = GcConfig {
            total: Some(3),
            ..Default::default()
        };
        let (store, index, collector) = setup(config);
        for i in 0..5 {
            store.put(obj(&format!("data/obj{i}"), 10, 5));
        }
        collector.ensure_table().unwrap();

        let stats = collector.collect().unwrap();
        assert_eq!(stats.objects_collected, 3);
        assert_eq!(stats.resume_cursor, Some("data/obj2".to_string()));
        assert_eq!(index.rows(collector.table()).len(), 3);
    }

    #[test]
    fn test_collect_resumes_after_cursor() {
        let config = GcConfig {
            collect_after: Some("data/obj2".to_string()),
            ..Default::default()
        };
        let (store, index, collector) = setup(config);
        for i in 0..5 {
            store.put(obj(&format!("data/obj{i}"), 10, 5));
        }
        collector.ensure_table().unwrap();

        let stats = collector.collect().unwrap();
        assert_eq!(stats.objects_collected, 2);
        assert!(index.get(collector.table(), "data/obj2").is_none());
        assert!(index.get(collector.table(), "data/obj3").is_some());
    }

    #[test]
    fn test_recollect_overlap_is_idempotent() {
        let (store, index, collector) = setup(GcConfig::default());
        store.put(obj("data/a", 10, 5));
        collector.ensure_table().unwrap();
        collector.collect().unwrap();
        collector.collect().unwrap();
        assert_eq!(index.rows(collector.table()).len(), 1);
    }

    #[test]
    fn test_insert_failure_is_fatal() {
        // Table never created: the first flush fails and aborts the pass.
        let (store, _index, collector) = setup(GcConfig::default());
        store.put(obj("data/a", 10, 5));
        assert!(matches!(collector.collect(), Err(Error::Query { .. })));
    }

    #[test]
    fn test_recreate_drops_prior_generation() {
        let (store, index, collector) = setup(GcConfig::default());
        store.put(obj("data/a", 10, 5));
        collector.ensure_table().unwrap();
        collector.collect().unwrap();
        assert_eq!(index.rows(collector.table()).len(), 1);

        let config = GcConfig {
            recreate_table: true,
            ..Default::default()
        };
        let fresh = InventoryCollector::new(store, index.clone(), config).unwrap();
        fresh.ensure_table().unwrap();
        assert!(index.rows(fresh.table()).is_empty());
    }

    #[test]
    fn test_namespaced_table_creates_namespace() {
        let config = GcConfig {
            table_prefix: "gc.s3objects_for_".to_string(),
            create_namespace: true,
            ..Default::default()
        };
        let (_store, index, collector) = setup(config);
        collector.ensure_table().unwrap();
        assert!(index.has_namespace("gc"));
        assert!(index.table_exists(collector.table()).unwrap());
    }

    #[test]
    fn test_namespace_without_flag_is_rejected() {
        let config = GcConfig {
            table_prefix: "gc.s3objects_for_".to_string(),
            create_namespace: false,
            ..Default::default()
        };
        let (_store, _index, collector) = setup(config);
        assert!(matches!(
            collector.ensure_table(),
            Err(Error::Configuration(_))
        ));
    }
}

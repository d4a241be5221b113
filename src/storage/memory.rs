//! In-memory backends for both capabilities.
//!
//! Used by the integration suite and for hermetic rehearsal of a sweep
//! without touching real services. `MemoryObjectStore` supports per-path
//! failure injection so the retry-safety invariant can be exercised;
//! `MemoryIndex` interprets the DDL templates from [`crate::query`] and
//! evaluates the anti-join directly over its row maps.

use crate::models::{InventoryRecord, ObjectInfo};
use crate::query::{CandidateQuery, TableName};
use crate::storage::traits::{
    CandidateBlocks, DeleteFailure, Listing, ObjectStore, OrphanTotals, ReferenceIndex,
};
use crate::{Error, Result, partition};
use chrono::{Duration, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// In-memory object store with failure injection.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, ObjectInfo>>,
    fail_deletes: Mutex<HashSet<String>>,
    delete_calls: AtomicU64,
    bulk_delete: AtomicBool,
}

impl MemoryObjectStore {
    /// Creates an empty store with bulk delete enabled.
    #[must_use]
    pub fn new() -> Self {
        let store = Self::default();
        store.bulk_delete.store(true, Ordering::Relaxed);
        store
    }

    /// Adds an object to the store.
    pub fn put(&self, obj: ObjectInfo) {
        if let Ok(mut objects) = self.objects.lock() {
            objects.insert(obj.path.clone(), obj);
        }
    }

    /// Marks a path so every deletion attempt against it fails.
    pub fn fail_deletes_for(&self, path: &str) {
        if let Ok(mut fail) = self.fail_deletes.lock() {
            fail.insert(path.to_string());
        }
    }

    /// Disables bulk deletion, forcing the sequential strategy.
    pub fn disable_bulk_delete(&self) {
        self.bulk_delete.store(false, Ordering::Relaxed);
    }

    /// Returns whether the store still holds `path`.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.objects
            .lock()
            .map(|objects| objects.contains_key(path))
            .unwrap_or(false)
    }

    /// Returns the number of objects currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.lock().map(|objects| objects.len()).unwrap_or(0)
    }

    /// Returns `true` if the store holds no objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of delete API calls made (bulk and single both count one).
    #[must_use]
    pub fn delete_calls(&self) -> u64 {
        self.delete_calls.load(Ordering::Relaxed)
    }
}

impl ObjectStore for MemoryObjectStore {
    fn list(&self, _bucket: &str, prefix: &str, start_after: Option<&str>) -> Result<Listing<'_>> {
        let objects = self
            .objects
            .lock()
            .map_err(|_| Error::Connectivity {
                service: "s3",
                cause: "store lock poisoned".to_string(),
            })?;
        let snapshot: Vec<ObjectInfo> = objects
            .values()
            .filter(|obj| obj.path.starts_with(prefix))
            .filter(|obj| start_after.is_none_or(|after| obj.path.as_str() > after))
            .cloned()
            .collect();
        Ok(Box::new(snapshot.into_iter().map(Ok)))
    }

    fn delete_many(&self, _bucket: &str, paths: &[String]) -> Result<Vec<DeleteFailure>> {
        self.delete_calls.fetch_add(1, Ordering::Relaxed);
        let mut failures = Vec::new();
        let fail = self.fail_deletes.lock().map_err(|_| Error::Connectivity {
            service: "s3",
            cause: "store lock poisoned".to_string(),
        })?;
        let mut objects = self.objects.lock().map_err(|_| Error::Connectivity {
            service: "s3",
            cause: "store lock poisoned".to_string(),
        })?;
        for path in paths {
            if fail.contains(path) {
                failures.push(DeleteFailure {
                    path: path.clone(),
                    cause: "injected failure".to_string(),
                });
            } else {
                // Removing an absent object is a no-op, not a failure.
                objects.remove(path);
            }
        }
        Ok(failures)
    }

    fn delete_one(&self, _bucket: &str, path: &str) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::Relaxed);
        let failing = self
            .fail_deletes
            .lock()
            .map(|fail| fail.contains(path))
            .unwrap_or(false);
        if failing {
            return Err(Error::Deletion {
                path: path.to_string(),
                cause: "injected failure".to_string(),
            });
        }
        if let Ok(mut objects) = self.objects.lock() {
            objects.remove(path);
        }
        Ok(())
    }

    fn supports_bulk_delete(&self) -> bool {
        self.bulk_delete.load(Ordering::Relaxed)
    }
}

/// In-memory reference index hosting inventory tables and reference entries.
#[derive(Default)]
pub struct MemoryIndex {
    tables: Mutex<HashMap<String, BTreeMap<String, InventoryRecord>>>,
    namespaces: Mutex<HashSet<String>>,
    references: Mutex<HashSet<(String, String)>>,
    fail_probes: AtomicBool,
}

impl MemoryIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a reference entry: `path` is in use on `disk`.
    pub fn add_reference(&self, path: &str, disk: &str) {
        if let Ok(mut references) = self.references.lock() {
            references.insert((path.to_string(), disk.to_string()));
        }
    }

    /// Makes existence probes and aggregates fail, to exercise the
    /// "probe failure means nothing to do" path.
    pub fn fail_probes(&self) {
        self.fail_probes.store(true, Ordering::Relaxed);
    }

    /// Returns the rows of a table, ordered by path.
    #[must_use]
    pub fn rows(&self, table: &TableName) -> Vec<InventoryRecord> {
        self.tables
            .lock()
            .ok()
            .and_then(|tables| tables.get(&table.qualified()).cloned())
            .map(|rows| rows.into_values().collect())
            .unwrap_or_default()
    }

    /// Returns the record for `path`, if any.
    #[must_use]
    pub fn get(&self, table: &TableName, path: &str) -> Option<InventoryRecord> {
        self.tables
            .lock()
            .ok()
            .and_then(|tables| tables.get(&table.qualified()).and_then(|rows| rows.get(path).cloned()))
    }

    /// Returns whether a namespace was created.
    #[must_use]
    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.namespaces
            .lock()
            .map(|namespaces| namespaces.contains(namespace))
            .unwrap_or(false)
    }

    fn lock_tables(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, BTreeMap<String, InventoryRecord>>>> {
        self.tables.lock().map_err(|_| Error::Connectivity {
            service: "clickhouse",
            cause: "index lock poisoned".to_string(),
        })
    }

    fn is_referenced(&self, path: &str, disk: &str) -> bool {
        self.references
            .lock()
            .map(|references| references.contains(&(path.to_string(), disk.to_string())))
            .unwrap_or(false)
    }

    /// Evaluates the candidate query over a table snapshot, without the
    /// shard and cursor filters (the totals aggregate uses neither).
    fn candidates_unsharded(&self, query: &CandidateQuery<'_>) -> Result<Vec<InventoryRecord>> {
        let cutoff = query
            .age_hours
            .map(|hours| Utc::now() - Duration::hours(i64::try_from(hours).unwrap_or(i64::MAX)));
        let tables = self.lock_tables()?;
        let rows = tables
            .get(&query.table.qualified())
            .ok_or_else(|| Error::query(&query.table.qualified(), "table does not exist"))?;
        Ok(rows
            .values()
            .filter(|row| row.active)
            .filter(|row| cutoff.is_none_or(|cutoff| row.last_modified < cutoff))
            .filter(|row| !self.is_referenced(&row.path, query.disk))
            .cloned()
            .collect())
    }
}

impl ReferenceIndex for MemoryIndex {
    fn execute(&self, sql: &str) -> Result<()> {
        // The fake only understands the exact DDL templates from `query`.
        if let Some(rest) = sql.strip_prefix("CREATE TABLE IF NOT EXISTS ") {
            let name = rest.split_whitespace().next().unwrap_or_default();
            self.lock_tables()?.entry(name.to_string()).or_default();
            Ok(())
        } else if let Some(name) = sql.strip_prefix("DROP TABLE IF EXISTS ") {
            self.lock_tables()?.remove(name.trim());
            Ok(())
        } else if let Some(name) = sql.strip_prefix("TRUNCATE TABLE ") {
            if let Some(rows) = self.lock_tables()?.get_mut(name.trim()) {
                rows.clear();
            }
            Ok(())
        } else if let Some(name) = sql.strip_prefix("CREATE DATABASE IF NOT EXISTS ") {
            if let Ok(mut namespaces) = self.namespaces.lock() {
                namespaces.insert(name.trim().to_string());
            }
            Ok(())
        } else {
            Err(Error::query(sql, "statement not supported by MemoryIndex"))
        }
    }

    fn insert_records(&self, table: &TableName, records: &[InventoryRecord]) -> Result<()> {
        let mut tables = self.lock_tables()?;
        let rows = tables
            .get_mut(&table.qualified())
            .ok_or_else(|| Error::query(&table.qualified(), "table does not exist"))?;
        for record in records {
            // Last write wins by path, as with ReplacingMergeTree.
            rows.insert(record.path.clone(), record.clone());
        }
        Ok(())
    }

    fn table_exists(&self, table: &TableName) -> Result<bool> {
        if self.fail_probes.load(Ordering::Relaxed) {
            return Err(Error::query("EXISTS TABLE", "injected probe failure"));
        }
        Ok(self.lock_tables()?.contains_key(&table.qualified()))
    }

    fn orphan_totals(&self, query: &CandidateQuery<'_>) -> Result<OrphanTotals> {
        if self.fail_probes.load(Ordering::Relaxed) {
            return Err(Error::query("orphan totals", "injected probe failure"));
        }
        let candidates = self.candidates_unsharded(query)?;
        Ok(OrphanTotals {
            objects: candidates.len() as u64,
            bytes: candidates.iter().map(|row| row.size).sum(),
        })
    }

    fn stream_candidates(
        &self,
        query: &CandidateQuery<'_>,
        shard: u32,
        block_rows: usize,
    ) -> Result<CandidateBlocks<'_>> {
        let mut candidates: Vec<InventoryRecord> = self
            .candidates_unsharded(query)?
            .into_iter()
            .filter(|row| query.after.is_none_or(|after| row.path.as_str() > after))
            .filter(|row| partition::shard(&row.path, query.samples) == shard)
            .collect();
        if let Some(limit) = query.limit {
            candidates.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        }
        let blocks: Vec<Vec<InventoryRecord>> = candidates
            .chunks(block_rows.max(1))
            .map(<[InventoryRecord]>::to_vec)
            .collect();
        Ok(Box::new(blocks.into_iter().map(Ok)))
    }
}

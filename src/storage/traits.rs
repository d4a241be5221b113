//! Object store and reference index capability traits.

use crate::Result;
use crate::models::{InventoryRecord, ObjectInfo};
use crate::query::{CandidateQuery, TableName};

/// A lazy, restartable sequence of listed objects.
///
/// Pagination against the backing service happens inside the iterator; a
/// transport failure mid-listing surfaces as an `Err` item and ends the
/// sequence. Restart by calling [`ObjectStore::list`] again with the last
/// successfully processed path as `start_after`.
pub type Listing<'a> = Box<dyn Iterator<Item = Result<ObjectInfo>> + 'a>;

/// A stream of orphan-candidate row blocks (bounded memory per block).
pub type CandidateBlocks<'a> = Box<dyn Iterator<Item = Result<Vec<InventoryRecord>>> + 'a>;

/// One object that a bulk delete failed to remove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteFailure {
    /// Path of the object.
    pub path: String,
    /// Backend-reported cause.
    pub cause: String,
}

/// Global orphan aggregate shown by the confirmation gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrphanTotals {
    /// Number of orphan candidates.
    pub objects: u64,
    /// Their total size in bytes.
    pub bytes: u64,
}

/// Capability interface over the bucket-oriented object store.
pub trait ObjectStore: Send + Sync {
    /// Lists objects under `prefix`, lexicographically after `start_after`
    /// when given, recursively.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Connectivity`] if the first page cannot be
    /// fetched; later page failures surface as `Err` items in the listing.
    fn list(&self, bucket: &str, prefix: &str, start_after: Option<&str>) -> Result<Listing<'_>>;

    /// Deletes a batch of objects, collecting per-object failures without
    /// aborting the batch. Deleting an already-absent object is not a
    /// failure.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Connectivity`] only when the call itself
    /// cannot be made; individual object failures are returned in the list.
    fn delete_many(&self, bucket: &str, paths: &[String]) -> Result<Vec<DeleteFailure>>;

    /// Deletes a single object. Deleting an already-absent object succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Deletion`] if the object could not be
    /// removed, [`crate::Error::Connectivity`] if the store is unreachable.
    fn delete_one(&self, bucket: &str, path: &str) -> Result<()>;

    /// Whether the backend supports bulk multi-object deletion. Backends
    /// without it get the sequential single-object strategy.
    fn supports_bulk_delete(&self) -> bool {
        true
    }
}

/// Capability interface over the queryable reference index, which also
/// hosts the auxiliary inventory table.
pub trait ReferenceIndex: Send + Sync {
    /// Executes a DDL or administrative statement (create/drop/truncate).
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Connectivity`] or [`crate::Error::Query`].
    fn execute(&self, sql: &str) -> Result<()>;

    /// Bulk-inserts inventory records. Failure is fatal to the run; there
    /// is no partial silent success.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Connectivity`] or [`crate::Error::Query`].
    fn insert_records(&self, table: &TableName, records: &[InventoryRecord]) -> Result<()>;

    /// Best-effort existence probe for the inventory table.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Connectivity`] or [`crate::Error::Query`];
    /// callers treat a probe failure as "nothing to do", not fatal.
    fn table_exists(&self, table: &TableName) -> Result<bool>;

    /// Runs the global orphan count/size aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Connectivity`] or [`crate::Error::Query`].
    fn orphan_totals(&self, query: &CandidateQuery<'_>) -> Result<OrphanTotals>;

    /// Streams orphan candidates for one shard in blocks of at most
    /// `block_rows` records.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Connectivity`] or [`crate::Error::Query`] if
    /// the query cannot be started; mid-stream failures surface as `Err`
    /// items.
    fn stream_candidates(
        &self,
        query: &CandidateQuery<'_>,
        shard: u32,
        block_rows: usize,
    ) -> Result<CandidateBlocks<'_>>;
}

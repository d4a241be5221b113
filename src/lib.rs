//! # s3gc
//!
//! Mark-and-sweep garbage collector for ClickHouse S3 disks.
//!
//! ClickHouse keeps the set of object-storage paths it still references in
//! `system.remote_data_paths`. Objects in the bucket that no row references
//! are orphans (left behind by drops, merges, failed inserts) and can be
//! removed. s3gc reconciles the two in two stages:
//!
//! 1. **Collect** — walk the bucket listing and snapshot every object into an
//!    auxiliary ClickHouse table (one row per path, `active = true`).
//! 2. **Sweep** — per shard, anti-join the snapshot against
//!    `system.remote_data_paths`, delete the unreferenced objects, and flip
//!    their snapshot rows to `active = false`.
//!
//! The stages can run together or be split across invocations; both carry a
//! resume cursor so a run can be stopped and continued against a live,
//! growing bucket.
//!
//! ## Example
//!
//! ```rust,ignore
//! use s3gc::config::GcConfig;
//! use s3gc::session::GcSession;
//!
//! let config = GcConfig::default();
//! let outcome = GcSession::new(config).run()?;
//! println!("{}", outcome.summary());
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

// Module declarations
pub mod config;
pub mod confirm;
pub mod inventory;
pub mod models;
pub mod observability;
pub mod partition;
pub mod query;
pub mod session;
pub mod storage;
pub mod sweep;

// Re-exports for convenience
pub use config::GcConfig;
pub use models::{
    CollectStats, InventoryRecord, ObjectInfo, SessionOutcome, SessionState, SweepStats,
};
pub use session::GcSession;
pub use storage::{ObjectStore, ReferenceIndex};

/// Error type for s3gc operations.
///
/// Uses `thiserror` for automatic `Display` and `Error` trait implementations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `Connectivity` | Object store or reference index is unreachable, or a call times out |
/// | `Configuration` | Invalid identifiers, inconsistent shard count, bad flag combinations |
/// | `Query` | The reconciliation query or an inventory insert fails server-side |
/// | `Deletion` | A single object fails to delete (non-fatal, accumulated) |
#[derive(Debug, ThisError)]
pub enum Error {
    /// A service could not be reached.
    ///
    /// Fatal: the session aborts immediately. No partial state corruption is
    /// assumed beyond what was already durably written.
    #[error("cannot reach {service}: {cause}")]
    Connectivity {
        /// The service that was unreachable ("clickhouse" or "s3").
        service: &'static str,
        /// The underlying cause.
        cause: String,
    },

    /// The configuration is invalid.
    ///
    /// Raised at validation time, before any I/O:
    /// - Table prefix, disk name, or cluster name fails identifier validation
    /// - `samples` or a batch size is zero
    /// - A namespaced table name is used without the namespace-creation flag
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A query against the reference index failed.
    ///
    /// Fatal for the main reconciliation query and inventory inserts.
    /// Best-effort probes (row counts, existence checks) absorb their
    /// failures as "nothing to do" instead of raising this.
    #[error("query failed: {cause} (query: {query})")]
    Query {
        /// The query that failed, truncated for display.
        query: String,
        /// The underlying cause.
        cause: String,
    },

    /// A single object failed to delete.
    ///
    /// Non-fatal: the object's inventory row stays `active = true` so the
    /// next sweep retries it, and the shard loop continues.
    #[error("failed to delete object '{path}': {cause}")]
    Deletion {
        /// Path of the object that could not be deleted.
        path: String,
        /// The underlying cause.
        cause: String,
    },
}

/// Result type alias for s3gc operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Truncates a query for inclusion in an error message.
    ///
    /// Queries embed operator-supplied object paths, so truncation must land
    /// on a character boundary, not a raw byte offset.
    #[must_use]
    pub fn query(query: &str, cause: impl Into<String>) -> Self {
        const MAX_QUERY_DISPLAY: usize = 200;
        let query = if query.len() > MAX_QUERY_DISPLAY {
            let mut end = MAX_QUERY_DISPLAY;
            while !query.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &query[..end])
        } else {
            query.to_string()
        };
        Self::Query {
            query,
            cause: cause.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Connectivity {
            service: "clickhouse",
            cause: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "cannot reach clickhouse: connection refused"
        );

        let err = Error::Configuration("samples must be non-zero".to_string());
        assert_eq!(
            err.to_string(),
            "invalid configuration: samples must be non-zero"
        );

        let err = Error::Deletion {
            path: "data/abc".to_string(),
            cause: "access denied".to_string(),
        };
        assert!(err.to_string().contains("data/abc"));
        assert!(err.to_string().contains("access denied"));
    }

    #[test]
    fn test_query_error_truncation() {
        let long_query = "SELECT ".repeat(100);
        let err = Error::query(&long_query, "syntax error");
        let Error::Query { query, .. } = err else {
            unreachable!("Error::query constructs Error::Query");
        };
        assert!(query.len() <= 204);
        assert!(query.ends_with("..."));
    }

    #[test]
    fn test_query_error_truncation_multibyte_paths() {
        // Object paths are operator-supplied and may be non-ASCII; cutting
        // mid-character would panic instead of reporting the query failure.
        let long_query = "€".repeat(100);
        let err = Error::query(&long_query, "syntax error");
        let Error::Query { query, .. } = err else {
            unreachable!("Error::query constructs Error::Query");
        };
        assert!(query.ends_with("..."));
        assert!(query.trim_end_matches("...").chars().all(|c| c == '€'));
    }
}

//! Parameterized query templates for the reconciliation engine.
//!
//! Every piece of SQL the engine sends to ClickHouse is built here, from
//! identifiers that have passed validation, so the reconciliation logic can
//! be reviewed and tested independently of the query backend. The ClickHouse
//! HTTP interface has no server-side parameter binding for DDL or table
//! names, so the defense is strict identifier validation plus literal
//! escaping for the few value positions.

use crate::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

/// Pattern for a single SQL identifier (table, database, disk, cluster).
static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)] // pattern is a compile-time constant
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap()
});

/// The authoritative reference table of paths still in use.
pub const REMOTE_DATA_PATHS: &str = "system.remote_data_paths";

/// Validates a single SQL identifier.
///
/// # Errors
///
/// Returns [`Error::Configuration`] if `name` is empty or contains anything
/// outside `[A-Za-z0-9_]` (or starts with a digit).
pub fn validate_identifier(what: &str, name: &str) -> Result<()> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "{what} '{name}' is not a valid identifier"
        )))
    }
}

/// Escapes a string for use inside a single-quoted SQL literal.
#[must_use]
pub fn escape_string_literal(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\'' | '\\' => {
                result.push('\\');
                result.push(c);
            },
            _ => result.push(c),
        }
    }
    result
}

/// A validated, optionally namespaced inventory table name.
///
/// Built from the configured prefix and the disk name, e.g. prefix
/// `s3objects_for_` + disk `s3` → `s3objects_for_s3`. A prefix of the form
/// `db.prefix_` yields a namespaced name `db.prefix_s3`; creating the
/// namespace is an explicit, opt-in step (see
/// [`crate::inventory::InventoryCollector::ensure_namespace`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    namespace: Option<String>,
    name: String,
}

impl TableName {
    /// Builds and validates a table name from a prefix and disk name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the prefix has more than one
    /// namespace separator or any part fails identifier validation.
    pub fn new(prefix: &str, disk: &str) -> Result<Self> {
        validate_identifier("disk name", disk)?;
        let (namespace, local_prefix) = match prefix.split_once('.') {
            Some((ns, rest)) => {
                if rest.contains('.') {
                    return Err(Error::Configuration(format!(
                        "table prefix '{prefix}' has more than one namespace separator"
                    )));
                }
                validate_identifier("table namespace", ns)?;
                (Some(ns.to_string()), rest)
            },
            None => (None, prefix),
        };
        let name = format!("{local_prefix}{disk}");
        validate_identifier("table name", &name)?;
        Ok(Self { namespace, name })
    }

    /// Returns the namespace (database) part, if any.
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Returns the fully qualified name for use in SQL.
    #[must_use]
    pub fn qualified(&self) -> String {
        self.namespace.as_ref().map_or_else(
            || self.name.clone(),
            |ns| format!("{ns}.{}", self.name),
        )
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.qualified())
    }
}

/// DDL: creates the inventory table if it does not exist.
///
/// `ReplacingMergeTree ORDER BY path` gives last-write-wins semantics per
/// path; the partition expression must use the same shard count as every
/// later shard-scoped query.
#[must_use]
pub fn create_table(table: &TableName, samples: u32) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} \
         (path String, size UInt64, last_modified DateTime('UTC'), active Bool) \
         ENGINE = ReplacingMergeTree ORDER BY path \
         PARTITION BY CRC32(path) % {samples}"
    )
}

/// DDL: drops the inventory table if it exists.
#[must_use]
pub fn drop_table(table: &TableName) -> String {
    format!("DROP TABLE IF EXISTS {table}")
}

/// DDL: creates the containing database for a namespaced table name.
#[must_use]
pub fn create_namespace(namespace: &str) -> String {
    format!("CREATE DATABASE IF NOT EXISTS {namespace}")
}

/// Discards the inventory table contents (end-of-session cleanup).
#[must_use]
pub fn truncate_table(table: &TableName) -> String {
    format!("TRUNCATE TABLE {table}")
}

/// Best-effort existence probe for the inventory table (returns 0 or 1).
#[must_use]
pub fn exists_probe(table: &TableName) -> String {
    format!("EXISTS TABLE {table}")
}

/// Returns the reference-side relation, expanded across a cluster's
/// replicas when a cluster name is given.
fn reference_relation(cluster: Option<&str>) -> String {
    cluster.map_or_else(
        || REMOTE_DATA_PATHS.to_string(),
        |c| format!("clusterAllReplicas({c}, {REMOTE_DATA_PATHS})"),
    )
}

/// Parameters for the orphan-candidate anti-join.
#[derive(Debug, Clone)]
pub struct CandidateQuery<'a> {
    /// Inventory table to read from.
    pub table: &'a TableName,
    /// Disk name the reference entries are scoped to.
    pub disk: &'a str,
    /// Cluster to expand the reference side across, if any.
    pub cluster: Option<&'a str>,
    /// Shard count the table was collected with.
    pub samples: u32,
    /// Only rows whose path is lexicographically greater than this cursor.
    pub after: Option<&'a str>,
    /// Only rows older than this many hours.
    pub age_hours: Option<u64>,
    /// Maximum number of rows.
    pub limit: Option<u64>,
}

impl CandidateQuery<'_> {
    /// Renders the anti-join select for one shard.
    ///
    /// Selects active inventory rows in the shard that have no matching
    /// reference entry (same path, same disk), ordered by path so the
    /// after-cursor gives deterministic resumability. `SETTINGS final = 1`
    /// forces ReplacingMergeTree deduplication so only the latest row per
    /// path is visible.
    #[must_use]
    pub fn sql_for_shard(&self, shard: u32) -> String {
        let mut sql = format!(
            "SELECT inv.path, inv.size, toUnixTimestamp(inv.last_modified) AS last_modified, \
             inv.active FROM {table} AS inv \
             LEFT ANTI JOIN {reference} AS rdp \
             ON rdp.remote_path = inv.path AND rdp.disk_name = '{disk}' \
             WHERE CRC32(inv.path) % {samples} = {shard} AND inv.active = true",
            table = self.table,
            reference = reference_relation(self.cluster),
            disk = escape_string_literal(self.disk),
            samples = self.samples,
        );
        if let Some(after) = self.after {
            sql.push_str(&format!(
                " AND inv.path > '{}'",
                escape_string_literal(after)
            ));
        }
        if let Some(age) = self.age_hours {
            sql.push_str(&format!(
                " AND inv.last_modified < now() - INTERVAL {age} HOUR"
            ));
        }
        sql.push_str(" ORDER BY inv.path");
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        sql.push_str(" SETTINGS final = 1");
        sql
    }

    /// Renders the global orphan count/size aggregate (no shard filter).
    ///
    /// Used by the confirmation gate to preview what a full sweep would
    /// remove.
    #[must_use]
    pub fn sql_totals(&self) -> String {
        let mut sql = format!(
            "SELECT count() AS orphans, sum(inv.size) AS bytes FROM {table} AS inv \
             LEFT ANTI JOIN {reference} AS rdp \
             ON rdp.remote_path = inv.path AND rdp.disk_name = '{disk}' \
             WHERE inv.active = true",
            table = self.table,
            reference = reference_relation(self.cluster),
            disk = escape_string_literal(self.disk),
        );
        if let Some(age) = self.age_hours {
            sql.push_str(&format!(
                " AND inv.last_modified < now() - INTERVAL {age} HOUR"
            ));
        }
        sql.push_str(" SETTINGS final = 1");
        sql
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn table() -> TableName {
        TableName::new("s3objects_for_", "s3").unwrap()
    }

    #[test_case("s3objects_for_", "s3", "s3objects_for_s3"; "default prefix")]
    #[test_case("gc.s3objects_for_", "s3", "gc.s3objects_for_s3"; "namespaced")]
    #[test_case("inv_", "cold_storage", "inv_cold_storage"; "custom prefix")]
    fn test_table_name_ok(prefix: &str, disk: &str, expected: &str) {
        let name = TableName::new(prefix, disk).unwrap();
        assert_eq!(name.qualified(), expected);
    }

    #[test_case("a.b.c_", "s3"; "two separators")]
    #[test_case("pre fix_", "s3"; "space in prefix")]
    #[test_case("prefix_", "disk-name"; "dash in disk")]
    #[test_case("prefix_", ""; "empty disk")]
    #[test_case("prefix_", "s3'; DROP TABLE x"; "injection attempt")]
    fn test_table_name_rejected(prefix: &str, disk: &str) {
        assert!(matches!(
            TableName::new(prefix, disk),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_namespace_extraction() {
        let name = TableName::new("gc.s3objects_for_", "s3").unwrap();
        assert_eq!(name.namespace(), Some("gc"));
        assert_eq!(table().namespace(), None);
    }

    #[test]
    fn test_escape_string_literal() {
        assert_eq!(escape_string_literal("plain/path"), "plain/path");
        assert_eq!(escape_string_literal("o'brien"), "o\\'brien");
        assert_eq!(escape_string_literal("a\\b"), "a\\\\b");
    }

    #[test]
    fn test_create_table_pins_shard_count() {
        let sql = create_table(&table(), 4);
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS s3objects_for_s3"));
        assert!(sql.contains("ReplacingMergeTree"));
        assert!(sql.contains("PARTITION BY CRC32(path) % 4"));
    }

    #[test]
    fn test_candidate_sql_minimal() {
        let t = table();
        let q = CandidateQuery {
            table: &t,
            disk: "s3",
            cluster: None,
            samples: 4,
            after: None,
            age_hours: None,
            limit: None,
        };
        let sql = q.sql_for_shard(2);
        assert!(sql.contains("LEFT ANTI JOIN system.remote_data_paths"));
        assert!(sql.contains("rdp.disk_name = 's3'"));
        assert!(sql.contains("CRC32(inv.path) % 4 = 2"));
        assert!(sql.contains("inv.active = true"));
        assert!(sql.ends_with("SETTINGS final = 1"));
        assert!(!sql.contains("LIMIT"));
        assert!(!sql.contains("INTERVAL"));
    }

    #[test]
    fn test_candidate_sql_full() {
        let t = table();
        let q = CandidateQuery {
            table: &t,
            disk: "s3",
            cluster: Some("main"),
            samples: 8,
            after: Some("data/abc"),
            age_hours: Some(5),
            limit: Some(1000),
        };
        let sql = q.sql_for_shard(0);
        assert!(sql.contains("clusterAllReplicas(main, system.remote_data_paths)"));
        assert!(sql.contains("inv.path > 'data/abc'"));
        assert!(sql.contains("INTERVAL 5 HOUR"));
        assert!(sql.contains("ORDER BY inv.path LIMIT 1000"));
    }

    #[test]
    fn test_candidate_cursor_is_escaped() {
        let t = table();
        let q = CandidateQuery {
            table: &t,
            disk: "s3",
            cluster: None,
            samples: 1,
            after: Some("weird'path"),
            age_hours: None,
            limit: None,
        };
        assert!(q.sql_for_shard(0).contains("inv.path > 'weird\\'path'"));
    }

    #[test]
    fn test_totals_sql_has_no_shard_filter() {
        let t = table();
        let q = CandidateQuery {
            table: &t,
            disk: "s3",
            cluster: None,
            samples: 4,
            after: None,
            age_hours: Some(2),
            limit: None,
        };
        let sql = q.sql_totals();
        assert!(sql.contains("count() AS orphans"));
        assert!(sql.contains("sum(inv.size)"));
        assert!(!sql.contains("CRC32"));
        assert!(sql.contains("INTERVAL 2 HOUR"));
    }

    #[test]
    fn test_ddl_helpers() {
        let t = TableName::new("gc.s3objects_for_", "s3").unwrap();
        assert_eq!(drop_table(&t), "DROP TABLE IF EXISTS gc.s3objects_for_s3");
        assert_eq!(create_namespace("gc"), "CREATE DATABASE IF NOT EXISTS gc");
        assert_eq!(truncate_table(&t), "TRUNCATE TABLE gc.s3objects_for_s3");
        assert_eq!(exists_probe(&t), "EXISTS TABLE gc.s3objects_for_s3");
    }
}

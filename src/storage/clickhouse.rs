//! ClickHouse HTTP backend for the reference index capability.
//!
//! Talks to the ClickHouse HTTP interface: statements are POSTed as the
//! request body, inserts use `FORMAT JSONEachRow` with one serialized row
//! per line, and reads stream `FORMAT JSONEachRow` responses line by line so
//! a large candidate set never has to fit in memory at once.

use crate::models::InventoryRecord;
use crate::query::{CandidateQuery, TableName, exists_probe};
use crate::storage::traits::{CandidateBlocks, OrphanTotals, ReferenceIndex};
use crate::{Error, Result};
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Deserializer};
use std::io::{BufRead, BufReader, Lines, Write};
use std::time::Duration;

/// Reference index backend over the ClickHouse HTTP interface.
pub struct ClickHouseBackend {
    url: String,
    user: String,
    password: String,
    client: reqwest::blocking::Client,
}

impl ClickHouseBackend {
    /// Default HTTP port of the ClickHouse HTTP interface.
    pub const DEFAULT_PORT: u16 = 8123;

    /// Default per-call timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    /// Creates a backend for `host:port`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connectivity`] if the HTTP client cannot be built.
    pub fn new(host: &str, port: u16, secure: bool) -> Result<Self> {
        let scheme = if secure { "https" } else { "http" };
        let client = reqwest::blocking::Client::builder()
            .timeout(Self::DEFAULT_TIMEOUT)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Connectivity {
                service: "clickhouse",
                cause: e.to_string(),
            })?;
        Ok(Self {
            url: format!("{scheme}://{host}:{port}/"),
            user: "default".to_string(),
            password: String::new(),
            client,
        })
    }

    /// Sets the user name.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Sets the password.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// Maps a transport-level failure to the error taxonomy.
    fn send_error(e: &reqwest::Error) -> Error {
        let kind = if e.is_timeout() {
            "timeout"
        } else if e.is_connect() {
            "connect"
        } else {
            "request"
        };
        Error::Connectivity {
            service: "clickhouse",
            cause: format!("{kind} error: {e}"),
        }
    }

    /// Sends a statement body and returns the raw response on HTTP success.
    fn send(&self, body: String, sql_for_errors: &str) -> Result<reqwest::blocking::Response> {
        let response = self
            .client
            .post(&self.url)
            .header("X-ClickHouse-User", &self.user)
            .header("X-ClickHouse-Key", &self.password)
            .body(body)
            .send()
            .map_err(|e| {
                tracing::error!(error = %e, "ClickHouse request failed");
                Self::send_error(&e)
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            tracing::error!(status = %status, body = %body, "ClickHouse returned error status");
            return Err(Error::query(
                sql_for_errors,
                format!("status {status}: {body}"),
            ));
        }
        Ok(response)
    }

    /// Runs a query and returns the whole response body as text.
    fn query_text(&self, sql: &str) -> Result<String> {
        let response = self.send(sql.to_string(), sql)?;
        response.text().map_err(|e| Self::send_error(&e))
    }
}

/// Accepts a u64 encoded either as a JSON number or as a quoted string
/// (ClickHouse quotes 64-bit integers in JSON output by default).
fn u64_lenient<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// One candidate row as it arrives over JSONEachRow.
#[derive(Deserialize)]
struct CandidateRow {
    path: String,
    #[serde(deserialize_with = "u64_lenient")]
    size: u64,
    last_modified: i64,
    active: bool,
}

impl CandidateRow {
    fn into_record(self) -> InventoryRecord {
        InventoryRecord {
            path: self.path,
            size: self.size,
            last_modified: Utc
                .timestamp_opt(self.last_modified, 0)
                .single()
                .unwrap_or_default(),
            active: self.active,
        }
    }
}

#[derive(Deserialize)]
struct TotalsRow {
    #[serde(deserialize_with = "u64_lenient")]
    orphans: u64,
    #[serde(deserialize_with = "u64_lenient")]
    bytes: u64,
}

/// Streams JSONEachRow lines from an open response in fixed-size blocks.
struct CandidateStream {
    lines: Lines<BufReader<reqwest::blocking::Response>>,
    block_rows: usize,
    failed: bool,
}

impl Iterator for CandidateStream {
    type Item = Result<Vec<InventoryRecord>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let mut block = Vec::with_capacity(self.block_rows);
        while block.len() < self.block_rows {
            match self.lines.next() {
                Some(Ok(line)) if line.trim().is_empty() => {},
                Some(Ok(line)) => match serde_json::from_str::<CandidateRow>(&line) {
                    Ok(row) => block.push(row.into_record()),
                    Err(e) => {
                        self.failed = true;
                        return Some(Err(Error::query(
                            "candidate stream",
                            format!("malformed row: {e}"),
                        )));
                    },
                },
                Some(Err(e)) => {
                    self.failed = true;
                    return Some(Err(Error::Connectivity {
                        service: "clickhouse",
                        cause: format!("stream read failed: {e}"),
                    }));
                },
                None => break,
            }
        }
        if block.is_empty() { None } else { Some(Ok(block)) }
    }
}

impl ReferenceIndex for ClickHouseBackend {
    fn execute(&self, sql: &str) -> Result<()> {
        self.send(sql.to_string(), sql).map(|_| ())
    }

    fn insert_records(&self, table: &TableName, records: &[InventoryRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut body = Vec::with_capacity(records.len() * 128);
        let _ = writeln!(
            body,
            "INSERT INTO {table} (path, size, last_modified, active) FORMAT JSONEachRow"
        );
        for record in records {
            let line = serde_json::to_string(record).map_err(|e| {
                Error::query("INSERT ... FORMAT JSONEachRow", format!("serialize: {e}"))
            })?;
            let _ = writeln!(body, "{line}");
        }
        let body = String::from_utf8_lossy(&body).into_owned();
        self.send(body, "INSERT ... FORMAT JSONEachRow").map(|_| ())
    }

    fn table_exists(&self, table: &TableName) -> Result<bool> {
        let text = self.query_text(&exists_probe(table))?;
        Ok(text.trim() == "1")
    }

    fn orphan_totals(&self, query: &CandidateQuery<'_>) -> Result<OrphanTotals> {
        let sql = format!("{} FORMAT JSONEachRow", query.sql_totals());
        let text = self.query_text(&sql)?;
        let line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
        let row: TotalsRow = serde_json::from_str(line)
            .map_err(|e| Error::query(&sql, format!("malformed totals row: {e}")))?;
        Ok(OrphanTotals {
            objects: row.orphans,
            bytes: row.bytes,
        })
    }

    fn stream_candidates(
        &self,
        query: &CandidateQuery<'_>,
        shard: u32,
        block_rows: usize,
    ) -> Result<CandidateBlocks<'_>> {
        let sql = format!("{} FORMAT JSONEachRow", query.sql_for_shard(shard));
        let response = self.send(sql.clone(), &sql)?;
        Ok(Box::new(CandidateStream {
            lines: BufReader::new(response).lines(),
            block_rows: block_rows.max(1),
            failed: false,
        }))
    }
}

//! Core data types shared across the collect and sweep stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One object observed in the object store listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Object key within the bucket.
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time reported by the store.
    pub last_modified: DateTime<Utc>,
}

impl ObjectInfo {
    /// Returns the object's age relative to `now`, in whole hours.
    ///
    /// An object modified in the future (clock skew between services) has
    /// age zero rather than a negative value.
    #[must_use]
    pub fn age_hours(&self, now: DateTime<Utc>) -> u64 {
        let delta = now - self.last_modified;
        u64::try_from(delta.num_hours()).unwrap_or(0)
    }
}

/// One row of the inventory table: an observed object path at a point in
/// time, plus whether this tool still considers it live.
///
/// `active = true` means "known to exist in the object store and not yet
/// confirmed deleted"; `active = false` means "deleted by this tool" and is
/// retained as an audit trail. The table is a `ReplacingMergeTree` ordered
/// by path, so for a given path only the most recently written row is
/// observable (queries run with `FINAL`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    /// Object key, unique within the inventory table.
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time, serialized as Unix seconds for ClickHouse.
    #[serde(with = "chrono::serde::ts_seconds")]
    pub last_modified: DateTime<Utc>,
    /// Live flag, see type-level docs.
    pub active: bool,
}

impl InventoryRecord {
    /// Builds an active record from a listed object.
    #[must_use]
    pub fn from_object(obj: &ObjectInfo) -> Self {
        Self {
            path: obj.path.clone(),
            size: obj.size,
            last_modified: obj.last_modified,
            active: true,
        }
    }

    /// Returns a copy of this record with `active = false`, superseding the
    /// prior row by last-write-wins.
    #[must_use]
    pub fn deactivated(&self) -> Self {
        Self {
            active: false,
            ..self.clone()
        }
    }
}

/// Statistics from a collect pass.
#[derive(Debug, Clone, Default)]
pub struct CollectStats {
    /// Objects inserted into the inventory table.
    pub objects_collected: u64,
    /// Objects skipped by the age gate (younger than the threshold).
    pub objects_skipped: u64,
    /// Batches written.
    pub batches_written: u64,
    /// Path of the last inserted object, when the pass stopped at the
    /// requested total before exhausting the listing. A follow-up
    /// invocation resumes with `start_after = this cursor`.
    pub resume_cursor: Option<String>,
}

impl CollectStats {
    /// Returns a human-readable summary of the collect pass.
    #[must_use]
    pub fn summary(&self) -> String {
        match &self.resume_cursor {
            Some(cursor) => format!(
                "collected {} objects in {} batches (skipped {} too-recent), resume after '{cursor}'",
                self.objects_collected, self.batches_written, self.objects_skipped
            ),
            None => format!(
                "collected {} objects in {} batches (skipped {} too-recent), listing exhausted",
                self.objects_collected, self.batches_written, self.objects_skipped
            ),
        }
    }
}

/// Statistics from a sweep pass, accumulated across all shards.
#[derive(Debug, Clone, Default)]
pub struct SweepStats {
    /// Objects confirmed removed (or, in dry-run, that would be removed).
    pub objects_removed: u64,
    /// Total size of removed objects in bytes.
    pub bytes_removed: u64,
    /// Deletions attempted and failed; their rows stay active for retry.
    pub deletions_failed: u64,
    /// Shards processed.
    pub shards_processed: u32,
    /// Whether this was a dry run (nothing deleted, nothing written back).
    pub dry_run: bool,
}

impl SweepStats {
    /// Merges per-shard statistics into the running totals.
    pub fn absorb(&mut self, other: &Self) {
        self.objects_removed += other.objects_removed;
        self.bytes_removed += other.bytes_removed;
        self.deletions_failed += other.deletions_failed;
        self.shards_processed += other.shards_processed;
    }

    /// Returns a human-readable summary of the sweep.
    #[must_use]
    pub fn summary(&self) -> String {
        let action = if self.dry_run {
            "would remove"
        } else {
            "removed"
        };
        let mut s = format!(
            "{action} {} objects ({} bytes) across {} shards",
            self.objects_removed, self.bytes_removed, self.shards_processed
        );
        if self.deletions_failed > 0 {
            s.push_str(&format!(
                ", {} deletions failed (will be retried next sweep)",
                self.deletions_failed
            ));
        }
        s
    }
}

/// States of a garbage-collection session.
///
/// `Init → Collecting? → Confirming? → Sweeping? → Cleanup? → Done`, with
/// `Aborted` reached from `Confirming` on operator decline and `Failed`
/// reachable from any state on a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Session created, configuration validated, no I/O yet.
    Init,
    /// Walking the object store listing into the inventory table.
    Collecting,
    /// Waiting for interactive operator confirmation.
    Confirming,
    /// Reconciling and deleting, shard by shard.
    Sweeping,
    /// Truncating the inventory table.
    Cleanup,
    /// Finished successfully.
    Done,
    /// Operator declined the confirmation prompt; state unchanged.
    Aborted,
    /// A fatal error terminated the session.
    Failed,
}

impl SessionState {
    /// Returns the state name as a lowercase string for logging.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Collecting => "collecting",
            Self::Confirming => "confirming",
            Self::Sweeping => "sweeping",
            Self::Cleanup => "cleanup",
            Self::Done => "done",
            Self::Aborted => "aborted",
            Self::Failed => "failed",
        }
    }

    /// Returns `true` if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Aborted | Self::Failed)
    }
}

/// Final outcome of a session, surfaced by the CLI.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    /// Terminal state the session reached.
    pub state: SessionState,
    /// Collect-stage statistics, when that stage ran.
    pub collect: Option<CollectStats>,
    /// Sweep-stage statistics, when that stage ran.
    pub sweep: Option<SweepStats>,
}

impl SessionOutcome {
    /// Returns a human-readable summary for terminal output.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        if let Some(collect) = &self.collect {
            lines.push(format!("s3gc: {}", collect.summary()));
        }
        if let Some(sweep) = &self.sweep {
            lines.push(format!("s3gc: {}", sweep.summary()));
        }
        match self.state {
            SessionState::Done => lines.push("s3gc: OK".to_string()),
            SessionState::Aborted => lines.push("s3gc: aborted by operator".to_string()),
            _ => {}
        }
        lines.join("\n")
    }
}

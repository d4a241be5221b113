//! Session state machine tying the stages together.
//!
//! `Init → Collecting? → Confirming? → Sweeping? → Cleanup? → Done`, with
//! `Aborted` on operator decline. A fatal error moves the session to
//! `Failed` and surfaces as `Err` from [`GcSession::run`]; the CLI reports
//! it and exits nonzero.
//!
//! Clients are built lazily, per stage: a collect-only run never touches
//! the reconciliation query, and a sweep over already-collected data never
//! lists the bucket. Both capabilities are injectable, which is how the
//! integration suite drives a full session over the in-memory backends.

use crate::config::GcConfig;
use crate::confirm::{self, Decision};
use crate::inventory::InventoryCollector;
use crate::models::{SessionOutcome, SessionState};
use crate::query;
use crate::storage::clickhouse::ClickHouseBackend;
use crate::storage::s3::S3Backend;
use crate::storage::traits::{ObjectStore, OrphanTotals, ReferenceIndex};
use crate::sweep::Sweeper;
use crate::Result;
use std::sync::Arc;

/// Answers the confirmation prompt; injectable so tests can script it.
type PromptFn = Box<dyn Fn(OrphanTotals) -> Decision + Send>;

/// One garbage-collection run, from validation to terminal state.
pub struct GcSession {
    config: GcConfig,
    state: SessionState,
    store: Option<Arc<dyn ObjectStore>>,
    index: Option<Arc<dyn ReferenceIndex>>,
    interactive: Option<bool>,
    prompt: PromptFn,
}

impl GcSession {
    /// Creates a session that builds its clients from the configuration.
    #[must_use]
    pub fn new(config: GcConfig) -> Self {
        Self {
            config,
            state: SessionState::Init,
            store: None,
            index: None,
            interactive: None,
            prompt: Box::new(confirm::prompt_operator),
        }
    }

    /// Injects pre-built backends instead of the lazy real clients.
    #[must_use]
    pub fn with_backends(
        mut self,
        store: Arc<dyn ObjectStore>,
        index: Arc<dyn ReferenceIndex>,
    ) -> Self {
        self.store = Some(store);
        self.index = Some(index);
        self
    }

    /// Overrides terminal detection for the confirmation gate.
    #[must_use]
    pub const fn with_interactive(mut self, interactive: bool) -> Self {
        self.interactive = Some(interactive);
        self
    }

    /// Replaces the interactive prompt with a scripted answer.
    #[must_use]
    pub fn with_prompt(mut self, prompt: impl Fn(OrphanTotals) -> Decision + Send + 'static) -> Self {
        self.prompt = Box::new(prompt);
        self
    }

    /// Returns the current session state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    fn enter(&mut self, state: SessionState) {
        tracing::info!(from = self.state.as_str(), to = state.as_str(), "session state");
        self.state = state;
    }

    fn store(&mut self) -> Result<Arc<dyn ObjectStore>> {
        if let Some(store) = &self.store {
            return Ok(store.clone());
        }
        let s3 = &self.config.s3;
        let backend = S3Backend::new(&s3.endpoint, &s3.access_key, &s3.secret_key)?
            .with_region(s3.region.clone());
        let store: Arc<dyn ObjectStore> = Arc::new(backend);
        self.store = Some(store.clone());
        Ok(store)
    }

    fn index(&mut self) -> Result<Arc<dyn ReferenceIndex>> {
        if let Some(index) = &self.index {
            return Ok(index.clone());
        }
        let ch = &self.config.clickhouse;
        let backend = ClickHouseBackend::new(&ch.host, ch.port, ch.secure)?
            .with_user(ch.user.clone())
            .with_password(ch.password.clone());
        let index: Arc<dyn ReferenceIndex> = Arc::new(backend);
        self.index = Some(index.clone());
        Ok(index)
    }

    fn prompt_required(&self) -> bool {
        self.interactive
            .map_or_else(|| confirm::prompt_required(self.config.dry_run), |forced| {
                forced && !self.config.dry_run
            })
    }

    /// Runs the session to a terminal state.
    ///
    /// Returns `Ok` for `Done` and `Aborted` (an operator decline is a
    /// normal outcome, not an error). On `Err` the session is in the
    /// `Failed` state.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error: [`Error::Configuration`] from
    /// validation, [`Error::Connectivity`] or [`Error::Query`] from any
    /// stage. Per-object deletion failures never surface here.
    pub fn run(&mut self) -> Result<SessionOutcome> {
        let result = self.execute();
        if result.is_err() {
            self.enter(SessionState::Failed);
        }
        result
    }

    fn execute(&mut self) -> Result<SessionOutcome> {
        self.config.validate()?;
        let table = self.config.table_name()?;
        let mut outcome = SessionOutcome {
            state: SessionState::Init,
            collect: None,
            sweep: None,
        };

        if !self.config.use_collected {
            self.enter(SessionState::Collecting);
            let collector = InventoryCollector::new(
                self.store()?,
                self.index()?,
                self.config.clone(),
            )?;
            collector.ensure_table()?;
            outcome.collect = Some(collector.collect()?);
        }

        if self.config.collect_only {
            self.enter(SessionState::Done);
            outcome.state = self.state;
            return Ok(outcome);
        }

        // Best-effort probe: an absent or unreadable table means there is
        // nothing to sweep, not a failure.
        let index = self.index()?;
        match index.table_exists(&table) {
            Ok(true) => {},
            Ok(false) => {
                tracing::warn!(table = %table, "inventory table missing, nothing to do");
                self.enter(SessionState::Done);
                outcome.state = self.state;
                return Ok(outcome);
            },
            Err(e) => {
                tracing::warn!(table = %table, error = %e, "inventory probe failed, nothing to do");
                self.enter(SessionState::Done);
                outcome.state = self.state;
                return Ok(outcome);
            },
        }

        if self.prompt_required() {
            self.enter(SessionState::Confirming);
            let candidate_query = query::CandidateQuery {
                table: &table,
                disk: &self.config.disk_name,
                cluster: self.config.cluster.as_deref(),
                samples: self.config.samples,
                after: self.config.use_after.as_deref(),
                age_hours: self.config.age_gate(),
                limit: self.config.use_total,
            };
            let totals = index.orphan_totals(&candidate_query)?;
            if (self.prompt)(totals) == Decision::Declined {
                self.enter(SessionState::Aborted);
                outcome.state = self.state;
                return Ok(outcome);
            }
        }

        self.enter(SessionState::Sweeping);
        let sweeper = Sweeper::new(self.store()?, index.clone(), self.config.clone())?;
        outcome.sweep = Some(sweeper.run()?);

        if !self.config.keep_data && !self.config.dry_run {
            self.enter(SessionState::Cleanup);
            index.execute(&query::truncate_table(&table))?;
        }

        self.enter(SessionState::Done);
        outcome.state = self.state;
        Ok(outcome)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::models::ObjectInfo;
    use crate::storage::memory::{MemoryIndex, MemoryObjectStore};
    use chrono::{Duration, Utc};

    fn obj(path: &str, age_hours: i64) -> ObjectInfo {
        ObjectInfo {
            path: path.to_string(),
            size: 100,
            last_modified: Utc::now() - Duration::hours(age_hours),
        }
    }

    fn setup(config: GcConfig) -> (Arc<MemoryObjectStore>, Arc<MemoryIndex>, GcSession) {
        let store = Arc::new(MemoryObjectStore::new());
        let index = Arc::new(MemoryIndex::new());
        let session = GcSession::new(config).with_backends(store.clone(), index.clone());
        (store, index, session)
    }

    #[test]
    fn test_full_session_removes_unreferenced() {
        let (store, index, mut session) = setup(GcConfig::default());
        store.put(obj("data/keep", 10));
        store.put(obj("data/drop", 10));
        index.add_reference("data/keep", "s3");

        let outcome = session.run().unwrap();
        assert_eq!(outcome.state, SessionState::Done);
        assert_eq!(outcome.collect.unwrap().objects_collected, 2);
        assert_eq!(outcome.sweep.as_ref().unwrap().objects_removed, 1);
        assert!(store.contains("data/keep"));
        assert!(!store.contains("data/drop"));
    }

    #[test]
    fn test_cleanup_truncates_unless_keep_data() {
        let table = GcConfig::default().table_name().unwrap();

        let (store, index, mut session) = setup(GcConfig::default());
        store.put(obj("data/drop", 10));
        session.run().unwrap();
        assert!(index.rows(&table).is_empty());

        let config = GcConfig {
            keep_data: true,
            ..Default::default()
        };
        let (store, index, mut session) = setup(config);
        store.put(obj("data/drop", 10));
        session.run().unwrap();
        assert_eq!(index.rows(&table).len(), 1);
    }

    #[test]
    fn test_collect_only_skips_sweep() {
        let config = GcConfig {
            collect_only: true,
            ..Default::default()
        };
        let (store, index, mut session) = setup(config);
        store.put(obj("data/a", 10));

        let outcome = session.run().unwrap();
        assert_eq!(outcome.state, SessionState::Done);
        assert!(outcome.sweep.is_none());
        assert!(store.contains("data/a"));
        let table = GcConfig::default().table_name().unwrap();
        assert_eq!(index.rows(&table).len(), 1);
    }

    #[test]
    fn test_use_collected_skips_collection() {
        let config = GcConfig {
            use_collected: true,
            ..Default::default()
        };
        let (store, index, mut session) = setup(config);
        let table = GcConfig::default().table_name().unwrap();
        index.execute(&query::create_table(&table, 4)).unwrap();
        let prior = crate::models::InventoryRecord {
            path: "data/a".to_string(),
            size: 100,
            last_modified: Utc::now() - Duration::hours(10),
            active: true,
        };
        index.insert_records(&table, &[prior]).unwrap();
        store.put(obj("data/a", 10));

        let outcome = session.run().unwrap();
        assert!(outcome.collect.is_none());
        assert_eq!(outcome.sweep.unwrap().objects_removed, 1);
    }

    #[test]
    fn test_missing_table_means_nothing_to_do() {
        let config = GcConfig {
            use_collected: true,
            ..Default::default()
        };
        let (_store, _index, mut session) = setup(config);
        let outcome = session.run().unwrap();
        assert_eq!(outcome.state, SessionState::Done);
        assert!(outcome.sweep.is_none());
    }

    #[test]
    fn test_probe_failure_means_nothing_to_do() {
        let config = GcConfig {
            use_collected: true,
            ..Default::default()
        };
        let (_store, index, mut session) = setup(config);
        index.fail_probes();
        let outcome = session.run().unwrap();
        assert_eq!(outcome.state, SessionState::Done);
        assert!(outcome.sweep.is_none());
    }

    #[test]
    fn test_declined_confirmation_aborts_without_mutation() {
        let (store, index, session) = setup(GcConfig::default());
        store.put(obj("data/drop", 10));
        let mut session = session
            .with_interactive(true)
            .with_prompt(|_| Decision::Declined);

        let outcome = session.run().unwrap();
        assert_eq!(outcome.state, SessionState::Aborted);
        assert!(outcome.sweep.is_none());
        assert!(store.contains("data/drop"));
        assert_eq!(store.delete_calls(), 0);

        // Inventory rows are untouched too (collection itself ran).
        let table = GcConfig::default().table_name().unwrap();
        assert!(index.rows(&table).iter().all(|r| r.active));
    }

    #[test]
    fn test_confirmed_prompt_proceeds_and_previews_totals() {
        let (store, _index, session) = setup(GcConfig::default());
        store.put(obj("data/drop", 10));
        let mut session = session.with_interactive(true).with_prompt(|totals| {
            assert_eq!(totals.objects, 1);
            assert_eq!(totals.bytes, 100);
            Decision::Proceed
        });

        let outcome = session.run().unwrap();
        assert_eq!(outcome.state, SessionState::Done);
        assert_eq!(outcome.sweep.unwrap().objects_removed, 1);
    }

    #[test]
    fn test_dry_run_skips_prompt_and_mutations() {
        let config = GcConfig {
            dry_run: true,
            ..Default::default()
        };
        let (store, index, session) = setup(config);
        store.put(obj("data/drop", 10));
        let mut session = session
            .with_interactive(true)
            .with_prompt(|_| panic!("dry run must not prompt"));

        let outcome = session.run().unwrap();
        assert_eq!(outcome.state, SessionState::Done);
        assert_eq!(outcome.sweep.unwrap().objects_removed, 1);
        assert_eq!(store.delete_calls(), 0);
        assert!(store.contains("data/drop"));
        // Cleanup is skipped too: the rehearsal leaves everything in place.
        let table = GcConfig::default().table_name().unwrap();
        assert_eq!(index.rows(&table).len(), 1);
    }

    #[test]
    fn test_invalid_config_fails_before_io() {
        let config = GcConfig {
            samples: 0,
            ..Default::default()
        };
        let (_store, _index, mut session) = setup(config);
        assert!(matches!(session.run(), Err(Error::Configuration(_))));
        assert_eq!(session.state(), SessionState::Failed);
    }
}

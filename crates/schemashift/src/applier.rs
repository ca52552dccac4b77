//! Migration application.
//!
//! Applies planned migrations (and rolls back the most recent one) under the
//! exclusive lease, so only one process changes a database at a time.
//!
//! Application is all-or-nothing. Dialects with transactional DDL run every
//! statement and the ledger append in one transaction. Dialects without it
//! checkpoint each statement in `schemashift_progress`, once before sending
//! it and once after it succeeds; a failed run leaves its checkpoints behind
//! and the next run of the same migration skips the statements already done.
//! A statement left started by an interrupted run is sent again, and an
//! "already exists" or "does not exist" error from it counts as success. The
//! ledger append happens only after every statement succeeded.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use sqlx::{AnyConnection, AnyPool, Connection};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dialect::Dialect;
use crate::emitter::RenderedStep;
use crate::error::{is_already_applied, is_transient, MigrateError, Result};
use crate::lease::MigrationLease;
use crate::ledger::{LedgerStore, MigrationLedger, MigrationLedgerEntry, StatementState};
use crate::planner::PlannedMigration;

/// Settings for applying migrations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Upper bound for one attempt, lease acquisition excluded. Must be
    /// shorter than `lease_ttl`, since the lease is not renewed mid-attempt.
    pub timeout: Duration,
    /// Attempts before a retryable failure is surfaced.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on every further retry.
    pub base_backoff: Duration,
    /// Cap on the retry delay.
    pub max_backoff: Duration,
    /// How long an acquired lease stays valid.
    pub lease_ttl: Duration,
    /// Lease holder identifier, reported to processes kept waiting.
    pub holder: String,
}

/// Default holder: host, process id and a random suffix.
fn default_holder() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("schemashift-{host}-{}-{}", std::process::id(), &suffix[..8])
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            lease_ttl: Duration::from_secs(600),
            holder: default_holder(),
        }
    }
}

impl ApplyOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the number of attempts (at least one is always made).
    #[must_use]
    pub const fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the retry backoff bounds.
    #[must_use]
    pub const fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max;
        self
    }

    /// Sets the lease TTL.
    #[must_use]
    pub const fn lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Sets the lease holder identifier.
    #[must_use]
    pub fn holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Checks that the options can be used for an apply.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if an attempt could outlive its lease.
    pub fn validate(&self) -> Result<()> {
        if self.timeout >= self.lease_ttl {
            return Err(MigrateError::InvalidState(format!(
                "Timeout ({}s) must be shorter than the lease TTL ({}s)",
                self.timeout.as_secs_f64(),
                self.lease_ttl.as_secs_f64()
            )));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1_u32 << attempt.saturating_sub(1).min(16);
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or runs out
/// of attempts.
///
/// # Errors
///
/// Returns the last error produced by `op`.
pub async fn retry_with_backoff<T, F, Fut>(options: &ApplyOptions, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < options.max_attempts => {
                let delay = options.backoff_for(attempt);
                warn!(
                    attempt,
                    max_attempts = options.max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Runs `fut`, failing with a retryable `Timeout` if it takes longer than
/// `timeout`.
///
/// # Errors
///
/// Returns `Timeout` on expiry, otherwise whatever `fut` returns.
pub async fn with_deadline<T>(
    fut: impl Future<Output = Result<T>>,
    timeout: Duration,
    migration: &str,
) -> Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| MigrateError::Timeout {
            migration: migration.to_string(),
            elapsed_ms: timeout.as_millis(),
        })?
}

/// What a locked run does.
enum Job<'a> {
    Apply(&'a PlannedMigration),
    Rollback(&'a str),
}

impl Job<'_> {
    fn label(&self) -> &str {
        match self {
            Self::Apply(plan) => plan.migration_id(),
            Self::Rollback(_) => "rollback",
        }
    }
}

/// Ledger change made once every statement has run.
enum Finish<'a> {
    Append(&'a MigrationLedgerEntry),
    Revert {
        entry: &'a MigrationLedgerEntry,
        reason: &'a str,
    },
}

/// Applies migrations to one database.
#[derive(Debug, Clone)]
pub struct MigrationApplier {
    store: LedgerStore,
    options: ApplyOptions,
}

impl MigrationApplier {
    /// Creates an applier for a database of `dialect`.
    #[must_use]
    pub fn new(pool: AnyPool, dialect: Dialect, options: ApplyOptions) -> Self {
        Self {
            store: LedgerStore::new(pool, dialect),
            options,
        }
    }

    /// The ledger store.
    #[must_use]
    pub const fn store(&self) -> &LedgerStore {
        &self.store
    }

    /// Options in effect.
    #[must_use]
    pub const fn options(&self) -> &ApplyOptions {
        &self.options
    }

    /// Ensures the bookkeeping tables exist.
    ///
    /// # Errors
    ///
    /// Returns `Database` on failure.
    pub async fn init(&self) -> Result<()> {
        self.store.ensure_tables().await
    }

    /// Loads the applied history.
    ///
    /// # Errors
    ///
    /// See [`LedgerStore::load`].
    pub async fn ledger(&self) -> Result<MigrationLedger> {
        self.store.load().await
    }

    /// Applies a planned migration.
    ///
    /// Returns `None` when the plan has no steps.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the options are invalid or the plan was
    /// computed against a schema other than the ledger's current one,
    /// `ApplyFailure` if a statement fails,
    /// `LeaseUnavailable` if another process keeps the lease through every
    /// attempt, and `Timeout` when the last attempt runs out of time.
    pub async fn apply(&self, plan: &PlannedMigration) -> Result<Option<MigrationLedgerEntry>> {
        self.options.validate()?;
        if plan.dialect() != self.store.dialect() {
            return Err(MigrateError::InvalidState(format!(
                "Plan was generated for {} but the database is {}",
                plan.dialect(),
                self.store.dialect()
            )));
        }
        if plan.is_empty() {
            info!("Schema is up to date, nothing to apply");
            return Ok(None);
        }

        let job = Job::Apply(plan);
        retry_with_backoff(&self.options, || self.run_once(&job))
            .await
            .map(Some)
    }

    /// Reverts the most recent migration and records the rollback in the
    /// audit table.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the options are invalid or nothing has been
    /// applied, `NotReversible` if
    /// the migration discarded data, and the same application errors as
    /// [`apply`](Self::apply).
    pub async fn rollback(&self, reason: &str) -> Result<MigrationLedgerEntry> {
        self.options.validate()?;
        let job = Job::Rollback(reason);
        retry_with_backoff(&self.options, || self.run_once(&job)).await
    }

    async fn run_once(&self, job: &Job<'_>) -> Result<MigrationLedgerEntry> {
        let mut conn = self.store.pool().acquire().await?;
        let lease = MigrationLease::new(&self.options.holder, self.options.lease_ttl);
        lease.acquire(&self.store, &mut conn).await?;

        let result = with_deadline(
            self.run_locked(&mut conn, job),
            self.options.timeout,
            job.label(),
        )
        .await;

        if let Err(err) = lease.release(&self.store, &mut conn).await {
            warn!(holder = %self.options.holder, error = %err, "Failed to release migration lease");
        }
        result
    }

    async fn run_locked(
        &self,
        conn: &mut AnyConnection,
        job: &Job<'_>,
    ) -> Result<MigrationLedgerEntry> {
        match job {
            Job::Apply(plan) => self.apply_locked(conn, plan).await,
            Job::Rollback(reason) => self.rollback_locked(conn, reason).await,
        }
    }

    async fn apply_locked(
        &self,
        conn: &mut AnyConnection,
        plan: &PlannedMigration,
    ) -> Result<MigrationLedgerEntry> {
        let ledger = self.store.load_on(conn).await?;
        if ledger.current_schema().fingerprint() != plan.base_fingerprint {
            return Err(MigrateError::InvalidState(format!(
                "Migration '{}' was planned against a different schema; plan again",
                plan.migration_id()
            )));
        }

        let (entry, _) = ledger.next_entry(&plan.steps, Utc::now())?;
        info!(
            migration = %entry.migration_id,
            sequence = entry.sequence,
            steps = plan.steps.len(),
            "Applying migration"
        );

        let finish = Finish::Append(&entry);
        self.execute(conn, &entry.migration_id, &plan.script.forward, &finish)
            .await?;

        info!(migration = %entry.migration_id, "Migration applied successfully");
        Ok(entry)
    }

    async fn rollback_locked(
        &self,
        conn: &mut AnyConnection,
        reason: &str,
    ) -> Result<MigrationLedgerEntry> {
        let ledger = self.store.load_on(conn).await?;
        let entry = ledger
            .last()
            .cloned()
            .ok_or_else(|| MigrateError::InvalidState("No migration to roll back".to_string()))?;
        let reverse = entry.reverse_steps()?;

        info!(
            migration = %entry.migration_id,
            sequence = entry.sequence,
            reason,
            "Rolling back migration"
        );

        let sql = self.store.dialect().sql();
        let rendered: Vec<RenderedStep> = reverse
            .iter()
            .enumerate()
            .map(|(index, step)| RenderedStep {
                migration_id: entry.migration_id.clone(),
                index,
                description: step.describe(),
                statements: sql.generate_sql(step),
            })
            .collect();

        let progress_key = format!("rollback:{}", entry.migration_id);
        let finish = Finish::Revert {
            entry: &entry,
            reason,
        };
        self.execute(conn, &progress_key, &rendered, &finish).await?;

        info!(migration = %entry.migration_id, "Migration rolled back");
        Ok(entry)
    }

    /// Writes the ledger change that completes a run.
    async fn finish(&self, conn: &mut AnyConnection, finish: &Finish<'_>) -> Result<()> {
        match *finish {
            Finish::Append(entry) => self.store.append(conn, entry).await,
            Finish::Revert { entry, reason } => {
                self.store.delete(conn, entry.sequence).await?;
                self.store.audit(conn, entry, reason, Utc::now()).await
            }
        }
    }

    /// Executes rendered steps, then updates the ledger.
    ///
    /// With transactional DDL everything, the ledger change included, commits
    /// together. Otherwise statements are checkpointed under `progress_key`
    /// and the ledger change commits together with clearing the checkpoints.
    /// A statement rejected by the database is un-checkpointed, since it did
    /// not take effect.
    async fn execute(
        &self,
        conn: &mut AnyConnection,
        progress_key: &str,
        steps: &[RenderedStep],
        finish: &Finish<'_>,
    ) -> Result<()> {
        let store = &self.store;

        if store.dialect().sql().supports_transactional_ddl() {
            let mut tx = conn.begin().await?;
            for step in steps {
                for statement in &step.statements {
                    debug!(step = step.index, sql = %statement, "Executing SQL");
                    if let Err(err) = sqlx::query(statement).execute(&mut *tx).await {
                        let failure = MigrateError::apply_failure(progress_key, step.index, &err);
                        if let Err(rollback_err) = tx.rollback().await {
                            warn!(error = %rollback_err, "Failed to roll back transaction");
                        }
                        return Err(failure);
                    }
                }
            }
            self.finish(&mut tx, finish).await?;
            tx.commit().await?;
            return Ok(());
        }

        let progress = store.statement_progress(conn, progress_key).await?;
        if !progress.is_empty() {
            info!(
                migration = %progress_key,
                checkpoints = progress.len(),
                "Resuming partially applied migration"
            );
        }

        for step in steps {
            for (i, statement) in step.statements.iter().enumerate() {
                let interrupted = match progress.get(&(step.index, i)) {
                    Some(StatementState::Done) => {
                        debug!(step = step.index, statement = i, "Skipping completed statement");
                        continue;
                    }
                    Some(StatementState::Started) => true,
                    None => {
                        store.begin_statement(conn, progress_key, step.index, i).await?;
                        false
                    }
                };

                debug!(step = step.index, sql = %statement, "Executing SQL");
                match sqlx::query(statement).execute(&mut *conn).await {
                    Ok(_) => {}
                    // An interrupted run may have executed it without
                    // recording the checkpoint.
                    Err(err) if interrupted && is_already_applied(&err) => {
                        info!(
                            step = step.index,
                            statement = i,
                            error = %err,
                            "Statement from an interrupted run already took effect"
                        );
                    }
                    Err(err) => {
                        let failure = MigrateError::apply_failure(progress_key, step.index, &err);
                        // A lost connection leaves the outcome unknown; the
                        // statement stays started.
                        if !is_transient(&err) {
                            if let Err(forget_err) =
                                store.forget_statement(conn, progress_key, step.index, i).await
                            {
                                warn!(error = %forget_err, "Failed to clear statement checkpoint");
                            }
                        }
                        return Err(failure);
                    }
                }
                store
                    .mark_statement(conn, progress_key, step.index, i)
                    .await?;
            }
        }

        let mut tx = conn.begin().await?;
        self.finish(&mut tx, finish).await?;
        store.clear_progress(&mut tx, progress_key).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> ApplyOptions {
        ApplyOptions::new()
            .max_attempts(3)
            .backoff(Duration::from_millis(1), Duration::from_millis(2))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let options = ApplyOptions::new().backoff(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(options.backoff_for(1), Duration::from_millis(100));
        assert_eq!(options.backoff_for(2), Duration::from_millis(200));
        assert_eq!(options.backoff_for(3), Duration::from_millis(350));
        assert_eq!(options.backoff_for(40), Duration::from_millis(350));
    }

    #[test]
    fn test_default_holders_are_distinct() {
        let a = ApplyOptions::default();
        let b = ApplyOptions::default();
        assert_ne!(a.holder, b.holder);
        assert!(a.holder.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_timeout_must_fit_in_lease() {
        assert!(ApplyOptions::default().validate().is_ok());

        let outlives = ApplyOptions::new()
            .timeout(Duration::from_secs(900))
            .lease_ttl(Duration::from_secs(600));
        assert!(matches!(outlives.validate(), Err(MigrateError::InvalidState(_))));

        let equal = ApplyOptions::new()
            .timeout(Duration::from_secs(60))
            .lease_ttl(Duration::from_secs(60));
        assert!(equal.validate().is_err());
    }

    #[tokio::test]
    async fn test_retry_stops_on_success() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&fast(), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(MigrateError::Database(sqlx::Error::PoolTimedOut))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(&fast(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(MigrateError::LeaseUnavailable {
                holder: "other".to_string(),
            })
        })
        .await;
        assert!(matches!(result, Err(MigrateError::LeaseUnavailable { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_semantic_failures_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(&fast(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(MigrateError::apply_failure("m", 0, &sqlx::Error::RowNotFound))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deadline_expiry_is_retryable() {
        let result: Result<()> = with_deadline(
            std::future::pending(),
            Duration::from_millis(10),
            "abc",
        )
        .await;
        let err = result.unwrap_err();
        assert!(matches!(err, MigrateError::Timeout { ref migration, .. } if migration == "abc"));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_deadline_passes_result_through() {
        let value = with_deadline(async { Ok(1) }, Duration::from_secs(1), "abc")
            .await
            .unwrap();
        assert_eq!(value, 1);
    }
}

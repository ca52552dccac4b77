//! Ledger persistence.
//!
//! This module manages the bookkeeping tables schemashift keeps in the target
//! database:
//!
//! - `schemashift_ledger`: one row per applied migration,
//! - `schemashift_ledger_audit`: every audited rollback,
//! - `schemashift_progress`: statements started or finished by an unfinished
//!   apply on dialects without transactional DDL,
//! - `schemashift_lease`: the exclusive apply lease.
//!
//! Queries go through the sqlx `Any` driver. They are written with `?`
//! placeholders and rewritten for dialects that number their parameters.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use sqlx::{AnyConnection, AnyPool};
use tracing::debug;

use crate::dialect::Dialect;
use crate::error::{MigrateError, Result};
use crate::ledger::{MigrationLedger, MigrationLedgerEntry};

/// SQL to create the ledger table.
pub const CREATE_LEDGER_TABLE_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schemashift_ledger (
    sequence BIGINT NOT NULL PRIMARY KEY,
    migration_id VARCHAR(64) NOT NULL,
    description TEXT NOT NULL,
    dialect VARCHAR(16) NOT NULL,
    applied_at VARCHAR(40) NOT NULL,
    steps TEXT NOT NULL
)
";

/// SQL to create the rollback audit table.
pub const CREATE_AUDIT_TABLE_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schemashift_ledger_audit (
    migration_id VARCHAR(64) NOT NULL,
    sequence BIGINT NOT NULL,
    action VARCHAR(16) NOT NULL,
    reason TEXT NOT NULL,
    recorded_at VARCHAR(40) NOT NULL
)
";

/// SQL to create the per-statement progress table.
pub const CREATE_PROGRESS_TABLE_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schemashift_progress (
    migration_id VARCHAR(80) NOT NULL,
    step_index BIGINT NOT NULL,
    statement_index BIGINT NOT NULL,
    state VARCHAR(16) NOT NULL,
    PRIMARY KEY (migration_id, step_index, statement_index)
)
";

/// SQL to create the lease table.
pub const CREATE_LEASE_TABLE_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schemashift_lease (
    lease_id BIGINT NOT NULL PRIMARY KEY,
    holder VARCHAR(128) NOT NULL,
    token VARCHAR(64) NOT NULL,
    expires_at BIGINT NOT NULL
)
";

/// Checkpoint state of one statement of an unfinished migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementState {
    /// Sent to the database; whether it took effect is unknown.
    Started,
    /// Executed successfully.
    Done,
}

impl StatementState {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Done => "done",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "started" => Some(Self::Started),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

/// A rollback recorded in the audit table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    /// Rolled back migration.
    pub migration_id: String,
    /// Ledger position the migration had.
    pub sequence: i64,
    /// What happened (currently always `rollback`).
    pub action: String,
    /// Operator-supplied reason.
    pub reason: String,
    /// When the rollback was recorded.
    pub recorded_at: DateTime<Utc>,
}

type LedgerRow = (i64, String, String, String, String, String);

/// Reads and writes the ledger tables.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    pool: AnyPool,
    dialect: Dialect,
}

impl LedgerStore {
    /// Creates a store over `pool` for a database of `dialect`.
    #[must_use]
    pub const fn new(pool: AnyPool, dialect: Dialect) -> Self {
        Self { pool, dialect }
    }

    /// The connection pool.
    #[must_use]
    pub const fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Dialect of the target database.
    #[must_use]
    pub const fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Rewrites `?` placeholders for this dialect.
    pub(crate) fn sql(&self, template: &str) -> String {
        let sql = self.dialect.sql();
        let mut out = String::with_capacity(template.len() + 8);
        let mut index = 0;
        for ch in template.chars() {
            if ch == '?' {
                index += 1;
                out.push_str(&sql.placeholder(index));
            } else {
                out.push(ch);
            }
        }
        out
    }

    /// Ensures every bookkeeping table exists.
    ///
    /// # Errors
    ///
    /// Returns `Database` if a table cannot be created.
    pub async fn ensure_tables(&self) -> Result<()> {
        for ddl in [
            CREATE_LEDGER_TABLE_SQL,
            CREATE_AUDIT_TABLE_SQL,
            CREATE_PROGRESS_TABLE_SQL,
            CREATE_LEASE_TABLE_SQL,
        ] {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        debug!(dialect = %self.dialect, "Ledger tables ready");
        Ok(())
    }

    /// Loads the ledger, replaying every entry.
    ///
    /// # Errors
    ///
    /// Returns `Database` on query failure and `InvalidState` or
    /// `Serialization` for rows that cannot be decoded or replayed.
    pub async fn load(&self) -> Result<MigrationLedger> {
        let mut conn = self.pool.acquire().await?;
        self.load_on(&mut conn).await
    }

    /// Loads the ledger over an existing connection.
    ///
    /// # Errors
    ///
    /// Same as [`load`](Self::load).
    pub async fn load_on(&self, conn: &mut AnyConnection) -> Result<MigrationLedger> {
        let rows: Vec<LedgerRow> = sqlx::query_as(
            "SELECT sequence, migration_id, description, dialect, applied_at, steps \
             FROM schemashift_ledger ORDER BY sequence",
        )
        .fetch_all(conn)
        .await?;

        let entries = rows
            .into_iter()
            .map(decode_entry)
            .collect::<Result<Vec<_>>>()?;
        MigrationLedger::from_entries(self.dialect, entries)
    }

    /// Appends a ledger entry.
    ///
    /// # Errors
    ///
    /// Returns `Database` on failure, including a duplicate sequence number.
    pub async fn append(&self, conn: &mut AnyConnection, entry: &MigrationLedgerEntry) -> Result<()> {
        sqlx::query(&self.sql(
            "INSERT INTO schemashift_ledger \
             (sequence, migration_id, description, dialect, applied_at, steps) \
             VALUES (?, ?, ?, ?, ?, ?)",
        ))
        .bind(entry.sequence)
        .bind(entry.migration_id.clone())
        .bind(entry.description.clone())
        .bind(entry.dialect.name())
        .bind(entry.applied_at.to_rfc3339())
        .bind(serde_json::to_string(&entry.steps)?)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Deletes a ledger entry.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if no entry has that sequence number.
    pub async fn delete(&self, conn: &mut AnyConnection, sequence: i64) -> Result<()> {
        let result = sqlx::query(&self.sql("DELETE FROM schemashift_ledger WHERE sequence = ?"))
            .bind(sequence)
            .execute(conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MigrateError::InvalidState(format!(
                "Ledger entry {sequence} does not exist"
            )));
        }
        Ok(())
    }

    /// Records a rollback in the audit table.
    ///
    /// # Errors
    ///
    /// Returns `Database` on failure.
    pub async fn audit(
        &self,
        conn: &mut AnyConnection,
        entry: &MigrationLedgerEntry,
        reason: &str,
        recorded_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(&self.sql(
            "INSERT INTO schemashift_ledger_audit \
             (migration_id, sequence, action, reason, recorded_at) VALUES (?, ?, ?, ?, ?)",
        ))
        .bind(entry.migration_id.clone())
        .bind(entry.sequence)
        .bind("rollback")
        .bind(reason.to_string())
        .bind(recorded_at.to_rfc3339())
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Every audited rollback, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `Database` on failure.
    pub async fn audit_log(&self) -> Result<Vec<AuditRecord>> {
        let rows: Vec<(String, i64, String, String, String)> = sqlx::query_as(
            "SELECT migration_id, sequence, action, reason, recorded_at \
             FROM schemashift_ledger_audit ORDER BY recorded_at, sequence",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(migration_id, sequence, action, reason, recorded_at)| {
                Ok(AuditRecord {
                    migration_id,
                    sequence,
                    action,
                    reason,
                    recorded_at: parse_timestamp(&recorded_at)?,
                })
            })
            .collect()
    }

    /// Checkpointed statements of an unfinished migration, keyed by
    /// (step index, statement index).
    ///
    /// # Errors
    ///
    /// Returns `Database` on failure.
    pub async fn statement_progress(
        &self,
        conn: &mut AnyConnection,
        migration_id: &str,
    ) -> Result<HashMap<(usize, usize), StatementState>> {
        let rows: Vec<(i64, i64, String)> = sqlx::query_as(&self.sql(
            "SELECT step_index, statement_index, state FROM schemashift_progress \
             WHERE migration_id = ?",
        ))
        .bind(migration_id.to_string())
        .fetch_all(conn)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(step, statement, state)| {
                Some((
                    (usize::try_from(step).ok()?, usize::try_from(statement).ok()?),
                    StatementState::parse(&state)?,
                ))
            })
            .collect())
    }

    /// Statements already executed for an unfinished migration.
    ///
    /// # Errors
    ///
    /// Returns `Database` on failure.
    pub async fn completed_statements(
        &self,
        conn: &mut AnyConnection,
        migration_id: &str,
    ) -> Result<HashSet<(usize, usize)>> {
        Ok(self
            .statement_progress(conn, migration_id)
            .await?
            .into_iter()
            .filter(|(_, state)| *state == StatementState::Done)
            .map(|(key, _)| key)
            .collect())
    }

    /// Records that a statement is about to be sent.
    ///
    /// # Errors
    ///
    /// Returns `Database` on failure.
    pub async fn begin_statement(
        &self,
        conn: &mut AnyConnection,
        migration_id: &str,
        step: usize,
        statement: usize,
    ) -> Result<()> {
        sqlx::query(&self.sql(
            "INSERT INTO schemashift_progress (migration_id, step_index, statement_index, state) \
             VALUES (?, ?, ?, ?)",
        ))
        .bind(migration_id.to_string())
        .bind(to_i64(step))
        .bind(to_i64(statement))
        .bind(StatementState::Started.as_str())
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Checkpoints one started statement as executed.
    ///
    /// # Errors
    ///
    /// Returns `Database` on failure.
    pub async fn mark_statement(
        &self,
        conn: &mut AnyConnection,
        migration_id: &str,
        step: usize,
        statement: usize,
    ) -> Result<()> {
        sqlx::query(&self.sql(
            "UPDATE schemashift_progress SET state = ? \
             WHERE migration_id = ? AND step_index = ? AND statement_index = ?",
        ))
        .bind(StatementState::Done.as_str())
        .bind(migration_id.to_string())
        .bind(to_i64(step))
        .bind(to_i64(statement))
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Drops the checkpoint of a statement known not to have taken effect.
    ///
    /// # Errors
    ///
    /// Returns `Database` on failure.
    pub async fn forget_statement(
        &self,
        conn: &mut AnyConnection,
        migration_id: &str,
        step: usize,
        statement: usize,
    ) -> Result<()> {
        sqlx::query(&self.sql(
            "DELETE FROM schemashift_progress \
             WHERE migration_id = ? AND step_index = ? AND statement_index = ?",
        ))
        .bind(migration_id.to_string())
        .bind(to_i64(step))
        .bind(to_i64(statement))
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Drops the checkpoints of a finished migration.
    ///
    /// # Errors
    ///
    /// Returns `Database` on failure.
    pub async fn clear_progress(&self, conn: &mut AnyConnection, migration_id: &str) -> Result<()> {
        sqlx::query(&self.sql("DELETE FROM schemashift_progress WHERE migration_id = ?"))
            .bind(migration_id.to_string())
            .execute(conn)
            .await?;
        Ok(())
    }
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MigrateError::InvalidState(format!("Invalid timestamp '{value}': {e}")))
}

fn decode_entry(row: LedgerRow) -> Result<MigrationLedgerEntry> {
    let (sequence, migration_id, description, dialect, applied_at, steps) = row;
    Ok(MigrationLedgerEntry {
        sequence,
        migration_id,
        description,
        dialect: dialect
            .parse()
            .map_err(|e: crate::dialect::UnknownDialect| MigrateError::InvalidState(e.to_string()))?,
        applied_at: parse_timestamp(&applied_at)?,
        steps: serde_json::from_str(&steps)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::MigrationStep;
    use crate::schema::{PhysicalColumn, PhysicalTable, PhysicalType};
    use sqlx::any::AnyPoolOptions;

    async fn create_test_pool() -> AnyPool {
        sqlx::any::install_default_drivers();
        AnyPoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool")
    }

    fn step(name: &str) -> MigrationStep {
        MigrationStep::create_table(
            &PhysicalTable::new(name)
                .column(PhysicalColumn::new("id", PhysicalType::Integer).not_null())
                .primary_key(vec!["id".to_string()]),
        )
    }

    #[tokio::test]
    async fn test_placeholder_rewrite() {
        let pool = create_test_pool().await;
        let pg = LedgerStore::new(pool.clone(), Dialect::Postgres);
        let mysql = LedgerStore::new(pool, Dialect::MySql);
        assert_eq!(pg.sql("a = ? AND b = ?"), "a = $1 AND b = $2");
        assert_eq!(mysql.sql("a = ? AND b = ?"), "a = ? AND b = ?");
    }

    #[tokio::test]
    async fn test_ensure_tables_is_idempotent() {
        let store = LedgerStore::new(create_test_pool().await, Dialect::Postgres);
        store.ensure_tables().await.unwrap();
        store.ensure_tables().await.unwrap();
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_load_delete() {
        let store = LedgerStore::new(create_test_pool().await, Dialect::Postgres);
        store.ensure_tables().await.unwrap();

        let mut ledger = store.load().await.unwrap();
        let entry = ledger.record(&[step("account")], Utc::now()).unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        store.append(&mut conn, &entry).await.unwrap();
        drop(conn);

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.entries(), ledger.entries());
        assert!(loaded.current_schema().table("account").is_some());

        let mut conn = store.pool().acquire().await.unwrap();
        store.audit(&mut conn, &entry, "bad deploy", Utc::now()).await.unwrap();
        store.delete(&mut conn, entry.sequence).await.unwrap();
        assert!(store.delete(&mut conn, entry.sequence).await.is_err());
        drop(conn);

        assert!(store.load().await.unwrap().is_empty());
        let audit = store.audit_log().await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].reason, "bad deploy");
        assert_eq!(audit[0].migration_id, entry.migration_id);
    }

    #[tokio::test]
    async fn test_progress_checkpoints() {
        let store = LedgerStore::new(create_test_pool().await, Dialect::MySql);
        store.ensure_tables().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();

        for (id, step) in [("m1", 0), ("m1", 1), ("m1", 2), ("m2", 0)] {
            store.begin_statement(&mut conn, id, step, 0).await.unwrap();
        }
        store.mark_statement(&mut conn, "m1", 0, 0).await.unwrap();
        store.mark_statement(&mut conn, "m1", 1, 0).await.unwrap();
        store.mark_statement(&mut conn, "m2", 0, 0).await.unwrap();

        let done = store.completed_statements(&mut conn, "m1").await.unwrap();
        assert_eq!(done, HashSet::from([(0, 0), (1, 0)]));
        let progress = store.statement_progress(&mut conn, "m1").await.unwrap();
        assert_eq!(progress.get(&(2, 0)), Some(&StatementState::Started));

        store.forget_statement(&mut conn, "m1", 2, 0).await.unwrap();
        assert_eq!(store.statement_progress(&mut conn, "m1").await.unwrap().len(), 2);

        store.clear_progress(&mut conn, "m1").await.unwrap();
        assert!(store.completed_statements(&mut conn, "m1").await.unwrap().is_empty());
        assert_eq!(store.completed_statements(&mut conn, "m2").await.unwrap().len(), 1);
    }
}

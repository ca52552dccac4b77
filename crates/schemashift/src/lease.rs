//! Exclusive apply lease.
//!
//! Application is serialized per database by a single row in
//! `schemashift_lease`. Acquiring inserts the row; the primary key makes a
//! second insert fail while the row exists. An expired row is cleared before
//! the insert, so a crashed holder blocks others for at most one TTL.
//!
//! Each [`MigrationLease`] carries a random token stored next to the holder
//! name. Only the instance whose token is in the row can refresh or release
//! it, so two processes configured with the same holder name still exclude
//! each other.

use std::time::Duration;

use chrono::Utc;
use sqlx::AnyConnection;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{MigrateError, Result};
use crate::ledger::LedgerStore;

/// Primary key of the single lease row.
const LEASE_ID: i64 = 1;

/// A lease held (or wanted) by one process.
#[derive(Debug, Clone)]
pub struct MigrationLease {
    holder: String,
    token: String,
    ttl: Duration,
}

impl MigrationLease {
    /// Creates a lease for `holder` lasting `ttl` once acquired.
    #[must_use]
    pub fn new(holder: impl Into<String>, ttl: Duration) -> Self {
        Self {
            holder: holder.into(),
            token: Uuid::new_v4().simple().to_string(),
            ttl,
        }
    }

    /// Identifier of the holder.
    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Token identifying this lease instance.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Takes the lease.
    ///
    /// Re-acquiring a lease this instance already owns refreshes its expiry.
    ///
    /// # Errors
    ///
    /// Returns `LeaseUnavailable` if another instance owns an unexpired
    /// lease, even one with the same holder name.
    pub async fn acquire(&self, store: &LedgerStore, conn: &mut AnyConnection) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let ttl = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = now.saturating_add(ttl);

        sqlx::query(&store.sql(
            "DELETE FROM schemashift_lease WHERE lease_id = ? AND (expires_at < ? OR token = ?)",
        ))
        .bind(LEASE_ID)
        .bind(now)
        .bind(self.token.clone())
        .execute(&mut *conn)
        .await?;

        let inserted = sqlx::query(&store.sql(
            "INSERT INTO schemashift_lease (lease_id, holder, token, expires_at) VALUES (?, ?, ?, ?)",
        ))
        .bind(LEASE_ID)
        .bind(self.holder.clone())
        .bind(self.token.clone())
        .bind(expires_at)
        .execute(&mut *conn)
        .await;

        match inserted {
            Ok(_) => {
                debug!(holder = %self.holder, expires_at, "Acquired migration lease");
                Ok(())
            }
            Err(err) => match current_owner(store, conn).await? {
                Some((holder, token)) if token != self.token => {
                    warn!(holder = %holder, "Migration lease is held by another process");
                    Err(MigrateError::LeaseUnavailable { holder })
                }
                _ => Err(err.into()),
            },
        }
    }

    /// Gives the lease back. Does nothing if this instance does not own it.
    ///
    /// # Errors
    ///
    /// Returns `Database` on failure.
    pub async fn release(&self, store: &LedgerStore, conn: &mut AnyConnection) -> Result<()> {
        sqlx::query(&store.sql("DELETE FROM schemashift_lease WHERE lease_id = ? AND token = ?"))
            .bind(LEASE_ID)
            .bind(self.token.clone())
            .execute(conn)
            .await?;
        debug!(holder = %self.holder, "Released migration lease");
        Ok(())
    }
}

/// Current lease holder, if any.
///
/// # Errors
///
/// Returns `Database` on failure.
pub async fn current_holder(store: &LedgerStore, conn: &mut AnyConnection) -> Result<Option<String>> {
    Ok(current_owner(store, conn).await?.map(|(holder, _)| holder))
}

async fn current_owner(
    store: &LedgerStore,
    conn: &mut AnyConnection,
) -> Result<Option<(String, String)>> {
    let row = sqlx::query_as(&store.sql(
        "SELECT holder, token FROM schemashift_lease WHERE lease_id = ?",
    ))
    .bind(LEASE_ID)
    .fetch_optional(conn)
    .await?;
    Ok(row)
}

//! Migration ledger.
//!
//! The ledger is the append-only record of applied migrations and the only
//! source of truth for the current schema: replaying every entry's steps from
//! an empty schema yields the schema the database should have. [`store`]
//! persists the ledger in the target database.

pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dialect::Dialect;
use crate::emitter::migration_id;
use crate::error::{MigrateError, Result};
use crate::operations::MigrationStep;
use crate::schema::PhysicalSchema;

pub use store::{LedgerStore, StatementState};

/// A record of an applied migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationLedgerEntry {
    /// Position in the ledger, starting at 1.
    pub sequence: i64,
    /// Content hash of the step sequence.
    pub migration_id: String,
    /// Summary of the migration.
    pub description: String,
    /// Dialect the migration was applied with.
    pub dialect: Dialect,
    /// When the migration was applied.
    pub applied_at: DateTime<Utc>,
    /// Steps, kept so the resulting schema can be rebuilt.
    pub steps: Vec<MigrationStep>,
}

impl MigrationLedgerEntry {
    /// Inverse steps of this entry, in execution order.
    ///
    /// # Errors
    ///
    /// Returns `NotReversible` if any step is lossy.
    pub fn reverse_steps(&self) -> Result<Vec<MigrationStep>> {
        self.steps
            .iter()
            .rev()
            .map(|s| {
                s.reverse()
                    .ok_or_else(|| MigrateError::NotReversible(self.migration_id.clone()))
            })
            .collect()
    }
}

/// Summarizes a step list in one line.
fn describe(steps: &[MigrationStep]) -> String {
    match steps {
        [] => String::new(),
        [only] => only.describe(),
        [first, rest @ ..] => format!("{} and {} more", first.describe(), rest.len()),
    }
}

/// In-memory view of the applied history.
#[derive(Debug, Clone)]
pub struct MigrationLedger {
    dialect: Dialect,
    entries: Vec<MigrationLedgerEntry>,
    current: PhysicalSchema,
}

impl MigrationLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            entries: Vec::new(),
            current: PhysicalSchema::empty(dialect),
        }
    }

    /// Rebuilds a ledger from stored entries, replaying their steps.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the entries are out of order, belong to
    /// another dialect, or do not replay cleanly.
    pub fn from_entries(dialect: Dialect, entries: Vec<MigrationLedgerEntry>) -> Result<Self> {
        let mut current = PhysicalSchema::empty(dialect);
        let mut previous: Option<&MigrationLedgerEntry> = None;

        for entry in &entries {
            if entry.dialect != dialect {
                return Err(MigrateError::InvalidState(format!(
                    "Ledger entry {} was applied with {}, not {dialect}",
                    entry.sequence, entry.dialect
                )));
            }
            if let Some(prev) = previous {
                if entry.sequence <= prev.sequence || entry.applied_at < prev.applied_at {
                    return Err(MigrateError::InvalidState(format!(
                        "Ledger entry {} is out of order",
                        entry.sequence
                    )));
                }
            }
            current = current.apply_steps(&entry.steps)?;
            previous = Some(entry);
        }

        Ok(Self {
            dialect,
            entries,
            current,
        })
    }

    /// Dialect of this ledger.
    #[must_use]
    pub const fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Schema resulting from every applied migration.
    #[must_use]
    pub const fn current_schema(&self) -> &PhysicalSchema {
        &self.current
    }

    /// Applied entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> &[MigrationLedgerEntry] {
        &self.entries
    }

    /// Most recent entry.
    #[must_use]
    pub fn last(&self) -> Option<&MigrationLedgerEntry> {
        self.entries.last()
    }

    /// Returns true if nothing has been applied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Prepares the entry for `steps` without recording it.
    ///
    /// # Errors
    ///
    /// Same as [`record`](Self::record).
    pub fn next_entry(
        &self,
        steps: &[MigrationStep],
        applied_at: DateTime<Utc>,
    ) -> Result<(MigrationLedgerEntry, PhysicalSchema)> {
        if steps.is_empty() {
            return Err(MigrateError::InvalidState(
                "Cannot record an empty migration".to_string(),
            ));
        }
        if let Some(last) = self.last() {
            if applied_at < last.applied_at {
                return Err(MigrateError::InvalidState(format!(
                    "Migration applied at {applied_at} predates the last entry ({})",
                    last.applied_at
                )));
            }
        }

        let next = self.current.apply_steps(steps)?;
        let entry = MigrationLedgerEntry {
            sequence: self.last().map_or(1, |e| e.sequence + 1),
            migration_id: migration_id(steps)?,
            description: describe(steps),
            dialect: self.dialect,
            applied_at,
            steps: steps.to_vec(),
        };
        Ok((entry, next))
    }

    /// Appends a migration and advances the current schema.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` for an empty step list, a timestamp earlier than
    /// the last entry, or steps that do not fit the current schema.
    pub fn record(
        &mut self,
        steps: &[MigrationStep],
        applied_at: DateTime<Utc>,
    ) -> Result<MigrationLedgerEntry> {
        let (entry, next) = self.next_entry(steps, applied_at)?;
        self.entries.push(entry.clone());
        self.current = next;
        Ok(entry)
    }

    /// Removes the most recent entry and rewinds the current schema.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the ledger is empty.
    pub fn pop_last(&mut self) -> Result<MigrationLedgerEntry> {
        let entry = self
            .entries
            .pop()
            .ok_or_else(|| MigrateError::InvalidState("Ledger is empty".to_string()))?;
        let mut current = PhysicalSchema::empty(self.dialect);
        for e in &self.entries {
            current = current.apply_steps(&e.steps)?;
        }
        self.current = current;
        Ok(entry)
    }
}

//! Error types for schema translation and migration application.
//!
//! Generation errors (everything up to and including script rendering) are
//! raised before any database is touched. Application errors come from the
//! applier and the ledger store.

use crate::dialect::Dialect;

/// Errors that can occur while generating or applying migrations.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// No type rule is registered for a (logical type, dialect) pair.
    #[error("No {dialect} mapping registered for logical type '{logical_type}'")]
    UnsupportedType {
        /// Logical type tag.
        logical_type: String,
        /// Target dialect.
        dialect: Dialect,
    },

    /// Two logical names encode to the same physical identifier.
    #[error(
        "Identifiers '{first}' and '{second}' both encode to '{physical}' in {dialect} ({scope})"
    )]
    IdentifierCollision {
        /// The identifier that claimed the physical name first.
        first: String,
        /// The identifier that collided with it.
        second: String,
        /// The shared physical identifier.
        physical: String,
        /// Scope in which the collision happened (e.g. `table "user"`).
        scope: String,
        /// Target dialect.
        dialect: Dialect,
    },

    /// A foreign key and the column it references map to different physical types.
    #[error(
        "Foreign key {table}.{column} ({column_type}) does not match \
         {references_table}.{references_column} ({references_type})"
    )]
    TypeMismatch {
        /// Table holding the foreign key.
        table: String,
        /// Source column.
        column: String,
        /// Rendered physical type of the source column.
        column_type: String,
        /// Referenced table.
        references_table: String,
        /// Referenced column.
        references_column: String,
        /// Rendered physical type of the referenced column.
        references_type: String,
    },

    /// A foreign key points at a table or column that does not exist.
    #[error("Foreign key {table}.{column} references missing {references_table}.{references_column}")]
    DanglingReference {
        /// Table holding the foreign key.
        table: String,
        /// Source column.
        column: String,
        /// Referenced table.
        references_table: String,
        /// Referenced column.
        references_column: String,
    },

    /// A constraint cannot be expressed in the target dialect.
    #[error("Unsupported constraint on {table}.{column}: {reason}")]
    UnsupportedConstraint {
        /// Table holding the constraint.
        table: String,
        /// Column the constraint applies to.
        column: String,
        /// Why the constraint was rejected.
        reason: String,
    },

    /// The logical model violates one of its own invariants.
    #[error("Invalid model for table '{table}': {message}")]
    InvalidModel {
        /// Offending table.
        table: String,
        /// What is wrong.
        message: String,
    },

    /// The migration contains lossy steps and the policy forbids them.
    #[error("Migration '{migration}' contains lossy steps: {}", .steps.join(", "))]
    LossyMigrationBlocked {
        /// Migration identifier.
        migration: String,
        /// Descriptions of the lossy steps.
        steps: Vec<String>,
    },

    /// A migration is not reversible.
    #[error("Migration '{0}' is not reversible")]
    NotReversible(String),

    /// Applying a migration failed.
    #[error("Applying migration '{migration}' failed at step {step}: {message}")]
    ApplyFailure {
        /// Migration identifier.
        migration: String,
        /// Index of the failing step.
        step: usize,
        /// Underlying failure.
        message: String,
        /// Whether the failure is transient and the apply may be retried.
        retryable: bool,
    },

    /// Applying or rolling back did not finish within the caller's timeout.
    #[error("Migration '{migration}' timed out after {elapsed_ms} ms")]
    Timeout {
        /// Migration identifier.
        migration: String,
        /// Configured timeout, in milliseconds.
        elapsed_ms: u128,
    },

    /// Another process holds the migration lease.
    #[error("Migration lease is held by '{holder}'")]
    LeaseUnavailable {
        /// Current lease holder.
        holder: String,
    },

    /// Invalid migration state.
    #[error("Invalid migration state: {0}")]
    InvalidState(String),

    /// Database error outside of a migration step.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MigrateError {
    /// Returns true if the operation may succeed when retried.
    ///
    /// Only transient connectivity problems qualify. DDL-semantic failures
    /// (constraint violations, syntax errors) are never retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ApplyFailure { retryable, .. } => *retryable,
            Self::LeaseUnavailable { .. } | Self::Timeout { .. } => true,
            Self::Database(err) => is_transient(err),
            _ => false,
        }
    }

    /// Returns true for errors raised during generation, before any database
    /// work.
    #[must_use]
    pub fn is_generation_error(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedType { .. }
                | Self::IdentifierCollision { .. }
                | Self::TypeMismatch { .. }
                | Self::DanglingReference { .. }
                | Self::UnsupportedConstraint { .. }
                | Self::InvalidModel { .. }
                | Self::LossyMigrationBlocked { .. }
        )
    }

    pub(crate) fn invalid_model(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidModel {
            table: table.into(),
            message: message.into(),
        }
    }

    pub(crate) fn apply_failure(migration: &str, step: usize, err: &sqlx::Error) -> Self {
        Self::ApplyFailure {
            migration: migration.to_string(),
            step,
            message: err.to_string(),
            retryable: is_transient(err),
        }
    }
}

/// Connectivity-level sqlx errors that are worth retrying.
pub(crate) fn is_transient(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

/// Errors a DDL statement raises when its effect is already in place: the
/// object it creates exists, or the object it drops is gone.
///
/// Matched on SQLSTATE for MySQL and Postgres, and on the message otherwise.
pub(crate) fn is_already_applied(err: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db) = err else {
        return false;
    };
    let by_code = db.code().is_some_and(|code| {
        matches!(
            code.as_ref(),
            "42S01" | "42S02" | "42S21" | "42S22" | "42P07" | "42P01" | "42701" | "42703" | "42704" | "42710"
        )
    });
    let message = db.message().to_lowercase();
    by_code
        || [
            "already exists",
            "duplicate column",
            "duplicate key name",
            "no such table",
            "no such column",
            "does not exist",
            "doesn't exist",
            "check that column/key exists",
        ]
        .iter()
        .any(|needle| message.contains(needle))
}

/// Result type for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_errors_are_not_retryable() {
        let err = MigrateError::TypeMismatch {
            table: "item".to_string(),
            column: "owner_id".to_string(),
            column_type: "VARCHAR(36)".to_string(),
            references_table: "user".to_string(),
            references_column: "id".to_string(),
            references_type: "UUID".to_string(),
        };
        assert!(err.is_generation_error());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("item.owner_id (VARCHAR(36))"));
    }

    #[test]
    fn test_transient_database_errors_are_retryable() {
        assert!(MigrateError::Database(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!MigrateError::Database(sqlx::Error::RowNotFound).is_retryable());
    }

    #[test]
    fn test_apply_failure_keeps_step_index() {
        let err = MigrateError::apply_failure("abc", 3, &sqlx::Error::PoolClosed);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("step 3"));
    }

    #[test]
    fn test_only_database_errors_count_as_already_applied() {
        assert!(!is_already_applied(&sqlx::Error::RowNotFound));
        assert!(!is_already_applied(&sqlx::Error::PoolTimedOut));
    }
}

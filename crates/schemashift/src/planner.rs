//! Migration planning.
//!
//! Compiles a logical schema, diffs it against the current physical schema
//! and renders the result. Planning never touches a database; any number of
//! planners can share one compiler.

use std::sync::Arc;

use tracing::info;

use crate::compiler::SchemaCompiler;
use crate::dialect::Dialect;
use crate::differ::diff;
use crate::emitter::{LossyPolicy, MigrationScript, ScriptEmitter};
use crate::error::{MigrateError, Result};
use crate::logical::LogicalSchema;
use crate::operations::MigrationStep;
use crate::schema::PhysicalSchema;

/// A generated migration, ready to apply.
#[derive(Debug, Clone)]
pub struct PlannedMigration {
    /// Ordered steps.
    pub steps: Vec<MigrationStep>,
    /// Rendered forward and reverse DDL.
    pub script: MigrationScript,
    /// Schema the database will have after applying the steps.
    pub target: Arc<PhysicalSchema>,
    /// Fingerprint of the schema the steps were computed against.
    pub base_fingerprint: String,
}

impl PlannedMigration {
    /// Returns true if the database is already up to date.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Migration identifier.
    #[must_use]
    pub fn migration_id(&self) -> &str {
        &self.script.migration_id
    }

    /// Dialect the migration was generated for.
    #[must_use]
    pub const fn dialect(&self) -> Dialect {
        self.script.dialect
    }
}

/// Plans migrations from logical schemas.
#[derive(Debug, Clone)]
pub struct MigrationPlanner {
    compiler: Arc<SchemaCompiler>,
    policy: LossyPolicy,
}

impl Default for MigrationPlanner {
    fn default() -> Self {
        Self::new(Arc::new(SchemaCompiler::default()))
    }
}

impl MigrationPlanner {
    /// Creates a planner sharing `compiler`.
    #[must_use]
    pub fn new(compiler: Arc<SchemaCompiler>) -> Self {
        Self {
            compiler,
            policy: LossyPolicy::default(),
        }
    }

    /// Sets the lossy policy.
    #[must_use]
    pub const fn lossy_policy(mut self, policy: LossyPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The compiler used by this planner.
    #[must_use]
    pub fn compiler(&self) -> &SchemaCompiler {
        &self.compiler
    }

    /// Generates the migration from `current` to `logical` compiled for
    /// `dialect`.
    ///
    /// # Errors
    ///
    /// Returns any generation error, or `InvalidState` if `current` belongs to
    /// another dialect.
    pub fn generate(
        &self,
        logical: &LogicalSchema,
        dialect: Dialect,
        current: &PhysicalSchema,
    ) -> Result<PlannedMigration> {
        if current.dialect() != dialect {
            return Err(MigrateError::InvalidState(format!(
                "Current schema is {} but {dialect} was requested",
                current.dialect()
            )));
        }

        let target = self.compiler.compile(logical, dialect)?;
        let steps = diff(current, &target)?;
        let script = ScriptEmitter::new(dialect)
            .lossy_policy(self.policy)
            .render(&steps)?;

        info!(
            dialect = %dialect,
            migration = %script.migration_id,
            steps = steps.len(),
            reversible = script.is_reversible(),
            "Planned migration"
        );

        Ok(PlannedMigration {
            steps,
            script,
            target,
            base_fingerprint: current.fingerprint(),
        })
    }
}

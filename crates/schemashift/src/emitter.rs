//! Migration script rendering.
//!
//! Renders migration steps as dialect DDL in both directions. The reverse
//! script undoes the forward one step by step in reverse order. Lossy steps
//! have no reverse; they are kept in the reverse script as an explicit
//! `-- IRREVERSIBLE` marker instead of DDL that would pretend to restore the
//! discarded data.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::dialect::Dialect;
use crate::error::{MigrateError, Result};
use crate::operations::MigrationStep;

/// Content hash identifying an ordered step sequence.
///
/// # Errors
///
/// Returns `Serialization` if the steps cannot be encoded.
pub fn migration_id(steps: &[MigrationStep]) -> Result<String> {
    let json = serde_json::to_vec(steps)?;
    Ok(hex::encode(Sha256::digest(&json)))
}

/// One rendered step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedStep {
    /// Migration the step belongs to.
    pub migration_id: String,
    /// Position of the forward step this renders (or undoes).
    pub index: usize,
    /// Human-readable description.
    pub description: String,
    /// DDL statements, executed in order.
    pub statements: Vec<String>,
}

/// One entry of the reverse script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReverseStep {
    /// The step can be undone by running these statements.
    Reversible(RenderedStep),
    /// The step discarded data and cannot be undone.
    Irreversible {
        /// Migration the step belongs to.
        migration_id: String,
        /// Position of the forward step.
        index: usize,
        /// Description of the forward step.
        description: String,
    },
}

impl ReverseStep {
    /// Position of the forward step this entry undoes.
    #[must_use]
    pub const fn index(&self) -> usize {
        match self {
            Self::Reversible(step) => step.index,
            Self::Irreversible { index, .. } => *index,
        }
    }
}

/// Forward and reverse DDL for one migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationScript {
    /// Content hash of the step sequence.
    pub migration_id: String,
    /// Dialect the script was rendered for.
    pub dialect: Dialect,
    /// Forward steps in execution order.
    pub forward: Vec<RenderedStep>,
    /// Reverse steps in execution order (last forward step first).
    pub reverse: Vec<ReverseStep>,
}

impl MigrationScript {
    /// Returns true if the migration has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Whether every step can be undone.
    #[must_use]
    pub fn is_reversible(&self) -> bool {
        self.reverse
            .iter()
            .all(|s| matches!(s, ReverseStep::Reversible(_)))
    }

    /// Descriptions of the steps that cannot be undone.
    #[must_use]
    pub fn lossy_steps(&self) -> Vec<String> {
        self.reverse
            .iter()
            .filter_map(|s| match s {
                ReverseStep::Irreversible { description, .. } => Some(description.clone()),
                ReverseStep::Reversible(_) => None,
            })
            .collect()
    }

    /// Forward statements, flattened.
    #[must_use]
    pub fn forward_statements(&self) -> Vec<&str> {
        self.forward
            .iter()
            .flat_map(|s| s.statements.iter().map(String::as_str))
            .collect()
    }

    /// Reverse statements, flattened.
    ///
    /// # Errors
    ///
    /// Returns `NotReversible` if any step cannot be undone.
    pub fn reverse_statements(&self) -> Result<Vec<&str>> {
        if !self.is_reversible() {
            return Err(MigrateError::NotReversible(self.migration_id.clone()));
        }
        Ok(self
            .reverse
            .iter()
            .filter_map(|s| match s {
                ReverseStep::Reversible(step) => Some(step.statements.iter().map(String::as_str)),
                ReverseStep::Irreversible { .. } => None,
            })
            .flatten()
            .collect())
    }

    /// Forward script as SQL text.
    #[must_use]
    pub fn forward_sql(&self) -> String {
        let mut out = String::new();
        for step in &self.forward {
            write_step(&mut out, step);
        }
        out
    }

    /// Reverse script as SQL text, with irreversible steps marked.
    #[must_use]
    pub fn reverse_sql(&self) -> String {
        let mut out = String::new();
        for entry in &self.reverse {
            match entry {
                ReverseStep::Reversible(step) => write_step(&mut out, step),
                ReverseStep::Irreversible {
                    index, description, ..
                } => {
                    out.push_str(&format!("-- IRREVERSIBLE: step {index}: {description}\n\n"));
                }
            }
        }
        out
    }
}

fn write_step(out: &mut String, step: &RenderedStep) {
    out.push_str(&format!(
        "-- {} [{}]: {}\n",
        step.migration_id, step.index, step.description
    ));
    for statement in &step.statements {
        out.push_str(statement);
        out.push_str(";\n");
    }
    out.push('\n');
}

/// What to do when a migration contains lossy steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossyPolicy {
    /// Render the migration and log a warning.
    #[default]
    Warn,
    /// Refuse to render the migration.
    Block,
}

/// Renders migration steps for one dialect.
#[derive(Debug, Clone, Copy)]
pub struct ScriptEmitter {
    dialect: Dialect,
    policy: LossyPolicy,
}

impl ScriptEmitter {
    /// Creates an emitter with the default (warn) lossy policy.
    #[must_use]
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            policy: LossyPolicy::default(),
        }
    }

    /// Sets the lossy policy.
    #[must_use]
    pub const fn lossy_policy(mut self, policy: LossyPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Renders `steps` in both directions.
    ///
    /// # Errors
    ///
    /// Returns `LossyMigrationBlocked` when the policy is `Block` and any step
    /// is lossy.
    pub fn render(&self, steps: &[MigrationStep]) -> Result<MigrationScript> {
        let id = migration_id(steps)?;
        let sql = self.dialect.sql();

        let lossy: Vec<String> = steps
            .iter()
            .filter(|s| s.is_lossy())
            .map(MigrationStep::describe)
            .collect();
        if !lossy.is_empty() {
            match self.policy {
                LossyPolicy::Block => {
                    return Err(MigrateError::LossyMigrationBlocked {
                        migration: id,
                        steps: lossy,
                    });
                }
                LossyPolicy::Warn => {
                    warn!(migration = %id, steps = ?lossy, "Migration discards data");
                }
            }
        }

        let forward = steps
            .iter()
            .enumerate()
            .map(|(index, step)| RenderedStep {
                migration_id: id.clone(),
                index,
                description: step.describe(),
                statements: sql.generate_sql(step),
            })
            .collect();

        let reverse = steps
            .iter()
            .enumerate()
            .rev()
            .map(|(index, step)| match step.reverse() {
                Some(inverse) => ReverseStep::Reversible(RenderedStep {
                    migration_id: id.clone(),
                    index,
                    description: inverse.describe(),
                    statements: sql.generate_sql(&inverse),
                }),
                None => ReverseStep::Irreversible {
                    migration_id: id.clone(),
                    index,
                    description: step.describe(),
                },
            })
            .collect();

        Ok(MigrationScript {
            migration_id: id,
            dialect: self.dialect,
            forward,
            reverse,
        })
    }
}

/// Renders `steps` for `dialect` with the default lossy policy.
///
/// # Errors
///
/// See [`ScriptEmitter::render`].
pub fn render(steps: &[MigrationStep], dialect: Dialect) -> Result<MigrationScript> {
    ScriptEmitter::new(dialect).render(steps)
}

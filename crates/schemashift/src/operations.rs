//! Migration steps.
//!
//! This module defines every schema change a migration can contain. Each step
//! carries enough of the physical schema to render both its forward DDL and
//! the DDL of its structural inverse.

use serde::{Deserialize, Serialize};

use crate::schema::{PhysicalColumn, PhysicalForeignKey, PhysicalTable};

/// A single migration step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum MigrationStep {
    /// Create a table, without its foreign keys.
    CreateTable {
        /// Full table definition.
        table: PhysicalTable,
    },

    /// Drop a table. Its foreign keys must already be dropped.
    DropTable {
        /// Definition of the dropped table, for the reverse direction.
        table: PhysicalTable,
    },

    /// Add a column to a table.
    AddColumn {
        /// Table name.
        table: String,
        /// Column definition.
        column: PhysicalColumn,
        /// Set when this replaces a column whose data was not converted.
        #[serde(default)]
        lossy: bool,
    },

    /// Drop a column from a table.
    DropColumn {
        /// Table name.
        table: String,
        /// Definition of the dropped column, for the reverse direction.
        column: PhysicalColumn,
        /// Set when the column's data is discarded as part of a replacement.
        #[serde(default)]
        lossy: bool,
    },

    /// Change a column in place without losing data.
    AlterColumnType {
        /// Table name.
        table: String,
        /// Column before the change.
        from: PhysicalColumn,
        /// Column after the change.
        to: PhysicalColumn,
    },

    /// Add a foreign key constraint.
    AddForeignKey {
        /// Table holding the foreign key.
        table: String,
        /// Constraint definition.
        foreign_key: PhysicalForeignKey,
    },

    /// Drop a foreign key constraint.
    DropForeignKey {
        /// Table holding the foreign key.
        table: String,
        /// Definition of the dropped constraint, for the reverse direction.
        foreign_key: PhysicalForeignKey,
    },
}

impl MigrationStep {
    /// Creates a `CreateTable` step. Foreign keys are stripped; they are
    /// added by separate `AddForeignKey` steps.
    #[must_use]
    pub fn create_table(table: &PhysicalTable) -> Self {
        Self::CreateTable {
            table: table.without_foreign_keys(),
        }
    }

    /// Creates a `DropTable` step.
    #[must_use]
    pub fn drop_table(table: &PhysicalTable) -> Self {
        Self::DropTable {
            table: table.without_foreign_keys(),
        }
    }

    /// Creates an `AddColumn` step.
    #[must_use]
    pub fn add_column(table: impl Into<String>, column: PhysicalColumn) -> Self {
        Self::AddColumn {
            table: table.into(),
            column,
            lossy: false,
        }
    }

    /// Creates a `DropColumn` step.
    #[must_use]
    pub fn drop_column(table: impl Into<String>, column: PhysicalColumn) -> Self {
        Self::DropColumn {
            table: table.into(),
            column,
            lossy: false,
        }
    }

    /// Creates an `AlterColumnType` step.
    #[must_use]
    pub fn alter_column(table: impl Into<String>, from: PhysicalColumn, to: PhysicalColumn) -> Self {
        Self::AlterColumnType {
            table: table.into(),
            from,
            to,
        }
    }

    /// Creates an `AddForeignKey` step.
    #[must_use]
    pub fn add_foreign_key(table: impl Into<String>, foreign_key: PhysicalForeignKey) -> Self {
        Self::AddForeignKey {
            table: table.into(),
            foreign_key,
        }
    }

    /// Creates a `DropForeignKey` step.
    #[must_use]
    pub fn drop_foreign_key(table: impl Into<String>, foreign_key: PhysicalForeignKey) -> Self {
        Self::DropForeignKey {
            table: table.into(),
            foreign_key,
        }
    }

    /// Marks an `AddColumn` or `DropColumn` step as lossy.
    #[must_use]
    pub fn lossy(mut self) -> Self {
        if let Self::AddColumn { ref mut lossy, .. } | Self::DropColumn { ref mut lossy, .. } =
            self
        {
            *lossy = true;
        }
        self
    }

    /// Whether this step discards data that cannot be restored.
    #[must_use]
    pub const fn is_lossy(&self) -> bool {
        matches!(
            self,
            Self::AddColumn { lossy: true, .. } | Self::DropColumn { lossy: true, .. }
        )
    }

    /// Returns the structural inverse, or `None` for lossy steps.
    #[must_use]
    pub fn reverse(&self) -> Option<Self> {
        if self.is_lossy() {
            return None;
        }

        Some(match self {
            Self::CreateTable { table } => Self::DropTable {
                table: table.clone(),
            },
            Self::DropTable { table } => Self::CreateTable {
                table: table.clone(),
            },
            Self::AddColumn { table, column, .. } => Self::drop_column(table, column.clone()),
            Self::DropColumn { table, column, .. } => Self::add_column(table, column.clone()),
            Self::AlterColumnType { table, from, to } => {
                Self::alter_column(table, to.clone(), from.clone())
            }
            Self::AddForeignKey { table, foreign_key } => {
                Self::drop_foreign_key(table, foreign_key.clone())
            }
            Self::DropForeignKey { table, foreign_key } => {
                Self::add_foreign_key(table, foreign_key.clone())
            }
        })
    }

    /// Name of the table this step touches.
    #[must_use]
    pub fn table(&self) -> &str {
        match self {
            Self::CreateTable { table } | Self::DropTable { table } => &table.name,
            Self::AddColumn { table, .. }
            | Self::DropColumn { table, .. }
            | Self::AlterColumnType { table, .. }
            | Self::AddForeignKey { table, .. }
            | Self::DropForeignKey { table, .. } => table,
        }
    }

    /// Human-readable description of this step.
    #[must_use]
    pub fn describe(&self) -> String {
        let lossy = if self.is_lossy() { " (lossy)" } else { "" };
        match self {
            Self::CreateTable { table } => format!("Create table {}", table.name),
            Self::DropTable { table } => format!("Drop table {}", table.name),
            Self::AddColumn { table, column, .. } => {
                format!("Add column {}.{}{lossy}", table, column.name)
            }
            Self::DropColumn { table, column, .. } => {
                format!("Drop column {}.{}{lossy}", table, column.name)
            }
            Self::AlterColumnType { table, from, to } => {
                if from.physical_type == to.physical_type {
                    format!("Alter column {}.{}", table, to.name)
                } else {
                    format!(
                        "Alter column {}.{} from {} to {}",
                        table, to.name, from.physical_type, to.physical_type
                    )
                }
            }
            Self::AddForeignKey { table, foreign_key } => {
                format!("Add foreign key {} on {}", foreign_key.name, table)
            }
            Self::DropForeignKey { table, foreign_key } => {
                format!("Drop foreign key {} on {}", foreign_key.name, table)
            }
        }
    }
}

//! Physical schema representation.
//!
//! These types describe tables as a specific dialect sees them: encoded
//! identifiers, physical column types and named constraints. A
//! [`PhysicalSchema`] is an immutable snapshot; applying a migration step
//! yields a new snapshot.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::dialect::Dialect;
use crate::error::Result;
use crate::logical::ForeignKeyAction;
use crate::operations::MigrationStep;
use crate::state::SchemaState;

/// Physical column types across the supported dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhysicalType {
    /// PostgreSQL 32-bit integer.
    Integer,
    /// MySQL 32-bit integer.
    Int,
    /// Variable-length character string.
    Varchar(u32),
    /// PostgreSQL boolean.
    Boolean,
    /// MySQL small integer with display width.
    TinyInt(u8),
    /// PostgreSQL timestamp without time zone.
    Timestamp,
    /// MySQL datetime with fractional seconds precision.
    DateTime(u8),
    /// PostgreSQL native UUID.
    Uuid,
    /// PostgreSQL exact numeric.
    Numeric(u8, u8),
    /// MySQL exact decimal.
    Decimal(u8, u8),
}

impl PhysicalType {
    /// Returns the SQL type name.
    #[must_use]
    pub fn sql(&self) -> String {
        match self {
            Self::Integer => "INTEGER".to_string(),
            Self::Int => "INT".to_string(),
            Self::Varchar(len) => format!("VARCHAR({len})"),
            Self::Boolean => "BOOLEAN".to_string(),
            Self::TinyInt(width) => format!("TINYINT({width})"),
            Self::Timestamp => "TIMESTAMP".to_string(),
            Self::DateTime(fsp) => format!("DATETIME({fsp})"),
            Self::Uuid => "UUID".to_string(),
            Self::Numeric(p, s) => format!("NUMERIC({p}, {s})"),
            Self::Decimal(p, s) => format!("DECIMAL({p}, {s})"),
        }
    }
}

impl fmt::Display for PhysicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql())
    }
}

/// How the database produces a column value on insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Generation {
    /// Integer identity / auto increment.
    Identity,
    /// Random UUID.
    RandomUuid,
}

/// Schema definition for a physical column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhysicalColumn {
    /// Encoded column name.
    pub name: String,
    /// Physical type.
    pub physical_type: PhysicalType,
    /// Whether the column allows NULL values.
    pub nullable: bool,
    /// Rendered default expression.
    pub default: Option<String>,
    /// Database-side value generation.
    pub generation: Option<Generation>,
    /// Name of the UNIQUE constraint on this column, if any.
    pub unique: Option<String>,
}

impl PhysicalColumn {
    /// Creates a new nullable column.
    #[must_use]
    pub fn new(name: impl Into<String>, physical_type: PhysicalType) -> Self {
        Self {
            name: name.into(),
            physical_type,
            nullable: true,
            default: None,
            generation: None,
            unique: None,
        }
    }

    /// Makes this column NOT NULL.
    #[must_use]
    pub const fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Sets the rendered default expression.
    #[must_use]
    pub fn default(mut self, sql: impl Into<String>) -> Self {
        self.default = Some(sql.into());
        self
    }

    /// Sets database-side generation.
    #[must_use]
    pub const fn generated(mut self, generation: Generation) -> Self {
        self.generation = Some(generation);
        self
    }

    /// Adds a named UNIQUE constraint.
    #[must_use]
    pub fn unique(mut self, constraint: impl Into<String>) -> Self {
        self.unique = Some(constraint.into());
        self
    }

    /// Returns true if only the type differs from `other`.
    #[must_use]
    pub fn same_except_type(&self, other: &Self) -> bool {
        self.name == other.name
            && self.nullable == other.nullable
            && self.default == other.default
            && self.generation == other.generation
            && self.unique == other.unique
    }
}

/// Schema definition for a physical foreign key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PhysicalForeignKey {
    /// Encoded constraint name.
    pub name: String,
    /// Encoded source column.
    pub column: String,
    /// Encoded referenced table.
    pub references_table: String,
    /// Encoded referenced column.
    pub references_column: String,
    /// ON DELETE policy.
    pub on_delete: ForeignKeyAction,
}

/// Schema definition for a physical table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalTable {
    /// Encoded table name.
    pub name: String,
    /// Columns in creation order.
    pub columns: Vec<PhysicalColumn>,
    /// Primary key column names.
    pub primary_key: Vec<String>,
    /// Foreign keys owned by this table.
    pub foreign_keys: Vec<PhysicalForeignKey>,
}

impl PhysicalTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    /// Adds a column.
    #[must_use]
    pub fn column(mut self, column: PhysicalColumn) -> Self {
        self.columns.push(column);
        self
    }

    /// Sets the primary key.
    #[must_use]
    pub fn primary_key(mut self, columns: Vec<String>) -> Self {
        self.primary_key = columns;
        self
    }

    /// Adds a foreign key.
    #[must_use]
    pub fn foreign_key(mut self, fk: PhysicalForeignKey) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    /// Gets a column by name.
    #[must_use]
    pub fn get_column(&self, name: &str) -> Option<&PhysicalColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Gets a mutable column by name.
    pub fn get_column_mut(&mut self, name: &str) -> Option<&mut PhysicalColumn> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    /// Gets a foreign key by constraint name.
    #[must_use]
    pub fn get_foreign_key(&self, name: &str) -> Option<&PhysicalForeignKey> {
        self.foreign_keys.iter().find(|fk| fk.name == name)
    }

    /// Returns a copy of this table without its foreign keys.
    ///
    /// Tables are created bare and their foreign keys added afterwards, so
    /// creation order never depends on references.
    #[must_use]
    pub fn without_foreign_keys(&self) -> Self {
        Self {
            foreign_keys: Vec::new(),
            ..self.clone()
        }
    }

    /// Compares two tables ignoring column and foreign key order.
    #[must_use]
    pub fn structurally_eq(&self, other: &Self) -> bool {
        fn fks(t: &PhysicalTable) -> BTreeSet<&PhysicalForeignKey> {
            t.foreign_keys.iter().collect()
        }

        self.name == other.name
            && self.primary_key == other.primary_key
            && self.columns.len() == other.columns.len()
            && self
                .columns
                .iter()
                .all(|c| other.get_column(&c.name) == Some(c))
            && fks(self) == fks(other)
    }
}

/// An immutable physical schema snapshot for one dialect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalSchema {
    dialect: Dialect,
    tables: BTreeMap<String, PhysicalTable>,
}

impl PhysicalSchema {
    /// Creates a snapshot from a set of tables.
    #[must_use]
    pub fn new(dialect: Dialect, tables: impl IntoIterator<Item = PhysicalTable>) -> Self {
        Self {
            dialect,
            tables: tables.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }

    /// Creates an empty snapshot.
    #[must_use]
    pub fn empty(dialect: Dialect) -> Self {
        Self {
            dialect,
            tables: BTreeMap::new(),
        }
    }

    /// Dialect the snapshot was rendered for.
    #[must_use]
    pub const fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Tables keyed by encoded name.
    #[must_use]
    pub const fn tables(&self) -> &BTreeMap<String, PhysicalTable> {
        &self.tables
    }

    /// Gets a table by encoded name.
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&PhysicalTable> {
        self.tables.get(name)
    }

    /// Returns true if the schema has no tables.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Content fingerprint, used as the snapshot version.
    ///
    /// Structurally equal schemas can have different fingerprints when
    /// column order differs.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.dialect.name().as_bytes());
        // BTreeMap keeps table order stable; serde_json never fails on these types.
        if let Ok(json) = serde_json::to_vec(&self.tables) {
            hasher.update(&json);
        }
        hex::encode(hasher.finalize())
    }

    /// Compares two schemas ignoring column and foreign key order.
    #[must_use]
    pub fn structurally_eq(&self, other: &Self) -> bool {
        self.dialect == other.dialect
            && self.tables.len() == other.tables.len()
            && self.tables.iter().all(|(name, table)| {
                other
                    .tables
                    .get(name)
                    .is_some_and(|o| table.structurally_eq(o))
            })
    }

    /// Returns a new snapshot with `step` applied.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the step does not fit this schema.
    pub fn apply_step(&self, step: &MigrationStep) -> Result<Self> {
        let mut state = SchemaState::from_schema(self.clone());
        state.apply_step(step)?;
        Ok(state.into_schema())
    }

    /// Returns a new snapshot with every step applied in order.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` on the first step that does not fit.
    pub fn apply_steps(&self, steps: &[MigrationStep]) -> Result<Self> {
        let mut state = SchemaState::from_schema(self.clone());
        for step in steps {
            state.apply_step(step)?;
        }
        Ok(state.into_schema())
    }

    pub(crate) fn into_parts(self) -> (Dialect, BTreeMap<String, PhysicalTable>) {
        (self.dialect, self.tables)
    }

    pub(crate) const fn from_parts(
        dialect: Dialect,
        tables: BTreeMap<String, PhysicalTable>,
    ) -> Self {
        Self { dialect, tables }
    }
}

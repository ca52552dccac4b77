//! Constraint resolution.
//!
//! Turns logical relationship declarations into physical key definitions,
//! checking that every foreign key points at an existing key column of the
//! same physical type and that the dialect can honor its `ON DELETE` policy.

use crate::dialect::Dialect;
use crate::error::{MigrateError, Result};
use crate::logical::{ForeignKeyAction, LogicalForeignKey, LogicalTable};
use crate::typemap::TypeMapper;

/// A foreign key that passed every check, still using logical names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedForeignKey {
    /// Source column.
    pub column: String,
    /// Referenced table.
    pub references_table: String,
    /// Referenced column.
    pub references_column: String,
    /// ON DELETE policy, unchanged from the declaration.
    pub on_delete: ForeignKeyAction,
}

/// Key constraints of one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhysicalConstraints {
    /// Primary key columns.
    pub primary_key: Vec<String>,
    /// Checked foreign keys in declaration order.
    pub foreign_keys: Vec<ResolvedForeignKey>,
}

/// Resolves constraints against a set of tables for one dialect.
#[derive(Debug, Clone, Copy)]
pub struct ConstraintResolver<'a> {
    mapper: &'a TypeMapper,
    dialect: Dialect,
}

impl<'a> ConstraintResolver<'a> {
    /// Creates a resolver using `mapper` for type comparisons.
    #[must_use]
    pub const fn new(mapper: &'a TypeMapper, dialect: Dialect) -> Self {
        Self { mapper, dialect }
    }

    /// Resolves the constraints of `table`.
    ///
    /// # Errors
    ///
    /// Returns `DanglingReference`, `TypeMismatch` or `UnsupportedConstraint`
    /// for the first foreign key that fails a check.
    pub fn resolve(
        &self,
        table: &LogicalTable,
        all_tables: &[LogicalTable],
    ) -> Result<PhysicalConstraints> {
        let foreign_keys = table
            .foreign_keys
            .iter()
            .map(|fk| self.resolve_foreign_key(table, fk, all_tables))
            .collect::<Result<Vec<_>>>()?;

        Ok(PhysicalConstraints {
            primary_key: table.primary_key.clone(),
            foreign_keys,
        })
    }

    fn resolve_foreign_key(
        &self,
        table: &LogicalTable,
        fk: &LogicalForeignKey,
        all_tables: &[LogicalTable],
    ) -> Result<ResolvedForeignKey> {
        let dangling = || MigrateError::DanglingReference {
            table: table.name.clone(),
            column: fk.column.clone(),
            references_table: fk.references_table.clone(),
            references_column: fk.references_column.clone(),
        };
        let unsupported = |reason: String| MigrateError::UnsupportedConstraint {
            table: table.name.clone(),
            column: fk.column.clone(),
            reason,
        };

        let source = table.get_column(&fk.column).ok_or_else(dangling)?;
        let referenced_table = all_tables
            .iter()
            .find(|t| t.name == fk.references_table)
            .ok_or_else(dangling)?;
        let referenced = referenced_table
            .get_column(&fk.references_column)
            .ok_or_else(dangling)?;

        if !referenced_table.is_single_primary_key(&referenced.name) && !referenced.unique {
            return Err(unsupported(format!(
                "referenced column {}.{} is neither the primary key nor unique",
                referenced_table.name, referenced.name
            )));
        }

        let source_type = self.mapper.map_type(source.logical_type, self.dialect)?;
        let referenced_type = self.mapper.map_type(referenced.logical_type, self.dialect)?;
        if source_type != referenced_type {
            return Err(MigrateError::TypeMismatch {
                table: table.name.clone(),
                column: source.name.clone(),
                column_type: source_type.sql(),
                references_table: referenced_table.name.clone(),
                references_column: referenced.name.clone(),
                references_type: referenced_type.sql(),
            });
        }

        if !self.dialect.sql().supports_on_delete(fk.on_delete) {
            return Err(unsupported(format!(
                "ON DELETE {} is not supported by {}",
                fk.on_delete.to_sql(),
                self.dialect
            )));
        }

        if fk.on_delete == ForeignKeyAction::SetNull && !source.nullable {
            return Err(unsupported(
                "ON DELETE SET NULL on a NOT NULL column".to_string(),
            ));
        }

        Ok(ResolvedForeignKey {
            column: fk.column.clone(),
            references_table: fk.references_table.clone(),
            references_column: fk.references_column.clone(),
            on_delete: fk.on_delete,
        })
    }
}

/// Resolves the constraints of `table` with the standard type rules.
///
/// # Errors
///
/// See [`ConstraintResolver::resolve`].
pub fn resolve(
    table: &LogicalTable,
    all_tables: &[LogicalTable],
    dialect: Dialect,
) -> Result<PhysicalConstraints> {
    let mapper = TypeMapper::standard();
    ConstraintResolver::new(&mapper, dialect).resolve(table, all_tables)
}

//! Schema state reconstruction.
//!
//! Replays migration steps onto a physical schema, rejecting steps that do
//! not fit the schema they are applied to. The ledger uses this to rebuild
//! the current schema from applied history, and the differ's output is
//! checked against it in tests.

use std::collections::BTreeMap;

use crate::dialect::Dialect;
use crate::error::{MigrateError, Result};
use crate::operations::MigrationStep;
use crate::schema::{PhysicalSchema, PhysicalTable};

/// Mutable working copy of a schema while steps are replayed.
#[derive(Debug)]
pub struct SchemaState {
    dialect: Dialect,
    tables: BTreeMap<String, PhysicalTable>,
}

impl SchemaState {
    /// Creates an empty state.
    #[must_use]
    pub const fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            tables: BTreeMap::new(),
        }
    }

    /// Starts from an existing snapshot.
    #[must_use]
    pub fn from_schema(schema: PhysicalSchema) -> Self {
        let (dialect, tables) = schema.into_parts();
        Self { dialect, tables }
    }

    /// Freezes the state into a snapshot.
    #[must_use]
    pub fn into_schema(self) -> PhysicalSchema {
        PhysicalSchema::from_parts(self.dialect, self.tables)
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut PhysicalTable> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| MigrateError::InvalidState(format!("Table '{name}' does not exist")))
    }

    /// Foreign keys of any table pointing at `table` (and `column`, if given).
    fn referencing(&self, table: &str, column: Option<&str>) -> Option<String> {
        self.tables.values().find_map(|t| {
            t.foreign_keys
                .iter()
                .find(|fk| {
                    fk.references_table == table
                        && column.map_or(true, |c| fk.references_column == c)
                })
                .map(|fk| format!("{}.{}", t.name, fk.name))
        })
    }

    /// Applies a single step.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` when the step does not fit the current state.
    pub fn apply_step(&mut self, step: &MigrationStep) -> Result<()> {
        match step {
            MigrationStep::CreateTable { table } => {
                if self.tables.contains_key(&table.name) {
                    return Err(MigrateError::InvalidState(format!(
                        "Table '{}' already exists",
                        table.name
                    )));
                }
                self.tables.insert(table.name.clone(), table.without_foreign_keys());
            }

            MigrationStep::DropTable { table } => {
                let existing = self.tables.get(&table.name).ok_or_else(|| {
                    MigrateError::InvalidState(format!("Table '{}' does not exist", table.name))
                })?;
                if let Some(fk) = existing.foreign_keys.first() {
                    return Err(MigrateError::InvalidState(format!(
                        "Table '{}' still owns foreign key '{}'",
                        table.name, fk.name
                    )));
                }
                if let Some(fk) = self.referencing(&table.name, None) {
                    return Err(MigrateError::InvalidState(format!(
                        "Table '{}' is still referenced by {fk}",
                        table.name
                    )));
                }
                self.tables.remove(&table.name);
            }

            MigrationStep::AddColumn { table, column, .. } => {
                let t = self.table_mut(table)?;
                if t.get_column(&column.name).is_some() {
                    return Err(MigrateError::InvalidState(format!(
                        "Column '{}' already exists in table '{table}'",
                        column.name
                    )));
                }
                t.columns.push(column.clone());
            }

            MigrationStep::DropColumn { table, column, .. } => {
                if let Some(fk) = self.referencing(table, Some(&column.name)) {
                    return Err(MigrateError::InvalidState(format!(
                        "Column '{table}.{}' is still referenced by {fk}",
                        column.name
                    )));
                }
                let t = self.table_mut(table)?;
                if t.foreign_keys.iter().any(|fk| fk.column == column.name) {
                    return Err(MigrateError::InvalidState(format!(
                        "Column '{table}.{}' still carries a foreign key",
                        column.name
                    )));
                }
                if t.primary_key.contains(&column.name) {
                    return Err(MigrateError::InvalidState(format!(
                        "Column '{table}.{}' is part of the primary key",
                        column.name
                    )));
                }
                let idx = t
                    .columns
                    .iter()
                    .position(|c| c.name == column.name)
                    .ok_or_else(|| {
                        MigrateError::InvalidState(format!(
                            "Column '{}' does not exist in table '{table}'",
                            column.name
                        ))
                    })?;
                t.columns.remove(idx);
            }

            MigrationStep::AlterColumnType { table, from, to } => {
                let t = self.table_mut(table)?;
                let col = t.get_column_mut(&from.name).ok_or_else(|| {
                    MigrateError::InvalidState(format!(
                        "Column '{}' does not exist in table '{table}'",
                        from.name
                    ))
                })?;
                if col != from {
                    return Err(MigrateError::InvalidState(format!(
                        "Column '{table}.{}' does not match the expected definition",
                        from.name
                    )));
                }
                *col = to.clone();
            }

            MigrationStep::AddForeignKey { table, foreign_key } => {
                let target = self.tables.get(&foreign_key.references_table).ok_or_else(|| {
                    MigrateError::InvalidState(format!(
                        "Referenced table '{}' does not exist",
                        foreign_key.references_table
                    ))
                })?;
                if target.get_column(&foreign_key.references_column).is_none() {
                    return Err(MigrateError::InvalidState(format!(
                        "Referenced column '{}.{}' does not exist",
                        foreign_key.references_table, foreign_key.references_column
                    )));
                }
                let t = self.table_mut(table)?;
                if t.get_column(&foreign_key.column).is_none() {
                    return Err(MigrateError::InvalidState(format!(
                        "Column '{}' does not exist in table '{table}'",
                        foreign_key.column
                    )));
                }
                if t.get_foreign_key(&foreign_key.name).is_some() {
                    return Err(MigrateError::InvalidState(format!(
                        "Foreign key '{}' already exists on '{table}'",
                        foreign_key.name
                    )));
                }
                t.foreign_keys.push(foreign_key.clone());
            }

            MigrationStep::DropForeignKey { table, foreign_key } => {
                let t = self.table_mut(table)?;
                let idx = t
                    .foreign_keys
                    .iter()
                    .position(|fk| fk.name == foreign_key.name)
                    .ok_or_else(|| {
                        MigrateError::InvalidState(format!(
                            "Foreign key '{}' does not exist on '{table}'",
                            foreign_key.name
                        ))
                    })?;
                t.foreign_keys.remove(idx);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logical::ForeignKeyAction;
    use crate::schema::{PhysicalColumn, PhysicalForeignKey, PhysicalType};

    fn user() -> PhysicalTable {
        PhysicalTable::new("user")
            .column(PhysicalColumn::new("id", PhysicalType::Varchar(36)).not_null())
            .primary_key(vec!["id".to_string()])
    }

    fn item() -> PhysicalTable {
        PhysicalTable::new("item")
            .column(PhysicalColumn::new("id", PhysicalType::Varchar(36)).not_null())
            .column(PhysicalColumn::new("owner_id", PhysicalType::Varchar(36)))
            .primary_key(vec!["id".to_string()])
    }

    fn fk() -> PhysicalForeignKey {
        PhysicalForeignKey {
            name: "fk_item_owner_id".to_string(),
            column: "owner_id".to_string(),
            references_table: "user".to_string(),
            references_column: "id".to_string(),
            on_delete: ForeignKeyAction::Cascade,
        }
    }

    fn populated() -> SchemaState {
        let mut state = SchemaState::new(Dialect::MySql);
        state.apply_step(&MigrationStep::create_table(&user())).unwrap();
        state.apply_step(&MigrationStep::create_table(&item())).unwrap();
        state
            .apply_step(&MigrationStep::add_foreign_key("item", fk()))
            .unwrap();
        state
    }

    #[test]
    fn test_create_twice_fails() {
        let mut state = populated();
        let err = state.apply_step(&MigrationStep::create_table(&user()));
        assert!(matches!(err, Err(MigrateError::InvalidState(_))));
    }

    #[test]
    fn test_drop_referenced_table_fails() {
        let mut state = populated();
        assert!(state.apply_step(&MigrationStep::drop_table(&user())).is_err());

        state
            .apply_step(&MigrationStep::drop_foreign_key("item", fk()))
            .unwrap();
        state.apply_step(&MigrationStep::drop_table(&user())).unwrap();
        assert!(state.into_schema().table("user").is_none());
    }

    #[test]
    fn test_drop_fk_column_fails() {
        let mut state = populated();
        let owner = PhysicalColumn::new("owner_id", PhysicalType::Varchar(36));
        assert!(state
            .apply_step(&MigrationStep::drop_column("item", owner))
            .is_err());
    }

    #[test]
    fn test_alter_requires_matching_definition() {
        let mut state = populated();
        let wrong = PhysicalColumn::new("owner_id", PhysicalType::Varchar(40));
        let to = PhysicalColumn::new("owner_id", PhysicalType::Varchar(64));
        assert!(state
            .apply_step(&MigrationStep::alter_column("item", wrong, to))
            .is_err());
    }

    #[test]
    fn test_add_fk_to_missing_table_fails() {
        let mut state = SchemaState::new(Dialect::MySql);
        state.apply_step(&MigrationStep::create_table(&item())).unwrap();
        assert!(state
            .apply_step(&MigrationStep::add_foreign_key("item", fk()))
            .is_err());
    }
}

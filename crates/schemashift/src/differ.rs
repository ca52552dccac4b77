//! Schema diffing.
//!
//! Compares a current physical schema against a target and produces the
//! ordered steps that transform one into the other. Steps come out in five
//! groups:
//!
//! 1. foreign key drops (every constraint that goes away or sits on a column
//!    about to change),
//! 2. column changes on tables present in both schemas,
//! 3. table drops, dependents first,
//! 4. table creates, referenced tables first,
//! 5. foreign key additions.
//!
//! Creating tables without their foreign keys and adding the keys last means
//! every referenced table exists before any constraint points at it.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use tracing::debug;

use crate::error::{MigrateError, Result};
use crate::operations::MigrationStep;
use crate::schema::{PhysicalForeignKey, PhysicalSchema, PhysicalTable};
use crate::typemap::is_lossless;

/// Steps grouped by phase, concatenated at the end.
#[derive(Default)]
struct Plan {
    drop_foreign_keys: Vec<MigrationStep>,
    column_changes: Vec<MigrationStep>,
    drop_tables: Vec<MigrationStep>,
    create_tables: Vec<MigrationStep>,
    add_foreign_keys: Vec<MigrationStep>,
}

impl Plan {
    fn into_steps(self) -> Vec<MigrationStep> {
        let mut steps = self.drop_foreign_keys;
        steps.extend(self.column_changes);
        steps.extend(self.drop_tables);
        steps.extend(self.create_tables);
        steps.extend(self.add_foreign_keys);
        steps
    }
}

/// Computes the steps that turn `current` into `target`.
///
/// # Errors
///
/// Returns `InvalidState` when the schemas belong to different dialects, and
/// `UnsupportedConstraint` when a surviving table's primary key changes or a
/// primary key column would have to be replaced.
pub fn diff(current: &PhysicalSchema, target: &PhysicalSchema) -> Result<Vec<MigrationStep>> {
    if current.dialect() != target.dialect() {
        return Err(MigrateError::InvalidState(format!(
            "Cannot diff a {} schema against a {} schema",
            current.dialect(),
            target.dialect()
        )));
    }

    let current_names: BTreeSet<&str> = current.tables().keys().map(String::as_str).collect();
    let target_names: BTreeSet<&str> = target.tables().keys().map(String::as_str).collect();
    let dropped: BTreeSet<&str> = current_names.difference(&target_names).copied().collect();
    let created: BTreeSet<&str> = target_names.difference(&current_names).copied().collect();

    let mut plan = Plan::default();
    // (table, column) pairs whose definition changes; constraints on them are
    // dropped first and restored last.
    let mut touched: HashSet<(String, String)> = HashSet::new();

    for name in current_names.intersection(&target_names) {
        diff_columns(
            &current.tables()[*name],
            &target.tables()[*name],
            &mut plan.column_changes,
            &mut touched,
        )?;
    }

    let mut kept: HashSet<(&str, &PhysicalForeignKey)> = HashSet::new();
    for table in current.tables().values() {
        let target_table = target.table(&table.name);
        for fk in &table.foreign_keys {
            let survives = target_table.is_some_and(|t| t.foreign_keys.contains(fk))
                && !touched.contains(&(table.name.clone(), fk.column.clone()))
                && !touched.contains(&(fk.references_table.clone(), fk.references_column.clone()));
            if survives {
                kept.insert((table.name.as_str(), fk));
            } else {
                plan.drop_foreign_keys
                    .push(MigrationStep::drop_foreign_key(&table.name, fk.clone()));
            }
        }
    }

    for table in target.tables().values() {
        for fk in &table.foreign_keys {
            if !kept.contains(&(table.name.as_str(), fk)) {
                plan.add_foreign_keys
                    .push(MigrationStep::add_foreign_key(&table.name, fk.clone()));
            }
        }
    }

    let mut drop_order = topological(&dropped, current);
    drop_order.reverse();
    plan.drop_tables = drop_order
        .iter()
        .map(|name| MigrationStep::drop_table(&current.tables()[*name]))
        .collect();

    plan.create_tables = topological(&created, target)
        .iter()
        .map(|name| MigrationStep::create_table(&target.tables()[*name]))
        .collect();

    let steps = plan.into_steps();
    debug!(
        dialect = %target.dialect(),
        steps = steps.len(),
        created = created.len(),
        dropped = dropped.len(),
        "Computed schema diff"
    );
    Ok(steps)
}

/// Diffs the columns of a table present in both schemas.
fn diff_columns(
    current: &PhysicalTable,
    target: &PhysicalTable,
    steps: &mut Vec<MigrationStep>,
    touched: &mut HashSet<(String, String)>,
) -> Result<()> {
    let table = &target.name;

    if current.primary_key != target.primary_key {
        return Err(MigrateError::UnsupportedConstraint {
            table: table.clone(),
            column: target.primary_key.join(", "),
            reason: format!(
                "primary key changes from ({}) are not supported",
                current.primary_key.join(", ")
            ),
        });
    }

    for column in &current.columns {
        if target.get_column(&column.name).is_none() {
            touched.insert((table.clone(), column.name.clone()));
            steps.push(MigrationStep::drop_column(table, column.clone()));
        }
    }

    for column in &target.columns {
        let Some(existing) = current.get_column(&column.name) else {
            steps.push(MigrationStep::add_column(table, column.clone()));
            continue;
        };
        if existing == column {
            continue;
        }

        if existing.physical_type != column.physical_type {
            touched.insert((table.clone(), column.name.clone()));
        }

        if is_lossless(existing.physical_type, column.physical_type) {
            steps.push(MigrationStep::alter_column(table, existing.clone(), column.clone()));
        } else if target.primary_key.contains(&column.name) {
            return Err(MigrateError::UnsupportedConstraint {
                table: table.clone(),
                column: column.name.clone(),
                reason: format!(
                    "primary key column cannot be converted from {} to {} without data loss",
                    existing.physical_type, column.physical_type
                ),
            });
        } else {
            steps.push(MigrationStep::drop_column(table, existing.clone()).lossy());
            steps.push(MigrationStep::add_column(table, column.clone()).lossy());
        }
    }

    Ok(())
}

/// Orders `names` so every table comes after the tables it references.
///
/// Only references within `names` count. Ties (and any cycle, which separate
/// foreign key steps make harmless) are broken by name.
fn topological<'a>(names: &BTreeSet<&'a str>, schema: &PhysicalSchema) -> Vec<&'a str> {
    let mut deps: BTreeMap<&str, BTreeSet<&str>> = names
        .iter()
        .map(|&name| {
            let refs = schema.tables()[name]
                .foreign_keys
                .iter()
                .map(|fk| fk.references_table.as_str())
                .filter(|r| *r != name && names.contains(r))
                .collect();
            (name, refs)
        })
        .collect();

    let mut order = Vec::with_capacity(names.len());
    while !deps.is_empty() {
        let ready: Vec<&str> = deps
            .iter()
            .filter(|(_, d)| d.is_empty())
            .map(|(n, _)| *n)
            .collect();
        let batch = if ready.is_empty() {
            // Cycle: take the smallest name and carry on.
            deps.keys().next().copied().into_iter().collect()
        } else {
            ready
        };
        // Emit one at a time so ties resolve by name after each removal.
        let next = batch[0];
        deps.remove(next);
        for d in deps.values_mut() {
            d.remove(next);
        }
        if let Some(&name) = names.get(next) {
            order.push(name);
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::Dialect;
    use crate::logical::ForeignKeyAction;
    use crate::schema::{PhysicalColumn, PhysicalType};

    fn fk(name: &str, column: &str, table: &str) -> PhysicalForeignKey {
        PhysicalForeignKey {
            name: name.to_string(),
            column: column.to_string(),
            references_table: table.to_string(),
            references_column: "id".to_string(),
            on_delete: ForeignKeyAction::NoAction,
        }
    }

    fn table(name: &str) -> PhysicalTable {
        PhysicalTable::new(name)
            .column(PhysicalColumn::new("id", PhysicalType::Int).not_null())
            .primary_key(vec!["id".to_string()])
    }

    fn schema(tables: Vec<PhysicalTable>) -> PhysicalSchema {
        PhysicalSchema::new(Dialect::MySql, tables)
    }

    fn kinds(steps: &[MigrationStep]) -> Vec<String> {
        steps.iter().map(MigrationStep::describe).collect()
    }

    #[test]
    fn test_create_order_follows_references() {
        // c -> b -> a, named so alphabetical order is wrong.
        let a = table("z_root");
        let b = table("m_mid")
            .column(PhysicalColumn::new("root_id", PhysicalType::Int))
            .foreign_key(fk("fk_mid_root", "root_id", "z_root"));
        let c = table("a_leaf")
            .column(PhysicalColumn::new("mid_id", PhysicalType::Int))
            .foreign_key(fk("fk_leaf_mid", "mid_id", "m_mid"));

        let steps = diff(&PhysicalSchema::empty(Dialect::MySql), &schema(vec![a, b, c])).unwrap();
        assert_eq!(
            kinds(&steps),
            vec![
                "Create table z_root",
                "Create table m_mid",
                "Create table a_leaf",
                "Add foreign key fk_leaf_mid on a_leaf",
                "Add foreign key fk_mid_root on m_mid",
            ]
        );
    }

    #[test]
    fn test_drop_order_drops_constraints_first() {
        let parent = table("parent");
        let child = table("child")
            .column(PhysicalColumn::new("parent_id", PhysicalType::Int))
            .foreign_key(fk("fk_child_parent", "parent_id", "parent"));

        let steps = diff(&schema(vec![parent, child]), &PhysicalSchema::empty(Dialect::MySql))
            .unwrap();
        assert_eq!(
            kinds(&steps),
            vec![
                "Drop foreign key fk_child_parent on child",
                "Drop table child",
                "Drop table parent",
            ]
        );
    }

    #[test]
    fn test_cycles_still_terminate() {
        let a = table("a")
            .column(PhysicalColumn::new("b_id", PhysicalType::Int))
            .foreign_key(fk("fk_a_b", "b_id", "b"));
        let b = table("b")
            .column(PhysicalColumn::new("a_id", PhysicalType::Int))
            .foreign_key(fk("fk_b_a", "a_id", "a"));
        let target = schema(vec![a, b]);
        let steps = diff(&PhysicalSchema::empty(Dialect::MySql), &target).unwrap();
        assert_eq!(steps.len(), 4);
        let applied = PhysicalSchema::empty(Dialect::MySql).apply_steps(&steps).unwrap();
        assert!(applied.structurally_eq(&target));
    }

    #[test]
    fn test_lossless_change_is_altered() {
        let before = schema(vec![table("note")
            .column(PhysicalColumn::new("body", PhysicalType::Varchar(100)))]);
        let after = schema(vec![table("note")
            .column(PhysicalColumn::new("body", PhysicalType::Varchar(1000)))]);
        let steps = diff(&before, &after).unwrap();
        assert!(matches!(steps.as_slice(), [MigrationStep::AlterColumnType { .. }]));
    }

    #[test]
    fn test_lossy_change_is_replaced() {
        let before = schema(vec![table("note")
            .column(PhysicalColumn::new("score", PhysicalType::Varchar(255)))]);
        let after = schema(vec![table("note")
            .column(PhysicalColumn::new("score", PhysicalType::Int))]);
        let steps = diff(&before, &after).unwrap();
        assert_eq!(steps.len(), 2);
        assert!(steps.iter().all(MigrationStep::is_lossy));
        assert!(matches!(steps[0], MigrationStep::DropColumn { .. }));
        assert!(matches!(steps[1], MigrationStep::AddColumn { .. }));
    }

    #[test]
    fn test_changed_fk_column_rebuilds_constraint() {
        let parent = table("parent");
        let child = |t: PhysicalType| {
            table("child")
                .column(PhysicalColumn::new("parent_id", t))
                .foreign_key(fk("fk_child_parent", "parent_id", "parent"))
        };
        let before = schema(vec![parent.clone(), child(PhysicalType::Int)]);
        let after = schema(vec![parent, child(PhysicalType::Varchar(20))]);
        let steps = diff(&before, &after).unwrap();
        assert!(matches!(steps.first(), Some(MigrationStep::DropForeignKey { .. })));
        assert!(matches!(steps.last(), Some(MigrationStep::AddForeignKey { .. })));
        assert!(before.apply_steps(&steps).unwrap().structurally_eq(&after));
    }

    #[test]
    fn test_primary_key_change_rejected() {
        let before = schema(vec![table("t").column(PhysicalColumn::new("k", PhysicalType::Int))]);
        let after = schema(vec![table("t")
            .column(PhysicalColumn::new("k", PhysicalType::Int))
            .primary_key(vec!["k".to_string()])]);
        assert!(matches!(
            diff(&before, &after),
            Err(MigrateError::UnsupportedConstraint { .. })
        ));
    }

    #[test]
    fn test_dialect_mismatch_rejected() {
        assert!(matches!(
            diff(
                &PhysicalSchema::empty(Dialect::MySql),
                &PhysicalSchema::empty(Dialect::Postgres)
            ),
            Err(MigrateError::InvalidState(_))
        ));
    }
}

//! Structural properties of the differ across dialects.

mod common;
use common::*;

use schemashift::prelude::*;

fn blog_v1() -> LogicalSchema {
    user_item_schema().table(
        LogicalTable::new("invoice")
            .column(LogicalColumn::new("id", LogicalType::Integer).generated())
            .column(LogicalColumn::new("owner_id", LogicalType::Uuid).not_null())
            .column(LogicalColumn::new("total", LogicalType::decimal(10, 2)))
            .column(LogicalColumn::new("paid", LogicalType::Boolean).default(DefaultValue::Bool(false)))
            .primary_key(["id"])
            .foreign_key(LogicalForeignKey::new("owner_id", "user", "id")),
    )
}

/// Drops `item`, adds `tag`, widens and adds columns, and retypes one
/// column lossily.
fn blog_v2() -> LogicalSchema {
    LogicalSchema::new()
        .table(
            LogicalTable::new("user")
                .column(LogicalColumn::new("id", LogicalType::Uuid))
                .column(LogicalColumn::new("name", LogicalType::text(500)))
                .column(LogicalColumn::new("email", LogicalType::text(320)).unique())
                .primary_key(["id"]),
        )
        .table(
            LogicalTable::new("invoice")
                .column(LogicalColumn::new("id", LogicalType::Integer).generated())
                .column(LogicalColumn::new("owner_id", LogicalType::Uuid).not_null())
                .column(LogicalColumn::new("total", LogicalType::decimal(12, 2)))
                .column(LogicalColumn::new("paid", LogicalType::text(5)))
                .column(LogicalColumn::new("issued_at", LogicalType::Timestamp))
                .primary_key(["id"])
                .foreign_key(
                    LogicalForeignKey::new("owner_id", "user", "id")
                        .on_delete(ForeignKeyAction::Cascade),
                ),
        )
        .table(
            LogicalTable::new("tag")
                .column(LogicalColumn::new("id", LogicalType::Integer).generated())
                .column(LogicalColumn::new("label", LogicalType::text(64)).not_null().unique())
                .primary_key(["id"]),
        )
}

#[test]
fn diff_of_identical_schemas_is_empty() {
    for dialect in Dialect::ALL {
        for schema in [user_item_schema(), blog_v1(), blog_v2()] {
            let physical = compile(&schema, dialect);
            assert!(diff(&physical, &physical).unwrap().is_empty(), "{dialect}");
            assert!(
                diff(&physical, &compile(&schema, dialect)).unwrap().is_empty(),
                "{dialect}: recompiling changed the schema"
            );
        }
    }
}

#[test]
fn forward_then_backward_round_trips() {
    for dialect in Dialect::ALL {
        let a = compile(&blog_v1(), dialect);
        let b = compile(&blog_v2(), dialect);

        let forward = diff(&a, &b).unwrap();
        let reached = a.apply_steps(&forward).unwrap();
        assert!(reached.structurally_eq(&b), "{dialect}: A + diff(A, B) != B");

        let backward = diff(&reached, &a).unwrap();
        let restored = reached.apply_steps(&backward).unwrap();
        assert!(restored.structurally_eq(&a), "{dialect}: round trip did not restore A");
        assert!(diff(&restored, &a).unwrap().is_empty());
    }
}

#[test]
fn every_step_renders_for_every_dialect() {
    for dialect in Dialect::ALL {
        let steps = diff(&compile(&blog_v1(), dialect), &compile(&blog_v2(), dialect)).unwrap();
        let script = ScriptEmitter::new(dialect).render(&steps).unwrap();
        assert_eq!(script.forward.len(), steps.len());
        assert!(script.forward.iter().all(|step| !step.statements.is_empty()));
        assert!(script
            .forward
            .iter()
            .all(|step| step.migration_id == script.migration_id));
    }
}

#[test]
fn migration_id_is_content_addressed() {
    let dialect = Dialect::Postgres;
    let a = compile(&blog_v1(), dialect);
    let b = compile(&blog_v2(), dialect);

    let first = ScriptEmitter::new(dialect).render(&diff(&a, &b).unwrap()).unwrap();
    let second = ScriptEmitter::new(dialect).render(&diff(&a, &b).unwrap()).unwrap();
    let other = ScriptEmitter::new(dialect).render(&diff(&b, &a).unwrap()).unwrap();

    assert_eq!(first.migration_id, second.migration_id);
    assert_ne!(first.migration_id, other.migration_id);
}

#[test]
fn lossless_reverse_restores_through_ledger() {
    let dialect = Dialect::MySql;
    let mut ledger = MigrationLedger::new(dialect);
    let v1 = compile(&user_item_schema(), dialect);
    let steps = diff(ledger.current_schema(), &v1).unwrap();
    let entry = ledger.record(&steps, chrono::Utc::now()).unwrap();
    assert!(ledger.current_schema().structurally_eq(&v1));

    let reverse = entry.reverse_steps().unwrap();
    let emptied = ledger.current_schema().apply_steps(&reverse).unwrap();
    assert!(emptied.is_empty());
}

//! End-to-end generation scenarios: logical model in, ordered DDL out.

mod common;
use common::*;

use schemashift::emitter::ReverseStep;
use schemashift::prelude::*;

// =============================================================================
// Rendering
// =============================================================================

#[test]
fn user_on_mysql_substitutes_uuid() {
    let schema = LogicalSchema::new().table(user());
    let plan = MigrationPlanner::default()
        .generate(&schema, Dialect::MySql, &PhysicalSchema::empty(Dialect::MySql))
        .unwrap();

    assert_eq!(
        plan.script.forward_statements(),
        vec!["CREATE TABLE user (\n  id VARCHAR(36) PRIMARY KEY,\n  name VARCHAR(255)\n)"]
    );
}

#[test]
fn user_on_postgres_is_quoted_and_native() {
    let physical = compile(&LogicalSchema::new().table(user()), Dialect::Postgres);
    let table = physical.table("\"user\"").expect("user is reserved in postgres");
    assert_eq!(
        table.get_column("id").unwrap().physical_type,
        PhysicalType::Uuid
    );
}

#[test]
fn item_foreign_key_cascades() {
    let physical = compile(&user_item_schema(), Dialect::MySql);
    let item = physical.table("item").unwrap();
    assert_eq!(
        item.get_column("owner_id").unwrap().physical_type,
        PhysicalType::Varchar(36)
    );
    assert_eq!(
        physical.table("user").unwrap().get_column("id").unwrap().physical_type,
        PhysicalType::Varchar(36)
    );

    let plan = MigrationPlanner::default()
        .generate(&user_item_schema(), Dialect::MySql, &PhysicalSchema::empty(Dialect::MySql))
        .unwrap();
    let statements = plan.script.forward_statements();
    assert!(statements
        .last()
        .unwrap()
        .ends_with("FOREIGN KEY (owner_id) REFERENCES user(id) ON DELETE CASCADE"));
}

// =============================================================================
// Ordering
// =============================================================================

#[test]
fn referenced_tables_are_created_first() {
    for dialect in Dialect::ALL {
        let steps = diff(
            &PhysicalSchema::empty(dialect),
            &compile(&user_item_schema(), dialect),
        )
        .unwrap();

        let user = encode("user", dialect);
        assert_eq!(steps.len(), 3, "{dialect}");
        assert!(matches!(&steps[0], MigrationStep::CreateTable { table } if table.name == user));
        assert!(matches!(&steps[1], MigrationStep::CreateTable { table } if table.name == "item"));
        assert!(matches!(
            &steps[2],
            MigrationStep::AddForeignKey { table, foreign_key }
                if table == "item" && foreign_key.column == "owner_id"
        ));
    }
}

#[test]
fn dropping_a_referenced_table_drops_constraint_first() {
    let dialect = Dialect::Postgres;
    let steps = diff(
        &compile(&user_item_schema(), dialect),
        &PhysicalSchema::empty(dialect),
    )
    .unwrap();

    assert!(matches!(steps[0], MigrationStep::DropForeignKey { .. }));
    assert!(matches!(&steps[1], MigrationStep::DropTable { table } if table.name == "item"));
    assert!(matches!(&steps[2], MigrationStep::DropTable { table } if table.name == "\"user\""));
}

// =============================================================================
// Lossy changes
// =============================================================================

#[test]
fn text_to_integer_is_irreversible() {
    let dialect = Dialect::Postgres;
    let before = LogicalSchema::new().table(
        LogicalTable::new("account")
            .column(LogicalColumn::new("id", LogicalType::Integer))
            .column(LogicalColumn::new("code", LogicalType::text(255)))
            .primary_key(["id"]),
    );
    let after = LogicalSchema::new().table(
        LogicalTable::new("account")
            .column(LogicalColumn::new("id", LogicalType::Integer))
            .column(LogicalColumn::new("code", LogicalType::Integer))
            .primary_key(["id"]),
    );

    let plan = MigrationPlanner::default()
        .generate(&after, dialect, &compile(&before, dialect))
        .unwrap();

    assert_eq!(plan.steps.len(), 2);
    assert!(plan.steps.iter().all(MigrationStep::is_lossy));
    assert!(!plan.script.is_reversible());
    assert!(plan
        .script
        .reverse
        .iter()
        .all(|step| matches!(step, ReverseStep::Irreversible { .. })));
    assert!(plan.script.reverse_sql().contains("-- IRREVERSIBLE:"));
    assert!(matches!(
        plan.script.reverse_statements(),
        Err(MigrateError::NotReversible(_))
    ));

    let blocked = MigrationPlanner::default()
        .lossy_policy(LossyPolicy::Block)
        .generate(&after, dialect, &compile(&before, dialect));
    assert!(matches!(blocked, Err(MigrateError::LossyMigrationBlocked { .. })));
}

#[test]
fn widening_text_alters_in_place() {
    let dialect = Dialect::MySql;
    let before = LogicalSchema::new().table(user());
    let after = LogicalSchema::new().table(
        LogicalTable::new("user")
            .column(LogicalColumn::new("id", LogicalType::Uuid))
            .column(LogicalColumn::new("name", LogicalType::text(1000)))
            .primary_key(["id"]),
    );

    let plan = MigrationPlanner::default()
        .generate(&after, dialect, &compile(&before, dialect))
        .unwrap();
    assert!(matches!(plan.steps.as_slice(), [MigrationStep::AlterColumnType { .. }]));
    assert!(plan.script.is_reversible());
    assert_eq!(
        plan.script.forward_statements(),
        vec!["ALTER TABLE user MODIFY COLUMN name VARCHAR(1000)"]
    );
}

// =============================================================================
// Validation
// =============================================================================

#[test]
fn mismatched_foreign_key_types_are_rejected() {
    let schema = LogicalSchema::new().table(user()).table(
        LogicalTable::new("item")
            .column(LogicalColumn::new("id", LogicalType::Uuid))
            .column(LogicalColumn::new("owner_id", LogicalType::text(36)))
            .primary_key(["id"])
            .foreign_key(LogicalForeignKey::new("owner_id", "user", "id")),
    );

    // text(36) and uuid only coincide where uuid is substituted.
    assert!(SchemaCompiler::default().compile(&schema, Dialect::MySql).is_ok());
    let err = SchemaCompiler::default()
        .compile(&schema, Dialect::Postgres)
        .unwrap_err();
    assert!(matches!(
        err,
        MigrateError::TypeMismatch { ref table, ref column, .. }
            if table == "item" && column == "owner_id"
    ));
    assert!(err.is_generation_error());
}

#[test]
fn dangling_reference_is_rejected() {
    let schema = LogicalSchema::new().table(item());
    let err = SchemaCompiler::default()
        .compile(&schema, Dialect::MySql)
        .unwrap_err();
    assert!(matches!(
        err,
        MigrateError::DanglingReference { ref references_table, .. } if references_table == "user"
    ));
}

#[test]
fn long_identifiers_encode_deterministically() {
    let name = "customer_relationship_management_synchronisation_checkpoint_history_v2";
    for dialect in Dialect::ALL {
        let first = encode(name, dialect);
        assert_eq!(first, encode(name, dialect));
        assert!(first.len() <= dialect.sql().max_identifier_len());
        assert_ne!(first, name);
    }
}

#[test]
fn schema_file_shape() {
    let json = r#"{
        "tables": [{
            "name": "user",
            "columns": [
                {"name": "id", "logical_type": {"type": "uuid"}, "nullable": false, "generated": true},
                {"name": "name", "logical_type": {"type": "text", "max_len": 255}}
            ],
            "primary_key": ["id"]
        }]
    }"#;
    let schema: LogicalSchema = serde_json::from_str(json).unwrap();
    let physical = compile(&schema, Dialect::Postgres);
    let id = physical.table("\"user\"").unwrap().get_column("id").unwrap();
    assert_eq!(id.physical_type, PhysicalType::Uuid);
    assert!(id.generation.is_some());
}

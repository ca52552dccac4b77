#![allow(dead_code)]

use std::time::Duration;

use schemashift::prelude::*;
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;

/// `User{id: uuid, name: text(255)}`, primary key `id`.
pub fn user() -> LogicalTable {
    LogicalTable::new("user")
        .column(LogicalColumn::new("id", LogicalType::Uuid))
        .column(LogicalColumn::new("name", LogicalType::text(255)))
        .primary_key(["id"])
}

/// `Item{id: uuid, owner_id: uuid -> User.id ON DELETE CASCADE}`.
pub fn item() -> LogicalTable {
    LogicalTable::new("item")
        .column(LogicalColumn::new("id", LogicalType::Uuid))
        .column(LogicalColumn::new("owner_id", LogicalType::Uuid).not_null())
        .primary_key(["id"])
        .foreign_key(
            LogicalForeignKey::new("owner_id", "user", "id").on_delete(ForeignKeyAction::Cascade),
        )
}

/// Item is listed first so ordering has to come from the references.
pub fn user_item_schema() -> LogicalSchema {
    LogicalSchema::new().table(item()).table(user())
}

/// A table with no foreign keys, generation or defaults, so its DDL runs on
/// SQLite unchanged.
pub fn plain_table(name: &str) -> LogicalTable {
    LogicalTable::new(name)
        .column(LogicalColumn::new("id", LogicalType::Uuid))
        .column(LogicalColumn::new("label", LogicalType::text(100)).not_null())
        .primary_key(["id"])
}

pub fn plain_schema(names: &[&str]) -> LogicalSchema {
    names
        .iter()
        .fold(LogicalSchema::new(), |schema, name| schema.table(plain_table(name)))
}

pub fn compile(schema: &LogicalSchema, dialect: Dialect) -> PhysicalSchema {
    SchemaCompiler::default()
        .compile_uncached(schema, dialect)
        .unwrap_or_else(|e| panic!("Failed to compile for {dialect}: {e}"))
}

pub async fn sqlite_pool() -> AnyPool {
    sqlx::any::install_default_drivers();
    AnyPoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool")
}

pub fn fast_options() -> ApplyOptions {
    ApplyOptions::new()
        .holder("integration-test")
        .max_attempts(2)
        .backoff(Duration::from_millis(1), Duration::from_millis(5))
        .timeout(Duration::from_secs(10))
}

pub async fn table_exists(pool: &AnyPool, name: &str) -> bool {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(name.to_string())
            .fetch_optional(pool)
            .await
            .expect("Failed to query sqlite_master");
    row.is_some()
}

//! PostgreSQL dialect for migrations.
//!
//! PostgreSQL runs DDL inside transactions, so a whole migration can be
//! applied atomically.

use crate::logical::ForeignKeyAction;
use crate::operations::MigrationStep;
use crate::schema::{Generation, PhysicalColumn};

use super::{Dialect, SqlDialect};

/// Reserved key words that cannot be used as unquoted identifiers.
const RESERVED: &[&str] = &[
    "all", "analyse", "analyze", "and", "any", "array", "as", "asc", "asymmetric",
    "authorization", "binary", "both", "case", "cast", "check", "collate", "collation",
    "column", "concurrently", "constraint", "create", "cross", "current_catalog",
    "current_date", "current_role", "current_schema", "current_time", "current_timestamp",
    "current_user", "default", "deferrable", "desc", "distinct", "do", "else", "end",
    "except", "false", "fetch", "for", "foreign", "freeze", "from", "full", "grant",
    "group", "having", "ilike", "in", "initially", "inner", "intersect", "into", "is",
    "isnull", "join", "lateral", "leading", "left", "like", "limit", "localtime",
    "localtimestamp", "natural", "not", "notnull", "null", "offset", "on", "only", "or",
    "order", "outer", "overlaps", "placing", "primary", "references", "returning", "right",
    "select", "session_user", "similar", "some", "symmetric", "system_user", "table",
    "tablesample", "then", "to", "trailing", "true", "union", "unique", "user", "using",
    "variadic", "verbose", "when", "where", "window", "with",
];

/// PostgreSQL migration dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    /// Creates a new PostgreSQL dialect.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Default expression in effect for a column, including generated UUIDs.
    fn effective_default(column: &PhysicalColumn) -> Option<String> {
        match (&column.default, column.generation) {
            (Some(default), _) => Some(default.clone()),
            (None, Some(Generation::RandomUuid)) => Some("gen_random_uuid()".to_string()),
            _ => None,
        }
    }

    /// Generates the statements for an in-place column change.
    fn alter_column_sql(
        &self,
        table: &str,
        from: &PhysicalColumn,
        to: &PhysicalColumn,
    ) -> Vec<String> {
        let column = &to.name;
        let alter = |clause: String| format!("ALTER TABLE {table} ALTER COLUMN {column} {clause}");
        let mut statements = Vec::new();

        if from.unique != to.unique {
            if let Some(ref constraint) = from.unique {
                statements.push(format!("ALTER TABLE {table} DROP CONSTRAINT {constraint}"));
            }
        }

        let was_identity = from.generation == Some(Generation::Identity);
        let is_identity = to.generation == Some(Generation::Identity);
        if was_identity && !is_identity {
            statements.push(alter("DROP IDENTITY IF EXISTS".to_string()));
        }

        let old_default = Self::effective_default(from);
        let new_default = Self::effective_default(to);
        if old_default != new_default && old_default.is_some() {
            statements.push(alter("DROP DEFAULT".to_string()));
        }

        if from.physical_type != to.physical_type {
            let sql_type = to.physical_type.sql();
            statements.push(alter(format!("TYPE {sql_type} USING {column}::{sql_type}")));
        }

        if from.nullable != to.nullable {
            if to.nullable {
                statements.push(alter("DROP NOT NULL".to_string()));
            } else {
                statements.push(alter("SET NOT NULL".to_string()));
            }
        }

        if old_default != new_default {
            if let Some(default) = new_default {
                statements.push(alter(format!("SET DEFAULT {default}")));
            }
        }

        if is_identity && !was_identity {
            statements.push(alter("ADD GENERATED BY DEFAULT AS IDENTITY".to_string()));
        }

        if from.unique != to.unique {
            if let Some(ref constraint) = to.unique {
                statements.push(self.add_unique_sql(table, column, constraint));
            }
        }

        statements
    }
}

impl SqlDialect for PostgresDialect {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn max_identifier_len(&self) -> usize {
        63
    }

    fn folds_unquoted_identifiers(&self) -> bool {
        true
    }

    fn is_reserved(&self, word: &str) -> bool {
        RESERVED.contains(&word)
    }

    fn quote_char(&self) -> char {
        '"'
    }

    fn supports_transactional_ddl(&self) -> bool {
        true
    }

    fn supports_on_delete(&self, _action: ForeignKeyAction) -> bool {
        true
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }

    fn bool_literal(&self, value: bool) -> &'static str {
        if value {
            "TRUE"
        } else {
            "FALSE"
        }
    }

    fn expression_default(&self, expr: &str) -> String {
        expr.to_string()
    }

    fn generation_clause(&self, generation: Generation) -> &'static str {
        match generation {
            Generation::Identity => "GENERATED BY DEFAULT AS IDENTITY",
            Generation::RandomUuid => "DEFAULT gen_random_uuid()",
        }
    }

    fn generate_sql(&self, step: &MigrationStep) -> Vec<String> {
        match step {
            MigrationStep::CreateTable { table } => vec![self.create_table_sql(table)],

            MigrationStep::DropTable { table } => vec![format!("DROP TABLE {}", table.name)],

            MigrationStep::AddColumn { table, column, .. } => {
                let mut statements = vec![format!(
                    "ALTER TABLE {table} ADD COLUMN {}",
                    self.column_definition(column, false)
                )];
                if let Some(ref constraint) = column.unique {
                    statements.push(self.add_unique_sql(table, &column.name, constraint));
                }
                statements
            }

            MigrationStep::DropColumn { table, column, .. } => {
                vec![format!("ALTER TABLE {table} DROP COLUMN {}", column.name)]
            }

            MigrationStep::AlterColumnType { table, from, to } => {
                self.alter_column_sql(table, from, to)
            }

            MigrationStep::AddForeignKey { table, foreign_key } => {
                vec![self.add_foreign_key_sql(table, foreign_key)]
            }

            MigrationStep::DropForeignKey { table, foreign_key } => vec![format!(
                "ALTER TABLE {table} DROP CONSTRAINT {}",
                foreign_key.name
            )],
        }
    }
}

//! MySQL dialect for migrations.
//!
//! MySQL commits implicitly around every DDL statement, so migrations cannot
//! be rolled back as a unit. The applier checkpoints each statement instead.

use crate::logical::ForeignKeyAction;
use crate::operations::MigrationStep;
use crate::schema::{Generation, PhysicalColumn};

use super::{Dialect, SqlDialect};

/// Reserved words that cannot be used as unquoted identifiers.
///
/// `user` is a keyword but not reserved in MySQL.
const RESERVED: &[&str] = &[
    "accessible", "add", "all", "alter", "analyze", "and", "as", "asc", "before", "between",
    "bigint", "binary", "blob", "both", "by", "call", "cascade", "case", "change", "char",
    "character", "check", "collate", "column", "condition", "constraint", "continue",
    "convert", "create", "cross", "cube", "current_date", "current_time",
    "current_timestamp", "current_user", "cursor", "database", "databases", "decimal",
    "declare", "default", "delayed", "delete", "desc", "describe", "distinct", "div",
    "double", "drop", "each", "else", "elseif", "exists", "exit", "explain", "false",
    "fetch", "float", "for", "force", "foreign", "from", "fulltext", "function", "generated",
    "grant", "group", "groups", "having", "if", "ignore", "in", "index", "inner", "inout",
    "insert", "int", "integer", "interval", "into", "is", "iterate", "join", "key", "keys",
    "kill", "lateral", "leading", "leave", "left", "like", "limit", "lines", "load",
    "localtime", "localtimestamp", "lock", "long", "loop", "match", "mod", "natural", "not",
    "null", "numeric", "of", "on", "optimize", "option", "or", "order", "out", "outer",
    "over", "partition", "precision", "primary", "procedure", "range", "rank", "read",
    "real", "recursive", "references", "regexp", "release", "rename", "repeat", "replace",
    "require", "restrict", "return", "revoke", "right", "rlike", "row", "rows", "schema",
    "select", "set", "show", "signal", "smallint", "spatial", "sql", "starting", "system",
    "table", "terminated", "then", "to", "trailing", "trigger", "true", "undo", "union",
    "unique", "unlock", "unsigned", "update", "usage", "use", "using", "values", "varchar",
    "when", "where", "while", "window", "with", "write", "xor", "zerofill",
];

/// MySQL migration dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct MysqlDialect;

impl MysqlDialect {
    /// Creates a new MySQL dialect.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Generates the statements for an in-place column change.
    ///
    /// `MODIFY COLUMN` restates the whole definition, so type, nullability,
    /// default and generation changes collapse into one statement.
    fn alter_column_sql(
        &self,
        table: &str,
        from: &PhysicalColumn,
        to: &PhysicalColumn,
    ) -> Vec<String> {
        let mut statements = Vec::new();

        if from.unique != to.unique {
            if let Some(ref constraint) = from.unique {
                statements.push(format!("ALTER TABLE {table} DROP INDEX {constraint}"));
            }
        }

        let definition_changed = from.physical_type != to.physical_type
            || from.nullable != to.nullable
            || from.default != to.default
            || from.generation != to.generation;
        if definition_changed {
            statements.push(format!(
                "ALTER TABLE {table} MODIFY COLUMN {}",
                self.column_definition(to, false)
            ));
        }

        if from.unique != to.unique {
            if let Some(ref constraint) = to.unique {
                statements.push(self.add_unique_sql(table, &to.name, constraint));
            }
        }

        statements
    }
}

impl SqlDialect for MysqlDialect {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }

    fn max_identifier_len(&self) -> usize {
        64
    }

    fn folds_unquoted_identifiers(&self) -> bool {
        true
    }

    fn is_reserved(&self, word: &str) -> bool {
        RESERVED.contains(&word)
    }

    fn quote_char(&self) -> char {
        '`'
    }

    fn supports_transactional_ddl(&self) -> bool {
        false
    }

    fn supports_on_delete(&self, action: ForeignKeyAction) -> bool {
        // InnoDB parses SET DEFAULT but rejects it when creating the constraint.
        !matches!(action, ForeignKeyAction::SetDefault)
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn bool_literal(&self, value: bool) -> &'static str {
        if value {
            "1"
        } else {
            "0"
        }
    }

    fn string_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
    }

    fn expression_default(&self, expr: &str) -> String {
        let upper = expr.trim().to_ascii_uppercase();
        if upper.starts_with("CURRENT_TIMESTAMP") || upper == "NULL" {
            expr.to_string()
        } else {
            format!("({expr})")
        }
    }

    fn generation_clause(&self, generation: Generation) -> &'static str {
        match generation {
            Generation::Identity => "AUTO_INCREMENT",
            Generation::RandomUuid => "DEFAULT (UUID())",
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
                "ALTER TABLE {table} DROP FOREIGN KEY {}",
                foreign_key.name
            )],
        }
    }
}

//! Database dialect implementations.
//!
//! A [`Dialect`] is the enumerated tag passed to every entry point. Each tag
//! resolves to a [`SqlDialect`] that knows the engine's identifier rules,
//! supported constraints, and how to render migration steps as DDL.

mod mysql;
mod postgres;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use mysql::MysqlDialect;
pub use postgres::PostgresDialect;

use crate::logical::{DefaultValue, ForeignKeyAction};
use crate::operations::MigrationStep;
use crate::schema::{Generation, PhysicalColumn, PhysicalForeignKey, PhysicalTable};

/// Supported target dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// PostgreSQL.
    Postgres,
    /// MySQL (InnoDB).
    MySql,
}

impl Dialect {
    /// Every supported dialect.
    pub const ALL: [Self; 2] = [Self::Postgres, Self::MySql];

    /// Returns the dialect name as used on the command line.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
        }
    }

    /// Returns the SQL generator for this dialect.
    #[must_use]
    pub fn sql(self) -> &'static dyn SqlDialect {
        match self {
            Self::Postgres => &PostgresDialect,
            Self::MySql => &MysqlDialect,
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when parsing an unknown dialect name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown dialect '{0}' (expected 'postgres' or 'mysql')")]
pub struct UnknownDialect(pub String);

impl FromStr for Dialect {
    type Err = UnknownDialect;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "mysql" => Ok(Self::MySql),
            _ => Err(UnknownDialect(s.to_string())),
        }
    }
}

/// Trait for database-specific rules and SQL generation.
///
/// Identifiers handed to the rendering methods are already encoded (folded,
/// truncated and quoted where needed), so implementations splice them in
/// verbatim.
pub trait SqlDialect: Send + Sync {
    /// Returns the tag this implementation belongs to.
    fn dialect(&self) -> Dialect;

    /// Maximum length of an identifier, in bytes.
    fn max_identifier_len(&self) -> usize;

    /// Whether unquoted identifiers are case-insensitive (folded to lower case).
    fn folds_unquoted_identifiers(&self) -> bool;

    /// Whether `word` (lower case) is reserved and must be quoted.
    fn is_reserved(&self, word: &str) -> bool;

    /// Character used to quote identifiers.
    fn quote_char(&self) -> char;

    /// Whether DDL statements participate in transactions.
    fn supports_transactional_ddl(&self) -> bool;

    /// Whether the engine honors the given `ON DELETE` action.
    fn supports_on_delete(&self, action: ForeignKeyAction) -> bool;

    /// Bind parameter placeholder for the 1-based `index`.
    fn placeholder(&self, index: usize) -> String;

    /// Renders a boolean literal.
    fn bool_literal(&self, value: bool) -> &'static str;

    /// Renders a default expression for use after `DEFAULT`.
    fn expression_default(&self, expr: &str) -> String;

    /// Renders the clause that makes the database generate a column value.
    fn generation_clause(&self, generation: Generation) -> &'static str;

    /// Generates SQL for a migration step.
    fn generate_sql(&self, step: &MigrationStep) -> Vec<String>;

    /// Quotes an identifier, doubling any embedded quote characters.
    fn quote_identifier(&self, name: &str) -> String {
        let q = self.quote_char();
        let escaped = name.replace(q, &format!("{q}{q}"));
        format!("{q}{escaped}{q}")
    }

    /// Renders a string literal.
    fn string_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    /// Renders a default value.
    fn default_sql(&self, value: &DefaultValue) -> String {
        match value {
            DefaultValue::Null => "NULL".to_string(),
            DefaultValue::Bool(b) => self.bool_literal(*b).to_string(),
            DefaultValue::Integer(i) => i.to_string(),
            DefaultValue::Text(s) => self.string_literal(s),
            DefaultValue::Expression(expr) => self.expression_default(expr),
        }
    }

    /// Generates a column definition.
    ///
    /// `inline_primary_key` is set for the sole column of a single-column
    /// primary key, which is declared inline rather than as a table constraint.
    fn column_definition(&self, column: &PhysicalColumn, inline_primary_key: bool) -> String {
        let mut parts = vec![column.name.clone(), column.physical_type.sql()];

        if !column.nullable && !inline_primary_key {
            parts.push("NOT NULL".to_string());
        }

        if let Some(ref default) = column.default {
            parts.push(format!("DEFAULT {default}"));
        }

        if let Some(generation) = column.generation {
            parts.push(self.generation_clause(generation).to_string());
        }

        if inline_primary_key {
            parts.push("PRIMARY KEY".to_string());
        }

        parts.join(" ")
    }

    /// Generates the `CREATE TABLE` statement, without foreign keys.
    fn create_table_sql(&self, table: &PhysicalTable) -> String {
        let inline_pk = match table.primary_key.as_slice() {
            [single] => Some(single.as_str()),
            _ => None,
        };

        let mut lines: Vec<String> = table
            .columns
            .iter()
            .map(|c| self.column_definition(c, inline_pk == Some(c.name.as_str())))
            .collect();

        if table.primary_key.len() > 1 {
            lines.push(format!("PRIMARY KEY ({})", table.primary_key.join(", ")));
        }

        for column in &table.columns {
            if let Some(ref constraint) = column.unique {
                lines.push(format!("CONSTRAINT {constraint} UNIQUE ({})", column.name));
            }
        }

        format!("CREATE TABLE {} (\n  {}\n)", table.name, lines.join(",\n  "))
    }

    /// Generates the `ADD CONSTRAINT ... UNIQUE` statement for a column.
    fn add_unique_sql(&self, table: &str, column: &str, constraint: &str) -> String {
        format!("ALTER TABLE {table} ADD CONSTRAINT {constraint} UNIQUE ({column})")
    }

    /// Generates the `ADD CONSTRAINT ... FOREIGN KEY` statement.
    fn add_foreign_key_sql(&self, table: &str, fk: &PhysicalForeignKey) -> String {
        format!(
            "ALTER TABLE {table} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {}({}) ON DELETE {}",
            fk.name,
            fk.column,
            fk.references_table,
            fk.references_column,
            fk.on_delete.to_sql()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dialect() {
        assert_eq!("postgres".parse::<Dialect>().unwrap(), Dialect::Postgres);
        assert_eq!("PostgreSQL".parse::<Dialect>().unwrap(), Dialect::Postgres);
        assert_eq!("mysql".parse::<Dialect>().unwrap(), Dialect::MySql);
        assert!("sqlite".parse::<Dialect>().is_err());
    }

    #[test]
    fn test_dialect_serde_names() {
        assert_eq!(serde_json::to_string(&Dialect::MySql).unwrap(), "\"mysql\"");
        assert_eq!(
            serde_json::from_str::<Dialect>("\"postgres\"").unwrap(),
            Dialect::Postgres
        );
    }

    #[test]
    fn test_quote_identifier_escapes() {
        assert_eq!(Dialect::Postgres.sql().quote_identifier("a\"b"), "\"a\"\"b\"");
        assert_eq!(Dialect::MySql.sql().quote_identifier("a`b"), "`a``b`");
    }

    #[test]
    fn test_default_sql_per_dialect() {
        assert_eq!(Dialect::Postgres.sql().default_sql(&DefaultValue::Bool(true)), "TRUE");
        assert_eq!(Dialect::MySql.sql().default_sql(&DefaultValue::Bool(true)), "1");
        assert_eq!(
            Dialect::Postgres
                .sql()
                .default_sql(&DefaultValue::Text("it's".to_string())),
            "'it''s'"
        );
    }
}

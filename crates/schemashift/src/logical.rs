//! Engine-agnostic schema model.
//!
//! Logical tables are plain immutable values built once per model revision.
//! They describe what the application needs; the compiler turns them into a
//! [`PhysicalSchema`](crate::schema::PhysicalSchema) for a concrete dialect.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{MigrateError, Result};

/// Logical column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogicalType {
    /// 32-bit signed integer.
    Integer,
    /// Bounded text.
    Text {
        /// Maximum length in characters.
        max_len: u32,
    },
    /// Boolean.
    Boolean,
    /// Date and time without time zone.
    Timestamp,
    /// Universally unique identifier.
    Uuid,
    /// Exact decimal number.
    Decimal {
        /// Total number of digits.
        precision: u8,
        /// Digits after the decimal point.
        scale: u8,
    },
}

impl LogicalType {
    /// Shorthand for `Text { max_len }`.
    #[must_use]
    pub const fn text(max_len: u32) -> Self {
        Self::Text { max_len }
    }

    /// Shorthand for `Decimal { precision, scale }`.
    #[must_use]
    pub const fn decimal(precision: u8, scale: u8) -> Self {
        Self::Decimal { precision, scale }
    }

    /// Name of the type without parameters.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Text { .. } => "text",
            Self::Boolean => "boolean",
            Self::Timestamp => "timestamp",
            Self::Uuid => "uuid",
            Self::Decimal { .. } => "decimal",
        }
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text { max_len } => write!(f, "text({max_len})"),
            Self::Decimal { precision, scale } => write!(f, "decimal({precision}, {scale})"),
            other => f.write_str(other.tag()),
        }
    }
}

/// Default value for a column, rendered per dialect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum DefaultValue {
    /// NULL default.
    Null,
    /// Boolean default.
    Bool(bool),
    /// Integer default.
    Integer(i64),
    /// String default.
    Text(String),
    /// Raw SQL expression (e.g., "CURRENT_TIMESTAMP").
    Expression(String),
}

/// Foreign key action (ON DELETE).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForeignKeyAction {
    /// No action (error if referenced row is deleted).
    #[default]
    NoAction,
    /// Restrict (same as NoAction but checked immediately).
    Restrict,
    /// Cascade the delete to referencing rows.
    Cascade,
    /// Set the foreign key column to NULL.
    SetNull,
    /// Set the foreign key column to its default value.
    SetDefault,
}

impl ForeignKeyAction {
    /// Returns the SQL representation of this action.
    #[must_use]
    pub const fn to_sql(self) -> &'static str {
        match self {
            Self::NoAction => "NO ACTION",
            Self::Restrict => "RESTRICT",
            Self::Cascade => "CASCADE",
            Self::SetNull => "SET NULL",
            Self::SetDefault => "SET DEFAULT",
        }
    }
}

/// A column of a logical table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalColumn {
    /// Column name.
    pub name: String,
    /// Logical type.
    pub logical_type: LogicalType,
    /// Whether the column allows NULL values.
    #[serde(default = "default_true")]
    pub nullable: bool,
    /// Default value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<DefaultValue>,
    /// Whether the column carries a UNIQUE constraint.
    #[serde(default)]
    pub unique: bool,
    /// Whether the database generates the value (identity or random UUID).
    #[serde(default)]
    pub generated: bool,
}

const fn default_true() -> bool {
    true
}

impl LogicalColumn {
    /// Creates a nullable column.
    #[must_use]
    pub fn new(name: impl Into<String>, logical_type: LogicalType) -> Self {
        Self {
            name: name.into(),
            logical_type,
            nullable: true,
            default: None,
            unique: false,
            generated: false,
        }
    }

    /// Makes this column NOT NULL.
    #[must_use]
    pub const fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Sets the default value.
    #[must_use]
    pub fn default(mut self, value: DefaultValue) -> Self {
        self.default = Some(value);
        self
    }

    /// Adds a UNIQUE constraint.
    #[must_use]
    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Lets the database generate the value.
    #[must_use]
    pub const fn generated(mut self) -> Self {
        self.generated = true;
        self
    }
}

/// A relationship from one column to a column of another table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalForeignKey {
    /// Source column in the owning table.
    pub column: String,
    /// Referenced table.
    pub references_table: String,
    /// Referenced column.
    pub references_column: String,
    /// ON DELETE policy.
    #[serde(default)]
    pub on_delete: ForeignKeyAction,
}

impl LogicalForeignKey {
    /// Creates a foreign key with `NO ACTION` on delete.
    #[must_use]
    pub fn new(
        column: impl Into<String>,
        references_table: impl Into<String>,
        references_column: impl Into<String>,
    ) -> Self {
        Self {
            column: column.into(),
            references_table: references_table.into(),
            references_column: references_column.into(),
            on_delete: ForeignKeyAction::NoAction,
        }
    }

    /// Sets the ON DELETE policy.
    #[must_use]
    pub const fn on_delete(mut self, action: ForeignKeyAction) -> Self {
        self.on_delete = action;
        self
    }
}

/// A logical table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalTable {
    /// Table name.
    pub name: String,
    /// Columns in declaration order.
    pub columns: Vec<LogicalColumn>,
    /// Primary key column names.
    #[serde(default)]
    pub primary_key: Vec<String>,
    /// Foreign keys declared by this table.
    #[serde(default)]
    pub foreign_keys: Vec<LogicalForeignKey>,
}

impl LogicalTable {
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
    pub fn column(mut self, column: LogicalColumn) -> Self {
        self.columns.push(column);
        self
    }

    /// Sets the primary key.
    #[must_use]
    pub fn primary_key<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a foreign key.
    #[must_use]
    pub fn foreign_key(mut self, fk: LogicalForeignKey) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    /// Gets a column by name.
    #[must_use]
    pub fn get_column(&self, name: &str) -> Option<&LogicalColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Returns true if `column` is the sole primary key column.
    #[must_use]
    pub fn is_single_primary_key(&self, column: &str) -> bool {
        matches!(self.primary_key.as_slice(), [only] if only == column)
    }

    /// Checks the table's own invariants.
    ///
    /// # Errors
    ///
    /// Returns `InvalidModel` for empty or duplicate column names, primary key
    /// columns that do not exist, or malformed type parameters.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(MigrateError::invalid_model("", "table name is empty"));
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            if column.name.is_empty() {
                return Err(MigrateError::invalid_model(&self.name, "column name is empty"));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(MigrateError::invalid_model(
                    &self.name,
                    format!("duplicate column '{}'", column.name),
                ));
            }
            match column.logical_type {
                LogicalType::Text { max_len: 0 } => {
                    return Err(MigrateError::invalid_model(
                        &self.name,
                        format!("column '{}' has text(0)", column.name),
                    ));
                }
                LogicalType::Decimal { precision, scale } if precision == 0 || scale > precision => {
                    return Err(MigrateError::invalid_model(
                        &self.name,
                        format!(
                            "column '{}' has invalid decimal({precision}, {scale})",
                            column.name
                        ),
                    ));
                }
                _ => {}
            }
        }

        let mut pk_seen = HashSet::new();
        for pk in &self.primary_key {
            if !seen.contains(pk.as_str()) {
                return Err(MigrateError::invalid_model(
                    &self.name,
                    format!("primary key column '{pk}' does not exist"),
                ));
            }
            if !pk_seen.insert(pk.as_str()) {
                return Err(MigrateError::invalid_model(
                    &self.name,
                    format!("primary key column '{pk}' listed twice"),
                ));
            }
        }

        Ok(())
    }
}

/// A complete logical schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalSchema {
    /// Tables in declaration order.
    pub tables: Vec<LogicalTable>,
}

impl LogicalSchema {
    /// Creates an empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a table.
    #[must_use]
    pub fn table(mut self, table: LogicalTable) -> Self {
        self.tables.push(table);
        self
    }

    /// Gets a table by name.
    #[must_use]
    pub fn get_table(&self, name: &str) -> Option<&LogicalTable> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Validates every table and rejects duplicate table names.
    ///
    /// # Errors
    ///
    /// Returns the first `InvalidModel` found.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for table in &self.tables {
            table.validate()?;
            if !seen.insert(table.name.as_str()) {
                return Err(MigrateError::invalid_model(&table.name, "duplicate table"));
            }
        }
        Ok(())
    }

    /// SHA-256 of the canonical JSON form, hex encoded.
    ///
    /// Two schemas with the same content hash compile to the same physical
    /// schema for a given dialect.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if the schema cannot be encoded.
    pub fn content_hash(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&json)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> LogicalTable {
        LogicalTable::new("User")
            .column(LogicalColumn::new("id", LogicalType::Uuid).not_null())
            .column(LogicalColumn::new("name", LogicalType::text(255)))
            .primary_key(["id"])
    }

    #[test]
    fn test_validate_rejects_missing_primary_key_column() {
        let table = user().primary_key(["uid"]);
        let err = table.validate().unwrap_err();
        assert!(matches!(err, MigrateError::InvalidModel { ref table, .. } if table == "User"));
    }

    #[test]
    fn test_validate_rejects_duplicate_columns() {
        let table = user().column(LogicalColumn::new("name", LogicalType::Boolean));
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_decimal() {
        let table = LogicalTable::new("price")
            .column(LogicalColumn::new("amount", LogicalType::decimal(2, 4)));
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_content_hash_changes_with_model() {
        let a = LogicalSchema::new().table(user());
        let b = LogicalSchema::new()
            .table(user().column(LogicalColumn::new("email", LogicalType::text(320))));
        assert_eq!(a.content_hash().unwrap(), a.clone().content_hash().unwrap());
        assert_ne!(a.content_hash().unwrap(), b.content_hash().unwrap());
    }

    #[test]
    fn test_schema_json_shape() {
        let json = r#"{
            "tables": [{
                "name": "Item",
                "columns": [
                    {"name": "id", "logical_type": {"type": "uuid"}, "nullable": false},
                    {"name": "price", "logical_type": {"type": "decimal", "precision": 10, "scale": 2}},
                    {"name": "active", "logical_type": {"type": "boolean"},
                     "default": {"kind": "bool", "value": true}}
                ],
                "primary_key": ["id"],
                "foreign_keys": [
                    {"column": "id", "references_table": "User", "references_column": "id",
                     "on_delete": "CASCADE"}
                ]
            }]
        }"#;
        let schema: LogicalSchema = serde_json::from_str(json).unwrap();
        let item = schema.get_table("Item").unwrap();
        assert_eq!(item.columns[1].logical_type, LogicalType::decimal(10, 2));
        assert!(item.columns[1].nullable);
        assert_eq!(item.columns[2].default, Some(DefaultValue::Bool(true)));
        assert_eq!(item.foreign_keys[0].on_delete, ForeignKeyAction::Cascade);
    }

    #[test]
    fn test_logical_type_display() {
        assert_eq!(LogicalType::text(255).to_string(), "text(255)");
        assert_eq!(LogicalType::decimal(10, 2).to_string(), "decimal(10, 2)");
        assert_eq!(LogicalType::Uuid.to_string(), "uuid");
    }
}

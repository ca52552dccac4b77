//! Logical to physical type mapping.
//!
//! Rules are keyed by (dialect, logical type tag). The standard registry
//! covers every logical type for every supported dialect; a dialect without a
//! native equivalent gets a documented substitute instead of a failure.

use std::collections::HashMap;

use crate::dialect::Dialect;
use crate::error::{MigrateError, Result};
use crate::logical::LogicalType;
use crate::schema::{Generation, PhysicalType};

/// Result of mapping a logical type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeMapping {
    /// Physical type in the target dialect.
    pub physical_type: PhysicalType,
    /// Set when the dialect has no native equivalent and a substitute is used.
    pub substitution: Option<&'static str>,
}

impl TypeMapping {
    /// A native mapping.
    #[must_use]
    pub const fn native(physical_type: PhysicalType) -> Self {
        Self {
            physical_type,
            substitution: None,
        }
    }

    /// A substitute mapping with an explanatory note.
    #[must_use]
    pub const fn substitute(physical_type: PhysicalType, note: &'static str) -> Self {
        Self {
            physical_type,
            substitution: Some(note),
        }
    }
}

/// A mapping rule for one (dialect, logical type tag) pair.
pub type TypeRule = fn(LogicalType) -> TypeMapping;

/// Registry of type mapping rules.
#[derive(Clone)]
pub struct TypeMapper {
    rules: HashMap<(Dialect, &'static str), TypeRule>,
}

impl std::fmt::Debug for TypeMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.rules.keys().collect();
        keys.sort();
        f.debug_struct("TypeMapper").field("rules", &keys).finish()
    }
}

impl Default for TypeMapper {
    fn default() -> Self {
        Self::standard()
    }
}

const UUID_AS_VARCHAR: &str = "no native UUID type; stored as canonical hyphenated text";
const BOOLEAN_AS_TINYINT: &str = "BOOLEAN is an alias for TINYINT(1)";

impl TypeMapper {
    /// Creates a mapper with no rules.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// Creates a mapper with the standard rules for every dialect.
    #[must_use]
    pub fn standard() -> Self {
        let mut mapper = Self::empty();

        mapper.register(Dialect::Postgres, "integer", |_| {
            TypeMapping::native(PhysicalType::Integer)
        });
        mapper.register(Dialect::Postgres, "text", |t| {
            TypeMapping::native(PhysicalType::Varchar(text_len(t)))
        });
        mapper.register(Dialect::Postgres, "boolean", |_| {
            TypeMapping::native(PhysicalType::Boolean)
        });
        mapper.register(Dialect::Postgres, "timestamp", |_| {
            TypeMapping::native(PhysicalType::Timestamp)
        });
        mapper.register(Dialect::Postgres, "uuid", |_| {
            TypeMapping::native(PhysicalType::Uuid)
        });
        mapper.register(Dialect::Postgres, "decimal", |t| {
            let (p, s) = decimal_params(t);
            TypeMapping::native(PhysicalType::Numeric(p, s))
        });

        mapper.register(Dialect::MySql, "integer", |_| {
            TypeMapping::native(PhysicalType::Int)
        });
        mapper.register(Dialect::MySql, "text", |t| {
            TypeMapping::native(PhysicalType::Varchar(text_len(t)))
        });
        mapper.register(Dialect::MySql, "boolean", |_| {
            TypeMapping::substitute(PhysicalType::TinyInt(1), BOOLEAN_AS_TINYINT)
        });
        mapper.register(Dialect::MySql, "timestamp", |_| {
            TypeMapping::native(PhysicalType::DateTime(6))
        });
        mapper.register(Dialect::MySql, "uuid", |_| {
            TypeMapping::substitute(PhysicalType::Varchar(36), UUID_AS_VARCHAR)
        });
        mapper.register(Dialect::MySql, "decimal", |t| {
            let (p, s) = decimal_params(t);
            TypeMapping::native(PhysicalType::Decimal(p, s))
        });

        mapper
    }

    /// Registers (or replaces) the rule for a logical type tag.
    pub fn register(&mut self, dialect: Dialect, tag: &'static str, rule: TypeRule) {
        self.rules.insert((dialect, tag), rule);
    }

    /// Maps a logical type, reporting any substitution.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedType` when no rule is registered for the pair.
    pub fn mapping(&self, logical_type: LogicalType, dialect: Dialect) -> Result<TypeMapping> {
        self.rules
            .get(&(dialect, logical_type.tag()))
            .map(|rule| rule(logical_type))
            .ok_or_else(|| MigrateError::UnsupportedType {
                logical_type: logical_type.to_string(),
                dialect,
            })
    }

    /// Maps a logical type to its physical type.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedType` when no rule is registered for the pair.
    pub fn map_type(&self, logical_type: LogicalType, dialect: Dialect) -> Result<PhysicalType> {
        Ok(self.mapping(logical_type, dialect)?.physical_type)
    }

    /// How the database generates values for a logical type.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedType` for types that cannot be generated.
    pub fn generation(&self, logical_type: LogicalType, dialect: Dialect) -> Result<Generation> {
        self.mapping(logical_type, dialect)?;
        match logical_type {
            LogicalType::Integer => Ok(Generation::Identity),
            LogicalType::Uuid => Ok(Generation::RandomUuid),
            other => Err(MigrateError::UnsupportedType {
                logical_type: format!("generated {other}"),
                dialect,
            }),
        }
    }
}

fn text_len(t: LogicalType) -> u32 {
    match t {
        LogicalType::Text { max_len } => max_len,
        _ => 0,
    }
}

fn decimal_params(t: LogicalType) -> (u8, u8) {
    match t {
        LogicalType::Decimal { precision, scale } => (precision, scale),
        _ => (0, 0),
    }
}

/// Decimal digits needed to hold any 32-bit integer.
const INT_DIGITS: u8 = 10;

/// Text length needed to hold any 32-bit integer, sign included.
const INT_TEXT_LEN: u32 = 11;

/// Length of the canonical hyphenated UUID form.
const UUID_TEXT_LEN: u32 = 36;

/// Whether values of `from` always convert to `to` without loss.
#[must_use]
pub fn is_lossless(from: PhysicalType, to: PhysicalType) -> bool {
    use PhysicalType::{
        Boolean, DateTime, Decimal, Int, Integer, Numeric, Timestamp, TinyInt, Uuid, Varchar,
    };

    if from == to {
        return true;
    }

    match (from, to) {
        (Varchar(a), Varchar(b)) => b >= a,
        (Numeric(p1, s1) | Decimal(p1, s1), Numeric(p2, s2) | Decimal(p2, s2)) => {
            s2 >= s1 && p2.saturating_sub(s2) >= p1.saturating_sub(s1)
        }
        (Integer | Int, Numeric(p, s) | Decimal(p, s)) => p.saturating_sub(s) >= INT_DIGITS,
        (Integer | Int, Varchar(n)) => n >= INT_TEXT_LEN,
        (Integer, Int) | (Int, Integer) | (Boolean | TinyInt(1), Integer | Int) => true,
        (Uuid, Varchar(n)) => n >= UUID_TEXT_LEN,
        (Timestamp, DateTime(fsp)) => fsp >= 6,
        (DateTime(_), Timestamp) => true,
        (DateTime(a), DateTime(b)) => b >= a,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_table() {
        let mapper = TypeMapper::standard();
        let cases = [
            (LogicalType::Integer, PhysicalType::Integer, PhysicalType::Int),
            (
                LogicalType::text(255),
                PhysicalType::Varchar(255),
                PhysicalType::Varchar(255),
            ),
            (LogicalType::Boolean, PhysicalType::Boolean, PhysicalType::TinyInt(1)),
            (LogicalType::Timestamp, PhysicalType::Timestamp, PhysicalType::DateTime(6)),
            (LogicalType::Uuid, PhysicalType::Uuid, PhysicalType::Varchar(36)),
            (
                LogicalType::decimal(10, 2),
                PhysicalType::Numeric(10, 2),
                PhysicalType::Decimal(10, 2),
            ),
        ];
        for (logical, pg, mysql) in cases {
            assert_eq!(mapper.map_type(logical, Dialect::Postgres).unwrap(), pg);
            assert_eq!(mapper.map_type(logical, Dialect::MySql).unwrap(), mysql);
        }
    }

    #[test]
    fn test_uuid_substitution_is_reported() {
        let mapper = TypeMapper::standard();
        assert!(mapper
            .mapping(LogicalType::Uuid, Dialect::MySql)
            .unwrap()
            .substitution
            .is_some());
        assert!(mapper
            .mapping(LogicalType::Uuid, Dialect::Postgres)
            .unwrap()
            .substitution
            .is_none());
    }

    #[test]
    fn test_missing_rule_is_unsupported() {
        let err = TypeMapper::empty()
            .map_type(LogicalType::Uuid, Dialect::MySql)
            .unwrap_err();
        assert!(matches!(
            err,
            MigrateError::UnsupportedType { ref logical_type, dialect: Dialect::MySql }
                if logical_type == "uuid"
        ));
    }

    #[test]
    fn test_generation_rules() {
        let mapper = TypeMapper::standard();
        assert_eq!(
            mapper.generation(LogicalType::Integer, Dialect::MySql).unwrap(),
            Generation::Identity
        );
        assert_eq!(
            mapper.generation(LogicalType::Uuid, Dialect::Postgres).unwrap(),
            Generation::RandomUuid
        );
        assert!(mapper.generation(LogicalType::Boolean, Dialect::Postgres).is_err());
    }

    #[test]
    fn test_is_lossless() {
        assert!(is_lossless(PhysicalType::Varchar(100), PhysicalType::Varchar(200)));
        assert!(!is_lossless(PhysicalType::Varchar(200), PhysicalType::Varchar(100)));
        assert!(is_lossless(PhysicalType::Numeric(10, 2), PhysicalType::Numeric(12, 4)));
        assert!(!is_lossless(PhysicalType::Numeric(10, 2), PhysicalType::Numeric(10, 4)));
        assert!(is_lossless(PhysicalType::Int, PhysicalType::Decimal(12, 2)));
        assert!(!is_lossless(PhysicalType::Int, PhysicalType::Decimal(10, 2)));
        assert!(is_lossless(PhysicalType::Int, PhysicalType::Varchar(11)));
        assert!(is_lossless(PhysicalType::Uuid, PhysicalType::Varchar(36)));
        assert!(!is_lossless(PhysicalType::Varchar(255), PhysicalType::Integer));
        assert!(!is_lossless(PhysicalType::Integer, PhysicalType::Boolean));
    }
}

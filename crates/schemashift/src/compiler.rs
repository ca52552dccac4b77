//! Logical to physical schema compilation.
//!
//! The compiler runs the type mapper, identifier encoder and constraint
//! resolver over a whole [`LogicalSchema`] and produces an immutable
//! [`PhysicalSchema`]. Compiled snapshots are cached per (logical content
//! hash, dialect) and shared through `Arc`, so concurrent planners compiling
//! the same model reuse one snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::dialect::Dialect;
use crate::error::{MigrateError, Result};
use crate::identifier::IdentifierScope;
use crate::logical::{LogicalColumn, LogicalSchema, LogicalTable};
use crate::resolver::ConstraintResolver;
use crate::schema::{Generation, PhysicalColumn, PhysicalForeignKey, PhysicalSchema, PhysicalTable};
use crate::typemap::TypeMapper;

/// Encoded names for one table and its columns.
struct EncodedTable {
    name: String,
    columns: HashMap<String, String>,
}

/// Compiles logical schemas and caches the results.
#[derive(Debug)]
pub struct SchemaCompiler {
    mapper: Arc<TypeMapper>,
    cache: DashMap<(String, Dialect), Arc<PhysicalSchema>>,
}

impl Default for SchemaCompiler {
    fn default() -> Self {
        Self::new(Arc::new(TypeMapper::standard()))
    }
}

impl SchemaCompiler {
    /// Creates a compiler using `mapper` for type rules.
    #[must_use]
    pub fn new(mapper: Arc<TypeMapper>) -> Self {
        Self {
            mapper,
            cache: DashMap::new(),
        }
    }

    /// The type mapper used by this compiler.
    #[must_use]
    pub fn mapper(&self) -> &TypeMapper {
        &self.mapper
    }

    /// Compiles `logical` for `dialect`, reusing a cached snapshot if present.
    ///
    /// # Errors
    ///
    /// Returns the first generation error found in the model.
    pub fn compile(&self, logical: &LogicalSchema, dialect: Dialect) -> Result<Arc<PhysicalSchema>> {
        let key = (logical.content_hash()?, dialect);
        if let Some(hit) = self.cache.get(&key) {
            debug!(dialect = %dialect, hash = %key.0, "Compile cache hit");
            return Ok(Arc::clone(hit.value()));
        }

        let compiled = Arc::new(self.compile_uncached(logical, dialect)?);
        // A concurrent compile of the same model may have won the race; both
        // results are identical so either one can be kept.
        let entry = self.cache.entry(key).or_insert_with(|| Arc::clone(&compiled));
        Ok(Arc::clone(entry.value()))
    }

    /// Drops every cached snapshot not built from `current_hash`.
    pub fn evict_stale(&self, current_hash: &str) {
        self.cache.retain(|(hash, _), _| hash == current_hash);
    }

    /// Number of cached snapshots.
    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Compiles `logical` for `dialect` without touching the cache.
    ///
    /// # Errors
    ///
    /// Returns the first generation error found in the model.
    pub fn compile_uncached(&self, logical: &LogicalSchema, dialect: Dialect) -> Result<PhysicalSchema> {
        logical.validate()?;

        let encoded = encode_names(logical, dialect)?;
        let resolver = ConstraintResolver::new(&self.mapper, dialect);
        let mut constraint_scope = IdentifierScope::new(dialect, "constraints");
        let mut tables = Vec::with_capacity(logical.tables.len());

        for table in &logical.tables {
            let names = &encoded[&table.name];
            let mut physical = PhysicalTable::new(&names.name);

            for column in &table.columns {
                let is_pk = table.primary_key.contains(&column.name);
                physical = physical.column(self.compile_column(
                    table,
                    column,
                    is_pk,
                    names,
                    dialect,
                    &mut constraint_scope,
                )?);
            }

            let constraints = resolver.resolve(table, &logical.tables)?;
            physical = physical.primary_key(
                constraints
                    .primary_key
                    .iter()
                    .map(|c| names.columns[c].clone())
                    .collect(),
            );

            for fk in constraints.foreign_keys {
                let target = &encoded[&fk.references_table];
                physical = physical.foreign_key(PhysicalForeignKey {
                    name: constraint_scope.encode_for(
                        &constraint_owner("foreign key", &table.name, &fk.column),
                        &format!("fk_{}_{}", table.name, fk.column),
                    )?,
                    column: names.columns[&fk.column].clone(),
                    references_table: target.name.clone(),
                    references_column: target.columns[&fk.references_column].clone(),
                    on_delete: fk.on_delete,
                });
            }

            check_identity_is_keyed(table, &physical, dialect)?;
            tables.push(physical);
        }

        debug!(dialect = %dialect, tables = tables.len(), "Compiled schema");
        Ok(PhysicalSchema::new(dialect, tables))
    }

    fn compile_column(
        &self,
        table: &LogicalTable,
        column: &LogicalColumn,
        is_pk: bool,
        names: &EncodedTable,
        dialect: Dialect,
        constraint_scope: &mut IdentifierScope,
    ) -> Result<PhysicalColumn> {
        let mapping = self.mapper.mapping(column.logical_type, dialect)?;
        if let Some(note) = mapping.substitution {
            debug!(
                table = %table.name,
                column = %column.name,
                physical_type = %mapping.physical_type,
                note,
                "Substituted physical type"
            );
        }

        let mut physical = PhysicalColumn::new(&names.columns[&column.name], mapping.physical_type);
        if !column.nullable || is_pk {
            physical = physical.not_null();
        }

        if column.generated {
            if column.default.is_some() {
                return Err(MigrateError::invalid_model(
                    &table.name,
                    format!("column '{}' is generated and has a default", column.name),
                ));
            }
            physical = physical.generated(self.mapper.generation(column.logical_type, dialect)?);
        }

        if let Some(ref default) = column.default {
            physical = physical.default(dialect.sql().default_sql(default));
        }

        if column.unique && !table.is_single_primary_key(&column.name) {
            physical = physical.unique(constraint_scope.encode_for(
                &constraint_owner("unique", &table.name, &column.name),
                &format!("uq_{}_{}", table.name, column.name),
            )?);
        }

        Ok(physical)
    }
}

/// Encodes every table name in a schema-wide scope and every column name in a
/// per-table scope.
fn encode_names(logical: &LogicalSchema, dialect: Dialect) -> Result<HashMap<String, EncodedTable>> {
    let mut table_scope = IdentifierScope::new(dialect, "tables");
    let mut encoded = HashMap::with_capacity(logical.tables.len());

    for table in &logical.tables {
        let name = table_scope.encode(&table.name)?;
        let mut column_scope = IdentifierScope::new(dialect, format!("table \"{}\"", table.name));
        let columns = table
            .columns
            .iter()
            .map(|c| Ok((c.name.clone(), column_scope.encode(&c.name)?)))
            .collect::<Result<HashMap<_, _>>>()?;
        encoded.insert(table.name.clone(), EncodedTable { name, columns });
    }

    Ok(encoded)
}

/// Names the (kind, table, column) a constraint belongs to.
fn constraint_owner(kind: &str, table: &str, column: &str) -> String {
    format!("{kind} {table:?}.{column:?}")
}

/// MySQL only accepts `AUTO_INCREMENT` on a column that leads a key.
fn check_identity_is_keyed(
    table: &LogicalTable,
    physical: &PhysicalTable,
    dialect: Dialect,
) -> Result<()> {
    if dialect != Dialect::MySql {
        return Ok(());
    }
    for column in &physical.columns {
        let keyed = physical.primary_key.first() == Some(&column.name) || column.unique.is_some();
        if column.generation == Some(Generation::Identity) && !keyed {
            return Err(MigrateError::UnsupportedConstraint {
                table: table.name.clone(),
                column: column.name.clone(),
                reason: "AUTO_INCREMENT column must lead the primary key or be unique".to_string(),
            });
        }
    }
    Ok(())
}

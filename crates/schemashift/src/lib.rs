//! Cross-dialect schema translation and migration diffing.
//!
//! `schemashift` takes an engine-agnostic table/column/constraint model and:
//! - renders it into dialect-correct physical DDL (PostgreSQL, MySQL),
//! - computes a minimal, ordered set of migration steps between two versions,
//! - validates identifier, type and constraint compatibility before emitting
//!   anything.
//!
//! # Architecture
//!
//! - **Logical model** ([`logical`]) - the engine-agnostic input
//! - **Type mapper** ([`typemap`]) - logical to physical types per dialect
//! - **Identifier encoder** ([`identifier`]) - casing, truncation, quoting
//! - **Constraint resolver** ([`resolver`]) - foreign key compatibility
//! - **Compiler** ([`compiler`]) - logical schema to cached physical snapshot
//! - **Differ** ([`differ`]) - ordered steps between two snapshots
//! - **Emitter** ([`emitter`]) - forward and reverse DDL
//! - **Ledger** ([`ledger`]) - applied history, persisted in the target database
//! - **Applier** ([`applier`]) - leased, all-or-nothing application
//!
//! Generation (compile, diff, render) never touches a database.
//!
//! # Example
//!
//! ```rust
//! use schemashift::prelude::*;
//!
//! let schema = LogicalSchema::new()
//!     .table(
//!         LogicalTable::new("user")
//!             .column(LogicalColumn::new("id", LogicalType::Uuid))
//!             .column(LogicalColumn::new("name", LogicalType::text(255)))
//!             .primary_key(["id"]),
//!     );
//!
//! let plan = MigrationPlanner::default()
//!     .generate(&schema, Dialect::MySql, &PhysicalSchema::empty(Dialect::MySql))
//!     .unwrap();
//! assert_eq!(plan.steps.len(), 1);
//! println!("{}", plan.script.forward_sql());
//! ```
//!
//! # CLI Usage
//!
//! ```bash
//! # Create the bookkeeping tables
//! schemashift --dialect postgres init
//!
//! # Show the DDL that would bring the database to schema.json
//! schemashift --dialect postgres plan --schema schema.json
//!
//! # Apply it
//! schemashift --dialect postgres apply --schema schema.json
//!
//! # Revert the last migration
//! schemashift --dialect postgres rollback --reason "bad deploy"
//! ```

pub mod applier;
pub mod compiler;
pub mod dialect;
pub mod differ;
pub mod emitter;
pub mod error;
pub mod identifier;
pub mod lease;
pub mod ledger;
pub mod logical;
pub mod operations;
pub mod planner;
pub mod resolver;
pub mod schema;
pub mod state;
pub mod typemap;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::applier::{ApplyOptions, MigrationApplier};
    pub use crate::compiler::SchemaCompiler;
    pub use crate::dialect::{Dialect, SqlDialect};
    pub use crate::differ::diff;
    pub use crate::emitter::{LossyPolicy, MigrationScript, ScriptEmitter};
    pub use crate::error::{MigrateError, Result};
    pub use crate::identifier::{encode, IdentifierScope};
    pub use crate::lease::MigrationLease;
    pub use crate::ledger::{LedgerStore, MigrationLedger, MigrationLedgerEntry};
    pub use crate::logical::{
        DefaultValue, ForeignKeyAction, LogicalColumn, LogicalForeignKey, LogicalSchema,
        LogicalTable, LogicalType,
    };
    pub use crate::operations::MigrationStep;
    pub use crate::planner::{MigrationPlanner, PlannedMigration};
    pub use crate::resolver::{ConstraintResolver, PhysicalConstraints};
    pub use crate::schema::{PhysicalColumn, PhysicalSchema, PhysicalTable, PhysicalType};
    pub use crate::typemap::TypeMapper;
}

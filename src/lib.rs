//! Flatbase - Rust Core Engine
//!
//! Embedded, schema-driven data engine over flat files.
//!
//! # Architecture
//!
//! - Schema Layer: declarative database definitions (tables, columns, indexes,
//!   sequences, constraints, triggers, foreign keys, change-log)
//! - Query Layer: typed query objects rendering to and parsing from statements
//! - Index Layer: persisted per-column value -> row id indexes with
//!   commit/rollback
//! - Storage Layer: one JSON data file per table, advisory locking and
//!   optimistic write-conflict detection
//! - Execution Layer: read path and trigger/constraint-checked mutations
//! - Migration Layer: change-log replay

pub mod config;
pub mod error;
pub mod types;

// Schema modules
pub mod changelog;
pub mod registry;
pub mod schema;
pub mod sequence;

// Storage and index modules
pub mod index;
pub mod storage;

// Query modules
pub mod query_ast;
pub mod query_builder;
pub mod query_eval;
pub mod query_executor;
pub mod query_lexer;
pub mod query_parser;
pub mod query_path;

// Trigger and migration modules
pub mod migration;
pub mod triggers;

pub use config::EngineConfig;
pub use error::{DbError, Result};
pub use types::{Row, RowId, RowSet, Value};

// Schema exports
pub use changelog::{compare_versions, ChangeLog, LogAction, LogEntry, LogOp};
pub use registry::SchemaRegistry;
pub use schema::{
    AutoValue, Column, ColumnType, Constraint, Database, Dbms, FireTime, ForeignKey, Function,
    Index, IndexColumn, Table, Trigger, TriggerEvent,
};
pub use sequence::Sequence;

// Index and storage exports
pub use index::{IndexDelta, IndexEntry, IndexManager};
pub use storage::RowStore;

// Query exports
pub use query_ast::{
    AggregateFunction, Assignment, ColumnExpr, ColumnRef, Condition, Direction, Operand, Operator,
    OrderBy, QueryParts, SelectColumn, Statement,
};
pub use query_builder::{
    CountQuery, DeleteQuery, ExistsQuery, InsertQuery, Query, QueryObject, SelectQuery, UpdateQuery,
};
pub use query_executor::{Engine, QueryOutcome, ResultSet};
pub use query_parser::Parser;
pub use query_path::DataPath;

// Trigger and migration exports
pub use migration::{MigrationContext, MigrationReport, Migrator, ReplayHandler};
pub use triggers::{TriggerContext, TriggerHandler, TriggerOutcome, TriggerRegistry};

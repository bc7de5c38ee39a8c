//! Error types for the flatbase engine

use std::path::PathBuf;
use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, DbError>;

/// Every failure the engine reports.
///
/// Definition and query-construction errors are raised synchronously at the
/// offending call; storage, constraint and trigger errors carry enough context
/// (table, row, expression) for the caller to log or recover.
#[derive(Debug, Error)]
pub enum DbError {
    /// A named object (table, column, sequence, index, row, handler) is missing
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// The schema definition is inconsistent
    #[error("Definition error: {0}")]
    Definition(String),

    /// A DBMS tag outside the supported list
    #[error("Unsupported DBMS '{0}'")]
    UnsupportedDbms(String),

    /// A sequence bound or start value outside its range
    #[error("Value {value} out of bounds [{min}, {max}] for sequence '{sequence}'")]
    OutOfBounds {
        sequence: String,
        value: i64,
        min: i64,
        max: i64,
    },

    /// A query object was built with invalid parts
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Statement text could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// A row failed a column check or table constraint
    #[error("Constraint '{expression}' violated on table '{table}' by row {row}")]
    ConstraintViolation {
        table: String,
        expression: String,
        row: String,
    },

    /// A trigger handler raised a failure
    #[error("Trigger '{trigger}' on table '{table}' failed: {reason}")]
    TriggerFailed {
        table: String,
        trigger: String,
        reason: String,
    },

    /// Insert or re-key onto an existing primary key or unique value
    #[error("Duplicate key '{key}' in table '{table}'")]
    DuplicateKey { table: String, key: String },

    /// The table is declared readonly
    #[error("Table '{0}' is readonly")]
    Readonly(String),

    #[error("File '{}' is not readable: {reason}", path.display())]
    NotReadable { path: PathBuf, reason: String },

    #[error("File '{}' is not writeable: {reason}", path.display())]
    NotWriteable { path: PathBuf, reason: String },

    /// The advisory lock stayed held for the whole retry budget
    #[error("File '{}' is locked by another writer", path.display())]
    Locked { path: PathBuf },

    /// Another process wrote the file after we read it
    #[error("Write conflict on '{}': file changed since it was read", path.display())]
    WriteConflict { path: PathBuf },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DbError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        DbError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::NotFound { .. })
    }

    /// Storage-layer failures, which the read path may downgrade to empty results
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            DbError::NotReadable { .. }
                | DbError::NotWriteable { .. }
                | DbError::Locked { .. }
                | DbError::WriteConflict { .. }
                | DbError::Serialization(_)
                | DbError::Io(_)
        )
    }
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for DbError {
    fn from(e: bincode::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}

//! Schema Change-Log
//!
//! Versioned record of structural migrations, kept newest first. Consumers ask
//! for "everything newer than version V for DBMS D" and replay the result
//! oldest first (see `migration`).

use crate::error::{DbError, Result};
use crate::schema::Dbms;
use crate::types::Value;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Closed set of change-log operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogOp {
    Create,
    Rename,
    Drop,
    Update,
    Sql,
    Change,
}

/// Payload of one migration step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogAction {
    /// New table
    Create { table: String },
    /// Rename a table, or one of its columns when `column` is set
    Rename {
        table: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        column: Option<String>,
        to: String,
    },
    /// Drop a table, or one of its columns when `column` is set
    Drop {
        table: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        column: Option<String>,
    },
    /// Set a column to a value on every row matching `condition`
    Update {
        table: String,
        column: String,
        value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        condition: Option<String>,
    },
    /// Raw statement in the query grammar
    Sql { statement: String },
    /// Column parameter changes (`type`, `default`, `nullable`, ...)
    Change {
        table: String,
        column: String,
        params: BTreeMap<String, String>,
    },
}

impl LogAction {
    pub fn op(&self) -> LogOp {
        match self {
            LogAction::Create { .. } => LogOp::Create,
            LogAction::Rename { .. } => LogOp::Rename,
            LogAction::Drop { .. } => LogOp::Drop,
            LogAction::Update { .. } => LogOp::Update,
            LogAction::Sql { .. } => LogOp::Sql,
            LogAction::Change { .. } => LogOp::Change,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub version: String,
    #[serde(default)]
    pub dbms: Dbms,
    #[serde(default)]
    pub ignore_error: bool,
    pub action: LogAction,
}

impl LogEntry {
    pub fn new(version: &str, action: LogAction) -> Self {
        LogEntry {
            version: version.to_string(),
            dbms: Dbms::Generic,
            ignore_error: false,
            action,
        }
    }

    pub fn for_dbms(mut self, dbms: Dbms) -> Self {
        self.dbms = dbms;
        self
    }

    pub fn ignoring_errors(mut self) -> Self {
        self.ignore_error = true;
        self
    }

    /// Whether the entry applies to `dbms`
    pub fn targets(&self, dbms: Dbms) -> bool {
        self.dbms == Dbms::Generic || self.dbms == dbms
    }
}

/// Compare dotted version strings segment by segment.
///
/// Numeric segments compare numerically ("1.10" > "1.9"); anything else
/// compares as text. Missing trailing segments count as zero.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let left: Vec<&str> = a.trim().split('.').collect();
    let right: Vec<&str> = b.trim().split('.').collect();

    for i in 0..left.len().max(right.len()) {
        let l = left.get(i).copied().unwrap_or("0");
        let r = right.get(i).copied().unwrap_or("0");
        let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            _ => l.cmp(r),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Reverse-chronological list of log entries
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeLog {
    entries: Vec<LogEntry>,
}

impl ChangeLog {
    pub fn new() -> Self {
        ChangeLog::default()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn latest_version(&self) -> Option<&str> {
        self.entries.first().map(|e| e.version.as_str())
    }

    /// Record a new step; it must be strictly newer than the current head
    pub fn push(&mut self, entry: LogEntry) -> Result<()> {
        if let Some(latest) = self.latest_version() {
            if compare_versions(&entry.version, latest) != Ordering::Greater {
                return Err(DbError::Definition(format!(
                    "Change-log version {} is not newer than {}",
                    entry.version, latest
                )));
            }
        }
        self.entries.insert(0, entry);
        Ok(())
    }

    /// Check the strictly-descending order that `get_entries` relies on
    pub fn validate(&self) -> Result<()> {
        for pair in self.entries.windows(2) {
            if compare_versions(&pair[0].version, &pair[1].version) != Ordering::Greater {
                return Err(DbError::Definition(format!(
                    "Change-log is not strictly descending: {} before {}",
                    pair[0].version, pair[1].version
                )));
            }
        }
        Ok(())
    }

    /// Entries newer than `since` that apply to `dbms`, newest first.
    ///
    /// A prefix scan: iteration stops at the first entry whose version is not
    /// newer than `since`.
    pub fn get_entries(&self, since: Option<&str>, dbms: Dbms) -> Vec<&LogEntry> {
        let mut out = Vec::new();
        for entry in &self.entries {
            if let Some(since) = since {
                if compare_versions(&entry.version, since) != Ordering::Greater {
                    break;
                }
            }
            if entry.targets(dbms) {
                out.push(entry);
            }
        }
        out
    }
}

//! Row Store
//!
//! One JSON data file per table holding every row, keyed by primary key once
//! loaded. Writes take an advisory lock file, check that nobody changed the
//! data file since it was read (modified time and length), then replace the
//! file atomically through a temp file.

use crate::config::EngineConfig;
use crate::error::{DbError, Result};
use crate::query_eval::cell;
use crate::schema::Table;
use crate::types::{Row, RowId, RowSet};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Identity of a data file's on-disk version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub modified: Option<SystemTime>,
    pub len: u64,
}

impl Fingerprint {
    /// `Ok(None)` when the file does not exist
    fn of(path: &Path) -> io::Result<Option<Self>> {
        match fs::metadata(path) {
            Ok(meta) => Ok(Some(Fingerprint {
                modified: meta.modified().ok(),
                len: meta.len(),
            })),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// On-disk document
#[derive(Debug, Serialize, Deserialize)]
struct TableFile {
    table: String,
    rows: Vec<Row>,
}

/// Removes the lock file when dropped
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to release lock file");
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted)
}

#[derive(Debug)]
pub struct RowStore {
    table: String,
    primary_key: String,
    path: PathBuf,
    retry_count: u32,
    retry_delay: Duration,
    /// Fingerprint seen by the last read or write; `None` inside means the
    /// file did not exist then. Outer `None`: never read.
    seen: Option<Option<Fingerprint>>,
}

impl RowStore {
    pub fn new(table: &Table, config: &EngineConfig) -> Self {
        RowStore {
            table: table.name.clone(),
            primary_key: table.pk().to_string(),
            path: config.data_path(&table.name),
            retry_count: config.retry_count.max(1),
            retry_delay: config.retry_delay(),
            seen: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Retry `op` on transient failures, sleeping between attempts
    fn with_retry<T, F>(&self, mut op: F) -> io::Result<T>
    where
        F: FnMut() -> io::Result<T>,
    {
        let mut attempt = 1;
        loop {
            match op() {
                Err(e) if is_transient(&e) && attempt < self.retry_count => {
                    debug!(
                        path = %self.path.display(),
                        attempt,
                        error = %e,
                        "Transient I/O failure, retrying"
                    );
                    attempt += 1;
                    thread::sleep(self.retry_delay);
                }
                other => return other,
            }
        }
    }

    /// Whether the file changed on disk since the last read or write
    pub fn is_stale(&self) -> bool {
        match (self.seen, Fingerprint::of(&self.path)) {
            (Some(seen), Ok(current)) => seen != current,
            _ => true,
        }
    }

    /// Load every row; a missing file is an empty table
    pub fn read(&mut self) -> Result<RowSet> {
        let fingerprint = self
            .with_retry(|| Fingerprint::of(&self.path))
            .map_err(|e| self.not_readable(e))?;

        let rows = match fingerprint {
            None => RowSet::new(),
            Some(_) => {
                let text = self
                    .with_retry(|| fs::read_to_string(&self.path))
                    .map_err(|e| self.not_readable(e))?;
                let file: TableFile = serde_json::from_str(&text).map_err(|e| DbError::NotReadable {
                    path: self.path.clone(),
                    reason: e.to_string(),
                })?;
                self.key_rows(file.rows)?
            }
        };

        self.seen = Some(fingerprint);
        debug!(table = %self.table, rows = rows.len(), "Read table file");
        Ok(rows)
    }

    fn key_rows(&self, rows: Vec<Row>) -> Result<RowSet> {
        let mut set = RowSet::new();
        for row in rows {
            let id = cell(&row, &self.primary_key)
                .and_then(RowId::from_value)
                .ok_or_else(|| DbError::NotReadable {
                    path: self.path.clone(),
                    reason: format!("row without primary key '{}'", self.primary_key),
                })?;
            if set.contains_key(&id) {
                return Err(DbError::NotReadable {
                    path: self.path.clone(),
                    reason: format!("duplicate primary key '{}'", id),
                });
            }
            set.insert(id, row);
        }
        Ok(set)
    }

    /// Replace the file with `rows`.
    ///
    /// Fails with `WriteConflict` when the file changed since the last read
    /// and with `Locked` when another writer holds the lock for the whole
    /// retry budget.
    pub fn write(&mut self, rows: &RowSet) -> Result<()> {
        let _lock = self.lock()?;

        let current = Fingerprint::of(&self.path).map_err(|e| self.not_readable(e))?;
        if let Some(seen) = self.seen {
            if seen != current {
                warn!(table = %self.table, path = %self.path.display(), "Write conflict");
                return Err(DbError::WriteConflict {
                    path: self.path.clone(),
                });
            }
        }

        let file = TableFile {
            table: self.table.clone(),
            rows: rows.values().cloned().collect(),
        };
        let text = serde_json::to_string_pretty(&file)?;

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| self.not_writeable(e))?;
        }
        let tmp = self.path.with_extension("tmp");
        self.with_retry(|| fs::write(&tmp, &text))
            .map_err(|e| self.not_writeable(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.not_writeable(e))?;

        self.seen = Some(Fingerprint::of(&self.path).map_err(|e| self.not_readable(e))?);
        debug!(table = %self.table, rows = rows.len(), "Wrote table file");
        Ok(())
    }

    /// Delete the data file
    pub fn remove(&mut self) -> Result<()> {
        let _lock = self.lock()?;
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(self.not_writeable(e)),
        }
        self.seen = Some(None);
        Ok(())
    }

    fn lock(&self) -> Result<LockGuard> {
        let lock_path = self.path.with_extension("lock");
        if let Some(dir) = lock_path.parent() {
            fs::create_dir_all(dir).map_err(|e| self.not_writeable(e))?;
        }

        for attempt in 1..=self.retry_count {
            match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
                Ok(_) => return Ok(LockGuard { path: lock_path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists || is_transient(&e) => {
                    debug!(path = %lock_path.display(), attempt, "Lock busy");
                    if attempt < self.retry_count {
                        thread::sleep(self.retry_delay);
                    }
                }
                Err(e) => return Err(self.not_writeable(e)),
            }
        }
        warn!(path = %self.path.display(), "Lock not acquired");
        Err(DbError::Locked {
            path: self.path.clone(),
        })
    }

    fn not_readable(&self, e: io::Error) -> DbError {
        DbError::NotReadable {
            path: self.path.clone(),
            reason: e.to_string(),
        }
    }

    fn not_writeable(&self, e: io::Error) -> DbError {
        DbError::NotWriteable {
            path: self.path.clone(),
            reason: e.to_string(),
        }
    }
}

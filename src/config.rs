//! Engine configuration

use crate::error::{DbError, Result};
use crate::schema::Dbms;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine configuration
///
/// Every field has a default so a config file only needs the keys it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding one data file and one index file per table
    pub data_dir: PathBuf,
    /// Backend the engine emulates; selects constraints, triggers and log entries
    pub dbms: Dbms,
    /// Attempts for transient "temporarily unavailable" I/O before failing
    pub retry_count: u32,
    /// Sleep between attempts, in milliseconds
    pub retry_delay_ms: u64,
    /// Propagate read failures instead of returning empty results
    pub strict_reads: bool,
    pub data_extension: String,
    pub index_extension: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            data_dir: PathBuf::from("./data"),
            dbms: Dbms::Generic,
            retry_count: 5,
            retry_delay_ms: 20,
            strict_reads: false,
            data_extension: "dat".to_string(),
            index_extension: "idx".to_string(),
        }
    }
}

impl EngineConfig {
    /// Default configuration rooted at `data_dir`
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        EngineConfig {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Load a JSON config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| DbError::NotReadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let config: EngineConfig = serde_json::from_str(&text)?;
        if config.retry_count == 0 {
            return Err(DbError::Definition(
                "retry_count must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn with_dbms(mut self, dbms: Dbms) -> Self {
        self.dbms = dbms;
        self
    }

    pub fn with_retries(mut self, count: u32, delay_ms: u64) -> Self {
        self.retry_count = count.max(1);
        self.retry_delay_ms = delay_ms;
        self
    }

    pub fn with_strict_reads(mut self, strict: bool) -> Self {
        self.strict_reads = strict;
        self
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Row-store file of a table
    pub fn data_path(&self, table: &str) -> PathBuf {
        self.data_dir
            .join(format!("{}.{}", table.to_lowercase(), self.data_extension))
    }

    /// Index snapshot file of a table
    pub fn index_path(&self, table: &str) -> PathBuf {
        self.data_dir
            .join(format!("{}.{}", table.to_lowercase(), self.index_extension))
    }
}

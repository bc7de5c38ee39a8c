//! Index Manager
//!
//! Per-table secondary indexes: uppercased column -> uppercased value -> row
//! id(s). All columns of a table share one snapshot file, written only on
//! commit and reloaded (or rebuilt from the rows) on rollback.
//!
//! Snapshot layout: bincode header (magic, version, sha256 of payload)
//! followed by the bincode payload.

use crate::error::{DbError, Result};
use crate::query_eval::cell;
use crate::schema::Table;
use crate::types::{Row, RowId, RowSet, Value};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Index file magic number
const INDEX_MAGIC: u32 = 0xF1A7_0001;

/// Index format version
const INDEX_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexHeader {
    magic: u32,
    version: u32,
    checksum: [u8; 32],
}

impl IndexHeader {
    fn for_payload(payload: &[u8]) -> Self {
        IndexHeader {
            magic: INDEX_MAGIC,
            version: INDEX_VERSION,
            checksum: Sha256::digest(payload).into(),
        }
    }

    fn is_valid(&self, payload: &[u8]) -> bool {
        let checksum: [u8; 32] = Sha256::digest(payload).into();
        self.magic == INDEX_MAGIC && self.version == INDEX_VERSION && self.checksum == checksum
    }
}

/// Row ids filed under one value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexEntry {
    Unique(RowId),
    /// Sorted, without duplicates
    Multiple(Vec<RowId>),
}

impl IndexEntry {
    pub fn ids(&self) -> Vec<RowId> {
        match self {
            IndexEntry::Unique(id) => vec![id.clone()],
            IndexEntry::Multiple(ids) => ids.clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            IndexEntry::Unique(_) => 1,
            IndexEntry::Multiple(ids) => ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&mut self, id: RowId) {
        match self {
            IndexEntry::Unique(existing) if *existing == id => {}
            IndexEntry::Unique(existing) => {
                let mut ids = vec![existing.clone(), id];
                ids.sort();
                *self = IndexEntry::Multiple(ids);
            }
            IndexEntry::Multiple(ids) => {
                if let Err(pos) = ids.binary_search(&id) {
                    ids.insert(pos, id);
                }
            }
        }
    }

    /// Remove `id`; false once the bucket is empty
    fn remove(&mut self, id: &RowId) -> bool {
        match self {
            IndexEntry::Unique(existing) => existing != id,
            IndexEntry::Multiple(ids) => {
                if let Ok(pos) = ids.binary_search(id) {
                    ids.remove(pos);
                }
                match ids.len() {
                    0 => false,
                    1 => {
                        *self = IndexEntry::Unique(ids[0].clone());
                        true
                    }
                    _ => true,
                }
            }
        }
    }
}

/// Uppercased value -> row ids
pub type ColumnIndex = BTreeMap<String, IndexEntry>;

/// One row's change to one column
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDelta {
    pub row_id: RowId,
    /// Null on insert
    pub old: Value,
    /// Null on delete
    pub new: Value,
}

#[derive(Debug)]
pub struct IndexManager {
    table: String,
    primary_key: String,
    path: PathBuf,
    columns: BTreeMap<String, ColumnIndex>,
    dirty: bool,
}

impl IndexManager {
    /// Load the snapshot for `table` and make sure every index column the
    /// schema declares is present, building missing ones from `rows`.
    pub fn open<P: AsRef<Path>>(table: &Table, path: P, rows: &RowSet) -> Result<Self> {
        let mut manager = IndexManager {
            table: table.name.clone(),
            primary_key: table.pk().to_string(),
            path: path.as_ref().to_path_buf(),
            columns: BTreeMap::new(),
            dirty: false,
        };

        match manager.read_snapshot() {
            Ok(Some(columns)) => manager.columns = columns,
            Ok(None) => {}
            Err(e) => warn!(
                table = %manager.table,
                error = %e,
                "Index snapshot unusable, rebuilding"
            ),
        }

        for column in table.indexed_columns() {
            if !manager.is_indexed(column) {
                manager.build(column, rows, None)?;
            }
        }
        Ok(manager)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_indexed(&self, column: &str) -> bool {
        self.columns.contains_key(&column.to_uppercase())
    }

    /// Uppercased names of the indexed columns
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(|k| k.as_str())
    }

    /// Create or update the index of `column`.
    ///
    /// Without a delta the column is rebuilt from `rows` in primary-key
    /// order. With one, the row's old/new values are folded into the
    /// existing buckets; a column seen for the first time is still built
    /// from `rows` first.
    pub fn build(&mut self, column: &str, rows: &RowSet, delta: Option<&IndexDelta>) -> Result<()> {
        if column.eq_ignore_ascii_case(&self.primary_key) {
            return Err(DbError::InvalidQuery(format!(
                "Primary key '{}' of table '{}' is never indexed",
                column, self.table
            )));
        }
        let key = column.to_uppercase();

        if delta.is_none() || !self.columns.contains_key(&key) {
            let mut index = ColumnIndex::new();
            for (id, row) in rows {
                if let Some(value_key) = cell(row, column).and_then(Value::index_key) {
                    index
                        .entry(value_key)
                        .and_modify(|e| e.insert(id.clone()))
                        .or_insert_with(|| IndexEntry::Unique(id.clone()));
                }
            }
            debug!(
                table = %self.table,
                column = %key,
                values = index.len(),
                "Built column index"
            );
            self.columns.insert(key.clone(), index);
        }

        if let Some(delta) = delta {
            if let Some(index) = self.columns.get_mut(&key) {
                apply_delta(index, delta);
            }
        }
        self.dirty = true;
        Ok(())
    }

    /// Fold one row's change into every indexed column
    pub fn update_row(&mut self, row_id: &RowId, old: Option<&Row>, new: Option<&Row>) {
        for (column, index) in self.columns.iter_mut() {
            let delta = IndexDelta {
                row_id: row_id.clone(),
                old: old.and_then(|r| cell(r, column)).cloned().unwrap_or(Value::Null),
                new: new.and_then(|r| cell(r, column)).cloned().unwrap_or(Value::Null),
            };
            apply_delta(index, &delta);
        }
        self.dirty = true;
    }

    /// Full value mapping of an indexed column
    pub fn lookup_column(&self, column: &str) -> Result<&ColumnIndex> {
        self.columns
            .get(&column.to_uppercase())
            .ok_or_else(|| DbError::not_found("Index", format!("{}.{}", self.table, column)))
    }

    /// Row ids filed under `value`; empty when nothing matches
    pub fn lookup(&self, column: &str, value: &Value) -> Result<Vec<RowId>> {
        let index = self.lookup_column(column)?;
        Ok(value
            .index_key()
            .and_then(|k| index.get(&k))
            .map(IndexEntry::ids)
            .unwrap_or_default())
    }

    /// Persist the in-memory state
    pub fn commit(&mut self) -> Result<()> {
        let payload = bincode::serialize(&self.columns)?;
        let header = bincode::serialize(&IndexHeader::for_payload(&payload))?;

        let mut bytes = Vec::with_capacity(header.len() + payload.len());
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&payload);

        let tmp = self.path.with_extension("idx.tmp");
        let not_writeable = |e: std::io::Error| DbError::NotWriteable {
            path: self.path.clone(),
            reason: e.to_string(),
        };
        fs::write(&tmp, &bytes).map_err(not_writeable)?;
        fs::rename(&tmp, &self.path).map_err(not_writeable)?;

        self.dirty = false;
        debug!(
            table = %self.table,
            columns = self.columns.len(),
            bytes = bytes.len(),
            "Committed index snapshot"
        );
        Ok(())
    }

    /// Discard uncommitted changes: reload the snapshot, or rebuild every
    /// known column from `rows` when there is no usable snapshot.
    pub fn rollback(&mut self, rows: &RowSet) -> Result<()> {
        match self.read_snapshot() {
            Ok(Some(columns)) => {
                self.columns = columns;
                self.dirty = false;
                debug!(table = %self.table, "Reloaded index snapshot");
                return Ok(());
            }
            Ok(None) => info!(table = %self.table, "No index snapshot, rebuilding"),
            Err(e) => warn!(
                table = %self.table,
                error = %e,
                "Index snapshot unusable, rebuilding"
            ),
        }

        let columns: Vec<String> = self.columns.keys().cloned().collect();
        for column in columns {
            self.build(&column, rows, None)?;
        }
        self.dirty = false;
        Ok(())
    }

    /// `Ok(None)` when no snapshot exists
    fn read_snapshot(&self) -> Result<Option<BTreeMap<String, ColumnIndex>>> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(DbError::NotReadable {
                    path: self.path.clone(),
                    reason: e.to_string(),
                })
            }
        };

        let mut cursor = Cursor::new(bytes.as_slice());
        let header: IndexHeader = bincode::deserialize_from(&mut cursor)?;
        let payload = &bytes[cursor.position() as usize..];
        if !header.is_valid(payload) {
            return Err(DbError::NotReadable {
                path: self.path.clone(),
                reason: "bad magic, version or checksum".to_string(),
            });
        }
        Ok(Some(bincode::deserialize(payload)?))
    }
}

fn apply_delta(index: &mut ColumnIndex, delta: &IndexDelta) {
    let old_key = delta.old.index_key();
    let new_key = delta.new.index_key();
    if old_key == new_key {
        // Same bucket; still make sure the id is filed
        if let Some(k) = new_key {
            index
                .entry(k)
                .and_modify(|e| e.insert(delta.row_id.clone()))
                .or_insert_with(|| IndexEntry::Unique(delta.row_id.clone()));
        }
        return;
    }

    if let Some(k) = old_key {
        let keep = match index.get_mut(&k) {
            Some(entry) => entry.remove(&delta.row_id),
            None => true,
        };
        if !keep {
            index.remove(&k);
        }
    }
    if let Some(k) = new_key {
        index
            .entry(k)
            .and_modify(|e| e.insert(delta.row_id.clone()))
            .or_insert_with(|| IndexEntry::Unique(delta.row_id.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, ColumnType, Index};
    use tempfile::TempDir;

    fn table() -> Table {
        Table::new("people", "id")
            .with_column(Column::new("id", ColumnType::Integer))
            .with_column(Column::new("city", ColumnType::String))
            .with_index(Index::new("by_city", &["city"]))
    }

    fn rows() -> RowSet {
        let mut rows = RowSet::new();
        for (id, city) in [(1, "Oslo"), (2, "oslo"), (3, "Rome")] {
            let mut row = Row::new();
            row.insert("id".to_string(), Value::Int(id));
            row.insert("city".to_string(), Value::from(city));
            rows.insert(RowId::from(id), row);
        }
        rows
    }

    #[test]
    fn test_open_builds_declared_columns() {
        let dir = TempDir::new().unwrap();
        let manager = IndexManager::open(&table(), dir.path().join("people.idx"), &rows()).unwrap();

        let ids = manager.lookup("CITY", &Value::from("OSLO")).unwrap();
        assert_eq!(ids, vec![RowId::from(1), RowId::from(2)]);
        assert!(manager.lookup("city", &Value::from("Paris")).unwrap().is_empty());
        assert!(manager.lookup("id", &Value::Int(1)).unwrap_err().is_not_found());
    }

    #[test]
    fn test_delta_moves_row_between_buckets() {
        let dir = TempDir::new().unwrap();
        let mut manager = IndexManager::open(&table(), dir.path().join("people.idx"), &rows()).unwrap();

        let delta = IndexDelta {
            row_id: RowId::from(2),
            old: Value::from("oslo"),
            new: Value::from("rome"),
        };
        manager.build("city", &rows(), Some(&delta)).unwrap();

        assert_eq!(manager.lookup("city", &Value::from("oslo")).unwrap(), vec![RowId::from(1)]);
        assert_eq!(
            manager.lookup("city", &Value::from("ROME")).unwrap(),
            vec![RowId::from(2), RowId::from(3)]
        );
        assert!(matches!(
            manager.lookup_column("city").unwrap().get("OSLO"),
            Some(IndexEntry::Unique(_))
        ));
    }

    #[test]
    fn test_primary_key_not_indexable() {
        let dir = TempDir::new().unwrap();
        let mut manager = IndexManager::open(&table(), dir.path().join("people.idx"), &rows()).unwrap();
        assert!(manager.build("ID", &rows(), None).is_err());
    }

    #[test]
    fn test_commit_then_rollback_restores_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("people.idx");
        let mut manager = IndexManager::open(&table(), &path, &rows()).unwrap();
        manager.commit().unwrap();

        let mut new_row = Row::new();
        new_row.insert("city".to_string(), Value::from("Lima"));
        manager.update_row(&RowId::from(9), None, Some(&new_row));
        assert_eq!(manager.lookup("city", &Value::from("lima")).unwrap().len(), 1);

        manager.rollback(&rows()).unwrap();
        assert!(manager.lookup("city", &Value::from("lima")).unwrap().is_empty());
        assert!(!manager.is_dirty());
    }

    #[test]
    fn test_corrupt_snapshot_rebuilds() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("people.idx");
        let mut manager = IndexManager::open(&table(), &path, &rows()).unwrap();
        manager.commit().unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        manager.rollback(&rows()).unwrap();
        assert_eq!(manager.lookup("city", &Value::from("rome")).unwrap(), vec![RowId::from(3)]);

        let reopened = IndexManager::open(&table(), &path, &rows()).unwrap();
        assert_eq!(reopened.lookup("city", &Value::from("oslo")).unwrap().len(), 2);
    }
}

//! Schema Registry
//!
//! Caches loaded database definitions by file path so every engine working on
//! the same definition shares one resolved `Arc<Database>`.

use crate::error::{DbError, Result};
use crate::schema::Database;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<PathBuf, Arc<Database>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        SchemaRegistry::default()
    }

    fn key(path: &Path) -> Result<PathBuf> {
        path.canonicalize().map_err(|e| DbError::NotReadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Cached definition for `path`, loading it (and its includes) on first use
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<Arc<Database>> {
        let key = Self::key(path.as_ref())?;

        if let Some(db) = self.schemas.read().get(&key) {
            return Ok(Arc::clone(db));
        }

        let db = Arc::new(Database::load(&key)?);
        let mut schemas = self.schemas.write();
        // Another caller may have loaded it meanwhile; keep the first
        let entry = schemas.entry(key.clone()).or_insert_with(|| {
            debug!(path = %key.display(), "Cached schema");
            Arc::clone(&db)
        });
        Ok(Arc::clone(entry))
    }

    /// Replace the cached definition, e.g. after a migration
    pub fn store<P: AsRef<Path>>(&self, path: P, db: Database) -> Result<Arc<Database>> {
        let path = path.as_ref();
        db.save(path)?;
        let key = Self::key(path)?;
        let db = Arc::new(db);
        self.schemas.write().insert(key, Arc::clone(&db));
        Ok(db)
    }

    /// Drop a cached definition so the next `load` rereads the file
    pub fn invalidate<P: AsRef<Path>>(&self, path: P) -> bool {
        match Self::key(path.as_ref()) {
            Ok(key) => self.schemas.write().remove(&key).is_some(),
            Err(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.schemas.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.read().is_empty()
    }
}

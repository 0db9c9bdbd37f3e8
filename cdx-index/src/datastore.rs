//! The collection registry
//!
//! Maps collection names to open indexes. Collections are created on
//! first write, opened lazily on read and flushed at shutdown. The map is
//! guarded by a read-write lock with a double-checked open so concurrent
//! callers race at most one creation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::Config;
use crate::error::{IndexError, IndexResult};
use crate::index::Index;

/// Process-wide registry of open collections.
pub struct DataStore {
    config: Config,
    collections: RwLock<HashMap<String, Arc<Index>>>,
}

impl DataStore {
    /// Create the registry, making sure the data directory exists.
    pub fn open(config: Config) -> IndexResult<DataStore> {
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| IndexError::Storage(format!("failed to create data dir: {}", e)))?;
        Ok(DataStore {
            config,
            collections: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Look up a collection, opening it lazily if it exists on disk.
    /// Returns `None` for collections that were never created.
    pub fn get_index(&self, name: &str) -> IndexResult<Option<Arc<Index>>> {
        self.validate_name(name)?;
        if let Some(index) = self.collections.read().get(name) {
            return Ok(Some(Arc::clone(index)));
        }
        if !self.collection_path(name).is_dir() {
            return Ok(None);
        }
        self.open_collection(name).map(Some)
    }

    /// Look up a collection, creating it if missing. Idempotent under
    /// concurrent callers.
    pub fn get_or_create_index(&self, name: &str) -> IndexResult<Arc<Index>> {
        self.validate_name(name)?;
        if let Some(index) = self.collections.read().get(name) {
            return Ok(Arc::clone(index));
        }
        self.open_collection(name)
    }

    fn open_collection(&self, name: &str) -> IndexResult<Arc<Index>> {
        let mut collections = self.collections.write();
        // double-check: another caller may have opened it while we waited
        if let Some(index) = collections.get(name) {
            return Ok(Arc::clone(index));
        }
        let path = self.collection_path(name);
        let index = Arc::new(Index::open(&path, name, self.config.default_deny)?);
        tracing::info!(collection = name, path = %path.display(), "collection opened");
        collections.insert(name.to_string(), Arc::clone(&index));
        Ok(index)
    }

    /// Names of every collection on disk, sorted.
    pub fn list_collections(&self) -> IndexResult<Vec<String>> {
        let mut names = Vec::new();
        let entries = std::fs::read_dir(&self.config.data_dir)
            .map_err(|e| IndexError::Storage(format!("failed to read data dir: {}", e)))?;
        for entry in entries {
            let entry = entry.map_err(|e| IndexError::Storage(e.to_string()))?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if is_valid_name(name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Flush every open collection. Called at shutdown.
    pub fn close(&self) {
        let mut collections = self.collections.write();
        for (name, index) in collections.drain() {
            if let Err(e) = index.flush() {
                tracing::error!(collection = %name, error = %e, "flush on close failed");
            }
        }
    }

    fn collection_path(&self, name: &str) -> PathBuf {
        self.config.data_dir.join(name)
    }

    fn validate_name(&self, name: &str) -> IndexResult<()> {
        if is_valid_name(name) {
            Ok(())
        } else {
            Err(IndexError::InvalidCollectionName(name.to_string()))
        }
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

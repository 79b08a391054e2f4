//! # Config Store
//!
//! Opaque key → string storage used for everything the device has to remember
//! across reboots: network credentials, the broker address and its identity.
//!
//! Two implementations are provided:
//! - [`FileConfigStore`] keeps a flat TOML table on disk and rewrites it on
//!   every mutation, which mirrors the commit-per-write behaviour of flash
//!   backed key-value stores.
//! - [`MemoryConfigStore`] keeps everything in a map and is used by tests and
//!   dry runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

const STORE_FILE: &str = "store.toml";

/// Errors raised by a config store backend.
///
/// A missing key is never an error, it is reported as `Ok(None)`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to access store file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse store file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize store: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Persistent string mapping consumed by the connectivity core.
pub trait ConfigStore: Send + Sync {
    fn get_string(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set_string(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Removes `key`. Deleting an absent key succeeds.
    fn delete_key(&self, key: &str) -> Result<(), StoreError>;
}

/// TOML file backed store.
///
/// The whole table is loaded once at open time and kept in memory; each
/// mutation is written through before returning so a power loss never loses
/// an acknowledged write.
#[derive(Debug)]
pub struct FileConfigStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileConfigStore {
    /// Opens (or lazily creates) `store.toml` inside `dir`.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        let path = dir.join(STORE_FILE);

        let entries = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
            let entries: BTreeMap<String, String> = toml::from_str(&content)?;
            debug!("Loaded {} entries from {}", entries.len(), path.display());
            entries
        } else {
            info!(
                "No store found at {}, starting with an empty one",
                path.display()
            );
            BTreeMap::new()
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn commit(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let content = toml::to_string_pretty(entries)?;
        std::fs::write(&self.path, content).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl ConfigStore for FileConfigStore {
    fn get_string(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set_string(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.insert(key.to_string(), value.to_string());
        self.commit(&entries)?;
        debug!("Stored key {}", key);
        Ok(())
    }

    fn delete_key(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        if entries.remove(key).is_none() {
            warn!("Tried to delete missing key {}", key);
            return Ok(());
        }
        self.commit(&entries)?;
        debug!("Deleted key {}", key);
        Ok(())
    }
}

/// Volatile store, nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let entries = entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            entries: Mutex::new(entries),
        }
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get_string(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set_string(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete_key(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }
}

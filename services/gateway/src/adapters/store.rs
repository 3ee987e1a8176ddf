//! services/gateway/src/adapters/store.rs
//!
//! Concrete implementations of the `KeyValueStore` port: an in-memory map for
//! tests and short-lived processes, and a JSON file on disk that several
//! processes can share.

use gateway_core::ports::{KeyValueStore, PersistenceLifetime, PortError, PortResult};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

//=========================================================================================
// In-memory store
//=========================================================================================

/// A store that lives exactly as long as the process.
pub struct MemoryStore {
    lifetime: PersistenceLifetime,
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new(lifetime: PersistenceLifetime) -> Self {
        Self {
            lifetime,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> PortResult<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| PortError::Storage("memory store lock poisoned".to_string()))
    }
}

impl KeyValueStore for MemoryStore {
    fn lifetime(&self) -> PersistenceLifetime {
        self.lifetime
    }

    fn get(&self, key: &str) -> PortResult<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> PortResult<()> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> PortResult<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}

//=========================================================================================
// File-backed store
//=========================================================================================

/// A store persisted as a single JSON object.
///
/// The file is re-read on every access so writes made by other processes are
/// always observed. Writes go through a temporary file and a rename.
pub struct FileStore {
    path: PathBuf,
    lifetime: PersistenceLifetime,
    // Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>, lifetime: PersistenceLifetime) -> PortResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    PortError::Storage(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
        }
        Ok(Self {
            path,
            lifetime,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes every entry. Used to start a fresh browsing session.
    pub fn wipe(&self) -> PortResult<()> {
        let _guard = self.guard()?;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PortError::Storage(e.to_string())),
        }
    }

    fn guard(&self) -> PortResult<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| PortError::Storage("file store lock poisoned".to_string()))
    }

    fn read_all(&self) -> PortResult<BTreeMap<String, String>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(PortError::Storage(e.to_string())),
        };
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        match serde_json::from_str(&raw) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                // A corrupt file is treated as empty; the next write replaces it.
                warn!("Ignoring unreadable store file {}: {}", self.path.display(), e);
                Ok(BTreeMap::new())
            }
        }
    }

    fn write_all(&self, entries: &BTreeMap<String, String>) -> PortResult<()> {
        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| PortError::Storage(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json).map_err(|e| PortError::Storage(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| PortError::Storage(e.to_string()))
    }
}

impl KeyValueStore for FileStore {
    fn lifetime(&self) -> PersistenceLifetime {
        self.lifetime
    }

    fn get(&self, key: &str) -> PortResult<Option<String>> {
        Ok(self.read_all()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> PortResult<()> {
        let _guard = self.guard()?;
        let mut entries = self.read_all()?;
        entries.insert(key.to_string(), value.to_string());
        self.write_all(&entries)
    }

    fn remove(&self, key: &str) -> PortResult<()> {
        let _guard = self.guard()?;
        let mut entries = self.read_all()?;
        if entries.remove(key).is_some() {
            self.write_all(&entries)?;
        }
        Ok(())
    }
}

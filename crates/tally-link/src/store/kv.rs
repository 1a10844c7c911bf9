//! Key-value persistence collaborators.
//!
//! The core treats durable storage as an opaque get/set/remove API. The
//! reference backend keeps everything in one JSON file with restrictive
//! permissions; tests use the in-memory backend.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::Value;

/// Opaque durable key-value store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, path: &str) -> Result<Option<Value>>;
    fn set(&self, path: &str, value: Value) -> Result<()>;
    fn remove(&self, path: &str) -> Result<()>;
}

/// Single-file JSON backend.
///
/// The whole map is rewritten on every mutation; the record this core stores
/// is small enough that durability wins over cleverness here.
pub struct JsonFileStore {
    file: PathBuf,
    entries: Mutex<HashMap<String, Value>>,
}

impl JsonFileStore {
    /// Open (or create) the store at `file`.
    pub fn open(file: impl Into<PathBuf>) -> Result<Self> {
        let file = file.into();
        let entries = Self::read_entries(&file)?;
        Ok(Self {
            file,
            entries: Mutex::new(entries),
        })
    }

    fn read_entries(file: &Path) -> Result<HashMap<String, Value>> {
        if !file.exists() {
            return Ok(HashMap::new());
        }
        let contents = fs::read_to_string(file)
            .with_context(|| format!("failed to read {}", file.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("malformed store file {}", file.display()))
    }

    fn persist(&self, entries: &HashMap<String, Value>) -> Result<()> {
        if let Some(parent) = self.file.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(entries)?;
        fs::write(&self.file, contents)
            .with_context(|| format!("failed to write {}", self.file.display()))?;

        // Set restrictive permissions on Unix
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = fs::metadata(&self.file) {
                let mut permissions = metadata.permissions();
                permissions.set_mode(0o600);
                let _ = fs::set_permissions(&self.file, permissions);
            }
        }
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, path: &str) -> Result<Option<Value>> {
        Ok(self.entries.lock().get(path).cloned())
    }

    fn set(&self, path: &str, value: Value) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.insert(path.to_string(), value);
        self.persist(&entries)
    }

    fn remove(&self, path: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.remove(path).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }
}

/// In-memory backend for tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, path: &str) -> Result<Option<Value>> {
        Ok(self.entries.lock().get(path).cloned())
    }

    fn set(&self, path: &str, value: Value) -> Result<()> {
        self.entries.lock().insert(path.to_string(), value);
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<()> {
        self.entries.lock().remove(path);
        Ok(())
    }
}

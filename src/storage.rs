//! Key/value storage for session timestamps.
//!
//! The session watchdog persists its activity clock through
//! [`SessionStorage`] so that a restart does not reset it. Two backends:
//!
//! - [`MemoryStorage`] - process memory only (tests, embedded use)
//! - [`FileStorage`] - JSON map written through to disk on every change
//!
//! # Storage structure
//!
//! ```text
//! ~/.config/pfcam/
//!     config.json       # Config (see crate::config)
//!     session.json      # {"session_start": "...", "last_activity": "..."}
//! ```

use std::collections::HashMap;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};

/// Minimal string key/value store.
///
/// Implementations must be cheap to call from input handlers and must not
/// panic; write failures are logged and swallowed.
pub trait SessionStorage: Send + Sync + std::fmt::Debug {
    /// Read the value stored under `key`.
    fn get(&self, key: &str) -> Option<String>;

    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: String);

    /// Remove `key` if present.
    fn remove(&self, key: &str);
}

fn lock_map(map: &Mutex<HashMap<String, String>>) -> MutexGuard<'_, HashMap<String, String>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        lock_map(&self.values).get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        lock_map(&self.values).insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        lock_map(&self.values).remove(key);
    }
}

/// Write-through JSON file storage.
///
/// The whole map is cached in memory; reads never touch the disk.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl FileStorage {
    /// Open (or lazily create) the storage file at `path`.
    ///
    /// A missing file starts empty. A corrupt file is logged and replaced
    /// on the next write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let values = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&content).unwrap_or_else(|e| {
                log::warn!(
                    "[Storage] Ignoring unreadable session file {}: {}",
                    path.display(),
                    e
                );
                HashMap::new()
            })
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    /// Open `session.json` inside the configuration directory.
    pub fn in_config_dir() -> Result<Self> {
        Self::open(crate::config::Config::config_dir()?.join("session.json"))
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &HashMap<String, String>) -> Result<()> {
        fs::write(&self.path, serde_json::to_string_pretty(values)?)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;

        // Owner read/write only
        #[cfg(unix)]
        fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    fn persist_or_log(&self, values: &HashMap<String, String>) {
        if let Err(e) = self.persist(values) {
            log::error!("[Storage] {:#}", e);
        }
    }
}

impl SessionStorage for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        lock_map(&self.values).get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        let mut values = lock_map(&self.values);
        values.insert(key.to_string(), value);
        self.persist_or_log(&values);
    }

    fn remove(&self, key: &str) {
        let mut values = lock_map(&self.values);
        if values.remove(key).is_some() {
            self.persist_or_log(&values);
        }
    }
}

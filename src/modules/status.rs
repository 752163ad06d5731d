//! Status variable persistence.
//!
//! Modules keep small pieces of state (last laser setpoint, last sweep range)
//! across activation cycles and process restarts. The manager captures them
//! before `on_deactivate`, saves them through a [`StatusStore`], and restores
//! them before the next `on_activate`.
//!
//! ## Stores
//!
//! - **[`FileStatusStore`]**: one JSON record per module at
//!   `<dir>/<module>.status.json`, written through a temporary file and a
//!   rename so a crash never leaves a half-written record.
//! - **[`MemoryStatusStore`]**: in-process map, for tests and throwaway
//!   sessions.
//!
//! Records are independent: a corrupt file fails only that module's load.

use super::StatusVariables;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File suffix of persisted records.
pub const STATUS_FILE_SUFFIX: &str = ".status.json";

/// Errors raised by a [`StatusStore`].
#[derive(Error, Debug)]
pub enum StatusStoreError {
    /// Reading or writing the record failed.
    #[error("Status record I/O error at {path}: {source}")]
    Io {
        /// Record or directory being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The record exists but is not valid.
    #[error("Corrupt status record at {path}: {reason}")]
    Corrupt {
        /// Path of the record.
        path: PathBuf,
        /// Why the record could not be used.
        reason: String,
    },

    /// The variables could not be serialized.
    #[error("Failed to serialize status variables of '{module}': {source}")]
    Serialize {
        /// Module whose variables were being written.
        module: String,
        /// Underlying serialization error.
        #[source]
        source: serde_json::Error,
    },
}

/// Persistence backend for status variables.
///
/// Implementations must keep modules independent: failing to read one
/// module's record must not affect any other module.
pub trait StatusStore: Send + Sync {
    /// Persists `variables`, replacing any previous record of `module`.
    fn save(&self, module: &str, variables: &StatusVariables) -> Result<(), StatusStoreError>;

    /// Returns the last saved variables, or an empty map if none exist.
    fn load(&self, module: &str) -> Result<StatusVariables, StatusStoreError>;

    /// Removes the record of `module`. Removing a missing record succeeds.
    fn clear(&self, module: &str) -> Result<(), StatusStoreError>;
}

/// On-disk representation of one module's status variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    /// Module the record belongs to.
    pub module: String,
    /// When the record was written.
    pub saved_at: DateTime<Utc>,
    /// Variable name → value.
    pub variables: StatusVariables,
}

/// JSON-file backed store.
#[derive(Debug, Clone)]
pub struct FileStatusStore {
    directory: PathBuf,
}

impl FileStatusStore {
    /// Stores records below `directory`, which is created on first save.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// `<local data dir>/labctl/status`, if the platform has one.
    pub fn default_directory() -> Option<PathBuf> {
        dirs::data_local_dir().map(|dir| dir.join("labctl").join("status"))
    }

    /// Directory holding the records.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path of the record for `module`.
    pub fn record_path(&self, module: &str) -> PathBuf {
        self.directory.join(format!("{module}{STATUS_FILE_SUFFIX}"))
    }

    /// Reads the full record of `module`, `None` if it was never saved.
    pub fn read_record(&self, module: &str) -> Result<Option<StatusRecord>, StatusStoreError> {
        let path = self.record_path(module);
        let json = match fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StatusStoreError::Io { path, source }),
        };

        let record: StatusRecord =
            serde_json::from_str(&json).map_err(|e| StatusStoreError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        if record.module != module {
            return Err(StatusStoreError::Corrupt {
                path,
                reason: format!("record belongs to module '{}'", record.module),
            });
        }
        Ok(Some(record))
    }
}

impl StatusStore for FileStatusStore {
    fn save(&self, module: &str, variables: &StatusVariables) -> Result<(), StatusStoreError> {
        let record = StatusRecord {
            module: module.to_string(),
            saved_at: Utc::now(),
            variables: variables.clone(),
        };
        let json =
            serde_json::to_string_pretty(&record).map_err(|source| StatusStoreError::Serialize {
                module: module.to_string(),
                source,
            })?;

        fs::create_dir_all(&self.directory).map_err(|source| StatusStoreError::Io {
            path: self.directory.clone(),
            source,
        })?;

        let path = self.record_path(module);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|source| StatusStoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| StatusStoreError::Io { path, source })
    }

    fn load(&self, module: &str) -> Result<StatusVariables, StatusStoreError> {
        Ok(self
            .read_record(module)?
            .map(|record| record.variables)
            .unwrap_or_default())
    }

    fn clear(&self, module: &str) -> Result<(), StatusStoreError> {
        let path = self.record_path(module);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StatusStoreError::Io { path, source }),
        }
    }
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    records: parking_lot::Mutex<HashMap<String, StatusVariables>>,
}

impl MemoryStatusStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of modules with a saved record, sorted.
    pub fn modules(&self) -> Vec<String> {
        let mut modules: Vec<String> = self.records.lock().keys().cloned().collect();
        modules.sort();
        modules
    }
}

impl StatusStore for MemoryStatusStore {
    fn save(&self, module: &str, variables: &StatusVariables) -> Result<(), StatusStoreError> {
        self.records
            .lock()
            .insert(module.to_string(), variables.clone());
        Ok(())
    }

    fn load(&self, module: &str) -> Result<StatusVariables, StatusStoreError> {
        Ok(self.records.lock().get(module).cloned().unwrap_or_default())
    }

    fn clear(&self, module: &str) -> Result<(), StatusStoreError> {
        self.records.lock().remove(module);
        Ok(())
    }
}

//! Persisted session table shared by all windows of one application instance.
//!
//! The table is a single JSON file rewritten on every mutation. Only the
//! replicator's write path touches it; UI code goes through the store.

use crate::error::SessionError;
use crate::model::{now_unix_millis, SessionTable, TABLE_VERSION};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default file name under the data directory.
const TABLE_FILE_NAME: &str = "sessions.json";
/// Application subdirectory under the platform data directory.
const APP_DIR: &str = "tabmux";

/// On-disk payload shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedTable {
    /// File-format version for forward compatibility checks.
    #[serde(default = "legacy_version")]
    version: u32,
    #[serde(default)]
    updated_at_millis: u64,
    #[serde(default)]
    table: SessionTable,
}

/// Files written before versioning carried no `version` key.
fn legacy_version() -> u32 {
    1
}

/// Filesystem-backed storage for the session table.
#[derive(Debug, Clone)]
pub struct TableFile {
    path: PathBuf,
}

impl TableFile {
    /// Resolve the default location (`<data dir>/tabmux/sessions.json`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_local_dir().map(|dir| dir.join(APP_DIR).join(TABLE_FILE_NAME))
    }

    /// Open/create the parent directory of `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SessionError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                SessionError::Persist(format!(
                    "failed to create store directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the table; a missing file yields an empty table.
    pub fn load(&self) -> Result<SessionTable, SessionError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SessionTable::new());
            }
            Err(e) => {
                return Err(SessionError::Persist(format!(
                    "failed to read {}: {e}",
                    self.path.display()
                )))
            }
        };
        let payload: PersistedTable = serde_json::from_str(&raw).map_err(|e| {
            SessionError::Persist(format!("failed to parse {}: {e}", self.path.display()))
        })?;
        if payload.version > TABLE_VERSION {
            return Err(SessionError::Persist(format!(
                "unsupported session table version {} in {} (this build reads up to {TABLE_VERSION})",
                payload.version,
                self.path.display()
            )));
        }
        let mut table = payload.table;
        table.version = TABLE_VERSION;
        table.normalize_order();
        debug!(path = %self.path.display(), sessions = table.len(), "loaded session table");
        Ok(table)
    }

    /// Write the table atomically.
    pub fn save(&self, table: &SessionTable) -> Result<(), SessionError> {
        let payload = PersistedTable {
            version: TABLE_VERSION,
            updated_at_millis: now_unix_millis(),
            table: table.clone(),
        };
        let json = serde_json::to_vec_pretty(&payload)
            .map_err(|e| SessionError::Persist(format!("failed to serialize table: {e}")))?;
        // Write to a sibling temporary file first so partial writes do not
        // corrupt the last known-good table.
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json).map_err(|e| {
            SessionError::Persist(format!(
                "failed to write temporary table file {}: {e}",
                tmp_path.display()
            ))
        })?;
        fs::rename(&tmp_path, &self.path).map_err(|e| {
            SessionError::Persist(format!(
                "failed to move table file into place {}: {e}",
                self.path.display()
            ))
        })?;
        Ok(())
    }
}

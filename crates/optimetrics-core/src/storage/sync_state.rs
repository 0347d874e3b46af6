//! Per-hardware-type upload cursors.
//!
//! The state file is rewritten after every change and is the durability
//! boundary for sync: a cursor that never reached disk is re-uploaded after a
//! crash, so remote delivery is at-least-once.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::HardwareType;
use crate::storage::error::StorageError;

pub const SYNC_STATE_FILE: &str = "sync_state.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileCursor {
    pub local_path: PathBuf,
    pub remote_file_id: Option<String>,
    pub last_row_uploaded: u64,
    pub total_rows: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncState {
    pub files: BTreeMap<HardwareType, FileCursor>,
    pub device_folder_id: Option<String>,
    pub last_sync: Option<DateTime<Utc>>,
}

/// Rows `[start_row, end_row)` of `path` not yet confirmed remotely.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRange {
    pub hardware_type: HardwareType,
    pub path: PathBuf,
    pub start_row: u64,
    pub end_row: u64,
}

pub struct SyncStateTracker {
    path: PathBuf,
    state: Mutex<SyncState>,
}

impl SyncStateTracker {
    /// Loads `path`. A missing or unreadable file yields an empty state.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<SyncState>(&text) {
                Ok(state) => state,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt sync state, starting empty");
                    SyncState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SyncState::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read sync state, starting empty");
                SyncState::default()
            }
        };
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    /// Tracker stored as [`SYNC_STATE_FILE`] in `device_dir`.
    pub fn in_dir(device_dir: &Path) -> Self {
        Self::load(device_dir.join(SYNC_STATE_FILE))
    }

    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, state: &SyncState) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Applies `change` to a copy of the state, persists it and only then
    /// publishes it. On error the in-memory state is untouched.
    fn commit<F>(&self, change: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut SyncState),
    {
        let mut guard = self.lock();
        let mut next = guard.clone();
        change(&mut next);
        self.persist(&next)?;
        *guard = next;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> SyncState {
        self.lock().clone()
    }

    pub fn cursor(&self, hardware_type: HardwareType) -> Option<FileCursor> {
        self.lock().files.get(&hardware_type).cloned()
    }

    /// Types with rows past their upload cursor.
    pub fn pending(&self) -> Vec<PendingRange> {
        self.lock()
            .files
            .iter()
            .filter(|(_, c)| c.total_rows > c.last_row_uploaded)
            .map(|(t, c)| PendingRange {
                hardware_type: *t,
                path: c.local_path.clone(),
                start_row: c.last_row_uploaded,
                end_row: c.total_rows,
            })
            .collect()
    }

    /// Sets the row count found in a local file. Used when a file is opened;
    /// a file shorter than the upload cursor pulls the cursor back.
    pub fn observe_total_rows(
        &self,
        hardware_type: HardwareType,
        local_path: &Path,
        total_rows: u64,
    ) -> Result<(), StorageError> {
        self.commit(|state| {
            let cursor = state.files.entry(hardware_type).or_default();
            cursor.local_path = local_path.to_path_buf();
            cursor.total_rows = total_rows;
            if cursor.last_row_uploaded > total_rows {
                warn!(
                    hardware_type = %hardware_type,
                    uploaded = cursor.last_row_uploaded,
                    local_rows = total_rows,
                    "local file shorter than upload cursor, clamping"
                );
                cursor.last_row_uploaded = total_rows;
            }
        })
    }

    /// Starts the cursor over for a local file that was replaced: all of its
    /// `total_rows` rows are pending again. The remote file id is kept so the
    /// rows are appended to the same remote file.
    pub fn restart_file(
        &self,
        hardware_type: HardwareType,
        local_path: &Path,
        total_rows: u64,
    ) -> Result<(), StorageError> {
        self.commit(|state| {
            let cursor = state.files.entry(hardware_type).or_default();
            cursor.local_path = local_path.to_path_buf();
            cursor.total_rows = total_rows;
            cursor.last_row_uploaded = 0;
        })
    }

    /// Counts `rows` rows that were just appended and flushed to `local_path`.
    pub fn record_rows(
        &self,
        hardware_type: HardwareType,
        local_path: &Path,
        rows: u64,
    ) -> Result<(), StorageError> {
        let mut guard = self.lock();
        let cursor = guard.files.entry(hardware_type).or_default();
        cursor.local_path = local_path.to_path_buf();
        cursor.total_rows += rows;
        cursor.last_modified = Some(Utc::now());
        // The rows are on disk already, so memory moves even if the
        // write below fails; the next open recounts them anyway.
        let snapshot = guard.clone();
        self.persist(&snapshot)
    }

    /// Advances the upload cursor of `hardware_type` after a confirmed
    /// remote write.
    pub fn mark_uploaded(
        &self,
        hardware_type: HardwareType,
        rows_uploaded: u64,
        remote_file_id: &str,
    ) -> Result<(), StorageError> {
        self.commit(|state| {
            let cursor = state.files.entry(hardware_type).or_default();
            cursor.last_row_uploaded = rows_uploaded.min(cursor.total_rows);
            cursor.remote_file_id = Some(remote_file_id.to_string());
            state.last_sync = Some(Utc::now());
        })
    }

    pub fn device_folder_id(&self) -> Option<String> {
        self.lock().device_folder_id.clone()
    }

    pub fn set_device_folder_id(&self, folder_id: Option<String>) -> Result<(), StorageError> {
        self.commit(|state| state.device_folder_id = folder_id)
    }

    /// Forgets a remote file id that no longer exists.
    pub fn clear_remote_file_id(&self, hardware_type: HardwareType) -> Result<(), StorageError> {
        self.commit(|state| {
            if let Some(cursor) = state.files.get_mut(&hardware_type) {
                cursor.remote_file_id = None;
            }
        })
    }
}

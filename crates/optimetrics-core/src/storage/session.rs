use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::storage::error::StorageError;

pub const SESSION_STATE_FILE: &str = ".session_state.json";

/// Summary of the previous run, used to report downtime on the next start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub hardware_id: String,
    pub session_start: DateTime<Utc>,
    pub last_snapshot: Option<DateTime<Utc>>,
    pub snapshots_retained: u64,
}

impl SessionState {
    pub fn new(hardware_id: impl Into<String>, session_start: DateTime<Utc>) -> Self {
        Self {
            hardware_id: hardware_id.into(),
            session_start,
            last_snapshot: None,
            snapshots_retained: 0,
        }
    }

    /// `None` when absent or unreadable.
    pub fn load(data_dir: &Path) -> Option<Self> {
        let path = data_dir.join(SESSION_STATE_FILE);
        let text = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&text) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt session state ignored");
                None
            }
        }
    }

    pub fn save(&self, data_dir: &Path) -> Result<(), StorageError> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(SESSION_STATE_FILE);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Time between the last stored snapshot of this session and `now`.
    pub fn offline_for(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.last_snapshot.map(|last| now - last)
    }
}

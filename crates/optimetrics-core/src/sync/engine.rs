//! Incremental upload of categorized files.
//!
//! A cycle authenticates, resolves the device folder, then uploads every
//! pending row range. The upload cursor advances only after the remote write
//! succeeded. A crash between the two re-sends the same range on the next
//! cycle, so remote files may contain duplicate rows but never miss any.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::CloudConfig;
use crate::model::HardwareType;
use crate::storage::tabular::count_rows;
use crate::storage::{PendingRange, SyncStateTracker};
use crate::sync::content;
use crate::sync::error::{RemoteError, SyncError};
use crate::sync::remote::RemoteStore;
use crate::util::Shutdown;

#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Root folder under which the device folder lives.
    pub shared_folder_id: String,
    /// Device folder name.
    pub device_id: String,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub initial_delay: Duration,
    pub interval: Duration,
}

impl SyncSettings {
    /// `None` when no shared folder is configured.
    pub fn from_config(config: &CloudConfig, device_id: &str) -> Option<Self> {
        Some(Self {
            shared_folder_id: config.shared_folder_id.clone()?,
            device_id: device_id.to_string(),
            retry_attempts: config.retry_attempts.max(1),
            retry_delay: Duration::from_secs(config.retry_delay_secs),
            initial_delay: Duration::from_secs(config.initial_delay_secs),
            interval: Duration::from_secs(config.sync_interval_minutes * 60),
        })
    }
}

/// Outcome of one cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Rows uploaded per type.
    pub rows: BTreeMap<HardwareType, u64>,
    /// Types left for the next cycle after an error.
    pub skipped: Vec<HardwareType>,
}

impl SyncReport {
    pub fn total_rows(&self) -> u64 {
        self.rows.values().sum()
    }
}

/// How the last cycle ended.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    #[default]
    NeverRun,
    Synced { rows: u64, skipped: usize },
    Failed(String),
}

/// Counters kept across cycles.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncStats {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub rows_uploaded: u64,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_outcome: SyncOutcome,
}

/// Shared view of an engine's [`SyncStats`], readable from other threads.
#[derive(Debug, Default, Clone)]
pub struct SyncStatsHandle(Arc<Mutex<SyncStats>>);

impl SyncStatsHandle {
    pub fn get(&self) -> SyncStats {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, result: &Result<SyncReport, SyncError>, at: DateTime<Utc>) {
        let mut stats = self.0.lock().unwrap_or_else(|e| e.into_inner());
        stats.cycles += 1;
        stats.last_attempt = Some(at);
        stats.last_outcome = match result {
            Ok(report) => {
                stats.rows_uploaded += report.total_rows();
                stats.last_success = Some(at);
                SyncOutcome::Synced {
                    rows: report.total_rows(),
                    skipped: report.skipped.len(),
                }
            }
            Err(e) => {
                stats.failed_cycles += 1;
                SyncOutcome::Failed(e.to_string())
            }
        };
    }
}

pub struct SyncEngine<R> {
    remote: R,
    tracker: Arc<SyncStateTracker>,
    settings: SyncSettings,
    shutdown: Shutdown,
    stats: SyncStatsHandle,
}

impl<R: RemoteStore> SyncEngine<R> {
    pub fn new(
        remote: R,
        tracker: Arc<SyncStateTracker>,
        settings: SyncSettings,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            remote,
            tracker,
            settings,
            shutdown,
            stats: SyncStatsHandle::default(),
        }
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn stats(&self) -> SyncStats {
        self.stats.get()
    }

    pub fn stats_handle(&self) -> SyncStatsHandle {
        self.stats.clone()
    }

    /// Background loop: one cycle after the initial delay, then one per
    /// interval until shutdown. The final cycle at shutdown is left to the
    /// caller so it can run after the last flush.
    pub fn run(&self) {
        if !self.shutdown.sleep(self.settings.initial_delay) {
            return;
        }
        loop {
            self.run_cycle();
            if !self.shutdown.sleep(self.settings.interval) {
                break;
            }
        }
        debug!("sync loop stopped");
    }

    /// Runs one cycle and logs the outcome instead of returning it.
    pub fn run_cycle(&self) -> Option<SyncReport> {
        match self.sync_once() {
            Ok(report) => {
                if report.total_rows() > 0 || !report.skipped.is_empty() {
                    info!(
                        rows = report.total_rows(),
                        types = report.rows.len(),
                        skipped = report.skipped.len(),
                        "sync cycle finished"
                    );
                } else {
                    debug!("sync cycle finished, nothing pending");
                }
                Some(report)
            }
            Err(e) => {
                warn!(error = %e, "sync cycle abandoned");
                None
            }
        }
    }

    /// Uploads every pending range once and records the outcome in the
    /// stats.
    pub fn sync_once(&self) -> Result<SyncReport, SyncError> {
        let result = self.cycle();
        self.stats.record(&result, Utc::now());
        result
    }

    fn cycle(&self) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();
        let pending = self.tracker.pending();
        if pending.is_empty() {
            return Ok(report);
        }

        self.with_retry("authenticate", || self.remote.authenticate())
            .map_err(SyncError::Auth)?;
        let folder = self.resolve_folder()?;

        for range in pending {
            let hardware_type = range.hardware_type;
            match self.upload_range(&folder, &range) {
                Ok(rows) => {
                    report.rows.insert(hardware_type, rows);
                }
                Err(e) => {
                    warn!(hardware_type = %hardware_type, error = %e, "upload skipped");
                    report.skipped.push(hardware_type);
                }
            }
        }
        Ok(report)
    }

    fn resolve_folder(&self) -> Result<String, SyncError> {
        if let Some(id) = self.tracker.device_folder_id() {
            let exists = self
                .with_retry("folder_exists", || self.remote.folder_exists(&id))
                .map_err(SyncError::Folder)?;
            if exists {
                return Ok(id);
            }
            info!(folder_id = %id, "device folder no longer exists, resolving again");
            if let Err(e) = self.tracker.set_device_folder_id(None) {
                warn!(error = %e, "cannot clear cached folder id");
            }
        }

        let shared = &self.settings.shared_folder_id;
        let name = &self.settings.device_id;
        let found = self
            .with_retry("find_folder", || self.remote.find_folder(shared, name))
            .map_err(SyncError::Folder)?;
        let id = match found {
            Some(id) => id,
            None => {
                let id = self
                    .with_retry("create_folder", || self.remote.create_folder(shared, name))
                    .map_err(SyncError::Folder)?;
                info!(folder_id = %id, "device folder created");
                id
            }
        };
        if let Err(e) = self.tracker.set_device_folder_id(Some(id.clone())) {
            warn!(error = %e, "cannot persist folder id");
        }
        Ok(id)
    }

    fn upload_range(&self, folder: &str, range: &PendingRange) -> Result<u64, SyncError> {
        let hardware_type = range.hardware_type;
        let mut start_row = range.start_row;
        let (mut header, mut rows) = content::read_range(&range.path, start_row, range.end_row)?;
        if rows.is_empty() {
            let Some(restarted) = self.recount(range)? else {
                return Ok(0);
            };
            start_row = restarted.start_row;
            (header, rows) = content::read_range(&restarted.path, start_row, restarted.end_row)?;
            if rows.is_empty() {
                return Ok(0);
            }
        }

        let name = hardware_type.file_name();
        let existing = self.with_retry("find_file", || self.remote.find_file(folder, &name))?;

        let file_id = match existing {
            Some(id) => match self.with_retry("download", || self.remote.download(&id)) {
                Ok(current) => {
                    let merged = content::append(&current, &header, &rows)?;
                    self.with_retry("update_file", || self.remote.update_file(&id, &merged))?;
                    id
                }
                Err(RemoteError::NotFound(_)) => {
                    debug!(hardware_type = %hardware_type, "remote file vanished, recreating");
                    if let Err(e) = self.tracker.clear_remote_file_id(hardware_type) {
                        warn!(error = %e, "cannot clear remote file id");
                    }
                    self.create(folder, &name, &header, &rows)?
                }
                // Recreating here could overwrite content we failed to read
                Err(e) => return Err(SyncError::Remote(e)),
            },
            None => self.create(folder, &name, &header, &rows)?,
        };

        let uploaded = rows.len() as u64;
        self.tracker
            .mark_uploaded(hardware_type, start_row + uploaded, &file_id)?;
        debug!(hardware_type = %hardware_type, rows = uploaded, file_id = %file_id, "rows uploaded");
        Ok(uploaded)
    }

    /// Handles a pending range that is not in the local file. A file shorter
    /// than the upload cursor was replaced and all of its rows are pending
    /// again; otherwise only the row count is corrected.
    fn recount(&self, range: &PendingRange) -> Result<Option<PendingRange>, SyncError> {
        let hardware_type = range.hardware_type;
        let local_rows = count_rows(&range.path)?;
        warn!(
            hardware_type = %hardware_type,
            start = range.start_row,
            end = range.end_row,
            local_rows,
            "pending rows missing from local file, recounting"
        );
        if local_rows >= range.start_row {
            self.tracker
                .observe_total_rows(hardware_type, &range.path, local_rows)?;
            return Ok(None);
        }
        self.tracker
            .restart_file(hardware_type, &range.path, local_rows)?;
        Ok((local_rows > 0).then(|| PendingRange {
            hardware_type,
            path: range.path.clone(),
            start_row: 0,
            end_row: local_rows,
        }))
    }

    fn create(
        &self,
        folder: &str,
        name: &str,
        header: &csv::StringRecord,
        rows: &[csv::StringRecord],
    ) -> Result<String, SyncError> {
        let body = content::render_new(header, rows)?;
        Ok(self.with_retry("create_file", || self.remote.create_file(folder, name, &body))?)
    }

    /// Repeats `f` while it fails with a transient error, up to the
    /// configured attempt count. A shutdown request stops the waiting.
    fn with_retry<T>(
        &self,
        operation: &str,
        mut f: impl FnMut() -> Result<T, RemoteError>,
    ) -> Result<T, RemoteError> {
        let mut attempt = 1;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.settings.retry_attempts => {
                    warn!(operation, attempt, error = %e, "remote request failed, retrying");
                    if !self.shutdown.sleep(self.settings.retry_delay) {
                        return Err(e);
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

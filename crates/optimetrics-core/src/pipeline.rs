//! One collection tick and one flush, wired from the collector through the
//! classifier and the delta buffer into the storage sinks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use tracing::{debug, info, warn};

use crate::buffer::DeltaBuffer;
use crate::classifier::{CATEGORY_LABEL, WorkloadClassifier};
use crate::collector::{AdapterState, Collector};
use crate::context::AppContext;
use crate::model::{HardwareType, Snapshot};
use crate::storage::{
    CategorizedStore, CompressionResult, RollingWriter, SessionState, StorageError,
    SyncStateTracker,
};
use crate::sync::{SyncStats, SyncStatsHandle};

type CompressionJob = JoinHandle<Result<CompressionResult, StorageError>>;

/// Rows written by one flush.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub snapshots: usize,
    pub categorized: BTreeMap<HardwareType, u64>,
    pub rolling_rows: usize,
}

/// Point-in-time view of the pipeline and of the upload backlog.
#[derive(Debug, Clone)]
pub struct PipelineStatus {
    pub paused: bool,
    pub adapters: Vec<(&'static str, AdapterState)>,
    pub buffered: usize,
    pub dropped: u64,
    pub snapshots_retained: u64,
    /// Rows written locally and not yet uploaded, per type.
    pub pending_rows: BTreeMap<HardwareType, u64>,
    /// Last confirmed upload.
    pub last_sync: Option<DateTime<Utc>>,
    /// Present once a sync engine is attached.
    pub sync: Option<SyncStats>,
}

pub struct Pipeline {
    collector: Collector,
    buffer: DeltaBuffer,
    classifier: Option<WorkloadClassifier>,
    store: Option<CategorizedStore>,
    rolling: Option<RollingWriter>,
    tracker: Arc<SyncStateTracker>,
    sync_stats: Option<SyncStatsHandle>,
    compress_after_days: u32,
    last_compress: Option<(NaiveDate, u32)>,
    compression: Option<CompressionJob>,
    paused: bool,
    session: SessionState,
}

impl Pipeline {
    /// `collector` must be initialized and carry the device id.
    pub fn new(
        ctx: &AppContext,
        collector: Collector,
        tracker: Arc<SyncStateTracker>,
    ) -> Result<Self, StorageError> {
        let config = &ctx.config;
        let mode = config.storage.mode;
        let store = if mode.categorized() {
            Some(CategorizedStore::open(&ctx.device_dir, &ctx.device_id, Arc::clone(&tracker))?)
        } else {
            None
        };
        let rolling = if mode.rolling() {
            Some(RollingWriter::new(
                &ctx.device_dir,
                &ctx.device_id,
                config.storage.max_file_size,
            )?)
        } else {
            None
        };
        let classifier = config
            .classification
            .enabled
            .then(|| WorkloadClassifier::new(&config.classification));

        Ok(Self {
            collector,
            buffer: DeltaBuffer::new(
                config.general.delta_threshold_percent,
                config.general.batch_size,
            ),
            classifier,
            store,
            rolling,
            tracker,
            sync_stats: None,
            compress_after_days: config.storage.compress_after_days,
            last_compress: None,
            compression: None,
            paused: false,
            session: SessionState::new(ctx.device_id.clone(), Utc::now()),
        })
    }

    /// Reports the stats of a sync engine in [`status`](Self::status).
    pub fn attach_sync_stats(&mut self, stats: SyncStatsHandle) {
        self.sync_stats = Some(stats);
    }

    pub fn buffer(&self) -> &DeltaBuffer {
        &self.buffer
    }

    pub fn store(&self) -> Option<&CategorizedStore> {
        self.store.as_ref()
    }

    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Stops collecting until [`resume`](Self::resume). Buffered snapshots
    /// are kept and still flushed.
    pub fn pause(&mut self) {
        if !self.paused {
            info!(buffered = self.buffer.len(), "collection paused");
            self.paused = true;
        }
    }

    pub fn resume(&mut self) {
        if self.paused {
            info!("collection resumed");
            self.paused = false;
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn status(&self) -> PipelineStatus {
        let state = self.tracker.state();
        let pending_rows = state
            .files
            .iter()
            .filter(|(_, c)| c.total_rows > c.last_row_uploaded)
            .map(|(t, c)| (*t, c.total_rows - c.last_row_uploaded))
            .collect();
        PipelineStatus {
            paused: self.paused,
            adapters: self.collector.adapter_states(),
            buffered: self.buffer.len(),
            dropped: self.buffer.dropped(),
            snapshots_retained: self.session.snapshots_retained,
            pending_rows,
            last_sync: state.last_sync,
            sync: self.sync_stats.as_ref().map(SyncStatsHandle::get),
        }
    }

    pub fn tick(&mut self) -> bool {
        self.tick_at(Utc::now())
    }

    /// Collects one snapshot and offers it to the buffer. Returns whether it
    /// was retained; always false while paused.
    pub fn tick_at(&mut self, timestamp: DateTime<Utc>) -> bool {
        if self.paused {
            return false;
        }
        let mut snapshot = self.collector.collect_snapshot_at(timestamp);
        self.label(&mut snapshot);
        let retained = self.buffer.add(snapshot);
        if retained {
            self.session.last_snapshot = Some(timestamp);
            self.session.snapshots_retained += 1;
        }
        retained
    }

    fn label(&self, snapshot: &mut Snapshot) {
        let Some(classifier) = &self.classifier else {
            return;
        };
        classifier.update(snapshot);
        if let Some(category) = classifier.current() {
            snapshot.set_label(CATEGORY_LABEL, category.name);
        }
    }

    pub fn should_flush(&self) -> bool {
        self.buffer.is_full()
    }

    /// Drains the buffer into every configured sink.
    pub fn flush(&mut self) -> FlushReport {
        let batch = self.buffer.get_batch();
        let mut report = FlushReport {
            snapshots: batch.len(),
            ..FlushReport::default()
        };
        if batch.is_empty() {
            return report;
        }

        if let Some(store) = &self.store {
            report.categorized = store.write_batch(&batch);
        }
        if let Some(rolling) = &mut self.rolling {
            match rolling.write_batch(&batch) {
                Ok(n) => report.rolling_rows = n,
                Err(e) => warn!(error = %e, snapshots = batch.len(), "rolling write failed"),
            }
        }
        debug!(
            snapshots = report.snapshots,
            types = report.categorized.len(),
            rolling_rows = report.rolling_rows,
            "batch flushed"
        );
        report
    }

    /// Starts a compression sweep on a background thread once per
    /// wall-clock hour. Returns whether a sweep was started.
    pub fn maybe_compress(&mut self, now: DateTime<Utc>) -> bool {
        self.reap_compression(false);
        let hour = (now.date_naive(), now.hour());
        if self.last_compress == Some(hour) {
            return false;
        }
        if self.compression.is_some() {
            debug!("previous compression sweep still running");
            return false;
        }
        self.last_compress = Some(hour);
        let Some(rolling) = &self.rolling else {
            return false;
        };

        let sweep = rolling.sweep(self.compress_after_days, now.date_naive());
        match thread::Builder::new()
            .name("compress".into())
            .spawn(move || sweep.run())
        {
            Ok(handle) => {
                self.compression = Some(handle);
                true
            }
            Err(e) => {
                warn!(error = %e, "cannot start compression thread");
                false
            }
        }
    }

    /// Collects the result of a background sweep: once it has finished, or
    /// by waiting for it when `wait` is set.
    fn reap_compression(&mut self, wait: bool) -> Option<CompressionResult> {
        let handle = self.compression.take_if(|h| wait || h.is_finished())?;
        match handle.join() {
            Ok(result) => log_compression(result),
            Err(_) => {
                warn!("compression thread panicked");
                None
            }
        }
    }

    /// Waits for a running background sweep.
    pub fn wait_compression(&mut self) -> Option<CompressionResult> {
        self.reap_compression(true)
    }

    /// Compresses aged rolling files on the calling thread. `None` without a
    /// rolling sink.
    pub fn compress(&self, today: NaiveDate) -> Option<CompressionResult> {
        let rolling = self.rolling.as_ref()?;
        log_compression(rolling.compress_aged(self.compress_after_days, today))
    }

    /// Final flush and compression, then adapter cleanup. Saves the session
    /// record under `data_dir`.
    pub fn finish(&mut self, data_dir: &std::path::Path) -> FlushReport {
        let report = self.flush();
        if let Some(store) = &self.store
            && let Err(e) = store.flush()
        {
            warn!(error = %e, "final categorized flush failed");
        }
        if let Some(rolling) = &mut self.rolling
            && let Err(e) = rolling.flush()
        {
            warn!(error = %e, "final rolling flush failed");
        }
        self.reap_compression(true);
        self.compress(Utc::now().date_naive());
        self.collector.cleanup();
        if let Err(e) = self.session.save(data_dir) {
            warn!(error = %e, "cannot save session state");
        }
        report
    }
}

fn log_compression(result: Result<CompressionResult, StorageError>) -> Option<CompressionResult> {
    match result {
        Ok(result) => {
            if result.failures > 0 {
                warn!(failures = result.failures, "aged files left uncompressed");
            }
            Some(result)
        }
        Err(e) => {
            warn!(error = %e, "compression sweep failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{KernelPaths, MockFs};
    use crate::config::{Config, GeneralConfig, StorageMode};
    use crate::storage::tabular::count_rows;
    use crate::sync::{MemoryRemote, SyncEngine, SyncOutcome, SyncSettings};
    use crate::util::Shutdown;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    const DEVICE: &str = "00112233445566778899aabbccddeeff";

    fn setup(dir: &TempDir, mode: StorageMode, batch_size: usize) -> (Pipeline, MockFs) {
        let mut config = Config::default();
        config.storage.data_dir = dir.path().to_path_buf();
        config.storage.mode = mode;
        config.general = GeneralConfig {
            batch_size,
            collect_gpu: false,
            ..GeneralConfig::default()
        };
        let ctx = AppContext::new(config, DEVICE, Shutdown::new());

        let fs = MockFs::typical_system();
        fs.set_cpu_jiffies(1000, 1000);
        let mut collector = Collector::linux(fs.clone(), KernelPaths::default(), &ctx.config.general);
        collector.initialize();
        collector.set_device_id(DEVICE);

        let tracker = Arc::new(ctx.load_sync_tracker());
        (Pipeline::new(&ctx, collector, tracker).unwrap(), fs)
    }

    #[test]
    fn test_rising_cpu_end_to_end() {
        let dir = TempDir::new().unwrap();
        let (mut pipeline, fs) = setup(&dir, StorageMode::Categorized, 3);
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();

        // 10%, 50%, 90% busy between consecutive ticks
        for (i, (busy, idle)) in [(1010, 1090), (1060, 1140), (1150, 1150)].into_iter().enumerate() {
            fs.set_cpu_jiffies(busy, idle);
            assert!(pipeline.tick_at(start + Duration::seconds(i as i64)));
        }
        assert!(pipeline.should_flush());
        assert_eq!(pipeline.buffer().len(), 3);

        let report = pipeline.flush();
        assert_eq!(report.snapshots, 3);
        assert_eq!(report.categorized.get(&HardwareType::Cpu), Some(&3));
        assert!(pipeline.buffer().is_empty());

        let path = pipeline.store().unwrap().path(HardwareType::Cpu);
        assert_eq!(count_rows(&path).unwrap(), 3);
        let mut reader = csv::Reader::from_path(&path).unwrap();
        let column = reader
            .headers()
            .unwrap()
            .iter()
            .position(|c| c == "total_utilization")
            .unwrap();
        let values: Vec<f64> = reader
            .records()
            .map(|r| r.unwrap()[column].parse().unwrap())
            .collect();
        assert_eq!(values, vec![10.0, 50.0, 90.0]);
    }

    #[test]
    fn test_session_counts_retained_snapshots() {
        let dir = TempDir::new().unwrap();
        let (mut pipeline, fs) = setup(&dir, StorageMode::Categorized, 60);
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();

        let mut busy = 1000;
        for i in 0..4 {
            busy += 50;
            fs.set_cpu_jiffies(busy, 1000 + 50 * (i + 1));
            pipeline.tick_at(start + Duration::seconds(i as i64));
        }
        assert_eq!(
            pipeline.session().snapshots_retained as usize,
            pipeline.buffer().len()
        );
        assert!(pipeline.session().last_snapshot.is_some());
    }

    #[test]
    fn test_both_sinks_and_finish() {
        let dir = TempDir::new().unwrap();
        let (mut pipeline, fs) = setup(&dir, StorageMode::Both, 60);
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        fs.set_cpu_jiffies(1010, 1090);
        pipeline.tick_at(start);

        let report = pipeline.finish(dir.path());
        assert_eq!(report.snapshots, 1);
        assert_eq!(report.rolling_rows, 1);
        assert!(report.categorized.contains_key(&HardwareType::Memory));

        let session = SessionState::load(dir.path()).unwrap();
        assert_eq!(session.hardware_id, DEVICE);
        assert_eq!(session.last_snapshot, Some(start));
        assert!(pipeline.flush().categorized.is_empty());
    }

    #[test]
    fn test_compression_runs_once_per_hour() {
        let dir = TempDir::new().unwrap();
        let (mut pipeline, _fs) = setup(&dir, StorageMode::Rolling, 60);
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 9, 15, 0).unwrap();
        assert!(pipeline.maybe_compress(now));
        assert!(pipeline.wait_compression().is_some());
        assert!(!pipeline.maybe_compress(now + Duration::minutes(30)));
        assert!(pipeline.maybe_compress(now + Duration::minutes(50)));
        pipeline.wait_compression();
    }

    #[test]
    fn test_aged_rolling_file_compressed_in_background() {
        let dir = TempDir::new().unwrap();
        let (mut pipeline, _fs) = setup(&dir, StorageMode::Rolling, 60);
        let aged = dir.path().join(DEVICE).join("metrics_00112233_2024-02-01.csv");
        std::fs::write(&aged, "timestamp,hardware_id,ram_percent\n").unwrap();

        let now = Utc.with_ymd_and_hms(2024, 3, 1, 9, 15, 0).unwrap();
        assert!(pipeline.maybe_compress(now));
        let result = pipeline.wait_compression().unwrap();
        assert_eq!(result.files_compressed, 1);
        assert!(!aged.exists());
        assert!(aged.with_extension("csv.zst").exists());
    }

    #[test]
    fn test_categorized_only_has_no_compression() {
        let dir = TempDir::new().unwrap();
        let (mut pipeline, _fs) = setup(&dir, StorageMode::Categorized, 60);
        assert!(!pipeline.maybe_compress(Utc::now()));
        assert!(pipeline.wait_compression().is_none());
    }

    #[test]
    fn test_paused_pipeline_skips_ticks_and_keeps_buffer() {
        let dir = TempDir::new().unwrap();
        let (mut pipeline, fs) = setup(&dir, StorageMode::Categorized, 60);
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        fs.set_cpu_jiffies(1010, 1090);
        assert!(pipeline.tick_at(start));

        pipeline.pause();
        assert!(pipeline.is_paused());
        fs.set_cpu_jiffies(1500, 1100);
        assert!(!pipeline.tick_at(start + Duration::seconds(1)));
        assert_eq!(pipeline.buffer().len(), 1);
        assert_eq!(pipeline.session().snapshots_retained, 1);
        assert!(pipeline.status().paused);

        pipeline.resume();
        assert!(pipeline.tick_at(start + Duration::seconds(2)));
        assert_eq!(pipeline.buffer().len(), 2);

        // Buffered snapshots still drain while paused
        pipeline.pause();
        assert_eq!(pipeline.flush().snapshots, 2);
    }

    #[test]
    fn test_status_reports_backlog_and_sync_outcome() {
        let dir = TempDir::new().unwrap();
        let (mut pipeline, fs) = setup(&dir, StorageMode::Categorized, 60);
        fs.set_cpu_jiffies(1010, 1090);
        pipeline.tick_at(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap());
        pipeline.flush();

        let status = pipeline.status();
        assert!(!status.paused);
        assert_eq!(status.buffered, 0);
        assert_eq!(status.pending_rows.get(&HardwareType::Cpu), Some(&1));
        assert!(status.last_sync.is_none());
        assert!(status.sync.is_none());

        let remote = MemoryRemote::new();
        remote.add_folder("shared", "root", "shared");
        let settings = SyncSettings {
            shared_folder_id: "shared".into(),
            device_id: DEVICE.into(),
            retry_attempts: 1,
            retry_delay: std::time::Duration::ZERO,
            initial_delay: std::time::Duration::ZERO,
            interval: std::time::Duration::ZERO,
        };
        let tracker = Arc::clone(pipeline.store().unwrap().tracker());
        let engine = SyncEngine::new(remote, tracker, settings, Shutdown::new());
        pipeline.attach_sync_stats(engine.stats_handle());
        engine.sync_once().unwrap();

        let status = pipeline.status();
        assert!(status.pending_rows.is_empty());
        assert!(status.last_sync.is_some());
        let sync = status.sync.unwrap();
        assert_eq!(sync.cycles, 1);
        assert!(matches!(sync.last_outcome, SyncOutcome::Synced { skipped: 0, .. }));
    }
}

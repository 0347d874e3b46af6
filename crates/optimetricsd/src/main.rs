//! optimetricsd - hardware telemetry daemon.
//!
//! Samples hardware metrics at a fixed interval, keeps the snapshots that
//! changed, stores them per hardware type and uploads new rows to Google
//! Drive in the background.

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Releases unused memory back to the operating system after a flush.
fn release_memory_to_os() {
    // SAFETY: mallctl is called with a valid NUL-terminated name and null
    // in/out pointers, which arena.0.purge accepts.
    unsafe {
        tikv_jemalloc_sys::mallctl(
            c"arena.0.purge".as_ptr().cast(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            0,
        );
    }
}

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use optimetrics_core::collector::{Collector, KernelPaths};
#[cfg(target_os = "linux")]
use optimetrics_core::collector::RealFs;
#[cfg(not(target_os = "linux"))]
use optimetrics_core::collector::mock::MockFs;
use optimetrics_core::config::Config;
use optimetrics_core::context::AppContext;
use optimetrics_core::pipeline::Pipeline;
use optimetrics_core::storage::{IdentityComponents, SessionState};
use optimetrics_core::sync::{DriveClient, SyncEngine, SyncSettings, SyncStatsHandle};
use optimetrics_core::util::{Shutdown, format_size};

/// Ticks between memory and buffer statistics in the log.
const STATS_EVERY_TICKS: u64 = 600;

/// Hardware telemetry daemon.
#[derive(Parser)]
#[command(name = "optimetricsd", about = "Hardware telemetry daemon", version)]
struct Args {
    /// Configuration file (TOML). Defaults are used when omitted.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Overrides storage.data_dir from the configuration.
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Run for this many seconds, then shut down cleanly.
    #[arg(long, value_name = "SECONDS")]
    test: Option<u64>,

    /// Path to /proc filesystem (for testing/mocking).
    #[arg(long, default_value = "/proc")]
    proc_path: PathBuf,

    /// Path to /sys filesystem (for testing/mocking).
    #[arg(long, default_value = "/sys")]
    sys_path: PathBuf,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only warnings and errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Installs the fmt subscriber. `RUST_LOG` wins, then the CLI flags, then
/// the configured level.
fn init_logging(verbose: u8, quiet: bool, config_level: &str) {
    let level = if quiet {
        "warn"
    } else {
        match verbose {
            0 => config_level,
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("optimetricsd={level},optimetrics_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("optimetricsd: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(dir) = &args.data_dir {
        config.storage.data_dir = dir.clone();
    }

    init_logging(args.verbose, args.quiet, &config.logging.level);

    match run(args, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("{}", message);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args, config: Config) -> Result<(), String> {
    info!(
        "optimetricsd {} ({}, {}) starting",
        env!("CARGO_PKG_VERSION"),
        optimetrics_core::BUILD_REVISION,
        optimetrics_core::COMMIT_DATE
    );
    info!(
        "Config: interval={}s, data_dir={}, mode={:?}, batch={}, threshold={}%",
        config.general.interval_secs,
        config.storage.data_dir.display(),
        config.storage.mode,
        config.general.batch_size,
        config.general.delta_threshold_percent
    );
    info!(
        "Storage policy: max_file_size={}, compress_after_days={}",
        format_size(config.storage.max_file_size),
        config.storage.compress_after_days
    );

    let paths = KernelPaths {
        proc: args.proc_path.clone(),
        sys: args.sys_path.clone(),
    };
    #[cfg(target_os = "linux")]
    let fs = RealFs::new();
    #[cfg(not(target_os = "linux"))]
    let fs = MockFs::typical_system();

    let mut collector = Collector::linux(fs.clone(), paths.clone(), &config.general);
    if collector.initialize() == 0 {
        return Err("no hardware adapter could be initialized".into());
    }

    let descriptors = collector.descriptors();
    let mut components =
        IdentityComponents::from_descriptors(descriptors.iter().map(|(name, d)| (*name, d)));
    if config.hardware_id.include_motherboard {
        components = components.with_motherboard(&fs, &paths);
    }

    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        signal.request();
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    let ctx = AppContext::establish(config, &components, shutdown.clone())
        .map_err(|e| format!("cannot initialize data directory: {}", e))?;
    collector.set_device_id(ctx.device_id.clone());
    info!("Device {} at {}", ctx.device_id, ctx.device_dir.display());

    if let Some(previous) = SessionState::load(ctx.data_dir())
        && let Some(offline) = previous.offline_for(Utc::now())
    {
        info!(
            "Previous session stored {} snapshots, offline for {}s",
            previous.snapshots_retained,
            offline.num_seconds()
        );
    }

    let tracker = Arc::new(ctx.load_sync_tracker());
    let mut pipeline = Pipeline::new(&ctx, collector, Arc::clone(&tracker))
        .map_err(|e| format!("cannot open storage: {}", e))?;
    let sync = start_sync(&ctx, tracker)?.map(|(handle, stats)| {
        pipeline.attach_sync_stats(stats);
        handle
    });

    let interval = Duration::from_secs(ctx.config.general.interval_secs);
    let deadline = args.test.map(|secs| {
        info!("Test mode: running for {}s", secs);
        Instant::now() + Duration::from_secs(secs)
    });
    let mut ticks: u64 = 0;

    info!("Starting collection loop");

    while shutdown.is_running() {
        let started = Instant::now();
        ticks += 1;

        pipeline.tick();
        if pipeline.should_flush() {
            let report = pipeline.flush();
            debug!(
                "Flushed {} snapshots into {} files",
                report.snapshots,
                report.categorized.len()
            );
            release_memory_to_os();
        }

        // Compression sweep when the hour changes
        pipeline.maybe_compress(Utc::now());

        if ticks.is_multiple_of(STATS_EVERY_TICKS) {
            let status = pipeline.status();
            info!(
                "Stats: ticks={}, buffered={}, dropped_unchanged={}, retained_total={}, pending_rows={}",
                ticks,
                status.buffered,
                status.dropped,
                status.snapshots_retained,
                status.pending_rows.values().sum::<u64>()
            );
            if let Some(sync) = status.sync {
                info!(
                    "Sync: cycles={}, failed={}, rows_uploaded={}, last={:?}",
                    sync.cycles, sync.failed_cycles, sync.rows_uploaded, sync.last_outcome
                );
            }
        }

        if deadline.is_some_and(|d| Instant::now() >= d) {
            info!("Test duration reached");
            shutdown.request();
            break;
        }

        shutdown.sleep(interval.saturating_sub(started.elapsed()));
    }

    // Graceful shutdown
    info!("Shutting down...");
    let report = pipeline.finish(ctx.data_dir());
    if report.snapshots > 0 {
        info!("Flushed {} pending snapshots", report.snapshots);
    }

    if let Some(handle) = sync {
        match handle.join() {
            Ok(engine) => {
                info!("Final sync");
                engine.run_cycle();
            }
            Err(_) => error!("Sync thread panicked"),
        }
    }

    info!("Shutdown complete");
    Ok(())
}

type SyncThread = (JoinHandle<SyncEngine<DriveClient>>, SyncStatsHandle);

/// Starts the background sync loop when cloud sync is enabled. The thread
/// hands the engine back on exit for the final cycle.
fn start_sync(
    ctx: &AppContext,
    tracker: Arc<optimetrics_core::storage::SyncStateTracker>,
) -> Result<Option<SyncThread>, String> {
    let cloud = &ctx.config.cloud;
    if !cloud.enabled {
        debug!("Cloud sync: disabled");
        return Ok(None);
    }
    let settings = SyncSettings::from_config(cloud, &ctx.device_id)
        .ok_or_else(|| "cloud.shared_folder_id is required for sync".to_string())?;
    let client = DriveClient::from_config(cloud).map_err(|e| format!("cloud sync: {}", e))?;
    info!(
        "Cloud sync: enabled, every {} min, first attempt in {}s",
        cloud.sync_interval_minutes, cloud.initial_delay_secs
    );

    let engine = SyncEngine::new(client, tracker, settings, ctx.shutdown.clone());
    let stats = engine.stats_handle();
    thread::Builder::new()
        .name("sync".into())
        .spawn(move || {
            engine.run();
            engine
        })
        .map(|handle| Some((handle, stats)))
        .map_err(|e| format!("cannot start sync thread: {}", e))
}

//! The capability interface every hardware adapter implements, and the
//! availability bookkeeping they share.

use std::fmt;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::collector::procfs::ParseError;
use crate::model::{HardwareDescriptor, MetricReading, Readings, Value};

/// Error type for adapter read failures.
#[derive(Debug)]
pub enum CollectError {
    /// I/O error reading a kernel interface.
    Io(std::io::Error),
    /// Parse error in kernel-provided text.
    Parse(ParseError),
    /// Vendor library reported an error.
    Driver(String),
}

impl fmt::Display for CollectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectError::Io(e) => write!(f, "I/O error: {}", e),
            CollectError::Parse(e) => write!(f, "{}", e),
            CollectError::Driver(msg) => write!(f, "driver error: {}", msg),
        }
    }
}

impl std::error::Error for CollectError {}

impl From<std::io::Error> for CollectError {
    fn from(e: std::io::Error) -> Self {
        CollectError::Io(e)
    }
}

impl From<ParseError> for CollectError {
    fn from(e: ParseError) -> Self {
        CollectError::Parse(e)
    }
}

/// Roots of the kernel pseudo-filesystems the Linux adapters read.
#[derive(Debug, Clone)]
pub struct KernelPaths {
    pub proc: PathBuf,
    pub sys: PathBuf,
}

impl Default for KernelPaths {
    fn default() -> Self {
        Self {
            proc: PathBuf::from("/proc"),
            sys: PathBuf::from("/sys"),
        }
    }
}

/// Adapter availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Uninitialized,
    Initialized,
    /// Too many consecutive failed collects; skipped until the error count is reset.
    Degraded,
}

/// Error counting and state tracking shared by all adapters.
#[derive(Debug, Clone)]
pub struct AdapterHealth {
    source: &'static str,
    state: AdapterState,
    error_count: u32,
    max_errors: u32,
    last_error: Option<String>,
}

impl AdapterHealth {
    pub const DEFAULT_MAX_ERRORS: u32 = 10;

    pub fn new(source: &'static str) -> Self {
        Self {
            source,
            state: AdapterState::Uninitialized,
            error_count: 0,
            max_errors: Self::DEFAULT_MAX_ERRORS,
            last_error: None,
        }
    }

    pub fn with_max_errors(mut self, max_errors: u32) -> Self {
        self.max_errors = max_errors.max(1);
        self
    }

    pub fn state(&self) -> AdapterState {
        self.state
    }

    /// `true` once initialized, including while degraded.
    pub fn is_initialized(&self) -> bool {
        self.state != AdapterState::Uninitialized
    }

    /// `true` only when the adapter should be collected from.
    pub fn is_available(&self) -> bool {
        self.state == AdapterState::Initialized
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn mark_initialized(&mut self) {
        self.state = AdapterState::Initialized;
        self.error_count = 0;
    }

    pub fn mark_uninitialized(&mut self) {
        self.state = AdapterState::Uninitialized;
    }

    /// Counts one failed read. Crossing the threshold degrades the adapter.
    pub fn record_error(&mut self, operation: &str, error: &dyn fmt::Display) {
        self.error_count += 1;
        self.last_error = Some(format!("{}: {}", operation, error));
        debug!(
            adapter = self.source,
            operation,
            error = %error,
            count = self.error_count,
            "adapter read failed"
        );

        if self.state == AdapterState::Initialized && self.error_count >= self.max_errors {
            self.state = AdapterState::Degraded;
            warn!(
                adapter = self.source,
                errors = self.error_count,
                last_error = self.last_error.as_deref().unwrap_or(""),
                "adapter degraded, skipping it until reset"
            );
        }
    }

    /// Clears the error count and brings a degraded adapter back.
    pub fn reset_error_count(&mut self) {
        self.error_count = 0;
        if self.state == AdapterState::Degraded {
            self.state = AdapterState::Initialized;
        }
    }
}

/// A per-hardware-domain source of metric readings.
///
/// Implementations never panic or return errors from `collect`; failed reads
/// are recorded through [`AdapterHealth`] and the affected fields are omitted.
pub trait HardwareAdapter: Send {
    /// Short adapter name, also used as the `source` of its readings.
    fn name(&self) -> &'static str;

    /// Detects the hardware. Idempotent. `false` means the capability is absent
    /// and every later call is a no-op.
    fn initialize(&mut self) -> bool;

    /// Describes the physical source. Computed once and cached.
    fn hardware_info(&mut self) -> Option<HardwareDescriptor>;

    /// Reads the current metrics.
    fn collect(&mut self) -> Readings;

    /// Releases native handles. Idempotent.
    fn cleanup(&mut self);

    fn health(&self) -> &AdapterHealth;

    fn health_mut(&mut self) -> &mut AdapterHealth;

    fn is_initialized(&self) -> bool {
        self.health().is_initialized()
    }

    fn is_available(&self) -> bool {
        self.health().is_available()
    }

    fn reset_error_count(&mut self) {
        self.health_mut().reset_error_count();
    }
}

/// Accumulates one tick's readings and failures for an adapter.
pub(crate) struct ReadingSet {
    source: &'static str,
    readings: Readings,
    failures: u32,
}

impl ReadingSet {
    pub(crate) fn new(source: &'static str) -> Self {
        Self {
            source,
            readings: Readings::new(),
            failures: 0,
        }
    }

    pub(crate) fn add(&mut self, name: impl Into<String>, value: impl Into<Value>, unit: &str) {
        let name = name.into();
        let reading = MetricReading::new(name.clone(), value, unit, self.source);
        self.readings.insert(name, reading);
    }

    /// Adds an optional rate; `None` means no rate could be computed this tick.
    pub(crate) fn add_rate(&mut self, name: impl Into<String>, value: Option<f64>, unit: &str) {
        if let Some(v) = value {
            self.add(name, crate::model::round2(v), unit);
        }
    }

    pub(crate) fn fail(&mut self, health: &mut AdapterHealth, operation: &str, error: &dyn fmt::Display) {
        self.failures += 1;
        health.record_error(operation, error);
    }

    /// Finishes the tick: a fully successful collect clears the error count.
    pub(crate) fn finish(self, health: &mut AdapterHealth) -> Readings {
        if self.failures == 0 && health.error_count() > 0 {
            health.reset_error_count();
        }
        self.readings
    }
}

/// Replaces characters that do not belong in a column name.
pub(crate) fn sanitize_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_degrades_at_threshold() {
        let mut health = AdapterHealth::new("test").with_max_errors(3);
        health.mark_initialized();

        health.record_error("read", &"boom");
        health.record_error("read", &"boom");
        assert_eq!(health.state(), AdapterState::Initialized);

        health.record_error("read", &"boom");
        assert_eq!(health.state(), AdapterState::Degraded);
        assert!(health.is_initialized());
        assert!(!health.is_available());
        assert_eq!(health.last_error(), Some("read: boom"));

        health.reset_error_count();
        assert_eq!(health.state(), AdapterState::Initialized);
        assert_eq!(health.error_count(), 0);
    }

    #[test]
    fn test_default_threshold_is_ten() {
        let mut health = AdapterHealth::new("test");
        health.mark_initialized();
        for _ in 0..9 {
            health.record_error("read", &"boom");
        }
        assert!(health.is_available());
        health.record_error("read", &"boom");
        assert!(!health.is_available());
    }

    #[test]
    fn test_reading_set_success_resets_errors() {
        let mut health = AdapterHealth::new("test");
        health.mark_initialized();
        health.record_error("read", &"boom");

        let mut set = ReadingSet::new("test");
        set.add("a", 1.0, "%");
        set.add_rate("b", None, "MB/s");
        let readings = set.finish(&mut health);

        assert_eq!(readings.len(), 1);
        assert_eq!(health.error_count(), 0);

        // A tick with a failed read keeps the count
        let mut set = ReadingSet::new("test");
        set.fail(&mut health, "read", &"boom");
        set.finish(&mut health);
        assert_eq!(health.error_count(), 1);
    }

    #[test]
    fn test_sanitize_key() {
        assert_eq!(sanitize_key("enp0s31f6"), "enp0s31f6");
        assert_eq!(sanitize_key("br-1a2b.100"), "br_1a2b_100");
        assert_eq!(sanitize_key("Wi-Fi"), "wi_fi");
    }
}

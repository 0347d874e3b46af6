use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::collector::adapter::{AdapterState, HardwareAdapter, KernelPaths};
use crate::collector::cpu::CpuAdapter;
use crate::collector::disk::DiskAdapter;
use crate::collector::intel::IntelGpuAdapter;
use crate::collector::memory::MemoryAdapter;
use crate::collector::network::NetworkAdapter;
use crate::collector::nvidia::NvidiaGpuAdapter;
use crate::collector::traits::FileSystem;
use crate::config::GeneralConfig;
use crate::model::{HardwareDescriptor, Snapshot};

/// Ticks between attempts to bring degraded adapters back.
pub const DEGRADED_RETRY_TICKS: u64 = 60;

/// Owns the adapters and merges their readings into one snapshot per tick.
pub struct Collector {
    adapters: Vec<Box<dyn HardwareAdapter>>,
    device_id: String,
    ticks: u64,
}

impl Collector {
    pub fn new() -> Self {
        Self {
            adapters: Vec::new(),
            device_id: String::new(),
            ticks: 0,
        }
    }

    /// Builds the Linux adapter set selected by the collect toggles.
    pub fn linux<F>(fs: F, paths: KernelPaths, config: &GeneralConfig) -> Self
    where
        F: FileSystem + Clone + 'static,
    {
        let mut collector = Self::new();
        if config.collect_cpu {
            collector.add_adapter(Box::new(
                CpuAdapter::new(fs.clone(), paths.clone()).with_power(config.collect_power),
            ));
        }
        if config.collect_memory {
            collector.add_adapter(Box::new(MemoryAdapter::new(fs.clone(), paths.clone())));
        }
        if config.collect_disk {
            collector.add_adapter(Box::new(DiskAdapter::new(fs.clone(), paths.clone())));
        }
        if config.collect_network {
            collector.add_adapter(Box::new(NetworkAdapter::new(fs.clone(), paths.clone())));
        }
        if config.collect_gpu {
            collector.add_adapter(Box::new(NvidiaGpuAdapter::new()));
            collector.add_adapter(Box::new(IntelGpuAdapter::new(fs, paths)));
        }
        collector
    }

    pub fn add_adapter(&mut self, adapter: Box<dyn HardwareAdapter>) {
        self.adapters.push(adapter);
    }

    pub fn with_adapter(mut self, adapter: Box<dyn HardwareAdapter>) -> Self {
        self.add_adapter(adapter);
        self
    }

    pub fn set_device_id(&mut self, device_id: impl Into<String>) {
        self.device_id = device_id.into();
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Initializes every adapter and drops the ones whose hardware is absent.
    ///
    /// Returns the number of adapters left.
    pub fn initialize(&mut self) -> usize {
        self.adapters.retain_mut(|adapter| {
            if adapter.initialize() {
                info!(adapter = adapter.name(), "adapter initialized");
                true
            } else {
                info!(adapter = adapter.name(), "adapter unavailable, disabled");
                adapter.cleanup();
                false
            }
        });
        self.adapters.len()
    }

    /// Hardware descriptors of all initialized adapters.
    pub fn descriptors(&mut self) -> Vec<(&'static str, HardwareDescriptor)> {
        self.adapters
            .iter_mut()
            .filter_map(|a| {
                let name = a.name();
                a.hardware_info().map(|info| (name, info))
            })
            .collect()
    }

    pub fn adapter_states(&self) -> Vec<(&'static str, AdapterState)> {
        self.adapters
            .iter()
            .map(|a| (a.name(), a.health().state()))
            .collect()
    }

    pub fn collect_snapshot(&mut self) -> Snapshot {
        self.collect_snapshot_at(Utc::now())
    }

    /// Collects from every available adapter. Degraded adapters are skipped.
    pub fn collect_snapshot_at(&mut self, timestamp: DateTime<Utc>) -> Snapshot {
        self.ticks += 1;
        if self.ticks.is_multiple_of(DEGRADED_RETRY_TICKS) {
            for adapter in self.adapters.iter_mut() {
                if adapter.health().state() == AdapterState::Degraded {
                    debug!(adapter = adapter.name(), "retrying degraded adapter");
                    adapter.reset_error_count();
                }
            }
        }

        let mut snapshot = Snapshot::new(self.device_id.clone(), timestamp);
        for adapter in self.adapters.iter_mut() {
            if adapter.is_available() {
                snapshot.merge(adapter.collect());
            }
        }
        snapshot
    }

    /// Releases every adapter. Safe to call more than once.
    pub fn cleanup(&mut self) {
        for adapter in self.adapters.iter_mut() {
            adapter.cleanup();
        }
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

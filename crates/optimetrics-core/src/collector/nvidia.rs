//! NVIDIA GPU adapter backed by NVML.
//!
//! `libnvidia-ml` is loaded at runtime, so the adapter builds everywhere and
//! simply reports itself unavailable on machines without the driver.

use std::collections::BTreeSet;

use nvml_wrapper::Nvml;
use nvml_wrapper::enum_wrappers::device::{Clock, PcieUtilCounter, TemperatureSensor};
use nvml_wrapper::error::NvmlError;
use tracing::{debug, info};

use crate::collector::adapter::{AdapterHealth, HardwareAdapter, ReadingSet};
use crate::model::{HardwareDescriptor, Readings, round2};

/// Column name for metric `name` of GPU `index`.
pub fn gpu_key(index: u32, name: &str) -> String {
    format!("gpu{}_{}", index, name)
}

/// Unwraps an NVML result. Unsupported queries are silently skipped; every
/// other error is counted against the adapter.
fn nvml_read<T>(
    set: &mut ReadingSet,
    health: &mut AdapterHealth,
    operation: &str,
    result: Result<T, NvmlError>,
) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(NvmlError::NotSupported) => None,
        Err(e) => {
            set.fail(health, operation, &e);
            None
        }
    }
}

pub struct NvidiaGpuAdapter {
    nvml: Option<Nvml>,
    device_count: u32,
    health: AdapterHealth,
    info: Option<HardwareDescriptor>,
}

impl NvidiaGpuAdapter {
    pub fn new() -> Self {
        Self {
            nvml: None,
            device_count: 0,
            health: AdapterHealth::new("nvidia"),
            info: None,
        }
    }

    pub fn device_count(&self) -> u32 {
        self.device_count
    }
}

impl Default for NvidiaGpuAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareAdapter for NvidiaGpuAdapter {
    fn name(&self) -> &'static str {
        "nvidia"
    }

    fn initialize(&mut self) -> bool {
        if self.health.is_initialized() {
            return true;
        }

        let nvml = match Nvml::init() {
            Ok(nvml) => nvml,
            Err(e) => {
                debug!(error = %e, "NVML not available");
                return false;
            }
        };
        match nvml.device_count() {
            Ok(count) if count > 0 => {
                info!(gpus = count, "NVIDIA adapter initialized");
                self.device_count = count;
                self.nvml = Some(nvml);
                self.health.mark_initialized();
                true
            }
            Ok(_) => {
                debug!("NVML reports no devices");
                false
            }
            Err(e) => {
                debug!(error = %e, "NVML device count failed");
                false
            }
        }
    }

    fn hardware_info(&mut self) -> Option<HardwareDescriptor> {
        if let Some(info) = &self.info {
            return Some(info.clone());
        }
        let nvml = self.nvml.as_ref()?;

        let mut names = Vec::new();
        let mut uuid = None;
        let mut compute_capability = None;
        for index in 0..self.device_count {
            let Ok(device) = nvml.device_by_index(index) else {
                continue;
            };
            names.push(device.name().unwrap_or_else(|_| "Unknown NVIDIA GPU".to_string()));
            if index == 0 {
                uuid = device.uuid().ok();
                compute_capability = device
                    .cuda_compute_capability()
                    .ok()
                    .map(|c| format!("{}.{}", c.major, c.minor));
            }
        }

        let capabilities: BTreeSet<String> = [
            "gpu",
            "utilization",
            "vram",
            "temperature",
            "power",
            "clocks",
            "pcie",
            "encoder",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        let mut descriptor = HardwareDescriptor {
            vendor: "NVIDIA".to_string(),
            model: names.first().cloned().unwrap_or_default(),
            identifier: uuid.unwrap_or_else(|| "gpu0".to_string()),
            driver_version: nvml.sys_driver_version().ok(),
            capabilities,
            ..HardwareDescriptor::default()
        };
        descriptor
            .extra
            .insert("gpu_count".to_string(), self.device_count.into());
        descriptor.extra.insert("devices".to_string(), names.into());
        if let Some(cc) = compute_capability {
            descriptor
                .extra
                .insert("cuda_compute_capability".to_string(), cc.into());
        }

        self.info = Some(descriptor.clone());
        Some(descriptor)
    }

    fn collect(&mut self) -> Readings {
        if !self.health.is_available() {
            return Readings::new();
        }
        let Some(nvml) = self.nvml.as_ref() else {
            return Readings::new();
        };
        let health = &mut self.health;
        let mut set = ReadingSet::new("nvidia");

        for index in 0..self.device_count {
            let Some(device) = nvml_read(&mut set, health, "device_by_index", nvml.device_by_index(index))
            else {
                continue;
            };
            let key = |name: &str| gpu_key(index, name);

            if let Some(util) = nvml_read(&mut set, health, "utilization_rates", device.utilization_rates()) {
                set.add(key("utilization"), util.gpu, "%");
                set.add(key("memory_utilization"), util.memory, "%");
            }

            if let Some(mem) = nvml_read(&mut set, health, "memory_info", device.memory_info()) {
                let mb = |b: u64| round2(b as f64 / 1_048_576.0);
                set.add(key("vram_used_mb"), mb(mem.used), "MB");
                set.add(key("vram_total_mb"), mb(mem.total), "MB");
                set.add(key("vram_free_mb"), mb(mem.free), "MB");
                if mem.total > 0 {
                    let pct = mem.used as f64 * 100.0 / mem.total as f64;
                    set.add(key("vram_percent"), round2(pct), "%");
                }
            }

            if let Some(t) = nvml_read(&mut set, health, "temperature", device.temperature(TemperatureSensor::Gpu)) {
                set.add(key("temperature"), t, "C");
            }

            if let Some(mw) = nvml_read(&mut set, health, "power_usage", device.power_usage()) {
                set.add(key("power_watts"), round2(mw as f64 / 1000.0), "W");
            }
            if let Some(mw) = nvml_read(&mut set, health, "power_limit", device.enforced_power_limit()) {
                set.add(key("power_limit_watts"), round2(mw as f64 / 1000.0), "W");
            }

            for (clock, name) in [
                (Clock::Graphics, "core_clock_mhz"),
                (Clock::Memory, "memory_clock_mhz"),
                (Clock::SM, "sm_clock_mhz"),
            ] {
                if let Some(mhz) = nvml_read(&mut set, health, name, device.clock_info(clock)) {
                    set.add(key(name), mhz, "MHz");
                }
            }

            if let Some(pct) = nvml_read(&mut set, health, "fan_speed", device.fan_speed(0)) {
                set.add(key("fan_speed"), pct, "%");
            }

            for (counter, name) in [
                (PcieUtilCounter::Send, "pcie_tx_kbps"),
                (PcieUtilCounter::Receive, "pcie_rx_kbps"),
            ] {
                if let Some(kb) = nvml_read(&mut set, health, name, device.pcie_throughput(counter)) {
                    set.add(key(name), kb, "KB/s");
                }
            }

            if let Some(enc) = nvml_read(&mut set, health, "encoder", device.encoder_utilization()) {
                set.add(key("encoder_utilization"), enc.utilization, "%");
            }
            if let Some(dec) = nvml_read(&mut set, health, "decoder", device.decoder_utilization()) {
                set.add(key("decoder_utilization"), dec.utilization, "%");
            }

            if let Some(procs) = nvml_read(
                &mut set,
                health,
                "compute_processes",
                device.running_compute_processes(),
            ) {
                set.add(key("compute_processes"), procs.len() as u64, "count");
            }
            if let Some(procs) = nvml_read(
                &mut set,
                health,
                "graphics_processes",
                device.running_graphics_processes(),
            ) {
                set.add(key("graphics_processes"), procs.len() as u64, "count");
            }
        }

        set.finish(health)
    }

    fn cleanup(&mut self) {
        // Dropping the handle shuts NVML down
        self.nvml = None;
        self.device_count = 0;
        self.health.mark_uninitialized();
    }

    fn health(&self) -> &AdapterHealth {
        &self.health
    }

    fn health_mut(&mut self) -> &mut AdapterHealth {
        &mut self.health
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_key() {
        assert_eq!(gpu_key(0, "utilization"), "gpu0_utilization");
        assert_eq!(gpu_key(3, "vram_percent"), "gpu3_vram_percent");
    }

    #[test]
    fn test_initialize_never_panics_and_cleanup_is_idempotent() {
        let mut gpu = NvidiaGpuAdapter::new();
        let available = gpu.initialize();
        // Second call is a no-op either way
        assert_eq!(gpu.initialize(), available);
        if !available {
            assert!(gpu.collect().is_empty());
            assert!(gpu.hardware_info().is_none());
        }
        gpu.cleanup();
        gpu.cleanup();
        assert!(!gpu.is_initialized());
        assert!(gpu.collect().is_empty());
    }
}

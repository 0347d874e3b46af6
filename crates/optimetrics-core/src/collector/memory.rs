//! Memory adapter: RAM and swap usage from `/proc/meminfo`, swap traffic from
//! `/proc/vmstat`.

use std::collections::BTreeSet;

use tracing::debug;

use crate::collector::adapter::{AdapterHealth, HardwareAdapter, KernelPaths, ReadingSet};
use crate::collector::procfs::parser::{parse_meminfo, parse_vmstat};
use crate::collector::traits::FileSystem;
use crate::model::{HardwareDescriptor, Readings, round2};

const PAGE_SIZE: u64 = 4096;

fn kb_to_mb(kb: u64) -> f64 {
    round2(kb as f64 / 1024.0)
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        round2(part as f64 * 100.0 / whole as f64)
    }
}

pub struct MemoryAdapter<F: FileSystem> {
    fs: F,
    paths: KernelPaths,
    health: AdapterHealth,
    info: Option<HardwareDescriptor>,
}

impl<F: FileSystem> MemoryAdapter<F> {
    pub fn new(fs: F, paths: KernelPaths) -> Self {
        Self {
            fs,
            paths,
            health: AdapterHealth::new("memory"),
            info: None,
        }
    }
}

impl<F: FileSystem> HardwareAdapter for MemoryAdapter<F> {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn initialize(&mut self) -> bool {
        if self.health.is_initialized() {
            return true;
        }
        let path = self.paths.proc.join("meminfo");
        match self.fs.read_to_string(&path).map(|c| parse_meminfo(&c)) {
            Ok(Ok(_)) => {
                self.health.mark_initialized();
                true
            }
            Ok(Err(e)) => {
                debug!(error = %e, "memory adapter unavailable");
                false
            }
            Err(e) => {
                debug!(error = %e, "memory adapter unavailable");
                false
            }
        }
    }

    fn hardware_info(&mut self) -> Option<HardwareDescriptor> {
        if !self.health.is_initialized() {
            return None;
        }
        if let Some(info) = &self.info {
            return Some(info.clone());
        }

        let content = self.fs.read_to_string(&self.paths.proc.join("meminfo")).ok()?;
        let mem = parse_meminfo(&content).ok()?;
        let total_gb = (mem.mem_total as f64 / 1024.0 / 1024.0 * 10.0).round() / 10.0;

        let mut descriptor = HardwareDescriptor {
            vendor: "System".to_string(),
            model: format!("{} GB RAM", total_gb),
            identifier: "system_memory".to_string(),
            capabilities: ["ram", "swap"].into_iter().map(String::from).collect::<BTreeSet<_>>(),
            ..HardwareDescriptor::default()
        };
        descriptor
            .extra
            .insert("total_mb".to_string(), kb_to_mb(mem.mem_total).into());
        descriptor
            .extra
            .insert("swap_total_mb".to_string(), kb_to_mb(mem.swap_total).into());

        self.info = Some(descriptor.clone());
        Some(descriptor)
    }

    fn collect(&mut self) -> Readings {
        if !self.health.is_available() {
            return Readings::new();
        }

        let mut set = ReadingSet::new("memory");

        match self
            .fs
            .read_to_string(&self.paths.proc.join("meminfo"))
            .map_err(crate::collector::CollectError::from)
            .and_then(|c| Ok(parse_meminfo(&c)?))
        {
            Ok(mem) => {
                set.add("ram_total_mb", kb_to_mb(mem.mem_total), "MB");
                set.add("ram_used_mb", kb_to_mb(mem.used()), "MB");
                set.add("ram_available_mb", kb_to_mb(mem.mem_available), "MB");
                set.add("ram_free_mb", kb_to_mb(mem.mem_free), "MB");
                set.add("ram_buffers_mb", kb_to_mb(mem.buffers), "MB");
                set.add("ram_cached_mb", kb_to_mb(mem.cached), "MB");
                set.add("ram_percent", percent(mem.used(), mem.mem_total), "%");
                set.add("swap_total_mb", kb_to_mb(mem.swap_total), "MB");
                set.add("swap_used_mb", kb_to_mb(mem.swap_used()), "MB");
                set.add("swap_free_mb", kb_to_mb(mem.swap_free), "MB");
                set.add("swap_percent", percent(mem.swap_used(), mem.swap_total), "%");
            }
            Err(e) => set.fail(&mut self.health, "read /proc/meminfo", &e),
        }

        match self.fs.read_to_string(&self.paths.proc.join("vmstat")) {
            Ok(content) => match parse_vmstat(&content) {
                Ok(vm) => {
                    let to_mb = |pages: u64| round2((pages * PAGE_SIZE) as f64 / 1_048_576.0);
                    set.add("swap_in_mb", to_mb(vm.pswpin), "MB");
                    set.add("swap_out_mb", to_mb(vm.pswpout), "MB");
                }
                Err(e) => set.fail(&mut self.health, "parse /proc/vmstat", &e),
            },
            Err(e) => set.fail(&mut self.health, "read /proc/vmstat", &e),
        }

        set.finish(&mut self.health)
    }

    fn cleanup(&mut self) {
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
    use crate::collector::MockFs;
    use crate::model::Value;

    fn number(readings: &Readings, key: &str) -> f64 {
        match readings.get(key).map(|r| &r.value) {
            Some(Value::Number(n)) => *n,
            other => panic!("{} missing or not numeric: {:?}", key, other),
        }
    }

    #[test]
    fn test_collect_memory() {
        let fs = MockFs::typical_system();
        let mut mem = MemoryAdapter::new(fs, KernelPaths::default());
        assert!(mem.initialize());

        let readings = mem.collect();
        assert_eq!(number(&readings, "ram_total_mb"), 16000.0);
        assert_eq!(number(&readings, "ram_used_mb"), 4281.25);
        assert_eq!(number(&readings, "ram_percent"), 26.76);
        assert_eq!(number(&readings, "swap_used_mb"), 0.0);
        assert_eq!(number(&readings, "swap_percent"), 0.0);
        assert_eq!(number(&readings, "swap_in_mb"), 0.39);
        assert!(readings.values().all(|r| r.source == "memory"));
    }

    #[test]
    fn test_zero_swap_does_not_divide_by_zero() {
        let fs = MockFs::new();
        fs.add_file("/proc/meminfo", "MemTotal: 1024 kB\nMemAvailable: 512 kB\n");
        fs.add_file("/proc/vmstat", "pswpin 0\npswpout 0\n");
        let mut mem = MemoryAdapter::new(fs, KernelPaths::default());
        assert!(mem.initialize());

        let readings = mem.collect();
        assert_eq!(number(&readings, "swap_percent"), 0.0);
        assert_eq!(number(&readings, "ram_percent"), 50.0);
    }

    #[test]
    fn test_degrades_after_repeated_failures() {
        let fs = MockFs::typical_system();
        let mut mem = MemoryAdapter::new(fs.clone(), KernelPaths::default());
        assert!(mem.initialize());
        fs.remove_file("/proc/meminfo");
        fs.remove_file("/proc/vmstat");

        for _ in 0..5 {
            mem.collect();
        }
        assert!(!mem.is_available());
        assert!(mem.collect().is_empty());

        fs.add_file("/proc/meminfo", "MemTotal: 1024 kB\n");
        mem.reset_error_count();
        assert!(mem.is_available());
        assert!(mem.collect().contains_key("ram_total_mb"));
    }

    #[test]
    fn test_cleanup_twice() {
        let mut mem = MemoryAdapter::new(MockFs::typical_system(), KernelPaths::default());
        assert!(mem.initialize());
        mem.cleanup();
        mem.cleanup();
        assert!(!mem.is_initialized());
    }
}

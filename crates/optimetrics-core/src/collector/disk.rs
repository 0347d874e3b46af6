//! Disk adapter: I/O counters and throughput of whole block devices.

use std::collections::BTreeSet;
use std::time::Instant;

use tracing::debug;

use crate::collector::adapter::{AdapterHealth, HardwareAdapter, KernelPaths, ReadingSet, sanitize_key};
use crate::collector::procfs::parser::{DISKSTATS_SECTOR_SIZE, DiskStats, parse_diskstats};
use crate::collector::traits::FileSystem;
use crate::model::{HardwareDescriptor, Readings, round2};
use crate::rates::RateTracker;

const MB: f64 = 1_048_576.0;

/// Virtual devices that never represent physical storage.
const SKIPPED_PREFIXES: &[&str] = &["loop", "ram", "zram", "fd"];

pub struct DiskAdapter<F: FileSystem> {
    fs: F,
    paths: KernelPaths,
    health: AdapterHealth,
    info: Option<HardwareDescriptor>,
    rates: RateTracker,
}

impl<F: FileSystem> DiskAdapter<F> {
    pub fn new(fs: F, paths: KernelPaths) -> Self {
        Self {
            fs,
            paths,
            health: AdapterHealth::new("disk"),
            info: None,
            rates: RateTracker::new(),
        }
    }

    /// Whole devices only: partitions have no `/sys/block` entry.
    fn is_physical(&self, disk: &DiskStats) -> bool {
        !SKIPPED_PREFIXES.iter().any(|p| disk.device.starts_with(p))
            && self.fs.exists(&self.paths.sys.join("block").join(&disk.device))
    }

    fn read_disks(&self) -> Result<Vec<DiskStats>, crate::collector::CollectError> {
        let content = self.fs.read_to_string(&self.paths.proc.join("diskstats"))?;
        Ok(parse_diskstats(&content)?
            .into_iter()
            .filter(|d| self.is_physical(d))
            .collect())
    }

    pub fn collect_at(&mut self, now: Instant) -> Readings {
        if !self.health.is_available() {
            return Readings::new();
        }

        let mut set = ReadingSet::new("disk");
        let elapsed = self.rates.advance(now);

        match self.read_disks() {
            Ok(disks) => {
                let mut read_bytes = 0u64;
                let mut write_bytes = 0u64;
                let mut reads = 0u64;
                let mut writes = 0u64;
                let mut read_time = 0u64;
                let mut write_time = 0u64;

                for disk in &disks {
                    // Sector counts come straight from the kernel
                    let r = disk.read_sectors.saturating_mul(DISKSTATS_SECTOR_SIZE);
                    let w = disk.write_sectors.saturating_mul(DISKSTATS_SECTOR_SIZE);
                    read_bytes = read_bytes.saturating_add(r);
                    write_bytes = write_bytes.saturating_add(w);
                    reads = reads.saturating_add(disk.reads);
                    writes = writes.saturating_add(disk.writes);
                    read_time = read_time.saturating_add(disk.read_time);
                    write_time = write_time.saturating_add(disk.write_time);

                    let name = sanitize_key(&disk.device);
                    set.add(format!("disk_{}_read_mb", name), round2(r as f64 / MB), "MB");
                    set.add(format!("disk_{}_write_mb", name), round2(w as f64 / MB), "MB");
                }

                set.add("disk_read_bytes", read_bytes, "B");
                set.add("disk_write_bytes", write_bytes, "B");
                set.add("disk_read_count", reads, "count");
                set.add("disk_write_count", writes, "count");
                set.add("disk_read_time_ms", read_time, "ms");
                set.add("disk_write_time_ms", write_time, "ms");

                let read_rate = self.rates.rate("read_bytes", read_bytes, elapsed);
                let write_rate = self.rates.rate("write_bytes", write_bytes, elapsed);
                set.add_rate("disk_read_rate_mbps", read_rate.map(|r| r / MB), "MB/s");
                set.add_rate("disk_write_rate_mbps", write_rate.map(|r| r / MB), "MB/s");
                set.add_rate("disk_read_iops", self.rates.rate("reads", reads, elapsed), "1/s");
                set.add_rate("disk_write_iops", self.rates.rate("writes", writes, elapsed), "1/s");
            }
            Err(e) => set.fail(&mut self.health, "read /proc/diskstats", &e),
        }

        set.finish(&mut self.health)
    }
}

impl<F: FileSystem> HardwareAdapter for DiskAdapter<F> {
    fn name(&self) -> &'static str {
        "disk"
    }

    fn initialize(&mut self) -> bool {
        if self.health.is_initialized() {
            return true;
        }
        match self.read_disks() {
            Ok(disks) => {
                debug!(disks = disks.len(), "disk adapter initialized");
                self.health.mark_initialized();
                true
            }
            Err(e) => {
                debug!(error = %e, "disk adapter unavailable");
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

        let disks = self.read_disks().ok()?;
        let names: Vec<String> = disks.iter().map(|d| d.device.clone()).collect();
        let model = disks
            .first()
            .and_then(|d| {
                let path = self.paths.sys.join("block").join(&d.device).join("device/model");
                self.fs.read_line(&path).ok()
            })
            .unwrap_or_else(|| "Block storage".to_string());

        let mut descriptor = HardwareDescriptor {
            vendor: "System".to_string(),
            model,
            identifier: names.join(","),
            capabilities: ["io_counters", "throughput"]
                .into_iter()
                .map(String::from)
                .collect::<BTreeSet<_>>(),
            ..HardwareDescriptor::default()
        };
        descriptor.extra.insert("devices".to_string(), names.into());

        self.info = Some(descriptor.clone());
        Some(descriptor)
    }

    fn collect(&mut self) -> Readings {
        self.collect_at(Instant::now())
    }

    fn cleanup(&mut self) {
        self.rates.reset();
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
    use std::time::Duration;

    fn number(readings: &Readings, key: &str) -> f64 {
        match readings.get(key).map(|r| &r.value) {
            Some(Value::Number(n)) => *n,
            other => panic!("{} missing or not numeric: {:?}", key, other),
        }
    }

    #[test]
    fn test_partitions_and_loop_devices_are_skipped() {
        let fs = MockFs::typical_system();
        fs.add_file(
            "/proc/diskstats",
            "\
   8       0 sda 100 0 2048 10 50 0 4096 20 0 30 40 0 0 0 0
   8       1 sda1 100 0 2048 10 50 0 4096 20 0 30 40 0 0 0 0
   7       0 loop0 9 0 9999 1 0 0 0 0 0 1 1 0 0 0 0
",
        );
        fs.add_block_device("loop0");
        let mut disk = DiskAdapter::new(fs, KernelPaths::default());
        assert!(disk.initialize());

        let readings = disk.collect();
        assert_eq!(number(&readings, "disk_read_bytes"), 2048.0 * 512.0);
        assert_eq!(number(&readings, "disk_read_count"), 100.0);
        assert!(readings.contains_key("disk_sda_read_mb"));
        assert!(!readings.contains_key("disk_sda1_read_mb"));
        assert!(!readings.contains_key("disk_loop0_read_mb"));
    }

    #[test]
    fn test_throughput_rates() {
        let fs = MockFs::typical_system();
        fs.add_file(
            "/proc/diskstats",
            "   8       0 sda 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0\n",
        );
        let mut disk = DiskAdapter::new(fs.clone(), KernelPaths::default());
        assert!(disk.initialize());

        let t0 = Instant::now();
        assert!(!disk.collect_at(t0).contains_key("disk_write_rate_mbps"));

        // 4096 sectors * 512 B = 2 MiB written in 2 seconds
        fs.add_file(
            "/proc/diskstats",
            "   8       0 sda 10 0 2048 0 20 0 4096 0 0 0 0 0 0 0 0\n",
        );
        let readings = disk.collect_at(t0 + Duration::from_secs(2));
        assert_eq!(number(&readings, "disk_write_rate_mbps"), 1.0);
        assert_eq!(number(&readings, "disk_read_rate_mbps"), 0.5);
        assert_eq!(number(&readings, "disk_write_iops"), 10.0);
    }

    #[test]
    fn test_huge_sector_counts_saturate() {
        let fs = MockFs::typical_system();
        fs.add_file(
            "/proc/diskstats",
            "   8       0 sda 1 0 9223372036854775807 0 1 0 36028797018963968 0 0 0 0 0 0 0 0\n",
        );
        let mut disk = DiskAdapter::new(fs, KernelPaths::default());
        assert!(disk.initialize());

        let readings = disk.collect();
        assert_eq!(number(&readings, "disk_read_bytes"), u64::MAX as f64);
        assert_eq!(number(&readings, "disk_write_bytes"), u64::MAX as f64);
        assert!(number(&readings, "disk_sda_read_mb").is_finite());
    }

    #[test]
    fn test_same_instant_omits_rates() {
        let fs = MockFs::typical_system();
        let mut disk = DiskAdapter::new(fs, KernelPaths::default());
        assert!(disk.initialize());
        let now = Instant::now();
        disk.collect_at(now);
        let readings = disk.collect_at(now);
        assert!(!readings.contains_key("disk_read_rate_mbps"));
        assert!(readings.contains_key("disk_read_bytes"));
    }

    #[test]
    fn test_unavailable_without_diskstats() {
        let mut disk = DiskAdapter::new(MockFs::new(), KernelPaths::default());
        assert!(!disk.initialize());
        assert!(disk.collect().is_empty());
        disk.cleanup();
        disk.cleanup();
        assert!(!disk.is_initialized());
    }
}

//! CPU adapter: utilization, frequency, scheduler counters, load, temperature
//! and package power.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::debug;

use crate::collector::adapter::{AdapterHealth, HardwareAdapter, KernelPaths, ReadingSet};
use crate::collector::procfs::parser::{GlobalStat, parse_cpuinfo, parse_global_stat, parse_loadavg};
use crate::collector::traits::FileSystem;
use crate::model::{HardwareDescriptor, Readings, round2};
use crate::rates::RateTracker;

/// Thermal zone types that report the CPU package, in order of preference.
const CPU_THERMAL_TYPES: &[&str] = &[
    "x86_pkg_temp",
    "k10temp",
    "coretemp",
    "cpu-thermal",
    "cpu_thermal",
    "soc_thermal",
    "acpitz",
];

pub struct CpuAdapter<F: FileSystem> {
    fs: F,
    paths: KernelPaths,
    health: AdapterHealth,
    info: Option<HardwareDescriptor>,
    prev_stat: Option<GlobalStat>,
    rates: RateTracker,
    collect_power: bool,
    thermal_zone: Option<PathBuf>,
    rapl_energy: Option<PathBuf>,
}

impl<F: FileSystem> CpuAdapter<F> {
    pub fn new(fs: F, paths: KernelPaths) -> Self {
        Self {
            fs,
            paths,
            health: AdapterHealth::new("cpu"),
            info: None,
            prev_stat: None,
            rates: RateTracker::new(),
            collect_power: true,
            thermal_zone: None,
            rapl_energy: None,
        }
    }

    /// Enables or disables the RAPL package power reading.
    pub fn with_power(mut self, enabled: bool) -> Self {
        self.collect_power = enabled;
        self
    }

    fn proc(&self, name: &str) -> PathBuf {
        self.paths.proc.join(name)
    }

    fn read_stat(&self) -> Result<GlobalStat, crate::collector::CollectError> {
        let content = self.fs.read_to_string(&self.proc("stat"))?;
        Ok(parse_global_stat(&content)?)
    }

    fn find_thermal_zone(&self) -> Option<PathBuf> {
        let base = self.paths.sys.join("class/thermal");
        let zones = self.fs.read_dir(&base).ok()?;
        let mut typed: Vec<(usize, PathBuf)> = zones
            .into_iter()
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("thermal_zone"))
            })
            .filter_map(|zone| {
                let kind = self.fs.read_line(&zone.join("type")).ok()?;
                let rank = CPU_THERMAL_TYPES.iter().position(|t| *t == kind)?;
                Some((rank, zone.join("temp")))
            })
            .collect();
        typed.sort();
        typed.into_iter().next().map(|(_, path)| path)
    }

    fn read_temperature(&self, path: &Path) -> Option<f64> {
        let milli: f64 = self.fs.read_line(path).ok()?.parse().ok()?;
        Some(round2(milli / 1000.0))
    }

    /// Collects at an explicit instant so elapsed-time handling is testable.
    pub fn collect_at(&mut self, now: Instant) -> Readings {
        if !self.health.is_available() {
            return Readings::new();
        }

        let mut set = ReadingSet::new("cpu");
        let elapsed = self.rates.advance(now);

        match self.read_stat() {
            Ok(stat) => {
                if let Some(prev) = &self.prev_stat {
                    for core in stat.cpus.iter() {
                        let Some(id) = core.cpu_id else { continue };
                        if let Some(util) = prev.core(id).and_then(|p| core.utilization_since(p)) {
                            set.add(format!("core_{}_utilization", id), round2(util), "%");
                        }
                    }
                    if let (Some(curr), Some(prev)) = (stat.aggregate(), prev.aggregate())
                        && let Some(util) = curr.utilization_since(prev)
                    {
                        set.add("total_utilization", round2(util), "%");
                    }
                }
                set.add("context_switches", stat.ctxt, "count");
                set.add("interrupts", stat.intr, "count");
                set.add("soft_interrupts", stat.softirq, "count");
                set.add_rate(
                    "context_switches_per_sec",
                    self.rates.rate("ctxt", stat.ctxt, elapsed),
                    "1/s",
                );
                set.add_rate(
                    "interrupts_per_sec",
                    self.rates.rate("intr", stat.intr, elapsed),
                    "1/s",
                );
                self.prev_stat = Some(stat);
            }
            Err(e) => set.fail(&mut self.health, "read /proc/stat", &e),
        }

        match self.fs.read_to_string(&self.proc("loadavg")) {
            Ok(content) => match parse_loadavg(&content) {
                Ok(la) => {
                    set.add("load_avg_1m", la.load1, "");
                    set.add("load_avg_5m", la.load5, "");
                    set.add("load_avg_15m", la.load15, "");
                }
                Err(e) => set.fail(&mut self.health, "parse /proc/loadavg", &e),
            },
            Err(e) => set.fail(&mut self.health, "read /proc/loadavg", &e),
        }

        match self.fs.read_to_string(&self.proc("cpuinfo")) {
            Ok(content) => {
                let info = parse_cpuinfo(&content);
                for (i, mhz) in info.mhz.iter().enumerate() {
                    set.add(format!("core_{}_freq_mhz", i), round2(*mhz), "MHz");
                }
                if !info.mhz.is_empty() {
                    let avg = info.mhz.iter().sum::<f64>() / info.mhz.len() as f64;
                    set.add("avg_freq_mhz", round2(avg), "MHz");
                }
            }
            Err(e) => set.fail(&mut self.health, "read /proc/cpuinfo", &e),
        }

        if let Some(zone) = self.thermal_zone.clone() {
            match self.read_temperature(&zone) {
                Some(t) => set.add("temperature", t, "C"),
                None => set.fail(&mut self.health, "read thermal zone", &zone.display()),
            }
        }

        if let Some(energy) = self.rapl_energy.clone() {
            match self.fs.read_line(&energy).map(|s| s.parse::<u64>()) {
                Ok(Ok(uj)) => {
                    let watts = self.rates.rate("energy_uj", uj, elapsed).map(|r| r / 1e6);
                    set.add_rate("power_watts", watts, "W");
                }
                Ok(Err(e)) => set.fail(&mut self.health, "parse RAPL energy", &e),
                Err(e) => set.fail(&mut self.health, "read RAPL energy", &e),
            }
        }

        set.finish(&mut self.health)
    }
}

impl<F: FileSystem> HardwareAdapter for CpuAdapter<F> {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn initialize(&mut self) -> bool {
        if self.health.is_initialized() {
            return true;
        }

        // Baseline for the first utilization delta
        match self.read_stat() {
            Ok(stat) => self.prev_stat = Some(stat),
            Err(e) => {
                debug!(error = %e, "cpu adapter unavailable");
                return false;
            }
        }

        self.thermal_zone = self.find_thermal_zone();
        if self.collect_power {
            let energy = self.paths.sys.join("class/powercap/intel-rapl:0/energy_uj");
            if self.fs.exists(&energy) {
                self.rapl_energy = Some(energy);
            }
        }
        self.rates.advance(Instant::now());

        self.health.mark_initialized();
        true
    }

    fn hardware_info(&mut self) -> Option<HardwareDescriptor> {
        if !self.health.is_initialized() {
            return None;
        }
        if let Some(info) = &self.info {
            return Some(info.clone());
        }

        let content = self.fs.read_to_string(&self.proc("cpuinfo")).ok()?;
        let cpuinfo = parse_cpuinfo(&content);
        let model = cpuinfo.model_name.clone().unwrap_or_else(|| "Unknown CPU".to_string());
        let vendor = match cpuinfo.vendor_id.as_deref() {
            Some("GenuineIntel") => "Intel".to_string(),
            Some("AuthenticAMD") => "AMD".to_string(),
            Some(other) => other.to_string(),
            None => "Unknown".to_string(),
        };

        let mut capabilities: BTreeSet<String> = ["utilization", "frequency", "load_average"]
            .into_iter()
            .map(String::from)
            .collect();
        if self.thermal_zone.is_some() {
            capabilities.insert("temperature".to_string());
        }
        if self.rapl_energy.is_some() {
            capabilities.insert("power".to_string());
        }

        let mut descriptor = HardwareDescriptor {
            vendor,
            identifier: model.clone(),
            model,
            capabilities,
            ..HardwareDescriptor::default()
        };
        let logical = self
            .prev_stat
            .as_ref()
            .map(|s| s.cpus.iter().filter(|c| c.cpu_id.is_some()).count())
            .unwrap_or(0);
        descriptor
            .extra
            .insert("logical_cores".to_string(), logical.into());
        if let Some(cores) = cpuinfo.physical_cores {
            descriptor
                .extra
                .insert("physical_cores".to_string(), cores.into());
        }

        self.info = Some(descriptor.clone());
        Some(descriptor)
    }

    fn collect(&mut self) -> Readings {
        self.collect_at(Instant::now())
    }

    fn cleanup(&mut self) {
        self.prev_stat = None;
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

    fn stat(user: u64, idle: u64, ctxt: u64) -> String {
        format!(
            "cpu  {} 0 0 {} 0 0 0 0 0 0\ncpu0 {} 0 0 {} 0 0 0 0 0 0\nintr 500 1 2\nctxt {}\nsoftirq 40 1\n",
            user, idle, user, idle, ctxt
        )
    }

    fn adapter(fs: &MockFs) -> CpuAdapter<MockFs> {
        CpuAdapter::new(fs.clone(), KernelPaths::default())
    }

    fn number(readings: &Readings, key: &str) -> f64 {
        match readings.get(key).map(|r| &r.value) {
            Some(Value::Number(n)) => *n,
            other => panic!("{} missing or not numeric: {:?}", key, other),
        }
    }

    #[test]
    fn test_initialize_fails_without_proc_stat() {
        let fs = MockFs::new();
        let mut cpu = adapter(&fs);
        assert!(!cpu.initialize());
        assert!(cpu.collect().is_empty());
        assert!(cpu.hardware_info().is_none());
    }

    #[test]
    fn test_utilization_from_baseline() {
        let fs = MockFs::typical_system();
        fs.add_file("/proc/stat", stat(100, 900, 1000));
        let mut cpu = adapter(&fs);
        assert!(cpu.initialize());

        fs.add_file("/proc/stat", stat(150, 950, 1200));
        let readings = cpu.collect();

        assert_eq!(number(&readings, "total_utilization"), 50.0);
        assert_eq!(number(&readings, "core_0_utilization"), 50.0);
        assert_eq!(number(&readings, "context_switches"), 1200.0);
        assert_eq!(number(&readings, "interrupts"), 500.0);
        assert_eq!(number(&readings, "load_avg_1m"), 0.15);
        assert_eq!(number(&readings, "avg_freq_mhz"), 3850.0);
        assert_eq!(number(&readings, "temperature"), 52.0);
        assert_eq!(cpu.health().error_count(), 0);
    }

    #[test]
    fn test_rates_never_non_finite_on_zero_elapsed() {
        let fs = MockFs::typical_system();
        let mut cpu = adapter(&fs);
        assert!(cpu.initialize());

        let now = Instant::now();
        cpu.collect_at(now);
        fs.add_file("/proc/stat", stat(99999, 99999, 999999));
        fs.add_file("/sys/class/powercap/intel-rapl:0/energy_uj", "999999999\n");
        let readings = cpu.collect_at(now);

        assert!(!readings.contains_key("context_switches_per_sec"));
        assert!(!readings.contains_key("power_watts"));
        for reading in readings.values() {
            if let Value::Number(n) = reading.value {
                assert!(n.is_finite(), "{} is not finite", reading.name);
            }
        }
    }

    #[test]
    fn test_power_from_energy_counter() {
        let fs = MockFs::typical_system();
        let mut cpu = adapter(&fs);
        assert!(cpu.initialize());

        let t0 = Instant::now();
        fs.add_file("/sys/class/powercap/intel-rapl:0/energy_uj", "1000000\n");
        cpu.collect_at(t0);
        fs.add_file("/sys/class/powercap/intel-rapl:0/energy_uj", "31000000\n");
        let readings = cpu.collect_at(t0 + Duration::from_secs(2));

        assert_eq!(number(&readings, "power_watts"), 15.0);
    }

    #[test]
    fn test_missing_loadavg_counts_error_but_keeps_other_fields() {
        let fs = MockFs::typical_system();
        let mut cpu = adapter(&fs);
        assert!(cpu.initialize());
        fs.remove_file("/proc/loadavg");

        let readings = cpu.collect();
        assert!(readings.contains_key("context_switches"));
        assert!(!readings.contains_key("load_avg_1m"));
        assert_eq!(cpu.health().error_count(), 1);
    }

    #[test]
    fn test_hardware_info_is_cached() {
        let fs = MockFs::typical_system();
        let mut cpu = adapter(&fs);
        assert!(cpu.initialize());

        let info = cpu.hardware_info().unwrap();
        assert_eq!(info.vendor, "Intel");
        assert!(info.model.contains("i7-9700K"));
        assert!(info.capabilities.contains("temperature"));
        assert!(info.capabilities.contains("power"));

        fs.remove_file("/proc/cpuinfo");
        assert_eq!(cpu.hardware_info().unwrap(), info);
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let fs = MockFs::typical_system();
        let mut cpu = adapter(&fs);
        assert!(cpu.initialize());
        cpu.cleanup();
        cpu.cleanup();
        assert!(!cpu.is_initialized());
        assert!(cpu.collect().is_empty());
    }
}

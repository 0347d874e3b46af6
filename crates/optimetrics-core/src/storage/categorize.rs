//! Routing of snapshot keys to hardware types.
//!
//! Rules are checked in a fixed order and the first match wins, so every key
//! lands in at most one file:
//!
//! 1. `gpu_intel`: contains `intel`, unless the key carries a network or disk
//!    prefix (interface and device names such as `net_intel0_*`)
//! 2. `gpu_nvidia`: `gpu{N}_` prefix, or an NVIDIA-only metric prefix
//! 3. `memory`: `ram_`, `swap_`, `memory_`
//! 4. `network`: `net_`, `packets_`, `drop_`, `errors_`, `bytes_sent`, `bytes_recv`
//! 5. `disk`: `disk_`, `io_`, `read_bytes`, `write_bytes`, `read_count`, `write_count`
//! 6. `cpu`: `core_`, `cpu_`, `load_avg`, `freq_`, `avg_freq`, `total_utilization`,
//!    `context_switches`, `interrupts`, `soft_interrupts`, `syscalls`,
//!    `temperature`, `power_watts`
//!
//! Keys matching nothing (labels such as `session_category`) are not routed.

use std::collections::BTreeMap;

use crate::model::{HardwareType, Snapshot, Value};

const NVIDIA_PREFIXES: &[&str] = &[
    "vram_",
    "encoder_",
    "decoder_",
    "pcie_",
    "sm_clock",
    "memory_clock",
    "core_clock",
    "fan_speed",
    "power_limit",
    "compute_processes",
    "graphics_processes",
];
const MEMORY_PREFIXES: &[&str] = &["ram_", "swap_", "memory_"];
const NETWORK_PREFIXES: &[&str] = &["net_", "packets_", "drop_", "errors_", "bytes_sent", "bytes_recv"];
const DISK_PREFIXES: &[&str] = &[
    "disk_",
    "io_",
    "read_bytes",
    "write_bytes",
    "read_count",
    "write_count",
];
const CPU_PREFIXES: &[&str] = &[
    "core_",
    "cpu_",
    "load_avg",
    "freq_",
    "avg_freq",
    "total_utilization",
    "context_switches",
    "interrupts",
    "soft_interrupts",
    "syscalls",
    "temperature",
    "power_watts",
];

fn has_prefix(key: &str, prefixes: &[&str]) -> bool {
    prefixes.iter().any(|p| key.starts_with(p))
}

/// `gpu0_`, `gpu12_`, ...
fn is_indexed_gpu_key(key: &str) -> bool {
    let Some(rest) = key.strip_prefix("gpu") else {
        return false;
    };
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    digits > 0 && rest[digits..].starts_with('_')
}

/// Hardware type a metric key belongs to.
pub fn categorize(key: &str) -> Option<HardwareType> {
    let device_scoped = has_prefix(key, NETWORK_PREFIXES) || has_prefix(key, DISK_PREFIXES);
    if key.contains("intel") && !device_scoped {
        Some(HardwareType::GpuIntel)
    } else if is_indexed_gpu_key(key) || has_prefix(key, NVIDIA_PREFIXES) {
        Some(HardwareType::GpuNvidia)
    } else if has_prefix(key, MEMORY_PREFIXES) {
        Some(HardwareType::Memory)
    } else if has_prefix(key, NETWORK_PREFIXES) {
        Some(HardwareType::Network)
    } else if has_prefix(key, DISK_PREFIXES) {
        Some(HardwareType::Disk)
    } else if has_prefix(key, CPU_PREFIXES) {
        Some(HardwareType::Cpu)
    } else {
        None
    }
}

/// Splits a snapshot into per-type field maps. Types without a matching key
/// are absent.
pub fn split(snapshot: &Snapshot) -> BTreeMap<HardwareType, BTreeMap<String, Value>> {
    let mut groups: BTreeMap<HardwareType, BTreeMap<String, Value>> = BTreeMap::new();
    for (key, value) in &snapshot.values {
        if let Some(t) = categorize(key) {
            groups.entry(t).or_default().insert(key.clone(), value.clone());
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_rule_order() {
        let cases = [
            ("core_0_utilization", Some(HardwareType::Cpu)),
            ("total_utilization", Some(HardwareType::Cpu)),
            ("context_switches_per_sec", Some(HardwareType::Cpu)),
            ("temperature", Some(HardwareType::Cpu)),
            ("power_watts", Some(HardwareType::Cpu)),
            ("gpu0_temperature", Some(HardwareType::GpuNvidia)),
            ("gpu1_power_watts", Some(HardwareType::GpuNvidia)),
            ("gpu0_memory_utilization", Some(HardwareType::GpuNvidia)),
            ("vram_percent", Some(HardwareType::GpuNvidia)),
            ("core_clock_mhz", Some(HardwareType::GpuNvidia)),
            ("intel_gpu_freq_mhz", Some(HardwareType::GpuIntel)),
            ("gpu_intel_present", Some(HardwareType::GpuIntel)),
            ("net_intel0_sent_mb", Some(HardwareType::Network)),
            ("disk_intelssd_read_mb", Some(HardwareType::Disk)),
            ("ram_percent", Some(HardwareType::Memory)),
            ("swap_in_mb", Some(HardwareType::Memory)),
            ("net_bytes_sent", Some(HardwareType::Network)),
            ("net_eth0_is_up", Some(HardwareType::Network)),
            ("disk_read_bytes", Some(HardwareType::Disk)),
            ("disk_nvme0n1_write_mb", Some(HardwareType::Disk)),
            ("session_category", None),
            ("timestamp", None),
            ("gpux_value", None),
        ];
        for (key, expected) in cases {
            assert_eq!(categorize(key), expected, "{}", key);
        }
    }

    #[test]
    fn test_network_only_snapshot_routes_to_network() {
        let mut snap = Snapshot::new("dev", Utc::now());
        snap.insert("net_bytes_sent", 10.0);
        snap.insert("net_bytes_recv", 20.0);
        snap.insert("net_connections_total", 3.0);
        snap.set_label("session_category", "idle");

        let groups = split(&snap);
        assert_eq!(groups.keys().copied().collect::<Vec<_>>(), vec![HardwareType::Network]);
        assert_eq!(groups[&HardwareType::Network].len(), 3);
    }

    #[test]
    fn test_one_snapshot_feeds_several_types() {
        let mut snap = Snapshot::new("dev", Utc::now());
        snap.insert("total_utilization", 10.0);
        snap.insert("ram_percent", 40.0);
        let groups = split(&snap);
        assert!(groups.contains_key(&HardwareType::Cpu));
        assert!(groups.contains_key(&HardwareType::Memory));
        assert_eq!(groups.len(), 2);
    }
}

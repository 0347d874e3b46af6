//! Classifier inputs derived from one snapshot.

use crate::classifier::thresholds::Features;
use crate::model::Snapshot;

pub const GPU_UTILIZATION: &str = "gpu_utilization";
pub const VRAM_PERCENT: &str = "vram_percent";
pub const GPU_ENCODER_UTILIZATION: &str = "gpu_encoder_utilization";
pub const GPU_COMPUTE_PROCESSES: &str = "gpu_compute_processes";
pub const GPU_POWER_RATIO: &str = "gpu_power_ratio";
pub const CPU_UTILIZATION: &str = "cpu_utilization";
pub const RAM_PERCENT: &str = "ram_percent";
pub const DISK_WRITE_RATE: &str = "disk_write_rate_mbps";
pub const DISK_IO_RATE: &str = "disk_io_rate";
pub const NET_ACTIVITY: &str = "net_activity";

/// First GPU's value, falling back to an unprefixed key.
fn gpu(snapshot: &Snapshot, name: &str) -> Option<f64> {
    snapshot
        .number(&format!("gpu0_{}", name))
        .or_else(|| snapshot.number(name))
}

fn sum(values: [Option<f64>; 2]) -> Option<f64> {
    match values {
        [None, None] => None,
        [a, b] => Some(a.unwrap_or(0.0) + b.unwrap_or(0.0)),
    }
}

/// Features present in `snapshot`. Missing metrics are left out rather
/// than zeroed.
pub fn extract(snapshot: &Snapshot) -> Features {
    let mut features = Features::new();
    let mut put = |name, value: Option<f64>| {
        if let Some(v) = value.filter(|v| v.is_finite()) {
            features.insert(name, v);
        }
    };

    put(GPU_UTILIZATION, gpu(snapshot, "utilization"));
    put(VRAM_PERCENT, gpu(snapshot, "vram_percent"));
    put(GPU_ENCODER_UTILIZATION, gpu(snapshot, "encoder_utilization"));
    put(GPU_COMPUTE_PROCESSES, gpu(snapshot, "compute_processes"));
    put(
        GPU_POWER_RATIO,
        gpu(snapshot, "power_watts")
            .zip(gpu(snapshot, "power_limit_watts"))
            .filter(|(_, limit)| *limit > 0.0)
            .map(|(watts, limit)| watts / limit),
    );

    put(CPU_UTILIZATION, snapshot.number("total_utilization"));
    put(RAM_PERCENT, snapshot.number("ram_percent"));

    let write = snapshot.number("disk_write_rate_mbps");
    put(DISK_WRITE_RATE, write);
    put(DISK_IO_RATE, sum([snapshot.number("disk_read_rate_mbps"), write]));
    put(
        NET_ACTIVITY,
        sum([
            snapshot.number("net_recv_rate_kbps"),
            snapshot.number("net_send_rate_kbps"),
        ]),
    );
    features
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_extract_prefers_first_gpu() {
        let mut s = Snapshot::new("dev", Utc::now());
        s.insert("gpu0_utilization", 70.0);
        s.insert("gpu1_utilization", 10.0);
        s.insert("gpu0_power_watts", 150.0);
        s.insert("gpu0_power_limit_watts", 300.0);
        s.insert("total_utilization", 40.0);
        s.insert("net_recv_rate_kbps", 12.0);
        s.insert("net_send_rate_kbps", 3.0);

        let f = extract(&s);
        assert_eq!(f.get(GPU_UTILIZATION), Some(&70.0));
        assert_eq!(f.get(GPU_POWER_RATIO), Some(&0.5));
        assert_eq!(f.get(CPU_UTILIZATION), Some(&40.0));
        assert_eq!(f.get(NET_ACTIVITY), Some(&15.0));
        assert!(!f.contains_key(RAM_PERCENT));
        assert!(!f.contains_key(DISK_IO_RATE));
    }

    #[test]
    fn test_extract_unprefixed_gpu_keys() {
        let mut s = Snapshot::new("dev", Utc::now());
        s.insert("utilization", 33.0);
        s.insert("disk_write_rate_mbps", 2.0);
        let f = extract(&s);
        assert_eq!(f.get(GPU_UTILIZATION), Some(&33.0));
        assert_eq!(f.get(DISK_IO_RATE), Some(&2.0));
        assert_eq!(f.get(DISK_WRITE_RATE), Some(&2.0));
    }
}

//! Network adapter: interface counters, throughput, link state and TCP
//! connection counts.

use std::collections::BTreeSet;
use std::time::Instant;

use tracing::debug;

use crate::collector::adapter::{AdapterHealth, HardwareAdapter, KernelPaths, ReadingSet, sanitize_key};
use crate::collector::procfs::parser::{NetDevStats, TcpStates, parse_net_dev, parse_tcp_states};
use crate::collector::traits::FileSystem;
use crate::model::{HardwareDescriptor, Readings, round2};
use crate::rates::RateTracker;

const MB: f64 = 1_048_576.0;

pub struct NetworkAdapter<F: FileSystem> {
    fs: F,
    paths: KernelPaths,
    health: AdapterHealth,
    info: Option<HardwareDescriptor>,
    rates: RateTracker,
}

impl<F: FileSystem> NetworkAdapter<F> {
    pub fn new(fs: F, paths: KernelPaths) -> Self {
        Self {
            fs,
            paths,
            health: AdapterHealth::new("network"),
            info: None,
            rates: RateTracker::new(),
        }
    }

    fn read_interfaces(&self) -> Result<Vec<NetDevStats>, crate::collector::CollectError> {
        let content = self.fs.read_to_string(&self.paths.proc.join("net/dev"))?;
        Ok(parse_net_dev(&content)?
            .into_iter()
            .filter(|i| i.interface != "lo")
            .collect())
    }

    /// `None` when neither tcp table is readable.
    fn read_tcp_states(&self) -> Option<TcpStates> {
        let mut states: Option<TcpStates> = None;
        for table in ["net/tcp", "net/tcp6"] {
            if let Ok(content) = self.fs.read_to_string(&self.paths.proc.join(table)) {
                states
                    .get_or_insert_with(TcpStates::default)
                    .add(&parse_tcp_states(&content));
            }
        }
        states
    }

    pub fn collect_at(&mut self, now: Instant) -> Readings {
        if !self.health.is_available() {
            return Readings::new();
        }

        let mut set = ReadingSet::new("network");
        let elapsed = self.rates.advance(now);

        match self.read_interfaces() {
            Ok(interfaces) => {
                let mut total = NetDevStats::default();
                for iface in &interfaces {
                    total.tx_bytes += iface.tx_bytes;
                    total.rx_bytes += iface.rx_bytes;
                    total.tx_packets += iface.tx_packets;
                    total.rx_packets += iface.rx_packets;
                    total.rx_errs += iface.rx_errs;
                    total.tx_errs += iface.tx_errs;
                    total.rx_drop += iface.rx_drop;
                    total.tx_drop += iface.tx_drop;

                    let name = sanitize_key(&iface.interface);
                    set.add(
                        format!("net_{}_sent_mb", name),
                        round2(iface.tx_bytes as f64 / MB),
                        "MB",
                    );
                    set.add(
                        format!("net_{}_recv_mb", name),
                        round2(iface.rx_bytes as f64 / MB),
                        "MB",
                    );

                    let class = self.paths.sys.join("class/net").join(&iface.interface);
                    if let Ok(state) = self.fs.read_line(&class.join("operstate")) {
                        let up = if state == "up" { 1.0 } else { 0.0 };
                        set.add(format!("net_{}_is_up", name), up, "bool");
                    }
                    // Virtual links report -1 or fail with EINVAL
                    if let Some(speed) = self
                        .fs
                        .read_line(&class.join("speed"))
                        .ok()
                        .and_then(|s| s.parse::<i64>().ok())
                        .filter(|s| *s > 0)
                    {
                        set.add(format!("net_{}_speed_mbps", name), speed as f64, "Mbit/s");
                    }
                }

                set.add("net_bytes_sent", total.tx_bytes, "B");
                set.add("net_bytes_recv", total.rx_bytes, "B");
                set.add("net_packets_sent", total.tx_packets, "count");
                set.add("net_packets_recv", total.rx_packets, "count");
                set.add("net_errin", total.rx_errs, "count");
                set.add("net_errout", total.tx_errs, "count");
                set.add("net_dropin", total.rx_drop, "count");
                set.add("net_dropout", total.tx_drop, "count");

                let sent = self.rates.rate("tx_bytes", total.tx_bytes, elapsed);
                let recv = self.rates.rate("rx_bytes", total.rx_bytes, elapsed);
                set.add_rate("net_send_rate_kbps", sent.map(|r| r / 1024.0), "KB/s");
                set.add_rate("net_recv_rate_kbps", recv.map(|r| r / 1024.0), "KB/s");
            }
            Err(e) => set.fail(&mut self.health, "read /proc/net/dev", &e),
        }

        if let Some(tcp) = self.read_tcp_states() {
            set.add("net_connections_total", tcp.total, "count");
            set.add("net_connections_established", tcp.established, "count");
            set.add("net_connections_listen", tcp.listen, "count");
            set.add("net_connections_time_wait", tcp.time_wait, "count");
        }

        set.finish(&mut self.health)
    }
}

impl<F: FileSystem> HardwareAdapter for NetworkAdapter<F> {
    fn name(&self) -> &'static str {
        "network"
    }

    fn initialize(&mut self) -> bool {
        if self.health.is_initialized() {
            return true;
        }
        match self.read_interfaces() {
            Ok(_) => {
                self.health.mark_initialized();
                true
            }
            Err(e) => {
                debug!(error = %e, "network adapter unavailable");
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

        let names: Vec<String> = self
            .read_interfaces()
            .ok()?
            .into_iter()
            .map(|i| i.interface)
            .collect();
        let mut descriptor = HardwareDescriptor {
            vendor: "System".to_string(),
            model: format!("{} interfaces", names.len()),
            identifier: names.join(","),
            capabilities: ["io_counters", "throughput", "connections"]
                .into_iter()
                .map(String::from)
                .collect::<BTreeSet<_>>(),
            ..HardwareDescriptor::default()
        };
        descriptor.extra.insert("interfaces".to_string(), names.into());

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

    fn net_dev(rx: u64, tx: u64) -> String {
        format!(
            "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 5000     10    0    0    0     0          0         0 5000     10    0    0    0     0       0          0
  eth0: {}     100    1    2    0     0          0         0 {}     50    3    4    0     0       0          0
",
            rx, tx
        )
    }

    #[test]
    fn test_loopback_excluded_from_totals() {
        let fs = MockFs::typical_system();
        fs.add_file("/proc/net/dev", net_dev(1000, 2000));
        let mut net = NetworkAdapter::new(fs, KernelPaths::default());
        assert!(net.initialize());

        let readings = net.collect();
        assert_eq!(number(&readings, "net_bytes_recv"), 1000.0);
        assert_eq!(number(&readings, "net_bytes_sent"), 2000.0);
        assert_eq!(number(&readings, "net_errin"), 1.0);
        assert_eq!(number(&readings, "net_dropout"), 4.0);
        assert_eq!(number(&readings, "net_eth0_is_up"), 1.0);
        assert_eq!(number(&readings, "net_eth0_speed_mbps"), 1000.0);
        assert!(!readings.contains_key("net_lo_sent_mb"));
    }

    #[test]
    fn test_send_and_receive_rates() {
        let fs = MockFs::typical_system();
        fs.add_file("/proc/net/dev", net_dev(0, 0));
        let mut net = NetworkAdapter::new(fs.clone(), KernelPaths::default());
        assert!(net.initialize());

        let t0 = Instant::now();
        net.collect_at(t0);
        fs.add_file("/proc/net/dev", net_dev(10240, 20480));
        let readings = net.collect_at(t0 + Duration::from_secs(10));

        assert_eq!(number(&readings, "net_recv_rate_kbps"), 1.0);
        assert_eq!(number(&readings, "net_send_rate_kbps"), 2.0);
    }

    #[test]
    fn test_connection_counts() {
        let fs = MockFs::typical_system();
        let mut net = NetworkAdapter::new(fs, KernelPaths::default());
        assert!(net.initialize());

        let readings = net.collect();
        assert_eq!(number(&readings, "net_connections_total"), 3.0);
        assert_eq!(number(&readings, "net_connections_listen"), 2.0);
        assert_eq!(number(&readings, "net_connections_established"), 1.0);
    }

    #[test]
    fn test_hardware_info_lists_interfaces() {
        let fs = MockFs::typical_system();
        let mut net = NetworkAdapter::new(fs, KernelPaths::default());
        assert!(net.initialize());
        let info = net.hardware_info().unwrap();
        assert_eq!(info.identifier, "eth0");
    }
}

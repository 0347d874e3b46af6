//! Parsers for `/proc` filesystem files.
//!
//! These are pure functions that parse the content of various `/proc` files
//! into structured data. They are designed to be easily testable with string inputs.

/// Error type for parsing failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Parse error: {}", self.message)
    }
}

impl std::error::Error for ParseError {}

/// Parsed data from `/proc/meminfo`. All values in kB.
#[derive(Debug, Clone, Default)]
pub struct MemInfo {
    pub mem_total: u64,
    pub mem_free: u64,
    pub mem_available: u64,
    pub buffers: u64,
    pub cached: u64,
    pub swap_total: u64,
    pub swap_free: u64,
}

impl MemInfo {
    /// Memory in use, computed the way `free(1)` does.
    pub fn used(&self) -> u64 {
        self.mem_total.saturating_sub(self.mem_available)
    }

    pub fn swap_used(&self) -> u64 {
        self.swap_total.saturating_sub(self.swap_free)
    }
}

/// Parses `/proc/meminfo` content.
pub fn parse_meminfo(content: &str) -> Result<MemInfo, ParseError> {
    let mut info = MemInfo::default();
    let mut seen_total = false;

    let parse_kb = |line: &str| -> u64 {
        line.split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    };

    for line in content.lines() {
        if line.starts_with("MemTotal:") {
            info.mem_total = parse_kb(line);
            seen_total = true;
        } else if line.starts_with("MemFree:") {
            info.mem_free = parse_kb(line);
        } else if line.starts_with("MemAvailable:") {
            info.mem_available = parse_kb(line);
        } else if line.starts_with("Buffers:") {
            info.buffers = parse_kb(line);
        } else if line.starts_with("Cached:") {
            info.cached = parse_kb(line);
        } else if line.starts_with("SwapTotal:") {
            info.swap_total = parse_kb(line);
        } else if line.starts_with("SwapFree:") {
            info.swap_free = parse_kb(line);
        }
    }

    if !seen_total {
        return Err(ParseError::new("meminfo without MemTotal"));
    }
    Ok(info)
}

/// Single CPU stats from `/proc/stat`, in jiffies.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuStat {
    pub cpu_id: Option<u32>, // None for aggregate "cpu" line
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuStat {
    pub fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    pub fn idle_total(&self) -> u64 {
        self.idle + self.iowait
    }

    /// Busy percentage between `prev` and `self`. `None` when no time passed
    /// or a counter went backwards.
    pub fn utilization_since(&self, prev: &CpuStat) -> Option<f64> {
        let total = self.total().checked_sub(prev.total())?;
        let idle = self.idle_total().checked_sub(prev.idle_total())?;
        if total == 0 {
            return None;
        }
        let busy = total.saturating_sub(idle);
        Some(busy as f64 * 100.0 / total as f64)
    }
}

/// Global stats from `/proc/stat`.
#[derive(Debug, Clone, Default)]
pub struct GlobalStat {
    pub cpus: Vec<CpuStat>,
    pub ctxt: u64,
    /// Total of the `intr` line.
    pub intr: u64,
    /// Total of the `softirq` line.
    pub softirq: u64,
}

impl GlobalStat {
    pub fn aggregate(&self) -> Option<&CpuStat> {
        self.cpus.iter().find(|c| c.cpu_id.is_none())
    }

    pub fn core(&self, id: u32) -> Option<&CpuStat> {
        self.cpus.iter().find(|c| c.cpu_id == Some(id))
    }
}

fn second_u64(parts: &[&str]) -> u64 {
    parts.get(1).and_then(|s| s.parse().ok()).unwrap_or(0)
}

/// Parses `/proc/stat` content.
pub fn parse_global_stat(content: &str) -> Result<GlobalStat, ParseError> {
    let mut stat = GlobalStat::default();

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }

        if parts[0].starts_with("cpu") {
            let cpu_id = if parts[0] == "cpu" {
                None
            } else {
                match parts[0].strip_prefix("cpu").and_then(|s| s.parse().ok()) {
                    Some(id) => Some(id),
                    None => continue,
                }
            };

            let get_val =
                |idx: usize| -> u64 { parts.get(idx).and_then(|s| s.parse().ok()).unwrap_or(0) };

            stat.cpus.push(CpuStat {
                cpu_id,
                user: get_val(1),
                nice: get_val(2),
                system: get_val(3),
                idle: get_val(4),
                iowait: get_val(5),
                irq: get_val(6),
                softirq: get_val(7),
                steal: get_val(8),
            });
        } else if parts[0] == "ctxt" {
            stat.ctxt = second_u64(&parts);
        } else if parts[0] == "intr" {
            stat.intr = second_u64(&parts);
        } else if parts[0] == "softirq" {
            stat.softirq = second_u64(&parts);
        }
    }

    if stat.cpus.is_empty() {
        return Err(ParseError::new("no cpu lines in /proc/stat"));
    }
    Ok(stat)
}

/// Parsed data from `/proc/loadavg`.
#[derive(Debug, Clone, Default)]
pub struct LoadAvg {
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
}

/// Parses `/proc/loadavg` content.
pub fn parse_loadavg(content: &str) -> Result<LoadAvg, ParseError> {
    let parts: Vec<&str> = content.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(ParseError::new("invalid loadavg format"));
    }

    let load1 = parts[0]
        .parse()
        .map_err(|_| ParseError::new("invalid load1"))?;
    let load5 = parts[1]
        .parse()
        .map_err(|_| ParseError::new("invalid load5"))?;
    let load15 = parts[2]
        .parse()
        .map_err(|_| ParseError::new("invalid load15"))?;

    Ok(LoadAvg {
        load1,
        load5,
        load15,
    })
}

/// Processor facts from `/proc/cpuinfo`.
#[derive(Debug, Clone, Default)]
pub struct CpuInfo {
    pub model_name: Option<String>,
    pub vendor_id: Option<String>,
    /// Current frequency of each logical processor, in MHz, in `processor` order.
    pub mhz: Vec<f64>,
    pub physical_cores: Option<u32>,
}

/// Parses `/proc/cpuinfo` content.
pub fn parse_cpuinfo(content: &str) -> CpuInfo {
    let mut info = CpuInfo::default();

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "model name" if info.model_name.is_none() => info.model_name = Some(value.to_string()),
            // ARM boards report "Hardware" or "Model" instead
            "Model" | "Hardware" if info.model_name.is_none() && !value.is_empty() => {
                info.model_name = Some(value.to_string())
            }
            "vendor_id" if info.vendor_id.is_none() => info.vendor_id = Some(value.to_string()),
            "cpu MHz" => {
                if let Ok(mhz) = value.parse() {
                    info.mhz.push(mhz);
                }
            }
            "cpu cores" if info.physical_cores.is_none() => {
                info.physical_cores = value.parse().ok();
            }
            _ => {}
        }
    }

    info
}

/// Parsed data from `/proc/diskstats`.
#[derive(Debug, Clone, Default)]
pub struct DiskStats {
    /// Device name (sda, nvme0n1, etc.)
    pub device: String,
    /// Number of reads completed
    pub reads: u64,
    /// Number of sectors read
    pub read_sectors: u64,
    /// Time spent reading (ms)
    pub read_time: u64,
    /// Number of writes completed
    pub writes: u64,
    /// Number of sectors written
    pub write_sectors: u64,
    /// Time spent writing (ms)
    pub write_time: u64,
    /// Time spent doing I/Os (ms)
    pub io_time: u64,
}

/// Sector size the kernel uses for diskstats accounting, regardless of hardware.
pub const DISKSTATS_SECTOR_SIZE: u64 = 512;

/// Parses `/proc/diskstats` content.
///
/// Format: major minor name reads r_merged r_sectors r_time writes w_merged w_sectors w_time io_pending io_time w_io_time [discards ...]
pub fn parse_diskstats(content: &str) -> Result<Vec<DiskStats>, ParseError> {
    let mut disks = Vec::new();

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 14 {
            continue; // Skip malformed lines
        }

        let get_val =
            |idx: usize| -> u64 { parts.get(idx).and_then(|s| s.parse().ok()).unwrap_or(0) };

        disks.push(DiskStats {
            device: parts[2].to_string(),
            reads: get_val(3),
            read_sectors: get_val(5),
            read_time: get_val(6),
            writes: get_val(7),
            write_sectors: get_val(9),
            write_time: get_val(10),
            io_time: get_val(12),
        });
    }

    Ok(disks)
}

/// Parsed data from `/proc/net/dev`.
#[derive(Debug, Clone, Default)]
pub struct NetDevStats {
    /// Interface name (eth0, lo, etc.)
    pub interface: String,
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub rx_errs: u64,
    pub rx_drop: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_errs: u64,
    pub tx_drop: u64,
}

/// Parses `/proc/net/dev` content.
///
/// Format:
/// Inter-|   Receive                                                |  Transmit
///  face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
///    lo: 1234567     1234    0    0    0     0          0         0  1234567     1234    0    0    0     0       0          0
pub fn parse_net_dev(content: &str) -> Result<Vec<NetDevStats>, ParseError> {
    let mut devices = Vec::new();

    for line in content.lines() {
        // Skip header lines
        if line.contains('|') || line.trim().is_empty() {
            continue;
        }

        let Some((interface, counters)) = line.split_once(':') else {
            continue;
        };
        let values: Vec<&str> = counters.split_whitespace().collect();
        if values.len() < 16 {
            continue;
        }

        let get_val =
            |idx: usize| -> u64 { values.get(idx).and_then(|s| s.parse().ok()).unwrap_or(0) };

        devices.push(NetDevStats {
            interface: interface.trim().to_string(),
            rx_bytes: get_val(0),
            rx_packets: get_val(1),
            rx_errs: get_val(2),
            rx_drop: get_val(3),
            tx_bytes: get_val(8),
            tx_packets: get_val(9),
            tx_errs: get_val(10),
            tx_drop: get_val(11),
        });
    }

    Ok(devices)
}

/// Swap activity counters from `/proc/vmstat`, in pages.
#[derive(Debug, Clone, Default)]
pub struct VmstatInfo {
    pub pswpin: u64,
    pub pswpout: u64,
}

/// Parses `/proc/vmstat` content.
///
/// Format: key value (one per line)
pub fn parse_vmstat(content: &str) -> Result<VmstatInfo, ParseError> {
    let mut info = VmstatInfo::default();

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 {
            continue;
        }

        let value: u64 = parts[1].parse().unwrap_or(0);
        match parts[0] {
            "pswpin" => info.pswpin = value,
            "pswpout" => info.pswpout = value,
            _ => {}
        }
    }

    Ok(info)
}

/// Socket counts by TCP state, from `/proc/net/tcp` and `/proc/net/tcp6`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TcpStates {
    pub total: u64,
    pub established: u64,
    pub listen: u64,
    pub time_wait: u64,
}

impl TcpStates {
    pub fn add(&mut self, other: &TcpStates) {
        self.total += other.total;
        self.established += other.established;
        self.listen += other.listen;
        self.time_wait += other.time_wait;
    }
}

/// Parses `/proc/net/tcp` (or `tcp6`) content.
///
/// The 4th column (`st`) holds the state as hex: 01 ESTABLISHED, 06 TIME_WAIT, 0A LISTEN.
pub fn parse_tcp_states(content: &str) -> TcpStates {
    let mut states = TcpStates::default();

    for line in content.lines().skip(1) {
        let Some(st) = line.split_whitespace().nth(3) else {
            continue;
        };
        let Ok(state) = u8::from_str_radix(st, 16) else {
            continue;
        };
        states.total += 1;
        match state {
            0x01 => states.established += 1,
            0x06 => states.time_wait += 1,
            0x0A => states.listen += 1,
            _ => {}
        }
    }

    states
}

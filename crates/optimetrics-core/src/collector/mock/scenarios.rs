//! Pre-built mock filesystem scenarios for testing.
//!
//! These scenarios provide realistic `/proc` and `/sys` states for the
//! adapters and the pipeline tests.

use super::filesystem::MockFs;

impl MockFs {
    /// Creates a typical desktop: 2 cores, one SATA disk and one NVMe drive,
    /// one wired interface, an Intel iGPU next to an NVIDIA card.
    pub fn typical_system() -> Self {
        let fs = Self::new();

        fs.add_file("/proc/loadavg", "0.15 0.10 0.05 1/150 1234\n");
        fs.add_file(
            "/proc/meminfo",
            "\
MemTotal:       16384000 kB
MemFree:         8192000 kB
MemAvailable:   12000000 kB
Buffers:          512000 kB
Cached:          2048000 kB
SwapCached:            0 kB
Active:          4096000 kB
Inactive:        2048000 kB
SwapTotal:       4096000 kB
SwapFree:        4096000 kB
",
        );
        fs.add_file(
            "/proc/stat",
            "\
cpu  10000 500 3000 80000 1000 200 100 0 0 0
cpu0 5000 250 1500 40000 500 100 50 0 0 0
cpu1 5000 250 1500 40000 500 100 50 0 0 0
intr 1000000 50 0 0 0 0 0 0 0 1 0 0 0 100 0 0 1000
ctxt 500000
btime 1700000000
processes 10000
procs_running 2
procs_blocked 0
softirq 250000 10 20 30
",
        );
        fs.add_file(
            "/proc/cpuinfo",
            "\
processor\t: 0
vendor_id\t: GenuineIntel
model name\t: Intel(R) Core(TM) i7-9700K CPU @ 3.60GHz
cpu MHz\t\t: 3600.000
cpu cores\t: 2

processor\t: 1
vendor_id\t: GenuineIntel
model name\t: Intel(R) Core(TM) i7-9700K CPU @ 3.60GHz
cpu MHz\t\t: 4100.000
cpu cores\t: 2
",
        );
        fs.add_file(
            "/proc/vmstat",
            "\
pgpgin 123456
pgpgout 654321
pswpin 100
pswpout 200
pgfault 999999
",
        );

        // Disk statistics
        fs.add_file(
            "/proc/diskstats",
            "\
   8       0 sda 12345 100 987654 5000 6789 50 456789 3000 0 4000 8000 0 0 0 0
   8       1 sda1 10000 80 800000 4000 5000 40 400000 2500 0 3500 6500 0 0 0 0
 259       0 nvme0n1 50000 200 2000000 10000 30000 150 1500000 8000 5 15000 18000 0 0 0 0
",
        );
        fs.add_block_device("sda");
        fs.add_block_device("nvme0n1");
        fs.add_file("/sys/block/nvme0n1/device/model", "Samsung SSD 970 EVO 1TB\n");

        // Network
        fs.add_file(
            "/proc/net/dev",
            "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 12345678     9876    0    0    0     0          0         0 12345678     9876    0    0    0     0       0          0
  eth0: 987654321   654321    5   10    0     0          0       100 123456789   456789    2    5    0     0       0          0
",
        );
        fs.add_net_interface("eth0", "up", 1000);
        fs.add_file(
            "/proc/net/tcp",
            "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 1 1
   1: 0100007F:1F90 0100007F:C350 01 00000000:00000000 00:00000000 00000000  1000        0 2 1
",
        );
        fs.add_file(
            "/proc/net/tcp6",
            "\
  sl  local_address                         remote_address                        st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000000000000000000000000000:0016 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 3 1
",
        );

        // Sensors
        fs.add_file("/sys/class/thermal/thermal_zone0/type", "acpitz\n");
        fs.add_file("/sys/class/thermal/thermal_zone0/temp", "45000\n");
        fs.add_file("/sys/class/thermal/thermal_zone1/type", "x86_pkg_temp\n");
        fs.add_file("/sys/class/thermal/thermal_zone1/temp", "52000\n");
        fs.add_file("/sys/class/powercap/intel-rapl:0/energy_uj", "123456789\n");

        // DRM: NVIDIA discrete card and Intel iGPU
        fs.add_file("/sys/class/drm/card0/device/vendor", "0x10de\n");
        fs.add_file("/sys/class/drm/card1/device/vendor", "0x8086\n");
        fs.add_file(
            "/sys/class/drm/card1/device/uevent",
            "DRIVER=i915\nPCI_CLASS=30000\nPCI_ID=8086:3E92\n",
        );
        fs.add_file("/sys/class/drm/card1/gt_cur_freq_mhz", "350\n");
        fs.add_file("/sys/class/drm/card1/gt_max_freq_mhz", "1200\n");
        fs.add_file("/sys/class/drm/card1/gt_min_freq_mhz", "350\n");
        fs.add_dir("/sys/class/drm/card1-HDMI-A-1");

        // Motherboard identity
        fs.add_file("/sys/class/dmi/id/board_vendor", "ASUSTeK COMPUTER INC.\n");
        fs.add_file("/sys/class/dmi/id/board_name", "PRIME Z390-A\n");

        fs
    }

    /// Replaces `/proc/stat` with a single-core system whose aggregate
    /// counters have the given busy and idle jiffies.
    pub fn set_cpu_jiffies(&self, busy: u64, idle: u64) {
        self.add_file(
            "/proc/stat",
            format!(
                "cpu  {busy} 0 0 {idle} 0 0 0 0 0 0\ncpu0 {busy} 0 0 {idle} 0 0 0 0 0 0\nintr 1000 0\nctxt 5000\nsoftirq 100 0\n"
            ),
        );
    }
}

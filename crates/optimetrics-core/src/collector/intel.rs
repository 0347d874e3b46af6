//! Intel GPU adapter backed by the DRM sysfs interface.
//!
//! Only presence, name and the i915 frequency attributes are exposed by the
//! kernel without elevated privileges, so that is what this adapter reports.

use std::collections::BTreeSet;
use std::path::PathBuf;

use tracing::debug;

use crate::collector::adapter::{AdapterHealth, HardwareAdapter, KernelPaths, ReadingSet};
use crate::collector::traits::FileSystem;
use crate::model::{HardwareDescriptor, Readings};

const INTEL_PCI_VENDOR: &str = "0x8086";

#[derive(Debug, Clone)]
struct IntelCard {
    /// `/sys/class/drm/cardN`
    path: PathBuf,
    name: String,
    driver: Option<String>,
}

pub struct IntelGpuAdapter<F: FileSystem> {
    fs: F,
    paths: KernelPaths,
    health: AdapterHealth,
    info: Option<HardwareDescriptor>,
    card: Option<IntelCard>,
}

impl<F: FileSystem> IntelGpuAdapter<F> {
    pub fn new(fs: F, paths: KernelPaths) -> Self {
        Self {
            fs,
            paths,
            health: AdapterHealth::new("intel_gpu"),
            info: None,
            card: None,
        }
    }

    fn find_card(&self) -> Option<IntelCard> {
        let mut cards = self.fs.read_dir(&self.paths.sys.join("class/drm")).ok()?;
        cards.sort();

        cards.into_iter().find_map(|path| {
            let file_name = path.file_name()?.to_str()?;
            // Skip connectors such as card0-DP-1
            let index = file_name.strip_prefix("card")?;
            if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }

            let vendor = self.fs.read_line(&path.join("device/vendor")).ok()?;
            if vendor != INTEL_PCI_VENDOR {
                return None;
            }

            let uevent = self
                .fs
                .read_to_string(&path.join("device/uevent"))
                .unwrap_or_default();
            let field = |key: &str| {
                uevent
                    .lines()
                    .find_map(|l| l.strip_prefix(key))
                    .map(|v| v.trim().to_string())
            };
            let name = match field("PCI_ID=") {
                Some(id) => format!("Intel Graphics [{}]", id),
                None => "Intel Graphics".to_string(),
            };

            Some(IntelCard {
                path,
                name,
                driver: field("DRIVER="),
            })
        })
    }

    fn read_mhz(&self, card: &IntelCard, attr: &str) -> Option<Result<f64, String>> {
        let path = card.path.join(attr);
        if !self.fs.exists(&path) {
            return None;
        }
        Some(
            self.fs
                .read_line(&path)
                .map_err(|e| e.to_string())
                .and_then(|s| s.parse::<f64>().map_err(|e| e.to_string())),
        )
    }
}

impl<F: FileSystem> HardwareAdapter for IntelGpuAdapter<F> {
    fn name(&self) -> &'static str {
        "intel_gpu"
    }

    fn initialize(&mut self) -> bool {
        if self.health.is_initialized() {
            return true;
        }
        match self.find_card() {
            Some(card) => {
                debug!(card = %card.path.display(), name = %card.name, "intel gpu found");
                self.card = Some(card);
                self.health.mark_initialized();
                true
            }
            None => false,
        }
    }

    fn hardware_info(&mut self) -> Option<HardwareDescriptor> {
        if !self.health.is_initialized() {
            return None;
        }
        if let Some(info) = &self.info {
            return Some(info.clone());
        }

        let card = self.card.as_ref()?;
        let mut capabilities: BTreeSet<String> =
            ["gpu".to_string(), "presence".to_string()].into_iter().collect();
        if self.fs.exists(&card.path.join("gt_cur_freq_mhz")) {
            capabilities.insert("frequency".to_string());
        }

        let mut descriptor = HardwareDescriptor {
            vendor: "Intel".to_string(),
            model: card.name.clone(),
            identifier: card
                .path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("card")
                .to_string(),
            driver_version: card.driver.clone(),
            capabilities,
            ..HardwareDescriptor::default()
        };
        descriptor
            .extra
            .insert("devices".to_string(), vec![card.name.clone()].into());

        self.info = Some(descriptor.clone());
        Some(descriptor)
    }

    fn collect(&mut self) -> Readings {
        if !self.health.is_available() {
            return Readings::new();
        }
        let Some(card) = self.card.clone() else {
            return Readings::new();
        };

        let mut set = ReadingSet::new("intel_gpu");
        set.add("intel_gpu_present", 1.0, "bool");
        set.add("intel_gpu_name", card.name.as_str(), "");

        for (attr, key) in [
            ("gt_cur_freq_mhz", "intel_gpu_freq_mhz"),
            ("gt_max_freq_mhz", "intel_gpu_max_freq_mhz"),
            ("gt_min_freq_mhz", "intel_gpu_min_freq_mhz"),
        ] {
            match self.read_mhz(&card, attr) {
                Some(Ok(mhz)) => set.add(key, mhz, "MHz"),
                Some(Err(e)) => set.fail(&mut self.health, attr, &e),
                None => {}
            }
        }

        set.finish(&mut self.health)
    }

    fn cleanup(&mut self) {
        self.card = None;
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

    #[test]
    fn test_detects_intel_card_and_reads_frequency() {
        let fs = MockFs::typical_system();
        let mut gpu = IntelGpuAdapter::new(fs, KernelPaths::default());
        assert!(gpu.initialize());

        let readings = gpu.collect();
        assert_eq!(readings["intel_gpu_present"].value, Value::Number(1.0));
        assert_eq!(
            readings["intel_gpu_name"].value,
            Value::Text("Intel Graphics [8086:3E92]".to_string())
        );
        assert_eq!(readings["intel_gpu_freq_mhz"].value, Value::Number(350.0));
        assert_eq!(readings["intel_gpu_max_freq_mhz"].value, Value::Number(1200.0));

        let info = gpu.hardware_info().unwrap();
        assert_eq!(info.identifier, "card1");
        assert_eq!(info.driver_version.as_deref(), Some("i915"));
    }

    #[test]
    fn test_other_vendors_are_ignored() {
        let fs = MockFs::new();
        fs.add_file("/sys/class/drm/card0/device/vendor", "0x10de\n");
        fs.add_dir("/sys/class/drm/card0-DP-1");
        let mut gpu = IntelGpuAdapter::new(fs, KernelPaths::default());
        assert!(!gpu.initialize());
        assert!(gpu.collect().is_empty());
        assert!(gpu.hardware_info().is_none());
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let mut gpu = IntelGpuAdapter::new(MockFs::typical_system(), KernelPaths::default());
        assert!(gpu.initialize());
        gpu.cleanup();
        gpu.cleanup();
        assert!(!gpu.is_initialized());
        assert!(gpu.collect().is_empty());
    }
}

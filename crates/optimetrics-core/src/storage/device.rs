//! Device identity and the per-device directory record.
//!
//! The device id is a truncated SHA-2 digest of stable hardware names, so the
//! same machine maps to the same directory and remote folder across restarts
//! without exposing the names themselves.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};
use tracing::{debug, info, warn};

use crate::collector::{FileSystem, KernelPaths};
use crate::config::{HardwareIdConfig, HashAlgorithm};
use crate::model::HardwareDescriptor;
use crate::storage::error::StorageError;

pub const HARDWARE_ID_LEN: usize = 32;
pub const HARDWARE_ID_CACHE: &str = ".hardware_id";
pub const DEVICE_INFO_FILE: &str = "device_info.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Motherboard {
    pub vendor: String,
    pub board: String,
}

/// Hardware names the device id is derived from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityComponents {
    pub cpu_model: String,
    pub gpu_names: Vec<String>,
    pub motherboard: Option<Motherboard>,
}

impl IdentityComponents {
    /// Collects the CPU model and GPU names from adapter descriptors.
    pub fn from_descriptors<'a, I>(descriptors: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a HardwareDescriptor)>,
    {
        let mut components = Self::default();
        for (adapter, descriptor) in descriptors {
            if adapter == "cpu" {
                components.cpu_model = descriptor.model.clone();
            } else if descriptor.capabilities.contains("gpu") {
                match descriptor.extra.get("devices").and_then(|d| d.as_array()) {
                    Some(devices) => components
                        .gpu_names
                        .extend(devices.iter().filter_map(|d| d.as_str()).map(String::from)),
                    None => components.gpu_names.push(descriptor.model.clone()),
                }
            }
        }
        components
    }

    /// Reads the board vendor and name from DMI.
    pub fn with_motherboard<F: FileSystem>(mut self, fs: &F, paths: &KernelPaths) -> Self {
        let dmi = paths.sys.join("class/dmi/id");
        let vendor = fs.read_line(&dmi.join("board_vendor"));
        let board = fs.read_line(&dmi.join("board_name"));
        match (vendor, board) {
            (Ok(vendor), Ok(board)) => self.motherboard = Some(Motherboard { vendor, board }),
            (Err(e), _) | (_, Err(e)) => debug!(error = %e, "motherboard identity unavailable"),
        }
        self
    }
}

/// Derives the 32-hex-character device id.
pub fn hardware_id(components: &IdentityComponents, config: &HardwareIdConfig) -> String {
    let mut parts = Vec::new();
    if config.include_cpu {
        parts.push(format!("CPU:{}", components.cpu_model));
    }
    if config.include_gpu {
        let mut names = components.gpu_names.clone();
        names.sort();
        parts.push(format!("GPU:{}", names.join("|")));
    }
    if config.include_motherboard
        && let Some(mb) = &components.motherboard
    {
        parts.push(format!("MB:{}:{}", mb.vendor, mb.board));
    }
    let combined = parts.join("||");

    let mut digest = match config.hash_algorithm {
        HashAlgorithm::Sha256 => format!("{:x}", Sha256::digest(combined.as_bytes())),
        HashAlgorithm::Sha384 => format!("{:x}", Sha384::digest(combined.as_bytes())),
        HashAlgorithm::Sha512 => format!("{:x}", Sha512::digest(combined.as_bytes())),
    };
    digest.truncate(HARDWARE_ID_LEN);
    digest
}

fn is_valid_id(id: &str) -> bool {
    id.len() == HARDWARE_ID_LEN && id.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Returns the id cached in `data_dir`, or derives and caches a new one.
///
/// A cache that is not exactly 32 hex characters is ignored and replaced.
pub fn load_or_create_hardware_id(
    data_dir: &Path,
    components: &IdentityComponents,
    config: &HardwareIdConfig,
) -> Result<String, StorageError> {
    let cache = data_dir.join(HARDWARE_ID_CACHE);
    match fs::read_to_string(&cache) {
        Ok(text) if is_valid_id(text.trim()) => return Ok(text.trim().to_string()),
        Ok(_) => warn!(path = %cache.display(), "invalid hardware id cache, regenerating"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %cache.display(), error = %e, "cannot read hardware id cache"),
    }

    let id = hardware_id(components, config);
    fs::create_dir_all(data_dir)?;
    fs::write(&cache, &id)?;
    info!(hardware_id = %id, "hardware id generated");
    Ok(id)
}

/// Write-once description of the device, stored next to its data files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub hardware_id: String,
    pub platform: String,
    pub arch: String,
    pub cpu_model: String,
    pub gpus: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl DeviceInfo {
    pub fn new(hardware_id: &str, components: &IdentityComponents) -> Self {
        Self {
            hardware_id: hardware_id.to_string(),
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            cpu_model: components.cpu_model.clone(),
            gpus: components.gpu_names.clone(),
            created_at: Utc::now(),
        }
    }

    /// Writes `device_info.json` unless it already exists. Returns `true`
    /// if the file was written.
    pub fn write_once(&self, device_dir: &Path) -> Result<bool, StorageError> {
        let path = device_dir.join(DEVICE_INFO_FILE);
        if path.exists() {
            return Ok(false);
        }
        fs::create_dir_all(device_dir)?;
        fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        Ok(true)
    }

    pub fn load(device_dir: &Path) -> Result<Self, StorageError> {
        let text = fs::read_to_string(device_dir.join(DEVICE_INFO_FILE))?;
        Ok(serde_json::from_str(&text)?)
    }
}

//! Process-wide values resolved once at startup and passed to every
//! component.

use std::fs;
use std::path::PathBuf;

use tracing::info;

use crate::config::Config;
use crate::storage::{
    self, DeviceInfo, IdentityComponents, StorageError, SyncStateTracker,
    load_or_create_hardware_id,
};
use crate::util::Shutdown;

pub struct AppContext {
    pub config: Config,
    pub device_id: String,
    /// `<data_dir>/<device_id>`
    pub device_dir: PathBuf,
    pub shutdown: Shutdown,
}

impl AppContext {
    pub fn new(config: Config, device_id: impl Into<String>, shutdown: Shutdown) -> Self {
        let device_id = device_id.into();
        let device_dir = storage::device_dir(&config.storage.data_dir, &device_id);
        Self {
            config,
            device_id,
            device_dir,
            shutdown,
        }
    }

    /// Resolves the device id from `components`, creates the device
    /// directory and records the device description on first run.
    pub fn establish(
        config: Config,
        components: &IdentityComponents,
        shutdown: Shutdown,
    ) -> Result<Self, StorageError> {
        let device_id =
            load_or_create_hardware_id(&config.storage.data_dir, components, &config.hardware_id)?;
        let ctx = Self::new(config, device_id, shutdown);
        fs::create_dir_all(&ctx.device_dir)?;
        if DeviceInfo::new(&ctx.device_id, components).write_once(&ctx.device_dir)? {
            info!(dir = %ctx.device_dir.display(), "device directory initialized");
        }
        Ok(ctx)
    }

    pub fn data_dir(&self) -> &std::path::Path {
        &self.config.storage.data_dir
    }

    pub fn load_sync_tracker(&self) -> SyncStateTracker {
        SyncStateTracker::in_dir(&self.device_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_establish_creates_device_dir() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.data_dir = dir.path().to_path_buf();
        let components = IdentityComponents {
            cpu_model: "Test CPU".into(),
            ..IdentityComponents::default()
        };

        let ctx = AppContext::establish(config.clone(), &components, Shutdown::new()).unwrap();
        assert_eq!(ctx.device_id.len(), 32);
        assert_eq!(ctx.device_dir, dir.path().join(&ctx.device_id));
        assert!(ctx.device_dir.join("device_info.json").exists());

        // Same id on the next start
        let again = AppContext::establish(config, &components, Shutdown::new()).unwrap();
        assert_eq!(again.device_id, ctx.device_id);
    }
}

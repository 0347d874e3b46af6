//! Local persistence: categorized CSV files, the rolling writer, upload
//! cursors and the small per-device records.
//!
//! ```text
//! <data_dir>/
//! ├── .hardware_id
//! ├── .session_state.json
//! └── <hardware_id>/
//!     ├── cpu.csv, memory.csv, disk.csv, network.csv, gpu_*.csv
//!     ├── metrics_<id8>_<date>[_n].csv[.zst]   (rolling sink)
//!     ├── device_info.json
//!     └── sync_state.json
//! ```

pub mod categorize;
pub mod device;
mod error;
pub mod rolling;
pub mod session;
pub mod sync_state;
pub mod tabular;

use std::path::{Path, PathBuf};

pub use categorize::categorize;
pub use device::{DeviceInfo, IdentityComponents, hardware_id, load_or_create_hardware_id};
pub use error::StorageError;
pub use rolling::{AgedSweep, CompressionResult, RollingWriter};
pub use session::SessionState;
pub use sync_state::{FileCursor, PendingRange, SyncState, SyncStateTracker};
pub use tabular::CategorizedStore;

/// Directory holding everything stored for one device.
pub fn device_dir(data_dir: &Path, hardware_id: &str) -> PathBuf {
    data_dir.join(hardware_id)
}

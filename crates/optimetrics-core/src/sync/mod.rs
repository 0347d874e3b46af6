//! Upload of the categorized files to a remote folder per device.

pub mod auth;
pub mod content;
pub mod drive;
pub mod engine;
mod error;
#[cfg(any(test, feature = "testing"))]
pub mod mock;
pub mod remote;

pub use auth::{CredentialProvider, ServiceAccount, StaticToken};
pub use drive::DriveClient;
pub use engine::{SyncEngine, SyncOutcome, SyncReport, SyncSettings, SyncStats, SyncStatsHandle};
pub use error::{RemoteError, SyncError};
#[cfg(any(test, feature = "testing"))]
pub use mock::MemoryRemote;
pub use remote::RemoteStore;

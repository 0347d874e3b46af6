//! optimetrics-core - hardware telemetry collection, local storage and
//! remote sync.
//!
//! Provides:
//! - `collector` - hardware adapters (procfs/sysfs, NVML) and snapshot merge
//! - `buffer` - delta-filtering snapshot buffer
//! - `classifier` - workload category from a sliding metric window
//! - `storage` - categorized CSV files, rolling files, upload cursors
//! - `sync` - incremental upload to Google Drive
//! - `pipeline` - collect, classify, buffer and flush wired together
//! - `config` - TOML configuration
//! - `util` - helper utilities

pub mod buffer;
pub mod classifier;
pub mod collector;
pub mod config;
pub mod context;
pub mod model;
pub mod pipeline;
pub mod rates;
pub mod storage;
pub mod sync;
pub mod util;

/// Git revision of the build (`-dirty` with local changes), `unknown`
/// outside a checkout.
pub const BUILD_REVISION: &str = env!("OPTIMETRICS_BUILD_REVISION");

/// Commit date of the build revision, `YYYY-MM-DD` or `unknown`.
pub const COMMIT_DATE: &str = env!("OPTIMETRICS_COMMIT_DATE");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_info_is_stamped() {
        assert!(!BUILD_REVISION.is_empty());
        assert!(!BUILD_REVISION.contains('\n'));
        assert!(
            COMMIT_DATE == "unknown" || chrono::NaiveDate::parse_from_str(COMMIT_DATE, "%Y-%m-%d").is_ok(),
            "unexpected commit date {COMMIT_DATE}"
        );
    }
}

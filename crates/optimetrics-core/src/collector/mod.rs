//! Hardware metrics collection.
//!
//! Each hardware domain is covered by an adapter implementing
//! [`HardwareAdapter`]. The [`Collector`] owns a homogeneous list of them and
//! merges their readings into one [`Snapshot`](crate::model::Snapshot) per tick.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Collector                             │
//! │   Vec<Box<dyn HardwareAdapter>>  ──merge──▶  Snapshot           │
//! │                                                                 │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌──────────┐            │
//! │  │   Cpu    │ │  Memory  │ │   Disk   │ │ Network  │  IntelGpu  │
//! │  └────┬─────┘ └────┬─────┘ └────┬─────┘ └────┬─────┘            │
//! │       └────────────┴─────┬──────┴────────────┘                  │
//! │                   ┌──────▼──────┐           ┌──────────────┐    │
//! │                   │  FileSystem │ (trait)   │  NvidiaGpu   │    │
//! │                   └──────┬──────┘           │   (NVML)     │    │
//! └──────────────────────────┼──────────────────┴──────────────┴────┘
//!                  ┌─────────┴─────────┐
//!           ┌──────▼──────┐     ┌──────▼──────┐
//!           │   RealFs    │     │   MockFs    │
//!           │   (Linux)   │     │  (Testing)  │
//!           └─────────────┘     └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use optimetrics_core::collector::{Collector, KernelPaths, MockFs};
//! use optimetrics_core::config::GeneralConfig;
//!
//! let fs = MockFs::typical_system();
//! let config = GeneralConfig { collect_gpu: false, ..GeneralConfig::default() };
//! let mut collector = Collector::linux(fs, KernelPaths::default(), &config);
//! collector.initialize();
//! let snapshot = collector.collect_snapshot();
//! assert!(snapshot.get("ram_percent").is_some());
//! ```

pub mod adapter;
#[allow(clippy::module_inception)]
mod collector;
pub mod cpu;
pub mod disk;
pub mod intel;
pub mod memory;
pub mod mock;
pub mod network;
pub mod nvidia;
pub mod procfs;
pub mod traits;

pub use adapter::{AdapterHealth, AdapterState, CollectError, HardwareAdapter, KernelPaths};
pub use collector::{Collector, DEGRADED_RETRY_TICKS};
pub use mock::MockFs;
pub use traits::{FileSystem, RealFs};

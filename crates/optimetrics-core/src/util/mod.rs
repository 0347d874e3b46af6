//! Small helpers shared by the library and the daemon.

mod shutdown;
pub mod size;

pub use shutdown::Shutdown;
pub use size::{format_size, parse_size};

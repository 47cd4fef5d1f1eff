//! Small helpers shared by the daemon and helper binaries.
mod tracing_util;
pub use tracing_util::*;

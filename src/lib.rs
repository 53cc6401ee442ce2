// Library crate for the Gordon task-queue dispatcher.
// Exports modules for use by the binary and the integration tests.

pub mod admission;
pub mod backoff;
pub mod basepath;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod output;
pub mod queue;
pub mod stats;

/// Crate version, reported by `--version` and the stats endpoint.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

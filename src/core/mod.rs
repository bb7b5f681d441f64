// Core infrastructure shared by the resource and graph modules

pub mod config;
pub mod errors;

pub use config::{DeployConfig, DeployConfigBuilder};
pub use errors::{DeployError, Result};

/// Install a `tracing` fmt subscriber at the given level.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing(level: tracing::Level) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init();
}

pub mod config;
pub mod daemon;

pub use config::{BridgeConfig, ConfigError, Settings};
pub use daemon::run_daemon;

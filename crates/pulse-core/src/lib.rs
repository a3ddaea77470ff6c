pub mod config;
pub mod types;

pub use config::{ClusterConfig, ConfigError, HbConfig, HbDriverConfig, parse_duration};
pub use types::*;

//! Application configuration

pub mod loader;
pub mod types;

pub use loader::load_config;
pub use types::{AppConfig, AppSettings, BroadcastConfig, DetectorConfig, GatewayConfig};

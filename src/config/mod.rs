// Configuration module for teammesh
// Handles loading and managing mesh configuration from TOML file

pub mod loader;
pub mod types;

pub use loader::{create_default_config, get_config_path, load_config};
pub use types::{ChannelTuning, Config, IceConfig, NetworkConfig};

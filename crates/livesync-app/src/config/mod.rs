//! Configuration file parsing for livesync
//!
//! Supports `.livesync/config.toml` in the project directory.

pub mod settings;
pub mod types;

pub use settings::{init_config_dir, load_settings};
pub use types::*;

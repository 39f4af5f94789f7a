//! Settings parser for .livesync/config.toml

use std::path::Path;

use livesync_core::prelude::*;

use super::types::Settings;

const CONFIG_FILENAME: &str = "config.toml";
const LIVESYNC_DIR: &str = ".livesync";

const DEFAULT_CONFIG: &str = r#"# livesync configuration

[watcher]
debounce_ms = 500         # Quiet period before a native change is reported
tick_ms = 100

[sync]
batch_delay_ms = 250      # Changes arriving within this window sync together
operation_timeout_secs = 60
connect_timeout_secs = 60
hot_update_timeout_ms = 3000
fast_sync_extensions = [".css", ".xml", ".html"]

[android]
build_command = "./gradlew assembleDebug"
package_path = "app/build/outputs/apk/debug/app-debug.apk"

[compiler]
# output_directory = "platforms/android/app/src/main/assets/app"
"#;

/// Load settings from .livesync/config.toml
///
/// Returns default settings if file doesn't exist or can't be parsed.
pub fn load_settings(project_path: &Path) -> Settings {
    let config_path = project_path.join(LIVESYNC_DIR).join(CONFIG_FILENAME);

    if !config_path.exists() {
        debug!("No config file at {:?}, using defaults", config_path);
        return Settings::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(settings) => {
                debug!("Loaded settings from {:?}", config_path);
                settings
            }
            Err(e) => {
                warn!("Failed to parse {:?}: {}", config_path, e);
                Settings::default()
            }
        },
        Err(e) => {
            warn!("Failed to read {:?}: {}", config_path, e);
            Settings::default()
        }
    }
}

/// Create the default config file in .livesync/
pub fn init_config_dir(project_path: &Path) -> Result<()> {
    let livesync_dir = project_path.join(LIVESYNC_DIR);

    if !livesync_dir.exists() {
        std::fs::create_dir_all(&livesync_dir)
            .map_err(|e| Error::config(format!("Failed to create .livesync dir: {}", e)))?;
    }

    let config_path = livesync_dir.join(CONFIG_FILENAME);
    if !config_path.exists() {
        std::fs::write(&config_path, DEFAULT_CONFIG)
            .map_err(|e| Error::config(format!("Failed to write config.toml: {}", e)))?;
    }

    Ok(())
}

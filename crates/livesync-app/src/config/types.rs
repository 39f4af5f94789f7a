//! Configuration types for livesync
//!
//! Defines `Settings` (`.livesync/config.toml`) and its sections.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Application settings (.livesync/config.toml)
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub watcher: WatcherSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub android: AndroidSettings,

    #[serde(default)]
    pub compiler: CompilerSettings,
}

/// Native file watcher settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WatcherSettings {
    /// How long a path must stay quiet before its change is reported
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// How often pending events are checked
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            tick_ms: default_tick_ms(),
        }
    }
}

impl WatcherSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_tick_ms() -> u64 {
    100
}

/// Device sync settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SyncSettings {
    /// Window in which prepared changes are collected into one batch
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,

    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// How long to wait for a hot update verdict before assuming success
    #[serde(default = "default_hot_update_timeout_ms")]
    pub hot_update_timeout_ms: u64,

    /// Extensions the app can reload without a restart
    #[serde(default = "default_fast_sync_extensions")]
    pub fast_sync_extensions: Vec<String>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_delay_ms: default_batch_delay_ms(),
            operation_timeout_secs: default_operation_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            hot_update_timeout_ms: default_hot_update_timeout_ms(),
            fast_sync_extensions: default_fast_sync_extensions(),
        }
    }
}

impl SyncSettings {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn hot_update_timeout(&self) -> Duration {
        Duration::from_millis(self.hot_update_timeout_ms)
    }
}

fn default_batch_delay_ms() -> u64 {
    250
}

fn default_operation_timeout_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    60
}

fn default_hot_update_timeout_ms() -> u64 {
    3000
}

fn default_fast_sync_extensions() -> Vec<String> {
    livesync_device::DEFAULT_FAST_SYNC_EXTENSIONS
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

/// Android native build settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AndroidSettings {
    /// Shell command that produces the APK, run from the platform project
    #[serde(default = "default_build_command")]
    pub build_command: String,

    /// Produced APK, relative to the platform project
    #[serde(default = "default_package_path")]
    pub package_path: PathBuf,
}

impl Default for AndroidSettings {
    fn default() -> Self {
        Self {
            build_command: default_build_command(),
            package_path: default_package_path(),
        }
    }
}

fn default_build_command() -> String {
    "./gradlew assembleDebug".to_string()
}

fn default_package_path() -> PathBuf {
    PathBuf::from("app/build/outputs/apk/debug/app-debug.apk")
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CompilerSettings {
    /// Overrides where compiled app sources are written
    #[serde(default)]
    pub output_directory: Option<PathBuf>,
}

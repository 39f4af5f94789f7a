//! Headless mode - NDJSON event output
//!
//! The runner reports everything that happens during a live-sync run as
//! newline-delimited JSON on stdout, one event per line, so editors and
//! scripts can drive `livesync` without parsing log text.
//!
//! # Example Output
//!
//! ```json
//! {"event":"device_detected","device_id":"emulator-5554","device_name":"Pixel 7","platform":"android","emulator":true,"timestamp":1704700001000}
//! {"event":"sync_executed","device_id":"emulator-5554","synced_files":["app/main.js"],"full_sync":false,"timestamp":1704700002000}
//! ```

pub mod control;
pub mod runner;

use std::io::{self, Write};

use chrono::Utc;
use serde::Serialize;
use tracing::error;

use livesync_core::LiveSyncEvent;

/// Events emitted in headless mode
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HeadlessEvent {
    /// A device selected for this run
    DeviceDetected {
        device_id: String,
        device_name: String,
        platform: String,
        emulator: bool,
        timestamp: i64,
    },

    /// App is running on the device with current sources
    SyncStarted {
        device_id: String,
        app_id: String,
        timestamp: i64,
    },

    /// A sync pass completed
    SyncExecuted {
        device_id: String,
        synced_files: Vec<String>,
        full_sync: bool,
        timestamp: i64,
    },

    /// Device detached from the run
    SyncStopped { device_id: String, timestamp: i64 },

    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
        fatal: bool,
        timestamp: i64,
    },

    Notification {
        device_id: String,
        message: String,
        timestamp: i64,
    },

    /// Transport to a device broke between operations
    ConnectionError {
        device_id: String,
        message: String,
        timestamp: i64,
    },

    /// Compiler or native build output line
    BuildOutput {
        platform: String,
        line: String,
        timestamp: i64,
    },

    /// Compiler watches were paused or resumed
    WatcherToggled { paused: bool, timestamp: i64 },
}

impl HeadlessEvent {
    /// Emit this event to stdout as JSON
    pub fn emit(&self) {
        let json = match serde_json::to_string(self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize headless event: {}", e);
                return;
            }
        };

        let mut stdout = io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{}", json) {
            error!("Failed to write headless event to stdout: {}", e);
            return;
        }

        if let Err(e) = stdout.flush() {
            error!("Failed to flush headless stdout: {}", e);
        }
    }

    /// Get current timestamp in milliseconds
    fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Headless form of an orchestrator event
    pub fn from_livesync(event: &LiveSyncEvent) -> Self {
        match event {
            LiveSyncEvent::Started {
                device_identifier,
                application_identifier,
                ..
            } => Self::SyncStarted {
                device_id: device_identifier.clone(),
                app_id: application_identifier.clone(),
                timestamp: Self::now(),
            },
            LiveSyncEvent::Executed {
                device_identifier,
                synced_files,
                is_full_sync,
                ..
            } => Self::sync_executed(device_identifier, synced_files.clone(), *is_full_sync),
            LiveSyncEvent::Stopped {
                device_identifier, ..
            } => Self::sync_stopped(device_identifier),
            LiveSyncEvent::Error {
                device_identifier,
                message,
                ..
            } => Self::Error {
                message: message.clone(),
                device_id: device_identifier.clone(),
                fatal: false,
                timestamp: Self::now(),
            },
            LiveSyncEvent::Notification {
                device_identifier,
                message,
                ..
            } => Self::Notification {
                device_id: device_identifier.clone(),
                message: message.clone(),
                timestamp: Self::now(),
            },
            LiveSyncEvent::ConnectionError {
                device_identifier,
                message,
            } => Self::ConnectionError {
                device_id: device_identifier.clone(),
                message: message.clone(),
                timestamp: Self::now(),
            },
            LiveSyncEvent::BuildOutput { platform, line, .. } => Self::BuildOutput {
                platform: platform.to_string(),
                line: line.clone(),
                timestamp: Self::now(),
            },
        }
    }

    // ─────────────────────────────────────────────────────────
    // Convenience constructors
    // ─────────────────────────────────────────────────────────

    pub fn device_detected(
        device_id: &str,
        device_name: &str,
        platform: &str,
        emulator: bool,
    ) -> Self {
        Self::DeviceDetected {
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
            platform: platform.to_string(),
            emulator,
            timestamp: Self::now(),
        }
    }

    pub fn sync_executed(device_id: &str, synced_files: Vec<String>, full_sync: bool) -> Self {
        Self::SyncExecuted {
            device_id: device_id.to_string(),
            synced_files,
            full_sync,
            timestamp: Self::now(),
        }
    }

    pub fn sync_stopped(device_id: &str) -> Self {
        Self::SyncStopped {
            device_id: device_id.to_string(),
            timestamp: Self::now(),
        }
    }

    pub fn error(message: String, fatal: bool) -> Self {
        Self::Error {
            message,
            device_id: None,
            fatal,
            timestamp: Self::now(),
        }
    }

    pub fn watcher_toggled(paused: bool) -> Self {
        Self::WatcherToggled {
            paused,
            timestamp: Self::now(),
        }
    }
}

//! Domain event definitions
//!
//! [`LiveSyncEvent`] is what the orchestrator publishes to subscribers (the
//! headless runner serializes it straight to NDJSON). [`PrepareReadyEvent`]
//! flows from the prepare pipeline into the orchestrator.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::{ChangeDescriptor, Platform};

/// Lifecycle event of a live-sync run on a device
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LiveSyncEvent {
    /// App is running on the device with the current sources
    Started {
        project_dir: PathBuf,
        device_identifier: String,
        application_identifier: String,
    },

    /// A sync pass completed on the device
    Executed {
        project_dir: PathBuf,
        device_identifier: String,
        application_identifier: String,
        synced_files: Vec<String>,
        is_full_sync: bool,
    },

    /// The device was detached from the project's session
    Stopped {
        project_dir: PathBuf,
        device_identifier: String,
    },

    /// A per-device workflow failed
    Error {
        project_dir: PathBuf,
        #[serde(skip_serializing_if = "Option::is_none")]
        device_identifier: Option<String>,
        message: String,
    },

    /// Informational message meant for the user
    Notification {
        project_dir: PathBuf,
        device_identifier: String,
        message: String,
    },

    /// Transport connection to a device broke outside of a running operation
    ConnectionError {
        device_identifier: String,
        message: String,
    },

    /// Raw output line from the compiler or a native build
    BuildOutput {
        project_dir: PathBuf,
        platform: Platform,
        line: String,
    },
}

impl LiveSyncEvent {
    /// Short label for logs
    pub fn event_type(&self) -> &'static str {
        match self {
            LiveSyncEvent::Started { .. } => "started",
            LiveSyncEvent::Executed { .. } => "executed",
            LiveSyncEvent::Stopped { .. } => "stopped",
            LiveSyncEvent::Error { .. } => "error",
            LiveSyncEvent::Notification { .. } => "notification",
            LiveSyncEvent::ConnectionError { .. } => "connection_error",
            LiveSyncEvent::BuildOutput { .. } => "build_output",
        }
    }

    /// Device the event concerns, when it is about a single device
    pub fn device_identifier(&self) -> Option<&str> {
        match self {
            LiveSyncEvent::Started {
                device_identifier, ..
            }
            | LiveSyncEvent::Executed {
                device_identifier, ..
            }
            | LiveSyncEvent::Stopped {
                device_identifier, ..
            }
            | LiveSyncEvent::Notification {
                device_identifier, ..
            }
            | LiveSyncEvent::ConnectionError {
                device_identifier, ..
            } => Some(device_identifier),
            LiveSyncEvent::Error {
                device_identifier, ..
            } => device_identifier.as_deref(),
            LiveSyncEvent::BuildOutput { .. } => None,
        }
    }
}

/// A change descriptor produced for a project by the prepare pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareReadyEvent {
    pub project_dir: PathBuf,
    pub descriptor: ChangeDescriptor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_tag() {
        let event = LiveSyncEvent::Stopped {
            project_dir: PathBuf::from("/work/app"),
            device_identifier: "emulator-5554".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event":"stopped""#));
        assert!(json.contains(r#""device_identifier":"emulator-5554""#));
    }

    #[test]
    fn test_error_without_device_omits_field() {
        let event = LiveSyncEvent::Error {
            project_dir: PathBuf::from("/work/app"),
            device_identifier: None,
            message: "boom".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("device_identifier"));
        assert_eq!(event.device_identifier(), None);
    }

    #[test]
    fn test_event_type_matches_serde_tag() {
        let event = LiveSyncEvent::ConnectionError {
            device_identifier: "emu".into(),
            message: "Socket Error".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], event.event_type());
        assert_eq!(event.device_identifier(), Some("emu"));
    }
}

//! Application error types with rich context

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Application error types organized by layer/domain
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // User/Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid configuration: {message}")]
    ConfigInvalid { message: String },

    #[error("You need to provide \"{property}\" as a configuration property!")]
    MissingConfiguration { property: &'static str },

    #[error("Invalid platform '{value}'. Valid platforms are: android, ios")]
    InvalidPlatform { value: String },

    #[error("No project found in: {path}")]
    NoProject { path: PathBuf },

    #[error("Cannot find device with identifier '{identifier}'")]
    DeviceNotFound { identifier: String },

    #[error("Application {app_identifier} is not installed on device {device_identifier}")]
    AppNotInstalled {
        app_identifier: String,
        device_identifier: String,
    },

    #[error("No live sync transport available for platform {platform}")]
    UnsupportedPlatform { platform: String },

    // ─────────────────────────────────────────────────────────────
    // Tool/Process Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Required tool '{tool}' not found. Ensure it is installed and in your PATH.")]
    ToolNotFound { tool: String },

    #[error("Process error: {message}")]
    Process { message: String },

    #[error("Failed to spawn process: {reason}")]
    ProcessSpawn { reason: String },

    #[error("Build failed: {message}")]
    Build { message: String },

    #[error("Installation failed: {message}")]
    Install { message: String },

    #[error("Compilation failed: {message}")]
    Compiler { message: String },

    #[error("File watcher error: {message}")]
    Watcher { message: String },

    #[error("Hook '{hook}' failed: {message}")]
    Hook { hook: String, message: String },

    // ─────────────────────────────────────────────────────────────
    // Device Communication Errors
    // ─────────────────────────────────────────────────────────────
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{}", format_device_failures(.failures))]
    DeviceActions { failures: Vec<DeviceFailure> },
}

/// A single device's failure inside a multi-device batch.
#[derive(Debug)]
pub struct DeviceFailure {
    pub device_identifier: String,
    pub error: Error,
}

fn format_device_failures(failures: &[DeviceFailure]) -> String {
    let details: Vec<String> = failures
        .iter()
        .map(|f| format!("{}: {}", f.device_identifier, f.error))
        .collect();
    format!(
        "Operation failed on {} device(s): {}",
        failures.len(),
        details.join("; ")
    )
}

/// Errors produced by the device sync transport.
///
/// Cloneable so a single connection failure can reject every pending
/// operation that shares the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("No socket connection available.")]
    NotConnected,

    #[error("Socket connection already exists.")]
    AlreadyConnected,

    #[error("Socket connection timed out.{}", .last_error.as_ref().map(|e| format!(" Last error: {e}")).unwrap_or_default())]
    ConnectTimeout { last_error: Option<String> },

    #[error("Application {app_identifier} is not running on device {device_identifier}")]
    AppNotRunning {
        app_identifier: String,
        device_identifier: String,
    },

    #[error("Sync operation {operation_id} is taking too long (timed out after {timeout:?})")]
    OperationTimeout {
        operation_id: String,
        timeout: Duration,
    },

    #[error("{message}")]
    Closed { message: String },

    #[error("Socket Error:\n{message}")]
    Socket { message: String },

    #[error("{message}")]
    Device { message: String },

    #[error("Invalid frame: {message}")]
    InvalidFrame { message: String },
}

impl TransportError {
    pub fn closed(message: impl Into<String>) -> Self {
        Self::Closed {
            message: message.into(),
        }
    }

    pub fn socket(message: impl Into<String>) -> Self {
        Self::Socket {
            message: message.into(),
        }
    }

    pub fn device(message: impl Into<String>) -> Self {
        Self::Device {
            message: message.into(),
        }
    }

    pub fn invalid_frame(message: impl Into<String>) -> Self {
        Self::InvalidFrame {
            message: message.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::Process {
            message: message.into(),
        }
    }

    pub fn build(message: impl Into<String>) -> Self {
        Self::Build {
            message: message.into(),
        }
    }

    pub fn install(message: impl Into<String>) -> Self {
        Self::Install {
            message: message.into(),
        }
    }

    pub fn compiler(message: impl Into<String>) -> Self {
        Self::Compiler {
            message: message.into(),
        }
    }

    pub fn watcher(message: impl Into<String>) -> Self {
        Self::Watcher {
            message: message.into(),
        }
    }

    pub fn hook(hook: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Hook {
            hook: hook.into(),
            message: message.into(),
        }
    }

    pub fn device_not_found(identifier: impl Into<String>) -> Self {
        Self::DeviceNotFound {
            identifier: identifier.into(),
        }
    }

    /// Check if this error should abort the requested command
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::MissingConfiguration { .. }
                | Error::InvalidPlatform { .. }
                | Error::NoProject { .. }
                | Error::DeviceNotFound { .. }
                | Error::AppNotInstalled { .. }
                | Error::ToolNotFound { .. }
                | Error::ConfigInvalid { .. }
        )
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Context Extensions
// ─────────────────────────────────────────────────────────────────

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", context.into(), err);
            err
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", f(), err);
            err
        })
    }
}

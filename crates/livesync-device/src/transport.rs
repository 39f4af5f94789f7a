//! Platform transport seam
//!
//! The orchestrator talks to devices only through [`PlatformLiveSync`]. The
//! Android implementation lives in [`crate::android`]; other platforms plug
//! in the same way.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::broadcast;

use livesync_core::prelude::*;
use livesync_core::Platform;

use crate::devices::Device;

/// Where an app's files live on the host, for one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAppData {
    pub device: Device,
    pub app_identifier: String,
    pub project_dir: PathBuf,
    /// Root that device-side paths are relative to
    pub platforms_path: PathBuf,
    /// Prepared app sources, inside `platforms_path`
    pub app_sources_dir: PathBuf,
}

/// Files to push or delete in an incremental sync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileChanges {
    pub modified_files: Vec<PathBuf>,
    pub removed_files: Vec<PathBuf>,
    /// The files carry a hot update the running app applies in place
    pub hot_update: bool,
}

impl FileChanges {
    pub fn is_empty(&self) -> bool {
        self.modified_files.is_empty() && self.removed_files.is_empty()
    }
}

/// Result of a sync pass on one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub device_identifier: String,
    pub modified_files: Vec<PathBuf>,
    pub is_full_sync: bool,
    /// Every transferred file can be applied without a restart
    pub fast_sync: bool,
    /// The device reported that it reloaded the app in place
    pub did_refresh: bool,
}

/// Connection failure reported by a transport outside of a running call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionErrorEvent {
    pub device_identifier: String,
    pub error: TransportError,
}

/// Restarts apps on a device
#[async_trait]
pub trait AppController: Send + Sync {
    async fn restart_application(&self, device_identifier: &str, app_identifier: &str)
        -> Result<()>;
}

/// Moves files onto a device and refreshes the running app
#[async_trait]
pub trait PlatformLiveSync: Send + Sync {
    fn platform(&self) -> Platform;

    /// Whether changed sources can be applied without restarting the app
    fn can_reload_in_place(&self) -> bool;

    /// Push the whole prepared app
    async fn full_sync(&self, app: &DeviceAppData) -> Result<SyncOutcome>;

    /// Push changed files and delete removed ones
    async fn sync_changes(&self, app: &DeviceAppData, changes: &FileChanges)
        -> Result<SyncOutcome>;

    /// Make the app pick up the synced files. Returns whether it was restarted.
    async fn refresh_application(
        &self,
        app: &DeviceAppData,
        outcome: &SyncOutcome,
        force_restart: bool,
    ) -> Result<bool>;

    /// Drop any connection held for the device
    async fn release(&self, device_identifier: &str);

    fn connection_errors(&self) -> Option<broadcast::Receiver<ConnectionErrorEvent>> {
        None
    }
}

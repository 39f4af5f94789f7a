//! # livesync-device - Device Access and Transports
//!
//! Discovers devices, fans actions out across them, and moves files onto a
//! running app. Depends on [`livesync_core`] for domain types and errors.
//!
//! ## Public API
//!
//! ### Devices
//! - [`Device`] - A connected device (physical or emulator)
//! - [`DeviceDiscovery`] - Device list plus attach/detach events
//! - [`DeviceExecutor`] - Run an async action on many devices concurrently
//!
//! ### Transports
//! - [`PlatformLiveSync`] - Per-platform sync and refresh seam
//! - [`AndroidLiveSync`] - Android transport over [`LivesyncClient`]
//! - [`LivesyncClient`] - Binary socket protocol client
//!
//! ### Tooling
//! - [`Adb`] - `adb` wrapper (install, forward, start/stop, logcat)
//! - [`AdbDeviceDiscovery`] - Polling discovery backed by `adb devices`
//! - [`HotUpdateMonitor`] - Hot update verdicts scraped from device logs

pub mod adb;
pub mod android;
pub mod devices;
pub mod executor;
pub mod hot_update;
pub mod sync;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;
pub mod transport;

pub use adb::{Adb, AdbDeviceDiscovery};
pub use android::{
    supports_long_living_connection, AndroidLiveSync, AndroidLiveSyncOptions,
    DEFAULT_FAST_SYNC_EXTENSIONS,
};
pub use devices::{
    diff_devices, filter_by_platform, find_device, Device, DeviceDiscovery, DeviceEvent,
    DeviceStatus,
};
pub use executor::{DeviceActionResult, DeviceExecutor, ExecutionReport};
pub use hot_update::{parse_hot_update_line, HotUpdateMonitor, HotUpdateStatus};
pub use sync::{AndroidProcessService, DoSyncOptions, LivesyncClient, LivesyncConfig};
pub use transport::{
    AppController, ConnectionErrorEvent, DeviceAppData, FileChanges, PlatformLiveSync, SyncOutcome,
};

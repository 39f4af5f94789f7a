//! # livesync-app - Watch & Prepare Pipeline and Live-Sync Orchestration
//!
//! Turns edits in a project into synced, refreshed apps on every attached
//! device. Builds on [`livesync_core`] (types, errors, events) and
//! [`livesync_device`] (discovery, executor, transports).
//!
//! ## Public API
//!
//! ### Orchestration
//! - [`LiveSyncService`] - Sessions per project, initial sync, change batches, stop
//! - [`DeviceDescriptor`] / [`LiveSyncInfo`] - What to run where
//!
//! ### Preparation
//! - [`PrepareController`] - Prepare a platform and own its watchers
//! - [`DebouncedWatcher`] - Native file watcher with a settle window
//!
//! ### Seams
//! - [`services`] - Toolchain collaborators (compiler, native builds, installs)
//! - [`hooks`] - Before/after project hooks
//! - [`config`] - `.livesync/config.toml`

pub mod config;
pub mod hooks;
pub mod livesync;
pub mod prepare;
pub mod services;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;
pub mod watcher;

pub use config::{load_settings, Settings};
pub use hooks::{HookArgs, HookRunner, HookStage, NoopHooks};
pub use livesync::{
    build_action, BuildAction, DeviceDescriptor, LiveSyncDependencies, LiveSyncInfo,
    LiveSyncService, SessionStatus, StopOptions,
};
pub use prepare::{PrepareController, PrepareEvent, PrepareRequest, PrepareServices};
pub use services::{
    AppInstaller, CompileRequest, Compiler, CompilerEvent, Dependency, DependencyResolver,
    NativePlatformService, PlatformPaths, ProjectData, ProjectService, RuntimeInfo,
};
pub use watcher::{DebouncedWatcher, WatcherConfig};

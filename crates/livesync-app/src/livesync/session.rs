//! Live-sync session state

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;

use livesync_core::prelude::*;
use livesync_core::{ChangeDescriptor, Platform};
use livesync_device::Device;

use super::chain::ActionChain;
use crate::services::ProjectData;

/// Builds the native package for a device and returns its path
pub type BuildAction = Arc<dyn Fn() -> BoxFuture<'static, Result<PathBuf>> + Send + Sync>;

/// Wrap an async closure as a [`BuildAction`]
pub fn build_action<F, Fut>(action: F) -> BuildAction
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<PathBuf>> + Send + 'static,
{
    Arc::new(move || Box::pin(action()))
}

/// A device taking part in a project's live sync
#[derive(Clone)]
pub struct DeviceDescriptor {
    pub identifier: String,
    pub platform: Platform,
    pub is_emulator: bool,
    /// Debugger attached; changes always restart the app
    pub debugging_enabled: bool,
    pub build_action: BuildAction,
    /// Previously built package, if any
    pub output_path: Option<PathBuf>,
}

impl DeviceDescriptor {
    pub fn new(device: &Device, build_action: BuildAction) -> Self {
        Self {
            identifier: device.identifier.clone(),
            platform: device.platform,
            is_emulator: device.is_emulator,
            debugging_enabled: false,
            build_action,
            output_path: None,
        }
    }

    pub fn with_debugging(mut self, enabled: bool) -> Self {
        self.debugging_enabled = enabled;
        self
    }

    pub fn with_output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }
}

impl fmt::Debug for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceDescriptor")
            .field("identifier", &self.identifier)
            .field("platform", &self.platform)
            .field("is_emulator", &self.is_emulator)
            .field("debugging_enabled", &self.debugging_enabled)
            .field("output_path", &self.output_path)
            .finish_non_exhaustive()
    }
}

/// How to run live sync for a project
#[derive(Debug, Clone, PartialEq)]
pub struct LiveSyncInfo {
    pub project_dir: PathBuf,
    /// Prepare once without starting watchers
    pub skip_watcher: bool,
    pub watch_native: bool,
    pub use_hot_updates: bool,
    /// Rebuild even when a usable package exists
    pub clean: bool,
    pub env: HashMap<String, String>,
}

impl LiveSyncInfo {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            skip_watcher: false,
            watch_native: true,
            use_hot_updates: false,
            clean: false,
            env: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopOptions {
    /// Wait for running (and, on teardown, queued) actions before returning
    pub should_await_all_actions: bool,
}

/// Snapshot of a session for callers and diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub is_stopped: bool,
    pub device_identifiers: Vec<String>,
    pub platforms: Vec<Platform>,
    pub has_pending_timer: bool,
    pub pending_changes: usize,
}

pub(crate) struct SessionState {
    pub devices: Vec<DeviceDescriptor>,
    pub platforms: HashSet<Platform>,
    pub is_stopped: bool,
    pub timer: Option<JoinHandle<()>>,
    pub pending_changes: Vec<ChangeDescriptor>,
    pub prepare_listener: Option<JoinHandle<()>>,
    pub info: LiveSyncInfo,
    pub project: Option<ProjectData>,
}

/// All live-sync state of one project directory
pub(crate) struct LiveSyncSession {
    pub project_dir: PathBuf,
    pub chain: ActionChain,
    state: Mutex<SessionState>,
}

impl LiveSyncSession {
    pub fn new(info: LiveSyncInfo) -> Self {
        Self {
            project_dir: info.project_dir.clone(),
            chain: ActionChain::new(info.project_dir.display().to_string()),
            state: Mutex::new(SessionState {
                devices: Vec::new(),
                platforms: HashSet::new(),
                is_stopped: false,
                timer: None,
                pending_changes: Vec::new(),
                prepare_listener: None,
                info,
                project: None,
            }),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn has_device(&self, identifier: &str) -> bool {
        self.state().devices.iter().any(|d| d.identifier == identifier)
    }

    pub fn status(&self) -> SessionStatus {
        let state = self.state();
        let mut platforms: Vec<Platform> = state.platforms.iter().copied().collect();
        platforms.sort_by_key(|p| p.as_str());
        SessionStatus {
            is_stopped: state.is_stopped,
            device_identifiers: state.devices.iter().map(|d| d.identifier.clone()).collect(),
            platforms,
            has_pending_timer: state.timer.is_some(),
            pending_changes: state.pending_changes.len(),
        }
    }
}

impl Drop for LiveSyncSession {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        if let Some(listener) = state.prepare_listener.take() {
            listener.abort();
        }
    }
}

/// Merge pending descriptors into one per platform, in first-seen order
pub(crate) fn merge_by_platform(pending: Vec<ChangeDescriptor>) -> Vec<ChangeDescriptor> {
    let mut merged: Vec<ChangeDescriptor> = Vec::new();
    for descriptor in pending {
        match merged.iter_mut().find(|m| m.platform == descriptor.platform) {
            Some(existing) => existing.merge(descriptor),
            None => merged.push(descriptor),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use livesync_device::test_utils::test_device;

    #[test]
    fn test_merge_by_platform() {
        let merged = merge_by_platform(vec![
            ChangeDescriptor::files(Platform::Android, vec![PathBuf::from("/a.js")], vec![]),
            ChangeDescriptor::files(Platform::Ios, vec![PathBuf::from("/i.js")], vec![]),
            ChangeDescriptor::native(Platform::Android, vec![PathBuf::from("/AndroidManifest.xml")]),
        ]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].platform, Platform::Android);
        assert!(merged[0].has_native_changes);
        assert_eq!(
            merged[0].files,
            vec![PathBuf::from("/a.js"), PathBuf::from("/AndroidManifest.xml")]
        );
        assert_eq!(merged[1].platform, Platform::Ios);
    }

    #[test]
    fn test_descriptor_from_device() {
        let device = test_device("emulator-5554", Platform::Android, true);
        let descriptor = DeviceDescriptor::new(
            &device,
            build_action(|| async { Ok(PathBuf::from("/app.apk")) }),
        )
        .with_debugging(true)
        .with_output_path("/out/app.apk");

        assert_eq!(descriptor.identifier, "emulator-5554");
        assert!(descriptor.is_emulator);
        assert!(descriptor.debugging_enabled);
        assert_eq!(descriptor.output_path, Some(PathBuf::from("/out/app.apk")));
        assert!(format!("{:?}", descriptor).contains("emulator-5554"));
    }

    #[tokio::test]
    async fn test_build_action_runs() {
        let action = build_action(|| async { Ok(PathBuf::from("/app.apk")) });
        assert_eq!(action().await.unwrap(), PathBuf::from("/app.apk"));
    }
}

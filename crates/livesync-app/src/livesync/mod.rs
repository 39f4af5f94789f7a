//! Multi-device live-sync orchestration
//!
//! [`LiveSyncService`] keeps one session per project directory. A session owns
//! the attached devices, an [`ActionChain`] that runs every workflow of the
//! project in order, and the batching timer that turns prepared changes into
//! sync batches.
//!
//! Workflows:
//! - initial sync: prepare, build and install when needed, full sync, refresh
//! - change batch: native changes rebuild and reinstall; everything else is
//!   synced file by file, with hot updates falling back to a restart

mod chain;
mod rebuild;
mod session;

pub use chain::ActionChain;
pub use rebuild::RebuiltPackages;
pub use session::{
    build_action, BuildAction, DeviceDescriptor, LiveSyncInfo, SessionStatus, StopOptions,
};

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use livesync_core::prelude::*;
use livesync_core::{ChangeDescriptor, DeviceFailure, LiveSyncEvent, Platform};
use livesync_device::{
    Device, DeviceAppData, DeviceDiscovery, DeviceEvent, DeviceExecutor, ExecutionReport,
    FileChanges, HotUpdateMonitor, HotUpdateStatus, PlatformLiveSync, SyncOutcome,
};

use crate::config::SyncSettings;
use crate::hooks::{HookArgs, HookRunner, HookStage, WATCH_HOOK};
use crate::prepare::{PrepareController, PrepareEvent, PrepareRequest};
use crate::services::{AppInstaller, NativePlatformService, ProjectData, ProjectService};
use session::{merge_by_platform, LiveSyncSession};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Collaborators of the orchestrator
#[derive(Clone)]
pub struct LiveSyncDependencies {
    pub project: Arc<dyn ProjectService>,
    pub native: Arc<dyn NativePlatformService>,
    pub installer: Arc<dyn AppInstaller>,
    pub hooks: Arc<dyn HookRunner>,
    pub discovery: Arc<dyn DeviceDiscovery>,
    pub transports: Vec<Arc<dyn PlatformLiveSync>>,
    pub hot_updates: Arc<HotUpdateMonitor>,
}

struct Inner {
    deps: LiveSyncDependencies,
    transports: HashMap<Platform, Arc<dyn PlatformLiveSync>>,
    prepare: PrepareController,
    executor: DeviceExecutor,
    settings: SyncSettings,
    sessions: Mutex<HashMap<PathBuf, Arc<LiveSyncSession>>>,
    events: broadcast::Sender<LiveSyncEvent>,
    device_lost_handler: Mutex<Option<JoinHandle<()>>>,
    connection_error_handlers: Mutex<Option<Vec<JoinHandle<()>>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let lost = self
            .device_lost_handler
            .get_mut()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = lost.take() {
            handle.abort();
        }
        let errors = self
            .connection_error_handlers
            .get_mut()
            .unwrap_or_else(|e| e.into_inner());
        for handle in errors.take().into_iter().flatten() {
            handle.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Runs live sync for any number of projects and devices
#[derive(Clone)]
pub struct LiveSyncService {
    inner: Arc<Inner>,
}

impl LiveSyncService {
    pub fn new(deps: LiveSyncDependencies, prepare: PrepareController, settings: SyncSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let transports = deps
            .transports
            .iter()
            .map(|t| (t.platform(), t.clone()))
            .collect();
        let executor = DeviceExecutor::new(deps.discovery.clone());

        Self {
            inner: Arc::new(Inner {
                deps,
                transports,
                prepare,
                executor,
                settings,
                sessions: Mutex::new(HashMap::new()),
                events,
                device_lost_handler: Mutex::new(None),
                connection_error_handlers: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveSyncEvent> {
        self.inner.events.subscribe()
    }

    /// Start (or extend) live sync of a project on the given devices.
    ///
    /// Returns after the initial sync of the newly added devices. Project
    /// configuration errors fail the call; per-device failures are reported
    /// as events and detach only that device.
    pub async fn run(&self, device_descriptors: Vec<DeviceDescriptor>, info: LiveSyncInfo) -> Result<()> {
        self.inner.run(device_descriptors, info).await
    }

    /// Detach devices (all when `device_identifiers` is `None`)
    pub async fn stop(
        &self,
        project_dir: &Path,
        device_identifiers: Option<Vec<String>>,
        options: StopOptions,
    ) -> Result<()> {
        self.inner.stop(project_dir, device_identifiers, options).await
    }

    /// Stop every session, waiting for their actions
    pub async fn stop_all(&self) -> Result<()> {
        let projects: Vec<PathBuf> = lock(&self.inner.sessions).keys().cloned().collect();
        for project_dir in projects {
            self.inner
                .stop(
                    &project_dir,
                    None,
                    StopOptions {
                        should_await_all_actions: true,
                    },
                )
                .await?;
        }
        Ok(())
    }

    /// Devices currently attached to a project
    pub fn device_descriptors(&self, project_dir: &Path) -> Vec<DeviceDescriptor> {
        self.inner
            .session(project_dir)
            .map(|s| s.state().devices.clone())
            .unwrap_or_default()
    }

    pub fn session_status(&self, project_dir: &Path) -> Option<SessionStatus> {
        self.inner.session(project_dir).map(|s| s.status())
    }

    /// Pause or resume compiler watches; returns whether they are now paused
    pub async fn toggle_file_watcher(&self) -> bool {
        self.inner.prepare.toggle_file_watcher().await
    }

    pub fn prepare_controller(&self) -> &PrepareController {
        &self.inner.prepare
    }
}

impl Inner {
    fn session(&self, project_dir: &Path) -> Option<Arc<LiveSyncSession>> {
        lock(&self.sessions).get(project_dir).cloned()
    }

    fn emit(&self, event: LiveSyncEvent) {
        trace!("LiveSync event: {}", event.event_type());
        let _ = self.events.send(event);
    }

    fn transport(&self, platform: Platform) -> Result<Arc<dyn PlatformLiveSync>> {
        self.transports
            .get(&platform)
            .cloned()
            .ok_or_else(|| Error::UnsupportedPlatform {
                platform: platform.display_name().to_string(),
            })
    }

    fn device_app_data(&self, device: &Device, project: &ProjectData) -> DeviceAppData {
        let paths = self.deps.native.platform_paths(project, device.platform);
        DeviceAppData {
            device: device.clone(),
            app_identifier: project.app_identifier.clone(),
            project_dir: project.project_dir.clone(),
            platforms_path: paths.app_root,
            app_sources_dir: paths.app_destination,
        }
    }

    async fn run(self: &Arc<Self>, descriptors: Vec<DeviceDescriptor>, info: LiveSyncInfo) -> Result<()> {
        let project = self.deps.project.project_data(&info.project_dir).await?;

        let session = lock(&self.sessions)
            .entry(info.project_dir.clone())
            .or_insert_with(|| Arc::new(LiveSyncSession::new(info.clone())))
            .clone();

        let new_devices = {
            let mut state = session.state();
            if state.is_stopped {
                info!("Resuming live sync for {:?}", info.project_dir);
                state.is_stopped = false;
                session.chain.resume();
            }
            state.info = info.clone();
            state.project = Some(project.clone());

            let mut new_devices: Vec<DeviceDescriptor> = Vec::new();
            for descriptor in descriptors {
                let known = state
                    .devices
                    .iter()
                    .chain(new_devices.iter())
                    .any(|d| d.identifier == descriptor.identifier);
                if !known {
                    new_devices.push(descriptor);
                }
            }
            for descriptor in &new_devices {
                state.platforms.insert(descriptor.platform);
                state.devices.push(descriptor.clone());
            }
            new_devices
        };

        self.ensure_prepare_listener(&session);
        self.attach_device_lost_handler();
        self.attach_connection_error_handlers();

        if new_devices.is_empty() {
            debug!("No new devices for {:?}", info.project_dir);
            return Ok(());
        }

        let this = self.clone();
        let job_session = session.clone();
        let done = session.chain.append(async move {
            this.initial_sync(&job_session, &project, new_devices, &info)
                .await;
        });
        let _ = done.await;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────
    // Initial sync
    // ─────────────────────────────────────────────────────────────────

    async fn initial_sync(
        self: &Arc<Self>,
        session: &Arc<LiveSyncSession>,
        project: &ProjectData,
        descriptors: Vec<DeviceDescriptor>,
        info: &LiveSyncInfo,
    ) {
        let rebuilt = RebuiltPackages::new();
        let by_id: HashMap<String, DeviceDescriptor> = descriptors
            .into_iter()
            .map(|d| (d.identifier.clone(), d))
            .collect();

        let report = self
            .executor
            .execute(
                |device| {
                    let descriptor = by_id.get(&device.identifier).cloned();
                    let rebuilt = &rebuilt;
                    async move {
                        let descriptor = descriptor
                            .ok_or_else(|| Error::device_not_found(device.identifier.clone()))?;
                        self.initial_sync_device(device, &descriptor, project, info, rebuilt)
                            .await
                    }
                },
                |device| by_id.contains_key(&device.identifier),
            )
            .await;

        let report = match report {
            Ok(report) => report,
            Err(e) => {
                warn!("Unable to list devices for {:?}: {}", session.project_dir, e);
                self.emit(LiveSyncEvent::Error {
                    project_dir: session.project_dir.clone(),
                    device_identifier: None,
                    message: e.to_string(),
                });
                return;
            }
        };

        let reached: HashSet<String> = report
            .results
            .iter()
            .map(|r| r.device.identifier.clone())
            .collect();
        let (_, mut failures) = report.partition();
        for identifier in by_id.keys().filter(|id| !reached.contains(*id)) {
            failures.push(DeviceFailure {
                device_identifier: identifier.clone(),
                error: Error::device_not_found(identifier.clone()),
            });
        }

        for failure in failures {
            warn!(
                "Unable to start live sync on {}: {}",
                failure.device_identifier, failure.error
            );
            self.emit(LiveSyncEvent::Error {
                project_dir: session.project_dir.clone(),
                device_identifier: Some(failure.device_identifier.clone()),
                message: failure.error.to_string(),
            });
            // Called from inside the chain; must not wait on it
            if let Err(e) = self
                .stop(
                    &session.project_dir,
                    Some(vec![failure.device_identifier]),
                    StopOptions::default(),
                )
                .await
            {
                warn!("Failed to stop device after error: {}", e);
            }
        }
    }

    async fn initial_sync_device(
        &self,
        device: Device,
        descriptor: &DeviceDescriptor,
        project: &ProjectData,
        info: &LiveSyncInfo,
        rebuilt: &RebuiltPackages,
    ) -> Result<()> {
        let platform = device.platform;
        let transport = self.transport(platform)?;

        let prepared = self
            .prepare
            .prepare(PrepareRequest {
                platform,
                project_dir: project.project_dir.clone(),
                watch: !info.skip_watcher,
                watch_native: info.watch_native,
                hot_updates: info.use_hot_updates,
                env: info.env.clone(),
            })
            .await?;

        let should_build = prepared.has_native_changes
            || info.clean
            || self
                .deps
                .installer
                .should_build(&device, project, descriptor.output_path.as_deref())
                .await?;

        if should_build {
            let build = descriptor.build_action.clone();
            let package = rebuilt
                .get_or_build(platform, device.is_emulator, || build())
                .await?;
            self.deps.installer.install(&device, project, &package).await?;
        } else {
            self.deps
                .installer
                .install_if_needed(&device, project, descriptor.output_path.as_deref())
                .await?;
        }

        let app = self.device_app_data(&device, project);
        let outcome = transport.full_sync(&app).await?;
        let force_restart = descriptor.debugging_enabled
            || prepared.has_native_changes
            || !transport.can_reload_in_place();
        transport
            .refresh_application(&app, &outcome, force_restart)
            .await?;

        self.emit_executed(project, &device, &outcome);
        self.emit(LiveSyncEvent::Started {
            project_dir: project.project_dir.clone(),
            device_identifier: device.identifier.clone(),
            application_identifier: project.app_identifier.clone(),
        });
        info!(
            "Successfully synced application {} on device {}",
            project.app_identifier,
            device.display_name()
        );
        Ok(())
    }

    fn emit_executed(&self, project: &ProjectData, device: &Device, outcome: &SyncOutcome) {
        self.emit(LiveSyncEvent::Executed {
            project_dir: project.project_dir.clone(),
            device_identifier: device.identifier.clone(),
            application_identifier: project.app_identifier.clone(),
            synced_files: outcome
                .modified_files
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
            is_full_sync: outcome.is_full_sync,
        });
    }

    // ─────────────────────────────────────────────────────────────────
    // Change batches
    // ─────────────────────────────────────────────────────────────────

    fn ensure_prepare_listener(self: &Arc<Self>, session: &Arc<LiveSyncSession>) {
        let mut state = session.state();
        if state.prepare_listener.is_some() {
            return;
        }

        let mut events = self.prepare.subscribe();
        let weak: Weak<Inner> = Arc::downgrade(self);
        let weak_session = Arc::downgrade(session);
        state.prepare_listener = Some(tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Prepare listener lagged, {} change(s) dropped", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let (Some(inner), Some(session)) = (weak.upgrade(), weak_session.upgrade()) else {
                    break;
                };
                match event {
                    PrepareEvent::Ready(ready) if ready.project_dir == session.project_dir => {
                        inner.on_prepare_ready(&session, ready.descriptor).await;
                    }
                    PrepareEvent::BuildOutput {
                        project_dir,
                        platform,
                        line,
                    } if project_dir == session.project_dir => {
                        inner.emit(LiveSyncEvent::BuildOutput {
                            project_dir,
                            platform,
                            line,
                        });
                    }
                    _ => {}
                }
            }
        }));
    }

    async fn on_prepare_ready(self: &Arc<Self>, session: &Arc<LiveSyncSession>, descriptor: ChangeDescriptor) {
        let project = {
            let state = session.state();
            if state.is_stopped || !state.platforms.contains(&descriptor.platform) {
                return;
            }
            state.project.clone()
        };
        let Some(project) = project else { return };

        if descriptor.has_native_changes {
            match self.deps.native.check_for_changes(&project, &descriptor).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("Native change in {:?} needs no rebuild", session.project_dir);
                    return;
                }
                Err(e) => warn!("Could not verify native changes, rebuilding: {}", e),
            }
        }

        self.schedule_change(session, descriptor);
    }

    /// Collect a change behind the session's batching timer
    fn schedule_change(self: &Arc<Self>, session: &Arc<LiveSyncSession>, descriptor: ChangeDescriptor) {
        let mut state = session.state();
        state.pending_changes.push(descriptor);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }

        let delay = self.settings.batch_delay();
        let weak: Weak<Inner> = Arc::downgrade(self);
        let weak_session = Arc::downgrade(session);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let (Some(inner), Some(session)) = (weak.upgrade(), weak_session.upgrade()) {
                inner.flush_pending(&session);
            }
        }));
    }

    fn flush_pending(self: &Arc<Self>, session: &Arc<LiveSyncSession>) {
        let (batches, project) = {
            let mut state = session.state();
            state.timer = None;
            let pending = std::mem::take(&mut state.pending_changes);
            if state.is_stopped {
                return;
            }
            match state.project.clone() {
                Some(project) => (merge_by_platform(pending), project),
                None => return,
            }
        };
        if batches.is_empty() {
            return;
        }

        debug!(
            "Queueing change batch for {:?} ({} platform(s))",
            session.project_dir,
            batches.len()
        );
        let this = self.clone();
        let job_session = session.clone();
        session.chain.append(async move {
            this.sync_batch(&job_session, batches, &project).await;
        });
    }

    async fn sync_batch(
        self: &Arc<Self>,
        session: &Arc<LiveSyncSession>,
        batches: Vec<ChangeDescriptor>,
        project: &ProjectData,
    ) {
        let rebuilt = RebuiltPackages::new();
        let info = session.state().info.clone();

        for change in batches {
            let descriptors: HashMap<String, DeviceDescriptor> = session
                .state()
                .devices
                .iter()
                .filter(|d| d.platform == change.platform)
                .map(|d| (d.identifier.clone(), d.clone()))
                .collect();
            if descriptors.is_empty() {
                continue;
            }

            let report = self
                .executor
                .execute(
                    |device| {
                        let descriptor = descriptors.get(&device.identifier).cloned();
                        let change = &change;
                        let info = &info;
                        let rebuilt = &rebuilt;
                        async move {
                            let descriptor = descriptor.ok_or_else(|| {
                                Error::device_not_found(device.identifier.clone())
                            })?;
                            self.sync_device_changes(device, &descriptor, change, project, info, rebuilt)
                                .await
                        }
                    },
                    |device| descriptors.contains_key(&device.identifier),
                )
                .await;

            match report.and_then(ExecutionReport::into_result) {
                Ok(synced) => {
                    debug!("Applied changes on {} device(s)", synced.len());
                }
                Err(Error::DeviceActions { failures }) => {
                    for failure in failures {
                        warn!(
                            "Unable to apply changes on device {}: {}",
                            failure.device_identifier, failure.error
                        );
                        self.emit(LiveSyncEvent::Error {
                            project_dir: session.project_dir.clone(),
                            device_identifier: Some(failure.device_identifier),
                            message: failure.error.to_string(),
                        });
                    }
                }
                Err(e) => {
                    warn!("Unable to list devices for {:?}: {}", session.project_dir, e);
                    self.emit(LiveSyncEvent::Error {
                        project_dir: session.project_dir.clone(),
                        device_identifier: None,
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    async fn sync_device_changes(
        &self,
        device: Device,
        descriptor: &DeviceDescriptor,
        change: &ChangeDescriptor,
        project: &ProjectData,
        info: &LiveSyncInfo,
        rebuilt: &RebuiltPackages,
    ) -> Result<()> {
        let platform = device.platform;
        let transport = self.transport(platform)?;
        let app = self.device_app_data(&device, project);

        if change.has_native_changes {
            let build = descriptor.build_action.clone();
            let native = self.deps.native.clone();
            let package = rebuilt
                .get_or_build(platform, device.is_emulator, || async move {
                    native.prepare_native(project, platform).await?;
                    build().await
                })
                .await?;
            self.deps.installer.install(&device, project, &package).await?;

            let outcome = transport.full_sync(&app).await?;
            transport.refresh_application(&app, &outcome, true).await?;
            self.emit_executed(project, &device, &outcome);
            return Ok(());
        }

        let hot_update = change.hot_update.as_ref().filter(|_| info.use_hot_updates);
        let changes = FileChanges {
            modified_files: change.files.clone(),
            removed_files: change.removed_files.clone(),
            hot_update: hot_update.is_some(),
        };
        let mut outcome = transport.sync_changes(&app, &changes).await?;
        let restarted = transport
            .refresh_application(&app, &outcome, descriptor.debugging_enabled)
            .await?;

        if let Some(hot_update) = hot_update.filter(|_| !restarted) {
            let status = self
                .deps
                .hot_updates
                .await_status(
                    &device.identifier,
                    &hot_update.hash,
                    self.settings.hot_update_timeout(),
                )
                .await;

            if status == Some(HotUpdateStatus::Failed) {
                warn!(
                    "Hot update {} failed on {}, restarting with full changes",
                    hot_update.hash, device.identifier
                );
                let fallback = FileChanges {
                    modified_files: hot_update.fallback_files.clone(),
                    removed_files: Vec::new(),
                    hot_update: false,
                };
                outcome = transport.sync_changes(&app, &fallback).await?;
                transport.refresh_application(&app, &outcome, true).await?;
            }
        }

        self.emit_executed(project, &device, &outcome);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────
    // Stop
    // ─────────────────────────────────────────────────────────────────

    async fn stop(
        self: &Arc<Self>,
        project_dir: &Path,
        device_identifiers: Option<Vec<String>>,
        options: StopOptions,
    ) -> Result<()> {
        let Some(session) = self.session(project_dir) else {
            debug!("No live sync session for {:?}", project_dir);
            return Ok(());
        };

        let (removed, orphaned_platforms, teardown) = {
            let mut state = session.state();
            let removed: Vec<DeviceDescriptor> = match &device_identifiers {
                Some(ids) => {
                    let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.devices)
                        .into_iter()
                        .partition(|d| ids.contains(&d.identifier));
                    state.devices = kept;
                    removed
                }
                None => std::mem::take(&mut state.devices),
            };

            let removed_platforms: HashSet<Platform> = removed.iter().map(|d| d.platform).collect();
            let orphaned: Vec<Platform> = removed_platforms
                .into_iter()
                .filter(|p| !state.devices.iter().any(|d| d.platform == *p))
                .collect();
            for platform in &orphaned {
                state.platforms.remove(platform);
            }

            let teardown = device_identifiers.is_none() || state.devices.is_empty();
            if teardown {
                if let Some(timer) = state.timer.take() {
                    timer.abort();
                }
                state.pending_changes.clear();
            }
            (removed, orphaned, teardown)
        };

        for platform in &orphaned_platforms {
            self.prepare.stop_watchers(project_dir, *platform).await;
        }

        for descriptor in &removed {
            if let Some(transport) = self.transports.get(&descriptor.platform) {
                transport.release(&descriptor.identifier).await;
            }
            self.deps.hot_updates.forget_device(&descriptor.identifier);
        }

        if teardown {
            self.prepare.stop_all_watchers(project_dir).await;
            session.chain.stop();
            if options.should_await_all_actions {
                session.chain.wait_for_tail().await;
            }
            {
                let mut state = session.state();
                state.is_stopped = true;
                state.devices.clear();
                state.platforms.clear();
            }

            let mut args = HookArgs::new(project_dir, None);
            if let Err(e) = self
                .deps
                .hooks
                .run(HookStage::After, WATCH_HOOK, &mut args)
                .await
            {
                warn!("Teardown hook failed for {:?}: {}", project_dir, e);
            }
            info!("Stopped live sync for {:?}", project_dir);
        } else if options.should_await_all_actions {
            session.chain.wait_for_current().await;
        }

        for descriptor in removed {
            self.emit(LiveSyncEvent::Stopped {
                project_dir: project_dir.to_path_buf(),
                device_identifier: descriptor.identifier,
            });
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────
    // Process-wide handlers
    // ─────────────────────────────────────────────────────────────────

    fn attach_device_lost_handler(self: &Arc<Self>) {
        let mut handler = lock(&self.device_lost_handler);
        if handler.is_some() {
            return;
        }

        let mut events = self.deps.discovery.subscribe();
        let weak: Weak<Inner> = Arc::downgrade(self);
        *handler = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(DeviceEvent::Lost(device)) => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.on_device_lost(&device).await;
                    }
                    Ok(DeviceEvent::Found(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    async fn on_device_lost(self: &Arc<Self>, device: &Device) {
        let projects: Vec<PathBuf> = lock(&self.sessions)
            .iter()
            .filter(|(_, session)| session.has_device(&device.identifier))
            .map(|(dir, _)| dir.clone())
            .collect();

        for project_dir in projects {
            info!(
                "Device {} lost, stopping live sync for {:?}",
                device.identifier, project_dir
            );
            if let Err(e) = self
                .stop(
                    &project_dir,
                    Some(vec![device.identifier.clone()]),
                    StopOptions::default(),
                )
                .await
            {
                warn!("Failed to stop lost device {}: {}", device.identifier, e);
            }
        }
    }

    fn attach_connection_error_handlers(self: &Arc<Self>) {
        let mut handlers = lock(&self.connection_error_handlers);
        if handlers.is_some() {
            return;
        }

        let mut attached = Vec::new();
        for transport in self.transports.values() {
            let Some(mut errors) = transport.connection_errors() else {
                continue;
            };
            let weak: Weak<Inner> = Arc::downgrade(self);
            attached.push(tokio::spawn(async move {
                loop {
                    match errors.recv().await {
                        Ok(event) => {
                            let Some(inner) = weak.upgrade() else { break };
                            warn!(
                                "Connection error on {}: {}",
                                event.device_identifier, event.error
                            );
                            inner.emit(LiveSyncEvent::ConnectionError {
                                device_identifier: event.device_identifier,
                                message: event.error.to_string(),
                            });
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }
        *handlers = Some(attached);
    }
}

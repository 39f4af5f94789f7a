//! Watch & prepare pipeline
//!
//! [`PrepareController::prepare`] readies a project for one platform: resource
//! folders, the native platform project, the runtime manifest and compiled app
//! sources. In watch mode it also keeps one compiler watch and one native file
//! watcher per (project, platform) running and turns their output into
//! [`PrepareReadyEvent`]s.
//!
//! Changes produced before the first prepare of a (project, platform) finished
//! are held back and replayed in order once it did.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use livesync_core::prelude::*;
use livesync_core::{ChangeDescriptor, Platform, PrepareReadyEvent, PrepareResult};

use crate::config::WatcherSettings;
use crate::hooks::{with_hooks, HookArgs, HookRunner, HookStage, PREPARE_HOOK, WATCH_HOOK, WATCH_PATTERNS_HOOK};
use crate::services::{
    CompileRequest, Compiler, CompilerEvent, DependencyResolver, NativePlatformService,
    PlatformPaths, ProjectData, ProjectService, RuntimeInfo,
};
use crate::watcher::{DebouncedWatcher, WatcherConfig};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Name of the runtime manifest written into the app destination
pub const RUNTIME_MANIFEST: &str = "package.json";

/// What to prepare and whether to keep watching afterwards
#[derive(Debug, Clone, PartialEq)]
pub struct PrepareRequest {
    pub platform: Platform,
    pub project_dir: PathBuf,
    pub watch: bool,
    pub watch_native: bool,
    pub hot_updates: bool,
    pub env: HashMap<String, String>,
}

impl PrepareRequest {
    pub fn new(project_dir: impl Into<PathBuf>, platform: Platform) -> Self {
        Self {
            platform,
            project_dir: project_dir.into(),
            watch: false,
            watch_native: true,
            hot_updates: false,
            env: HashMap::new(),
        }
    }

    pub fn watching(mut self, watch: bool) -> Self {
        self.watch = watch;
        self
    }
}

/// Published by the pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum PrepareEvent {
    Ready(PrepareReadyEvent),
    BuildOutput {
        project_dir: PathBuf,
        platform: Platform,
        line: String,
    },
}

/// Collaborators the pipeline drives
#[derive(Clone)]
pub struct PrepareServices {
    pub project: Arc<dyn ProjectService>,
    pub native: Arc<dyn NativePlatformService>,
    pub compiler: Arc<dyn Compiler>,
    pub dependencies: Arc<dyn DependencyResolver>,
    pub hooks: Arc<dyn HookRunner>,
}

/// What is running for a (project, platform)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchState {
    pub compiler_watch_active: bool,
    pub native_watcher_active: bool,
    pub native_patterns: Vec<PathBuf>,
}

type WatchKey = (PathBuf, Platform);

struct WatcherRegistration {
    native_watcher: Option<DebouncedWatcher>,
    native_task: Option<JoinHandle<()>>,
    compiler_watch_active: bool,
    compiler_events: Option<mpsc::UnboundedSender<CompilerEvent>>,
    compiler_task: Option<JoinHandle<()>>,
    /// Last request, used to resume the compiler watch after a pause
    request: PrepareRequest,
}

impl WatcherRegistration {
    fn new(request: PrepareRequest) -> Self {
        Self {
            native_watcher: None,
            native_task: None,
            compiler_watch_active: false,
            compiler_events: None,
            compiler_task: None,
            request,
        }
    }

    fn close_compiler(&mut self) -> bool {
        self.compiler_events = None;
        if let Some(task) = self.compiler_task.take() {
            task.abort();
        }
        std::mem::replace(&mut self.compiler_watch_active, false)
    }

    fn close_native(&mut self) {
        if let Some(mut watcher) = self.native_watcher.take() {
            watcher.stop();
        }
        if let Some(task) = self.native_task.take() {
            task.abort();
        }
    }
}

#[derive(Default)]
struct Readiness {
    ready: bool,
    buffered: Vec<ChangeDescriptor>,
}

struct PrepareInner {
    services: PrepareServices,
    watcher_settings: WatcherSettings,
    registrations: Mutex<HashMap<WatchKey, WatcherRegistration>>,
    key_locks: Mutex<HashMap<WatchKey, Arc<tokio::sync::Mutex<()>>>>,
    tracked_runtimes: Mutex<HashSet<Platform>>,
    ignored_paths: Mutex<Vec<PathBuf>>,
    readiness: Mutex<HashMap<WatchKey, Readiness>>,
    paused: AtomicBool,
    events: broadcast::Sender<PrepareEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Prepares projects and owns their watchers
#[derive(Clone)]
pub struct PrepareController {
    inner: Arc<PrepareInner>,
}

impl PrepareController {
    pub fn new(services: PrepareServices, watcher_settings: WatcherSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(PrepareInner {
                services,
                watcher_settings,
                registrations: Mutex::new(HashMap::new()),
                key_locks: Mutex::new(HashMap::new()),
                tracked_runtimes: Mutex::new(HashSet::new()),
                ignored_paths: Mutex::new(Vec::new()),
                readiness: Mutex::new(HashMap::new()),
                paused: AtomicBool::new(false),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PrepareEvent> {
        self.inner.events.subscribe()
    }

    /// Prepare the project for a platform inside the `prepare` hooks
    pub async fn prepare(&self, request: PrepareRequest) -> Result<PrepareResult> {
        let key = (request.project_dir.clone(), request.platform);
        let args = HookArgs::new(&request.project_dir, Some(request.platform));

        let result = with_hooks(
            self.inner.services.hooks.as_ref(),
            PREPARE_HOOK,
            args,
            || self.inner.prepare_core(&request),
        )
        .await?;

        self.inner.mark_ready(&key);
        Ok(result)
    }

    /// Pause or resume every compiler watch; returns whether watchers are now
    /// paused. Native watchers keep running.
    pub async fn toggle_file_watcher(&self) -> bool {
        let paused = !self.inner.paused.fetch_xor(true, Ordering::SeqCst);
        let keys: Vec<WatchKey> = lock(&self.inner.registrations).keys().cloned().collect();

        for key in keys {
            let key_lock = self.inner.key_lock(&key);
            let _guard = key_lock.lock().await;

            if paused {
                let was_active = lock(&self.inner.registrations)
                    .get_mut(&key)
                    .map(|r| r.close_compiler())
                    .unwrap_or(false);
                if was_active {
                    if let Err(e) = self.inner.services.compiler.stop_watch(&key.0, key.1).await {
                        warn!("Failed to pause compiler watch for {:?}: {}", key.0, e);
                    }
                }
            } else {
                let request = lock(&self.inner.registrations)
                    .get(&key)
                    .filter(|r| !r.compiler_watch_active)
                    .map(|r| r.request.clone());
                if let Some(request) = request {
                    if let Err(e) = self.inner.resume_compiler_watch(&key, &request).await {
                        warn!("Failed to resume compiler watch for {:?}: {}", key.0, e);
                    }
                }
            }
        }

        info!(
            "File watchers {}",
            if paused { "paused" } else { "resumed" }
        );
        paused
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Stop and forget the watchers of one (project, platform)
    pub async fn stop_watchers(&self, project_dir: &Path, platform: Platform) {
        let key = (project_dir.to_path_buf(), platform);
        let key_lock = self.inner.key_lock(&key);
        let _guard = key_lock.lock().await;

        let registration = lock(&self.inner.registrations).remove(&key);
        lock(&self.inner.readiness).remove(&key);
        lock(&self.inner.ignored_paths).retain(|path| self.inner.is_watched(path));

        if let Some(mut registration) = registration {
            registration.close_native();
            if registration.close_compiler() {
                if let Err(e) = self.inner.services.compiler.stop_watch(project_dir, platform).await {
                    warn!("Failed to stop compiler watch for {:?}: {}", project_dir, e);
                }
            }
            debug!(
                "Stopped watchers for {:?} ({})",
                project_dir,
                platform.display_name()
            );
        }
    }

    /// Stop every watcher of a project
    pub async fn stop_all_watchers(&self, project_dir: &Path) {
        let platforms: Vec<Platform> = lock(&self.inner.registrations)
            .keys()
            .filter(|(dir, _)| dir == project_dir)
            .map(|(_, platform)| *platform)
            .collect();

        for platform in platforms {
            self.stop_watchers(project_dir, platform).await;
        }
        lock(&self.inner.readiness).retain(|(dir, _), _| dir != project_dir);
    }

    pub fn watch_state(&self, project_dir: &Path, platform: Platform) -> Option<WatchState> {
        lock(&self.inner.registrations)
            .get(&(project_dir.to_path_buf(), platform))
            .map(|r| WatchState {
                compiler_watch_active: r.compiler_watch_active,
                native_watcher_active: r.native_watcher.is_some(),
                native_patterns: r
                    .native_watcher
                    .as_ref()
                    .map(|w| w.patterns().to_vec())
                    .unwrap_or_default(),
            })
    }

    /// Publish a change for a project, held back until its platform is ready
    pub(crate) fn emit_change(&self, project_dir: &Path, descriptor: ChangeDescriptor) {
        let key = (project_dir.to_path_buf(), descriptor.platform);
        self.inner.emit_change(&key, descriptor);
    }
}

impl PrepareInner {
    fn key_lock(&self, key: &WatchKey) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.key_locks).entry(key.clone()).or_default().clone()
    }

    async fn prepare_core(self: &Arc<Self>, request: &PrepareRequest) -> Result<PrepareResult> {
        let platform = request.platform;
        let native = &self.services.native;

        let project = self.services.project.project_data(&request.project_dir).await?;
        native.ensure_resource_directories(&project).await?;
        native.ensure_platform_added(&project, platform).await?;

        let runtime = native.runtime_info(&project, platform).await?;
        self.track_runtime_version(platform, &runtime);

        let paths = native.platform_paths(&project, platform);
        self.write_runtime_manifest(&project, &paths, &runtime)?;

        let has_native_changes = if request.watch {
            self.start_watchers_with_prepare(&project, &paths, request).await?
        } else {
            self.services
                .compiler
                .compile(&compile_request(&project, &paths, request))
                .await?;
            native.prepare_native(&project, platform).await?
        };

        Ok(PrepareResult {
            platform,
            has_native_changes,
        })
    }

    fn track_runtime_version(&self, platform: Platform, runtime: &RuntimeInfo) {
        if lock(&self.tracked_runtimes).insert(platform) {
            info!(
                "Using {} runtime {} {}",
                platform.display_name(),
                runtime.name,
                runtime.version
            );
        }
    }

    /// Project configuration plus the installed runtime, in the app destination
    fn write_runtime_manifest(
        &self,
        project: &ProjectData,
        paths: &PlatformPaths,
        runtime: &RuntimeInfo,
    ) -> Result<()> {
        let mut manifest = match &project.configuration {
            serde_json::Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        manifest.insert(
            "runtime".to_string(),
            serde_json::json!({ "name": runtime.name, "version": runtime.version }),
        );

        std::fs::create_dir_all(&paths.app_destination)?;
        let path = paths.app_destination.join(RUNTIME_MANIFEST);
        if self.is_watched(&path) {
            self.ignore_path(path.clone());
        }
        std::fs::write(&path, serde_json::to_vec_pretty(&manifest)?)?;
        Ok(())
    }

    /// Whether a running native watcher reports changes to `path`
    fn is_watched(&self, path: &Path) -> bool {
        lock(&self.registrations)
            .values()
            .filter_map(|r| r.native_watcher.as_ref())
            .any(|w| w.patterns().iter().any(|pattern| path.starts_with(pattern)))
    }

    fn ignore_path(&self, path: PathBuf) {
        let mut ignored = lock(&self.ignored_paths);
        if !ignored.contains(&path) {
            ignored.push(path);
        }
    }

    /// Drop self-inflicted paths, consuming their ignore entries
    fn filter_ignored(&self, paths: Vec<PathBuf>) -> Vec<PathBuf> {
        let mut ignored = lock(&self.ignored_paths);
        paths
            .into_iter()
            .filter(|path| match ignored.iter().position(|p| p == path) {
                Some(index) => {
                    ignored.remove(index);
                    false
                }
                None => true,
            })
            .collect()
    }

    async fn start_watchers_with_prepare(
        self: &Arc<Self>,
        project: &ProjectData,
        paths: &PlatformPaths,
        request: &PrepareRequest,
    ) -> Result<bool> {
        let key = (request.project_dir.clone(), request.platform);
        let key_lock = self.key_lock(&key);
        let _guard = key_lock.lock().await;

        let (compiler_active, native_active) = {
            let mut registrations = lock(&self.registrations);
            let registration = registrations
                .entry(key.clone())
                .or_insert_with(|| WatcherRegistration::new(request.clone()));
            registration.request = request.clone();
            (
                registration.compiler_watch_active,
                registration.native_watcher.is_some(),
            )
        };

        if !compiler_active && !self.paused.load(Ordering::SeqCst) {
            self.start_compiler_watch(&key, project, paths, request).await?;
        }

        let mut has_native_changes = false;
        if !native_active {
            has_native_changes = self
                .services
                .native
                .prepare_native(project, request.platform)
                .await?;
            if request.watch_native {
                self.start_native_watcher(&key, project, paths).await?;
            }
        }

        Ok(has_native_changes)
    }

    async fn resume_compiler_watch(self: &Arc<Self>, key: &WatchKey, request: &PrepareRequest) -> Result<()> {
        let project = self.services.project.project_data(&key.0).await?;
        let paths = self.services.native.platform_paths(&project, key.1);
        self.start_compiler_watch(key, &project, &paths, request).await
    }

    async fn start_compiler_watch(
        self: &Arc<Self>,
        key: &WatchKey,
        project: &ProjectData,
        paths: &PlatformPaths,
        request: &PrepareRequest,
    ) -> Result<()> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let weak: Weak<PrepareInner> = Arc::downgrade(self);
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.handle_compiler_event(&task_key, event);
            }
        });

        let compile = compile_request(project, paths, request);
        let args = HookArgs::new(&key.0, Some(key.1));
        let started = with_hooks(self.services.hooks.as_ref(), WATCH_HOOK, args, || {
            self.services.compiler.start_watch(&compile, events_tx.clone())
        })
        .await;

        if let Err(e) = started {
            task.abort();
            return Err(e);
        }

        let mut registrations = lock(&self.registrations);
        match registrations.get_mut(key) {
            Some(registration) => {
                registration.compiler_watch_active = true;
                registration.compiler_events = Some(events_tx);
                registration.compiler_task = Some(task);
            }
            None => task.abort(),
        }
        debug!("Compiler watch started for {:?} ({})", key.0, key.1.display_name());
        Ok(())
    }

    async fn start_native_watcher(
        self: &Arc<Self>,
        key: &WatchKey,
        project: &ProjectData,
        paths: &PlatformPaths,
    ) -> Result<()> {
        let platform = key.1;
        let mut patterns = vec![project.manifest_path.clone()];
        patterns.extend(paths.config_files.iter().cloned());
        patterns.push(project.platform_resources_directory(platform));

        let dependencies = self
            .services
            .dependencies
            .production_dependencies(&project.project_dir)
            .await?;
        for dependency in dependencies {
            patterns.push(dependency.directory.join("platforms").join(platform.as_str()));
            patterns.push(dependency.directory.join("package.json"));
        }

        let mut args = HookArgs::new(&project.project_dir, Some(platform));
        args.patterns = patterns;
        self.services
            .hooks
            .run(HookStage::Before, WATCH_PATTERNS_HOOK, &mut args)
            .await?;

        let mut watcher =
            DebouncedWatcher::new(WatcherConfig::from_settings(args.patterns, &self.watcher_settings));
        let mut changes = watcher.start().await?;

        let weak: Weak<PrepareInner> = Arc::downgrade(self);
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            while let Some(paths) = changes.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.handle_native_change(&task_key, paths);
            }
        });

        let mut registrations = lock(&self.registrations);
        match registrations.get_mut(key) {
            Some(registration) => {
                registration.native_watcher = Some(watcher);
                registration.native_task = Some(task);
            }
            None => {
                watcher.stop();
                task.abort();
            }
        }
        Ok(())
    }

    fn handle_compiler_event(&self, key: &WatchKey, event: CompilerEvent) {
        match event {
            CompilerEvent::Output(line) => {
                let _ = self.events.send(PrepareEvent::BuildOutput {
                    project_dir: key.0.clone(),
                    platform: key.1,
                    line,
                });
            }
            emitted => {
                let Some(mut descriptor) = emitted.into_descriptor(key.1) else {
                    return;
                };
                descriptor.files = self.filter_ignored(descriptor.files);
                if descriptor.is_empty() && !descriptor.is_hot_update() {
                    return;
                }
                self.emit_change(key, descriptor);
            }
        }
    }

    fn handle_native_change(&self, key: &WatchKey, paths: Vec<PathBuf>) {
        let paths = self.filter_ignored(paths);
        if paths.is_empty() {
            return;
        }
        debug!("Native change in {:?}: {} file(s)", key.0, paths.len());
        self.emit_change(key, ChangeDescriptor::native(key.1, paths));
    }

    fn emit_change(&self, key: &WatchKey, descriptor: ChangeDescriptor) {
        // Published under the lock so replayed changes stay ahead of new ones
        let mut readiness = lock(&self.readiness);
        let entry = readiness.entry(key.clone()).or_default();
        if !entry.ready {
            entry.buffered.push(descriptor);
            return;
        }
        self.publish(key, descriptor);
    }

    fn mark_ready(&self, key: &WatchKey) {
        let mut readiness = lock(&self.readiness);
        let entry = readiness.entry(key.clone()).or_default();
        if entry.ready {
            return;
        }
        entry.ready = true;
        for descriptor in std::mem::take(&mut entry.buffered) {
            self.publish(key, descriptor);
        }
    }

    fn publish(&self, key: &WatchKey, descriptor: ChangeDescriptor) {
        let _ = self.events.send(PrepareEvent::Ready(PrepareReadyEvent {
            project_dir: key.0.clone(),
            descriptor,
        }));
    }
}

fn compile_request(project: &ProjectData, paths: &PlatformPaths, request: &PrepareRequest) -> CompileRequest {
    CompileRequest {
        project: project.clone(),
        platform: request.platform,
        app_destination: paths.app_destination.clone(),
        hot_updates: request.hot_updates,
        env: request.env.clone(),
    }
}

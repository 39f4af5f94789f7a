//! In-memory collaborators for pipeline and orchestrator tests

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use livesync_core::prelude::*;
use livesync_core::{ChangeDescriptor, Platform};
use livesync_device::Device;

use crate::hooks::{HookArgs, HookRunner, HookStage, WATCH_PATTERNS_HOOK};
use crate::livesync::{build_action, BuildAction};
use crate::services::{
    AppInstaller, CompileRequest, Compiler, CompilerEvent, Dependency, DependencyResolver,
    NativePlatformService, PlatformPaths, ProjectData, ProjectService, RuntimeInfo,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub const TEST_APP_IDENTIFIER: &str = "org.example.app";

/// Standard project layout rooted at `project_dir`
pub fn test_project(project_dir: &Path) -> ProjectData {
    ProjectData {
        project_dir: project_dir.to_path_buf(),
        app_identifier: TEST_APP_IDENTIFIER.to_string(),
        manifest_path: project_dir.join("package.json"),
        app_directory: project_dir.join("app"),
        app_resources_directory: project_dir.join("App_Resources"),
        platforms_directory: project_dir.join("platforms"),
        configuration: serde_json::json!({ "main": "app.js" }),
    }
}

#[derive(Default)]
pub struct FakeProjectService {
    failing: AtomicBool,
}

impl FakeProjectService {
    /// Make `project_data` fail as if the configuration were broken
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProjectService for FakeProjectService {
    async fn project_data(&self, project_dir: &Path) -> Result<ProjectData> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::ConfigInvalid {
                message: "package.json has no application identifier".into(),
            });
        }
        Ok(test_project(project_dir))
    }
}

/// Native platform service writing nothing but directories
#[derive(Default)]
pub struct FakeNativePlatform {
    has_native_changes: AtomicBool,
    skip_rebuild: AtomicBool,
    prepare_native_calls: AtomicUsize,
    check_calls: AtomicUsize,
}

impl FakeNativePlatform {
    pub fn set_has_native_changes(&self, value: bool) {
        self.has_native_changes.store(value, Ordering::SeqCst);
    }

    /// Make `check_for_changes` report that no rebuild is needed
    pub fn set_skip_rebuild(&self, value: bool) {
        self.skip_rebuild.store(value, Ordering::SeqCst);
    }

    pub fn prepare_native_count(&self) -> usize {
        self.prepare_native_calls.load(Ordering::SeqCst)
    }

    pub fn check_count(&self) -> usize {
        self.check_calls.load(Ordering::SeqCst)
    }

    pub fn paths_for(&self, project_dir: &Path, platform: Platform) -> PlatformPaths {
        let root = project_dir.join("platforms").join(platform.as_str());
        let app_root = root.join("assets");
        PlatformPaths {
            app_destination: app_root.join("app"),
            config_files: vec![root.join("build.gradle")],
            project_root: root,
            app_root,
        }
    }
}

#[async_trait]
impl NativePlatformService for FakeNativePlatform {
    async fn ensure_resource_directories(&self, project: &ProjectData) -> Result<()> {
        std::fs::create_dir_all(&project.app_resources_directory)?;
        Ok(())
    }

    async fn ensure_platform_added(&self, project: &ProjectData, platform: Platform) -> Result<()> {
        std::fs::create_dir_all(project.platforms_directory.join(platform.as_str()))?;
        Ok(())
    }

    async fn runtime_info(&self, _project: &ProjectData, platform: Platform) -> Result<RuntimeInfo> {
        Ok(RuntimeInfo {
            name: format!("{}-runtime", platform.as_str()),
            version: "6.5.0".into(),
        })
    }

    async fn prepare_native(&self, _project: &ProjectData, _platform: Platform) -> Result<bool> {
        self.prepare_native_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.has_native_changes.load(Ordering::SeqCst))
    }

    async fn check_for_changes(
        &self,
        _project: &ProjectData,
        _descriptor: &ChangeDescriptor,
    ) -> Result<bool> {
        self.check_calls.fetch_add(1, Ordering::SeqCst);
        Ok(!self.skip_rebuild.load(Ordering::SeqCst))
    }

    fn platform_paths(&self, project: &ProjectData, platform: Platform) -> PlatformPaths {
        self.paths_for(&project.project_dir, platform)
    }
}

type WatchKey = (PathBuf, Platform);

/// Compiler whose watch output is driven by the test
#[derive(Default)]
pub struct FakeCompiler {
    initial_delay: Duration,
    initial_events: Mutex<Vec<CompilerEvent>>,
    watchers: Mutex<HashMap<WatchKey, mpsc::UnboundedSender<CompilerEvent>>>,
    compile_calls: AtomicUsize,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
}

impl FakeCompiler {
    /// Initial compilation of a watch takes `delay`
    pub fn with_initial_delay(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            ..Default::default()
        }
    }

    /// Event sent during the initial compilation of the next watch
    pub fn queue_initial_event(&self, event: CompilerEvent) {
        lock(&self.initial_events).push(event);
    }

    /// Send an event from a running watch; false when none is running
    pub fn emit(&self, project_dir: &Path, platform: Platform, event: CompilerEvent) -> bool {
        lock(&self.watchers)
            .get(&(project_dir.to_path_buf(), platform))
            .map(|tx| tx.send(event).is_ok())
            .unwrap_or(false)
    }

    pub fn compile_count(&self) -> usize {
        self.compile_calls.load(Ordering::SeqCst)
    }

    pub fn start_count(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Compiler for FakeCompiler {
    async fn compile(&self, _request: &CompileRequest) -> Result<()> {
        self.compile_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start_watch(
        &self,
        request: &CompileRequest,
        events: mpsc::UnboundedSender<CompilerEvent>,
    ) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if !self.initial_delay.is_zero() {
            tokio::time::sleep(self.initial_delay).await;
        }
        for event in lock(&self.initial_events).drain(..) {
            let _ = events.send(event);
        }
        lock(&self.watchers).insert(
            (request.project.project_dir.clone(), request.platform),
            events,
        );
        Ok(())
    }

    async fn stop_watch(&self, project_dir: &Path, platform: Platform) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.watchers).remove(&(project_dir.to_path_buf(), platform));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeDependencies {
    pub dependencies: Vec<Dependency>,
}

#[async_trait]
impl DependencyResolver for FakeDependencies {
    async fn production_dependencies(&self, _project_dir: &Path) -> Result<Vec<Dependency>> {
        Ok(self.dependencies.clone())
    }
}

/// Records hook invocations; the `watchPatterns` hook appends extra patterns
#[derive(Default)]
pub struct RecordingHooks {
    calls: Mutex<Vec<(HookStage, String)>>,
    extra_patterns: Vec<PathBuf>,
}

impl RecordingHooks {
    pub fn with_extra_patterns(extra_patterns: Vec<PathBuf>) -> Self {
        Self {
            extra_patterns,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<(HookStage, String)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl HookRunner for RecordingHooks {
    async fn run(&self, stage: HookStage, name: &str, args: &mut HookArgs) -> Result<()> {
        lock(&self.calls).push((stage, name.to_string()));
        if name == WATCH_PATTERNS_HOOK {
            args.patterns.extend(self.extra_patterns.iter().cloned());
        }
        Ok(())
    }
}

/// Installer that records what it installed
#[derive(Default)]
pub struct FakeInstaller {
    should_build: AtomicBool,
    installs: Mutex<Vec<(String, PathBuf)>>,
    install_if_needed_calls: Mutex<Vec<String>>,
}

impl FakeInstaller {
    pub fn set_should_build(&self, value: bool) {
        self.should_build.store(value, Ordering::SeqCst);
    }

    /// (device, package) pairs passed to `install`
    pub fn installs(&self) -> Vec<(String, PathBuf)> {
        lock(&self.installs).clone()
    }

    pub fn install_if_needed_calls(&self) -> Vec<String> {
        lock(&self.install_if_needed_calls).clone()
    }
}

#[async_trait]
impl AppInstaller for FakeInstaller {
    async fn should_build(
        &self,
        _device: &Device,
        _project: &ProjectData,
        _output_path: Option<&Path>,
    ) -> Result<bool> {
        Ok(self.should_build.load(Ordering::SeqCst))
    }

    async fn install_if_needed(
        &self,
        device: &Device,
        _project: &ProjectData,
        _package: Option<&Path>,
    ) -> Result<bool> {
        lock(&self.install_if_needed_calls).push(device.identifier.clone());
        Ok(false)
    }

    async fn install(&self, device: &Device, _project: &ProjectData, package: &Path) -> Result<()> {
        lock(&self.installs).push((device.identifier.clone(), package.to_path_buf()));
        Ok(())
    }
}

/// Build action counting its runs; takes `delay` and produces `package`
pub fn counting_build(counter: Arc<AtomicUsize>, package: PathBuf, delay: Duration) -> BuildAction {
    build_action(move || {
        let counter = counter.clone();
        let package = package.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            Ok(package)
        }
    })
}

/// Build action that always fails
pub fn failing_build(counter: Arc<AtomicUsize>) -> BuildAction {
    build_action(move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Error::build("gradle exited with code 1"))
        }
    })
}

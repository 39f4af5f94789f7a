//! Collaborator interfaces used by the prepare pipeline and the orchestrator
//!
//! Everything that touches the native toolchain, the bundler or the project
//! configuration lives behind these traits. The binary wires in command-line
//! implementations; tests use in-memory fakes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use livesync_core::prelude::*;
use livesync_core::{ChangeDescriptor, HotUpdate, Platform};
use livesync_device::Device;

/// Loaded project configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectData {
    pub project_dir: PathBuf,
    /// Application identifier, e.g. `org.example.app`
    pub app_identifier: String,
    /// Root manifest (`package.json`)
    pub manifest_path: PathBuf,
    /// App sources before compilation
    pub app_directory: PathBuf,
    /// Per-platform resources, `App_Resources/<Platform>`
    pub app_resources_directory: PathBuf,
    /// Native platform projects live under here
    pub platforms_directory: PathBuf,
    /// Project configuration object written into the runtime manifest
    pub configuration: serde_json::Value,
}

impl ProjectData {
    pub fn platform_resources_directory(&self, platform: Platform) -> PathBuf {
        self.app_resources_directory.join(platform.display_name())
    }
}

/// Where a platform's native project and prepared app live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformPaths {
    /// Native platform project root
    pub project_root: PathBuf,
    /// Directory device-side paths are relative to
    pub app_root: PathBuf,
    /// Compiled app sources, inside `app_root`
    pub app_destination: PathBuf,
    /// Native configuration files whose changes need a rebuild
    pub config_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub name: String,
    pub directory: PathBuf,
}

/// Input to one compilation, one-shot or watched
#[derive(Debug, Clone, PartialEq)]
pub struct CompileRequest {
    pub project: ProjectData,
    pub platform: Platform,
    pub app_destination: PathBuf,
    pub hot_updates: bool,
    pub env: HashMap<String, String>,
}

/// Emitted by a compiler watch
#[derive(Debug, Clone, PartialEq)]
pub enum CompilerEvent {
    /// A rebuild finished
    Emitted {
        files: Vec<PathBuf>,
        removed_files: Vec<PathBuf>,
        hot_update: Option<HotUpdate>,
    },
    /// A line of compiler output
    Output(String),
}

impl CompilerEvent {
    pub fn into_descriptor(self, platform: Platform) -> Option<ChangeDescriptor> {
        match self {
            CompilerEvent::Emitted {
                files,
                removed_files,
                hot_update,
            } => {
                let mut descriptor = ChangeDescriptor::files(platform, files, removed_files);
                descriptor.hot_update = hot_update;
                Some(descriptor)
            }
            CompilerEvent::Output(_) => None,
        }
    }
}

/// Bundles app sources into the platform's app destination
#[async_trait]
pub trait Compiler: Send + Sync {
    async fn compile(&self, request: &CompileRequest) -> Result<()>;

    /// Start watching; returns once the initial compilation finished and keeps
    /// sending events until [`Compiler::stop_watch`]
    async fn start_watch(
        &self,
        request: &CompileRequest,
        events: mpsc::UnboundedSender<CompilerEvent>,
    ) -> Result<()>;

    async fn stop_watch(&self, project_dir: &Path, platform: Platform) -> Result<()>;
}

/// Native platform project management
#[async_trait]
pub trait NativePlatformService: Send + Sync {
    async fn ensure_resource_directories(&self, project: &ProjectData) -> Result<()>;

    async fn ensure_platform_added(&self, project: &ProjectData, platform: Platform) -> Result<()>;

    /// Installed runtime for the platform
    async fn runtime_info(&self, project: &ProjectData, platform: Platform) -> Result<RuntimeInfo>;

    /// Prepare the native project; returns whether it changed
    async fn prepare_native(&self, project: &ProjectData, platform: Platform) -> Result<bool>;

    /// Whether a native change really needs a rebuild
    async fn check_for_changes(
        &self,
        project: &ProjectData,
        descriptor: &ChangeDescriptor,
    ) -> Result<bool>;

    fn platform_paths(&self, project: &ProjectData, platform: Platform) -> PlatformPaths;
}

#[async_trait]
pub trait DependencyResolver: Send + Sync {
    async fn production_dependencies(&self, project_dir: &Path) -> Result<Vec<Dependency>>;
}

#[async_trait]
pub trait ProjectService: Send + Sync {
    async fn project_data(&self, project_dir: &Path) -> Result<ProjectData>;
}

/// Installs built packages onto devices
#[async_trait]
pub trait AppInstaller: Send + Sync {
    /// Whether there is no usable build for the device
    async fn should_build(
        &self,
        device: &Device,
        project: &ProjectData,
        output_path: Option<&Path>,
    ) -> Result<bool>;

    /// Install when the app is missing or outdated; returns whether it installed
    async fn install_if_needed(
        &self,
        device: &Device,
        project: &ProjectData,
        package: Option<&Path>,
    ) -> Result<bool>;

    async fn install(&self, device: &Device, project: &ProjectData, package: &Path) -> Result<()>;
}

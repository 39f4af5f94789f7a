//! Android native project handling and the command-line build
//!
//! The native project lives in `platforms/android`. Changes to native inputs
//! (resources, the manifest, Gradle files) are detected by fingerprinting them
//! against the state recorded by the last prepare in `.livesync/`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use livesync_app::config::{AndroidSettings, CompilerSettings};
use livesync_app::{build_action, BuildAction, NativePlatformService, PlatformPaths, ProjectData, RuntimeInfo};
use livesync_core::prelude::*;
use livesync_core::{ChangeDescriptor, Platform};

use super::fs;

const STATE_DIR: &str = ".livesync";
const RUNTIME_FILE: &str = "runtime.json";
/// Lines of build stderr kept in a build error
const BUILD_ERROR_TAIL: usize = 20;

pub fn android_project_root(project: &ProjectData) -> PathBuf {
    project
        .platforms_directory
        .join(Platform::Android.as_str())
}

/// APK the configured build command produces
pub fn default_package_path(project: &ProjectData, settings: &AndroidSettings) -> PathBuf {
    android_project_root(project).join(&settings.package_path)
}

fn unsupported(platform: Platform) -> Error {
    Error::UnsupportedPlatform {
        platform: platform.display_name().to_string(),
    }
}

pub struct AndroidNativePlatform {
    android: AndroidSettings,
    compiler: CompilerSettings,
}

impl AndroidNativePlatform {
    pub fn new(android: AndroidSettings, compiler: CompilerSettings) -> Self {
        Self { android, compiler }
    }

    fn native_inputs(&self, project: &ProjectData) -> Vec<PathBuf> {
        let paths = self.platform_paths(project, Platform::Android);
        let mut inputs = vec![
            project.manifest_path.clone(),
            project.platform_resources_directory(Platform::Android),
        ];
        inputs.extend(paths.config_files);
        inputs
    }

    fn state_file(project: &ProjectData) -> PathBuf {
        project
            .project_dir
            .join(STATE_DIR)
            .join(format!("native-{}.md5", Platform::Android.as_str()))
    }

    fn recorded_fingerprint(project: &ProjectData) -> Option<String> {
        std::fs::read_to_string(Self::state_file(project))
            .ok()
            .map(|s| s.trim().to_string())
    }

    /// Build action running the configured command in the native project
    pub fn build_action(&self, project: &ProjectData) -> BuildAction {
        let command = self.android.build_command.clone();
        let project_root = android_project_root(project);
        let package = default_package_path(project, &self.android);

        build_action(move || {
            let command = command.clone();
            let project_root = project_root.clone();
            let package = package.clone();
            async move {
                run_build_command(&command, &project_root).await?;
                if !package.is_file() {
                    return Err(Error::build(format!(
                        "`{}` did not produce {}",
                        command,
                        package.display()
                    )));
                }
                Ok(package)
            }
        })
    }
}

#[async_trait]
impl NativePlatformService for AndroidNativePlatform {
    async fn ensure_resource_directories(&self, project: &ProjectData) -> Result<()> {
        std::fs::create_dir_all(project.platform_resources_directory(Platform::Android))?;
        Ok(())
    }

    async fn ensure_platform_added(&self, project: &ProjectData, platform: Platform) -> Result<()> {
        if platform != Platform::Android {
            return Err(unsupported(platform));
        }
        let root = android_project_root(project);
        if !root.is_dir() {
            return Err(Error::ConfigInvalid {
                message: format!("No Android project found at {}", root.display()),
            });
        }
        Ok(())
    }

    async fn runtime_info(&self, project: &ProjectData, platform: Platform) -> Result<RuntimeInfo> {
        if platform != Platform::Android {
            return Err(unsupported(platform));
        }
        let path = android_project_root(project).join(RUNTIME_FILE);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(_) => {
                debug!("No {} in the Android project", RUNTIME_FILE);
                Ok(RuntimeInfo {
                    name: "android-runtime".to_string(),
                    version: "unknown".to_string(),
                })
            }
        }
    }

    async fn prepare_native(&self, project: &ProjectData, platform: Platform) -> Result<bool> {
        if platform != Platform::Android {
            return Err(unsupported(platform));
        }
        let current = fs::fingerprint(&self.native_inputs(project))?;
        let changed = Self::recorded_fingerprint(project).as_deref() != Some(current.as_str());

        if changed {
            let state_file = Self::state_file(project);
            if let Some(parent) = state_file.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&state_file, &current)?;
            debug!("Native inputs changed for {:?}", project.project_dir);
        }
        Ok(changed)
    }

    async fn check_for_changes(
        &self,
        project: &ProjectData,
        descriptor: &ChangeDescriptor,
    ) -> Result<bool> {
        let inputs = self.native_inputs(project);
        // Anything outside the fingerprinted inputs (e.g. plugin sources) always rebuilds
        let untracked = descriptor
            .files
            .iter()
            .any(|file| !inputs.iter().any(|input| file.starts_with(input)));
        if untracked {
            return Ok(true);
        }

        let current = fs::fingerprint(&inputs)?;
        Ok(Self::recorded_fingerprint(project).as_deref() != Some(current.as_str()))
    }

    fn platform_paths(&self, project: &ProjectData, platform: Platform) -> PlatformPaths {
        let project_root = project.platforms_directory.join(platform.as_str());
        let app_root = project_root.join("app/src/main/assets");
        let app_destination = match &self.compiler.output_directory {
            Some(dir) => project.project_dir.join(dir),
            None => app_root.join("app"),
        };
        PlatformPaths {
            config_files: vec![
                project_root.join("build.gradle"),
                project_root.join("app/build.gradle"),
            ],
            project_root,
            app_root,
            app_destination,
        }
    }
}

async fn run_build_command(command: &str, cwd: &Path) -> Result<()> {
    let (shell, flag) = if cfg!(windows) { ("cmd", "/C") } else { ("sh", "-c") };
    info!("Building: {} (in {})", command, cwd.display());

    let output = Command::new(shell)
        .arg(flag)
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| Error::ProcessSpawn {
            reason: format!("{}: {}", command, e),
        })?;

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        trace!("[build] {}", line);
    }

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let lines: Vec<&str> = stderr.lines().collect();
        let tail = lines[lines.len().saturating_sub(BUILD_ERROR_TAIL)..].join("\n");
        return Err(Error::build(format!(
            "`{}` exited with code {:?}\n{}",
            command,
            output.status.code(),
            tail
        )));
    }
    Ok(())
}

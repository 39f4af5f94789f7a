//! APK installation through adb
//!
//! Installs are skipped when the device already runs the package that was last
//! installed on it. The per-device package hashes are kept in
//! `.livesync/installs.json`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use livesync_app::config::AndroidSettings;
use livesync_app::{AppInstaller, ProjectData};
use livesync_core::prelude::*;
use livesync_core::Platform;
use livesync_device::{Adb, Device};

use super::fs;
use super::native::default_package_path;

const INSTALLS_FILE: &str = "installs.json";

pub struct AdbInstaller {
    adb: Arc<Adb>,
    android: AndroidSettings,
}

impl AdbInstaller {
    pub fn new(adb: Arc<Adb>, android: AndroidSettings) -> Self {
        Self { adb, android }
    }

    fn package_for(&self, project: &ProjectData, package: Option<&Path>) -> PathBuf {
        package
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_package_path(project, &self.android))
    }

    /// Install, then confirm the app identifier is what the package registered
    async fn install_package(
        &self,
        device: &Device,
        project: &ProjectData,
        package: &Path,
    ) -> Result<()> {
        self.adb.install(&device.identifier, package).await?;
        let installed = self
            .adb
            .is_installed(&device.identifier, &project.app_identifier)
            .await?;
        if !installed {
            return Err(Error::AppNotInstalled {
                app_identifier: project.app_identifier.clone(),
                device_identifier: device.identifier.clone(),
            });
        }
        Ok(())
    }

    fn ensure_android(device: &Device) -> Result<()> {
        if device.platform != Platform::Android {
            return Err(Error::UnsupportedPlatform {
                platform: device.platform.display_name().to_string(),
            });
        }
        Ok(())
    }
}

fn installs_path(project: &ProjectData) -> PathBuf {
    project.project_dir.join(".livesync").join(INSTALLS_FILE)
}

fn read_installs(project: &ProjectData) -> BTreeMap<String, String> {
    std::fs::read_to_string(installs_path(project))
        .ok()
        .and_then(|content| serde_json::from_str(&content).ok())
        .unwrap_or_default()
}

fn record_install(project: &ProjectData, device_identifier: &str, hash: String) -> Result<()> {
    let path = installs_path(project);
    let mut installs = read_installs(project);
    installs.insert(device_identifier.to_string(), hash);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, serde_json::to_string_pretty(&installs)?)?;
    Ok(())
}

#[async_trait]
impl AppInstaller for AdbInstaller {
    async fn should_build(
        &self,
        _device: &Device,
        project: &ProjectData,
        output_path: Option<&Path>,
    ) -> Result<bool> {
        Ok(!self.package_for(project, output_path).is_file())
    }

    async fn install_if_needed(
        &self,
        device: &Device,
        project: &ProjectData,
        package: Option<&Path>,
    ) -> Result<bool> {
        Self::ensure_android(device)?;
        let package = self.package_for(project, package);
        if !package.is_file() {
            return Err(Error::install(format!(
                "No package to install at {}",
                package.display()
            )));
        }

        let hash = fs::file_hash(&package)?;
        let installed = self
            .adb
            .is_installed(&device.identifier, &project.app_identifier)
            .await?;
        let recorded = read_installs(project).remove(&device.identifier);

        if installed && recorded.as_deref() == Some(hash.as_str()) {
            debug!(
                "{} is up to date on {}",
                project.app_identifier,
                device.display_name()
            );
            return Ok(false);
        }

        self.install_package(device, project, &package).await?;
        record_install(project, &device.identifier, hash)?;
        Ok(true)
    }

    async fn install(&self, device: &Device, project: &ProjectData, package: &Path) -> Result<()> {
        Self::ensure_android(device)?;
        let hash = fs::file_hash(package)?;
        self.install_package(device, project, package).await?;
        record_install(project, &device.identifier, hash)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    use livesync_app::test_utils::test_project;

    use livesync_device::DeviceStatus;

    /// Fake adb that logs its arguments and reports the app installed once
    /// an install ran
    fn fake_adb(dir: &Path) -> Arc<Adb> {
        fake_adb_registering(dir, true)
    }

    /// With `registers` false, installs succeed but the app id never shows up
    fn fake_adb_registering(dir: &Path, registers: bool) -> Arc<Adb> {
        let script = dir.join("adb");
        let log = dir.join("adb.log");
        let marker = dir.join("installed");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\n\
                 echo \"$@\" >> {log}\n\
                 case \"$3\" in\n\
                   install) {register}echo Success ;;\n\
                   shell) [ -f {marker} ] && echo package:/data/app/base.apk ;;\n\
                 esac\n\
                 exit 0\n",
                log = log.display(),
                marker = marker.display(),
                register = if registers {
                    format!("touch {}; ", marker.display())
                } else {
                    String::new()
                },
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        Arc::new(Adb::with_path(script))
    }

    fn installs(dir: &Path) -> usize {
        std::fs::read_to_string(dir.join("adb.log"))
            .unwrap_or_default()
            .lines()
            .filter(|line| line.contains(" install "))
            .count()
    }

    fn device() -> Device {
        Device {
            identifier: "emulator-5554".into(),
            name: "Pixel".into(),
            platform: Platform::Android,
            is_emulator: true,
            status: DeviceStatus::Connected,
        }
    }

    fn write_package(project: &ProjectData, content: &str) -> PathBuf {
        let package = default_package_path(project, &AndroidSettings::default());
        std::fs::create_dir_all(package.parent().unwrap()).unwrap();
        std::fs::write(&package, content).unwrap();
        package
    }

    #[tokio::test]
    async fn test_should_build_without_package() {
        let temp = TempDir::new().unwrap();
        let installer = AdbInstaller::new(fake_adb(temp.path()), AndroidSettings::default());
        let project = test_project(temp.path());

        assert!(installer.should_build(&device(), &project, None).await.unwrap());
        write_package(&project, "apk");
        assert!(!installer.should_build(&device(), &project, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_install_if_needed_skips_unchanged_package() {
        let temp = TempDir::new().unwrap();
        let installer = AdbInstaller::new(fake_adb(temp.path()), AndroidSettings::default());
        let project = test_project(temp.path());
        write_package(&project, "apk-v1");

        assert!(installer.install_if_needed(&device(), &project, None).await.unwrap());
        assert!(!installer.install_if_needed(&device(), &project, None).await.unwrap());
        assert_eq!(installs(temp.path()), 1);

        write_package(&project, "apk-v2");
        assert!(installer.install_if_needed(&device(), &project, None).await.unwrap());
        assert_eq!(installs(temp.path()), 2);
    }

    #[tokio::test]
    async fn test_install_if_needed_without_package_fails() {
        let temp = TempDir::new().unwrap();
        let installer = AdbInstaller::new(fake_adb(temp.path()), AndroidSettings::default());
        let err = installer
            .install_if_needed(&device(), &test_project(temp.path()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Install { .. }));
    }

    #[tokio::test]
    async fn test_install_records_hash() {
        let temp = TempDir::new().unwrap();
        let installer = AdbInstaller::new(fake_adb(temp.path()), AndroidSettings::default());
        let project = test_project(temp.path());
        let package = write_package(&project, "apk");

        installer.install(&device(), &project, &package).await.unwrap();

        let recorded = read_installs(&project);
        assert_eq!(
            recorded.get("emulator-5554"),
            Some(&fs::file_hash(&package).unwrap())
        );
    }

    #[tokio::test]
    async fn test_install_with_mismatched_app_id_reports_not_installed() {
        let temp = TempDir::new().unwrap();
        let installer = AdbInstaller::new(
            fake_adb_registering(temp.path(), false),
            AndroidSettings::default(),
        );
        let project = test_project(temp.path());
        let package = write_package(&project, "apk");

        let err = installer
            .install(&device(), &project, &package)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::AppNotInstalled { ref app_identifier, .. } if app_identifier == "org.example.app"
        ));
        assert!(err.is_fatal());
        assert!(read_installs(&project).is_empty());
    }
}

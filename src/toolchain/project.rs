//! Project loading from `package.json`
//!
//! ```json
//! {
//!   "name": "my-app",
//!   "main": "app.js",
//!   "dependencies": { "camera-plugin": "^2.0.0" },
//!   "livesync": {
//!     "id": "org.example.app",
//!     "appPath": "app",
//!     "appResourcesPath": "App_Resources"
//!   }
//! }
//! ```
//!
//! The manifest minus its tooling sections becomes the project configuration
//! that the runtime manifest is built from.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;

use livesync_app::{Dependency, DependencyResolver, ProjectData, ProjectService};
use livesync_core::prelude::*;

pub const MANIFEST_FILE: &str = "package.json";
const TOOLING_KEYS: [&str; 3] = ["livesync", "dependencies", "devDependencies"];

#[derive(Debug, Default, Deserialize)]
struct Manifest {
    #[serde(default)]
    livesync: Option<LiveSyncSection>,
    #[serde(default)]
    dependencies: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveSyncSection {
    id: Option<String>,
    #[serde(default = "default_app_path")]
    app_path: PathBuf,
    #[serde(default = "default_app_resources_path")]
    app_resources_path: PathBuf,
}

fn default_app_path() -> PathBuf {
    PathBuf::from("app")
}

fn default_app_resources_path() -> PathBuf {
    PathBuf::from("App_Resources")
}

fn read_manifest(project_dir: &Path) -> Result<(PathBuf, serde_json::Value)> {
    let path = project_dir.join(MANIFEST_FILE);
    if !path.is_file() {
        return Err(Error::NoProject {
            path: project_dir.to_path_buf(),
        });
    }
    let content = std::fs::read_to_string(&path)?;
    let value: serde_json::Value =
        serde_json::from_str(&content).map_err(|e| invalid(&path, e))?;
    Ok((path, value))
}

fn invalid(path: &Path, reason: impl std::fmt::Display) -> Error {
    Error::ConfigInvalid {
        message: format!("{}: {}", path.display(), reason),
    }
}

/// Loads [`ProjectData`] from the project's `package.json`
#[derive(Debug, Default, Clone, Copy)]
pub struct ManifestProjectService;

#[async_trait]
impl ProjectService for ManifestProjectService {
    async fn project_data(&self, project_dir: &Path) -> Result<ProjectData> {
        let (manifest_path, value) = read_manifest(project_dir)?;
        let manifest: Manifest =
            serde_json::from_value(value.clone()).map_err(|e| invalid(&manifest_path, e))?;

        let section = manifest
            .livesync
            .ok_or_else(|| invalid(&manifest_path, "no \"livesync\" section"))?;
        let app_identifier = section
            .id
            .filter(|id| !id.trim().is_empty())
            .ok_or(Error::MissingConfiguration {
                property: "livesync.id",
            })?;

        let mut configuration = match value {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        for key in TOOLING_KEYS {
            configuration.remove(key);
        }

        Ok(ProjectData {
            project_dir: project_dir.to_path_buf(),
            app_identifier,
            manifest_path,
            app_directory: project_dir.join(section.app_path),
            app_resources_directory: project_dir.join(section.app_resources_path),
            platforms_directory: project_dir.join("platforms"),
            configuration: serde_json::Value::Object(configuration),
        })
    }
}

/// Production dependencies installed under `node_modules`
#[derive(Debug, Default, Clone, Copy)]
pub struct NodeModulesResolver;

#[async_trait]
impl DependencyResolver for NodeModulesResolver {
    async fn production_dependencies(&self, project_dir: &Path) -> Result<Vec<Dependency>> {
        let (_, value) = read_manifest(project_dir)?;
        let manifest: Manifest = serde_json::from_value(value).unwrap_or_default();

        let mut dependencies = Vec::new();
        for name in manifest.dependencies.into_keys() {
            let directory = project_dir.join("node_modules").join(&name);
            if directory.is_dir() {
                dependencies.push(Dependency { name, directory });
            } else {
                debug!("Dependency {} is not installed, skipping", name);
            }
        }
        Ok(dependencies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_manifest(dir: &Path, content: &str) {
        std::fs::write(dir.join(MANIFEST_FILE), content).unwrap();
    }

    #[tokio::test]
    async fn test_project_data_from_manifest() {
        let temp = TempDir::new().unwrap();
        write_manifest(
            temp.path(),
            r#"{
                "name": "demo",
                "main": "app.js",
                "dependencies": { "camera": "1.0.0" },
                "livesync": { "id": "org.example.demo", "appPath": "src" }
            }"#,
        );

        let project = ManifestProjectService.project_data(temp.path()).await.unwrap();

        assert_eq!(project.app_identifier, "org.example.demo");
        assert_eq!(project.app_directory, temp.path().join("src"));
        assert_eq!(project.app_resources_directory, temp.path().join("App_Resources"));
        assert_eq!(project.platforms_directory, temp.path().join("platforms"));
        assert_eq!(
            project.configuration,
            serde_json::json!({ "name": "demo", "main": "app.js" })
        );
    }

    #[tokio::test]
    async fn test_missing_identifier_is_a_config_error() {
        let temp = TempDir::new().unwrap();
        write_manifest(temp.path(), r#"{ "name": "demo", "livesync": {} }"#);

        let err = ManifestProjectService
            .project_data(temp.path())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingConfiguration { .. }));
        assert!(err.to_string().contains("livesync.id"));
    }

    #[tokio::test]
    async fn test_missing_manifest_is_reported() {
        let temp = TempDir::new().unwrap();
        let err = ManifestProjectService
            .project_data(temp.path())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoProject { .. }));
    }

    #[tokio::test]
    async fn test_malformed_manifest_is_invalid_config() {
        let temp = TempDir::new().unwrap();
        write_manifest(temp.path(), "{ not json");
        let err = ManifestProjectService
            .project_data(temp.path())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { .. }));
    }

    #[tokio::test]
    async fn test_only_installed_dependencies_are_resolved() {
        let temp = TempDir::new().unwrap();
        write_manifest(
            temp.path(),
            r#"{ "dependencies": { "camera": "1.0.0", "maps": "2.0.0" } }"#,
        );
        std::fs::create_dir_all(temp.path().join("node_modules/camera")).unwrap();

        let dependencies = NodeModulesResolver
            .production_dependencies(temp.path())
            .await
            .unwrap();

        assert_eq!(
            dependencies,
            vec![Dependency {
                name: "camera".into(),
                directory: temp.path().join("node_modules/camera"),
            }]
        );
    }
}

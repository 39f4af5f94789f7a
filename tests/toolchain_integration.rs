//! Integration tests for the command-line toolchain driving the prepare pipeline

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use livesync::toolchain::{
    AndroidNativePlatform, CopyCompiler, ManifestProjectService, NodeModulesResolver, ScriptHooks,
};
use livesync_app::config::{AndroidSettings, CompilerSettings, WatcherSettings};
use livesync_app::{PrepareController, PrepareEvent, PrepareRequest, PrepareServices};
use livesync_core::{Error, Platform};

/// Helper to create an app project with an Android platform project
fn create_project(path: &Path) -> PathBuf {
    let project_dir = dunce::canonicalize(path).unwrap();
    fs::write(
        project_dir.join("package.json"),
        r#"{
  "name": "demo",
  "main": "app.js",
  "dependencies": { "camera": "1.0.0" },
  "livesync": { "id": "org.example.demo" }
}
"#,
    )
    .unwrap();
    fs::create_dir_all(project_dir.join("app/views")).unwrap();
    fs::write(project_dir.join("app/app.js"), "start();\n").unwrap();
    fs::write(project_dir.join("app/views/home.xml"), "<Page/>\n").unwrap();
    fs::create_dir_all(project_dir.join("platforms/android")).unwrap();
    fs::write(
        project_dir.join("platforms/android/runtime.json"),
        r#"{ "name": "android-runtime", "version": "8.2.1" }"#,
    )
    .unwrap();
    project_dir
}

fn watcher_settings() -> WatcherSettings {
    WatcherSettings {
        debounce_ms: 100,
        tick_ms: 20,
    }
}

fn controller() -> PrepareController {
    PrepareController::new(
        PrepareServices {
            project: Arc::new(ManifestProjectService),
            native: Arc::new(AndroidNativePlatform::new(
                AndroidSettings::default(),
                CompilerSettings::default(),
            )),
            compiler: Arc::new(CopyCompiler::new(watcher_settings())),
            dependencies: Arc::new(NodeModulesResolver),
            hooks: Arc::new(ScriptHooks),
        },
        watcher_settings(),
    )
}

fn destination(project_dir: &Path) -> PathBuf {
    project_dir.join("platforms/android/app/src/main/assets/app")
}

#[tokio::test]
async fn test_prepare_copies_app_and_writes_runtime_manifest() {
    let temp = TempDir::new().unwrap();
    let project_dir = create_project(temp.path());

    let result = controller()
        .prepare(PrepareRequest::new(&project_dir, Platform::Android))
        .await
        .unwrap();

    assert_eq!(result.platform, Platform::Android);
    assert!(result.has_native_changes);

    let destination = destination(&project_dir);
    assert_eq!(
        fs::read_to_string(destination.join("app.js")).unwrap(),
        "start();\n"
    );
    assert!(destination.join("views/home.xml").is_file());

    let manifest: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(destination.join("package.json")).unwrap())
            .unwrap();
    assert_eq!(manifest["main"], "app.js");
    assert_eq!(manifest["runtime"]["version"], "8.2.1");
    assert!(manifest.get("livesync").is_none());
    assert!(manifest.get("dependencies").is_none());
}

#[tokio::test]
async fn test_second_prepare_has_no_native_changes() {
    let temp = TempDir::new().unwrap();
    let project_dir = create_project(temp.path());
    let controller = controller();

    let first = controller
        .prepare(PrepareRequest::new(&project_dir, Platform::Android))
        .await
        .unwrap();
    let second = controller
        .prepare(PrepareRequest::new(&project_dir, Platform::Android))
        .await
        .unwrap();

    assert!(first.has_native_changes);
    assert!(!second.has_native_changes);
}

#[tokio::test]
async fn test_prepare_without_android_project_fails() {
    let temp = TempDir::new().unwrap();
    let project_dir = create_project(temp.path());
    fs::remove_dir_all(project_dir.join("platforms/android")).unwrap();

    let err = controller()
        .prepare(PrepareRequest::new(&project_dir, Platform::Android))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ConfigInvalid { .. }));
    assert!(err.is_fatal());
}

#[cfg(unix)]
#[tokio::test]
async fn test_failing_prepare_hook_aborts_prepare() {
    use std::os::unix::fs::PermissionsExt;

    let temp = TempDir::new().unwrap();
    let project_dir = create_project(temp.path());
    let hook = project_dir.join("hooks/before-prepare");
    fs::create_dir_all(hook.parent().unwrap()).unwrap();
    fs::write(&hook, "#!/bin/sh\necho 'lint failed' >&2\nexit 1\n").unwrap();
    fs::set_permissions(&hook, fs::Permissions::from_mode(0o755)).unwrap();

    let err = controller()
        .prepare(PrepareRequest::new(&project_dir, Platform::Android))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Hook { .. }));
    assert!(!destination(&project_dir).join("app.js").exists());
}

#[tokio::test]
async fn test_watch_reports_compiled_changes() {
    let temp = TempDir::new().unwrap();
    let project_dir = create_project(temp.path());
    let controller = controller();
    let mut events = controller.subscribe();

    let mut request = PrepareRequest::new(&project_dir, Platform::Android).watching(true);
    request.watch_native = false;
    controller.prepare(request).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    fs::write(project_dir.join("app/app.js"), "start(2);\n").unwrap();

    let descriptor = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(PrepareEvent::Ready(ready)) => break ready.descriptor,
                Ok(_) => continue,
                Err(e) => panic!("prepare events closed: {}", e),
            }
        }
    })
    .await
    .expect("no change reported");

    assert!(!descriptor.has_native_changes);
    assert_eq!(descriptor.files, vec![destination(&project_dir).join("app.js")]);
    assert_eq!(
        fs::read_to_string(destination(&project_dir).join("app.js")).unwrap(),
        "start(2);\n"
    );

    controller.stop_all_watchers(&project_dir).await;
}

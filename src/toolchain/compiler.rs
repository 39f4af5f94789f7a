//! Copying compiler
//!
//! Bundles the app by mirroring the app directory into the platform's app
//! destination. A watch keeps the mirror current and reports every settled
//! burst of changes as a [`CompilerEvent::Emitted`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use livesync_app::config::WatcherSettings;
use livesync_app::prepare::RUNTIME_MANIFEST;
use livesync_app::{CompileRequest, Compiler, CompilerEvent, DebouncedWatcher, WatcherConfig};
use livesync_core::prelude::*;
use livesync_core::Platform;

use super::fs;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct ActiveWatch {
    watcher: DebouncedWatcher,
    forwarder: JoinHandle<()>,
}

impl ActiveWatch {
    fn stop(mut self) {
        self.watcher.stop();
        self.forwarder.abort();
    }
}

pub struct CopyCompiler {
    watcher_settings: WatcherSettings,
    watches: Mutex<HashMap<(PathBuf, Platform), ActiveWatch>>,
}

impl CopyCompiler {
    pub fn new(watcher_settings: WatcherSettings) -> Self {
        Self {
            watcher_settings,
            watches: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_watching(&self, project_dir: &Path, platform: Platform) -> bool {
        lock(&self.watches).contains_key(&(project_dir.to_path_buf(), platform))
    }
}

impl Drop for CopyCompiler {
    fn drop(&mut self) {
        for (_, watch) in lock(&self.watches).drain() {
            watch.stop();
        }
    }
}

#[async_trait]
impl Compiler for CopyCompiler {
    async fn compile(&self, request: &CompileRequest) -> Result<()> {
        let source = &request.project.app_directory;
        if !source.is_dir() {
            return Err(Error::compiler(format!(
                "App directory {} does not exist",
                source.display()
            )));
        }
        let mut written = 0;
        for file in fs::collect_files(source)? {
            let relative = file.strip_prefix(source).unwrap_or(&file);
            if is_runtime_manifest(relative) {
                continue;
            }
            fs::copy_file(&file, &request.app_destination.join(relative))?;
            written += 1;
        }
        debug!(
            "Compiled {} files into {}",
            written,
            request.app_destination.display()
        );
        Ok(())
    }

    async fn start_watch(
        &self,
        request: &CompileRequest,
        events: mpsc::UnboundedSender<CompilerEvent>,
    ) -> Result<()> {
        let key = (request.project.project_dir.clone(), request.platform);
        if let Some(previous) = lock(&self.watches).remove(&key) {
            previous.stop();
        }

        self.compile(request).await?;
        let _ = events.send(CompilerEvent::Output(format!(
            "Compiled {} for {}",
            request.project.app_directory.display(),
            request.platform.display_name()
        )));

        let source = request.project.app_directory.clone();
        let destination = request.app_destination.clone();
        let config = WatcherConfig::from_settings(vec![source.clone()], &self.watcher_settings);
        let mut watcher = DebouncedWatcher::new(config);
        let mut changes = watcher.start().await?;

        let forwarder = tokio::spawn(async move {
            while let Some(paths) = changes.recv().await {
                match mirror_changes(&source, &destination, &paths) {
                    Ok(Some(event)) => {
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Failed to compile changes: {}", e);
                        let _ = events.send(CompilerEvent::Output(format!("error: {}", e)));
                    }
                }
            }
        });

        lock(&self.watches).insert(key, ActiveWatch { watcher, forwarder });
        Ok(())
    }

    async fn stop_watch(&self, project_dir: &Path, platform: Platform) -> Result<()> {
        let watch = lock(&self.watches).remove(&(project_dir.to_path_buf(), platform));
        if let Some(watch) = watch {
            debug!("Stopping compiler watch for {:?} ({})", project_dir, platform);
            watch.stop();
        }
        Ok(())
    }
}

/// The destination's `package.json` is written by prepare, never copied
fn is_runtime_manifest(relative: &Path) -> bool {
    relative == Path::new(RUNTIME_MANIFEST)
}

/// Apply changed source paths to the destination
fn mirror_changes(
    source: &Path,
    destination: &Path,
    paths: &[PathBuf],
) -> Result<Option<CompilerEvent>> {
    let mut files = Vec::new();
    let mut removed_files = Vec::new();

    for path in paths {
        let Ok(relative) = path.strip_prefix(source) else {
            continue;
        };
        if is_runtime_manifest(relative)
            || relative.components().any(|c| fs::is_hidden(Path::new(c.as_os_str())))
        {
            continue;
        }
        let target = destination.join(relative);

        if path.is_file() {
            fs::copy_file(path, &target)?;
            files.push(target);
        } else if path.is_dir() {
            files.extend(fs::copy_tree(path, &target)?);
        } else if target.is_dir() {
            std::fs::remove_dir_all(&target)?;
            removed_files.push(target);
        } else {
            if target.exists() {
                std::fs::remove_file(&target)?;
            }
            removed_files.push(target);
        }
    }

    if files.is_empty() && removed_files.is_empty() {
        return Ok(None);
    }
    files.sort();
    files.dedup();
    Ok(Some(CompilerEvent::Emitted {
        files,
        removed_files,
        hot_update: None,
    }))
}

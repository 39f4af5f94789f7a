//! Debounced native file watcher
//!
//! Watches native sources (manifests, platform resources, plugin platform
//! folders) and reports the changed paths once they have been quiet for the
//! settle window. Bursts of writes to one path produce a single report; hidden
//! files are never reported.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::RecursiveMode;
use notify_debouncer_full::{new_debouncer, DebounceEventResult};
use tokio::sync::{mpsc, oneshot};

use livesync_core::prelude::*;

use crate::config::WatcherSettings;

/// Default settle window in milliseconds
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;

/// Default poll interval in milliseconds
pub const DEFAULT_TICK_MS: u64 = 100;

/// Configuration for the file watcher
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Files or directories to watch (absolute)
    pub patterns: Vec<PathBuf>,
    /// How long a path must stay quiet before it is reported
    pub debounce: Duration,
    /// Poll interval of the underlying event debouncer
    pub tick: Duration,
}

impl WatcherConfig {
    pub fn new(patterns: Vec<PathBuf>) -> Self {
        Self {
            patterns,
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            tick: Duration::from_millis(DEFAULT_TICK_MS),
        }
    }

    pub fn from_settings(patterns: Vec<PathBuf>, settings: &WatcherSettings) -> Self {
        Self {
            patterns,
            debounce: settings.debounce(),
            tick: settings.tick(),
        }
    }

    /// Set settle window in milliseconds
    pub fn with_debounce_ms(mut self, ms: u64) -> Self {
        self.debounce = Duration::from_millis(ms);
        self
    }

    /// Set poll interval in milliseconds
    pub fn with_tick_ms(mut self, ms: u64) -> Self {
        self.tick = Duration::from_millis(ms);
        self
    }
}

/// Watches a set of native source patterns
pub struct DebouncedWatcher {
    config: WatcherConfig,
    /// Handle to stop the watcher thread
    stop_tx: Option<oneshot::Sender<()>>,
}

impl DebouncedWatcher {
    pub fn new(config: WatcherConfig) -> Self {
        Self {
            config,
            stop_tx: None,
        }
    }

    pub fn patterns(&self) -> &[PathBuf] {
        &self.config.patterns
    }

    /// Start watching. Returns once every existing pattern is being watched;
    /// the receiver yields one de-duplicated path list per settled burst.
    pub async fn start(&mut self) -> Result<mpsc::UnboundedReceiver<Vec<PathBuf>>> {
        if self.is_running() {
            return Err(Error::watcher("Watcher is already running"));
        }

        let config = self.config.clone();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        tokio::task::spawn_blocking(move || {
            Self::run_watcher(config, raw_tx, ready_tx, stop_rx);
        });

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::watcher("Watcher thread exited during startup")),
        }

        tokio::spawn(coalesce(raw_rx, out_tx, self.config.debounce));
        self.stop_tx = Some(stop_tx);
        Ok(out_rx)
    }

    /// Stop the file watcher
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    pub fn is_running(&self) -> bool {
        self.stop_tx.is_some()
    }

    fn run_watcher(
        config: WatcherConfig,
        raw_tx: mpsc::UnboundedSender<Vec<PathBuf>>,
        ready_tx: oneshot::Sender<Result<()>>,
        mut stop_rx: oneshot::Receiver<()>,
    ) {
        let patterns = config.patterns.clone();

        let debouncer_result = new_debouncer(
            config.tick,
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    let mut seen = HashSet::new();
                    let paths: Vec<PathBuf> = events
                        .iter()
                        .filter(|event| !event.kind.is_access())
                        .flat_map(|event| event.paths.iter())
                        .filter(|path| is_relevant(&patterns, path))
                        .filter(|path| seen.insert((*path).clone()))
                        .cloned()
                        .collect();

                    if !paths.is_empty() {
                        let _ = raw_tx.send(paths);
                    }
                }
                Err(errors) => {
                    for error in errors {
                        warn!("File watcher error: {:?}", error);
                    }
                }
            },
        );

        let mut debouncer = match debouncer_result {
            Ok(d) => d,
            Err(e) => {
                error!("Failed to create file watcher: {}", e);
                let _ = ready_tx.send(Err(Error::watcher(format!(
                    "Failed to create watcher: {}",
                    e
                ))));
                return;
            }
        };

        for pattern in &config.patterns {
            let (target, mode) = if pattern.is_dir() {
                (pattern.as_path(), RecursiveMode::Recursive)
            } else if pattern.exists() {
                (pattern.as_path(), RecursiveMode::NonRecursive)
            } else {
                // Missing file: watch its directory so creation is noticed
                match pattern.parent().filter(|p| p.is_dir()) {
                    Some(parent) => (parent, RecursiveMode::NonRecursive),
                    None => {
                        debug!("Watch pattern does not exist: {}", pattern.display());
                        continue;
                    }
                }
            };

            if let Err(e) = debouncer.watch(target, mode) {
                warn!("Failed to watch {}: {}", target.display(), e);
            } else {
                debug!("Watching: {}", target.display());
            }
        }

        let _ = ready_tx.send(Ok(()));

        loop {
            match stop_rx.try_recv() {
                Ok(()) | Err(oneshot::error::TryRecvError::Closed) => {
                    debug!("File watcher stopping");
                    break;
                }
                Err(oneshot::error::TryRecvError::Empty) => {
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }
}

impl Drop for DebouncedWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Hold paths until no new event arrived for `settle`, then report them once
async fn coalesce(
    mut raw_rx: mpsc::UnboundedReceiver<Vec<PathBuf>>,
    out_tx: mpsc::UnboundedSender<Vec<PathBuf>>,
    settle: Duration,
) {
    let mut pending: Vec<PathBuf> = Vec::new();
    loop {
        if pending.is_empty() {
            match raw_rx.recv().await {
                Some(paths) => push_unique(&mut pending, paths),
                None => return,
            }
            continue;
        }

        match tokio::time::timeout(settle, raw_rx.recv()).await {
            Ok(Some(paths)) => push_unique(&mut pending, paths),
            Ok(None) => {
                let _ = out_tx.send(std::mem::take(&mut pending));
                return;
            }
            Err(_) => {
                if out_tx.send(std::mem::take(&mut pending)).is_err() {
                    return;
                }
            }
        }
    }
}

fn push_unique(pending: &mut Vec<PathBuf>, paths: Vec<PathBuf>) {
    for path in paths {
        if !pending.contains(&path) {
            pending.push(path);
        }
    }
}

/// Whether `path` falls under one of the patterns without passing through a
/// hidden entry below the pattern
fn is_relevant(patterns: &[PathBuf], path: &Path) -> bool {
    patterns.iter().any(|pattern| match path.strip_prefix(pattern) {
        Ok(rest) => {
            let hidden_below = rest
                .components()
                .any(|c| c.as_os_str().to_string_lossy().starts_with('.'));
            let hidden_self = path
                .file_name()
                .map(|n| n.to_string_lossy().starts_with('.'))
                .unwrap_or(false);
            !hidden_below && !hidden_self
        }
        Err(_) => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_watcher_config_default() {
        let config = WatcherConfig::new(vec![PathBuf::from("/p/package.json")]);
        assert_eq!(config.debounce, Duration::from_millis(500));
        assert_eq!(config.tick, Duration::from_millis(100));
    }

    #[test]
    fn test_watcher_config_from_settings() {
        let settings = WatcherSettings {
            debounce_ms: 50,
            tick_ms: 10,
        };
        let config = WatcherConfig::from_settings(vec![], &settings);
        assert_eq!(config.debounce, Duration::from_millis(50));
        assert_eq!(config.tick, Duration::from_millis(10));
    }

    #[test]
    fn test_is_relevant() {
        let patterns = vec![
            PathBuf::from("/p/App_Resources/Android"),
            PathBuf::from("/p/package.json"),
        ];

        assert!(is_relevant(&patterns, Path::new("/p/package.json")));
        assert!(is_relevant(
            &patterns,
            Path::new("/p/App_Resources/Android/src/main/res/values/strings.xml")
        ));
        assert!(!is_relevant(&patterns, Path::new("/p/package-lock.json")));
        assert!(!is_relevant(
            &patterns,
            Path::new("/p/App_Resources/Android/.DS_Store")
        ));
        assert!(!is_relevant(
            &patterns,
            Path::new("/p/App_Resources/Android/.gradle/cache.bin")
        ));
    }

    #[test]
    fn test_hidden_parent_of_pattern_is_fine() {
        let patterns = vec![PathBuf::from("/tmp/.tmpA1b2/App_Resources")];
        assert!(is_relevant(
            &patterns,
            Path::new("/tmp/.tmpA1b2/App_Resources/Android/app.gradle")
        ));
    }

    #[tokio::test]
    async fn test_double_start_error() {
        let temp = tempdir().unwrap();
        let mut watcher = DebouncedWatcher::new(WatcherConfig::new(vec![temp.path().into()]));

        let _rx = watcher.start().await.unwrap();
        assert!(watcher.is_running());

        let err = watcher.start().await.unwrap_err();
        assert!(err.to_string().contains("already running"));

        watcher.stop();
        assert!(!watcher.is_running());
    }

    #[tokio::test]
    async fn test_stop_when_not_started() {
        let mut watcher = DebouncedWatcher::new(WatcherConfig::new(vec![]));
        watcher.stop();
        assert!(!watcher.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rapid_writes_produce_one_change() {
        let temp = tempdir().unwrap();
        let root = temp.path().canonicalize().unwrap();
        let resources = root.join("App_Resources");
        std::fs::create_dir_all(&resources).unwrap();
        let file = resources.join("strings.xml");
        std::fs::write(&file, "v0").unwrap();

        let mut watcher = DebouncedWatcher::new(
            WatcherConfig::new(vec![resources.clone()])
                .with_debounce_ms(400)
                .with_tick_ms(50),
        );
        let mut rx = watcher.start().await.unwrap();

        for i in 1..=5 {
            std::fs::write(&file, format!("v{}", i)).unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let batch = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("no change reported")
            .unwrap();
        assert_eq!(batch.iter().filter(|p| **p == file).count(), 1);

        let more = tokio::time::timeout(Duration::from_millis(1000), rx.recv()).await;
        assert!(more.is_err(), "unexpected second report: {:?}", more);

        watcher.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_hidden_files_are_ignored() {
        let temp = tempdir().unwrap();
        let root = temp.path().canonicalize().unwrap();

        let mut watcher = DebouncedWatcher::new(
            WatcherConfig::new(vec![root.clone()])
                .with_debounce_ms(200)
                .with_tick_ms(50),
        );
        let mut rx = watcher.start().await.unwrap();

        std::fs::write(root.join(".hidden"), "x").unwrap();
        std::fs::write(root.join("visible.xml"), "x").unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("no change reported")
            .unwrap();
        assert!(batch.contains(&root.join("visible.xml")));
        assert!(!batch.contains(&root.join(".hidden")));
    }

    #[tokio::test]
    async fn test_coalesce_flushes_on_close() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(coalesce(raw_rx, out_tx, Duration::from_secs(60)));

        raw_tx.send(vec![PathBuf::from("/a"), PathBuf::from("/b")]).unwrap();
        raw_tx.send(vec![PathBuf::from("/a")]).unwrap();
        drop(raw_tx);

        assert_eq!(
            out_rx.recv().await.unwrap(),
            vec![PathBuf::from("/a"), PathBuf::from("/b")]
        );
        task.await.unwrap();
        assert!(out_rx.recv().await.is_none());
    }
}

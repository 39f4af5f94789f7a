//! Packages rebuilt within one sync batch
//!
//! Devices of the same platform and emulator class share one native build per
//! batch. The first device to ask runs its build action; the rest await it.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

use livesync_core::prelude::*;
use livesync_core::Platform;

type BuildCell = Arc<OnceCell<std::result::Result<PathBuf, String>>>;

#[derive(Clone, Default)]
pub struct RebuiltPackages {
    builds: Arc<Mutex<HashMap<(Platform, bool), BuildCell>>>,
}

impl RebuiltPackages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Package for (platform, emulator class), building it on first request
    pub async fn get_or_build<F, Fut>(&self, platform: Platform, is_emulator: bool, build: F) -> Result<PathBuf>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PathBuf>>,
    {
        let cell = self
            .builds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry((platform, is_emulator))
            .or_default()
            .clone();

        let built = cell
            .get_or_init(|| async move {
                debug!(
                    "Building {} package ({})",
                    platform.display_name(),
                    if is_emulator { "emulator" } else { "device" }
                );
                build().await.map_err(|e| match e {
                    Error::Build { message } => message,
                    other => other.to_string(),
                })
            })
            .await;

        built.clone().map_err(Error::build)
    }

    /// Number of builds started in this batch
    pub fn build_count(&self) -> usize {
        self.builds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }
}

//! Android transport over the binary live-sync protocol
//!
//! One [`LivesyncClient`] per device, connected lazily on the first sync.
//! Changes made only of fast-syncable files, or carrying a hot update, are
//! applied by the agent in place; anything else ends in an app restart. Agents speaking protocol
//! 0.2.0 or newer keep a long-living connection, so the client reconnects
//! right after the restart.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use livesync_core::prelude::*;
use livesync_core::Platform;

use crate::sync::{
    AndroidProcessService, DoSyncOptions, LivesyncClient, LivesyncConfig, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_OPERATION_TIMEOUT,
};
use crate::transport::{
    AppController, ConnectionErrorEvent, DeviceAppData, FileChanges, PlatformLiveSync, SyncOutcome,
};

/// Oldest agent protocol that keeps its socket across app restarts
pub const MIN_LONG_LIVING_CONNECTION_VERSION: (u64, u64, u64) = (0, 2, 0);
pub const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_FAST_SYNC_EXTENSIONS: &[&str] = &[".css", ".xml", ".html"];

const CONNECTION_ERROR_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct AndroidLiveSyncOptions {
    /// Extensions (with leading dot) the agent can apply without a restart
    pub fast_sync_extensions: Vec<String>,
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
    pub reconnect_timeout: Duration,
    pub local_host_address: Option<String>,
}

impl Default for AndroidLiveSyncOptions {
    fn default() -> Self {
        Self {
            fast_sync_extensions: DEFAULT_FAST_SYNC_EXTENSIONS
                .iter()
                .map(|e| e.to_string())
                .collect(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            reconnect_timeout: DEFAULT_RECONNECT_TIMEOUT,
            local_host_address: None,
        }
    }
}

pub struct AndroidLiveSync {
    process_service: Arc<dyn AndroidProcessService>,
    app_controller: Arc<dyn AppController>,
    options: AndroidLiveSyncOptions,
    clients: tokio::sync::Mutex<HashMap<String, LivesyncClient>>,
    connection_errors: broadcast::Sender<ConnectionErrorEvent>,
}

impl AndroidLiveSync {
    pub fn new(
        process_service: Arc<dyn AndroidProcessService>,
        app_controller: Arc<dyn AppController>,
        options: AndroidLiveSyncOptions,
    ) -> Self {
        let (connection_errors, _) = broadcast::channel(CONNECTION_ERROR_CAPACITY);
        Self {
            process_service,
            app_controller,
            options,
            clients: tokio::sync::Mutex::new(HashMap::new()),
            connection_errors,
        }
    }

    pub fn is_fast_syncable(&self, path: &Path) -> bool {
        let Some(extension) = path.extension() else {
            return false;
        };
        let extension = format!(".{}", extension.to_string_lossy().to_lowercase());
        self.options
            .fast_sync_extensions
            .iter()
            .any(|e| e.to_lowercase() == extension)
    }

    fn new_client(&self, device_identifier: &str) -> LivesyncClient {
        let client = LivesyncClient::new(Arc::clone(&self.process_service));

        let mut errors = client.subscribe_errors();
        let forward = self.connection_errors.clone();
        let device_identifier = device_identifier.to_string();
        tokio::spawn(async move {
            loop {
                match errors.recv().await {
                    Ok(error) => {
                        let _ = forward.send(ConnectionErrorEvent {
                            device_identifier: device_identifier.clone(),
                            error,
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Dropped {} connection error(s)", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        client
    }

    async fn connected_client(&self, app: &DeviceAppData, timeout: Duration) -> Result<LivesyncClient> {
        let client = {
            let mut clients = self.clients.lock().await;
            clients
                .entry(app.device.identifier.clone())
                .or_insert_with(|| self.new_client(&app.device.identifier))
                .clone()
        };

        if !client.has_connection() {
            let config = LivesyncConfig {
                app_identifier: app.app_identifier.clone(),
                device_identifier: app.device.identifier.clone(),
                app_platforms_path: app.platforms_path.clone(),
                local_host_address: self.options.local_host_address.clone(),
                connect_timeout: Some(timeout),
            };
            match client.connect(config).await {
                Ok(()) | Err(Error::Transport(TransportError::AlreadyConnected)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(client)
    }

    fn do_sync_options(&self, do_refresh: bool) -> DoSyncOptions {
        DoSyncOptions {
            do_refresh,
            timeout: self.options.operation_timeout,
            operation_id: None,
        }
    }
}

#[async_trait]
impl PlatformLiveSync for AndroidLiveSync {
    fn platform(&self) -> Platform {
        Platform::Android
    }

    fn can_reload_in_place(&self) -> bool {
        true
    }

    async fn full_sync(&self, app: &DeviceAppData) -> Result<SyncOutcome> {
        let client = self
            .connected_client(app, self.options.connect_timeout)
            .await?;

        let files = client.send_directory(&app.app_sources_dir).await?;
        let operation = client
            .send_do_sync_operation(self.do_sync_options(false))
            .await?;

        info!(
            "Transferred {} file(s) to {}",
            files.len(),
            app.device.identifier
        );

        Ok(SyncOutcome {
            device_identifier: app.device.identifier.clone(),
            modified_files: files,
            is_full_sync: true,
            fast_sync: false,
            did_refresh: operation.did_refresh,
        })
    }

    async fn sync_changes(&self, app: &DeviceAppData, changes: &FileChanges) -> Result<SyncOutcome> {
        let client = self
            .connected_client(app, self.options.connect_timeout)
            .await?;

        let (existing, missing): (Vec<_>, Vec<_>) = changes
            .modified_files
            .iter()
            .cloned()
            .partition(|f| f.is_file());
        for file in &missing {
            debug!("Skipping {} (no longer exists)", file.display());
        }

        client.remove_files(&changes.removed_files).await?;
        client.send_files(&existing).await?;

        let fast_sync = changes.hot_update
            || existing
                .iter()
                .chain(changes.removed_files.iter())
                .all(|f| self.is_fast_syncable(f));
        let operation = client
            .send_do_sync_operation(self.do_sync_options(fast_sync))
            .await?;

        Ok(SyncOutcome {
            device_identifier: app.device.identifier.clone(),
            modified_files: existing,
            is_full_sync: false,
            fast_sync,
            did_refresh: operation.did_refresh,
        })
    }

    async fn refresh_application(
        &self,
        app: &DeviceAppData,
        outcome: &SyncOutcome,
        force_restart: bool,
    ) -> Result<bool> {
        if !force_restart && outcome.fast_sync && outcome.did_refresh {
            debug!("{} refreshed in place", app.device.identifier);
            return Ok(false);
        }

        let client = self.clients.lock().await.get(&app.device.identifier).cloned();
        let protocol_version = client.as_ref().and_then(|c| c.protocol_version());
        if let Some(client) = &client {
            // The agent drops its socket when the app goes down.
            client.end(None);
        }

        info!(
            "Restarting {} on {}",
            app.app_identifier, app.device.identifier
        );
        self.app_controller
            .restart_application(&app.device.identifier, &app.app_identifier)
            .await?;

        let long_living = protocol_version
            .as_deref()
            .is_some_and(supports_long_living_connection);
        if long_living {
            if let Err(e) = self
                .connected_client(app, self.options.reconnect_timeout)
                .await
            {
                warn!(
                    "Could not reconnect to {} after restart: {}",
                    app.device.identifier, e
                );
            }
        }

        Ok(true)
    }

    async fn release(&self, device_identifier: &str) {
        if let Some(client) = self.clients.lock().await.remove(device_identifier) {
            debug!("Releasing live sync connection to {}", device_identifier);
            client.end(None);
        }
    }

    fn connection_errors(&self) -> Option<broadcast::Receiver<ConnectionErrorEvent>> {
        Some(self.connection_errors.subscribe())
    }
}

/// Parse `major.minor.patch`, missing parts count as zero
fn parse_version(version: &str) -> Option<(u64, u64, u64)> {
    let mut parts = version
        .trim()
        .trim_start_matches('v')
        .split(['.', '-', '+'])
        .map(|p| p.parse::<u64>());
    let major = parts.next()?.ok()?;
    let minor = parts.next().and_then(|p| p.ok()).unwrap_or(0);
    let patch = parts.next().and_then(|p| p.ok()).unwrap_or(0);
    Some((major, minor, patch))
}

pub fn supports_long_living_connection(protocol_version: &str) -> bool {
    parse_version(protocol_version).is_some_and(|v| v >= MIN_LONG_LIVING_CONNECTION_VERSION)
}

//! Headless mode runner
//!
//! Wires the command-line toolchain, adb and the live-sync orchestrator
//! together, runs the initial sync on the selected devices and then keeps
//! syncing until `q` on stdin or Ctrl+C.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use livesync_app::config::{init_config_dir, load_settings};
use livesync_app::{
    DeviceDescriptor, LiveSyncDependencies, LiveSyncInfo, LiveSyncService, PrepareController,
    PrepareServices, ProjectService,
};
use livesync_core::prelude::*;
use livesync_core::{LiveSyncEvent, Platform};
use livesync_device::{
    find_device, Adb, AdbDeviceDiscovery, AndroidLiveSync, AndroidLiveSyncOptions, Device,
    DeviceDiscovery, HotUpdateMonitor, PlatformLiveSync,
};

use super::control::{
    handle_command, parse_command, HeadlessCommand, LiveSyncControl, SessionControl,
};
use super::HeadlessEvent;
use crate::toolchain::{
    AdbInstaller, AndroidNativePlatform, CopyCompiler, ManifestProjectService, NodeModulesResolver,
    ScriptHooks,
};

const DEVICE_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// How long queued events may take to reach stdout on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Options of one headless run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub project_dir: PathBuf,
    /// Device identifiers or names; empty selects every connected Android device
    pub devices: Vec<String>,
    pub watch: bool,
    pub watch_native: bool,
    pub hot_updates: bool,
    pub debug_brk: bool,
    pub clean: bool,
}

impl RunOptions {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            devices: Vec::new(),
            watch: true,
            watch_native: true,
            hot_updates: true,
            debug_brk: false,
            clean: false,
        }
    }

    fn live_sync_info(&self) -> LiveSyncInfo {
        let mut info = LiveSyncInfo::new(&self.project_dir);
        info.skip_watcher = !self.watch;
        info.watch_native = self.watch_native;
        info.use_hot_updates = self.hot_updates;
        info.clean = self.clean;
        info
    }
}

/// Run live sync headless, reporting NDJSON events on stdout
pub async fn run_headless(options: RunOptions) -> Result<()> {
    info!("═══════════════════════════════════════════════════════");
    info!("livesync starting in HEADLESS mode");
    info!("Project: {}", options.project_dir.display());
    info!("═══════════════════════════════════════════════════════");

    let result = run(options).await;
    if let Err(e) = &result {
        error!("Headless run failed: {}", e);
        HeadlessEvent::error(e.to_string(), true).emit();
    }

    info!("livesync headless mode exiting");
    result
}

async fn run(options: RunOptions) -> Result<()> {
    let project = ManifestProjectService.project_data(&options.project_dir).await?;
    if let Err(e) = init_config_dir(&options.project_dir) {
        warn!("Failed to create default configuration: {}", e);
    }
    let settings = load_settings(&options.project_dir);

    let adb = Arc::new(Adb::locate().context("Unable to locate adb")?);
    let discovery = Arc::new(AdbDeviceDiscovery::new(adb.clone()));
    let available = discovery
        .devices()
        .await
        .context("Unable to list Android devices")?;
    let devices = select_devices(&available, &options.devices)?;
    for device in &devices {
        HeadlessEvent::device_detected(
            &device.identifier,
            &device.name,
            device.platform.as_str(),
            device.is_emulator,
        )
        .emit();
    }
    discovery.start_polling(DEVICE_POLL_INTERVAL);

    let native = Arc::new(AndroidNativePlatform::new(
        settings.android.clone(),
        settings.compiler.clone(),
    ));
    let hooks = Arc::new(ScriptHooks);
    let hot_updates = Arc::new(HotUpdateMonitor::new());
    let transport = Arc::new(AndroidLiveSync::new(
        adb.clone(),
        adb.clone(),
        AndroidLiveSyncOptions {
            fast_sync_extensions: settings.sync.fast_sync_extensions.clone(),
            connect_timeout: settings.sync.connect_timeout(),
            operation_timeout: settings.sync.operation_timeout(),
            ..Default::default()
        },
    ));

    let prepare = PrepareController::new(
        PrepareServices {
            project: Arc::new(ManifestProjectService),
            native: native.clone(),
            compiler: Arc::new(CopyCompiler::new(settings.watcher.clone())),
            dependencies: Arc::new(NodeModulesResolver),
            hooks: hooks.clone(),
        },
        settings.watcher.clone(),
    );
    let service = LiveSyncService::new(
        LiveSyncDependencies {
            project: Arc::new(ManifestProjectService),
            native: native.clone(),
            installer: Arc::new(AdbInstaller::new(adb.clone(), settings.android.clone())),
            hooks,
            discovery: discovery.clone(),
            transports: vec![transport as Arc<dyn PlatformLiveSync>],
            hot_updates: hot_updates.clone(),
        },
        prepare,
        settings.sync.clone(),
    );

    let forwarder = spawn_event_forwarder(
        service.subscribe(),
        adb.clone(),
        options.hot_updates.then_some(hot_updates),
    );

    let descriptors: Vec<DeviceDescriptor> = devices
        .iter()
        .map(|device| {
            DeviceDescriptor::new(device, native.build_action(&project))
                .with_debugging(options.debug_brk)
        })
        .collect();

    let control = LiveSyncControl::new(service.clone(), &options.project_dir);
    let mut interrupted = false;
    let result = tokio::select! {
        result = service.run(descriptors, options.live_sync_info()) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted during initial sync");
            interrupted = true;
            Ok(())
        }
    };

    if result.is_ok() && options.watch && !interrupted {
        let (command_tx, command_rx) = mpsc::channel(16);
        std::thread::spawn(move || spawn_stdin_reader_blocking(command_tx));
        command_loop(&control, command_rx).await;
    }

    if let Err(e) = service.stop_all().await {
        warn!("Failed to stop live sync: {}", e);
    }
    discovery.stop_polling();

    // Event stream closes once the last service handle is gone
    drop(control);
    drop(service);
    if tokio::time::timeout(SHUTDOWN_GRACE, forwarder).await.is_err() {
        debug!("Event forwarder did not finish in time");
    }

    result
}

/// Devices to sync: the requested ones, or every connected Android device
pub fn select_devices(available: &[Device], requested: &[String]) -> Result<Vec<Device>> {
    if requested.is_empty() {
        let devices: Vec<Device> = available
            .iter()
            .filter(|d| d.platform == Platform::Android && d.is_connected())
            .cloned()
            .collect();
        if devices.is_empty() {
            return Err(Error::config("No connected Android devices found"));
        }
        return Ok(devices);
    }

    let mut devices: Vec<Device> = Vec::new();
    for specifier in requested {
        let device = find_device(available, specifier)
            .filter(|d| d.is_connected())
            .ok_or_else(|| Error::DeviceNotFound {
                identifier: specifier.clone(),
            })?;
        if device.platform != Platform::Android {
            return Err(Error::UnsupportedPlatform {
                platform: device.platform.display_name().to_string(),
            });
        }
        if !devices.iter().any(|d| d.identifier == device.identifier) {
            devices.push(device.clone());
        }
    }
    Ok(devices)
}

async fn command_loop<C: SessionControl>(
    control: &C,
    mut commands: mpsc::Receiver<HeadlessCommand>,
) {
    loop {
        tokio::select! {
            Some(command) = commands.recv() => {
                match handle_command(control, command).await {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(e) => {
                        error!("Command failed: {}", e);
                        HeadlessEvent::error(e.to_string(), false).emit();
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }
}

/// Print orchestrator events and follow device logs for hot-update results
fn spawn_event_forwarder(
    mut events: broadcast::Receiver<LiveSyncEvent>,
    adb: Arc<Adb>,
    hot_updates: Option<Arc<HotUpdateMonitor>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut log_monitors: HashMap<String, JoinHandle<()>> = HashMap::new();

        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Headless output skipped {} events", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            HeadlessEvent::from_livesync(&event).emit();

            match &event {
                LiveSyncEvent::Started {
                    device_identifier, ..
                } => {
                    let Some(monitor) = &hot_updates else {
                        continue;
                    };
                    if log_monitors.contains_key(device_identifier) {
                        continue;
                    }
                    match spawn_log_monitor(&adb, device_identifier, monitor.clone()) {
                        Ok(handle) => {
                            log_monitors.insert(device_identifier.clone(), handle);
                        }
                        Err(e) => warn!("Cannot follow logs of {}: {}", device_identifier, e),
                    }
                }
                LiveSyncEvent::Stopped {
                    device_identifier, ..
                } => {
                    if let Some(handle) = log_monitors.remove(device_identifier) {
                        handle.abort();
                    }
                    if let Some(monitor) = &hot_updates {
                        monitor.forget_device(device_identifier);
                    }
                }
                _ => {}
            }
        }

        for (_, handle) in log_monitors {
            handle.abort();
        }
    })
}

fn spawn_log_monitor(
    adb: &Adb,
    device_identifier: &str,
    monitor: Arc<HotUpdateMonitor>,
) -> Result<JoinHandle<()>> {
    let mut lines = adb.logcat_lines(device_identifier)?;
    let device_identifier = device_identifier.to_string();

    Ok(tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            if let Some(status) = monitor.process_log_line(&device_identifier, &line) {
                debug!("Hot update on {}: {:?}", device_identifier, status);
            }
        }
    }))
}

/// Read commands from stdin (blocking, runs on its own thread)
fn spawn_stdin_reader_blocking(command_tx: mpsc::Sender<HeadlessCommand>) {
    use std::io::BufRead;

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("Stdin read error: {}", e);
                break;
            }
        };
        match parse_command(&line) {
            Some(command) => {
                if command_tx.blocking_send(command).is_err() {
                    break;
                }
            }
            None if line.trim().is_empty() => {}
            None => warn!("Unknown command: {}", line.trim()),
        }
    }
    debug!("Stdin reader finished");
}

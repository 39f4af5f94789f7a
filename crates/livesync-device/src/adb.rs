//! `adb` command wrapper
//!
//! Provides port forwarding and process queries for the sync client, app
//! install/restart, log streaming, and a polling [`DeviceDiscovery`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use livesync_core::prelude::*;
use livesync_core::Platform;

use crate::devices::{diff_devices, Device, DeviceDiscovery, DeviceEvent, DeviceStatus};
use crate::sync::AndroidProcessService;
use crate::transport::AppController;

/// Default timeout for one adb invocation
const ADB_TIMEOUT: Duration = Duration::from_secs(30);
/// Installs can take a while on slow emulators
const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);

const LOG_CHANNEL_CAPACITY: usize = 1024;
const DEVICE_EVENT_CAPACITY: usize = 64;

static MODEL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bmodel:(\S+)").expect("Invalid model regex"));
static PRODUCT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bproduct:(\S+)").expect("Invalid product regex"));

#[derive(Debug, Clone)]
pub struct Adb {
    path: PathBuf,
}

impl Adb {
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Find adb under `ANDROID_HOME` / `ANDROID_SDK_ROOT` platform-tools, then on `PATH`
    pub fn locate() -> Result<Self> {
        let executable = if cfg!(windows) { "adb.exe" } else { "adb" };

        for var in ["ANDROID_HOME", "ANDROID_SDK_ROOT"] {
            if let Ok(sdk) = std::env::var(var) {
                let candidate = Path::new(&sdk).join("platform-tools").join(executable);
                if candidate.is_file() {
                    debug!("Using adb from {}: {}", var, candidate.display());
                    return Ok(Self::with_path(candidate));
                }
            }
        }

        which::which("adb")
            .map(Self::with_path)
            .map_err(|_| Error::ToolNotFound { tool: "adb".into() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn run(&self, args: &[&str], timeout: Duration) -> Result<std::process::Output> {
        trace!("adb {}", args.join(" "));

        let output = tokio::time::timeout(
            timeout,
            Command::new(&self.path)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::process(format!("adb {} timed out", args.join(" "))))?
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::ToolNotFound { tool: "adb".into() }
            } else {
                Error::process(format!("Failed to run adb: {}", e))
            }
        })?;

        Ok(output)
    }

    /// Run and require a zero exit code, returning stdout
    async fn run_checked(&self, args: &[&str], timeout: Duration) -> Result<String> {
        let output = self.run(args, timeout).await?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::process(format!(
                "adb {} failed with exit code {:?}: {}",
                args.join(" "),
                output.status.code(),
                stderr.trim()
            )));
        }
        Ok(stdout)
    }

    pub async fn devices(&self) -> Result<Vec<Device>> {
        let stdout = self.run_checked(&["devices", "-l"], ADB_TIMEOUT).await?;
        Ok(parse_devices_output(&stdout))
    }

    /// Forward a free local port to `remote` (e.g. `localabstract:name`)
    pub async fn forward_free_port(&self, device_identifier: &str, remote: &str) -> Result<u16> {
        let stdout = self
            .run_checked(
                &["-s", device_identifier, "forward", "tcp:0", remote],
                ADB_TIMEOUT,
            )
            .await?;
        stdout.trim().parse::<u16>().map_err(|_| {
            Error::process(format!(
                "Unexpected adb forward output for {}: {:?}",
                remote,
                stdout.trim()
            ))
        })
    }

    pub async fn pid_of(&self, device_identifier: &str, app_identifier: &str) -> Result<Option<String>> {
        let output = self
            .run(
                &["-s", device_identifier, "shell", "pidof", app_identifier],
                ADB_TIMEOUT,
            )
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_pidof_output(&stdout))
    }

    pub async fn install(&self, device_identifier: &str, package_path: &Path) -> Result<()> {
        let package = package_path.to_string_lossy();
        info!("Installing {} on {}", package, device_identifier);

        let output = self
            .run(
                &["-s", device_identifier, "install", "-r", package.as_ref()],
                INSTALL_TIMEOUT,
            )
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() && stdout.contains("Success") {
            Ok(())
        } else {
            let details = if stderr.trim().is_empty() {
                stdout.trim()
            } else {
                stderr.trim()
            };
            Err(Error::install(format!(
                "{} on {}: {}",
                package, device_identifier, details
            )))
        }
    }

    pub async fn is_installed(&self, device_identifier: &str, app_identifier: &str) -> Result<bool> {
        let output = self
            .run(
                &["-s", device_identifier, "shell", "pm", "path", app_identifier],
                ADB_TIMEOUT,
            )
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).contains("package:"))
    }

    pub async fn stop_application(&self, device_identifier: &str, app_identifier: &str) -> Result<()> {
        self.run_checked(
            &["-s", device_identifier, "shell", "am", "force-stop", app_identifier],
            ADB_TIMEOUT,
        )
        .await
        .map(|_| ())
    }

    pub async fn start_application(&self, device_identifier: &str, app_identifier: &str) -> Result<()> {
        self.run_checked(
            &[
                "-s",
                device_identifier,
                "shell",
                "monkey",
                "-p",
                app_identifier,
                "-c",
                "android.intent.category.LAUNCHER",
                "1",
            ],
            ADB_TIMEOUT,
        )
        .await
        .map(|_| ())
    }

    /// Stream `adb logcat` lines of a device until the receiver is dropped
    pub fn logcat_lines(&self, device_identifier: &str) -> Result<mpsc::Receiver<String>> {
        let mut child = Command::new(&self.path)
            .args(["-s", device_identifier, "logcat", "-v", "brief"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::ProcessSpawn {
                reason: format!("adb logcat: {}", e),
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::process("adb logcat has no stdout"))?;
        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let device_identifier = device_identifier.to_string();

        tokio::spawn(async move {
            let _child = child;
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            debug!("logcat reader for {} finished", device_identifier);
        });

        Ok(rx)
    }
}

#[async_trait]
impl AndroidProcessService for Adb {
    async fn forward_free_tcp_to_abstract_port(
        &self,
        device_identifier: &str,
        _app_identifier: &str,
        abstract_port: &str,
    ) -> Result<u16> {
        self.forward_free_port(device_identifier, abstract_port).await
    }

    async fn app_process_id(
        &self,
        device_identifier: &str,
        app_identifier: &str,
    ) -> Result<Option<String>> {
        self.pid_of(device_identifier, app_identifier).await
    }
}

#[async_trait]
impl AppController for Adb {
    async fn restart_application(&self, device_identifier: &str, app_identifier: &str) -> Result<()> {
        self.stop_application(device_identifier, app_identifier)
            .await?;
        self.start_application(device_identifier, app_identifier)
            .await
    }
}

/// Parse the output of `adb devices -l`
pub fn parse_devices_output(output: &str) -> Vec<Device> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let identifier = fields.next()?.to_string();
            let status = match fields.next()? {
                "device" => DeviceStatus::Connected,
                "unauthorized" => DeviceStatus::Unauthorized,
                _ => DeviceStatus::Offline,
            };

            let name = MODEL_PATTERN
                .captures(line)
                .map(|c| c[1].replace('_', " "))
                .unwrap_or_else(|| identifier.clone());
            let is_emulator = identifier.starts_with("emulator-")
                || PRODUCT_PATTERN
                    .captures(line)
                    .is_some_and(|c| c[1].starts_with("sdk_"));

            Some(Device {
                identifier,
                name,
                platform: Platform::Android,
                is_emulator,
                status,
            })
        })
        .collect()
}

/// `pidof` prints the pid(s); empty output means the process is not running
fn parse_pidof_output(output: &str) -> Option<String> {
    output.split_whitespace().next().map(str::to_string)
}

// ─────────────────────────────────────────────────────────────────
// Device discovery
// ─────────────────────────────────────────────────────────────────

struct DiscoveryShared {
    adb: Arc<Adb>,
    known: Mutex<Vec<Device>>,
    events: broadcast::Sender<DeviceEvent>,
}

impl DiscoveryShared {
    fn known(&self) -> MutexGuard<'_, Vec<Device>> {
        self.known.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn refresh(&self) -> Result<Vec<Device>> {
        let current = self.adb.devices().await?;
        let events = {
            let mut known = self.known();
            let events = diff_devices(&known, &current);
            *known = current.clone();
            events
        };
        for event in events {
            match &event {
                DeviceEvent::Found(d) => info!("Device found: {}", d.display_name()),
                DeviceEvent::Lost(d) => info!("Device lost: {}", d.display_name()),
            }
            let _ = self.events.send(event);
        }
        Ok(current)
    }
}

/// Polls `adb devices` and reports attach/detach
pub struct AdbDeviceDiscovery {
    shared: Arc<DiscoveryShared>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl AdbDeviceDiscovery {
    pub fn new(adb: Arc<Adb>) -> Self {
        let (events, _) = broadcast::channel(DEVICE_EVENT_CAPACITY);
        Self {
            shared: Arc::new(DiscoveryShared {
                adb,
                known: Mutex::new(Vec::new()),
                events,
            }),
            poll_task: Mutex::new(None),
        }
    }

    /// Start polling in the background; a second call is a no-op
    pub fn start_polling(&self, interval: Duration) {
        let mut task = self.poll_task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return;
        }

        let shared = Arc::clone(&self.shared);
        *task = Some(tokio::spawn(async move {
            loop {
                if let Err(e) = shared.refresh().await {
                    warn!("Device polling failed: {}", e);
                }
                tokio::time::sleep(interval).await;
            }
        }));
    }

    pub fn stop_polling(&self) {
        if let Some(task) = self
            .poll_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

impl Drop for AdbDeviceDiscovery {
    fn drop(&mut self) {
        self.stop_polling();
    }
}

#[async_trait]
impl DeviceDiscovery for AdbDeviceDiscovery {
    async fn devices(&self) -> Result<Vec<Device>> {
        self.shared.refresh().await
    }

    fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.shared.events.subscribe()
    }
}

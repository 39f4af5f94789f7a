//! Test utilities for device-side types
//!
//! - [`MockDeviceAgent`] - TCP stand-in for the on-device live-sync agent
//! - [`FakeProcessService`], [`FakeAppController`] - scripted device tooling
//! - [`FakeDeviceDiscovery`] - in-memory device list with attach/detach events
//! - [`RecordingLiveSync`] - [`PlatformLiveSync`] that records every call

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

use livesync_core::prelude::*;
use livesync_core::Platform;

use crate::devices::{Device, DeviceDiscovery, DeviceEvent, DeviceStatus};
use crate::sync::protocol::{
    CREATE_FILE_OPERATION, DELETE_FILE_OPERATION, DIGEST_LENGTH, DO_SYNC_OPERATION,
    ERROR_REPORT, OPERATION_END_NO_REFRESH_REPORT, OPERATION_END_REPORT, OPERATION_ID_LENGTH,
};
use crate::sync::AndroidProcessService;
use crate::transport::{
    AppController, ConnectionErrorEvent, DeviceAppData, FileChanges, PlatformLiveSync, SyncOutcome,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Creates a connected test device
pub fn test_device(identifier: &str, platform: Platform, is_emulator: bool) -> Device {
    Device {
        identifier: identifier.to_string(),
        name: format!("Test {}", identifier),
        platform,
        is_emulator,
        status: DeviceStatus::Connected,
    }
}

// ─────────────────────────────────────────────────────────────────
// Mock agent
// ─────────────────────────────────────────────────────────────────

/// A frame decoded by [`MockDeviceAgent`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceivedFrame {
    CreateFile { path: String, content: Vec<u8> },
    DeleteFile { path: String },
    DoSync { operation_id: String, do_refresh: bool },
}

/// How the agent answers DO_SYNC
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyMode {
    /// Operation end, app refreshed
    Refresh,
    /// Operation end, no refresh
    NoRefresh,
    /// Never answer
    Silent,
    /// Error report with this message
    Error(String),
    /// Close the connection
    Disconnect,
}

struct AgentShared {
    handshake: Vec<u8>,
    frames: Mutex<Vec<ReceivedFrame>>,
    raw: Mutex<Vec<u8>>,
    reply_mode: Mutex<ReplyMode>,
    connections: AtomicUsize,
    frame_notify: Notify,
}

/// Listens on a local port and speaks the agent side of the protocol
pub struct MockDeviceAgent {
    port: u16,
    shared: Arc<AgentShared>,
    accept_task: JoinHandle<()>,
}

impl MockDeviceAgent {
    pub async fn start(protocol_version: &str, app_identifier: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock agent");
        let port = listener.local_addr().expect("mock agent addr").port();

        let mut handshake = vec![protocol_version.len() as u8];
        handshake.extend_from_slice(protocol_version.as_bytes());
        handshake.extend_from_slice(app_identifier.as_bytes());

        let shared = Arc::new(AgentShared {
            handshake,
            frames: Mutex::new(Vec::new()),
            raw: Mutex::new(Vec::new()),
            reply_mode: Mutex::new(ReplyMode::Refresh),
            connections: AtomicUsize::new(0),
            frame_notify: Notify::new(),
        });

        let accept_shared = Arc::clone(&shared);
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_connection(Arc::clone(&accept_shared), stream));
            }
        });

        Self {
            port,
            shared,
            accept_task,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_reply_mode(&self, mode: ReplyMode) {
        *lock(&self.shared.reply_mode) = mode;
    }

    pub fn frames(&self) -> Vec<ReceivedFrame> {
        lock(&self.shared.frames).clone()
    }

    /// Every byte received after the handshake, across connections
    pub fn raw_bytes(&self) -> Vec<u8> {
        lock(&self.shared.raw).clone()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` frames arrived (or the timeout elapsed)
    pub async fn wait_for_frames(&self, count: usize, timeout: Duration) -> Vec<ReceivedFrame> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.frame_notify.notified();
            let frames = self.frames();
            if frames.len() >= count {
                return frames;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.frames();
            }
        }
    }
}

impl Drop for MockDeviceAgent {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_connection(shared: Arc<AgentShared>, mut stream: TcpStream) {
    shared.connections.fetch_add(1, Ordering::SeqCst);
    if stream.write_all(&shared.handshake).await.is_err() {
        return;
    }

    loop {
        let mut raw = Vec::new();
        let frame = match read_frame(&mut stream, &mut raw).await {
            Ok(Some(frame)) => frame,
            _ => return,
        };

        lock(&shared.raw).extend_from_slice(&raw);
        lock(&shared.frames).push(frame.clone());
        shared.frame_notify.notify_waiters();

        if let ReceivedFrame::DoSync { operation_id, .. } = frame {
            let mode = lock(&shared.reply_mode).clone();
            let reply = match mode {
                ReplyMode::Refresh => Some([&[OPERATION_END_REPORT], operation_id.as_bytes()].concat()),
                ReplyMode::NoRefresh => {
                    Some([&[OPERATION_END_NO_REFRESH_REPORT], operation_id.as_bytes()].concat())
                }
                ReplyMode::Error(message) => Some([&[ERROR_REPORT], message.as_bytes()].concat()),
                ReplyMode::Silent => None,
                ReplyMode::Disconnect => return,
            };
            if let Some(reply) = reply {
                if stream.write_all(&reply).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn read_exact_into(stream: &mut TcpStream, raw: &mut Vec<u8>, len: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    raw.extend_from_slice(&buf);
    Ok(buf)
}

async fn read_length(stream: &mut TcpStream, raw: &mut Vec<u8>) -> std::io::Result<usize> {
    let digit_count = read_exact_into(stream, raw, 1).await?[0] as usize;
    let digits = read_exact_into(stream, raw, digit_count).await?;
    String::from_utf8_lossy(&digits)
        .parse::<usize>()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

async fn read_frame(stream: &mut TcpStream, raw: &mut Vec<u8>) -> std::io::Result<Option<ReceivedFrame>> {
    let opcode = match read_exact_into(stream, raw, 1).await {
        Ok(byte) => byte[0],
        Err(_) => return Ok(None),
    };

    let frame = match opcode {
        CREATE_FILE_OPERATION => {
            let name_len = read_length(stream, raw).await?;
            let path = String::from_utf8_lossy(&read_exact_into(stream, raw, name_len).await?).into_owned();
            let content_len = read_length(stream, raw).await?;
            read_exact_into(stream, raw, DIGEST_LENGTH).await?;
            let content = read_exact_into(stream, raw, content_len).await?;
            read_exact_into(stream, raw, DIGEST_LENGTH).await?;
            ReceivedFrame::CreateFile { path, content }
        }
        DELETE_FILE_OPERATION => {
            let name_len = read_length(stream, raw).await?;
            let path = String::from_utf8_lossy(&read_exact_into(stream, raw, name_len).await?).into_owned();
            read_exact_into(stream, raw, DIGEST_LENGTH).await?;
            ReceivedFrame::DeleteFile { path }
        }
        DO_SYNC_OPERATION => {
            let id = read_exact_into(stream, raw, OPERATION_ID_LENGTH).await?;
            let refresh = read_exact_into(stream, raw, 1).await?[0];
            read_exact_into(stream, raw, DIGEST_LENGTH).await?;
            ReceivedFrame::DoSync {
                operation_id: String::from_utf8_lossy(&id).into_owned(),
                do_refresh: refresh == 1,
            }
        }
        _ => return Ok(None),
    };

    Ok(Some(frame))
}

// ─────────────────────────────────────────────────────────────────
// Fake collaborators
// ─────────────────────────────────────────────────────────────────

/// Forwards every request to a fixed local port
pub struct FakeProcessService {
    port: u16,
    process_id: Mutex<Option<String>>,
    forwarded: Mutex<Vec<String>>,
}

impl FakeProcessService {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            process_id: Mutex::new(Some("1234".into())),
            forwarded: Mutex::new(Vec::new()),
        }
    }

    pub fn set_process_id(&self, process_id: Option<String>) {
        *lock(&self.process_id) = process_id;
    }

    /// Abstract socket names requested so far
    pub fn forwarded_ports(&self) -> Vec<String> {
        lock(&self.forwarded).clone()
    }
}

#[async_trait]
impl AndroidProcessService for FakeProcessService {
    async fn forward_free_tcp_to_abstract_port(
        &self,
        _device_identifier: &str,
        _app_identifier: &str,
        abstract_port: &str,
    ) -> Result<u16> {
        lock(&self.forwarded).push(abstract_port.to_string());
        Ok(self.port)
    }

    async fn app_process_id(
        &self,
        _device_identifier: &str,
        _app_identifier: &str,
    ) -> Result<Option<String>> {
        Ok(lock(&self.process_id).clone())
    }
}

#[derive(Default)]
pub struct FakeAppController {
    restarts: Mutex<Vec<(String, String)>>,
}

impl FakeAppController {
    pub fn restart_count(&self) -> usize {
        lock(&self.restarts).len()
    }
}

#[async_trait]
impl AppController for FakeAppController {
    async fn restart_application(&self, device_identifier: &str, app_identifier: &str) -> Result<()> {
        lock(&self.restarts).push((device_identifier.to_string(), app_identifier.to_string()));
        Ok(())
    }
}

pub struct FakeDeviceDiscovery {
    devices: Mutex<Vec<Device>>,
    events: broadcast::Sender<DeviceEvent>,
}

impl Default for FakeDeviceDiscovery {
    fn default() -> Self {
        Self::with_devices(Vec::new())
    }
}

impl FakeDeviceDiscovery {
    pub fn with_devices(devices: Vec<Device>) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            devices: Mutex::new(devices),
            events,
        }
    }

    pub fn add_device(&self, device: Device) {
        lock(&self.devices).push(device.clone());
        let _ = self.events.send(DeviceEvent::Found(device));
    }

    pub fn remove_device(&self, identifier: &str) {
        let removed: Vec<Device> = {
            let mut devices = lock(&self.devices);
            let (removed, kept) = devices.drain(..).partition(|d| d.identifier == identifier);
            *devices = kept;
            removed
        };
        for device in removed {
            let _ = self.events.send(DeviceEvent::Lost(device));
        }
    }
}

#[async_trait]
impl DeviceDiscovery for FakeDeviceDiscovery {
    async fn devices(&self) -> Result<Vec<Device>> {
        Ok(lock(&self.devices).clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }
}

/// A call observed by [`RecordingLiveSync`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveSyncCall {
    FullSync {
        device: String,
    },
    SyncChanges {
        device: String,
        modified_files: Vec<PathBuf>,
        removed_files: Vec<PathBuf>,
        hot_update: bool,
    },
    Refresh {
        device: String,
        force_restart: bool,
    },
    Release {
        device: String,
    },
}

impl LiveSyncCall {
    pub fn device(&self) -> &str {
        match self {
            LiveSyncCall::FullSync { device }
            | LiveSyncCall::SyncChanges { device, .. }
            | LiveSyncCall::Refresh { device, .. }
            | LiveSyncCall::Release { device } => device,
        }
    }
}

/// Platform transport that records calls and can fail chosen devices
pub struct RecordingLiveSync {
    platform: Platform,
    calls: Mutex<Vec<LiveSyncCall>>,
    failing_devices: Mutex<HashSet<String>>,
    report_refresh: AtomicBool,
    connection_errors: broadcast::Sender<ConnectionErrorEvent>,
}

impl RecordingLiveSync {
    pub fn new(platform: Platform) -> Self {
        let (connection_errors, _) = broadcast::channel(16);
        Self {
            platform,
            calls: Mutex::new(Vec::new()),
            failing_devices: Mutex::new(HashSet::new()),
            report_refresh: AtomicBool::new(true),
            connection_errors,
        }
    }

    /// Make every sync on `device` fail
    pub fn fail_device(&self, device: &str) {
        lock(&self.failing_devices).insert(device.to_string());
    }

    /// Whether syncs report an in-place refresh
    pub fn set_report_refresh(&self, refresh: bool) {
        self.report_refresh.store(refresh, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<LiveSyncCall> {
        lock(&self.calls).clone()
    }

    pub fn calls_for(&self, device: &str) -> Vec<LiveSyncCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.device() == device)
            .collect()
    }

    pub fn emit_connection_error(&self, device: &str, error: TransportError) {
        let _ = self.connection_errors.send(ConnectionErrorEvent {
            device_identifier: device.to_string(),
            error,
        });
    }

    fn check_device(&self, device: &str) -> Result<()> {
        if lock(&self.failing_devices).contains(device) {
            return Err(TransportError::device(format!("sync failed on {device}")).into());
        }
        Ok(())
    }
}

#[async_trait]
impl PlatformLiveSync for RecordingLiveSync {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn can_reload_in_place(&self) -> bool {
        true
    }

    async fn full_sync(&self, app: &DeviceAppData) -> Result<SyncOutcome> {
        let device = app.device.identifier.clone();
        lock(&self.calls).push(LiveSyncCall::FullSync {
            device: device.clone(),
        });
        self.check_device(&device)?;
        Ok(SyncOutcome {
            device_identifier: device,
            modified_files: Vec::new(),
            is_full_sync: true,
            fast_sync: false,
            did_refresh: false,
        })
    }

    async fn sync_changes(&self, app: &DeviceAppData, changes: &FileChanges) -> Result<SyncOutcome> {
        let device = app.device.identifier.clone();
        lock(&self.calls).push(LiveSyncCall::SyncChanges {
            device: device.clone(),
            modified_files: changes.modified_files.clone(),
            removed_files: changes.removed_files.clone(),
            hot_update: changes.hot_update,
        });
        self.check_device(&device)?;
        Ok(SyncOutcome {
            device_identifier: device,
            modified_files: changes.modified_files.clone(),
            is_full_sync: false,
            fast_sync: true,
            did_refresh: self.report_refresh.load(Ordering::SeqCst),
        })
    }

    async fn refresh_application(
        &self,
        app: &DeviceAppData,
        outcome: &SyncOutcome,
        force_restart: bool,
    ) -> Result<bool> {
        lock(&self.calls).push(LiveSyncCall::Refresh {
            device: app.device.identifier.clone(),
            force_restart,
        });
        Ok(force_restart || !(outcome.fast_sync && outcome.did_refresh))
    }

    async fn release(&self, device_identifier: &str) {
        lock(&self.calls).push(LiveSyncCall::Release {
            device: device_identifier.to_string(),
        });
    }

    fn connection_errors(&self) -> Option<broadcast::Receiver<ConnectionErrorEvent>> {
        Some(self.connection_errors.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_defaults() {
        let device = test_device("emulator-5554", Platform::Android, true);
        assert_eq!(device.identifier, "emulator-5554");
        assert!(device.is_emulator);
        assert!(device.is_connected());
    }

    #[tokio::test]
    async fn test_fake_discovery_emits_events() {
        let discovery = FakeDeviceDiscovery::default();
        let mut events = discovery.subscribe();

        discovery.add_device(test_device("a", Platform::Android, false));
        discovery.remove_device("a");

        assert!(matches!(events.recv().await.unwrap(), DeviceEvent::Found(_)));
        assert!(matches!(events.recv().await.unwrap(), DeviceEvent::Lost(_)));
        assert!(discovery.devices().await.unwrap().is_empty());
    }
}

//! Socket client for the on-device live-sync agent.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       LivesyncClient                          │
//! │                                                               │
//! │  send_file() ──┐                                              │
//! │  remove_file() ┼──▶ writer (async mutex, one frame at a time) │
//! │  do_sync()  ───┘         │                                    │
//! │       │                  ▼                                    │
//! │       │            TCP ─▶ adb forward ─▶ localabstract socket │
//! │       │                  │                                    │
//! │       ▼                  ▼                                    │
//! │  PendingOperations ◀── reader task (ReportDecoder)            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each successful connect starts a new socket session with its own id. The
//! reader task and every registered operation carry that id, so a close that
//! arrives for a superseded session only fails that session's operations.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use md5::{Digest, Md5};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use livesync_core::prelude::*;

use super::operations::{OperationOutcome, PendingOperations};
use super::protocol::{
    self, create_file_header, delete_file_frame, device_relative_path, do_sync_frame, md5_digest,
    Handshake, Report, ReportDecoder,
};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);
pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Environment variable overriding the host the forwarded port is reached on
pub const LOCAL_HOST_ADDRESS_ENV: &str = "LIVESYNC_ADDRESS";
pub const DEFAULT_LOCAL_HOST_ADDRESS: &str = "127.0.0.1";

pub const SOCKET_END_MESSAGE: &str = "Socket connection ended before sync operation is complete.";
pub const SOCKET_CLOSED_MESSAGE: &str = "Socket closed from server before operation end.";

const READ_BUFFER_SIZE: usize = 16 * 1024;
const FILE_CHUNK_SIZE: usize = 64 * 1024;
const ERROR_CHANNEL_CAPACITY: usize = 16;
/// How long to wait for the app identifier once the version has arrived
const HANDSHAKE_IDENTIFIER_WAIT: Duration = Duration::from_millis(500);

/// Port forwarding and process queries the client needs from the device tooling
#[async_trait]
pub trait AndroidProcessService: Send + Sync {
    /// Forward a free local TCP port to `abstract_port` on the device and
    /// return the local port
    async fn forward_free_tcp_to_abstract_port(
        &self,
        device_identifier: &str,
        app_identifier: &str,
        abstract_port: &str,
    ) -> Result<u16>;

    /// Process id of the running app, `None` when it is not running
    async fn app_process_id(
        &self,
        device_identifier: &str,
        app_identifier: &str,
    ) -> Result<Option<String>>;
}

/// Connection parameters
#[derive(Debug, Clone, Default)]
pub struct LivesyncConfig {
    pub app_identifier: String,
    pub device_identifier: String,
    /// Root on the host that device paths are made relative to
    pub app_platforms_path: PathBuf,
    /// Overrides [`LOCAL_HOST_ADDRESS_ENV`]
    pub local_host_address: Option<String>,
    pub connect_timeout: Option<Duration>,
}

/// Options of a DO_SYNC request
#[derive(Debug, Clone)]
pub struct DoSyncOptions {
    pub do_refresh: bool,
    pub timeout: Duration,
    /// Caller-chosen id; generated when absent
    pub operation_id: Option<String>,
}

impl Default for DoSyncOptions {
    fn default() -> Self {
        Self {
            do_refresh: true,
            timeout: DEFAULT_OPERATION_TIMEOUT,
            operation_id: None,
        }
    }
}

/// Resolve the host from the explicit setting, the environment, or the default
pub fn resolve_local_host_address(explicit: Option<&str>) -> String {
    explicit
        .map(str::to_string)
        .filter(|h| !h.trim().is_empty())
        .or_else(|| {
            std::env::var(LOCAL_HOST_ADDRESS_ENV)
                .ok()
                .filter(|h| !h.trim().is_empty())
        })
        .unwrap_or_else(|| DEFAULT_LOCAL_HOST_ADDRESS.to_string())
}

type SharedWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

struct SocketSession {
    id: u64,
    protocol_version: String,
    app_identifier: String,
    writer: SharedWriter,
    reader: JoinHandle<()>,
}

#[derive(Default)]
struct ClientState {
    session: Option<SocketSession>,
    /// Last connection-level error of the active session; sends fail fast
    /// with it until the next connect
    socket_error: Option<TransportError>,
    config: Option<LivesyncConfig>,
}

struct Inner {
    process_service: Arc<dyn AndroidProcessService>,
    state: Mutex<ClientState>,
    operations: PendingOperations,
    next_session_id: AtomicU64,
    errors: broadcast::Sender<TransportError>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Close or error on a socket session
    fn handle_socket_error(&self, session_id: u64, error: TransportError) {
        let is_active = {
            let mut state = self.lock();
            let is_active = state.session.as_ref().map(|s| s.id) == Some(session_id);
            if is_active {
                state.socket_error = Some(error.clone());
            }
            is_active
        };

        if is_active {
            warn!("Live sync connection lost: {}", error);
            let _ = self.errors.send(error.clone());
            self.end(Some(error));
        } else {
            let rejected = self.operations.reject_session(session_id, error);
            if rejected > 0 {
                debug!(
                    "Rejected {} operation(s) of superseded session {}",
                    rejected, session_id
                );
            }
        }
    }

    fn end(&self, error: Option<TransportError>) {
        let error = error.unwrap_or_else(|| TransportError::closed(SOCKET_END_MESSAGE));
        let Some(session) = self.lock().session.take() else {
            return;
        };

        // The reader goes first so the forced close below does not come back
        // through handle_socket_error.
        session.reader.abort();
        drop(session.writer);

        let rejected = self.operations.reject_session(session.id, error);
        debug!(
            "Ended live sync session {} ({} pending operation(s) rejected)",
            session.id, rejected
        );
    }
}

/// Client for one device + app pair
#[derive(Clone)]
pub struct LivesyncClient {
    inner: Arc<Inner>,
}

impl LivesyncClient {
    pub fn new(process_service: Arc<dyn AndroidProcessService>) -> Self {
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                process_service,
                state: Mutex::new(ClientState::default()),
                operations: PendingOperations::new(),
                next_session_id: AtomicU64::new(1),
                errors,
            }),
        }
    }

    /// Connection-level errors of active sessions
    pub fn subscribe_errors(&self) -> broadcast::Receiver<TransportError> {
        self.inner.errors.subscribe()
    }

    /// Connect to the agent, retrying every second until the connect timeout
    pub async fn connect(&self, config: LivesyncConfig) -> Result<()> {
        if config.app_identifier.trim().is_empty() {
            return Err(Error::MissingConfiguration {
                property: "appIdentifier",
            });
        }
        if config.app_platforms_path.as_os_str().is_empty() {
            return Err(Error::MissingConfiguration {
                property: "appPlatformsPath",
            });
        }
        if self.has_connection() {
            return Err(TransportError::AlreadyConnected.into());
        }

        let abstract_port = format!("localabstract:{}-livesync", config.app_identifier);
        let port = self
            .inner
            .process_service
            .forward_free_tcp_to_abstract_port(
                &config.device_identifier,
                &config.app_identifier,
                &abstract_port,
            )
            .await?;
        let host = resolve_local_host_address(config.local_host_address.as_deref());
        let timeout = config.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);

        info!(
            "Connecting to live sync agent of {} on {} via {}:{}",
            config.app_identifier, config.device_identifier, host, port
        );

        let (stream, handshake) = self.connect_with_retry(&host, port, timeout, &config).await?;

        debug!(
            "Live sync handshake: protocol {} for {}",
            handshake.protocol_version, handshake.app_identifier
        );
        self.start_session(stream, handshake, config);
        Ok(())
    }

    async fn connect_with_retry(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
        config: &LivesyncConfig,
    ) -> Result<(TcpStream, Handshake)> {
        let deadline = Instant::now() + timeout;
        let mut last_error: Option<String> = None;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, connect_and_handshake(host, port)).await {
                Ok(Ok(connected)) => return Ok(connected),
                Ok(Err(e)) => {
                    trace!("Live sync connect attempt {} failed: {}", attempt, e);
                    last_error = Some(e.to_string());
                }
                Err(_) => {}
            }

            if Instant::now() + CONNECT_RETRY_INTERVAL >= deadline {
                break;
            }
            tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
        }

        Err(self.connect_timeout_error(config, last_error).await)
    }

    async fn connect_timeout_error(
        &self,
        config: &LivesyncConfig,
        last_error: Option<String>,
    ) -> Error {
        let process = self
            .inner
            .process_service
            .app_process_id(&config.device_identifier, &config.app_identifier)
            .await;

        match process {
            Ok(None) => {
                warn!(
                    "{} is not running on {}. Possible reasons: the app crashed on \
                     startup, the app identifier does not match the installed app, \
                     the device is locked, or the app was closed by the user.",
                    config.app_identifier, config.device_identifier
                );
                TransportError::AppNotRunning {
                    app_identifier: config.app_identifier.clone(),
                    device_identifier: config.device_identifier.clone(),
                }
                .into()
            }
            Ok(Some(pid)) => {
                debug!(
                    "{} is running (pid {}) but the live sync socket never answered",
                    config.app_identifier, pid
                );
                TransportError::ConnectTimeout { last_error }.into()
            }
            Err(e) => {
                warn!("Could not check whether the app is running: {}", e);
                TransportError::ConnectTimeout { last_error }.into()
            }
        }
    }

    fn start_session(&self, stream: TcpStream, handshake: Handshake, config: LivesyncConfig) {
        let (read_half, write_half) = stream.into_split();
        let session_id = self.inner.next_session_id.fetch_add(1, Ordering::SeqCst);

        let mut state = self.inner.lock();
        let reader = tokio::spawn(read_reports(
            Arc::downgrade(&self.inner),
            session_id,
            read_half,
        ));
        state.session = Some(SocketSession {
            id: session_id,
            protocol_version: handshake.protocol_version,
            app_identifier: handshake.app_identifier,
            writer: Arc::new(tokio::sync::Mutex::new(write_half)),
            reader,
        });
        state.socket_error = None;
        state.config = Some(config);
    }

    fn active_session(&self) -> Result<(u64, SharedWriter, PathBuf)> {
        let state = self.inner.lock();
        match (&state.session, &state.config) {
            (Some(session), Some(config)) => Ok((
                session.id,
                Arc::clone(&session.writer),
                config.app_platforms_path.clone(),
            )),
            _ => Err(state
                .socket_error
                .clone()
                .unwrap_or(TransportError::NotConnected)
                .into()),
        }
    }

    fn write_failed(&self, session_id: u64, error: std::io::Error) -> Error {
        let error = TransportError::socket(error.to_string());
        self.inner.handle_socket_error(session_id, error.clone());
        error.into()
    }

    /// Send one file, path relative to the platforms root
    pub async fn send_file(&self, path: &Path) -> Result<()> {
        let (session_id, writer, root) = self.active_session()?;
        let relative = device_relative_path(&root, path)?;

        let file = tokio::fs::File::open(path).await?;
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            )
            .into());
        }

        self.send_content(session_id, &writer, &relative, file, metadata.len(), path)
            .await
    }

    /// Write a CREATE_FILE frame streaming `content_length` bytes from `content`.
    ///
    /// Once the header is on the wire the agent expects the full content, so
    /// any failure after that point ends the session.
    async fn send_content<R: AsyncRead + Unpin>(
        &self,
        session_id: u64,
        writer: &SharedWriter,
        relative: &str,
        mut content: R,
        content_length: u64,
        source: &Path,
    ) -> Result<()> {
        let header = create_file_header(relative, content_length)?;

        trace!("CREATE_FILE {} ({} bytes)", relative, content_length);

        let mut socket = writer.lock().await;
        write_with_digest(&mut socket, &header)
            .await
            .map_err(|e| self.write_failed(session_id, e))?;

        let mut hasher = Md5::new();
        let mut remaining = content_length;
        let mut chunk = vec![0u8; FILE_CHUNK_SIZE];
        while remaining > 0 {
            let want = remaining.min(FILE_CHUNK_SIZE as u64) as usize;
            let read = match content.read(&mut chunk[..want]).await {
                Ok(0) => Err(format!(
                    "{} shrank while it was being sent",
                    source.display()
                )),
                Ok(read) => Ok(read),
                Err(e) => Err(format!("Failed to read {}: {}", source.display(), e)),
            };
            let read = match read {
                Ok(read) => read,
                Err(message) => {
                    drop(socket);
                    let error = TransportError::socket(message);
                    self.inner.handle_socket_error(session_id, error.clone());
                    return Err(error.into());
                }
            };
            hasher.update(&chunk[..read]);
            socket
                .write_all(&chunk[..read])
                .await
                .map_err(|e| self.write_failed(session_id, e))?;
            remaining -= read as u64;
        }

        socket
            .write_all(&hasher.finalize())
            .await
            .map_err(|e| self.write_failed(session_id, e))?;
        Ok(())
    }

    /// Send files one after another, preserving order on the wire
    pub async fn send_files(&self, paths: &[PathBuf]) -> Result<()> {
        for path in paths {
            self.send_file(path).await?;
        }
        Ok(())
    }

    /// Send every regular file under `dir`, recursively, in sorted order
    pub async fn send_directory(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let files = collect_files(dir)?;
        debug!("Sending {} file(s) from {}", files.len(), dir.display());
        self.send_files(&files).await?;
        Ok(files)
    }

    pub async fn remove_file(&self, path: &Path) -> Result<()> {
        let (session_id, writer, root) = self.active_session()?;
        let relative = device_relative_path(&root, path)?;
        let frame = delete_file_frame(&relative)?;

        trace!("DELETE_FILE {}", relative);

        let mut socket = writer.lock().await;
        write_with_digest(&mut socket, &frame)
            .await
            .map_err(|e| self.write_failed(session_id, e))
    }

    pub async fn remove_files(&self, paths: &[PathBuf]) -> Result<()> {
        for path in paths {
            self.remove_file(path).await?;
        }
        Ok(())
    }

    /// Ask the agent to apply the transferred files.
    ///
    /// Settles on the matching end report, on session teardown, or when
    /// `options.timeout` elapses (which fails only this operation).
    pub async fn send_do_sync_operation(&self, options: DoSyncOptions) -> Result<OperationOutcome> {
        let operation_id = options
            .operation_id
            .unwrap_or_else(protocol::generate_operation_id);
        let frame = do_sync_frame(&operation_id, options.do_refresh)?;
        let (session_id, writer, _) = self.active_session()?;

        let settled = self.inner.operations.register(
            &operation_id,
            session_id,
            options.do_refresh,
            options.timeout,
        )?;

        trace!("DO_SYNC {} (refresh: {})", operation_id, options.do_refresh);

        {
            let mut socket = writer.lock().await;
            if let Err(e) = write_with_digest(&mut socket, &frame).await {
                drop(socket);
                let _ = self.write_failed(session_id, e);
            }
        }

        match settled.await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransportError::closed(SOCKET_END_MESSAGE).into()),
        }
    }

    /// Tear down the active session, failing its pending operations with
    /// `error` (or the default end message)
    pub fn end(&self, error: Option<TransportError>) {
        self.inner.end(error);
    }

    pub fn is_operation_in_progress(&self, operation_id: &str) -> bool {
        self.inner.operations.is_in_progress(operation_id)
    }

    pub fn has_connection(&self) -> bool {
        self.inner.lock().session.is_some()
    }

    /// Protocol version announced in the handshake of the active session
    pub fn protocol_version(&self) -> Option<String> {
        self.inner
            .lock()
            .session
            .as_ref()
            .map(|s| s.protocol_version.clone())
    }

    /// App identifier announced in the handshake of the active session
    pub fn app_identifier(&self) -> Option<String> {
        self.inner
            .lock()
            .session
            .as_ref()
            .map(|s| s.app_identifier.clone())
    }

    pub fn generate_operation_identifier(&self) -> String {
        protocol::generate_operation_id()
    }
}

/// Connect and read the agent's greeting.
///
/// The version is length-prefixed but the app identifier simply runs to the
/// end of the greeting, so reading stops at the first segment that carries
/// identifier bytes. An identifier split across later segments is truncated.
async fn connect_and_handshake(host: &str, port: u16) -> std::io::Result<(TcpStream, Handshake)> {
    let mut stream = match host.parse::<IpAddr>() {
        Ok(ip) => TcpStream::connect((ip, port)).await?,
        Err(_) => TcpStream::connect((host, port)).await?,
    };

    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let version_complete = matches!(
            Handshake::required_len(&received),
            Some(required) if received.len() >= required
        );
        let n = if version_complete {
            match tokio::time::timeout(HANDSHAKE_IDENTIFIER_WAIT, stream.read(&mut buf)).await {
                Ok(read) => read?,
                Err(_) => {
                    debug!("Agent greeting carried no app identifier");
                    break;
                }
            }
        } else {
            stream.read(&mut buf).await?
        };
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before handshake",
            ));
        }
        received.extend_from_slice(&buf[..n]);
        if matches!(Handshake::required_len(&received), Some(required) if received.len() > required)
        {
            break;
        }
    }

    let handshake = Handshake::parse(&received)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    Ok((stream, handshake))
}

async fn write_with_digest(socket: &mut OwnedWriteHalf, bytes: &[u8]) -> std::io::Result<()> {
    socket.write_all(bytes).await?;
    socket.write_all(&md5_digest(bytes)).await
}

async fn read_reports(inner: Weak<Inner>, session_id: u64, mut socket: OwnedReadHalf) {
    let mut decoder = ReportDecoder::default();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let read = socket.read(&mut buf).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };

        match read {
            Ok(0) => {
                inner.handle_socket_error(session_id, TransportError::closed(SOCKET_CLOSED_MESSAGE));
                return;
            }
            Ok(n) => {
                decoder.push(&buf[..n]);
                while let Some(report) = decoder.next_report() {
                    match report {
                        Ok(Report::OperationEnd {
                            operation_id,
                            did_refresh,
                        }) => {
                            if !inner.operations.resolve(&operation_id, did_refresh) {
                                debug!("End report for unknown operation {}", operation_id);
                            }
                        }
                        Ok(Report::Error(message)) => {
                            inner.handle_socket_error(session_id, TransportError::device(message));
                            return;
                        }
                        Err(e) => warn!("Ignoring live sync report: {}", e),
                    }
                }
            }
            Err(e) => {
                inner.handle_socket_error(session_id, TransportError::socket(e.to_string()));
                return;
            }
        }
    }
}

/// Regular files under `dir`, recursively, sorted by path
pub fn collect_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    collect_files_recursive(dir, &mut files)?;
    files.sort();
    Ok(files)
}

fn collect_files_recursive(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();
        if file_type.is_dir() {
            collect_files_recursive(&path, files)?;
        } else if file_type.is_file() {
            files.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::protocol::DIGEST_LENGTH;
    use crate::test_utils::{FakeProcessService, MockDeviceAgent, ReceivedFrame, ReplyMode};
    use serial_test::serial;
    use tempfile::TempDir;

    const APP_ID: &str = "org.example.app";

    async fn connected_client(agent: &MockDeviceAgent, root: &Path) -> LivesyncClient {
        let client = LivesyncClient::new(Arc::new(FakeProcessService::new(agent.port())));
        client
            .connect(LivesyncConfig {
                app_identifier: APP_ID.into(),
                device_identifier: "emulator-5554".into(),
                app_platforms_path: root.to_path_buf(),
                local_host_address: Some("127.0.0.1".into()),
                connect_timeout: Some(Duration::from_secs(5)),
            })
            .await
            .unwrap();
        client
    }

    fn write_file(root: &Path, relative: &str, content: &[u8]) -> PathBuf {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_connect_reads_handshake() {
        let agent = MockDeviceAgent::start("0.2.0", APP_ID).await;
        let dir = TempDir::new().unwrap();
        let client = connected_client(&agent, dir.path()).await;

        assert!(client.has_connection());
        assert_eq!(client.protocol_version().as_deref(), Some("0.2.0"));
        assert_eq!(client.app_identifier().as_deref(), Some(APP_ID));
    }

    async fn split_greeting_agent(segments: Vec<&'static [u8]>) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            for segment in segments {
                socket.write_all(segment).await.unwrap();
                socket.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            // Hold the connection open until the client is done
            let mut rest = Vec::new();
            let _ = socket.read_to_end(&mut rest).await;
        });
        port
    }

    #[tokio::test]
    async fn test_handshake_waits_for_identifier_segment() {
        let port = split_greeting_agent(vec![&b"\x050.2.0"[..], &b"org.example.app"[..]]).await;

        let (_stream, handshake) = connect_and_handshake("127.0.0.1", port).await.unwrap();
        assert_eq!(handshake.protocol_version, "0.2.0");
        assert_eq!(handshake.app_identifier, APP_ID);
    }

    #[tokio::test]
    async fn test_handshake_without_identifier() {
        let port = split_greeting_agent(vec![&b"\x050.1.0"[..]]).await;

        let (_stream, handshake) = connect_and_handshake("127.0.0.1", port).await.unwrap();
        assert_eq!(handshake.protocol_version, "0.1.0");
        assert_eq!(handshake.app_identifier, "");
    }

    #[tokio::test]
    async fn test_connect_requires_configuration() {
        let client = LivesyncClient::new(Arc::new(FakeProcessService::new(1)));
        let err = client
            .connect(LivesyncConfig {
                app_platforms_path: PathBuf::from("/tmp"),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::MissingConfiguration {
                property: "appIdentifier"
            }
        ));

        let err = client
            .connect(LivesyncConfig {
                app_identifier: APP_ID.into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::MissingConfiguration {
                property: "appPlatformsPath"
            }
        ));
    }

    #[tokio::test]
    async fn test_second_connect_is_refused() {
        let agent = MockDeviceAgent::start("0.2.0", APP_ID).await;
        let dir = TempDir::new().unwrap();
        let client = connected_client(&agent, dir.path()).await;

        let err = client
            .connect(LivesyncConfig {
                app_identifier: APP_ID.into(),
                device_identifier: "emulator-5554".into(),
                app_platforms_path: dir.path().to_path_buf(),
                local_host_address: Some("127.0.0.1".into()),
                connect_timeout: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Transport(TransportError::AlreadyConnected)
        ));
    }

    #[tokio::test]
    async fn test_forwards_to_app_specific_abstract_socket() {
        let agent = MockDeviceAgent::start("0.2.0", APP_ID).await;
        let dir = TempDir::new().unwrap();
        let service = Arc::new(FakeProcessService::new(agent.port()));
        let client = LivesyncClient::new(service.clone());
        client
            .connect(LivesyncConfig {
                app_identifier: APP_ID.into(),
                device_identifier: "emulator-5554".into(),
                app_platforms_path: dir.path().to_path_buf(),
                local_host_address: Some("127.0.0.1".into()),
                connect_timeout: Some(Duration::from_secs(5)),
            })
            .await
            .unwrap();

        assert_eq!(
            service.forwarded_ports(),
            vec!["localabstract:org.example.app-livesync".to_string()]
        );
    }

    #[tokio::test]
    async fn test_send_file_frame_layout() {
        let agent = MockDeviceAgent::start("0.2.0", APP_ID).await;
        let dir = TempDir::new().unwrap();
        let content = [7u8; 42];
        let path = write_file(dir.path(), "app/main.js", &content);
        let client = connected_client(&agent, dir.path()).await;

        client.send_file(&path).await.unwrap();
        let frames = agent
            .wait_for_frames(1, Duration::from_secs(5))
            .await;
        assert_eq!(
            frames,
            vec![ReceivedFrame::CreateFile {
                path: "app/main.js".into(),
                content: content.to_vec(),
            }]
        );

        let raw = agent.raw_bytes();
        let header = create_file_header("app/main.js", 42).unwrap();
        assert_eq!(&raw[..header.len()], header.as_slice());
        // content-length field literally encodes "42"
        assert_eq!(&header[header.len() - 3..], &[2, b'4', b'2']);

        let header_digest = &raw[header.len()..header.len() + DIGEST_LENGTH];
        assert_eq!(header_digest, md5_digest(&header));

        let content_start = header.len() + DIGEST_LENGTH;
        assert_eq!(&raw[content_start..content_start + 42], &content);
        assert_eq!(
            &raw[content_start + 42..],
            md5_digest(&content).as_slice()
        );
    }

    #[tokio::test]
    async fn test_send_directory_in_sorted_order_then_do_sync() {
        let agent = MockDeviceAgent::start("0.2.0", APP_ID).await;
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "app/b.js", b"b");
        write_file(dir.path(), "app/a.js", b"a");
        write_file(dir.path(), "app/views/main.xml", b"<Page/>");
        let client = connected_client(&agent, dir.path()).await;

        let sent = client.send_directory(&dir.path().join("app")).await.unwrap();
        assert_eq!(sent.len(), 3);

        let outcome = client
            .send_do_sync_operation(DoSyncOptions::default())
            .await
            .unwrap();
        assert!(outcome.did_refresh);

        let paths: Vec<String> = agent
            .frames()
            .into_iter()
            .filter_map(|f| match f {
                ReceivedFrame::CreateFile { path, .. } => Some(path),
                _ => None,
            })
            .collect();
        assert_eq!(paths, vec!["app/a.js", "app/b.js", "app/views/main.xml"]);
    }

    #[tokio::test]
    async fn test_send_file_rejects_directory_before_writing() {
        let agent = MockDeviceAgent::start("0.2.0", APP_ID).await;
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("app/views")).unwrap();
        let path = write_file(dir.path(), "app/main.js", b"main");
        let client = connected_client(&agent, dir.path()).await;

        assert!(client.send_file(&dir.path().join("app/views")).await.is_err());
        assert!(client.has_connection());

        client.send_file(&path).await.unwrap();
        let frames = agent.wait_for_frames(1, Duration::from_secs(5)).await;
        assert_eq!(
            frames,
            vec![ReceivedFrame::CreateFile {
                path: "app/main.js".into(),
                content: b"main".to_vec(),
            }]
        );
    }

    #[tokio::test]
    async fn test_read_failure_after_header_ends_session() {
        let agent = MockDeviceAgent::start("0.2.0", APP_ID).await;
        let dir = TempDir::new().unwrap();
        let client = connected_client(&agent, dir.path()).await;
        let mut errors = client.subscribe_errors();

        let content = tokio_test::io::Builder::new()
            .read(b"abc")
            .read_error(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk went away",
            ))
            .build();
        let (session_id, writer, _) = client.active_session().unwrap();
        let err = client
            .send_content(
                session_id,
                &writer,
                "app/main.js",
                content,
                10,
                Path::new("app/main.js"),
            )
            .await
            .unwrap_err();
        drop(writer);

        assert!(matches!(
            err,
            Error::Transport(TransportError::Socket { ref message }) if message.contains("disk went away")
        ));
        assert!(!client.has_connection());
        assert!(errors.recv().await.is_ok());

        let err = client.send_file(&write_file(dir.path(), "app/a.js", b"a")).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_remove_file_sends_delete_frame() {
        let agent = MockDeviceAgent::start("0.2.0", APP_ID).await;
        let dir = TempDir::new().unwrap();
        let client = connected_client(&agent, dir.path()).await;

        client
            .remove_files(&[dir.path().join("app").join("old.css")])
            .await
            .unwrap();

        let frames = agent.wait_for_frames(1, Duration::from_secs(5)).await;
        assert_eq!(
            frames,
            vec![ReceivedFrame::DeleteFile {
                path: "app/old.css".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_do_sync_no_refresh_report() {
        let agent = MockDeviceAgent::start("0.2.0", APP_ID).await;
        agent.set_reply_mode(ReplyMode::NoRefresh);
        let dir = TempDir::new().unwrap();
        let client = connected_client(&agent, dir.path()).await;

        let id = client.generate_operation_identifier();
        let outcome = client
            .send_do_sync_operation(DoSyncOptions {
                do_refresh: false,
                operation_id: Some(id.clone()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(outcome.operation_id, id);
        assert!(!outcome.did_refresh);
        assert!(!outcome.requested_refresh);
        assert!(!client.is_operation_in_progress(&id));
    }

    #[tokio::test]
    async fn test_do_sync_timeout_keeps_connection() {
        let agent = MockDeviceAgent::start("0.2.0", APP_ID).await;
        agent.set_reply_mode(ReplyMode::Silent);
        let dir = TempDir::new().unwrap();
        let client = connected_client(&agent, dir.path()).await;

        let err = client
            .send_do_sync_operation(DoSyncOptions {
                timeout: Duration::from_millis(50),
                ..Default::default()
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Transport(TransportError::OperationTimeout { .. })
        ));
        assert!(client.has_connection());
    }

    #[tokio::test]
    async fn test_end_rejects_pending_operations() {
        let agent = MockDeviceAgent::start("0.2.0", APP_ID).await;
        agent.set_reply_mode(ReplyMode::Silent);
        let dir = TempDir::new().unwrap();
        let client = connected_client(&agent, dir.path()).await;

        let ids: Vec<String> = (0..3).map(|_| client.generate_operation_identifier()).collect();
        let mut waiters = Vec::new();
        for id in &ids {
            let client = client.clone();
            let id = id.clone();
            waiters.push(tokio::spawn(async move {
                client
                    .send_do_sync_operation(DoSyncOptions {
                        operation_id: Some(id),
                        ..Default::default()
                    })
                    .await
            }));
        }

        agent.wait_for_frames(3, Duration::from_secs(5)).await;
        for id in &ids {
            assert!(client.is_operation_in_progress(id));
        }

        let error = TransportError::closed("device detached");
        client.end(Some(error.clone()));

        for id in &ids {
            assert!(!client.is_operation_in_progress(id));
        }
        for waiter in waiters {
            let err = waiter.await.unwrap().unwrap_err();
            assert!(matches!(err, Error::Transport(ref e) if *e == error));
        }
        assert!(!client.has_connection());
    }

    #[tokio::test]
    async fn test_end_without_error_uses_default_message() {
        let agent = MockDeviceAgent::start("0.2.0", APP_ID).await;
        agent.set_reply_mode(ReplyMode::Silent);
        let dir = TempDir::new().unwrap();
        let client = connected_client(&agent, dir.path()).await;

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.send_do_sync_operation(DoSyncOptions::default()).await })
        };
        agent.wait_for_frames(1, Duration::from_secs(5)).await;
        client.end(None);

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), SOCKET_END_MESSAGE);
    }

    #[tokio::test]
    async fn test_error_report_fails_connection() {
        let agent = MockDeviceAgent::start("0.2.0", APP_ID).await;
        agent.set_reply_mode(ReplyMode::Error("Unable to apply changes".into()));
        let dir = TempDir::new().unwrap();
        let client = connected_client(&agent, dir.path()).await;
        let mut errors = client.subscribe_errors();

        let err = client
            .send_do_sync_operation(DoSyncOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Unable to apply changes");
        assert!(!client.has_connection());

        let published = errors.recv().await.unwrap();
        assert_eq!(published, TransportError::device("Unable to apply changes"));

        // later sends fail fast with the recorded error
        let err = client
            .remove_file(&dir.path().join("app/a.js"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Unable to apply changes");
    }

    #[tokio::test]
    async fn test_server_close_rejects_pending() {
        let agent = MockDeviceAgent::start("0.2.0", APP_ID).await;
        agent.set_reply_mode(ReplyMode::Disconnect);
        let dir = TempDir::new().unwrap();
        let client = connected_client(&agent, dir.path()).await;

        let err = client
            .send_do_sync_operation(DoSyncOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), SOCKET_CLOSED_MESSAGE);
        assert!(!client.has_connection());
    }

    #[tokio::test]
    async fn test_reconnect_after_end() {
        let agent = MockDeviceAgent::start("0.2.0", APP_ID).await;
        let dir = TempDir::new().unwrap();
        let client = connected_client(&agent, dir.path()).await;
        client.end(None);
        assert!(!client.has_connection());

        client
            .connect(LivesyncConfig {
                app_identifier: APP_ID.into(),
                device_identifier: "emulator-5554".into(),
                app_platforms_path: dir.path().to_path_buf(),
                local_host_address: Some("127.0.0.1".into()),
                connect_timeout: Some(Duration::from_secs(5)),
            })
            .await
            .unwrap();
        assert!(client.has_connection());
        assert!(client
            .send_do_sync_operation(DoSyncOptions::default())
            .await
            .is_ok());
        assert_eq!(agent.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let client = LivesyncClient::new(Arc::new(FakeProcessService::new(1)));
        let err = client
            .send_do_sync_operation(DoSyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::NotConnected)));
    }

    async fn closed_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn test_connect_timeout_app_not_running() {
        let service = Arc::new(FakeProcessService::new(closed_port().await));
        service.set_process_id(None);
        let client = LivesyncClient::new(service);

        let err = client
            .connect(LivesyncConfig {
                app_identifier: APP_ID.into(),
                device_identifier: "emulator-5554".into(),
                app_platforms_path: PathBuf::from("/tmp"),
                local_host_address: Some("127.0.0.1".into()),
                connect_timeout: Some(Duration::from_millis(1500)),
            })
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains(APP_ID));
        assert!(message.contains("emulator-5554"));
        assert!(!message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_connect_timeout_app_running() {
        let service = Arc::new(FakeProcessService::new(closed_port().await));
        service.set_process_id(Some("4242".into()));
        let client = LivesyncClient::new(service);

        let err = client
            .connect(LivesyncConfig {
                app_identifier: APP_ID.into(),
                device_identifier: "emulator-5554".into(),
                app_platforms_path: PathBuf::from("/tmp"),
                local_host_address: Some("127.0.0.1".into()),
                connect_timeout: Some(Duration::from_millis(1500)),
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Transport(TransportError::ConnectTimeout { .. })
        ));
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    #[serial]
    fn test_resolve_local_host_address() {
        std::env::remove_var(LOCAL_HOST_ADDRESS_ENV);
        assert_eq!(resolve_local_host_address(None), DEFAULT_LOCAL_HOST_ADDRESS);

        std::env::set_var(LOCAL_HOST_ADDRESS_ENV, "10.0.2.2");
        assert_eq!(resolve_local_host_address(None), "10.0.2.2");
        assert_eq!(resolve_local_host_address(Some("192.168.1.5")), "192.168.1.5");
        std::env::remove_var(LOCAL_HOST_ADDRESS_ENV);
    }
}

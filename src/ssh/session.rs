use crate::config::ConnectionProfile;
use crate::error::{AppError, AppResult};
use crate::events::EventSink;
use crate::logging::{self, LogLevel, LogSubsystem};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

/// Default terminal size requested with the PTY
pub const DEFAULT_COLS: u32 = 80;
pub const DEFAULT_ROWS: u32 = 24;

const MAX_PENDING_BYTES: usize = 256 * 1024; // 256KB write buffer
const COMMAND_QUEUE: usize = 1024;

/// How the shell transport authenticates
#[derive(Clone)]
pub enum ShellAuth {
    Key {
        private_key: String,
        passphrase: Option<String>,
    },
    Password(String),
    Agent,
}

impl std::fmt::Debug for ShellAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShellAuth::Key { .. } => write!(f, "Key"),
            ShellAuth::Password(_) => write!(f, "Password"),
            ShellAuth::Agent => write!(f, "Agent"),
        }
    }
}

/// Transport parameters for one shell session
#[derive(Debug, Clone)]
pub struct ShellParams {
    pub profile_id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: ShellAuth,
    pub cols: u32,
    pub rows: u32,
}

impl ShellParams {
    /// Build parameters from a profile. A private key wins over a password;
    /// with neither the SSH agent is used.
    pub fn from_profile(profile: &ConnectionProfile, default_port: u16) -> AppResult<Self> {
        if profile.host.trim().is_empty() {
            return Err(AppError::Validation("Host is required".to_string()));
        }
        let username = profile
            .username()
            .ok_or_else(|| AppError::Validation(format!("{} has no username", profile.name)))?;

        let auth = match (profile.private_key(), profile.password()) {
            (Some(key), passphrase) => ShellAuth::Key {
                private_key: key.to_string(),
                // a password stored next to a key unlocks the key
                passphrase: passphrase.map(str::to_string),
            },
            (None, Some(password)) => ShellAuth::Password(password.to_string()),
            (None, None) => ShellAuth::Agent,
        };

        Ok(Self {
            profile_id: profile.id.clone(),
            host: profile.host.trim().to_string(),
            port: profile.port.unwrap_or(default_port),
            username: username.to_string(),
            auth,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        })
    }
}

/// An open interactive channel with a PTY.
///
/// `read` must not block: it returns `WouldBlock` when nothing is pending.
pub trait ShellChannel: Send {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
    fn write_all(&mut self, data: &[u8]) -> AppResult<()>;
    fn resize(&mut self, cols: u32, rows: u32) -> AppResult<()>;
    fn eof(&self) -> bool;
    fn keepalive(&mut self) -> AppResult<()> {
        Ok(())
    }
    /// Release the channel and the transport under it
    fn close(&mut self);
}

/// Opens transports and interactive channels.
pub trait ShellConnector: Send + Sync {
    fn open(&self, params: &ShellParams) -> AppResult<Box<dyn ShellChannel>>;
}

/// Lifecycle of a shell bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellState {
    Idle,
    Connecting,
    Ready,
    Streaming,
    Closed,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub profile_id: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub state: ShellState,
    pub connected_at: Option<i64>,
}

/// Consumer of inbound channel bytes
pub type DataCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

enum ShellCommand {
    Write(Vec<u8>),
    Resize(u32, u32),
    Close,
}

struct ActiveSession {
    generation: u64,
    params: ShellParams,
    connected_at: i64,
    tx: mpsc::Sender<ShellCommand>,
    worker: Option<JoinHandle<()>>,
}

/// State shared between the bridge and its I/O worker
struct Shared {
    profile_id: String,
    state: RwLock<ShellState>,
    generation: AtomicU64,
    on_data: RwLock<Option<DataCallback>>,
    events: Arc<dyn EventSink>,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn set_state(&self, state: ShellState, message: Option<&str>) {
        *self.state.write() = state;
        let mut payload = json!({ "profileId": self.profile_id, "state": state });
        if let Some(message) = message {
            payload["message"] = json!(message);
        }
        self.events.emit("shell:state", payload);
    }

    /// Apply a worker-side transition only if the worker still owns the bridge
    fn set_state_if_current(&self, generation: u64, state: ShellState, message: Option<&str>) {
        if self.is_current(generation) {
            self.set_state(state, message);
        }
    }
}

/// One interactive shell at a time.
///
/// `connect` tears down any running session (channel closed, worker
/// joined) before the new transport is opened. Every session gets a
/// generation number and its worker only delivers data while that
/// generation is current, so a callback never sees bytes from a session
/// that has been replaced.
pub struct ShellBridge {
    shared: Arc<Shared>,
    connector: Arc<dyn ShellConnector>,
    keepalive_interval: Duration,
    active: Mutex<Option<ActiveSession>>,
    /// Serializes `connect` calls
    connecting: Mutex<()>,
}

impl ShellBridge {
    pub fn new(
        profile_id: impl Into<String>,
        connector: Arc<dyn ShellConnector>,
        events: Arc<dyn EventSink>,
        keepalive_interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                profile_id: profile_id.into(),
                state: RwLock::new(ShellState::Idle),
                generation: AtomicU64::new(0),
                on_data: RwLock::new(None),
                events,
            }),
            connector,
            keepalive_interval,
            active: Mutex::new(None),
            connecting: Mutex::new(()),
        }
    }

    pub fn state(&self) -> ShellState {
        *self.shared.state.read()
    }

    pub fn is_open(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Register the consumer of inbound bytes, replacing any previous one
    pub fn set_on_data(&self, callback: DataCallback) {
        *self.shared.on_data.write() = Some(callback);
    }

    pub fn info(&self) -> SessionInfo {
        let active = self.active.lock();
        SessionInfo {
            profile_id: self.shared.profile_id.clone(),
            host: active.as_ref().map(|a| a.params.host.clone()),
            port: active.as_ref().map(|a| a.params.port),
            username: active.as_ref().map(|a| a.params.username.clone()),
            state: self.state(),
            connected_at: active.as_ref().map(|a| a.connected_at),
        }
    }

    /// Open a new session, closing the current one first.
    ///
    /// Blocks for the duration of the transport handshake.
    pub fn connect(&self, params: ShellParams) -> AppResult<()> {
        let _connecting = self.connecting.lock();

        // `active` is never held across the join or the handshake: the old
        // worker may be inside the data callback calling back into us.
        let previous = self.active.lock().take();
        if let Some(previous) = previous {
            self.teardown(previous);
            self.shared.set_state(ShellState::Closed, Some("replaced by a new connection"));
        }

        self.shared.set_state(ShellState::Connecting, None);
        tracing::info!(
            "Connecting to {}@{}:{} (profile {})",
            params.username,
            params.host,
            params.port,
            self.shared.profile_id
        );

        let channel = match self.connector.open(&params) {
            Ok(channel) => channel,
            Err(e) => {
                let message = logging::sanitize(&e.to_string());
                tracing::error!("SSH connection failed for profile {}", self.shared.profile_id);
                logging::log_session(
                    LogLevel::Error,
                    LogSubsystem::Shell,
                    &self.shared.profile_id,
                    format!("Connection to {} failed: {}", params.host, message),
                );
                self.shared.set_state(ShellState::Error, Some(&message));
                return Err(e);
            }
        };

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel::<ShellCommand>(COMMAND_QUEUE);
        self.shared.set_state(ShellState::Ready, None);

        let shared = self.shared.clone();
        let keepalive = self.keepalive_interval;
        let worker = thread::Builder::new()
            .name(format!("shell-{}", generation))
            .spawn(move || run_io_loop(channel, rx, shared, generation, keepalive))
            .map_err(|e| {
                self.shared.set_state(ShellState::Error, Some("failed to start I/O worker"));
                AppError::Ssh(format!("Failed to start I/O worker: {}", e))
            })?;

        logging::log_session(
            LogLevel::Info,
            LogSubsystem::Shell,
            &self.shared.profile_id,
            format!("Connected to {}@{}:{}", params.username, params.host, params.port),
        );

        *self.active.lock() = Some(ActiveSession {
            generation,
            params,
            connected_at: chrono::Utc::now().timestamp(),
            tx,
            worker: Some(worker),
        });
        Ok(())
    }

    /// Forward bytes to the channel; does nothing when no session is open
    pub fn send(&self, data: &[u8]) -> AppResult<()> {
        let active = self.active.lock();
        let Some(session) = active.as_ref() else {
            return Ok(());
        };
        match session.tx.try_send(ShellCommand::Write(data.to_vec())) {
            Ok(_) => Ok(()),
            Err(TrySendError::Full(_)) => Err(AppError::Ssh("Output queue full".to_string())),
            // worker already gone; the session is on its way out
            Err(TrySendError::Closed(_)) => Ok(()),
        }
    }

    /// Forward a window size change; does nothing when no session is open
    pub fn resize(&self, cols: u32, rows: u32) -> AppResult<()> {
        if let Some(session) = self.active.lock().as_ref() {
            let _ = session.tx.try_send(ShellCommand::Resize(cols, rows));
        }
        Ok(())
    }

    /// Release the channel and transport
    pub fn close(&self) {
        let previous = self.active.lock().take();
        if let Some(previous) = previous {
            self.teardown(previous);
            self.shared.set_state(ShellState::Closed, None);
            logging::log_session(LogLevel::Info, LogSubsystem::Shell, &self.shared.profile_id, "Session closed");
        }
    }

    fn teardown(&self, mut session: ActiveSession) {
        // Retire the generation first so the worker stops delivering at once.
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        let _ = session.tx.try_send(ShellCommand::Close);
        drop(session.tx);

        if let Some(worker) = session.worker.take() {
            if worker.thread().id() != thread::current().id() {
                if worker.join().is_err() {
                    tracing::warn!("Shell worker {} panicked", session.generation);
                }
            }
        }
        tracing::debug!("Session generation {} torn down", session.generation);
    }
}

impl Drop for ShellBridge {
    fn drop(&mut self) {
        self.close();
    }
}

/// I/O loop for one session; owns the channel until it exits
fn run_io_loop(
    mut channel: Box<dyn ShellChannel>,
    mut rx: mpsc::Receiver<ShellCommand>,
    shared: Arc<Shared>,
    generation: u64,
    keepalive_interval: Duration,
) {
    let mut read_buf = [0u8; 32768];
    let mut pending: Vec<u8> = Vec::new();
    let mut last_keepalive = Instant::now();
    let mut streaming = false;
    let mut failure: Option<String> = None;

    'io: loop {
        if !keepalive_interval.is_zero() && last_keepalive.elapsed() >= keepalive_interval {
            if let Err(e) = channel.keepalive() {
                tracing::warn!("Keepalive failed (generation {}): {}", generation, e);
            }
            last_keepalive = Instant::now();
        }

        for _ in 0..32 {
            match rx.try_recv() {
                Ok(ShellCommand::Write(data)) => {
                    if pending.len() + data.len() > MAX_PENDING_BYTES {
                        tracing::warn!("Dropping {} bytes, write buffer full", data.len());
                        continue;
                    }
                    pending.extend_from_slice(&data);
                }
                Ok(ShellCommand::Resize(cols, rows)) => {
                    if let Err(e) = channel.resize(cols, rows) {
                        tracing::warn!("Failed to resize PTY: {}", e);
                    }
                }
                Ok(ShellCommand::Close) | Err(TryRecvError::Disconnected) => break 'io,
                Err(TryRecvError::Empty) => break,
            }
        }

        loop {
            match channel.read(&mut read_buf) {
                Ok(0) => break,
                Ok(n) => {
                    if !shared.is_current(generation) {
                        break 'io;
                    }
                    if !streaming {
                        streaming = true;
                        shared.set_state_if_current(generation, ShellState::Streaming, None);
                    }
                    let callback = shared.on_data.read().clone();
                    if let Some(callback) = callback {
                        callback(&read_buf[..n]);
                    }
                }
                Err(ref e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    if channel.eof() {
                        break 'io;
                    }
                    failure = Some(e.to_string());
                    break 'io;
                }
            }
        }

        if !pending.is_empty() {
            if let Err(e) = channel.write_all(&pending) {
                failure = Some(e.to_string());
                break 'io;
            }
            pending.clear();
        }

        if channel.eof() {
            tracing::info!("Remote closed the channel (generation {})", generation);
            break;
        }

        thread::sleep(Duration::from_millis(2));
    }

    channel.close();

    match failure {
        // Error is only reachable before the first byte arrives.
        Some(message) if !streaming => {
            shared.set_state_if_current(generation, ShellState::Error, Some(&message));
        }
        Some(message) => {
            tracing::warn!("Session ended with error: {}", message);
            shared.set_state_if_current(generation, ShellState::Closed, Some(&message));
        }
        None => shared.set_state_if_current(generation, ShellState::Closed, None),
    }
}

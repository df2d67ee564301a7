pub mod commands;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// Maximum lines to keep in memory ring buffer
const MAX_RING_BUFFER_LINES: usize = 10_000;

/// Maximum line length before truncation
const MAX_LINE_LENGTH: usize = 2048;

/// Maximum log file size before rotation (5 MB)
const MAX_LOG_FILE_SIZE: u64 = 5 * 1024 * 1024;

/// Sensitive patterns to redact
static SENSITIVE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // SSH private key blocks
        r"(?s)-----BEGIN[^-]*PRIVATE KEY-----.*?-----END[^-]*PRIVATE KEY-----",
        // Proxmox auth cookie and CSRF header
        r"PVEAuthCookie=[^\s;,]+",
        r#"(?i)CSRFPreventionToken['"]?\s*[:=]\s*['"]?[^\s'",}]+"#,
        // PVE tickets have a recognizable prefix
        r"PVE(VNC)?:[A-Za-z0-9@._-]+:[0-9A-F]{8}::[A-Za-z0-9+/=]+",
        // Generic secrets by key name (key=value patterns)
        r#"(?i)(password|passwd|pwd|secret|token|ticket|passphrase|private[_-]?key)\s*[:=]\s*["']?[^\s"']+["']?"#,
        // Long base64 runs
        r"[A-Za-z0-9+/]{64,}={0,2}",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Sanitize a string by removing sensitive information
pub fn sanitize(input: &str) -> String {
    let mut result = input.to_string();

    for pattern in SENSITIVE_PATTERNS.iter() {
        result = pattern.replace_all(&result, "[REDACTED]").to_string();
    }

    if result.len() > MAX_LINE_LENGTH {
        let mut cut = MAX_LINE_LENGTH;
        while !result.is_char_boundary(cut) {
            cut -= 1;
        }
        result = format!("{}... [truncated]", &result[..cut]);
    }

    result
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Log subsystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSubsystem {
    Cluster,
    Poller,
    Console,
    Shell,
    Store,
    App,
}

impl std::fmt::Display for LogSubsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogSubsystem::Cluster => write!(f, "cluster"),
            LogSubsystem::Poller => write!(f, "poller"),
            LogSubsystem::Console => write!(f, "console"),
            LogSubsystem::Shell => write!(f, "shell"),
            LogSubsystem::Store => write!(f, "store"),
            LogSubsystem::App => write!(f, "app"),
        }
    }
}

/// A single log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: i64,
    pub level: LogLevel,
    pub subsystem: LogSubsystem,
    pub session_id: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogLine {
    pub fn new(level: LogLevel, subsystem: LogSubsystem, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
            level,
            subsystem,
            session_id: None,
            message: sanitize(&message.into()),
            details: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(sanitize_json(&details));
        self
    }
}

/// Sanitize a JSON value recursively
fn sanitize_json(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(sanitize(s)),
        serde_json::Value::Object(map) => {
            let mut new_map = serde_json::Map::new();
            for (k, v) in map {
                let key_lower = k.to_lowercase();
                if key_lower.contains("password")
                    || key_lower.contains("secret")
                    || key_lower.contains("token")
                    || key_lower.contains("ticket")
                    || key_lower.contains("key")
                    || key_lower.contains("cookie")
                    || key_lower.contains("passphrase")
                {
                    new_map.insert(k.clone(), serde_json::Value::String("[REDACTED]".to_string()));
                } else {
                    new_map.insert(k.clone(), sanitize_json(v));
                }
            }
            serde_json::Value::Object(new_map)
        }
        serde_json::Value::Array(arr) => serde_json::Value::Array(arr.iter().map(sanitize_json).collect()),
        other => other.clone(),
    }
}

/// Log filter for querying logs
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogFilter {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub level: Option<LogLevel>,
    #[serde(default)]
    pub subsystem: Option<LogSubsystem>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub since: Option<i64>,
}

impl LogFilter {
    fn matches(&self, log: &LogLine) -> bool {
        if let Some(ref sid) = self.session_id {
            if log.session_id.as_ref() != Some(sid) {
                return false;
            }
        }
        if let Some(level) = self.level {
            if log.level != level {
                return false;
            }
        }
        if let Some(ref subsystem) = self.subsystem {
            if &log.subsystem != subsystem {
                return false;
            }
        }
        if let Some(ref search) = self.search {
            if !log.message.to_lowercase().contains(&search.to_lowercase()) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if log.timestamp < since {
                return false;
            }
        }
        true
    }
}

/// Log manager with ring buffer and file persistence
pub struct LogManager {
    ring_buffer: RwLock<VecDeque<LogLine>>,
    log_file_path: PathBuf,
    logs_dir: PathBuf,
}

impl LogManager {
    pub fn new(logs_dir: PathBuf) -> std::io::Result<Arc<Self>> {
        fs::create_dir_all(&logs_dir)?;

        let manager = Arc::new(Self {
            ring_buffer: RwLock::new(VecDeque::with_capacity(1024)),
            log_file_path: logs_dir.join("spicy.log"),
            logs_dir,
        });

        manager.load_existing_logs();

        Ok(manager)
    }

    /// Load existing log lines from file into the ring buffer
    fn load_existing_logs(&self) {
        let Ok(file) = File::open(&self.log_file_path) else {
            return;
        };

        let reader = BufReader::new(file);
        let mut buffer = self.ring_buffer.write();
        for line in reader.lines().map_while(Result::ok) {
            if let Ok(log_line) = serde_json::from_str::<LogLine>(&line) {
                if buffer.len() >= MAX_RING_BUFFER_LINES {
                    buffer.pop_front();
                }
                buffer.push_back(log_line);
            }
        }
    }

    /// Add a log entry
    pub fn log(&self, entry: LogLine) {
        {
            let mut buffer = self.ring_buffer.write();
            if buffer.len() >= MAX_RING_BUFFER_LINES {
                buffer.pop_front();
            }
            buffer.push_back(entry.clone());
        }

        self.write_to_file(&entry);
    }

    /// Write a log entry to the file with rotation
    fn write_to_file(&self, entry: &LogLine) {
        if let Ok(metadata) = fs::metadata(&self.log_file_path) {
            if metadata.len() > MAX_LOG_FILE_SIZE {
                self.rotate_log_file();
            }
        }

        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
        {
            if let Ok(json) = serde_json::to_string(entry) {
                let _ = writeln!(file, "{}", json);
            }
        }
    }

    fn rotate_log_file(&self) {
        let rotated_path = self.log_file_path.with_extension("log.1");
        let _ = fs::remove_file(&rotated_path);
        let _ = fs::rename(&self.log_file_path, &rotated_path);
    }

    /// Get recent logs with optional filtering
    pub fn get_recent_logs(&self, max_lines: u32, filter: Option<LogFilter>) -> Vec<LogLine> {
        let buffer = self.ring_buffer.read();

        let mut logs: Vec<LogLine> = buffer
            .iter()
            .filter(|log| filter.as_ref().map_or(true, |f| f.matches(log)))
            .cloned()
            .collect();

        if logs.len() > max_lines as usize {
            logs = logs.split_off(logs.len() - max_lines as usize);
        }

        logs
    }

    pub fn logs_dir(&self) -> &PathBuf {
        &self.logs_dir
    }
}

/// Global log manager instance - initialized once at startup
static LOG_MANAGER: once_cell::sync::OnceCell<Arc<LogManager>> = once_cell::sync::OnceCell::new();

/// Initialize the global log manager
pub fn init_log_manager(logs_dir: PathBuf) -> std::io::Result<()> {
    let manager = LogManager::new(logs_dir)?;
    LOG_MANAGER.set(manager).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::AlreadyExists, "LogManager already initialized")
    })?;
    Ok(())
}

/// Get the global log manager
pub fn get_log_manager() -> Option<&'static Arc<LogManager>> {
    LOG_MANAGER.get()
}

/// Record a message in the in-app log (no-op before initialization)
pub fn log(level: LogLevel, subsystem: LogSubsystem, message: impl Into<String>) {
    if let Some(manager) = get_log_manager() {
        manager.log(LogLine::new(level, subsystem, message));
    }
}

/// Record a message tied to a profile or session id
pub fn log_session(
    level: LogLevel,
    subsystem: LogSubsystem,
    session_id: impl Into<String>,
    message: impl Into<String>,
) {
    if let Some(manager) = get_log_manager() {
        manager.log(LogLine::new(level, subsystem, message).with_session(session_id));
    }
}

//! Proxmox VE cluster integration.

pub mod api;
pub mod cert;
pub mod commands;
pub mod console;
pub mod poller;
pub mod power;
pub mod session;

pub use api::{ApiRequest, ApiResponse, ApiTransport, HttpMethod, HttpTransport};
pub use cert::{CertificateSource, TlsCertificateSource};
pub use console::{ConsoleLaunchFlow, LaunchOutput, LaunchState};
pub use poller::{StatusPoller, TickReport};
pub use power::{PowerAck, PowerActionDispatcher};
pub use session::{profiles_from_discovery, ClusterSession};

use crate::config::ConnectionProfile;
use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

/// Authentication ticket and CSRF token for one (host, user).
#[derive(Clone)]
pub struct Ticket {
    pub host: String,
    pub username: String,
    pub ticket: String,
    pub csrf_token: String,
    pub issued_at: Instant,
}

impl std::fmt::Debug for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("issued_at", &self.issued_at)
            .finish_non_exhaustive()
    }
}

/// Login credentials for a cluster host.
#[derive(Clone)]
pub struct Credentials {
    pub host: String,
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(host: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    /// Credentials carried by a profile, if it has both halves.
    pub fn from_profile(profile: &ConnectionProfile) -> Option<Self> {
        Some(Self::new(
            profile.host.clone(),
            profile.username()?,
            profile.password()?,
        ))
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// VM power actions accepted by `/status/{action}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    Start,
    Stop,
    Reset,
    Shutdown,
}

impl PowerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerAction::Start => "start",
            PowerAction::Stop => "stop",
            PowerAction::Reset => "reset",
            PowerAction::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for PowerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PowerAction {
    type Err = AppError;

    fn from_str(s: &str) -> AppResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "start" => Ok(PowerAction::Start),
            "stop" => Ok(PowerAction::Stop),
            "reset" => Ok(PowerAction::Reset),
            "shutdown" => Ok(PowerAction::Shutdown),
            other => Err(AppError::Validation(format!("Unknown power action: {}", other))),
        }
    }
}

/// Live state of one profile's VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: String,
    /// Utilization fraction, 0 to 1
    pub cpu: f64,
    pub mem: u64,
    pub maxmem: u64,
}

/// Status records keyed by profile id
pub type StatusMap = HashMap<String, StatusRecord>;

/// A VM as listed by `/nodes/{node}/qemu`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSummary {
    pub vmid: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    /// Filled in by the caller; the listing itself is per node
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub cpu: Option<f64>,
    #[serde(default)]
    pub mem: Option<u64>,
    #[serde(default)]
    pub maxmem: Option<u64>,
}

impl VmSummary {
    pub fn to_status(&self) -> StatusRecord {
        StatusRecord {
            status: self.status.clone().unwrap_or_else(|| "unknown".to_string()),
            cpu: self.cpu.unwrap_or(0.0),
            mem: self.mem.unwrap_or(0),
            maxmem: self.maxmem.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub node: String,
    #[serde(default)]
    pub status: Option<String>,
}

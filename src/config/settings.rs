use crate::error::AppResult;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application settings, stored as `config.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub cluster: ClusterSettings,
    #[serde(default)]
    pub poller: PollerSettings,
    #[serde(default)]
    pub viewer: ViewerSettings,
    #[serde(default)]
    pub ssh: SshSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_ticket_ttl")]
    pub ticket_ttl_secs: u64,
    #[serde(default = "default_node")]
    pub default_node: String,
    /// Proxmox ships self-signed certificates; local clusters rarely carry a public CA.
    #[serde(default = "default_true")]
    pub accept_invalid_certs: bool,
}

fn default_api_port() -> u16 {
    8006
}

fn default_request_timeout() -> u64 {
    5
}

fn default_ticket_ttl() -> u64 {
    90 * 60
}

pub fn default_node() -> String {
    "pve".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            request_timeout_secs: default_request_timeout(),
            ticket_ttl_secs: default_ticket_ttl(),
            default_node: default_node(),
            accept_invalid_certs: true,
        }
    }
}

impl ClusterSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn ticket_ttl(&self) -> Duration {
        Duration::from_secs(self.ticket_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerSettings {
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_poll_interval() -> u64 {
    10
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval(),
            enabled: true,
        }
    }
}

impl PollerSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViewerSettings {
    /// Path to `remote-viewer`; falls back to the one on PATH
    #[serde(default)]
    pub remote_viewer: Option<String>,
    /// RDP client executable for non-Windows hosts
    #[serde(default)]
    pub rdp_client: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    #[serde(default = "default_port")]
    pub default_port: u16,
    #[serde(default = "default_keepalive")]
    pub keepalive_interval: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_term")]
    pub term: String,
    #[serde(default)]
    pub known_hosts_policy: KnownHostsPolicy,
}

fn default_port() -> u16 {
    22
}

fn default_keepalive() -> u32 {
    20
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_term() -> String {
    "xterm-256color".to_string()
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            default_port: default_port(),
            keepalive_interval: default_keepalive(),
            connect_timeout_secs: default_connect_timeout(),
            term: default_term(),
            known_hosts_policy: KnownHostsPolicy::default(),
        }
    }
}

/// Known hosts policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnownHostsPolicy {
    Strict,
    #[default]
    AcceptNew,
    Accept,
}

impl AppSettings {
    pub fn load(config_dir: &Path) -> AppResult<Self> {
        let config_path = config_dir.join("config.toml");
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let settings: AppSettings = toml::from_str(&content)?;
            Ok(settings)
        } else {
            let settings = AppSettings::default();
            settings.save(config_dir)?;
            Ok(settings)
        }
    }

    pub fn save(&self, config_dir: &Path) -> AppResult<()> {
        std::fs::create_dir_all(config_dir)?;
        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }
}

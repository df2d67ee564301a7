pub mod commands;
pub mod session;
pub mod terminal;
pub mod transport;

pub use session::*;
pub use transport::Ssh2Connector;

use crate::config::{ConnectionProfile, SshSettings};
use crate::error::{AppError, AppResult};
use crate::events::EventSink;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// Shell sessions keyed by profile id.
///
/// Each profile has its own bridge, so reconnecting one profile only tears
/// down that profile's previous session.
pub struct SessionManager {
    connector: Arc<dyn ShellConnector>,
    events: Arc<dyn EventSink>,
    default_port: u16,
    keepalive_interval: Duration,
    bridges: DashMap<String, Arc<ShellBridge>>,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn ShellConnector>, events: Arc<dyn EventSink>, settings: &SshSettings) -> Self {
        Self {
            connector,
            events,
            default_port: settings.default_port,
            keepalive_interval: Duration::from_secs(settings.keepalive_interval as u64),
            bridges: DashMap::new(),
        }
    }

    /// Bridge for a profile, created on first use
    pub fn bridge(&self, profile_id: &str) -> Arc<ShellBridge> {
        self.bridges
            .entry(profile_id.to_string())
            .or_insert_with(|| {
                Arc::new(ShellBridge::new(
                    profile_id,
                    self.connector.clone(),
                    self.events.clone(),
                    self.keepalive_interval,
                ))
            })
            .clone()
    }

    pub fn get(&self, profile_id: &str) -> Option<Arc<ShellBridge>> {
        self.bridges.get(profile_id).map(|b| Arc::clone(&b))
    }

    /// Register the consumer of a profile's inbound bytes
    pub fn on_data(&self, profile_id: &str, callback: DataCallback) {
        self.bridge(profile_id).set_on_data(callback);
    }

    /// Connect a profile's shell, replacing that profile's previous session.
    pub async fn connect(&self, profile: &ConnectionProfile) -> AppResult<SessionInfo> {
        let params = ShellParams::from_profile(profile, self.default_port)?;
        let bridge = self.bridge(&profile.id);

        let worker = bridge.clone();
        tokio::task::spawn_blocking(move || worker.connect(params))
            .await
            .map_err(|e| AppError::Ssh(format!("Connect task failed: {}", e)))??;

        tracing::info!("Shell session open for profile {}", profile.id);
        Ok(bridge.info())
    }

    /// Forward input; no-op when the profile has no open session
    pub fn send(&self, profile_id: &str, data: &[u8]) -> AppResult<()> {
        match self.get(profile_id) {
            Some(bridge) => bridge.send(data),
            None => Ok(()),
        }
    }

    pub fn resize(&self, profile_id: &str, cols: u32, rows: u32) -> AppResult<()> {
        match self.get(profile_id) {
            Some(bridge) => bridge.resize(cols, rows),
            None => Ok(()),
        }
    }

    /// Close and forget a profile's session
    pub fn close(&self, profile_id: &str) {
        if let Some((_, bridge)) = self.bridges.remove(profile_id) {
            bridge.close();
            tracing::info!("Closed shell session for profile {}", profile_id);
        }
    }

    pub fn close_all(&self) {
        let ids: Vec<String> = self.bridges.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.close(&id);
        }
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.bridges.iter().map(|entry| entry.value().info()).collect()
    }
}

use super::{
    profiles_from_discovery, Credentials, LaunchOutput, PowerAck, PowerAction, StatusMap, TickReport,
    VmSummary,
};
use crate::config::{ConnectionProfile, ImportSummary, Protocol};
use crate::error::{AppError, AppResult};
use crate::launcher;
use crate::state::AppState;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

fn profile(state: &AppState, id: &str) -> AppResult<ConnectionProfile> {
    state
        .profiles
        .read()
        .get(id)
        .ok_or_else(|| AppError::ProfileNotFound(id.to_string()))
}

/// Run one status poll over the stored profiles
pub async fn poll_once(state: &AppState) -> TickReport {
    state.poller.tick().await
}

pub fn status_snapshot(state: &AppState) -> Arc<StatusMap> {
    state.poller.snapshot()
}

pub async fn power_action(state: &AppState, profile_id: &str, action: PowerAction) -> AppResult<PowerAck> {
    let profile = profile(state, profile_id)?;
    state.power.dispatch(&profile, action).await
}

/// Result of a console launch
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleLaunch {
    #[serde(flatten)]
    pub output: LaunchOutput,
    /// Descriptor file handed to the viewer, when one was started
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

/// Build the SPICE descriptor for a profile, optionally starting the viewer
pub async fn launch_console(state: &AppState, profile_id: &str, open_viewer: bool) -> AppResult<ConsoleLaunch> {
    let profile = profile(state, profile_id)?;
    if profile.protocol != Protocol::Spice {
        return Err(AppError::Validation(format!(
            "Profile '{}' is not a SPICE profile",
            profile.name
        )));
    }

    let output = state.console.launch(&profile).await?;
    let file = if open_viewer {
        let viewer = state.settings.read().viewer.clone();
        Some(launcher::launch_spice(&viewer, &profile.id, &output.content)?)
    } else {
        None
    };

    Ok(ConsoleLaunch { output, file })
}

/// Start the RDP client for an RDP profile
pub fn launch_rdp(state: &AppState, profile_id: &str) -> AppResult<()> {
    let profile = profile(state, profile_id)?;
    if profile.protocol != Protocol::Rdp {
        return Err(AppError::Validation(format!(
            "Profile '{}' is not an RDP profile",
            profile.name
        )));
    }
    let viewer = state.settings.read().viewer.clone();
    launcher::launch_rdp(&viewer, &profile)
}

/// List every VM reachable with the given credentials
pub async fn scan_node(state: &AppState, creds: &Credentials) -> AppResult<Vec<VmSummary>> {
    if creds.host.trim().is_empty() || creds.username.trim().is_empty() {
        return Err(AppError::Validation("host and username are required".to_string()));
    }
    state.cluster.discover_vms(creds).await
}

/// Merge discovered VMs into the store as SPICE profiles
pub fn import_discovered(
    state: &AppState,
    creds: &Credentials,
    port: Option<u16>,
    vms: &[VmSummary],
) -> AppResult<ImportSummary> {
    let incoming = profiles_from_discovery(creds, port, vms);
    state.profiles.write().import_batch(incoming)
}

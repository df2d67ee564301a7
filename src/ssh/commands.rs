use super::{DataCallback, SessionInfo};
use crate::config::Protocol;
use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Open the shell for a stored SSH profile
pub async fn connect_profile(state: &AppState, profile_id: &str) -> AppResult<SessionInfo> {
    let profile = state
        .profiles
        .read()
        .get(profile_id)
        .ok_or_else(|| AppError::ProfileNotFound(profile_id.to_string()))?;

    if profile.protocol != Protocol::Ssh {
        return Err(AppError::Validation(format!(
            "Profile '{}' is not an SSH profile",
            profile.name
        )));
    }

    tracing::info!(
        "SSH connect request for {}@{}",
        profile.username().unwrap_or("?"),
        profile.host
    );
    state.sessions.connect(&profile).await
}

/// Route a session's inbound bytes to `callback`
pub fn attach_output(state: &AppState, profile_id: &str, callback: DataCallback) {
    state.sessions.on_data(profile_id, callback);
}

pub fn send_data(state: &AppState, profile_id: &str, data: &[u8]) -> AppResult<()> {
    state.sessions.send(profile_id, data)
}

pub fn resize_pty(state: &AppState, profile_id: &str, cols: u32, rows: u32) -> AppResult<()> {
    state.sessions.resize(profile_id, cols, rows)
}

pub fn disconnect(state: &AppState, profile_id: &str) {
    state.sessions.close(profile_id);
}

pub fn list_sessions(state: &AppState) -> Vec<SessionInfo> {
    state.sessions.list()
}

pub fn get_session(state: &AppState, profile_id: &str) -> AppResult<SessionInfo> {
    state
        .sessions
        .get(profile_id)
        .map(|bridge| bridge.info())
        .ok_or_else(|| AppError::SessionNotFound(profile_id.to_string()))
}

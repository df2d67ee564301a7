use super::{parse_profiles_json, AppSettings, ConnectionProfile, ImportSummary};
use crate::error::{AppError, AppResult};
use crate::state::AppState;

// Profile commands

pub fn list_profiles(state: &AppState) -> Vec<ConnectionProfile> {
    state.profiles.read().list()
}

pub fn get_profile(state: &AppState, id: &str) -> AppResult<ConnectionProfile> {
    state
        .profiles
        .read()
        .get(id)
        .ok_or_else(|| AppError::ProfileNotFound(id.to_string()))
}

/// Create or update a profile; a blank id gets a fresh one
pub fn save_profile(state: &AppState, mut profile: ConnectionProfile) -> AppResult<ConnectionProfile> {
    if profile.id.trim().is_empty() {
        profile.id = uuid::Uuid::new_v4().to_string();
    }
    state.profiles.write().upsert(profile.clone())?;
    tracing::info!("Saved connection '{}' ({})", profile.name, profile.id);
    Ok(profile)
}

/// Delete a profile and close its shell session, if any
pub fn delete_profile(state: &AppState, id: &str) -> AppResult<ConnectionProfile> {
    let removed = state.profiles.write().delete(id)?;
    state.sessions.close(id);
    tracing::info!("Deleted connection '{}'", removed.name);
    Ok(removed)
}

pub fn clear_profiles(state: &AppState) -> AppResult<()> {
    state.sessions.close_all();
    state.profiles.write().clear()
}

/// Merge an exported list into the store, skipping duplicate targets
pub fn import_profiles(state: &AppState, content: &str) -> AppResult<ImportSummary> {
    let incoming = parse_profiles_json(content)?;
    state.profiles.write().import_batch(incoming)
}

/// Replace the store with an exported list
pub fn replace_profiles(state: &AppState, content: &str) -> AppResult<usize> {
    let incoming = parse_profiles_json(content)?;
    let count = incoming.len();
    state.sessions.close_all();
    state.profiles.write().replace_all(incoming)?;
    Ok(count)
}

pub fn export_profiles(state: &AppState) -> AppResult<String> {
    state.profiles.read().export_json()
}

// Settings commands

pub fn get_settings(state: &AppState) -> AppSettings {
    state.settings.read().clone()
}

/// Persist settings. Cluster and SSH changes apply on next start.
pub fn save_settings(state: &AppState, settings: AppSettings) -> AppResult<()> {
    settings.save(&state.config_dir)?;
    *state.settings.write() = settings;
    Ok(())
}

pub mod commands;
pub mod profiles;
pub mod settings;

pub use profiles::*;
pub use settings::*;

use crate::error::AppResult;
use std::path::PathBuf;

/// Environment variable that pins the config directory
pub const CONFIG_DIR_ENV: &str = "SPICY_CONFIG_DIR";

/// Get the Spicy config directory
pub fn get_config_dir() -> AppResult<PathBuf> {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }

    let config_dir = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .ok_or_else(|| crate::error::AppError::Config("Could not find config directory".into()))?
        .join("spicy");

    Ok(config_dir)
}

/// Get the logs directory
pub fn get_logs_dir() -> AppResult<PathBuf> {
    Ok(get_config_dir()?.join("logs"))
}

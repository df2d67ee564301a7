use super::{get_log_manager, LogFilter, LogLine};
use crate::error::{AppError, AppResult};

/// Maximum lines returned by a single query
const MAX_QUERY_LINES: u32 = 10_000;

/// Get recent logs from the ring buffer
pub fn get_recent_logs(max_lines: Option<u32>, filter: Option<LogFilter>) -> AppResult<Vec<LogLine>> {
    let manager = get_log_manager()
        .ok_or_else(|| AppError::Config("Log manager not initialized".to_string()))?;

    let lines = max_lines.unwrap_or(1000).min(MAX_QUERY_LINES);
    Ok(manager.get_recent_logs(lines, filter))
}

/// Get the logs directory path
pub fn get_logs_dir() -> AppResult<String> {
    match get_log_manager() {
        Some(manager) => Ok(manager.logs_dir().to_string_lossy().to_string()),
        None => Ok(crate::config::get_logs_dir()?.to_string_lossy().to_string()),
    }
}

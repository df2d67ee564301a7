//! Hand-off to external viewer processes.
//!
//! Display rendering never happens in-process: SPICE consoles go to
//! `remote-viewer` through a `.vv` file, RDP targets to the platform client.

use crate::config::{ConnectionProfile, ViewerSettings};
use crate::error::{AppError, AppResult};
use crate::logging::{self, LogLevel, LogSubsystem};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

pub const DEFAULT_REMOTE_VIEWER: &str = "remote-viewer";
pub const DEFAULT_RDP_CLIENT: &str = "xfreerdp";

/// Program plus arguments, resolved but not yet spawned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchCommand {
    /// Start the process detached from our stdio
    pub fn spawn(&self) -> AppResult<()> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| AppError::Connection(format!("Failed to start {}: {}", self.program, e)))?;
        Ok(())
    }
}

/// Write a descriptor to `{dir}/spice-{unix_millis}.vv`
pub fn write_descriptor(dir: &Path, content: &str) -> AppResult<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("spice-{}.vv", chrono::Utc::now().timestamp_millis()));
    std::fs::write(&path, content)?;
    Ok(path)
}

/// The viewer invocation for a descriptor file: its path is the only argument
pub fn viewer_command(settings: &ViewerSettings, descriptor: &Path) -> LaunchCommand {
    let program = settings
        .remote_viewer
        .clone()
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_REMOTE_VIEWER.to_string());
    LaunchCommand {
        program,
        args: vec![descriptor.to_string_lossy().to_string()],
    }
}

fn rdp_target(profile: &ConnectionProfile) -> String {
    match profile.port {
        Some(port) => format!("/v:{}:{}", profile.host, port),
        None => format!("/v:{}", profile.host),
    }
}

pub fn rdp_command(settings: &ViewerSettings, profile: &ConnectionProfile) -> LaunchCommand {
    let program = if cfg!(target_os = "windows") {
        "mstsc".to_string()
    } else {
        settings
            .rdp_client
            .clone()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_RDP_CLIENT.to_string())
    };
    LaunchCommand {
        program,
        args: vec![rdp_target(profile)],
    }
}

/// Save the descriptor to the temp dir and open it in the SPICE viewer
pub fn launch_spice(settings: &ViewerSettings, profile_id: &str, content: &str) -> AppResult<PathBuf> {
    let path = write_descriptor(&std::env::temp_dir(), content)?;
    viewer_command(settings, &path).spawn()?;
    logging::log_session(
        LogLevel::Info,
        LogSubsystem::Console,
        profile_id,
        format!("Viewer started with {}", path.display()),
    );
    Ok(path)
}

pub fn launch_rdp(settings: &ViewerSettings, profile: &ConnectionProfile) -> AppResult<()> {
    let command = rdp_command(settings, profile);
    command.spawn()?;
    tracing::info!("Started {} for {}", command.program, profile.host);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;

    #[test]
    fn test_descriptor_file_name_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_descriptor(dir.path(), "[virt-viewer]\ntype=spice\n").unwrap();

        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("spice-"));
        assert!(name.ends_with(".vv"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[virt-viewer]\ntype=spice\n");
    }

    #[test]
    fn test_viewer_gets_path_as_sole_argument() {
        let path = Path::new("/tmp/spice-1.vv");
        let default = viewer_command(&ViewerSettings::default(), path);
        assert_eq!(default.program, "remote-viewer");
        assert_eq!(default.args, vec!["/tmp/spice-1.vv".to_string()]);

        let settings = ViewerSettings {
            remote_viewer: Some("/opt/virt-viewer/bin/remote-viewer".into()),
            ..Default::default()
        };
        assert_eq!(
            viewer_command(&settings, path).program,
            "/opt/virt-viewer/bin/remote-viewer"
        );
    }

    #[test]
    fn test_rdp_target_with_and_without_port() {
        let mut profile = ConnectionProfile::new("desk", "10.1.1.9", Protocol::Rdp);
        let command = rdp_command(&ViewerSettings::default(), &profile);
        assert_eq!(command.args, vec!["/v:10.1.1.9".to_string()]);

        profile.port = Some(3390);
        let command = rdp_command(&ViewerSettings::default(), &profile);
        assert_eq!(command.args, vec!["/v:10.1.1.9:3390".to_string()]);
        if !cfg!(target_os = "windows") {
            assert_eq!(command.program, "xfreerdp");
        }
    }
}

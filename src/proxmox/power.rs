use super::api::HttpMethod;
use super::session::ClusterSession;
use super::{Credentials, PowerAction};
use crate::config::ConnectionProfile;
use crate::error::{AppError, AppResult};
use crate::logging::{self, LogLevel, LogSubsystem};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// The cluster accepted a power command.
///
/// Acceptance only; the VM may not have reached the target state yet.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerAck {
    pub profile_id: String,
    pub action: PowerAction,
    /// Task id (UPID) of the queued job, when the cluster returns one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upid: Option<String>,
}

pub struct PowerActionDispatcher {
    cluster: Arc<ClusterSession>,
    default_node: String,
}

impl PowerActionDispatcher {
    pub fn new(cluster: Arc<ClusterSession>, default_node: impl Into<String>) -> Self {
        Self {
            cluster,
            default_node: default_node.into(),
        }
    }

    /// Send `action` to the profile's VM.
    ///
    /// Profiles that are not cluster-api, lack a VM id or lack credentials
    /// are rejected before any request is made.
    pub async fn dispatch(&self, profile: &ConnectionProfile, action: PowerAction) -> AppResult<PowerAck> {
        if !profile.is_cluster_api() {
            return Err(AppError::Validation(format!(
                "{} is not a Proxmox API profile",
                profile.name
            )));
        }
        let vmid = profile
            .vmid
            .ok_or_else(|| AppError::Validation(format!("{} has no VM id", profile.name)))?;
        let creds = Credentials::from_profile(profile).ok_or_else(|| {
            AppError::Validation(format!("{} is missing username or password", profile.name))
        })?;

        let node = profile.node_or(&self.default_node);
        let path = format!("/nodes/{}/qemu/{}/status/{}", node, vmid, action);

        tracing::info!("Sending {} to VM {} on {}/{}", action, vmid, profile.host, node);
        let data = match self.cluster.call(&creds, HttpMethod::Post, &path, None).await {
            Ok(data) => data,
            Err(e) => {
                logging::log_session(
                    LogLevel::Error,
                    LogSubsystem::Cluster,
                    &profile.id,
                    format!("{} for VM {} failed: {}", action, vmid, e),
                );
                return Err(e);
            }
        };

        logging::log_session(
            LogLevel::Info,
            LogSubsystem::Cluster,
            &profile.id,
            format!("{} accepted for VM {}", action, vmid),
        );

        Ok(PowerAck {
            profile_id: profile.id.clone(),
            action,
            upid: match data {
                Value::String(upid) if !upid.is_empty() => Some(upid),
                _ => None,
            },
        })
    }
}

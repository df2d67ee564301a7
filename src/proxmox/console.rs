//! SPICE console launch: login, proxy ticket, host certificate, `.vv` text.

use super::api::HttpMethod;
use super::cert::CertificateSource;
use super::session::ClusterSession;
use super::Credentials;
use crate::config::ConnectionProfile;
use crate::error::{AppError, AppResult};
use crate::events::EventSink;
use crate::logging::{self, LogLevel, LogSubsystem};
use crate::spice::VvDescriptor;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchState {
    Init,
    Authenticating,
    RequestingProxyTicket,
    FetchingCertificate,
    BuildingDescriptor,
    Ready,
    Error,
}

impl LaunchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LaunchState::Ready | LaunchState::Error)
    }

    /// Forward step of a successful launch
    fn next(&self) -> Option<LaunchState> {
        match self {
            LaunchState::Init => Some(LaunchState::Authenticating),
            LaunchState::Authenticating => Some(LaunchState::RequestingProxyTicket),
            LaunchState::RequestingProxyTicket => Some(LaunchState::FetchingCertificate),
            LaunchState::FetchingCertificate => Some(LaunchState::BuildingDescriptor),
            LaunchState::BuildingDescriptor => Some(LaunchState::Ready),
            LaunchState::Ready | LaunchState::Error => None,
        }
    }

    pub fn can_transition_to(&self, to: LaunchState) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == LaunchState::Error || self.next() == Some(to)
    }
}

/// Result of a successful launch
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchOutput {
    pub profile_id: String,
    /// Encoded `.vv` descriptor
    pub content: String,
    pub warnings: Vec<String>,
}

/// One launch attempt; reports every transition to the event sink.
struct Attempt<'a> {
    profile_id: &'a str,
    state: LaunchState,
    events: &'a dyn EventSink,
}

impl<'a> Attempt<'a> {
    fn new(profile_id: &'a str, events: &'a dyn EventSink) -> Self {
        Self {
            profile_id,
            state: LaunchState::Init,
            events,
        }
    }

    fn advance(&mut self, to: LaunchState) {
        debug_assert!(self.state.can_transition_to(to), "{:?} -> {:?}", self.state, to);
        self.state = to;
        self.events.emit(
            "console:state",
            json!({ "profileId": self.profile_id, "state": to }),
        );
    }

    fn fail(&mut self, error: AppError) -> AppError {
        let from = self.state;
        self.state = LaunchState::Error;
        self.events.emit(
            "console:state",
            json!({
                "profileId": self.profile_id,
                "state": LaunchState::Error,
                "from": from,
                "message": error.to_string(),
            }),
        );
        logging::log_session(
            LogLevel::Error,
            LogSubsystem::Console,
            self.profile_id,
            format!("Console launch failed during {:?}: {}", from, error),
        );
        error
    }
}

pub struct ConsoleLaunchFlow {
    cluster: Arc<ClusterSession>,
    certs: Arc<dyn CertificateSource>,
    events: Arc<dyn EventSink>,
    default_node: String,
}

impl ConsoleLaunchFlow {
    pub fn new(
        cluster: Arc<ClusterSession>,
        certs: Arc<dyn CertificateSource>,
        events: Arc<dyn EventSink>,
        default_node: impl Into<String>,
    ) -> Self {
        Self {
            cluster,
            certs,
            events,
            default_node: default_node.into(),
        }
    }

    /// Produce a `.vv` descriptor for the profile's VM.
    ///
    /// A certificate fetch failure is recorded as a warning and the
    /// descriptor is built without `ca`.
    pub async fn launch(&self, profile: &ConnectionProfile) -> AppResult<LaunchOutput> {
        let mut attempt = Attempt::new(&profile.id, self.events.as_ref());
        let mut warnings = Vec::new();

        let (vmid, creds) = match (profile.vmid, Credentials::from_profile(profile)) {
            (Some(vmid), Some(creds)) => (vmid, creds),
            _ => {
                return Err(attempt.fail(AppError::Validation("missing credentials".to_string())));
            }
        };

        attempt.advance(LaunchState::Authenticating);
        let ticket = match self.cluster.ticket(&creds).await {
            Ok(ticket) => ticket,
            Err(AppError::Auth(msg)) => {
                return Err(attempt.fail(AppError::Auth(format!("authentication failed: {}", msg))));
            }
            Err(e) => return Err(attempt.fail(e)),
        };

        attempt.advance(LaunchState::RequestingProxyTicket);
        let node = profile.node_or(&self.default_node);
        let path = format!("/nodes/{}/qemu/{}/spiceproxy", node, vmid);
        let data = match self
            .cluster
            .call_with(
                &creds,
                &ticket,
                HttpMethod::Post,
                &path,
                Some(json!({ "proxy": profile.host })),
            )
            .await
        {
            Ok(data) => data,
            Err(e) => return Err(attempt.fail(e)),
        };

        let mut descriptor = match VvDescriptor::from_proxy_response(&data) {
            Ok(descriptor) => descriptor,
            Err(e) => return Err(attempt.fail(e)),
        };
        if descriptor.password.as_deref().map_or(true, str::is_empty) {
            return Err(attempt.fail(AppError::Format(
                "spiceproxy response carried no ticket or password".to_string(),
            )));
        }

        attempt.advance(LaunchState::FetchingCertificate);
        if descriptor.ca.as_deref().map_or(true, str::is_empty) {
            match self.certs.fetch_pem(&profile.host, self.cluster.api_port()).await {
                Ok(pem) => descriptor.ca = Some(pem),
                Err(e) => {
                    let warning = format!("Proceeding without host certificate: {}", e);
                    tracing::warn!("{}", warning);
                    logging::log_session(LogLevel::Warn, LogSubsystem::Console, &profile.id, &warning);
                    warnings.push(warning);
                }
            }
        }

        attempt.advance(LaunchState::BuildingDescriptor);
        descriptor.title = Some(format!("VM {} - {}", vmid, profile.host));
        let content = descriptor.encode();

        attempt.advance(LaunchState::Ready);
        logging::log_session(
            LogLevel::Info,
            LogSubsystem::Console,
            &profile.id,
            format!("Console descriptor ready for VM {}", vmid),
        );

        Ok(LaunchOutput {
            profile_id: profile.id.clone(),
            content,
            warnings,
        })
    }
}

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use spicy::config::{AppSettings, AuthType, ConnectionProfile, Protocol};
use spicy::error::{AppError, AppResult};
use spicy::events::RecordingSink;
use spicy::proxmox::{ApiRequest, ApiResponse, ApiTransport, CertificateSource, HttpMethod};
use spicy::ssh::{ShellChannel, ShellConnector, ShellParams};
use spicy::AppState;
use std::sync::Arc;
use tempfile::TempDir;

/// Cluster API double: fixed responses by method and path suffix.
#[derive(Default)]
pub struct ScriptedCluster {
    routes: Mutex<Vec<(HttpMethod, String, u16, Value)>>,
    pub requests: Mutex<Vec<ApiRequest>>,
}

impl ScriptedCluster {
    pub fn new() -> Self {
        let cluster = Self::default();
        cluster.respond(
            HttpMethod::Post,
            "/access/ticket",
            json!({"ticket": "PVE:root@pam:TICKET", "CSRFPreventionToken": "CSRF1"}),
        );
        cluster
    }

    /// Respond with `{"data": data}`
    pub fn respond(&self, method: HttpMethod, suffix: &str, data: Value) {
        self.respond_status(method, suffix, 200, json!({ "data": data }));
    }

    pub fn respond_status(&self, method: HttpMethod, suffix: &str, status: u16, body: Value) {
        let mut routes = self.routes.lock();
        routes.retain(|(m, s, _, _)| !(*m == method && s == suffix));
        routes.push((method, suffix.to_string(), status, body));
    }

    pub fn count(&self, suffix: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.path().ends_with(suffix))
            .count()
    }

    pub fn total(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl ApiTransport for ScriptedCluster {
    async fn send(&self, request: ApiRequest) -> AppResult<ApiResponse> {
        self.requests.lock().push(request.clone());
        let path = request.path().to_string();
        let routes = self.routes.lock();
        routes
            .iter()
            .filter(|(m, s, _, _)| *m == request.method && path.ends_with(s.as_str()))
            .max_by_key(|(_, s, _, _)| s.len())
            .map(|(_, _, status, body)| ApiResponse::with_status(*status, body.clone()))
            .ok_or_else(|| AppError::Network(format!("connection refused: {}", path)))
    }
}

pub struct FixedCert(pub Option<String>);

#[async_trait]
impl CertificateSource for FixedCert {
    async fn fetch_pem(&self, host: &str, _port: u16) -> AppResult<String> {
        self.0
            .clone()
            .ok_or_else(|| AppError::Certificate(format!("handshake with {} failed", host)))
    }
}

/// Connector that never reaches a host
pub struct Unreachable;

impl ShellConnector for Unreachable {
    fn open(&self, params: &ShellParams) -> AppResult<Box<dyn ShellChannel>> {
        Err(AppError::Connection(format!("{}:{} unreachable", params.host, params.port)))
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub state: AppState,
    pub cluster: Arc<ScriptedCluster>,
    pub events: Arc<RecordingSink>,
}

pub fn harness_with(cluster: ScriptedCluster, cert: Option<&str>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(cluster);
    let events = Arc::new(RecordingSink::new());
    let state = AppState::with_parts(
        dir.path().to_path_buf(),
        AppSettings::default(),
        events.clone(),
        cluster.clone(),
        Arc::new(FixedCert(cert.map(str::to_string))),
        Arc::new(Unreachable),
    )
    .unwrap();
    Harness {
        dir,
        state,
        cluster,
        events,
    }
}

pub fn harness() -> Harness {
    harness_with(ScriptedCluster::new(), None)
}

pub fn vm_profile(name: &str, host: &str, node: &str, vmid: u32) -> ConnectionProfile {
    let mut p = ConnectionProfile::new(name, host, Protocol::Spice);
    p.port = Some(8006);
    p.auth_type = AuthType::ProxmoxApi;
    p.username = Some("root@pam".into());
    p.password = Some("secret".into());
    p.node = Some(node.into());
    p.vmid = Some(vmid);
    p
}

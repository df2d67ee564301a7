use super::api::{ApiRequest, ApiTransport, HttpMethod, API_PREFIX};
use super::{Credentials, NodeSummary, Ticket, VmSummary};
use crate::config::{AuthType, ClusterSettings, ConnectionProfile, Protocol};
use crate::error::{AppError, AppResult};
use crate::logging::{self, LogLevel, LogSubsystem};
use base64::Engine;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Authenticated access to Proxmox VE clusters.
///
/// Tickets are cached per (host, username, password digest) and reused until they age out
/// of the configured TTL. A 401/403 on a cached ticket drops it, logs in
/// again and retries the call once.
pub struct ClusterSession {
    transport: Arc<dyn ApiTransport>,
    api_port: u16,
    ticket_ttl: Duration,
    tickets: DashMap<TicketKey, Ticket>,
}

/// Host, username and a SHA-256 digest of the password
type TicketKey = (String, String, String);

fn ticket_key(host: &str, username: &str, password: &str) -> TicketKey {
    let digest = Sha256::digest(password.as_bytes());
    (
        host.to_string(),
        username.to_string(),
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest),
    )
}

impl ClusterSession {
    pub fn new(transport: Arc<dyn ApiTransport>, settings: &ClusterSettings) -> Self {
        Self {
            transport,
            api_port: settings.api_port,
            ticket_ttl: settings.ticket_ttl(),
            tickets: DashMap::new(),
        }
    }

    pub fn api_port(&self) -> u16 {
        self.api_port
    }

    pub fn base_url(&self, host: &str) -> String {
        format!("https://{}:{}{}", host, self.api_port, API_PREFIX)
    }

    /// Log in and cache the resulting ticket.
    ///
    /// Always performs a login, even when a cached ticket exists.
    pub async fn authenticate(&self, host: &str, username: &str, password: &str) -> AppResult<Ticket> {
        let request = ApiRequest::new(HttpMethod::Post, format!("{}/access/ticket", self.base_url(host)))
            .json(json!({ "username": username, "password": password }));

        let response = self.transport.send(request).await?;
        if !response.is_success() {
            logging::log(
                LogLevel::Warn,
                LogSubsystem::Cluster,
                format!("Login to {} as {} rejected ({})", host, username, response.status),
            );
            return Err(AppError::Auth(format!(
                "Login to {} rejected: {}",
                host,
                response.error_message()
            )));
        }

        let data = response.body.get("data").cloned().unwrap_or(Value::Null);
        let ticket = data.get("ticket").and_then(Value::as_str).filter(|t| !t.is_empty());
        let csrf = data
            .get("CSRFPreventionToken")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty());

        let (Some(ticket), Some(csrf)) = (ticket, csrf) else {
            return Err(AppError::Auth(format!(
                "Login to {} returned no ticket or CSRF token",
                host
            )));
        };

        let ticket = Ticket {
            host: host.to_string(),
            username: username.to_string(),
            ticket: ticket.to_string(),
            csrf_token: csrf.to_string(),
            issued_at: Instant::now(),
        };

        tracing::debug!("Authenticated to {} as {}", host, username);
        self.tickets
            .insert(ticket_key(host, username, password), ticket.clone());

        Ok(ticket)
    }

    /// Cached ticket for these credentials, logging in when there is none
    /// or it has expired.
    pub async fn ticket(&self, creds: &Credentials) -> AppResult<Ticket> {
        let key = ticket_key(&creds.host, &creds.username, &creds.password);
        if let Some(cached) = self.tickets.get(&key) {
            if cached.issued_at.elapsed() < self.ticket_ttl {
                return Ok(cached.clone());
            }
        }
        self.tickets.remove(&key);
        self.authenticate(&creds.host, &creds.username, &creds.password).await
    }

    /// Drop the cached ticket for these credentials
    pub fn invalidate(&self, creds: &Credentials) {
        self.tickets
            .remove(&ticket_key(&creds.host, &creds.username, &creds.password));
    }

    /// Issue an authenticated call and return the response's `data` member.
    ///
    /// `path` is relative to `/api2/json` and may carry a query string.
    pub async fn request(
        &self,
        ticket: &Ticket,
        method: HttpMethod,
        path: &str,
        body: Option<Value>,
    ) -> AppResult<Value> {
        let mut request = ApiRequest::new(method, format!("{}{}", self.base_url(&ticket.host), path))
            .header("CSRFPreventionToken", ticket.csrf_token.clone())
            .header("Cookie", format!("PVEAuthCookie={}", ticket.ticket));
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = self.transport.send(request).await?;
        if !response.is_success() {
            return Err(AppError::Upstream {
                status: response.status,
                message: response.error_message(),
            });
        }

        Ok(response.body.get("data").cloned().unwrap_or(Value::Null))
    }

    /// `request` with a given ticket, re-authenticating once if the cluster
    /// rejects it.
    pub async fn call_with(
        &self,
        creds: &Credentials,
        ticket: &Ticket,
        method: HttpMethod,
        path: &str,
        body: Option<Value>,
    ) -> AppResult<Value> {
        match self.request(ticket, method, path, body.clone()).await {
            Err(err) if err.is_auth_rejection() => {
                tracing::info!("Ticket for {} rejected, logging in again", creds.host);
                self.invalidate(creds);
                let fresh = self
                    .authenticate(&creds.host, &creds.username, &creds.password)
                    .await?;
                self.request(&fresh, method, path, body).await
            }
            other => other,
        }
    }

    /// Authenticated call using the cached ticket
    pub async fn call(
        &self,
        creds: &Credentials,
        method: HttpMethod,
        path: &str,
        body: Option<Value>,
    ) -> AppResult<Value> {
        let ticket = self.ticket(creds).await?;
        self.call_with(creds, &ticket, method, path, body).await
    }

    pub async fn list_nodes(&self, creds: &Credentials) -> AppResult<Vec<NodeSummary>> {
        let data = self.call(creds, HttpMethod::Get, "/nodes", None).await?;
        Ok(serde_json::from_value(data)?)
    }

    /// VMs on a node; `full` asks for live cpu/mem figures.
    pub async fn list_vms(&self, creds: &Credentials, node: &str, full: bool) -> AppResult<Vec<VmSummary>> {
        let path = if full {
            format!("/nodes/{}/qemu?full=1", node)
        } else {
            format!("/nodes/{}/qemu", node)
        };
        let data = self.call(creds, HttpMethod::Get, &path, None).await?;
        let mut vms: Vec<VmSummary> = serde_json::from_value(data)?;
        for vm in &mut vms {
            vm.node = Some(node.to_string());
        }
        Ok(vms)
    }

    /// Every VM on every node of the cluster.
    ///
    /// A node whose listing fails is skipped; failing to list nodes is an
    /// error.
    pub async fn discover_vms(&self, creds: &Credentials) -> AppResult<Vec<VmSummary>> {
        let nodes = self.list_nodes(creds).await?;
        let mut found = Vec::new();

        for node in nodes {
            match self.list_vms(creds, &node.node, false).await {
                Ok(vms) => found.extend(vms),
                Err(e) => {
                    tracing::warn!("Skipping node {} on {}: {}", node.node, creds.host, e);
                }
            }
        }

        found.sort_by_key(|vm| vm.vmid);
        logging::log(
            LogLevel::Info,
            LogSubsystem::Cluster,
            format!("Discovered {} VMs on {}", found.len(), creds.host),
        );
        Ok(found)
    }
}

/// SPICE profiles for discovered VMs, ready for `import_batch`.
///
/// Each profile reuses the scan credentials and pins the VM's own node.
pub fn profiles_from_discovery(
    creds: &Credentials,
    port: Option<u16>,
    vms: &[VmSummary],
) -> Vec<ConnectionProfile> {
    vms.iter()
        .map(|vm| {
            let label = vm
                .name
                .clone()
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| format!("VM {}", vm.vmid));
            let mut profile = ConnectionProfile::new(
                format!("{} ({})", label, vm.vmid),
                creds.host.clone(),
                Protocol::Spice,
            );
            profile.port = Some(port.unwrap_or(8006));
            profile.auth_type = AuthType::ProxmoxApi;
            profile.username = Some(creds.username.clone());
            profile.password = Some(creds.password.clone());
            profile.node = vm.node.clone();
            profile.vmid = Some(vm.vmid);
            profile.tags = vec!["imported".to_string(), "proxmox".to_string()];
            profile
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::super::api::ApiResponse;
    use super::super::fake::{data, FakeTransport};
    use super::*;

    fn session(transport: Arc<FakeTransport>) -> ClusterSession {
        ClusterSession::new(transport, &ClusterSettings::default())
    }

    fn creds() -> Credentials {
        Credentials::new("10.0.0.2", "root@pam", "secret")
    }

    #[tokio::test]
    async fn test_authenticated_request_carries_ticket_headers() {
        let transport = Arc::new(FakeTransport::new());
        transport.login_ok("T", "C");
        transport.route(HttpMethod::Get, "/nodes", |_| data(json!([{"node": "pve"}])));

        let session = session(transport.clone());
        let ticket = session.authenticate("10.0.0.2", "root@pam", "secret").await.unwrap();
        assert_eq!(ticket.ticket, "T");
        assert_eq!(ticket.csrf_token, "C");

        session.request(&ticket, HttpMethod::Get, "/nodes", None).await.unwrap();

        let requests = transport.requests.lock();
        let login = &requests[0];
        assert_eq!(login.url, "https://10.0.0.2:8006/api2/json/access/ticket");
        assert_eq!(login.body.as_ref().unwrap()["username"], "root@pam");
        assert_eq!(login.header_value("Cookie"), None);

        let nodes = &requests[1];
        assert_eq!(nodes.header_value("Cookie"), Some("PVEAuthCookie=T"));
        assert_eq!(nodes.header_value("CSRFPreventionToken"), Some("C"));
    }

    #[tokio::test]
    async fn test_login_without_csrf_is_auth_error() {
        let transport = Arc::new(FakeTransport::new());
        transport.route(HttpMethod::Post, "/access/ticket", |_| data(json!({"ticket": "T"})));

        let err = session(transport).authenticate("h", "u", "p").await.unwrap_err();
        assert!(matches!(err, AppError::Auth(_)));
    }

    #[tokio::test]
    async fn test_rejected_login_is_auth_error() {
        let transport = Arc::new(FakeTransport::new());
        transport.route(HttpMethod::Post, "/access/ticket", |_| {
            Ok(ApiResponse::with_status(401, Value::String("authentication failure".into())))
        });

        let err = session(transport).authenticate("h", "u", "p").await.unwrap_err();
        assert!(matches!(err, AppError::Auth(msg) if msg.contains("authentication failure")));
    }

    #[tokio::test]
    async fn test_ticket_reused_within_ttl() {
        let transport = Arc::new(FakeTransport::new());
        transport.login_ok("T", "C");
        transport.route(HttpMethod::Get, "/nodes", |_| data(json!([{"node": "pve"}])));

        let session = session(transport.clone());
        session.list_nodes(&creds()).await.unwrap();
        session.list_nodes(&creds()).await.unwrap();

        assert_eq!(transport.count("/access/ticket"), 1);
        assert_eq!(transport.count("/nodes"), 2);
    }

    #[tokio::test]
    async fn test_expired_ticket_triggers_login() {
        let transport = Arc::new(FakeTransport::new());
        transport.login_ok("T", "C");
        transport.route(HttpMethod::Get, "/nodes", |_| data(json!([])));

        let settings = ClusterSettings {
            ticket_ttl_secs: 0,
            ..ClusterSettings::default()
        };
        let session = ClusterSession::new(transport.clone(), &settings);
        session.list_nodes(&creds()).await.unwrap();
        session.list_nodes(&creds()).await.unwrap();

        assert_eq!(transport.count("/access/ticket"), 2);
    }

    #[tokio::test]
    async fn test_rejected_ticket_retried_once() {
        let transport = Arc::new(FakeTransport::new());
        transport.login_ok("T", "C");
        transport.once(HttpMethod::Get, "/nodes", |_| {
            Ok(ApiResponse::with_status(401, Value::String("invalid ticket".into())))
        });
        transport.route(HttpMethod::Get, "/nodes", |_| data(json!([{"node": "pve"}])));

        let nodes = session(transport.clone()).list_nodes(&creds()).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(transport.count("/access/ticket"), 2);
        assert_eq!(transport.count("/nodes"), 2);
    }

    #[tokio::test]
    async fn test_upstream_error_surfaces_message() {
        let transport = Arc::new(FakeTransport::new());
        transport.login_ok("T", "C");
        transport.route(HttpMethod::Get, "/nodes", |_| {
            Ok(ApiResponse::with_status(500, json!({"message": "cluster not ready"})))
        });

        let err = session(transport).list_nodes(&creds()).await.unwrap_err();
        match err {
            AppError::Upstream { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "cluster not ready");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_tickets_are_scoped_per_host() {
        let transport = Arc::new(FakeTransport::new());
        transport.login_ok("T", "C");
        transport.route(HttpMethod::Get, "/nodes", |_| data(json!([])));

        let session = session(transport.clone());
        session.list_nodes(&creds()).await.unwrap();
        session
            .list_nodes(&Credentials::new("10.0.0.3", "root@pam", "secret"))
            .await
            .unwrap();

        assert_eq!(transport.count("/access/ticket"), 2);
        let urls: Vec<String> = transport.requests.lock().iter().map(|r| r.url.clone()).collect();
        assert!(urls.iter().any(|u| u.starts_with("https://10.0.0.3:8006/")));
    }

    #[tokio::test]
    async fn test_changed_password_does_not_reuse_ticket() {
        let transport = Arc::new(FakeTransport::new());
        transport.route(HttpMethod::Post, "/access/ticket", |req| {
            let password = req.body.as_ref().and_then(|b| b["password"].as_str()).unwrap_or_default();
            if password == "secret" {
                Ok(ApiResponse::ok(json!({"data": {"ticket": "T", "CSRFPreventionToken": "C"}})))
            } else {
                Ok(ApiResponse::with_status(401, json!({"message": "authentication failure"})))
            }
        });
        transport.route(HttpMethod::Get, "/nodes", |_| data(json!([])));

        let session = session(transport.clone());
        session.list_nodes(&creds()).await.unwrap();
        session.list_nodes(&creds()).await.unwrap();
        assert_eq!(transport.count("/access/ticket"), 1);

        let wrong = Credentials::new("10.0.0.2", "root@pam", "guess");
        let err = session.list_nodes(&wrong).await.unwrap_err();
        assert!(matches!(err, AppError::Auth(_)));
        assert_eq!(transport.count("/access/ticket"), 2);
        assert_eq!(transport.count("/nodes"), 2);

        // the rejected login leaves the good ticket cached
        session.list_nodes(&creds()).await.unwrap();
        assert_eq!(transport.count("/access/ticket"), 2);
    }

    #[tokio::test]
    async fn test_discover_skips_failing_node() {
        let transport = Arc::new(FakeTransport::new());
        transport.login_ok("T", "C");
        transport.route(HttpMethod::Get, "/nodes", |_| {
            data(json!([{"node": "pve1"}, {"node": "pve2"}]))
        });
        transport.route(HttpMethod::Get, "/nodes/pve1/qemu", |_| {
            data(json!([{"vmid": 101, "name": "web", "status": "running"}, {"vmid": 100, "name": "db", "status": "stopped"}]))
        });
        transport.route(HttpMethod::Get, "/nodes/pve2/qemu", |_| {
            Ok(ApiResponse::with_status(595, json!({"message": "no route to host"})))
        });

        let vms = session(transport).discover_vms(&creds()).await.unwrap();
        assert_eq!(vms.iter().map(|v| v.vmid).collect::<Vec<_>>(), vec![100, 101]);
        assert!(vms.iter().all(|v| v.node.as_deref() == Some("pve1")));
    }

    #[test]
    fn test_profiles_from_discovery() {
        let vms = vec![VmSummary {
            vmid: 100,
            name: Some("db".into()),
            status: Some("running".into()),
            node: Some("pve2".into()),
            cpu: None,
            mem: None,
            maxmem: None,
        }];
        let profiles = profiles_from_discovery(&creds(), None, &vms);
        assert_eq!(profiles.len(), 1);
        let p = &profiles[0];
        assert_eq!(p.name, "db (100)");
        assert_eq!(p.protocol, Protocol::Spice);
        assert_eq!(p.port, Some(8006));
        assert_eq!(p.node.as_deref(), Some("pve2"));
        assert_eq!(p.vmid, Some(100));
        assert!(p.is_cluster_api());
        assert_eq!(p.tags, vec!["imported", "proxmox"]);
    }
}

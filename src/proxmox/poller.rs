use super::session::ClusterSession;
use super::{Credentials, StatusMap, StatusRecord};
use crate::config::{ConnectionProfile, PollerSettings, ProfileManager};
use crate::error::{AppError, AppResult};
use crate::events::EventSink;
use crate::logging::{self, LogLevel, LogSubsystem};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Outcome of one poll tick
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub hosts_polled: usize,
    pub hosts_failed: Vec<String>,
    pub records_updated: usize,
}

/// Periodically refreshes VM status for cluster-api profiles.
///
/// Each tick starts from the previous snapshot, replaces the records of
/// every profile found in a listing and publishes the result once through a
/// `watch` channel. Readers only ever see whole ticks.
pub struct StatusPoller {
    cluster: Arc<ClusterSession>,
    profiles: Arc<RwLock<ProfileManager>>,
    events: Arc<dyn EventSink>,
    default_node: String,
    snapshot: watch::Sender<Arc<StatusMap>>,
}

impl StatusPoller {
    pub fn new(
        cluster: Arc<ClusterSession>,
        profiles: Arc<RwLock<ProfileManager>>,
        events: Arc<dyn EventSink>,
        default_node: impl Into<String>,
    ) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(StatusMap::new()));
        Self {
            cluster,
            profiles,
            events,
            default_node: default_node.into(),
            snapshot,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<StatusMap>> {
        self.snapshot.subscribe()
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Arc<StatusMap> {
        self.snapshot.borrow().clone()
    }

    pub fn status_of(&self, profile_id: &str) -> Option<StatusRecord> {
        self.snapshot.borrow().get(profile_id).cloned()
    }

    /// Poll once using the profiles currently in the store
    pub async fn tick(&self) -> TickReport {
        let profiles = self.profiles.read().list();
        self.poll_profiles(&profiles).await
    }

    /// Poll once over an explicit profile list.
    ///
    /// Hosts are processed concurrently. A host that fails is reported and
    /// skipped; its profiles keep their previous records.
    pub async fn poll_profiles(&self, profiles: &[ConnectionProfile]) -> TickReport {
        let groups = group_by_host(profiles);

        let hosts = groups.iter().map(|(host, members)| async move {
            let result = self.poll_host(host, members).await;
            (host.clone(), result)
        });
        let results = futures::future::join_all(hosts).await;

        let live: HashSet<&str> = profiles.iter().map(|p| p.id.as_str()).collect();
        let mut next: StatusMap = self
            .snapshot()
            .iter()
            .filter(|(id, _)| live.contains(id.as_str()))
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect();

        let mut report = TickReport::default();
        for (host, result) in results {
            match result {
                Ok(updates) => {
                    report.hosts_polled += 1;
                    report.records_updated += updates.len();
                    next.extend(updates);
                }
                Err(e) => {
                    tracing::warn!("Status poll for {} failed: {}", host, e);
                    logging::log(
                        LogLevel::Warn,
                        LogSubsystem::Poller,
                        format!("Status poll for {} failed: {}", host, e),
                    );
                    report.hosts_failed.push(host);
                }
            }
        }

        self.snapshot.send_replace(Arc::new(next));
        self.events.emit(
            "poller:tick",
            serde_json::to_value(&report).unwrap_or_default(),
        );
        report
    }

    async fn poll_host(
        &self,
        host: &str,
        members: &[&ConnectionProfile],
    ) -> AppResult<HashMap<String, StatusRecord>> {
        let creds = members
            .iter()
            .find_map(|p| Credentials::from_profile(p))
            .ok_or_else(|| AppError::Validation(format!("No credentials for {}", host)))?;

        // One login per host per tick at most; list calls reuse it.
        self.cluster.ticket(&creds).await?;

        let nodes: BTreeSet<&str> = members.iter().map(|p| p.node_or(&self.default_node)).collect();
        let mut updates = HashMap::new();

        for node in nodes {
            let vms = self.cluster.list_vms(&creds, node, true).await?;
            let by_vmid: HashMap<u32, StatusRecord> =
                vms.iter().map(|vm| (vm.vmid, vm.to_status())).collect();

            for profile in members.iter().filter(|p| p.node_or(&self.default_node) == node) {
                let Some(vmid) = profile.vmid else { continue };
                if let Some(record) = by_vmid.get(&vmid) {
                    updates.insert(profile.id.clone(), record.clone());
                }
            }
        }

        Ok(updates)
    }

    /// Run a tick now and then every `settings.interval()` until `cancel`
    /// fires. Returns `None` without scheduling anything when polling is
    /// disabled.
    ///
    /// Cancellation stops scheduling; a tick already in flight finishes.
    pub fn spawn(
        self: Arc<Self>,
        settings: &PollerSettings,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if !settings.enabled {
            tracing::info!("Status polling disabled");
            logging::log(LogLevel::Info, LogSubsystem::Poller, "status polling disabled");
            return None;
        }
        let interval = settings.interval();

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Status poller stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let report = self.tick().await;
                        tracing::debug!(
                            "Poll tick: {} hosts ok, {} failed, {} records",
                            report.hosts_polled,
                            report.hosts_failed.len(),
                            report.records_updated
                        );
                    }
                }
            }
        }))
    }
}

/// Cluster-api profiles with a node, grouped by host
fn group_by_host(profiles: &[ConnectionProfile]) -> BTreeMap<String, Vec<&ConnectionProfile>> {
    let mut groups: BTreeMap<String, Vec<&ConnectionProfile>> = BTreeMap::new();
    for profile in profiles {
        let has_node = profile.node.as_deref().map_or(false, |n| !n.is_empty());
        if profile.is_cluster_api() && has_node && !profile.host.is_empty() {
            groups.entry(profile.host.clone()).or_default().push(profile);
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::super::api::{ApiResponse, HttpMethod};
    use super::super::fake::{data, FakeTransport};
    use super::*;
    use crate::config::{AuthType, ClusterSettings, Protocol};
    use crate::events::RecordingSink;
    use serde_json::json;
    use std::time::Duration;

    fn vm_profile(id: &str, host: &str, node: &str, vmid: u32) -> ConnectionProfile {
        let mut p = ConnectionProfile::new(format!("vm {}", vmid), host, Protocol::Spice);
        p.id = id.to_string();
        p.auth_type = AuthType::ProxmoxApi;
        p.username = Some("root@pam".into());
        p.password = Some("secret".into());
        p.node = Some(node.to_string());
        p.vmid = Some(vmid);
        p
    }

    fn poller(transport: Arc<FakeTransport>) -> (StatusPoller, Arc<RecordingSink>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileManager::load(dir.path()).unwrap();
        let cluster = Arc::new(ClusterSession::new(transport, &ClusterSettings::default()));
        let sink = Arc::new(RecordingSink::new());
        let poller = StatusPoller::new(cluster, Arc::new(RwLock::new(store)), sink.clone(), "pve");
        (poller, sink, dir)
    }

    fn listing() -> serde_json::Value {
        json!([
            {"vmid": 100, "name": "db", "status": "running", "cpu": 0.25, "mem": 1024, "maxmem": 4096},
            {"vmid": 101, "name": "web", "status": "stopped", "cpu": 0.0, "mem": 0, "maxmem": 2048}
        ])
    }

    #[tokio::test]
    async fn test_tick_records_listed_vms_only() {
        let transport = Arc::new(FakeTransport::new());
        transport.login_ok("T", "C");
        transport.route(HttpMethod::Get, "/nodes/pve/qemu?full=1", |_| data(listing()));

        let (poller, sink, _dir) = poller(transport.clone());
        let profiles = vec![
            vm_profile("a", "10.0.0.2", "pve", 100),
            vm_profile("b", "10.0.0.2", "pve", 101),
            vm_profile("c", "10.0.0.2", "pve", 999),
        ];

        let report = poller.poll_profiles(&profiles).await;
        assert_eq!(report.hosts_polled, 1);
        assert_eq!(report.records_updated, 2);

        let snapshot = poller.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(
            snapshot["a"],
            StatusRecord { status: "running".into(), cpu: 0.25, mem: 1024, maxmem: 4096 }
        );
        assert_eq!(
            snapshot["b"],
            StatusRecord { status: "stopped".into(), cpu: 0.0, mem: 0, maxmem: 2048 }
        );
        assert!(!snapshot.contains_key("c"));
        assert_eq!(transport.count("/access/ticket"), 1);
        assert_eq!(sink.named("poller:tick").len(), 1);
    }

    #[tokio::test]
    async fn test_failing_host_keeps_previous_records() {
        let transport = Arc::new(FakeTransport::new());
        transport.login_ok("T", "C");
        transport.route(HttpMethod::Get, "/nodes/pve/qemu?full=1", |req| {
            if req.url.contains("10.0.0.3") {
                Ok(ApiResponse::with_status(500, json!({"message": "node offline"})))
            } else {
                data(listing())
            }
        });

        let (poller, _sink, _dir) = poller(transport.clone());
        let stale = StatusRecord { status: "running".into(), cpu: 0.5, mem: 1, maxmem: 2 };
        poller
            .snapshot
            .send_replace(Arc::new(HashMap::from([("z".to_string(), stale.clone())])));

        let profiles = vec![
            vm_profile("a", "10.0.0.2", "pve", 100),
            vm_profile("z", "10.0.0.3", "pve", 100),
        ];
        let report = poller.poll_profiles(&profiles).await;

        assert_eq!(report.hosts_polled, 1);
        assert_eq!(report.hosts_failed, vec!["10.0.0.3".to_string()]);
        let snapshot = poller.snapshot();
        assert_eq!(snapshot["a"].status, "running");
        assert_eq!(snapshot["z"], stale);
    }

    #[tokio::test]
    async fn test_profiles_without_node_or_api_auth_ignored() {
        let transport = Arc::new(FakeTransport::new());
        transport.login_ok("T", "C");

        let (poller, _sink, _dir) = poller(transport.clone());
        let mut no_node = vm_profile("a", "10.0.0.2", "pve", 100);
        no_node.node = None;
        let mut ssh = vm_profile("b", "10.0.0.2", "pve", 101);
        ssh.auth_type = AuthType::Password;

        let report = poller.poll_profiles(&[no_node, ssh]).await;
        assert_eq!(report.hosts_polled, 0);
        assert_eq!(transport.total(), 0);
    }

    #[tokio::test]
    async fn test_removed_profiles_pruned_from_snapshot() {
        let transport = Arc::new(FakeTransport::new());
        let (poller, _sink, _dir) = poller(transport);
        let record = StatusRecord { status: "running".into(), cpu: 0.0, mem: 0, maxmem: 0 };
        poller
            .snapshot
            .send_replace(Arc::new(HashMap::from([("gone".to_string(), record)])));

        poller.poll_profiles(&[]).await;
        assert!(poller.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_host_without_credentials_fails_without_network() {
        let transport = Arc::new(FakeTransport::new());
        let (poller, _sink, _dir) = poller(transport.clone());
        let mut p = vm_profile("a", "10.0.0.2", "pve", 100);
        p.password = None;

        let report = poller.poll_profiles(&[p]).await;
        assert_eq!(report.hosts_failed.len(), 1);
        assert_eq!(transport.total(), 0);
    }

    #[tokio::test]
    async fn test_spawned_poller_publishes_and_stops() {
        let transport = Arc::new(FakeTransport::new());
        transport.login_ok("T", "C");
        transport.route(HttpMethod::Get, "/nodes/pve/qemu?full=1", |_| data(listing()));

        let (poller, _sink, _dir) = poller(transport.clone());
        poller
            .profiles
            .write()
            .upsert(vm_profile("a", "10.0.0.2", "pve", 100))
            .unwrap();

        let poller = Arc::new(poller);
        let mut rx = poller.subscribe();
        let cancel = CancellationToken::new();
        let settings = PollerSettings { interval_secs: 3600, enabled: true };
        let handle = poller.clone().spawn(&settings, cancel.clone()).unwrap();

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow()["a"].status, "running");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_poller_never_ticks() {
        let transport = Arc::new(FakeTransport::new());
        transport.login_ok("T", "C");
        transport.route(HttpMethod::Get, "/nodes/pve/qemu?full=1", |_| data(listing()));

        let (poller, sink, _dir) = poller(transport.clone());
        poller
            .profiles
            .write()
            .upsert(vm_profile("a", "10.0.0.2", "pve", 100))
            .unwrap();

        let poller = Arc::new(poller);
        let settings = PollerSettings { interval_secs: 1, enabled: false };
        assert!(poller.clone().spawn(&settings, CancellationToken::new()).is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.count("/access/ticket"), 0);
        assert!(poller.snapshot().is_empty());
        assert!(sink.named("poller:tick").is_empty());
    }
}

use crate::config::{AppSettings, ProfileManager};
use crate::error::AppResult;
use crate::events::EventSink;
use crate::proxmox::{
    ApiTransport, CertificateSource, ClusterSession, ConsoleLaunchFlow, HttpTransport,
    PowerActionDispatcher, StatusPoller, TlsCertificateSource,
};
use crate::ssh::{SessionManager, ShellConnector, Ssh2Connector};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;

/// Global application state
pub struct AppState {
    pub config_dir: PathBuf,
    pub settings: Arc<RwLock<AppSettings>>,
    pub profiles: Arc<RwLock<ProfileManager>>,
    pub events: Arc<dyn EventSink>,
    pub cluster: Arc<ClusterSession>,
    pub poller: Arc<StatusPoller>,
    pub power: PowerActionDispatcher,
    pub console: ConsoleLaunchFlow,
    pub sessions: Arc<SessionManager>,
}

impl AppState {
    /// State backed by the real network transports
    pub fn new(config_dir: PathBuf, events: Arc<dyn EventSink>) -> AppResult<Self> {
        let settings = AppSettings::load(&config_dir)?;

        let transport = Arc::new(HttpTransport::new(&settings.cluster)?);
        let certs = Arc::new(TlsCertificateSource::new(settings.cluster.request_timeout()));
        let connector = Arc::new(Ssh2Connector::new(
            settings.ssh.clone(),
            config_dir.join("known_hosts"),
        ));

        Self::with_parts(config_dir, settings, events, transport, certs, connector)
    }

    /// Assemble state around the given transports
    pub fn with_parts(
        config_dir: PathBuf,
        settings: AppSettings,
        events: Arc<dyn EventSink>,
        transport: Arc<dyn ApiTransport>,
        certs: Arc<dyn CertificateSource>,
        connector: Arc<dyn ShellConnector>,
    ) -> AppResult<Self> {
        let profiles = Arc::new(RwLock::new(ProfileManager::load(&config_dir)?));
        let default_node = settings.cluster.default_node.clone();

        let cluster = Arc::new(ClusterSession::new(transport, &settings.cluster));
        let poller = Arc::new(StatusPoller::new(
            cluster.clone(),
            profiles.clone(),
            events.clone(),
            default_node.clone(),
        ));
        let power = PowerActionDispatcher::new(cluster.clone(), default_node.clone());
        let console = ConsoleLaunchFlow::new(cluster.clone(), certs, events.clone(), default_node);
        let sessions = Arc::new(SessionManager::new(connector, events.clone(), &settings.ssh));

        Ok(Self {
            config_dir,
            settings: Arc::new(RwLock::new(settings)),
            profiles,
            events,
            cluster,
            poller,
            power,
            console,
            sessions,
        })
    }
}

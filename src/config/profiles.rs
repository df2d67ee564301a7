use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Remote-access protocol of a profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "SPICE")]
    Spice,
    #[serde(rename = "RDP")]
    Rdp,
    #[serde(rename = "SSH")]
    Ssh,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Spice => write!(f, "SPICE"),
            Protocol::Rdp => write!(f, "RDP"),
            Protocol::Ssh => write!(f, "SSH"),
        }
    }
}

/// How a profile authenticates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthType {
    #[default]
    #[serde(rename = "NONE")]
    None,
    #[serde(rename = "PASSWORD")]
    Password,
    #[serde(rename = "KEY_FILE")]
    KeyFile,
    #[serde(rename = "PROXMOX_API")]
    ProxmoxApi,
}

/// Connection profile, persisted as one element of `connections.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProfile {
    pub id: String,
    pub name: String,
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub protocol: Protocol,
    #[serde(default)]
    pub auth_type: AuthType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Content of the SSH private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    /// File name the key was loaded from, for display only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_name: Option<String>,
    /// RDP only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, rename = "proxmoxNode", skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default, rename = "proxmoxVmid", skip_serializing_if = "Option::is_none")]
    pub vmid: Option<u32>,
}

impl ConnectionProfile {
    pub fn new(name: impl Into<String>, host: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            host: host.into(),
            port: None,
            protocol,
            auth_type: AuthType::None,
            username: None,
            password: None,
            private_key: None,
            private_key_name: None,
            domain: None,
            tags: vec![],
            node: None,
            vmid: None,
        }
    }

    pub fn is_cluster_api(&self) -> bool {
        self.auth_type == AuthType::ProxmoxApi
    }

    /// Node name with the cluster default applied
    pub fn node_or<'a>(&'a self, default: &'a str) -> &'a str {
        match self.node.as_deref() {
            Some(node) if !node.is_empty() => node,
            _ => default,
        }
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref().filter(|u| !u.is_empty())
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref().filter(|p| !p.is_empty())
    }

    pub fn private_key(&self) -> Option<&str> {
        self.private_key.as_deref().filter(|k| !k.trim().is_empty())
    }

    /// Fields every profile needs before it can be stored
    pub fn validate(&self) -> AppResult<()> {
        if self.id.trim().is_empty() {
            return Err(AppError::Validation("Profile id is required".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(AppError::Validation("Profile name is required".to_string()));
        }
        if self.host.trim().is_empty() {
            return Err(AppError::Validation("Profile host is required".to_string()));
        }
        Ok(())
    }

    /// Whether two profiles describe the same target for bulk import.
    ///
    /// Cluster-managed VMs can move between nodes and ports, so two
    /// PROXMOX_API profiles are the same when host and VM id agree. Every
    /// other pairing compares host and port.
    pub fn same_target(&self, other: &ConnectionProfile) -> bool {
        if self.is_cluster_api() && other.is_cluster_api() {
            return self.host == other.host && self.vmid == other.vmid;
        }
        self.host == other.host && self.port == other.port
    }
}

/// Replace the profile with the same id in place, or append it.
pub fn upsert(existing: &[ConnectionProfile], item: ConnectionProfile) -> Vec<ConnectionProfile> {
    let mut profiles = existing.to_vec();
    match profiles.iter().position(|p| p.id == item.id) {
        Some(index) => profiles[index] = item,
        None => profiles.push(item),
    }
    profiles
}

/// Append every incoming profile whose target is not already represented,
/// either in `existing` or earlier in the same batch.
pub fn import_batch(
    existing: &[ConnectionProfile],
    incoming: Vec<ConnectionProfile>,
) -> Vec<ConnectionProfile> {
    let mut profiles = existing.to_vec();
    for item in incoming {
        if !profiles.iter().any(|p| p.same_target(&item)) {
            profiles.push(item);
        }
    }
    profiles
}

/// Parse an exported profile list. Anything else is rejected wholesale.
pub fn parse_profiles_json(content: &str) -> AppResult<Vec<ConnectionProfile>> {
    let value: serde_json::Value = serde_json::from_str(content)?;
    if !value.is_array() {
        return Err(AppError::Format("Expected a JSON array of connections".to_string()));
    }
    let profiles: Vec<ConnectionProfile> = serde_json::from_value(value)?;
    if let Some(bad) = profiles.iter().find(|p| p.id.trim().is_empty()) {
        return Err(AppError::Format(format!("Connection '{}' has no id", bad.name)));
    }
    Ok(profiles)
}

/// Outcome of a bulk import
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub added: usize,
    pub skipped: usize,
}

/// Ordered connection store backed by `connections.json`
pub struct ProfileManager {
    profiles: Vec<ConnectionProfile>,
    config_path: PathBuf,
}

impl ProfileManager {
    pub fn load(config_dir: &Path) -> AppResult<Self> {
        let config_path = config_dir.join("connections.json");
        let profiles = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            if content.trim().is_empty() {
                vec![]
            } else {
                parse_profiles_json(&content)?
            }
        } else {
            vec![]
        };

        tracing::debug!("Loaded {} connections from {:?}", profiles.len(), config_path);
        Ok(Self {
            profiles,
            config_path,
        })
    }

    /// Write `profiles` to disk via a temp file renamed into place
    fn write(&self, profiles: &[ConnectionProfile]) -> AppResult<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(profiles)
            .map_err(|e| AppError::Serialization(e.to_string()))?;
        let tmp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)?;
        if let Err(e) = std::fs::rename(&tmp_path, &self.config_path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        Ok(())
    }

    /// Persist `next`, then adopt it; on failure memory stays as it was
    fn commit(&mut self, next: Vec<ConnectionProfile>) -> AppResult<()> {
        self.write(&next)?;
        self.profiles = next;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    pub fn list(&self) -> Vec<ConnectionProfile> {
        self.profiles.clone()
    }

    pub fn get(&self, id: &str) -> Option<ConnectionProfile> {
        self.profiles.iter().find(|p| p.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Create or update a single profile
    pub fn upsert(&mut self, profile: ConnectionProfile) -> AppResult<()> {
        profile.validate()?;
        let next = upsert(&self.profiles, profile);
        self.commit(next)
    }

    pub fn import_batch(&mut self, incoming: Vec<ConnectionProfile>) -> AppResult<ImportSummary> {
        for profile in &incoming {
            profile.validate()?;
        }
        let before = self.profiles.len();
        let total = incoming.len();
        let next = import_batch(&self.profiles, incoming);
        let added = next.len() - before;
        let summary = ImportSummary {
            added,
            skipped: total - added,
        };
        if summary.skipped > 0 {
            tracing::info!("Skipped {} duplicate connections", summary.skipped);
        }
        self.commit(next)?;
        Ok(summary)
    }

    pub fn delete(&mut self, id: &str) -> AppResult<ConnectionProfile> {
        let index = self
            .profiles
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| AppError::ProfileNotFound(id.to_string()))?;
        let mut next = self.profiles.clone();
        let removed = next.remove(index);
        self.commit(next)?;
        Ok(removed)
    }

    /// Replace the whole store. Callers confirm with the user first.
    pub fn replace_all(&mut self, profiles: Vec<ConnectionProfile>) -> AppResult<()> {
        for profile in &profiles {
            profile.validate()?;
        }
        self.commit(profiles)
    }

    pub fn clear(&mut self) -> AppResult<()> {
        self.replace_all(vec![])
    }

    pub fn export_json(&self) -> AppResult<String> {
        serde_json::to_string_pretty(&self.profiles).map_err(|e| AppError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ssh(host: &str, port: u16) -> ConnectionProfile {
        let mut p = ConnectionProfile::new(format!("{}:{}", host, port), host, Protocol::Ssh);
        p.port = Some(port);
        p.auth_type = AuthType::Password;
        p
    }

    fn vm(host: &str, vmid: u32, port: u16) -> ConnectionProfile {
        let mut p = ConnectionProfile::new(format!("vm {}", vmid), host, Protocol::Spice);
        p.port = Some(port);
        p.auth_type = AuthType::ProxmoxApi;
        p.node = Some("pve".to_string());
        p.vmid = Some(vmid);
        p
    }

    #[test]
    fn test_cluster_profiles_compare_host_and_vmid() {
        // port differs, VM is the same
        assert!(vm("10.0.0.2", 100, 8006).same_target(&vm("10.0.0.2", 100, 3128)));
        // same host and port, different VMs
        assert!(!vm("10.0.0.2", 100, 8006).same_target(&vm("10.0.0.2", 101, 8006)));
    }

    #[test]
    fn test_mixed_profiles_compare_host_and_port() {
        let mut api = vm("10.0.0.2", 100, 22);
        assert!(api.same_target(&ssh("10.0.0.2", 22)));
        api.port = Some(8006);
        assert!(!api.same_target(&ssh("10.0.0.2", 22)));
    }

    #[test]
    fn test_import_batch_skips_existing_and_batch_duplicates() {
        let existing = vec![ssh("a", 22), vm("pve1", 100, 8006)];
        let incoming = vec![
            ssh("a", 22),          // already stored
            vm("pve1", 100, 9999), // same VM, other port
            vm("pve1", 101, 8006), // new
            vm("pve1", 101, 8006), // duplicate inside the batch
            ssh("b", 2222),        // new
        ];
        let result = import_batch(&existing, incoming);
        assert_eq!(result.len(), 4);
        assert_eq!(result[2].vmid, Some(101));
        assert_eq!(result[3].host, "b");

        for (i, a) in result.iter().enumerate() {
            for b in result.iter().skip(i + 1) {
                assert!(!a.same_target(b), "{} collides with {}", a.name, b.name);
            }
        }
    }

    #[test]
    fn test_import_batch_is_idempotent() {
        let incoming = vec![vm("pve1", 100, 8006), ssh("b", 22)];
        let once = import_batch(&[], incoming.clone());
        let twice = import_batch(&once, incoming);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let existing = vec![ssh("a", 22), ssh("b", 22), ssh("c", 22)];
        let mut edited = existing[1].clone();
        edited.name = "renamed".to_string();

        let result = upsert(&existing, edited.clone());
        assert_eq!(result.len(), 3);
        assert_eq!(result[1], edited);
        assert_eq!(result[0], existing[0]);

        let fresh = ssh("d", 22);
        let result = upsert(&existing, fresh.clone());
        assert_eq!(result.len(), 4);
        assert_eq!(result.last(), Some(&fresh));
    }

    #[test]
    fn test_store_persists_every_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ProfileManager::load(dir.path()).unwrap();
        assert!(store.is_empty());

        let a = ssh("a", 22);
        store.upsert(a.clone()).unwrap();
        let summary = store.import_batch(vec![ssh("a", 22), vm("pve1", 100, 8006)]).unwrap();
        assert_eq!(summary, ImportSummary { added: 1, skipped: 1 });

        let reloaded = ProfileManager::load(dir.path()).unwrap();
        assert_eq!(reloaded.list(), store.list());

        store.delete(&a.id).unwrap();
        let reloaded = ProfileManager::load(dir.path()).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert!(matches!(store.delete(&a.id), Err(AppError::ProfileNotFound(_))));
    }

    #[test]
    fn test_upsert_rejects_missing_host() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ProfileManager::load(dir.path()).unwrap();
        let profile = ConnectionProfile::new("no host", "", Protocol::Spice);
        assert!(matches!(store.upsert(profile), Err(AppError::Validation(_))));
        assert!(!store.path().exists());
    }

    #[test]
    fn test_persisted_format_uses_camel_case() {
        let json = serde_json::to_value(vm("pve1", 100, 8006)).unwrap();
        assert_eq!(json["authType"], "PROXMOX_API");
        assert_eq!(json["protocol"], "SPICE");
        assert_eq!(json["proxmoxNode"], "pve");
        assert_eq!(json["proxmoxVmid"], 100);
        assert!(json.get("password").is_none());
    }

    #[test]
    fn test_parse_rejects_non_array_and_missing_ids() {
        assert!(matches!(parse_profiles_json("{\"id\":\"x\"}"), Err(AppError::Format(_))));
        assert!(matches!(parse_profiles_json("not json"), Err(AppError::Format(_))));
        let missing_id = r#"[{"name":"a","host":"h","protocol":"SSH"}]"#;
        assert!(matches!(parse_profiles_json(missing_id), Err(AppError::Format(_))));

        let ok = r#"[{"id":"1","name":"a","host":"h","protocol":"SSH","tags":["x"]}]"#;
        let parsed = parse_profiles_json(ok).unwrap();
        assert_eq!(parsed[0].auth_type, AuthType::None);
        assert_eq!(parsed[0].tags, vec!["x".to_string()]);
    }

    #[test]
    fn test_failed_write_leaves_store_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ProfileManager::load(dir.path()).unwrap();
        let kept = ssh("kept", 22);
        store.upsert(kept.clone()).unwrap();

        // a directory where the file should be makes every write fail
        std::fs::remove_file(store.path()).unwrap();
        std::fs::create_dir(store.path()).unwrap();

        assert!(store.upsert(ssh("new", 22)).is_err());
        assert!(store.import_batch(vec![ssh("other", 2222)]).is_err());
        assert!(store.delete(&kept.id).is_err());
        assert!(store.replace_all(vec![]).is_err());
        assert!(store.clear().is_err());

        assert_eq!(store.list(), vec![kept]);
        assert!(!dir.path().join("connections.json.tmp").exists());
    }

    #[test]
    fn test_malformed_store_file_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("connections.json"), "[{").unwrap();
        assert!(matches!(ProfileManager::load(dir.path()), Err(AppError::Format(_))));
    }
}

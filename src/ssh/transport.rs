//! libssh2-backed shell transport.

use super::session::{ShellAuth, ShellChannel, ShellConnector, ShellParams};
use crate::config::{KnownHostsPolicy, SshSettings};
use crate::error::{AppError, AppResult};
use sha2::{Digest, Sha256};
use ssh2::{Channel, CheckResult, HostKeyType, KnownHostFileKind, Session as Ssh2Session};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

const WRITE_CHUNK_BYTES: usize = 8 * 1024; // limit each write call

pub struct Ssh2Connector {
    settings: SshSettings,
    known_hosts_path: PathBuf,
}

impl Ssh2Connector {
    pub fn new(settings: SshSettings, known_hosts_path: PathBuf) -> Self {
        Self {
            settings,
            known_hosts_path,
        }
    }

    fn connect_tcp(&self, params: &ShellParams) -> AppResult<TcpStream> {
        let addr = (params.host.as_str(), params.port)
            .to_socket_addrs()
            .map_err(|e| AppError::Connection(format!("Invalid address: {}", e)))?
            .next()
            .ok_or_else(|| AppError::Connection(format!("Could not resolve {}", params.host)))?;

        let timeout = Duration::from_secs(self.settings.connect_timeout_secs.max(1));
        let tcp = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| AppError::Connection(format!("TCP connect failed: {}", e)))?;

        tcp.set_nodelay(true)?;
        tcp.set_write_timeout(Some(timeout))?;
        Ok(tcp)
    }

    /// Check the server key against `known_hosts` under the configured policy.
    ///
    /// A changed key is always rejected.
    fn verify_host_key(&self, session: &Ssh2Session, params: &ShellParams) -> AppResult<()> {
        let (key, key_type) = session
            .host_key()
            .ok_or_else(|| AppError::Ssh("No host key received".to_string()))?;
        let fingerprint = compute_sha256_fingerprint(key);

        let mut known_hosts = session
            .known_hosts()
            .map_err(|e| AppError::Ssh(format!("Failed to create known_hosts: {}", e)))?;
        if self.known_hosts_path.exists() {
            let _ = known_hosts.read_file(&self.known_hosts_path, KnownHostFileKind::OpenSSH);
        }

        match known_hosts.check_port(&params.host, params.port, key) {
            CheckResult::Match => {
                tracing::debug!("Host key matched for {}:{}", params.host, params.port);
                Ok(())
            }
            CheckResult::NotFound => match self.settings.known_hosts_policy {
                KnownHostsPolicy::Strict => Err(AppError::Ssh(format!(
                    "Unknown host key for {}:{} ({} {})",
                    params.host,
                    params.port,
                    key_type_name(key_type),
                    fingerprint
                ))),
                KnownHostsPolicy::Accept => {
                    tracing::info!("Accepting unknown host key {} for {}", fingerprint, params.host);
                    Ok(())
                }
                KnownHostsPolicy::AcceptNew => {
                    tracing::info!("Recording new host key {} for {}", fingerprint, params.host);
                    let format = match key_type {
                        HostKeyType::Rsa => ssh2::KnownHostKeyFormat::SshRsa,
                        HostKeyType::Dss => ssh2::KnownHostKeyFormat::SshDss,
                        _ => ssh2::KnownHostKeyFormat::Unknown,
                    };
                    let stored = known_hosts
                        .add(
                            &host_entry(&params.host, params.port),
                            key,
                            &format!("Added by spicy on {}", chrono::Utc::now()),
                            format,
                        )
                        .and_then(|_| {
                            if let Some(parent) = self.known_hosts_path.parent() {
                                let _ = std::fs::create_dir_all(parent);
                            }
                            known_hosts.write_file(&self.known_hosts_path, KnownHostFileKind::OpenSSH)
                        });
                    if let Err(e) = stored {
                        tracing::warn!("Could not record host key for {}: {}", params.host, e);
                    }
                    Ok(())
                }
            },
            CheckResult::Mismatch => {
                tracing::error!(
                    "HOST KEY MISMATCH for {}:{}! Possible MITM attack!",
                    params.host,
                    params.port
                );
                Err(AppError::Ssh(format!(
                    "Host key for {}:{} has changed (now {}). Remove the old entry from {} if the change is expected.",
                    params.host,
                    params.port,
                    fingerprint,
                    self.known_hosts_path.display()
                )))
            }
            CheckResult::Failure => Err(AppError::Ssh("Failed to check known hosts".to_string())),
        }
    }

    fn authenticate(&self, session: &mut Ssh2Session, params: &ShellParams) -> AppResult<()> {
        match &params.auth {
            ShellAuth::Password(password) => {
                session
                    .userauth_password(&params.username, password)
                    .map_err(|_| AppError::Auth("Password authentication failed".to_string()))?;
            }
            ShellAuth::Key {
                private_key,
                passphrase,
            } => authenticate_with_key(session, &params.username, private_key, passphrase.as_deref())?,
            ShellAuth::Agent => {
                let mut agent = session
                    .agent()
                    .map_err(|_| AppError::Auth("SSH agent not available".to_string()))?;
                agent
                    .connect()
                    .map_err(|_| AppError::Auth("Failed to connect to SSH agent. Is it running?".to_string()))?;
                agent
                    .list_identities()
                    .map_err(|_| AppError::Auth("Failed to list SSH agent identities".to_string()))?;

                let identities = agent.identities().unwrap_or_default();
                if identities.is_empty() {
                    return Err(AppError::Auth(
                        "No password, key or agent identity available".to_string(),
                    ));
                }
                let accepted = identities
                    .iter()
                    .any(|identity| agent.userauth(&params.username, identity).is_ok());
                if !accepted {
                    return Err(AppError::Auth("SSH agent authentication failed".to_string()));
                }
            }
        }

        if !session.authenticated() {
            return Err(AppError::Auth("Authentication failed".to_string()));
        }
        Ok(())
    }

    fn open_shell(&self, session: &mut Ssh2Session, params: &ShellParams) -> AppResult<Channel> {
        let open = || -> AppResult<Channel> {
            let mut ch = session
                .channel_session()
                .map_err(|e| AppError::Ssh(format!("Failed to open channel: {}", e)))?;
            ch.handle_extended_data(ssh2::ExtendedData::Merge)?;
            ch.request_pty(&self.settings.term, None, Some((params.cols, params.rows, 0, 0)))
                .map_err(|e| AppError::Ssh(format!("Failed to request PTY: {}", e)))?;
            Ok(ch)
        };

        let mut ch = open()?;
        match ch.shell() {
            Ok(_) => return Ok(ch),
            Err(e) => {
                tracing::debug!("shell request refused ({}), trying exec fallback", e);
                let _ = ch.close();
            }
        }

        // Some restricted servers only allow exec channels.
        let mut ch = open()?;
        ch.exec("sh -l")
            .map_err(|e| AppError::Ssh(format!("Failed to start interactive shell: {}", e)))?;
        Ok(ch)
    }
}

impl ShellConnector for Ssh2Connector {
    fn open(&self, params: &ShellParams) -> AppResult<Box<dyn ShellChannel>> {
        let tcp = self.connect_tcp(params)?;

        let mut session = Ssh2Session::new()
            .map_err(|e| AppError::Ssh(format!("Failed to create SSH session: {}", e)))?;
        session.set_tcp_stream(tcp);
        session.set_timeout((self.settings.connect_timeout_secs.max(1) * 1000) as u32);
        session.set_keepalive(true, self.settings.keepalive_interval);
        session
            .handshake()
            .map_err(|e| AppError::Ssh(format!("SSH handshake failed: {}", e)))?;

        self.verify_host_key(&session, params)?;
        self.authenticate(&mut session, params)?;
        tracing::info!("SSH authentication successful for {}@{}", params.username, params.host);

        let channel = self.open_shell(&mut session, params)?;
        session.set_blocking(false);

        Ok(Box::new(Ssh2Channel { session, channel }))
    }
}

/// libssh2 only reads keys from files; the key lives in a 0600 temp file
/// for the duration of the call.
fn authenticate_with_key(
    session: &mut Ssh2Session,
    username: &str,
    private_key: &str,
    passphrase: Option<&str>,
) -> AppResult<()> {
    let key_file_path = std::env::temp_dir().join(format!("spicy_key_{}", uuid::Uuid::new_v4()));
    write_key_file(&key_file_path, private_key)?;

    let result = session.userauth_pubkey_file(username, None, &key_file_path, passphrase);
    let _ = std::fs::remove_file(&key_file_path);

    result.map_err(|e| {
        let msg = e.to_string().to_lowercase();
        if msg.contains("passphrase") || msg.contains("decrypt") || msg.contains("parse") {
            AppError::Auth("Invalid passphrase or key format".to_string())
        } else if msg.contains("denied") || msg.contains("auth") {
            AppError::Auth("Private key not accepted by server".to_string())
        } else {
            AppError::Auth("Private key authentication failed".to_string())
        }
    })
}

fn write_key_file(path: &Path, private_key: &str) -> AppResult<()> {
    let mut content = private_key.replace("\r\n", "\n");
    if !content.ends_with('\n') {
        content.push('\n');
    }

    // created 0600 and never opened through an existing path or link
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    options
        .open(path)
        .and_then(|mut file| file.write_all(content.as_bytes()))
        .map_err(|e| AppError::Auth(format!("Failed to write temp key file: {}", e)))
}

struct Ssh2Channel {
    session: Ssh2Session,
    channel: Channel,
}

impl ShellChannel for Ssh2Channel {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.channel.read(buf)
    }

    fn write_all(&mut self, data: &[u8]) -> AppResult<()> {
        self.session.set_blocking(true);
        let mut remaining = data;
        let result = loop {
            if remaining.is_empty() {
                break Ok(());
            }
            let len = remaining.len().min(WRITE_CHUNK_BYTES);
            match self.channel.write(&remaining[..len]) {
                Ok(0) => thread::sleep(Duration::from_millis(4)),
                Ok(n) => remaining = &remaining[n..],
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(AppError::Ssh(format!("Write failed: {}", e))),
            }
        };
        let _ = self.channel.flush();
        self.session.set_blocking(false);
        result
    }

    fn resize(&mut self, cols: u32, rows: u32) -> AppResult<()> {
        self.session.set_blocking(true);
        let result = self.channel.request_pty_size(cols, rows, None, None);
        self.session.set_blocking(false);
        Ok(result?)
    }

    fn eof(&self) -> bool {
        self.channel.eof()
    }

    fn keepalive(&mut self) -> AppResult<()> {
        self.session.set_blocking(true);
        let result = self.session.keepalive_send();
        self.session.set_blocking(false);
        result.map(|_| ()).map_err(AppError::from)
    }

    fn close(&mut self) {
        self.session.set_blocking(true);
        let _ = self.channel.send_eof();
        let _ = self.channel.close();
        let _ = self.channel.wait_close();
        if let Ok(status) = self.channel.exit_status() {
            tracing::debug!("Remote shell exited with status {}", status);
        }
        let _ = self.session.disconnect(None, "session closed", None);
    }
}

/// known_hosts host field: bare host on 22, `[host]:port` otherwise
fn host_entry(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

fn key_type_name(key_type: HostKeyType) -> &'static str {
    match key_type {
        HostKeyType::Rsa => "ssh-rsa",
        HostKeyType::Dss => "ssh-dss",
        HostKeyType::Ecdsa256 => "ecdsa-sha2-nistp256",
        HostKeyType::Ecdsa384 => "ecdsa-sha2-nistp384",
        HostKeyType::Ecdsa521 => "ecdsa-sha2-nistp521",
        HostKeyType::Ed25519 => "ssh-ed25519",
        _ => "unknown",
    }
}

/// SHA256 fingerprint in OpenSSH notation
pub fn compute_sha256_fingerprint(key: &[u8]) -> String {
    let digest = Sha256::digest(key);
    let b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, digest);
    format!("SHA256:{}", b64.trim_end_matches('='))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_format() {
        let fp = compute_sha256_fingerprint(b"test key data");
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
        // 32-byte digest -> 43 unpadded base64 chars
        assert_eq!(fp.len(), "SHA256:".len() + 43);
    }

    #[test]
    fn test_known_hosts_entry_format() {
        assert_eq!(host_entry("10.0.0.5", 22), "10.0.0.5");
        assert_eq!(host_entry("10.0.0.5", 2222), "[10.0.0.5]:2222");
    }

    #[test]
    fn test_key_file_normalized_and_private() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");
        write_key_file(&path, "-----BEGIN KEY-----\r\nabc\r\n-----END KEY-----").unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "-----BEGIN KEY-----\nabc\n-----END KEY-----\n");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_key_file_refuses_existing_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");
        std::fs::write(&path, "planted").unwrap();

        let err = write_key_file(&path, "-----BEGIN KEY-----").unwrap_err();
        assert!(matches!(err, AppError::Auth(_)));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "planted");
    }

    #[test]
    fn test_unreachable_host_is_connection_error() {
        let settings = SshSettings {
            connect_timeout_secs: 1,
            ..SshSettings::default()
        };
        let connector = Ssh2Connector::new(settings, PathBuf::from("/nonexistent/known_hosts"));
        let params = ShellParams {
            profile_id: "p".into(),
            host: "127.0.0.1".into(),
            port: 1,
            username: "u".into(),
            auth: ShellAuth::Agent,
            cols: 80,
            rows: 24,
        };
        let err = connector.open(&params).err().unwrap();
        assert!(matches!(err, AppError::Connection(_)));
    }
}

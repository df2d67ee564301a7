use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use base64::Engine;
use std::net::{IpAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Retrieves a host's TLS certificate as PEM.
#[async_trait]
pub trait CertificateSource: Send + Sync {
    async fn fetch_pem(&self, host: &str, port: u16) -> AppResult<String>;
}

/// Fetches the peer certificate with a bare TLS handshake.
///
/// Verification is off: the point is to learn the certificate, not to trust
/// it.
pub struct TlsCertificateSource {
    timeout: Duration,
}

impl TlsCertificateSource {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CertificateSource for TlsCertificateSource {
    async fn fetch_pem(&self, host: &str, port: u16) -> AppResult<String> {
        let host = host.to_string();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || fetch_der(&host, port, timeout))
            .await
            .map_err(|e| AppError::Certificate(format!("Certificate task failed: {}", e)))?
            .map(|der| pem_encode(&der))
    }
}

fn fetch_der(host: &str, port: u16, timeout: Duration) -> AppResult<Vec<u8>> {
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| AppError::Certificate(format!("Failed to resolve {}: {}", host, e)))?
        .next()
        .ok_or_else(|| AppError::Certificate(format!("No address for {}", host)))?;

    let stream = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| AppError::Certificate(format!("Failed to connect to {}:{}: {}", host, port, e)))?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .use_sni(host.parse::<IpAddr>().is_err())
        .build()
        .map_err(|e| AppError::Certificate(e.to_string()))?;

    let tls = connector
        .connect(host, stream)
        .map_err(|e| AppError::Certificate(format!("TLS handshake with {} failed: {}", host, e)))?;

    let cert = tls
        .peer_certificate()
        .map_err(|e| AppError::Certificate(e.to_string()))?
        .ok_or_else(|| AppError::Certificate(format!("{} presented no certificate", host)))?;

    cert.to_der().map_err(|e| AppError::Certificate(e.to_string()))
}

/// PEM-encode a DER certificate with 64-column base64 lines
pub fn pem_encode(der: &[u8]) -> String {
    let b64 = base64::engine::general_purpose::STANDARD.encode(der);
    let mut pem = String::with_capacity(b64.len() + b64.len() / 64 + 64);
    pem.push_str("-----BEGIN CERTIFICATE-----\n");
    for chunk in b64.as_bytes().chunks(64) {
        // base64 output is ASCII
        pem.push_str(&String::from_utf8_lossy(chunk));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

#[cfg(test)]
mod tests {
    use super::super::fake::{tls_server, SELF_SIGNED_PEM};
    use super::*;

    #[test]
    fn test_pem_layout() {
        let der: Vec<u8> = (0..=255u8).cycle().take(100).collect();
        let pem = pem_encode(&der);
        let lines: Vec<&str> = pem.lines().collect();

        assert_eq!(lines.first(), Some(&"-----BEGIN CERTIFICATE-----"));
        assert_eq!(lines.last(), Some(&"-----END CERTIFICATE-----"));
        let body = &lines[1..lines.len() - 1];
        // 100 bytes -> 136 base64 chars
        assert_eq!(body.iter().map(|l| l.len()).collect::<Vec<_>>(), vec![64, 64, 8]);

        let joined: String = body.concat();
        let decoded = base64::engine::general_purpose::STANDARD.decode(joined).unwrap();
        assert_eq!(decoded, der);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_certificate_error() {
        let source = TlsCertificateSource::new(Duration::from_millis(200));
        let err = source.fetch_pem("127.0.0.1", 1).await.unwrap_err();
        assert!(matches!(err, AppError::Certificate(_)));
    }

    #[tokio::test]
    async fn test_self_signed_certificate_is_read_back() {
        let addr = tls_server("{}");
        let source = TlsCertificateSource::new(Duration::from_secs(5));
        let pem = source.fetch_pem("127.0.0.1", addr.port()).await.unwrap();

        let compact = |s: &str| s.split_whitespace().collect::<String>();
        assert_eq!(compact(&pem), compact(SELF_SIGNED_PEM));
    }
}

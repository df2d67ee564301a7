use crate::config::ClusterSettings;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Path prefix of every cluster API route
pub const API_PREFIX: &str = "/api2/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpMethod::Get => write!(f, "GET"),
            HttpMethod::Post => write!(f, "POST"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// First header with this name, case-insensitive
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Route below the API prefix, query string included
    pub fn path(&self) -> &str {
        match self.url.find(API_PREFIX) {
            Some(idx) => &self.url[idx + API_PREFIX.len()..],
            None => &self.url,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn with_status(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Message the cluster put in an error body, falling back to the status
    pub fn error_message(&self) -> String {
        if let Some(message) = self.body.get("message").and_then(Value::as_str) {
            return message.trim().to_string();
        }
        if let Some(errors) = self.body.get("errors").filter(|e| !e.is_null()) {
            return errors.to_string();
        }
        match &self.body {
            Value::String(text) if !text.is_empty() => text.trim().to_string(),
            _ => format!("HTTP {}", self.status),
        }
    }
}

/// Sends one HTTP exchange to the cluster manager.
///
/// Transport failures are `Network`/`Timeout` errors; any HTTP status,
/// including 4xx/5xx, is a successful exchange.
#[async_trait]
pub trait ApiTransport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> AppResult<ApiResponse>;
}

/// reqwest-backed transport with relaxed certificate checks
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(settings: &ClusterSettings) -> AppResult<Self> {
        Self::with_timeout(settings.request_timeout(), settings.accept_invalid_certs)
    }

    /// Client whose requests fail with `Timeout` once `timeout` elapses
    pub fn with_timeout(timeout: Duration, accept_invalid_certs: bool) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .user_agent(concat!("spicy/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AppError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl ApiTransport for HttpTransport {
    async fn send(&self, request: ApiRequest) -> AppResult<ApiResponse> {
        tracing::debug!("{} {}", request.method, request.path());

        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;

        let body = if text.trim().is_empty() {
            Value::String(status.canonical_reason().unwrap_or_default().to_string())
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        Ok(ApiResponse {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::fake::tls_server;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_path_strips_prefix() {
        let req = ApiRequest::new(HttpMethod::Get, "https://10.0.0.2:8006/api2/json/nodes/pve/qemu?full=1");
        assert_eq!(req.path(), "/nodes/pve/qemu?full=1");
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let req = ApiRequest::new(HttpMethod::Get, "https://h/api2/json/nodes").header("Cookie", "PVEAuthCookie=T");
        assert_eq!(req.header_value("cookie"), Some("PVEAuthCookie=T"));
        assert_eq!(req.header_value("CSRFPreventionToken"), None);
    }

    #[test]
    fn test_error_message_sources() {
        let r = ApiResponse::with_status(500, json!({"data": null, "message": "VM 100 not running\n"}));
        assert_eq!(r.error_message(), "VM 100 not running");

        let r = ApiResponse::with_status(400, json!({"errors": {"vmid": "invalid"}}));
        assert!(r.error_message().contains("vmid"));

        let r = ApiResponse::with_status(401, Value::String("authentication failure".into()));
        assert_eq!(r.error_message(), "authentication failure");

        let r = ApiResponse::with_status(502, Value::Null);
        assert_eq!(r.error_message(), "HTTP 502");
        assert!(!r.is_success());
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            // hold the connection open without answering
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        });

        let transport = HttpTransport::with_timeout(Duration::from_millis(200), true).unwrap();
        let started = std::time::Instant::now();
        let err = transport
            .send(ApiRequest::new(HttpMethod::Get, format!("http://{}/api2/json/version", addr)))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Timeout(_)), "{:?}", err);
        assert!(started.elapsed() < Duration::from_secs(5));
        server.abort();
    }

    #[tokio::test]
    async fn test_self_signed_cluster_accepted_only_when_allowed() {
        let addr = tls_server(r#"{"data":{"version":"8.1.4"}}"#);
        let url = format!("https://{}/api2/json/version", addr);

        let relaxed = HttpTransport::with_timeout(Duration::from_secs(5), true).unwrap();
        let response = relaxed.send(ApiRequest::new(HttpMethod::Get, url.clone())).await.unwrap();
        assert!(response.is_success());
        assert_eq!(response.body["data"]["version"], "8.1.4");

        let strict = HttpTransport::with_timeout(Duration::from_secs(5), false).unwrap();
        let err = strict.send(ApiRequest::new(HttpMethod::Get, url)).await.unwrap_err();
        assert!(matches!(err, AppError::Network(_)), "{:?}", err);
    }
}

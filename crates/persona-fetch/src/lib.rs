use async_trait::async_trait;
use persona_core::HttpMethod;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::net::IpAddr;
use std::time::Duration;
use tracing::instrument;
use url::{Host, Url};

pub mod mock;

pub use persona_error::{PersonaError, Result};

static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Outbound request for web-page ingestion and tool calls.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
    /// Stop reading the body after this many bytes
    pub max_body_bytes: Option<usize>,
}

impl HttpRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: HttpMethod::Get,
            url,
            headers: Vec::new(),
            body: None,
            timeout: None,
            max_body_bytes: None,
        }
    }

    pub fn post(url: Url, body: Vec<u8>) -> Self {
        Self {
            method: HttpMethod::Post,
            body: Some(body),
            ..Self::get(url)
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = Some(limit);
        self
    }

    /// Case-insensitive header lookup.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    /// Body was cut at `max_body_bytes`
    pub truncated: bool,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| {
                let essence = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
                essence == "application/json" || essence.ends_with("+json")
            })
            .unwrap_or(false)
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[async_trait]
pub trait HttpFetch: Send + Sync {
    async fn fetch(&self, req: HttpRequest) -> Result<HttpResponse>;
}

/// True when the URL host is `localhost`, a loopback IP literal or the
/// unspecified address (`0.0.0.0` / `::` connect to the local host).
pub fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(d)) => {
            let d = d.trim_end_matches('.').to_ascii_lowercase();
            d == "localhost" || d.ends_with(".localhost")
        }
        Some(Host::Ipv4(ip)) => is_local_ip(IpAddr::V4(ip)),
        Some(Host::Ipv6(ip)) => {
            is_local_ip(IpAddr::V6(ip))
                || ip.to_ipv4_mapped().is_some_and(|v4| is_local_ip(IpAddr::V4(v4)))
        }
        None => false,
    }
}

fn is_local_ip(ip: IpAddr) -> bool {
    ip.is_loopback() || ip.is_unspecified()
}

const MAX_REDIRECTS: usize = 5;

/// Redirect policy that re-applies the loopback guard on every hop.
fn redirect_policy(allow_loopback: bool) -> reqwest::redirect::Policy {
    reqwest::redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            attempt.error("too many redirects")
        } else if !allow_loopback && is_loopback(attempt.url()) {
            tracing::warn!(target_url = %attempt.url(), "Blocked redirect to loopback address");
            attempt.error("redirect to a loopback address is not allowed")
        } else {
            attempt.follow()
        }
    })
}

#[derive(Clone)]
pub struct ReqwestFetch {
    http: Client,
}

impl ReqwestFetch {
    /// `allow_loopback` lets redirects land on loopback hosts; keep it off
    /// unless tool endpoints on the local host are expected.
    pub fn new(allow_loopback: bool) -> Result<Self> {
        let http = Client::builder()
            .user_agent(APP_USER_AGENT)
            .redirect(redirect_policy(allow_loopback))
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl HttpFetch for ReqwestFetch {
    #[instrument(skip(self, req), fields(method = %req.method, url = %req.url))]
    async fn fetch(&self, req: HttpRequest) -> Result<HttpResponse> {
        let method = match req.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
        };
        let timeout_ms = req.timeout.map(|t| t.as_millis() as u64);
        let map_err = |e: reqwest::Error| match (e.is_timeout(), timeout_ms) {
            (true, Some(timeout_ms)) => PersonaError::Timeout {
                operation: "fetch".to_string(),
                timeout_ms,
            },
            _ => PersonaError::from(e),
        };

        let mut builder = self.http.request(method, req.url.clone());
        for (name, value) in &req.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = req.body {
            builder = builder.body(body);
        }
        if let Some(timeout) = req.timeout {
            builder = builder.timeout(timeout);
        }

        let mut resp = builder.send().await.map_err(map_err)?;
        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut body = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = resp.chunk().await.map_err(map_err)? {
            if let Some(limit) = req.max_body_bytes {
                if body.len() + chunk.len() > limit {
                    body.extend_from_slice(&chunk[..limit - body.len()]);
                    truncated = true;
                    break;
                }
            }
            body.extend_from_slice(&chunk);
        }

        tracing::debug!(status, bytes = body.len(), truncated, "fetch completed");
        Ok(HttpResponse {
            status,
            content_type,
            body,
            truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_loopback_detection() {
        assert!(is_loopback(&url("http://localhost:8080/x")));
        assert!(is_loopback(&url("http://LOCALHOST/x")));
        assert!(is_loopback(&url("http://127.0.0.1/x")));
        assert!(is_loopback(&url("http://127.10.0.3/x")));
        assert!(is_loopback(&url("http://[::1]/x")));
        assert!(is_loopback(&url("http://[::ffff:127.0.0.1]/x")));
        assert!(!is_loopback(&url("https://api.example.com/weather")));
        assert!(!is_loopback(&url("http://10.0.0.1/")));
    }

    #[test]
    fn test_unspecified_address_is_local() {
        assert!(is_loopback(&url("http://0.0.0.0:8080/admin")));
        assert!(is_loopback(&url("http://0/admin")));
        assert!(is_loopback(&url("http://[::]/admin")));
        assert!(is_loopback(&url("http://[::ffff:0.0.0.0]/admin")));
        assert!(!is_loopback(&url("http://192.0.2.2/public")));
    }

    /// Serves `/start` as a redirect to `/admin` on the same listener and
    /// counts hits on `/admin`.
    async fn redirecting_server() -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let admin_hits = Arc::new(AtomicUsize::new(0));
        let hits = admin_hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = vec![0u8; 4096];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let head = String::from_utf8_lossy(&buf[..n]).to_string();
                let resp = if head.starts_with("GET /start") {
                    format!(
                        "HTTP/1.1 302 Found\r\nLocation: http://127.0.0.1:{port}/admin\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                    )
                } else {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let body = r#"{"secret":"internal"}"#;
                    format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    )
                };
                let _ = socket.write_all(resp.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (port, admin_hits)
    }

    #[tokio::test]
    async fn test_redirect_to_loopback_is_refused() {
        let (port, admin_hits) = redirecting_server().await;
        let fetch = ReqwestFetch::new(false).unwrap();
        let req = HttpRequest::get(url(&format!("http://127.0.0.1:{port}/start")))
            .timeout(Duration::from_secs(5));

        assert!(fetch.fetch(req).await.is_err());
        assert_eq!(admin_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_redirect_to_loopback_with_override() {
        let (port, admin_hits) = redirecting_server().await;
        let fetch = ReqwestFetch::new(true).unwrap();
        let req = HttpRequest::get(url(&format!("http://127.0.0.1:{port}/start")))
            .timeout(Duration::from_secs(5));

        let resp = fetch.fetch(req).await.unwrap();
        assert_eq!(resp.status, 200);
        assert!(resp.text_lossy().contains("secret"));
        assert_eq!(admin_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_response_content_type() {
        let resp = HttpResponse {
            status: 200,
            content_type: Some("application/json; charset=utf-8".into()),
            body: b"{}".to_vec(),
            truncated: false,
        };
        assert!(resp.is_success());
        assert!(resp.is_json());

        let html = HttpResponse {
            status: 404,
            content_type: Some("text/html".into()),
            body: Vec::new(),
            truncated: false,
        };
        assert!(!html.is_success());
        assert!(!html.is_json());
    }

    #[test]
    fn test_request_builder() {
        let req = HttpRequest::post(url("https://example.com/api"), b"{}".to_vec())
            .header("Content-Type", "application/json")
            .timeout(Duration::from_secs(2));
        assert_eq!(req.method, HttpMethod::Post);
        assert_eq!(req.header_value("content-type"), Some("application/json"));
        assert_eq!(req.timeout, Some(Duration::from_secs(2)));
    }
}

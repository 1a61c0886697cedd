//! HTTP client for peer agents exposing `POST /process` and `GET /health`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::config::RemoteConfig;
use crate::error::{PipelineError, RemoteCallError, RemoteErrorKind, Result};
use crate::protocol::{AgentRequest, AgentResponse, ErrorBody};
use crate::retry::{RetryFailure, RetryObserver, RetryPolicy};
use crate::workflow::AgentEndpoint;

pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Calls one remote agent with retry. Cheap to clone; clones share the
/// underlying connection pool.
#[derive(Clone)]
pub struct RemoteAgentClient {
    http: reqwest::Client,
    base_url: String,
    process_path: String,
    health_path: String,
    request_timeout: Duration,
    health_timeout: Duration,
    retry: RetryPolicy,
    observer: Option<Arc<dyn RetryObserver>>,
}

impl RemoteAgentClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::from_config(base_url, &RemoteConfig::default())
    }

    pub fn from_config(base_url: impl Into<String>, cfg: &RemoteConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            process_path: cfg.process_path.clone(),
            health_path: cfg.health_path.clone(),
            request_timeout: Duration::from_millis(cfg.request_timeout_ms),
            health_timeout: Duration::from_millis(cfg.health_timeout_ms),
            retry: RetryPolicy::from(&cfg.retry),
            observer: None,
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    pub fn with_paths(mut self, process_path: impl Into<String>, health_path: impl Into<String>) -> Self {
        self.process_path = process_path.into();
        self.health_path = health_path.into();
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RetryObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    pub async fn call(&self, request: &AgentRequest) -> Result<AgentResponse> {
        self.call_with_deadline(request, None).await
    }

    pub async fn call_with_deadline(
        &self,
        request: &AgentRequest,
        deadline: Option<Instant>,
    ) -> Result<AgentResponse> {
        self.call_with_attempts(request, deadline)
            .await
            .map_err(|failure| PipelineError::RemoteCall(failure.error))
    }

    /// Like [`call_with_deadline`](Self::call_with_deadline) but keeps the
    /// full attempt log on failure.
    pub async fn call_with_attempts(
        &self,
        request: &AgentRequest,
        deadline: Option<Instant>,
    ) -> std::result::Result<AgentResponse, RetryFailure> {
        let url = self.url(&self.process_path);
        tracing::debug!(
            url = %url,
            correlation_id = %request.correlation_id,
            "calling remote agent"
        );
        self.retry
            .run(
                |_attempt| self.attempt(&url, request, deadline),
                deadline,
                self.observer.as_deref(),
            )
            .await
    }

    async fn attempt(
        &self,
        url: &str,
        request: &AgentRequest,
        deadline: Option<Instant>,
    ) -> std::result::Result<AgentResponse, RemoteCallError> {
        let timeout = match deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(RemoteCallError::new(
                        RemoteErrorKind::Timeout,
                        "deadline passed before the attempt started",
                    ));
                }
                left.min(self.request_timeout)
            }
            None => self.request_timeout,
        };

        let response = self
            .http
            .post(url)
            .header(CORRELATION_HEADER, request.correlation_id.as_str())
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|err| RemoteCallError::from_reqwest(&err))?;

        let status = response.status();
        if status.is_success() {
            return response.json::<AgentResponse>().await.map_err(|err| {
                let mut decoded = RemoteCallError::from_reqwest(&err);
                if !err.is_timeout() {
                    decoded.kind = RemoteErrorKind::Decode;
                }
                decoded.with_status(status.as_u16())
            });
        }

        let message = match response.text().await {
            Ok(body) => match serde_json::from_str::<ErrorBody>(&body) {
                Ok(parsed) => format!("{}: {}", parsed.error.kind, parsed.error.message),
                Err(_) if body.is_empty() => format!("HTTP {status}"),
                Err(_) => format!("HTTP {status}: {}", truncate(&body, 512)),
            },
            Err(err) => format!("HTTP {status} (error body could not be read: {err})"),
        };
        Err(RemoteCallError::new(RemoteErrorKind::from_status(status.as_u16()), message)
            .with_status(status.as_u16()))
    }

    /// `true` when the peer answers its health path with a 2xx in time.
    pub async fn health_check(&self) -> bool {
        let url = self.url(&self.health_path);
        match self.http.get(&url).timeout(self.health_timeout).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                tracing::debug!(url = %url, error = %err, "health check failed");
                false
            }
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => format!("{}...", &text[..index]),
        None => text.to_string(),
    }
}

#[async_trait]
impl AgentEndpoint for RemoteAgentClient {
    async fn call(&self, request: AgentRequest, deadline: Option<Instant>) -> Result<AgentResponse> {
        self.call_with_deadline(&request, deadline).await
    }

    async fn health_check(&self) -> bool {
        RemoteAgentClient::health_check(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_paths_without_double_slashes() {
        let client = RemoteAgentClient::new("http://agent:8000/");
        assert_eq!(client.url("/process"), "http://agent:8000/process");
        assert_eq!(client.url("health"), "http://agent:8000/health");
    }

    #[test]
    fn config_drives_policy() {
        let mut cfg = RemoteConfig::default();
        cfg.retry.max_retries = 1;
        cfg.process_path = "/v1/run".into();
        let client = RemoteAgentClient::from_config("http://agent", &cfg);
        assert_eq!(client.retry_policy().max_attempts(), 2);
        assert_eq!(client.url(&client.process_path), "http://agent/v1/run");
    }

    #[test]
    fn truncates_long_bodies_on_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé...");
        assert_eq!(truncate("hi", 10), "hi");
    }

    async fn read_request(stream: &mut tokio::net::TcpStream) {
        use tokio::io::AsyncReadExt;

        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    return;
                }
            }
        }
    }

    #[tokio::test]
    async fn truncated_error_body_is_reported() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_request(&mut stream).await;
            stream
                .write_all(b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 100\r\n\r\npartial")
                .await
                .unwrap();
            stream.shutdown().await.unwrap();
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
        });

        let client = RemoteAgentClient::new(format!("http://{addr}"))
            .with_retry_policy(RetryPolicy::no_retries());
        let failure = client
            .call_with_attempts(&AgentRequest::new("x"), None)
            .await
            .unwrap_err();

        assert_eq!(failure.error.status, Some(503));
        assert_eq!(failure.error.kind, RemoteErrorKind::ServerBusy);
        assert!(
            failure.error.message.contains("error body could not be read"),
            "{}",
            failure.error.message
        );
    }

    #[tokio::test]
    async fn unreachable_peer_is_unhealthy() {
        let client = RemoteAgentClient::new("http://127.0.0.1:1")
            .with_health_timeout(Duration::from_millis(200));
        assert!(!client.health_check().await);
    }
}

//! HTTP transport implementation
//!
//! Streamable HTTP: every call is one POST whose response body is the
//! JSON-RPC response, either as `application/json` or as a single
//! `text/event-stream` event. There is no long-lived connection; the
//! transport counts as connected when the last exchange reached the server.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, header};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::Transport;
use crate::protocol::{
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION, RequestId,
};
use crate::{Error, Result};

const SESSION_HEADER: &str = "mcp-session-id";

/// HTTP transport for remote MCP servers
pub struct HttpTransport {
    /// Backend id (for logs)
    label: String,
    /// HTTP client
    client: Client,
    /// Endpoint URL
    url: String,
    /// Custom headers
    headers: header::HeaderMap,
    /// Session ID issued by the server
    session_id: RwLock<Option<String>>,
    /// Request ID counter
    request_id: AtomicU64,
    /// Last exchange reached the server
    reachable: AtomicBool,
    /// Initialize handshake completed
    initialized: AtomicBool,
    /// Closed by the supervisor
    closed: AtomicBool,
}

impl HttpTransport {
    /// Create a new HTTP transport
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an invalid header name or value, or if the
    /// HTTP client cannot be built.
    pub fn new(label: &str, url: &str, headers: &HashMap<String, String>) -> Result<Arc<Self>> {
        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| Error::Config(format!("HTTP client: {e}")))?;

        let mut header_map = header::HeaderMap::new();
        for (key, value) in headers {
            let name = key
                .parse::<header::HeaderName>()
                .map_err(|e| Error::Config(format!("Backend '{label}': header '{key}': {e}")))?;
            let value = value
                .parse::<header::HeaderValue>()
                .map_err(|e| Error::Config(format!("Backend '{label}': header '{key}': {e}")))?;
            header_map.insert(name, value);
        }

        Ok(Arc::new(Self {
            label: label.to_string(),
            client,
            url: url.to_string(),
            headers: header_map,
            session_id: RwLock::new(None),
            request_id: AtomicU64::new(1),
            reachable: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    /// Run the MCP initialize handshake
    ///
    /// # Errors
    ///
    /// Returns the network or protocol error of the handshake.
    pub async fn initialize(&self, timeout: Duration) -> Result<()> {
        let request = JsonRpcRequest::new(
            self.next_id(),
            "initialize",
            Some(serde_json::json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "policy-gateway",
                    "version": env!("CARGO_PKG_VERSION")
                }
            })),
        );

        self.send_request(&request, timeout)
            .await?
            .into_result()
            .map_err(|e| Error::Protocol(format!("Initialize failed: {e}")))?;

        self.notify("notifications/initialized", None).await?;

        self.initialized.store(true, Ordering::Relaxed);
        info!(backend = %self.label, url = %self.url, "HTTP transport initialized");
        Ok(())
    }

    /// POST one message, tracking reachability and the session id
    async fn post<T: Serialize + Sync>(
        &self,
        body: &T,
        timeout: Duration,
    ) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .post(&self.url)
            .timeout(timeout)
            .headers(self.headers.clone())
            .header(header::ACCEPT, "application/json, text/event-stream")
            .header("MCP-Protocol-Version", PROTOCOL_VERSION)
            .json(body);
        if let Some(ref session_id) = *self.session_id.read() {
            request = request.header(SESSION_HEADER, session_id);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                self.reachable.store(false, Ordering::Relaxed);
                return Err(if e.is_timeout() {
                    Error::Timeout(format!("'{}' timed out after {}ms", self.label, timeout.as_millis()))
                } else {
                    Error::Network(format!("'{}': {e}", self.label))
                });
            }
        };
        self.reachable.store(true, Ordering::Relaxed);

        if let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut session = self.session_id.write();
            if session.as_deref() != Some(id) {
                debug!(backend = %self.label, session_id = %id, "Stored session ID from response");
                *session = Some(id.to_string());
            }
        }

        let status = response.status();
        if status.is_server_error() {
            return Err(Error::Network(format!("'{}' returned HTTP {status}", self.label)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Protocol(format!(
                "'{}' returned HTTP {status}: {body}",
                self.label
            )));
        }

        Ok(response)
    }

    /// Send a request and parse the response body
    async fn send_request(
        &self,
        request: &JsonRpcRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse> {
        let response = self.post(request, timeout).await?;

        let is_sse = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("text/event-stream"));

        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(format!("'{}' body timed out", self.label))
            } else {
                Error::Network(format!("'{}': failed to read body: {e}", self.label))
            }
        })?;

        parse_body(&text, is_sse)
    }

    /// Get next request ID
    fn next_id(&self) -> RequestId {
        RequestId::Number(self.request_id.fetch_add(1, Ordering::Relaxed).into())
    }
}

/// Parse a response body, taking the first `data:` event of an SSE body
fn parse_body(text: &str, is_sse: bool) -> Result<JsonRpcResponse> {
    if !is_sse {
        return serde_json::from_str(text)
            .map_err(|e| Error::Protocol(format!("Failed to parse response: {e}")));
    }

    text.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .find(|data| !data.is_empty())
        .ok_or_else(|| Error::Protocol("No data in SSE response".to_string()))
        .and_then(|data| {
            serde_json::from_str(data)
                .map_err(|e| Error::Protocol(format!("Failed to parse SSE data: {e}")))
        })
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::BackendUnavailable(format!("'{}' is closed", self.label)));
        }
        if !self.initialized.load(Ordering::Relaxed) {
            self.initialize(timeout).await?;
        }

        let request = JsonRpcRequest::new(self.next_id(), method, params);
        self.send_request(&request, timeout).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcNotification::new(method, params);
        let response = self.post(&notification, Duration::from_secs(10)).await?;
        if !response.status().is_success() {
            warn!(backend = %self.label, status = %response.status(), "Notification failed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Relaxed) && self.reachable.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        self.reachable.store(false, Ordering::Relaxed);

        let session_id = self.session_id.write().take();
        if let Some(id) = session_id {
            let _ = self
                .client
                .delete(&self.url)
                .header(SESSION_HEADER, id)
                .timeout(Duration::from_secs(5))
                .send()
                .await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_plain_json_body() {
        let resp = parse_body(r#"{"jsonrpc":"2.0","id":3,"result":{"tools":[]}}"#, false).unwrap();
        assert_eq!(resp.id, RequestId::Number(3.into()));
        assert_eq!(resp.result, Some(json!({"tools": []})));
    }

    #[test]
    fn parses_single_sse_event() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n\n";
        let resp = parse_body(body, true).unwrap();
        assert_eq!(resp.id, RequestId::Number(1.into()));
    }

    #[test]
    fn empty_sse_body_is_protocol_error() {
        assert!(matches!(parse_body("event: ping\n\n", true), Err(Error::Protocol(_))));
    }

    #[test]
    fn invalid_header_is_config_error() {
        let headers = HashMap::from([("bad header".to_string(), "x".to_string())]);
        let err = HttpTransport::new("remote", "http://localhost:1/mcp", &headers)
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn unreachable_server_is_retryable_network_error() {
        let transport = HttpTransport::new("remote", "http://127.0.0.1:9/mcp", &HashMap::new()).unwrap();

        let err = transport
            .request("ping", None, Duration::from_secs(2))
            .await
            .unwrap_err();

        assert!(err.is_retryable(), "{err:?}");
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn closed_transport_is_unavailable() {
        let transport = HttpTransport::new("remote", "http://127.0.0.1:9/mcp", &HashMap::new()).unwrap();
        transport.close().await.unwrap();
        assert!(matches!(
            transport.request("ping", None, Duration::from_secs(1)).await,
            Err(Error::BackendUnavailable(_))
        ));
    }
}

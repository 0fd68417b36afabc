//! Protocol client transports for backends

mod http;
mod stdio;

pub use self::http::HttpTransport;
pub use self::stdio::StdioTransport;

use std::time::Duration;

use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use serde_json::Value;
use tracing::debug;

use crate::failsafe::RetryPolicy;
use crate::{Result, protocol::JsonRpcResponse};

/// Transport trait for MCP communication with one backend
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait at most `timeout` for the paired response
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse>;

    /// Send a notification (no response expected)
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Check if the transport can take calls
    fn is_connected(&self) -> bool;

    /// Reject outstanding calls and release the connection
    async fn close(&self) -> Result<()>;

    /// Frames received that could not be parsed
    fn malformed_frames(&self) -> u64 {
        0
    }

    /// Resolves when the underlying connection ends, with the exit code if known
    ///
    /// Transports without a long-lived connection never resolve.
    async fn closed(&self) -> Option<i32> {
        std::future::pending().await
    }
}

/// Issue a call, reissuing it after a fixed delay on retryable failures
///
/// Backend errors (JSON-RPC error responses) are returned as
/// [`crate::Error::JsonRpc`] and never retried.
///
/// # Errors
///
/// Returns the last error once retries are exhausted, or the first
/// non-retryable error.
pub async fn call_with_retry(
    transport: &dyn Transport,
    method: &str,
    params: Option<Value>,
    timeout: Duration,
    policy: &RetryPolicy,
) -> Result<Value> {
    let attempt = || async {
        transport
            .request(method, params.clone(), timeout)
            .await?
            .into_result()
    };

    if !policy.enabled || policy.max_retries == 0 {
        return attempt().await;
    }

    attempt
        .retry(
            ConstantBuilder::default()
                .with_delay(policy.delay)
                .with_max_times(policy.max_retries),
        )
        .sleep(tokio::time::sleep)
        .when(crate::Error::is_retryable)
        .notify(|e, delay| {
            debug!(method, delay_ms = delay.as_millis() as u64, error = %e, "Retrying call");
        })
        .await
}

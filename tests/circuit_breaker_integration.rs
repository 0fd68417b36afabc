//! Circuit breaker integration tests: per-backend configuration and recovery

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use policy_gateway::backend::{BackendDescriptor, Launch, Supervisor};
use policy_gateway::config::{CircuitBreakerConfig, FailsafeConfig};
use policy_gateway::failsafe::{CircuitBreaker, CircuitState, RetryPolicy};
use policy_gateway::protocol::{JsonRpcResponse, RequestId};
use policy_gateway::transport::Transport;
use policy_gateway::{Error, Result};

fn config(failure_threshold: u32, success_threshold: u32, reset_timeout: Duration) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        enabled: true,
        failure_threshold,
        success_threshold,
        reset_timeout,
    }
}

// ── Thresholds ────────────────────────────────────────────────────────

#[test]
fn strict_config_opens_early() {
    let cb = CircuitBreaker::new("strict", &config(2, 1, Duration::from_secs(60)));

    cb.record_failure();
    assert!(cb.can_proceed());

    cb.record_failure();
    assert!(!cb.can_proceed());
    assert_eq!(cb.state(), CircuitState::Open);
}

#[test]
fn lenient_config_tolerates_flaky_backend() {
    let cb = CircuitBreaker::new("flaky", &config(10, 1, Duration::from_secs(30)));

    for _ in 0..9 {
        cb.record_failure();
    }
    assert!(cb.can_proceed());

    cb.record_failure();
    assert!(!cb.can_proceed());
}

#[test]
fn success_resets_the_failure_count() {
    let cb = CircuitBreaker::new("intermittent", &config(3, 1, Duration::from_secs(30)));

    cb.record_failure();
    cb.record_failure();
    cb.record_success();
    cb.record_failure();
    cb.record_failure();

    assert_eq!(cb.state(), CircuitState::Closed);
}

#[test]
fn disabled_breaker_never_opens() {
    let cb = CircuitBreaker::new(
        "disabled",
        &CircuitBreakerConfig {
            enabled: false,
            ..config(3, 1, Duration::from_secs(30))
        },
    );

    for _ in 0..100 {
        cb.record_failure();
    }

    assert!(cb.try_acquire());
    assert_eq!(cb.state(), CircuitState::Closed);
}

#[test]
fn backends_trip_independently() {
    let cfg = config(3, 1, Duration::from_secs(30));
    let a = CircuitBreaker::new("backend-a", &cfg);
    let b = CircuitBreaker::new("backend-b", &cfg);

    for _ in 0..3 {
        a.record_failure();
    }

    assert_eq!(a.state(), CircuitState::Open);
    assert_eq!(b.state(), CircuitState::Closed);
}

// ── Half-open recovery ────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn half_open_admits_one_probe_and_closes_on_success() {
    // GIVEN: an open circuit
    let cb = CircuitBreaker::new("recovering", &config(1, 2, Duration::from_secs(30)));
    cb.record_failure();
    assert!(!cb.try_acquire());

    // WHEN: the reset timeout elapses
    tokio::time::advance(Duration::from_secs(31)).await;

    // THEN: exactly one probe is admitted at a time
    assert!(cb.try_acquire());
    assert_eq!(cb.state(), CircuitState::HalfOpen);
    assert!(!cb.try_acquire());

    cb.record_success();
    assert!(cb.try_acquire());
    cb.record_success();
    assert_eq!(cb.state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn failed_probe_reopens() {
    let cb = CircuitBreaker::new("relapsing", &config(1, 1, Duration::from_secs(30)));
    cb.record_failure();
    tokio::time::advance(Duration::from_secs(31)).await;

    assert!(cb.try_acquire());
    cb.record_failure();

    assert_eq!(cb.state(), CircuitState::Open);
    assert!(!cb.can_proceed());
}

// ── Through a backend handle ──────────────────────────────────────────

struct Unreachable;

#[async_trait]
impl Transport for Unreachable {
    async fn request(&self, _method: &str, _params: Option<Value>, _timeout: Duration) -> Result<JsonRpcResponse> {
        Err(Error::Network("connection refused".to_string()))
    }

    async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<()> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct Refusing;

#[async_trait]
impl Transport for Refusing {
    async fn request(&self, _method: &str, _params: Option<Value>, _timeout: Duration) -> Result<JsonRpcResponse> {
        Ok(JsonRpcResponse::error(RequestId::Number(1.into()), -32602, "bad arguments"))
    }

    async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<()> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn failsafe() -> FailsafeConfig {
    FailsafeConfig {
        circuit_breaker: config(2, 1, Duration::from_secs(30)),
        ..FailsafeConfig::default()
    }
}

fn descriptor(id: &str) -> Arc<BackendDescriptor> {
    Arc::new(BackendDescriptor::new(
        id,
        format!("{id}."),
        Launch::Http {
            url: "http://127.0.0.1:1/mcp".to_string(),
        },
    ))
}

#[tokio::test]
async fn open_circuit_fails_fast_without_touching_transport() {
    // GIVEN: a backend whose transport always fails
    let supervisor = Supervisor::new(failsafe(), CancellationToken::new());
    let backend = supervisor.install(descriptor("down"), Arc::new(Unreachable)).await;

    // WHEN: calls fail up to the threshold
    for _ in 0..2 {
        let err = backend.call("tools/list", None, &RetryPolicy::none()).await.unwrap_err();
        assert!(matches!(err, Error::Network(_)));
    }

    // THEN: the next call is refused by the breaker
    let err = backend.call("tools/list", None, &RetryPolicy::none()).await.unwrap_err();
    assert!(matches!(err, Error::BackendUnavailable(_)), "got {err:?}");
    assert_eq!(backend.status().circuit_state, CircuitState::Open);
}

#[tokio::test]
async fn backend_errors_do_not_trip_the_breaker() {
    let supervisor = Supervisor::new(failsafe(), CancellationToken::new());
    let backend = supervisor.install(descriptor("picky"), Arc::new(Refusing)).await;

    for _ in 0..5 {
        let err = backend.call("tools/call", None, &RetryPolicy::none()).await.unwrap_err();
        assert!(matches!(err, Error::JsonRpc { code: -32602, .. }));
    }

    assert_eq!(backend.status().circuit_state, CircuitState::Closed);
}

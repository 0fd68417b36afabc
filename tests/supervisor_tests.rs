//! Supervisor tests against real subprocesses

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use policy_gateway::Error;
use policy_gateway::backend::{BackendDescriptor, Launch, Supervisor};
use policy_gateway::config::{FailsafeConfig, SupervisorConfig};
use policy_gateway::failsafe::RetryPolicy;

/// Completes the handshake, reads the initialized notification, then crashes
const CRASH_AFTER_HANDSHAKE: &str = r#"read line
printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-11-25","capabilities":{},"serverInfo":{"name":"crashy","version":"0"}}}'
read line
exit 1"#;

/// Completes the handshake, then answers every request with an empty result
const ECHO_SERVER: &str = r#"read line
printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-11-25","capabilities":{},"serverInfo":{"name":"echo","version":"0"}}}'
read line
id=2
while read line; do
  printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id"
  id=$((id + 1))
done"#;

fn process(id: &str, script: &str) -> Arc<BackendDescriptor> {
    let mut desc = BackendDescriptor::new(
        id,
        format!("{id}."),
        Launch::Process {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: None,
        },
    );
    desc.timeout = Duration::from_secs(5);
    Arc::new(desc)
}

fn supervisor(max_restarts: u32) -> Arc<Supervisor> {
    Supervisor::new(
        FailsafeConfig {
            supervisor: SupervisorConfig {
                max_restarts,
                restart_backoff: Duration::from_millis(10),
            },
            ..FailsafeConfig::default()
        },
        CancellationToken::new(),
    )
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn crash_looping_backend_is_retired_at_the_ceiling() {
    // GIVEN: a backend that exits right after every handshake
    let supervisor = supervisor(5);
    let desc = process("crashy", CRASH_AFTER_HANDSHAKE);

    // WHEN: it is spawned and left to crash
    supervisor.spawn(Arc::clone(&desc)).await.unwrap();

    // THEN: after five restarts the sixth crash retires it
    assert!(
        wait_until(|| supervisor.is_retired("crashy")).await,
        "backend was never retired"
    );
    assert!(supervisor.get("crashy").is_none());

    // AND: further calls fail fast without relaunching
    let err = supervisor.ensure(Arc::clone(&desc)).await.unwrap_err();
    assert!(matches!(err, Error::BackendUnavailable(_)), "got {err:?}");
    assert!(supervisor.get("crashy").is_none());
}

#[tokio::test]
async fn explicit_spawn_revives_a_retired_backend() {
    let supervisor = supervisor(0);
    let desc = process("phoenix", CRASH_AFTER_HANDSHAKE);

    supervisor.spawn(Arc::clone(&desc)).await.unwrap();
    assert!(wait_until(|| supervisor.is_retired("phoenix")).await);

    let revived = supervisor.spawn(Arc::clone(&desc)).await.unwrap();

    assert_eq!(revived.restart_count(), 0);
}

#[tokio::test]
async fn healthy_backend_answers_calls_and_stops_cleanly() {
    // GIVEN: a running stdio backend
    let supervisor = supervisor(5);
    let backend = supervisor.spawn(process("echo", ECHO_SERVER)).await.unwrap();

    // WHEN: calling it
    let result = backend.call("tools/list", None, &RetryPolicy::none()).await.unwrap();

    // THEN: the paired response comes back
    assert_eq!(result, serde_json::json!({}));
    assert!(supervisor.is_running("echo"));

    // AND: stopping does not trigger a restart
    supervisor.stop("echo").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(supervisor.get("echo").is_none());
    assert!(!supervisor.is_retired("echo"));
}

#[tokio::test]
async fn missing_program_fails_to_spawn() {
    let supervisor = supervisor(5);
    let desc = Arc::new(BackendDescriptor::new(
        "ghost",
        "ghost.",
        Launch::Process {
            command: "/nonexistent/policy-gateway-backend".to_string(),
            args: Vec::new(),
            cwd: None,
        },
    ));

    let err = supervisor.spawn(desc).await.unwrap_err();

    assert!(matches!(err, Error::Process(_)), "got {err:?}");
    assert!(supervisor.get("ghost").is_none());
}

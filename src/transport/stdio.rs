//! Stdio transport implementation (subprocess)
//!
//! Requests are written to the child's stdin as one JSON object per line.
//! A reader task splits stdout on `\n` and pairs each response with its
//! pending call by numeric id. A waiter task owns the `Child`; it publishes
//! the exit code and rejects whatever is still pending.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Transport;
use crate::protocol::{
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION, RequestId,
};
use crate::{Error, Result};

type PendingMap = DashMap<u64, oneshot::Sender<Result<JsonRpcResponse>>>;

/// How long the waiter lets the reader drain stdout after the process exits
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Process lifecycle as seen by the waiter task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessState {
    Running,
    Exited(Option<i32>),
}

/// Stdio transport for subprocess MCP servers
pub struct StdioTransport {
    /// Backend id (for logs)
    label: String,
    /// Pending requests waiting for response
    pending: Arc<PendingMap>,
    /// Request ID counter
    request_id: AtomicU64,
    /// Process running and stdout open
    alive: Arc<AtomicBool>,
    /// Initialize handshake completed
    initialized: AtomicBool,
    /// Frames that failed to parse
    malformed: Arc<AtomicU64>,
    /// Writer handle
    writer: Mutex<Option<ChildStdin>>,
    /// Signals the waiter task to kill the child
    kill: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
    /// Exit state published by the waiter task
    state: watch::Receiver<ProcessState>,
}

impl StdioTransport {
    /// Launch the subprocess and complete the MCP initialize handshake
    ///
    /// The child inherits the gateway's environment plus `env`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Process` if the process cannot be spawned or exits
    /// during the handshake, or the handshake's own error.
    pub async fn spawn(
        label: &str,
        program: &str,
        args: &[String],
        cwd: Option<&str>,
        env: &HashMap<String, String>,
        init_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Process(format!("Failed to spawn '{program}': {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Process("Failed to get stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Process("Failed to get stdout".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(label.to_string(), stderr));
        }

        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let alive = Arc::new(AtomicBool::new(true));
        let malformed = Arc::new(AtomicU64::new(0));
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (state_tx, state_rx) = watch::channel(ProcessState::Running);

        let reader = tokio::spawn(read_loop(
            label.to_string(),
            stdout,
            Arc::clone(&pending),
            Arc::clone(&malformed),
        ));

        // Waiter: owns the child; a dropped kill sender also kills it
        {
            let label = label.to_string();
            let pending = Arc::clone(&pending);
            let alive = Arc::clone(&alive);
            tokio::spawn(async move {
                let code = tokio::select! {
                    status = child.wait() => status.ok().and_then(|s| s.code()),
                    _ = kill_rx => {
                        let _ = child.kill().await;
                        None
                    }
                };
                alive.store(false, Ordering::Relaxed);
                let _ = tokio::time::timeout(DRAIN_GRACE, reader).await;
                fail_pending(&pending, &format!("backend process exited (code {code:?})"));
                debug!(backend = %label, code = ?code, "Backend process exited");
                let _ = state_tx.send(ProcessState::Exited(code));
            });
        }

        let transport = Arc::new(Self {
            label: label.to_string(),
            pending,
            request_id: AtomicU64::new(1),
            alive,
            initialized: AtomicBool::new(false),
            malformed,
            writer: Mutex::new(Some(stdin)),
            kill: parking_lot::Mutex::new(Some(kill_tx)),
            state: state_rx,
        });

        if let Err(e) = transport.initialize(init_timeout).await {
            let _ = transport.close().await;
            return Err(e);
        }

        Ok(transport)
    }

    /// Initialize the MCP connection
    async fn initialize(&self, timeout: Duration) -> Result<()> {
        self.request(
            "initialize",
            Some(serde_json::json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "policy-gateway",
                    "version": env!("CARGO_PKG_VERSION")
                }
            })),
            timeout,
        )
        .await?
        .into_result()
        .map_err(|e| Error::Protocol(format!("Initialize failed: {e}")))?;

        self.notify("notifications/initialized", None).await?;

        self.initialized.store(true, Ordering::Relaxed);
        info!(backend = %self.label, "Stdio transport initialized");
        Ok(())
    }

    /// Write a message to stdin
    async fn write_message(&self, message: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let stdin = writer
            .as_mut()
            .ok_or_else(|| Error::Process("Backend stdin closed".to_string()))?;
        let io = |e: std::io::Error| Error::Process(format!("Write to backend failed: {e}"));
        stdin.write_all(message.as_bytes()).await.map_err(io)?;
        stdin.write_all(b"\n").await.map_err(io)?;
        stdin.flush().await.map_err(io)?;
        Ok(())
    }

    /// Get next request ID
    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of calls awaiting a response
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }
}

/// Removes the pending entry when the call finishes, times out or is dropped
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse> {
        if !self.alive.load(Ordering::Relaxed) {
            return Err(Error::Process(format!(
                "Backend '{}' process is not running",
                self.label
            )));
        }

        let id = self.next_id();
        let message = serde_json::to_string(&JsonRpcRequest::new(
            RequestId::Number(id.into()),
            method,
            params,
        ))?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        self.write_message(&message).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Process("Response channel closed".to_string())),
            Err(_) => Err(Error::Timeout(format!(
                "{method} on '{}' timed out after {}ms",
                self.label,
                timeout.as_millis()
            ))),
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let message = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        self.write_message(&message).await
    }

    fn is_connected(&self) -> bool {
        self.alive.load(Ordering::Relaxed) && self.initialized.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<()> {
        self.initialized.store(false, Ordering::Relaxed);
        fail_pending(&self.pending, "transport closed");

        // Close stdin, then kill
        *self.writer.lock().await = None;
        if let Some(kill) = self.kill.lock().take() {
            let _ = kill.send(());
        }

        Ok(())
    }

    fn malformed_frames(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    async fn closed(&self) -> Option<i32> {
        let mut state = self.state.clone();
        match state
            .wait_for(|s| matches!(s, ProcessState::Exited(_)))
            .await
        {
            Ok(s) => match *s {
                ProcessState::Exited(code) => code,
                ProcessState::Running => None,
            },
            Err(_) => None,
        }
    }
}

/// Reject every outstanding call with a process error
fn fail_pending(pending: &PendingMap, reason: &str) {
    let ids: Vec<u64> = pending.iter().map(|e| *e.key()).collect();
    for id in ids {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(Err(Error::Process(reason.to_string())));
        }
    }
}

/// Read newline-delimited frames until EOF
async fn read_loop<R>(label: String, stdout: R, pending: Arc<PendingMap>, malformed: Arc<AtomicU64>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::with_capacity(4096);

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => handle_frame(&label, &buf, &pending, &malformed),
            Err(e) => {
                warn!(backend = %label, error = %e, "Backend stdout read failed");
                break;
            }
        }
    }

    debug!(backend = %label, "Stdio reader task ended");
}

/// Route one frame to its pending call
fn handle_frame(label: &str, frame: &[u8], pending: &PendingMap, malformed: &AtomicU64) {
    let frame = frame.trim_ascii();
    if frame.is_empty() {
        return;
    }

    let value: Value = match serde_json::from_slice(frame) {
        Ok(v) => v,
        Err(e) => {
            let count = malformed.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(backend = %label, error = %e, malformed = count, "Skipping malformed frame");
            return;
        }
    };

    if let Some(method) = value.get("method").and_then(Value::as_str) {
        debug!(backend = %label, method, "Ignoring server-initiated message");
        return;
    }

    let response: JsonRpcResponse = match serde_json::from_value(value) {
        Ok(r) => r,
        Err(e) => {
            let count = malformed.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(backend = %label, error = %e, malformed = count, "Skipping malformed response");
            return;
        }
    };

    let slot = match &response.id {
        RequestId::Number(n) => n.as_u64().and_then(|id| pending.remove(&id)),
        _ => None,
    };
    match slot {
        Some((_, tx)) => {
            let _ = tx.send(Ok(response));
        }
        None => warn!(backend = %label, id = %response.id, "Dropping response with no pending call"),
    }
}

async fn drain_stderr<R>(label: String, stderr: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(backend = %label, stderr = %line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncWriteExt;

    fn pending_with(ids: &[u64]) -> (Arc<PendingMap>, Vec<oneshot::Receiver<Result<JsonRpcResponse>>>) {
        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let rxs = ids
            .iter()
            .map(|id| {
                let (tx, rx) = oneshot::channel();
                pending.insert(*id, tx);
                rx
            })
            .collect();
        (pending, rxs)
    }

    // ── Frame routing ─────────────────────────────────────────────────

    #[tokio::test]
    async fn responses_pair_by_id_regardless_of_order() {
        let (pending, mut rxs) = pending_with(&[1, 2]);
        let malformed = AtomicU64::new(0);

        handle_frame("t", br#"{"jsonrpc":"2.0","id":2,"result":"two"}"#, &pending, &malformed);
        handle_frame("t", br#"{"jsonrpc":"2.0","id":1,"result":"one"}"#, &pending, &malformed);

        let second = rxs.pop().unwrap().await.unwrap().unwrap();
        let first = rxs.pop().unwrap().await.unwrap().unwrap();
        assert_eq!(first.result, Some(json!("one")));
        assert_eq!(second.result, Some(json!("two")));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn malformed_and_unmatched_frames_are_counted_and_skipped() {
        let (pending, _rxs) = pending_with(&[1]);
        let malformed = AtomicU64::new(0);

        handle_frame("t", b"not json at all", &pending, &malformed);
        handle_frame("t", br#"{"jsonrpc":"2.0","id":99,"result":{}}"#, &pending, &malformed);
        handle_frame("t", br#"{"jsonrpc":"2.0","method":"notifications/progress"}"#, &pending, &malformed);
        handle_frame("t", b"   \r", &pending, &malformed);

        assert_eq!(malformed.load(Ordering::Relaxed), 1);
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn read_loop_reassembles_partial_frames() {
        // GIVEN: a pipe that delivers one frame split across writes
        let (mut tx, rx) = tokio::io::duplex(64);
        let (pending, mut rxs) = pending_with(&[7]);
        let malformed = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(read_loop(
            "t".into(),
            rx,
            Arc::clone(&pending),
            Arc::clone(&malformed),
        ));

        // WHEN: the frame arrives in pieces
        tx.write_all(br#"{"jsonrpc":"2.0","#).await.unwrap();
        tx.write_all(br#""id":7,"result":{"ok":true}}"#).await.unwrap();
        tx.write_all(b"\n").await.unwrap();
        drop(tx);
        task.await.unwrap();

        // THEN: the call receives the whole response
        let response = rxs.pop().unwrap().await.unwrap().unwrap();
        assert_eq!(response.result, Some(json!({"ok": true})));
        assert_eq!(malformed.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn fail_pending_rejects_everything() {
        let (pending, mut rxs) = pending_with(&[1, 2, 3]);
        fail_pending(&pending, "gone");

        assert!(pending.is_empty());
        for rx in &mut rxs {
            assert!(matches!(rx.try_recv(), Ok(Err(Error::Process(_)))));
        }
    }

    // ── Process ───────────────────────────────────────────────────────

    const ECHO_SERVER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  if [ -n "$id" ]; then
    printf '{"jsonrpc":"2.0","id":%s,"result":{"echo":true}}\n' "$id"
  fi
done
"#;

    #[tokio::test]
    async fn spawn_handshake_and_call() {
        let transport = StdioTransport::spawn(
            "echo",
            "sh",
            &["-c".to_string(), ECHO_SERVER.to_string()],
            None,
            &HashMap::new(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(transport.is_connected());

        let response = transport
            .request("ping", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response.result, Some(json!({"echo": true})));
        assert_eq!(transport.pending_calls(), 0);

        transport.close().await.unwrap();
        transport.closed().await;
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn exit_rejects_pending_calls() {
        // GIVEN: a backend that answers the handshake, then exits on the next line
        let script = r#"
read -r line
printf '{"jsonrpc":"2.0","id":1,"result":{}}\n'
read -r line
read -r line
exit 3
"#;
        let transport = StdioTransport::spawn(
            "crashy",
            "sh",
            &["-c".to_string(), script.to_string()],
            None,
            &HashMap::new(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        // WHEN: a call is in flight as the process exits
        let err = transport
            .request("tools/list", None, Duration::from_secs(10))
            .await
            .unwrap_err();

        // THEN: the call fails with a process error instead of hanging
        assert!(matches!(err, Error::Process(_)), "{err:?}");
        assert_eq!(transport.closed().await, Some(3));
    }

    #[tokio::test]
    async fn spawn_failure_is_process_error() {
        let err = StdioTransport::spawn(
            "missing",
            "/nonexistent/backend-binary",
            &[],
            None,
            &HashMap::new(),
            Duration::from_secs(1),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, Error::Process(_)));
    }
}

//! Passthrough child language servers.
//!
//! A recipe may name a real language server to forward document methods
//! to. The child is spawned lazily on first use, shared by every document
//! of its language, and talks framed JSON-RPC over its pipes. Requests are
//! serialised per child so concurrent forwards cannot interleave on its
//! stdin.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tower_lsp::lsp_types::PublishDiagnosticsParams;
use tower_lsp::Client;

use ferry_core::config::PassthroughConfig;

use crate::codec::{FrameReader, FrameWriter};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum PassthroughError {
    #[error("failed to spawn passthrough server {command:?}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("passthrough server {command:?} has exited")]
    ChildGone { command: String },

    #[error("passthrough i/o failure")]
    Io(#[from] std::io::Error),

    #[error("passthrough server error {code}: {message}")]
    Rpc { code: i64, message: String },
}

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<Result<Value, PassthroughError>>>>>;

/// One running child language server.
pub struct PassthroughServer {
    language_id: String,
    command: String,
    writer: Arc<Mutex<FrameWriter<ChildStdin>>>,
    child: std::sync::Mutex<Option<Child>>,
    pending: PendingMap,
    next_id: AtomicI64,
    /// Serialises forwards so a slow request cannot interleave with the
    /// next one's write.
    forward_lock: Mutex<()>,
    alive: Arc<AtomicBool>,
    reader_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PassthroughServer {
    /// Spawn the child and start its reader task. Diagnostics the child
    /// publishes are forwarded to the editor through `client`.
    pub fn spawn(
        language_id: &str,
        config: &PassthroughConfig,
        client: Client,
    ) -> Result<Arc<Self>, PassthroughError> {
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PassthroughError::Spawn {
                command: config.command.clone(),
                source,
            })?;

        let stdin = child.stdin.take().expect("stdin requested above");
        let stdout = child.stdout.take().expect("stdout requested above");

        let server = Arc::new(Self {
            language_id: language_id.to_string(),
            command: config.command.clone(),
            writer: Arc::new(Mutex::new(FrameWriter::new(stdin))),
            child: std::sync::Mutex::new(Some(child)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicI64::new(1),
            forward_lock: Mutex::new(()),
            alive: Arc::new(AtomicBool::new(true)),
            reader_task: std::sync::Mutex::new(None),
        });

        let reader = FrameReader::new(stdout);
        let task = tokio::spawn(read_loop(
            reader,
            Arc::clone(&server.writer),
            Arc::clone(&server.pending),
            Arc::clone(&server.alive),
            client,
            server.language_id.clone(),
            server.command.clone(),
        ));
        *server.reader_task.lock().unwrap() = Some(task);

        tracing::info!(
            language = %language_id,
            command = %config.command,
            "started passthrough language server"
        );
        Ok(server)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Forward a request and wait for the child's response.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, PassthroughError> {
        let _guard = self.forward_lock.lock().await;
        if !self.is_alive() {
            return Err(self.gone());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        tracing::debug!(language = %self.language_id, method, id, "forwarding request");
        if let Err(e) = self.writer.lock().await.write_frame(&frame).await {
            self.pending.lock().await.remove(&id);
            return Err(e.into());
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self.gone()),
        }
    }

    /// Forward a notification; no response is expected.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), PassthroughError> {
        let _guard = self.forward_lock.lock().await;
        if !self.is_alive() {
            return Err(self.gone());
        }
        let frame = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        tracing::debug!(language = %self.language_id, method, "forwarding notification");
        self.writer.lock().await.write_frame(&frame).await?;
        Ok(())
    }

    /// Best-effort shutdown: ask politely, then kill.
    pub async fn shutdown(&self) {
        if self.is_alive() {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, self.request("shutdown", Value::Null))
                .await;
            let _ = self.notify("exit", Value::Null).await;
        }
        self.alive.store(false, Ordering::SeqCst);
        if let Some(task) = self.reader_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(mut child) = self.child.lock().unwrap().take() {
            let _ = child.start_kill();
        }
        tracing::info!(
            language = %self.language_id,
            command = %self.command,
            "stopped passthrough language server"
        );
    }

    fn gone(&self) -> PassthroughError {
        PassthroughError::ChildGone {
            command: self.command.clone(),
        }
    }
}

async fn read_loop(
    mut reader: FrameReader<tokio::process::ChildStdout>,
    writer: Arc<Mutex<FrameWriter<ChildStdin>>>,
    pending: PendingMap,
    alive: Arc<AtomicBool>,
    client: Client,
    language_id: String,
    command: String,
) {
    loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => {
                dispatch_frame(frame, &writer, &pending, &client, &language_id, &command).await;
            }
            Ok(None) => {
                tracing::info!(language = %language_id, command = %command, "passthrough server closed stdout");
                break;
            }
            Err(e) => {
                tracing::warn!(language = %language_id, command = %command, error = %e, "passthrough read failure");
                break;
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    // Fail anything still waiting so callers see the exit, not a hang.
    for (_, tx) in pending.lock().await.drain() {
        let _ = tx.send(Err(PassthroughError::ChildGone {
            command: command.clone(),
        }));
    }
}

async fn dispatch_frame(
    frame: Value,
    writer: &Mutex<FrameWriter<ChildStdin>>,
    pending: &PendingMap,
    client: &Client,
    language_id: &str,
    command: &str,
) {
    let id = frame.get("id").cloned();
    let method = frame.get("method").and_then(Value::as_str);

    match (id, method) {
        // Response to one of our forwards.
        (Some(id), None) => {
            let Some(id) = id.as_i64() else { return };
            let Some(tx) = pending.lock().await.remove(&id) else {
                return;
            };
            let outcome = if let Some(error) = frame.get("error") {
                Err(PassthroughError::Rpc {
                    code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                    message: error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string(),
                })
            } else {
                Ok(frame.get("result").cloned().unwrap_or(Value::Null))
            };
            let _ = tx.send(outcome);
        }
        // Request from the child; servers block waiting for an answer, so
        // decline rather than stay silent.
        (Some(id), Some(method)) => {
            tracing::debug!(language = %language_id, command = %command, method, "declining child request");
            let response = json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": format!("method not found: {method}")},
            });
            let _ = writer.lock().await.write_frame(&response).await;
        }
        // Notification from the child. Diagnostics go to the editor,
        // everything else is log fodder.
        (None, Some(method)) => {
            if method == "textDocument/publishDiagnostics" {
                if let Some(params) = frame.get("params") {
                    if let Ok(params) =
                        serde_json::from_value::<PublishDiagnosticsParams>(params.clone())
                    {
                        client
                            .publish_diagnostics(params.uri, params.diagnostics, params.version)
                            .await;
                        return;
                    }
                }
            }
            tracing::debug!(language = %language_id, command = %command, method, "ignoring child notification");
        }
        _ => {}
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use tower_lsp::lsp_types::{InitializeParams, InitializeResult};
    use tower_lsp::{jsonrpc, LanguageServer, LspService};

    #[derive(Debug)]
    struct Null;

    #[tower_lsp::async_trait]
    impl LanguageServer for Null {
        async fn initialize(&self, _: InitializeParams) -> jsonrpc::Result<InitializeResult> {
            Ok(Default::default())
        }
        async fn shutdown(&self) -> jsonrpc::Result<()> {
            Ok(())
        }
    }

    /// A `Client` requires a service; the service and socket are returned
    /// so they stay alive for the test's duration.
    fn test_client() -> (Client, impl Sized) {
        let (tx, rx) = std::sync::mpsc::channel();
        let (service, socket) = LspService::new(move |client| {
            tx.send(client).ok();
            Null
        });
        (rx.recv().unwrap(), (service, socket))
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let (client, _keep) = test_client();
        let config = PassthroughConfig {
            command: "ferry-test-no-such-binary".to_string(),
            args: vec![],
        };
        match PassthroughServer::spawn("x", &config, client) {
            Err(PassthroughError::Spawn { .. }) => {}
            other => panic!("expected spawn failure, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_request_correlates_response() {
        let (client, _keep) = test_client();
        // The child answers request id 1 up front and then swallows its
        // stdin so the forwarded frame has somewhere to go.
        let body = r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#;
        let script = format!(
            "printf 'Content-Length: {}\\r\\n\\r\\n%s' '{}'; cat > /dev/null",
            body.len(),
            body
        );
        let config = PassthroughConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script],
        };

        let server = PassthroughServer::spawn("any", &config, client).unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            server.request("textDocument/hover", json!({"line": 0})),
        )
        .await
        .expect("response should arrive")
        .expect("result should be ok");
        assert_eq!(result["ok"], true);
        assert!(server.is_alive());
    }

    #[tokio::test]
    async fn test_rpc_error_propagates() {
        let (client, _keep) = test_client();
        let body = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"nope"}}"#;
        let script = format!(
            "printf 'Content-Length: {}\\r\\n\\r\\n%s' '{}'; cat > /dev/null",
            body.len(),
            body
        );
        let config = PassthroughConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script],
        };

        let server = PassthroughServer::spawn("any", &config, client).unwrap();
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            server.request("workspace/symbol", Value::Null),
        )
        .await
        .expect("response should arrive")
        .unwrap_err();
        match err {
            PassthroughError::Rpc { code, message } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "nope");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_dead_child_fails_requests() {
        let (client, _keep) = test_client();
        let config = PassthroughConfig {
            command: "true".to_string(),
            args: vec![],
        };
        let server = PassthroughServer::spawn("any", &config, client).unwrap();
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            server.request("textDocument/hover", Value::Null),
        )
        .await
        .expect("should fail promptly");
        assert!(outcome.is_err());
    }
}

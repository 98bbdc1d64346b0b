//! Unifies the child-process and HTTP backend transports behind one
//! interface (§4.13). The JSON-over-reqwest shape is grounded in the
//! teacher's `ClaudeAIService::send_message` (client held once, `.json()`
//! request/response, errors folded into one `AppError::Internal`); the
//! child-process framing is new (the teacher has no stdio transport) but
//! follows the same "one owner, background task, bounded pending table"
//! idiom as `KeyStore`/`RequestSigner`.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::config::BackendTransportConfig;

#[derive(Debug, Clone)]
pub enum ProxyError {
    Timeout,
    Transport(String),
    BackendError { code: i64, message: String },
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyError::Timeout => write!(f, "backend call timed out"),
            ProxyError::Transport(msg) => write!(f, "transport error: {msg}"),
            ProxyError::BackendError { code, message } => write!(f, "backend error {code}: {message}"),
        }
    }
}

pub struct ToolCallRequest<'a> {
    pub tool: &'a str,
    pub arguments: &'a Value,
}

/// A raw outbound call: method name plus params, for backend methods that
/// aren't `tools/call` (e.g. free methods like `ping`, `tools/list`).
pub struct RawCallRequest<'a> {
    pub method: &'a str,
    pub params: &'a Value,
}

enum Transport {
    ChildProcess(ChildProcessTransport),
    Http(HttpTransport),
}

pub struct Proxy {
    transport: Transport,
}

impl Proxy {
    pub fn spawn(config: &BackendTransportConfig) -> anyhow::Result<Self> {
        let transport = match config {
            BackendTransportConfig::ChildProcess { command, args } => {
                Transport::ChildProcess(ChildProcessTransport::spawn(command, args)?)
            }
            BackendTransportConfig::Http { base_url } => Transport::Http(HttpTransport::new(base_url.clone())),
        };
        Ok(Self { transport })
    }

    /// Forwards one `tools/call` under the given timeout. Never forwards
    /// credentials: only `name`/`arguments` cross the transport boundary.
    pub async fn forward(&self, call: &ToolCallRequest<'_>, timeout: Duration) -> Result<Value, ProxyError> {
        let params = serde_json::json!({ "name": call.tool, "arguments": call.arguments });
        self.forward_raw(&RawCallRequest { method: "tools/call", params: &params }, timeout).await
    }

    /// Forwards an arbitrary JSON-RPC method/params pair under the given
    /// timeout. Used for free methods (`ping`, `tools/list`, ...) that skip
    /// billing but still cross the transport boundary.
    pub async fn forward_raw(&self, call: &RawCallRequest<'_>, timeout: Duration) -> Result<Value, ProxyError> {
        let envelope = serde_json::json!({
            "jsonrpc": "2.0",
            "method": call.method,
            "params": call.params,
        });

        let fut = match &self.transport {
            Transport::ChildProcess(t) => t.call(envelope),
            Transport::Http(t) => t.call(envelope),
        };

        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::Timeout),
        }
    }
}

/// One outstanding request: `id -> reply channel`, drained by the reader
/// task as backend replies arrive on stdout.
type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>;

struct ChildProcessTransport {
    stdin_tx: mpsc::UnboundedSender<String>,
    pending: PendingMap,
    next_id: AtomicU64,
    // Keeps the child process (and its stdin/stdout tasks) alive for the
    // lifetime of the transport.
    _child: Arc<Mutex<Child>>,
}

impl ChildProcessTransport {
    fn spawn(command: &str, args: &[String]) -> anyhow::Result<Self> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdin = child.stdin.take().expect("child stdin was piped");
        let stdout = child.stdout.take().expect("child stdout was piped");

        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = stdin_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader_pending = pending.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            loop {
                match reader.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let Ok(envelope) = serde_json::from_str::<Value>(&line) else { continue };
                        let Some(id) = envelope.get("id").and_then(|v| v.as_str()) else { continue };
                        let mut pending = reader_pending.lock().await;
                        if let Some(sender) = pending.remove(id) {
                            let _ = sender.send(envelope);
                        }
                    }
                    Ok(None) => break,
                    Err(_) => break,
                }
            }
        });

        Ok(Self { stdin_tx, pending, next_id: AtomicU64::new(1), _child: Arc::new(Mutex::new(child)) })
    }

    async fn call(&self, mut envelope: Value) -> Result<Value, ProxyError> {
        let id = format!("px_{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        envelope["id"] = Value::String(id.clone());

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let line = serde_json::to_string(&envelope).map_err(|e| ProxyError::Transport(e.to_string()))?;
        if self.stdin_tx.send(line).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(ProxyError::Transport("backend process is not accepting input".to_string()));
        }

        match rx.await {
            Ok(response) => extract_result(response),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ProxyError::Transport("backend connection closed".to_string()))
            }
        }
    }
}

struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    fn new(base_url: String) -> Self {
        Self { client: reqwest::Client::new(), base_url }
    }

    async fn call(&self, mut envelope: Value) -> Result<Value, ProxyError> {
        envelope["id"] = Value::String(uuid::Uuid::new_v4().to_string());

        let response = self
            .client
            .post(&self.base_url)
            .header("content-type", "application/json")
            .json(&envelope)
            .send()
            .await
            .map_err(|e| ProxyError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProxyError::Transport(format!("backend returned {status}: {body}")));
        }

        let body: Value = response.json().await.map_err(|e| ProxyError::Transport(e.to_string()))?;
        extract_result(body)
    }
}

fn extract_result(envelope: Value) -> Result<Value, ProxyError> {
    if let Some(error) = envelope.get("error") {
        let code = error.get("code").and_then(|v| v.as_i64()).unwrap_or(-32603);
        let message = error.get("message").and_then(|v| v.as_str()).unwrap_or("backend error").to_string();
        return Err(ProxyError::BackendError { code, message });
    }
    Ok(envelope.get("result").cloned().unwrap_or(Value::Null))
}

//! In-process fake MCP servers for tests
//!
//! A [`FakeBackend`] speaks newline-delimited JSON-RPC over a
//! `tokio::io::duplex` pipe. [`FakeConnector`] hands these out in place of
//! real processes, and [`FakeControl`] pokes a running fake from the test.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mcpfuse_shared::BackendDescriptor;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{mpsc, oneshot};

use super::transport::{Connector, Transport, TransportHandle};
use super::types::JsonRpcResponse;
use crate::error::{ProxyError, ProxyResult};

/// Behaviour of one fake server
#[derive(Debug, Clone, Default)]
pub struct FakeBackend {
    name: String,
    tools: Option<Vec<String>>,
    resources: Option<Vec<String>>,
    prompts: Option<Vec<String>>,
    page_size: Option<usize>,
    init_delay: Option<Duration>,
    hang_on_initialize: bool,
    call_delay: Option<Duration>,
}

impl FakeBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.tools = Some(tools.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn with_resources(mut self, uris: &[&str]) -> Self {
        self.resources = Some(uris.iter().map(|u| u.to_string()).collect());
        self
    }

    pub fn with_prompts(mut self, prompts: &[&str]) -> Self {
        self.prompts = Some(prompts.iter().map(|p| p.to_string()).collect());
        self
    }

    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size);
        self
    }

    pub fn with_init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = Some(delay);
        self
    }

    pub fn hang_on_initialize(mut self) -> Self {
        self.hang_on_initialize = true;
        self
    }

    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = Some(delay);
        self
    }
}

enum Control {
    SetTools(Vec<String>),
    Stall(bool),
    Crash,
    Ping(oneshot::Sender<JsonRpcResponse>),
}

/// Test-side handle to a running fake
#[derive(Clone)]
pub struct FakeControl {
    tx: mpsc::UnboundedSender<Control>,
}

impl FakeControl {
    /// Replace the tool list and announce the change
    pub fn set_tools(&self, tools: &[&str]) {
        let tools = tools.iter().map(|t| t.to_string()).collect();
        let _ = self.tx.send(Control::SetTools(tools));
    }

    /// Stop (or resume) answering requests; unanswered ones are dropped
    pub fn set_stalled(&self, stalled: bool) {
        let _ = self.tx.send(Control::Stall(stalled));
    }

    /// Drop the connection as if the process died
    pub fn crash(&self) {
        let _ = self.tx.send(Control::Crash);
    }

    /// Send a `ping` request to the proxy and wait for its answer
    pub async fn ping_client(&self) -> JsonRpcResponse {
        let (tx, rx) = oneshot::channel();
        self.tx.send(Control::Ping(tx)).expect("fake backend gone");
        rx.await.expect("no ping reply")
    }
}

struct Registered {
    backend: FakeBackend,
    control: Option<mpsc::UnboundedReceiver<Control>>,
}

/// Connector serving registered fakes; unknown names are unreachable
#[derive(Clone, Default)]
pub struct FakeConnector {
    backends: Arc<Mutex<HashMap<String, Registered>>>,
    connects: Arc<AtomicUsize>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, backend: FakeBackend) -> FakeControl {
        let (tx, rx) = mpsc::unbounded_channel();
        self.backends.lock().unwrap().insert(
            backend.name.clone(),
            Registered {
                backend,
                control: Some(rx),
            },
        );
        FakeControl { tx }
    }

    /// How many transports were opened
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, descriptor: &BackendDescriptor) -> ProxyResult<TransportHandle> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let (backend, control) = {
            let mut backends = self.backends.lock().unwrap();
            let Some(registered) = backends.get_mut(&descriptor.name) else {
                return Err(ProxyError::BackendUnreachable {
                    backend: descriptor.name.clone(),
                    reason: "connection refused".to_string(),
                });
            };
            let control = registered
                .control
                .take()
                .unwrap_or_else(|| mpsc::unbounded_channel().1);
            (registered.backend.clone(), control)
        };

        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve(backend, server, control));

        let (reader, writer) = tokio::io::split(client);
        Ok(Transport::from_pipes(&descriptor.name, reader, writer))
    }
}

async fn serve(backend: FakeBackend, io: DuplexStream, mut control: mpsc::UnboundedReceiver<Control>) {
    let (reader, mut writer) = tokio::io::split(io);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();

    let writer_task = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let mut line = message.to_string();
            line.push('\n');
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut tools = backend.tools.clone();
    let mut lines = BufReader::new(reader).lines();
    let mut pings: HashMap<String, oneshot::Sender<JsonRpcResponse>> = HashMap::new();
    let mut control_open = true;
    let mut stalled = false;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let message: Value = match serde_json::from_str(&line) {
                    Ok(message) => message,
                    Err(_) => continue,
                };

                if message.get("method").is_none() {
                    let id = message["id"].as_str().unwrap_or_default().to_string();
                    if let Some(tx) = pings.remove(&id) {
                        let _ = tx.send(serde_json::from_value(message).unwrap());
                    }
                    continue;
                }

                if !stalled {
                    handle_request(&backend, tools.as_deref(), message, &out_tx);
                }
            }
            command = control.recv(), if control_open => match command {
                Some(Control::SetTools(next)) => {
                    tools = Some(next);
                    let _ = out_tx.send(json!({
                        "jsonrpc": "2.0",
                        "method": "notifications/tools/list_changed"
                    }));
                }
                Some(Control::Stall(on)) => stalled = on,
                Some(Control::Crash) => break,
                Some(Control::Ping(tx)) => {
                    let id = format!("server-ping-{}", pings.len() + 1);
                    pings.insert(id.clone(), tx);
                    let _ = out_tx.send(json!({"jsonrpc": "2.0", "id": id, "method": "ping"}));
                }
                None => control_open = false,
            },
        }
    }

    writer_task.abort();
}

fn handle_request(
    backend: &FakeBackend,
    tools: Option<&[String]>,
    message: Value,
    out: &mpsc::UnboundedSender<Value>,
) {
    let method = message["method"].as_str().unwrap_or_default().to_string();
    let params = message.get("params").cloned().unwrap_or(Value::Null);
    let Some(id) = message.get("id").cloned() else {
        // notifications/initialized, notifications/cancelled
        return;
    };

    let reply = |result: Result<Value, (i64, &str)>| match result {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err((code, msg)) => json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": msg}}),
    };

    match method.as_str() {
        "initialize" => {
            if backend.hang_on_initialize {
                return;
            }
            let mut capabilities = serde_json::Map::new();
            if backend.tools.is_some() {
                capabilities.insert("tools".into(), json!({"listChanged": true}));
            }
            if backend.resources.is_some() {
                capabilities.insert("resources".into(), json!({}));
            }
            if backend.prompts.is_some() {
                capabilities.insert("prompts".into(), json!({}));
            }
            let response = reply(Ok(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": capabilities,
                "serverInfo": {"name": format!("fake-{}", backend.name), "version": "1.0.0"}
            })));
            send_after(out, response, backend.init_delay);
        }
        "tools/list" => {
            let items: Vec<Value> = tools
                .unwrap_or_default()
                .iter()
                .map(|t| {
                    json!({
                        "name": t,
                        "description": format!("{} tool", t),
                        "inputSchema": {"type": "object"}
                    })
                })
                .collect();
            let _ = out.send(reply(Ok(page(backend, "tools", items, &params))));
        }
        "resources/list" => {
            let items: Vec<Value> = backend
                .resources
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(|uri| json!({"uri": uri, "name": uri}))
                .collect();
            let _ = out.send(reply(Ok(page(backend, "resources", items, &params))));
        }
        "prompts/list" => {
            let items: Vec<Value> = backend
                .prompts
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(|p| json!({"name": p, "description": format!("{} prompt", p), "arguments": []}))
                .collect();
            let _ = out.send(reply(Ok(page(backend, "prompts", items, &params))));
        }
        "tools/call" => {
            let name = params["name"].as_str().unwrap_or_default();
            let response = if name == "fail" {
                reply(Err((-32000, "tool failed")))
            } else {
                reply(Ok(json!({
                    "content": [{"type": "text", "text": format!("{}:{}", backend.name, name)}],
                    "structuredContent": {
                        "backend": backend.name,
                        "tool": name,
                        "arguments": params["arguments"]
                    }
                })))
            };
            // `delay_ms` in the arguments overrides the configured call delay
            let delay = params["arguments"]["delay_ms"]
                .as_u64()
                .map(Duration::from_millis)
                .or(backend.call_delay);
            send_after(out, response, delay);
        }
        "resources/read" => {
            let uri = params["uri"].as_str().unwrap_or_default();
            let response = reply(Ok(json!({
                "contents": [{"uri": uri, "text": format!("contents of {}", uri)}]
            })));
            send_after(out, response, backend.call_delay);
        }
        "prompts/get" => {
            let name = params["name"].as_str().unwrap_or_default();
            let response = reply(Ok(json!({
                "description": name,
                "messages": [{"role": "user", "content": {"type": "text", "text": name}}],
                "arguments": params["arguments"]
            })));
            send_after(out, response, backend.call_delay);
        }
        _ => {
            let _ = out.send(reply(Err((-32601, "Method not found"))));
        }
    }
}

fn page(backend: &FakeBackend, key: &str, items: Vec<Value>, params: &Value) -> Value {
    let start: usize = params["cursor"]
        .as_str()
        .and_then(|c| c.parse().ok())
        .unwrap_or(0);
    let size = backend.page_size.unwrap_or(usize::MAX);
    let end = start.saturating_add(size).min(items.len());

    let mut result = serde_json::Map::new();
    result.insert(key.to_string(), Value::Array(items[start.min(end)..end].to_vec()));
    if end < items.len() {
        result.insert("nextCursor".to_string(), Value::String(end.to_string()));
    }
    Value::Object(result)
}

fn send_after(out: &mpsc::UnboundedSender<Value>, message: Value, delay: Option<Duration>) {
    match delay {
        None => {
            let _ = out.send(message);
        }
        Some(delay) => {
            let out = out.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = out.send(message);
            });
        }
    }
}

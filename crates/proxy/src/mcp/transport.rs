//! Backend transports
//!
//! A [`Transport`] moves JSON-RPC messages between the proxy and one backend.
//! Outgoing messages go through [`Transport::send`]; everything the backend
//! sends (responses, notifications, server-initiated requests) is pushed onto
//! the [`Inbound`] channel returned alongside it, where the owning connection
//! correlates it.
//!
//! - Process: newline-delimited JSON over a child's stdin/stdout
//! - Stream, streamable HTTP: one POST per message, replies in the body
//! - Stream, HTTP+SSE: long-lived GET event stream, POSTs to the announced endpoint

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use mcpfuse_shared::{BackendDescriptor, BackendTransport};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::types::JsonRpcMessage;
use crate::error::{ProxyError, ProxyResult};

/// Capacity of the inbound message queue per backend
const INBOUND_CAPACITY: usize = 256;

/// Capacity of the outbound line queue for process backends
const OUTBOUND_CAPACITY: usize = 64;

/// How long a process gets to exit after its stdin is closed
const PROCESS_EXIT_GRACE: Duration = Duration::from_secs(5);

/// Connect timeout for HTTP backends
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Session header used by streamable HTTP servers
const SESSION_HEADER: &str = "mcp-session-id";

/// Something the backend sent, or the end of the channel
#[derive(Debug)]
pub enum Inbound {
    Message(JsonRpcMessage),
    Closed(String),
}

/// Failure to hand a message to the backend
#[derive(Debug, Clone)]
pub struct SendError {
    /// The channel may work again (network hiccup), as opposed to being gone
    pub transient: bool,
    pub message: String,
}

impl SendError {
    fn fatal(message: impl Into<String>) -> Self {
        Self {
            transient: false,
            message: message.into(),
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        Self {
            transient: err.is_connect() || err.is_timeout() || err.is_request(),
            message: err.to_string(),
        }
    }
}

/// Aborts the wrapped task when dropped
pub(crate) struct AbortOnDrop(pub(crate) JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A live transport plus the receiving end of its inbound queue
pub struct TransportHandle {
    pub transport: Transport,
    pub inbound: mpsc::Receiver<Inbound>,
}

/// Opens transports for backend descriptors
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, descriptor: &BackendDescriptor) -> ProxyResult<TransportHandle>;
}

/// Connector for real processes and HTTP endpoints
pub struct TransportConnector {
    http_client: reqwest::Client,
}

impl TransportConnector {
    pub fn new() -> ProxyResult<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| ProxyError::Protocol(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl Connector for TransportConnector {
    async fn connect(&self, descriptor: &BackendDescriptor) -> ProxyResult<TransportHandle> {
        Transport::connect(descriptor, &self.http_client).await
    }
}

/// Transport to one backend, chosen by the descriptor's tagged variant
pub enum Transport {
    Process(ProcessTransport),
    Stream(StreamTransport),
}

impl Transport {
    /// Establish the transport described by `descriptor`
    pub async fn connect(
        descriptor: &BackendDescriptor,
        http_client: &reqwest::Client,
    ) -> ProxyResult<TransportHandle> {
        let backend = descriptor.name.as_str();
        match &descriptor.transport {
            BackendTransport::Stdio { command, args, env } => {
                ProcessTransport::spawn(backend, command, args, env)
            }
            BackendTransport::Http { url, headers } => {
                StreamTransport::streamable(backend, url, headers, http_client.clone())
            }
            BackendTransport::Sse { url, headers } => {
                StreamTransport::sse(backend, url, headers, http_client.clone()).await
            }
        }
    }

    /// Wrap an already-open byte pipe speaking newline-delimited JSON-RPC
    pub fn from_pipes<R, W>(backend: &str, reader: R, writer: W) -> TransportHandle
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        ProcessTransport::from_pipes(backend, reader, writer, None)
    }

    pub async fn send(&self, message: &JsonRpcMessage) -> Result<(), SendError> {
        match self {
            Transport::Process(process) => process.send(message).await,
            Transport::Stream(stream) => stream.send(message).await,
        }
    }

    /// Tear the transport down; idempotent
    pub async fn shutdown(&self) {
        match self {
            Transport::Process(process) => process.shutdown().await,
            Transport::Stream(stream) => stream.shutdown().await,
        }
    }
}

// =============================================================================
// Process transport
// =============================================================================

/// Child process speaking JSON-RPC over stdio
pub struct ProcessTransport {
    backend: String,
    writer_tx: Mutex<Option<mpsc::Sender<String>>>,
    child: tokio::sync::Mutex<Option<Child>>,
    _tasks: Vec<AbortOnDrop>,
}

impl ProcessTransport {
    fn spawn(
        backend: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> ProxyResult<TransportHandle> {
        let unreachable = |reason: String| ProxyError::BackendUnreachable {
            backend: backend.to_string(),
            reason,
        };

        // Parent environment is inherited; descriptor env overlays it
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| unreachable(format!("failed to spawn {}: {}", command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| unreachable("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| unreachable("failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| unreachable("failed to capture stderr".to_string()))?;

        tracing::info!(backend = %backend, command = %command, pid = ?child.id(), "Spawned backend process");

        let stderr_task = tokio::spawn(log_stderr(backend.to_string(), stderr));
        let mut handle = Self::from_pipes(backend, stdout, stdin, Some(child));
        if let Transport::Process(process) = &mut handle.transport {
            process._tasks.push(AbortOnDrop(stderr_task));
        }
        Ok(handle)
    }

    fn from_pipes<R, W>(backend: &str, reader: R, writer: W, child: Option<Child>) -> TransportHandle
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (writer_tx, writer_rx) = mpsc::channel(OUTBOUND_CAPACITY);

        let reader_task = tokio::spawn(read_lines(backend.to_string(), reader, inbound_tx));
        let writer_task = tokio::spawn(write_lines(backend.to_string(), writer, writer_rx));

        let transport = ProcessTransport {
            backend: backend.to_string(),
            writer_tx: Mutex::new(Some(writer_tx)),
            child: tokio::sync::Mutex::new(child),
            _tasks: vec![AbortOnDrop(reader_task), AbortOnDrop(writer_task)],
        };

        TransportHandle {
            transport: Transport::Process(transport),
            inbound: inbound_rx,
        }
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<(), SendError> {
        let line = serde_json::to_string(message).map_err(|e| SendError::fatal(e.to_string()))?;

        let sender = self
            .writer_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| SendError::fatal("transport is shut down"))?;

        sender
            .send(line)
            .await
            .map_err(|_| SendError::fatal("backend stdin closed"))
    }

    async fn shutdown(&self) {
        // Dropping the sender ends the writer task, which closes stdin
        let sender = self.writer_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        drop(sender);

        let mut child = self.child.lock().await;
        let Some(mut process) = child.take() else {
            return;
        };

        match tokio::time::timeout(PROCESS_EXIT_GRACE, process.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(backend = %self.backend, ?status, "Backend process exited");
            }
            Ok(Err(e)) => {
                tracing::error!(backend = %self.backend, error = %e, "Error waiting for backend process");
            }
            Err(_) => {
                tracing::warn!(backend = %self.backend, "Killing unresponsive backend process");
                let _ = process.kill().await;
                let _ = process.wait().await;
            }
        }
    }
}

async fn read_lines<R>(backend: String, reader: R, inbound: mpsc::Sender<Inbound>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<JsonRpcMessage>(trimmed) {
                    Ok(message) => {
                        if inbound.send(Inbound::Message(message)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // Some servers print banners on stdout
                        tracing::debug!(backend = %backend, error = %e, line = %trimmed, "Ignoring non JSON-RPC output");
                    }
                }
            }
            Ok(None) => {
                let _ = inbound.send(Inbound::Closed("stdout closed".to_string())).await;
                break;
            }
            Err(e) => {
                let _ = inbound
                    .send(Inbound::Closed(format!("failed to read stdout: {}", e)))
                    .await;
                break;
            }
        }
    }
    tracing::debug!(backend = %backend, "stdout reader task exiting");
}

async fn write_lines<W>(backend: String, mut writer: W, mut rx: mpsc::Receiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::error!(backend = %backend, error = %e, "Failed to write to backend");
            break;
        }
        if let Err(e) = writer.flush().await {
            tracing::error!(backend = %backend, error = %e, "Failed to flush backend stdin");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn log_stderr(backend: String, stderr: tokio::process::ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = String::new();

    loop {
        line.clear();

        match reader.read_line(&mut line).await {
            Ok(0) => {
                tracing::debug!(backend = %backend, "stderr stream closed");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                if trimmed.contains("ERROR") || trimmed.contains("FATAL") {
                    tracing::error!(backend = %backend, stderr = %trimmed);
                } else if trimmed.contains("WARN") {
                    tracing::warn!(backend = %backend, stderr = %trimmed);
                } else {
                    tracing::debug!(backend = %backend, stderr = %trimmed);
                }
            }
            Err(e) => {
                tracing::error!(backend = %backend, error = %e, "Failed to read stderr");
                break;
            }
        }
    }
}

// =============================================================================
// Stream transports
// =============================================================================

enum StreamMode {
    Streamable {
        url: String,
        session_id: Mutex<Option<String>>,
    },
    Sse {
        endpoint: String,
        reader: Mutex<Option<AbortOnDrop>>,
    },
}

/// HTTP-based backend
pub struct StreamTransport {
    backend: String,
    http_client: reqwest::Client,
    headers: HeaderMap,
    inbound: mpsc::Sender<Inbound>,
    mode: StreamMode,
}

impl StreamTransport {
    fn streamable(
        backend: &str,
        url: &str,
        headers: &HashMap<String, String>,
        http_client: reqwest::Client,
    ) -> ProxyResult<TransportHandle> {
        let headers = build_headers(backend, headers)?;
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        let transport = StreamTransport {
            backend: backend.to_string(),
            http_client,
            headers,
            inbound: inbound_tx,
            mode: StreamMode::Streamable {
                url: url.to_string(),
                session_id: Mutex::new(None),
            },
        };

        Ok(TransportHandle {
            transport: Transport::Stream(transport),
            inbound: inbound_rx,
        })
    }

    async fn sse(
        backend: &str,
        url: &str,
        headers: &HashMap<String, String>,
        http_client: reqwest::Client,
    ) -> ProxyResult<TransportHandle> {
        let unreachable = |reason: String| ProxyError::BackendUnreachable {
            backend: backend.to_string(),
            reason,
        };

        let headers = build_headers(backend, headers)?;
        let base = url::Url::parse(url).map_err(|e| unreachable(format!("invalid URL: {}", e)))?;

        let response = http_client
            .get(base.clone())
            .headers(headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| unreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(unreachable(format!(
                "event stream returned HTTP {}",
                response.status()
            )));
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (endpoint_tx, endpoint_rx) = oneshot::channel();

        // Guard aborts the reader if we bail out before the transport exists
        let reader = AbortOnDrop(tokio::spawn(read_event_stream(
            backend.to_string(),
            base,
            response,
            endpoint_tx,
            inbound_tx.clone(),
        )));

        let endpoint = endpoint_rx
            .await
            .map_err(|_| unreachable("event stream closed before announcing an endpoint".to_string()))?;

        tracing::debug!(backend = %backend, endpoint = %endpoint, "SSE backend announced endpoint");

        let transport = StreamTransport {
            backend: backend.to_string(),
            http_client,
            headers,
            inbound: inbound_tx,
            mode: StreamMode::Sse {
                endpoint,
                reader: Mutex::new(Some(reader)),
            },
        };

        Ok(TransportHandle {
            transport: Transport::Stream(transport),
            inbound: inbound_rx,
        })
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<(), SendError> {
        match &self.mode {
            StreamMode::Streamable { url, session_id } => {
                self.send_streamable(url, session_id, message).await
            }
            StreamMode::Sse { endpoint, .. } => {
                let response = self
                    .http_client
                    .post(endpoint)
                    .headers(self.headers.clone())
                    .json(message)
                    .send()
                    .await
                    .map_err(SendError::from_reqwest)?;

                let status = response.status();
                if !status.is_success() {
                    return Err(SendError {
                        transient: status.is_server_error(),
                        message: format!("endpoint returned HTTP {}", status),
                    });
                }
                Ok(())
            }
        }
    }

    async fn send_streamable(
        &self,
        url: &str,
        session_id: &Mutex<Option<String>>,
        message: &JsonRpcMessage,
    ) -> Result<(), SendError> {
        let current_session = session_id.lock().unwrap_or_else(|e| e.into_inner()).clone();

        let mut req_builder = self
            .http_client
            .post(url)
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(message);

        if let Some(ref sid) = current_session {
            req_builder = req_builder.header(SESSION_HEADER, sid.as_str());
        }

        let response = req_builder.send().await.map_err(SendError::from_reqwest)?;

        if let Some(sid) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *session_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(sid.to_string());
        }

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND && current_session.is_some() {
            return Err(SendError::fatal("backend session expired"));
        }
        if !status.is_success() {
            return Err(SendError {
                transient: status.is_server_error(),
                message: format!("backend returned HTTP {}", status),
            });
        }
        if status == reqwest::StatusCode::ACCEPTED || status == reqwest::StatusCode::NO_CONTENT {
            return Ok(());
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let body = response.text().await.map_err(SendError::from_reqwest)?;
        let messages = decode_http_body(&content_type, &body).map_err(SendError::fatal)?;

        for message in messages {
            if self.inbound.send(Inbound::Message(message)).await.is_err() {
                return Err(SendError::fatal("connection dropped"));
            }
        }
        Ok(())
    }

    async fn shutdown(&self) {
        match &self.mode {
            StreamMode::Streamable { url, session_id } => {
                let sid = session_id.lock().unwrap_or_else(|e| e.into_inner()).take();
                if let Some(sid) = sid {
                    // Best effort: let the server drop its session state
                    let result = self
                        .http_client
                        .delete(url)
                        .headers(self.headers.clone())
                        .header(SESSION_HEADER, sid.as_str())
                        .send()
                        .await;
                    if let Err(e) = result {
                        tracing::debug!(backend = %self.backend, error = %e, "Failed to end backend session");
                    }
                }
            }
            StreamMode::Sse { reader, .. } => {
                let reader = reader.lock().unwrap_or_else(|e| e.into_inner()).take();
                drop(reader);
            }
        }
        let _ = self.inbound.send(Inbound::Closed("transport shut down".to_string())).await;
    }
}

fn build_headers(backend: &str, headers: &HashMap<String, String>) -> ProxyResult<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes());
        let value = HeaderValue::from_str(value);
        match (name, value) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => {
                return Err(ProxyError::BackendUnreachable {
                    backend: backend.to_string(),
                    reason: "invalid header in descriptor".to_string(),
                })
            }
        }
    }
    Ok(map)
}

async fn read_event_stream(
    backend: String,
    base: url::Url,
    response: reqwest::Response,
    endpoint_tx: oneshot::Sender<String>,
    inbound: mpsc::Sender<Inbound>,
) {
    let mut stream = response.bytes_stream();
    let mut parser = SseParser::default();
    let mut endpoint_tx = Some(endpoint_tx);

    while let Some(chunk) = stream.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = inbound
                    .send(Inbound::Closed(format!("event stream failed: {}", e)))
                    .await;
                return;
            }
        };

        for event in parser.feed(&bytes) {
            match event.event.as_str() {
                "endpoint" => {
                    let Some(tx) = endpoint_tx.take() else {
                        continue;
                    };
                    match base.join(event.data.trim()) {
                        Ok(endpoint) => {
                            let _ = tx.send(endpoint.to_string());
                        }
                        Err(e) => {
                            tracing::warn!(backend = %backend, error = %e, "Invalid endpoint event");
                        }
                    }
                }
                "message" => match serde_json::from_str::<JsonRpcMessage>(&event.data) {
                    Ok(message) => {
                        if inbound.send(Inbound::Message(message)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(backend = %backend, error = %e, "Invalid message event");
                    }
                },
                other => {
                    tracing::debug!(backend = %backend, event = %other, "Ignoring SSE event");
                }
            }
        }
    }

    let _ = inbound
        .send(Inbound::Closed("event stream ended".to_string()))
        .await;
}

// =============================================================================
// SSE parsing
// =============================================================================

/// One server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental server-sent events parser
///
/// Bytes are buffered until a blank line completes an event, so multi-byte
/// characters split across chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            let text = String::from_utf8_lossy(&block);
            if let Some(event) = parse_event_block(&text) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_event_block(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            _ => {}
        }
    }

    if event.is_none() && data.is_empty() {
        return None;
    }

    Some(SseEvent {
        event: event.unwrap_or_else(|| "message".to_string()),
        data: data.join("\n"),
    })
}

/// Decode a streamable-HTTP response body into JSON-RPC messages
///
/// Handles both plain JSON (single message or batch) and SSE bodies
/// (`event: message\ndata: {...}`).
pub fn decode_http_body(content_type: &str, body: &str) -> Result<Vec<JsonRpcMessage>, String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if content_type.contains("text/event-stream")
        || trimmed.starts_with("event:")
        || trimmed.starts_with("data:")
    {
        let mut parser = SseParser::default();
        let mut events = parser.feed(trimmed.as_bytes());
        events.extend(parser.feed(b"\n\n"));

        let mut messages = Vec::new();
        for event in events {
            if event.event != "message" || event.data.trim().is_empty() {
                continue;
            }
            messages.extend(decode_json(&event.data)?);
        }
        return Ok(messages);
    }

    decode_json(trimmed)
}

fn decode_json(text: &str) -> Result<Vec<JsonRpcMessage>, String> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(|e| e.to_string()))
            .collect(),
        other => Ok(vec![serde_json::from_value(other).map_err(|e| e.to_string())?]),
    }
}

//! Backend MCP connection
//!
//! A [`BackendConnection`] owns one transport to one backend server. It runs
//! the MCP handshake, correlates responses to in-flight requests through a
//! pending table (so calls are pipelined), answers the few requests a server
//! may send to its client, and refetches capability lists when the backend
//! announces they changed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use mcpfuse_shared::BackendDescriptor;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use super::catalog::{CapabilityItem, CapabilityKind};
use super::transport::{AbortOnDrop, Connector, Inbound, Transport};
use super::types::*;
use crate::error::{ProxyError, ProxyResult};

/// Upper bound on pages fetched for one capability list
const MAX_LIST_PAGES: usize = 100;

/// Lifecycle of a backend connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    /// Transient transport trouble; requests are still attempted
    Degraded,
    Closed,
}

/// Something the owner of a connection needs to react to
#[derive(Debug)]
pub enum BackendEvent {
    CapabilitiesChanged {
        backend: String,
        kind: CapabilityKind,
        items: Vec<CapabilityItem>,
    },
    /// The backend went away without being asked to
    Closed { backend: String, reason: String },
}

/// Handshake and request timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub handshake: Duration,
    pub request: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(10),
            request: Duration::from_secs(60),
        }
    }
}

/// Capability lists fetched during the handshake
pub type InitialCapabilities = Vec<(CapabilityKind, Vec<CapabilityItem>)>;

struct PendingRequest {
    tx: oneshot::Sender<ProxyResult<Value>>,
    upstream_id: Option<JsonRpcId>,
    method: String,
    deadline: Instant,
}

struct Inner {
    descriptor: BackendDescriptor,
    transport: Transport,
    timeouts: Timeouts,
    next_id: AtomicI64,
    pending: Mutex<HashMap<i64, PendingRequest>>,
    state_tx: watch::Sender<ConnectionState>,
    last_error: Mutex<Option<String>>,
    server_info: Mutex<Option<Implementation>>,
    events: mpsc::UnboundedSender<BackendEvent>,
    relay: mpsc::UnboundedSender<CapabilityKind>,
    relay_gate: watch::Sender<bool>,
    closing: AtomicBool,
    tasks: Mutex<Vec<AbortOnDrop>>,
}

/// Handle to one live backend; cheap to clone
#[derive(Clone)]
pub struct BackendConnection {
    inner: Arc<Inner>,
}

impl BackendConnection {
    /// Connect, handshake and fetch the advertised capability lists
    ///
    /// Everything happens within `timeouts.handshake`. On failure the
    /// transport is torn down before the error is returned.
    pub async fn open(
        descriptor: BackendDescriptor,
        connector: &dyn Connector,
        timeouts: Timeouts,
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> ProxyResult<(Self, InitialCapabilities)> {
        let name = descriptor.name.clone();
        let deadline = Instant::now() + timeouts.handshake;

        tracing::debug!(backend = %name, transport = %descriptor.transport.label(), "Connecting to backend");

        let handle = match tokio::time::timeout_at(deadline, connector.connect(&descriptor)).await {
            Ok(result) => result?,
            Err(_) => return Err(ProxyError::HandshakeTimeout { backend: name }),
        };

        let connection = Self::attach(descriptor, handle.transport, handle.inbound, timeouts, events);

        let result = match tokio::time::timeout_at(deadline, connection.handshake(deadline)).await {
            Ok(Ok(initial)) => Ok(initial),
            Ok(Err(ProxyError::RequestTimeout(_))) | Err(_) => {
                Err(ProxyError::HandshakeTimeout { backend: name.clone() })
            }
            Ok(Err(ProxyError::BackendClosed { .. })) => Err(ProxyError::BackendUnreachable {
                backend: name.clone(),
                reason: connection
                    .last_error()
                    .unwrap_or_else(|| "connection closed during handshake".to_string()),
            }),
            Ok(Err(e)) => Err(e),
        };

        match result {
            Ok(initial) => {
                connection.inner.set_state(ConnectionState::Ready);
                tracing::info!(
                    backend = %name,
                    server = ?connection.server_info().map(|info| info.name),
                    "Backend ready"
                );
                Ok((connection, initial))
            }
            Err(e) => {
                connection.inner.set_last_error(e.to_string());
                connection.close().await;
                Err(e)
            }
        }
    }

    /// Wrap an established transport and start its background tasks
    fn attach(
        descriptor: BackendDescriptor,
        transport: Transport,
        inbound: mpsc::Receiver<Inbound>,
        timeouts: Timeouts,
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let (relay_gate, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            descriptor,
            transport,
            timeouts,
            next_id: AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
            state_tx,
            last_error: Mutex::new(None),
            server_info: Mutex::new(None),
            events,
            relay: relay_tx,
            relay_gate,
            closing: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });
        inner.set_state(ConnectionState::Connecting);

        let dispatcher = tokio::spawn(dispatch(Arc::downgrade(&inner), inbound));
        let relay = tokio::spawn(relay_list_changes(Arc::downgrade(&inner), relay_rx));
        inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([AbortOnDrop(dispatcher), AbortOnDrop(relay)]);

        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.descriptor.name
    }

    pub fn descriptor(&self) -> &BackendDescriptor {
        &self.inner.descriptor
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn server_info(&self) -> Option<Implementation> {
        self.inner
            .server_info
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of requests awaiting a response
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Start publishing `CapabilitiesChanged` events
    ///
    /// Change notifications received before this are held back so the owner
    /// never sees an update older than the initial lists.
    pub fn start_relay(&self) {
        self.inner.relay_gate.send_replace(true);
    }

    async fn handshake(&self, deadline: Instant) -> ProxyResult<InitialCapabilities> {
        self.inner.set_state(ConnectionState::Handshaking);

        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: Capabilities::default(),
            client_info: Implementation::proxy(),
        };
        let params = serde_json::to_value(params)
            .map_err(|e| ProxyError::Protocol(format!("failed to encode initialize: {}", e)))?;

        let result = self.call("initialize", Some(params), None, deadline).await?;
        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| ProxyError::Protocol(format!("invalid initialize result: {}", e)))?;

        tracing::debug!(
            backend = %self.name(),
            protocol = %init.protocol_version,
            server = %init.server_info.name,
            "Backend initialized"
        );
        *self.inner.server_info.lock().unwrap_or_else(|e| e.into_inner()) = Some(init.server_info);

        self.notify("notifications/initialized", None).await?;

        let mut kinds = Vec::new();
        if init.capabilities.tools.is_some() {
            kinds.push(CapabilityKind::Tool);
        }
        if init.capabilities.resources.is_some() {
            kinds.push(CapabilityKind::Resource);
        }
        if init.capabilities.prompts.is_some() {
            kinds.push(CapabilityKind::Prompt);
        }

        let lists = kinds.into_iter().map(|kind| async move {
            self.fetch_list(kind, deadline)
                .await
                .map(|items| (kind, items))
        });
        futures::future::try_join_all(lists).await
    }

    /// Fetch one capability list, following pagination cursors
    pub async fn fetch_list(
        &self,
        kind: CapabilityKind,
        deadline: Instant,
    ) -> ProxyResult<Vec<CapabilityItem>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let page = self.call(kind.list_method(), params, None, deadline).await?;
            let next = parse_list_page(self.name(), kind, page, &mut items)?;

            match next {
                Some(next) if !next.is_empty() && cursor.as_deref() != Some(next.as_str()) => {
                    cursor = Some(next);
                }
                _ => return Ok(items),
            }
        }

        tracing::warn!(backend = %self.name(), kind = %kind, "Capability list pagination did not terminate");
        Ok(items)
    }

    /// Forward one invocation, addressing the capability by its original id
    ///
    /// Everything in `params` other than the identifier is passed through
    /// untouched and the backend's result is returned as-is.
    pub async fn invoke(
        &self,
        kind: CapabilityKind,
        original_id: &str,
        params: Value,
        upstream_id: Option<JsonRpcId>,
        timeout: Duration,
    ) -> ProxyResult<Value> {
        let mut params = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => return Err(ProxyError::InvalidParams("params must be an object".to_string())),
        };
        params.insert(
            kind.id_field().to_string(),
            Value::String(original_id.to_string()),
        );

        self.request(kind.invoke_method(), Some(Value::Object(params)), upstream_id, timeout)
            .await
    }

    /// Send a request and wait for its response
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        upstream_id: Option<JsonRpcId>,
        timeout: Duration,
    ) -> ProxyResult<Value> {
        let deadline = Instant::now() + timeout;
        match self.call(method, params, upstream_id, deadline).await {
            Err(ProxyError::RequestTimeout(_)) => {
                Err(ProxyError::RequestTimeout(timeout.as_millis() as u64))
            }
            other => other,
        }
    }

    async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        upstream_id: Option<JsonRpcId>,
        deadline: Instant,
    ) -> ProxyResult<Value> {
        if self.state() == ConnectionState::Closed {
            return Err(ProxyError::BackendClosed {
                backend: self.name().to_string(),
            });
        }

        let started = Instant::now();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().unwrap_or_else(|e| e.into_inner()).insert(
            id,
            PendingRequest {
                tx,
                upstream_id,
                method: method.to_string(),
                deadline,
            },
        );

        let message: JsonRpcMessage = JsonRpcRequest::new(JsonRpcId::Number(id), method, params).into();

        // Streamable HTTP answers inside `send`, so both halves share the deadline
        let exchange = async {
            if let Err(e) = self.inner.transport.send(&message).await {
                self.inner.take_pending(id);
                if e.transient {
                    self.inner.mark_degraded(&e.message);
                }
                return Err(ProxyError::BackendUnreachable {
                    backend: self.name().to_string(),
                    reason: e.message,
                });
            }
            self.inner.mark_healthy();

            match rx.await {
                Ok(result) => result,
                Err(_) => Err(ProxyError::BackendClosed {
                    backend: self.name().to_string(),
                }),
            }
        };

        match tokio::time::timeout_at(deadline, exchange).await {
            Ok(result) => result,
            Err(_) => {
                if let Some(pending) = self.inner.take_pending(id) {
                    tracing::warn!(backend = %self.name(), method = %pending.method, "Request timed out");
                    self.send_cancelled(id, "request timed out").await;
                }
                Err(ProxyError::RequestTimeout(started.elapsed().as_millis() as u64))
            }
        }
    }

    /// Send a notification (no response expected)
    pub async fn notify(&self, method: &str, params: Option<Value>) -> ProxyResult<()> {
        let message: JsonRpcMessage = JsonRpcRequest::notification(method, params).into();
        self.inner
            .transport
            .send(&message)
            .await
            .map_err(|e| ProxyError::BackendUnreachable {
                backend: self.name().to_string(),
                reason: e.message,
            })
    }

    /// Cancel the forwarded call made on behalf of `upstream_id`
    ///
    /// Returns false when no such call is in flight on this connection.
    pub async fn cancel(&self, upstream_id: &JsonRpcId, reason: Option<&str>) -> bool {
        let found = {
            let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
            let id = pending
                .iter()
                .find(|(_, p)| p.upstream_id.as_ref() == Some(upstream_id))
                .map(|(id, _)| *id);
            id.and_then(|id| pending.remove(&id).map(|p| (id, p)))
        };

        let Some((id, pending)) = found else {
            return false;
        };

        tracing::debug!(backend = %self.name(), method = %pending.method, upstream_id = %upstream_id, "Cancelling request");
        let _ = pending.tx.send(Err(ProxyError::Cancelled));
        self.send_cancelled(id, reason.unwrap_or("cancelled by client")).await;
        true
    }

    async fn send_cancelled(&self, id: i64, reason: &str) {
        let params = CancelledParams {
            request_id: JsonRpcId::Number(id),
            reason: Some(reason.to_string()),
        };
        let params = serde_json::to_value(params).ok();
        if let Err(e) = self.notify("notifications/cancelled", params).await {
            tracing::debug!(backend = %self.name(), error = %e, "Failed to notify backend of cancellation");
        }
    }

    /// Close the connection; idempotent
    ///
    /// Pending requests resolve with `BackendClosed` and the transport is shut
    /// down (a process gets its stdin closed, a grace period, then a kill).
    pub async fn close(&self) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.set_state(ConnectionState::Closed);
        self.inner.fail_pending();
        self.inner.transport.shutdown().await;

        let tasks = std::mem::take(&mut *self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        drop(tasks);

        tracing::info!(backend = %self.name(), "Backend connection closed");
    }
}

impl Inner {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn set_state(&self, state: ConnectionState) {
        let mut previous = None;
        self.state_tx.send_if_modified(|current| {
            // Closed is terminal
            if *current == state || *current == ConnectionState::Closed {
                return false;
            }
            previous = Some(*current);
            *current = state;
            true
        });
        if let Some(previous) = previous {
            tracing::debug!(backend = %self.name(), from = ?previous, to = ?state, "Backend state changed");
        }
    }

    fn mark_degraded(&self, reason: &str) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == ConnectionState::Ready {
                *current = ConnectionState::Degraded;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::warn!(backend = %self.name(), reason = %reason, "Backend degraded");
            self.set_last_error(reason.to_string());
        }
    }

    fn mark_healthy(&self) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == ConnectionState::Degraded {
                *current = ConnectionState::Ready;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::info!(backend = %self.name(), "Backend recovered");
        }
    }

    fn set_last_error(&self, error: String) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(error);
    }

    fn take_pending(&self, id: i64) -> Option<PendingRequest> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id)
    }

    fn fail_pending(&self) {
        let drained: Vec<PendingRequest> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, p)| p)
            .collect();

        if !drained.is_empty() {
            tracing::debug!(backend = %self.name(), count = drained.len(), "Releasing pending requests");
        }
        for pending in drained {
            let _ = pending.tx.send(Err(ProxyError::BackendClosed {
                backend: self.name().to_string(),
            }));
        }
    }

    fn complete(&self, response: JsonRpcResponse) {
        let id = match &response.id {
            Some(JsonRpcId::Number(n)) => Some(*n),
            Some(JsonRpcId::String(s)) => s.parse().ok(),
            _ => None,
        };
        let Some(id) = id else {
            tracing::warn!(backend = %self.name(), id = ?response.id, "Response with unusable id");
            return;
        };

        let Some(pending) = self.take_pending(id) else {
            tracing::debug!(backend = %self.name(), id, "Response for unknown or expired request");
            return;
        };

        let result = match response.error {
            Some(error) => Err(ProxyError::Backend(error)),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };

        if Instant::now() > pending.deadline {
            tracing::debug!(backend = %self.name(), method = %pending.method, "Response arrived after deadline");
        }
        let _ = pending.tx.send(result);
    }

    fn on_transport_closed(&self, reason: String) {
        let intentional = self.closing.load(Ordering::SeqCst);
        self.set_state(ConnectionState::Closed);
        self.fail_pending();

        if intentional {
            return;
        }

        tracing::warn!(backend = %self.name(), reason = %reason, "Backend disconnected");
        self.set_last_error(reason.clone());
        let _ = self.events.send(BackendEvent::Closed {
            backend: self.name().to_string(),
            reason,
        });
    }

    async fn answer(&self, request: JsonRpcRequest) {
        let Some(id) = request.id.clone() else {
            match CapabilityKind::from_list_changed(&request.method) {
                Some(kind) => {
                    tracing::debug!(backend = %self.name(), kind = %kind, "Backend capability list changed");
                    let _ = self.relay.send(kind);
                }
                None => {
                    tracing::trace!(backend = %self.name(), method = %request.method, "Ignoring backend notification");
                }
            }
            return;
        };

        let response = match request.method.as_str() {
            "ping" => JsonRpcResponse::success(Some(id), json!({})),
            other => {
                tracing::debug!(backend = %self.name(), method = %other, "Rejecting backend request");
                JsonRpcResponse::error(Some(id), JsonRpcError::method_not_found(other))
            }
        };

        if let Err(e) = self.transport.send(&response.into()).await {
            tracing::debug!(backend = %self.name(), error = %e.message, "Failed to answer backend request");
        }
    }
}

/// Route everything the backend sends
async fn dispatch(inner: Weak<Inner>, mut inbound: mpsc::Receiver<Inbound>) {
    while let Some(message) = inbound.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match message {
            Inbound::Message(JsonRpcMessage::Response(response)) => inner.complete(response),
            Inbound::Message(JsonRpcMessage::Request(request)) => inner.answer(request).await,
            Inbound::Closed(reason) => {
                inner.on_transport_closed(reason);
                return;
            }
        }
    }

    if let Some(inner) = inner.upgrade() {
        inner.on_transport_closed("transport dropped".to_string());
    }
}

/// Refetch lists the backend announced as changed, one at a time
async fn relay_list_changes(inner: Weak<Inner>, mut changes: mpsc::UnboundedReceiver<CapabilityKind>) {
    while let Some(kind) = changes.recv().await {
        // Wait for the owner to open the gate without keeping the connection alive
        let mut gate = match inner.upgrade() {
            Some(inner) => inner.relay_gate.subscribe(),
            None => return,
        };
        if gate.wait_for(|open| *open).await.is_err() {
            return;
        }

        let Some(inner) = inner.upgrade() else {
            return;
        };
        let connection = BackendConnection { inner };
        if connection.state() == ConnectionState::Closed {
            return;
        }

        // A burst of notifications for the same kind needs only one refetch
        while let Ok(next) = changes.try_recv() {
            if next != kind {
                let _ = connection.inner.relay.send(next);
                break;
            }
        }

        let deadline = Instant::now() + connection.inner.timeouts.request;
        match connection.fetch_list(kind, deadline).await {
            Ok(items) => {
                let _ = connection.inner.events.send(BackendEvent::CapabilitiesChanged {
                    backend: connection.name().to_string(),
                    kind,
                    items,
                });
            }
            Err(e) => {
                tracing::warn!(backend = %connection.name(), kind = %kind, error = %e, "Failed to refresh capability list");
            }
        }
    }
}

fn parse_list_page(
    backend: &str,
    kind: CapabilityKind,
    page: Value,
    items: &mut Vec<CapabilityItem>,
) -> ProxyResult<Option<String>> {
    let Value::Object(mut page) = page else {
        return Err(ProxyError::Protocol(format!("{} result is not an object", kind.list_method())));
    };

    let next_cursor = page
        .get("nextCursor")
        .and_then(Value::as_str)
        .map(str::to_string);

    let raw = match page.remove(kind.result_key()) {
        Some(Value::Array(raw)) => raw,
        Some(Value::Null) | None => Vec::new(),
        Some(_) => {
            return Err(ProxyError::Protocol(format!(
                "{} result has no {} array",
                kind.list_method(),
                kind.result_key()
            )))
        }
    };

    for value in raw {
        let parsed = match kind {
            CapabilityKind::Tool => serde_json::from_value::<Tool>(value).map(CapabilityItem::Tool),
            CapabilityKind::Resource => {
                serde_json::from_value::<Resource>(value).map(CapabilityItem::Resource)
            }
            CapabilityKind::Prompt => {
                serde_json::from_value::<Prompt>(value).map(CapabilityItem::Prompt)
            }
        };
        match parsed {
            Ok(item) => items.push(item),
            Err(e) => {
                tracing::warn!(backend = %backend, kind = %kind, error = %e, "Skipping malformed capability");
            }
        }
    }

    Ok(next_cursor)
}

//! Per-connection proxy session
//!
//! One upstream connection gets one [`Session`]: its own supervisor, catalog
//! and router, built from the descriptors its credential resolves to and torn
//! down when the connection ends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use mcpfuse_shared::{validate_descriptors, DescriptorResolver};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::error::{ProxyError, ProxyResult};
use crate::mcp::catalog::CapabilityKind;
use crate::mcp::client::Timeouts;
use crate::mcp::router::Router;
use crate::mcp::supervisor::Supervisor;
use crate::mcp::transport::{AbortOnDrop, Connector};
use crate::mcp::types::{JsonRpcMessage, JsonRpcRequest, JsonRpcResponse};

/// Messages queued for the upstream client
pub type Outbound = mpsc::UnboundedSender<JsonRpcMessage>;

pub struct Session {
    id: Uuid,
    router: Arc<Router>,
    outbound: Outbound,
    forwarder: Mutex<Option<AbortOnDrop>>,
    closed: AtomicBool,
}

impl Session {
    /// Resolve `credential` and bring up its backends
    ///
    /// Resolution happens before anything is opened, so a rejected credential
    /// leaves no partial state. A session whose backends all fail is refused
    /// with `NoUsableBackends`.
    pub async fn open(
        credential: &str,
        resolver: &dyn DescriptorResolver,
        connector: Arc<dyn Connector>,
        timeouts: Timeouts,
        outbound: Outbound,
    ) -> ProxyResult<Self> {
        let id = Uuid::new_v4();

        let descriptors = resolver.resolve(credential).await.map_err(|e| {
            tracing::warn!(session_id = %id, error = %e, "Failed to resolve backends");
            ProxyError::from(e)
        })?;

        let (descriptors, rejected) = validate_descriptors(descriptors);
        tracing::info!(
            session_id = %id,
            backends = descriptors.len(),
            rejected = rejected.len(),
            "Opening session"
        );

        let supervisor = Supervisor::new(connector, timeouts);
        let report = supervisor.start(descriptors).await;
        if report.ready.is_empty() {
            supervisor.shutdown().await;
            tracing::error!(session_id = %id, failed = report.failed.len(), "No backend could be started");
            return Err(ProxyError::NoUsableBackends);
        }

        let changes = supervisor.subscribe_changes();
        let forwarder = tokio::spawn(forward_list_changes(id, changes, outbound.clone()));

        Ok(Self {
            id,
            router: Arc::new(Router::new(supervisor)),
            outbound,
            forwarder: Mutex::new(Some(AbortOnDrop(forwarder))),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Handle one upstream message on its own task
    ///
    /// Requests run concurrently; the response is queued on the outbound
    /// channel when it is ready.
    pub fn dispatch(&self, message: JsonRpcMessage) {
        match message {
            JsonRpcMessage::Request(request) => {
                let router = self.router.clone();
                let outbound = self.outbound.clone();
                tokio::spawn(async move {
                    if let Some(response) = router.handle_message(request).await {
                        let _ = outbound.send(response.into());
                    }
                });
            }
            JsonRpcMessage::Response(response) => {
                tracing::debug!(session_id = %self.id, id = ?response.id, "Ignoring response from client");
            }
        }
    }

    /// Queue a response produced outside the router (e.g. a parse error)
    pub fn reply(&self, response: JsonRpcResponse) {
        let _ = self.outbound.send(response.into());
    }

    /// Close every backend; idempotent
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let forwarder = self.forwarder.lock().unwrap_or_else(|e| e.into_inner()).take();
        drop(forwarder);

        self.router.supervisor().shutdown().await;
        tracing::info!(session_id = %self.id, "Session closed");
    }
}

async fn forward_list_changes(
    session_id: Uuid,
    mut changes: broadcast::Receiver<CapabilityKind>,
    outbound: Outbound,
) {
    loop {
        let kinds = match changes.recv().await {
            Ok(kind) => vec![kind],
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(session_id = %session_id, skipped, "Change notifications lagged");
                CapabilityKind::ALL.to_vec()
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        for kind in kinds {
            let notification = JsonRpcRequest::notification(kind.list_changed_notification(), None);
            if outbound.send(notification.into()).is_err() {
                return;
            }
        }
    }
}

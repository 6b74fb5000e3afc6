//! Shared state of the SSE bridge
//!
//! Every open SSE stream owns one session, registered here under the id it
//! advertises in its `endpoint` event.

use std::collections::HashMap;
use std::sync::Arc;

use mcpfuse_shared::DescriptorResolver;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::mcp::client::Timeouts;
use crate::mcp::transport::Connector;
use crate::session::Session;

/// Live sessions indexed by session id
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<Uuid, Arc<Session>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session
    pub async fn insert(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.id(), Arc::clone(&session));

        tracing::info!(
            session_id = %session.id(),
            total_sessions = sessions.len(),
            "Session added"
        );

        session
    }

    /// Remove a session; the caller is responsible for closing it
    pub async fn remove(&self, session_id: &Uuid) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        let removed = sessions.remove(session_id);
        if removed.is_some() {
            tracing::info!(
                session_id = %session_id,
                remaining_sessions = sessions.len(),
                "Session removed"
            );
        }
        removed
    }

    pub async fn get(&self, session_id: &Uuid) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Remove and close every session
    pub async fn close_all(&self) {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, session)| session).collect()
        };
        futures::future::join_all(drained.iter().map(|session| session.close())).await;
    }
}

/// Axum state for the SSE bridge
#[derive(Clone)]
pub struct BridgeState {
    pub sessions: SessionRegistry,
    pub resolver: Arc<dyn DescriptorResolver>,
    pub connector: Arc<dyn Connector>,
    pub timeouts: Timeouts,
    /// Used when a client presents no credential of its own
    pub default_credential: Option<String>,
}

impl BridgeState {
    pub fn new(
        resolver: Arc<dyn DescriptorResolver>,
        connector: Arc<dyn Connector>,
        timeouts: Timeouts,
        default_credential: Option<String>,
    ) -> Self {
        Self {
            sessions: SessionRegistry::new(),
            resolver,
            connector,
            timeouts,
            default_credential,
        }
    }
}

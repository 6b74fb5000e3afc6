//! Connection supervisor
//!
//! Opens one [`BackendConnection`] per descriptor, all concurrently, and owns
//! them for the life of a session. A single event loop applies capability
//! updates to the catalog and prunes backends that disappear; every change is
//! re-broadcast as the kind of list that changed.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use futures::stream::{FuturesUnordered, StreamExt};
use mcpfuse_shared::BackendDescriptor;
use tokio::sync::{broadcast, mpsc};

use super::catalog::{CapabilityKind, Catalog};
use super::client::{BackendConnection, BackendEvent, ConnectionState, InitialCapabilities, Timeouts};
use super::transport::{AbortOnDrop, Connector};
use crate::error::{ProxyError, ProxyResult};

/// Buffered list-changed signals per subscriber
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Outcome of [`Supervisor::start`]
#[derive(Debug, Default)]
pub struct StartReport {
    pub ready: Vec<String>,
    pub failed: Vec<(String, ProxyError)>,
}

#[derive(Default)]
struct Backends {
    connections: HashMap<String, BackendConnection>,
    /// Names that were attached and later dropped; never reused
    retired: HashSet<String>,
    shut_down: bool,
}

/// Owns the backend connections of one session
pub struct Supervisor {
    connector: Arc<dyn Connector>,
    timeouts: Timeouts,
    catalog: Arc<Catalog>,
    backends: Mutex<Backends>,
    events_tx: mpsc::UnboundedSender<BackendEvent>,
    changes: broadcast::Sender<CapabilityKind>,
    event_loop: Mutex<Option<AbortOnDrop>>,
}

impl Supervisor {
    pub fn new(connector: Arc<dyn Connector>, timeouts: Timeouts) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        let supervisor = Arc::new(Self {
            connector,
            timeouts,
            catalog: Arc::new(Catalog::new()),
            backends: Mutex::new(Backends::default()),
            events_tx,
            changes,
            event_loop: Mutex::new(None),
        });

        let handle = tokio::spawn(run_event_loop(Arc::downgrade(&supervisor), events_rx));
        *supervisor.event_loop.lock().unwrap_or_else(|e| e.into_inner()) = Some(AbortOnDrop(handle));

        supervisor
    }

    pub fn catalog(&self) -> Arc<Catalog> {
        self.catalog.clone()
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// Receive the kind of every list that changes from now on
    pub fn subscribe_changes(&self) -> broadcast::Receiver<CapabilityKind> {
        self.changes.subscribe()
    }

    /// Open every descriptor concurrently
    ///
    /// Each backend gets its own handshake timeout and is attached as soon as
    /// it is ready, so a slow backend never holds up the others. Catalog order
    /// follows `descriptors`, not handshake completion. Returns once every open
    /// has finished one way or the other.
    pub async fn start(&self, descriptors: Vec<BackendDescriptor>) -> StartReport {
        let mut report = StartReport::default();
        self.catalog
            .reserve(descriptors.iter().map(|descriptor| descriptor.name.as_str()));

        let mut opens: FuturesUnordered<_> = descriptors
            .into_iter()
            .map(|descriptor| {
                let name = descriptor.name.clone();
                let events = self.events_tx.clone();
                async move {
                    let result =
                        BackendConnection::open(descriptor, self.connector.as_ref(), self.timeouts, events)
                            .await;
                    (name, result)
                }
            })
            .collect();

        while let Some((name, result)) = opens.next().await {
            let attached = match result {
                Ok((connection, initial)) => match self.attach(connection.clone(), initial) {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        connection.close().await;
                        Err(e)
                    }
                },
                Err(e) => Err(e),
            };

            match attached {
                Ok(()) => report.ready.push(name),
                Err(e) => {
                    tracing::warn!(backend = %name, error = %e, "Backend failed to start");
                    // Release the reserved slot unless a live backend owns the name
                    if self.connection(&name).is_none() {
                        self.catalog.remove_backend(&name);
                    }
                    report.failed.push((name, e));
                }
            }
        }

        tracing::info!(
            ready = report.ready.len(),
            failed = report.failed.len(),
            "Backends started"
        );
        report
    }

    /// Register a ready connection and publish its initial lists
    fn attach(&self, connection: BackendConnection, initial: InitialCapabilities) -> ProxyResult<()> {
        let name = connection.name().to_string();
        let mut backends = self.backends.lock().unwrap_or_else(|e| e.into_inner());

        if backends.shut_down {
            return Err(ProxyError::BackendClosed { backend: name });
        }
        if backends.retired.contains(&name) || backends.connections.contains_key(&name) {
            return Err(ProxyError::Protocol(format!(
                "backend name '{}' is already in use in this session",
                name
            )));
        }

        for (kind, items) in initial {
            self.catalog.apply(&name, kind, items);
        }

        // Closed before we got here: its Closed event was ignored, prune now
        if connection.state() == ConnectionState::Closed {
            self.catalog.remove_backend(&name);
            backends.retired.insert(name.clone());
            return Err(ProxyError::BackendClosed { backend: name });
        }

        backends.connections.insert(name.clone(), connection.clone());
        drop(backends);

        connection.start_relay();
        tracing::debug!(backend = %name, "Backend attached");
        Ok(())
    }

    /// Live connection for `name`, if attached
    pub fn connection(&self, name: &str) -> Option<BackendConnection> {
        self.backends
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .connections
            .get(name)
            .cloned()
    }

    pub fn connections(&self) -> Vec<BackendConnection> {
        self.backends
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .connections
            .values()
            .cloned()
            .collect()
    }

    /// Remove one backend: prune its entries, notify, then close it
    ///
    /// Returns false if no such backend is attached.
    pub async fn drop_backend(&self, name: &str) -> bool {
        let Some(connection) = self.detach(name) else {
            return false;
        };
        connection.close().await;
        true
    }

    fn detach(&self, name: &str) -> Option<BackendConnection> {
        let connection = {
            let mut backends = self.backends.lock().unwrap_or_else(|e| e.into_inner());
            let connection = backends.connections.remove(name)?;
            backends.retired.insert(name.to_string());
            connection
        };

        for kind in self.catalog.remove_backend(name) {
            let _ = self.changes.send(kind);
        }
        Some(connection)
    }

    /// Close every connection concurrently
    ///
    /// All pending requests resolve with `BackendClosed`. Idempotent.
    pub async fn shutdown(&self) {
        let connections: Vec<BackendConnection> = {
            let mut backends = self.backends.lock().unwrap_or_else(|e| e.into_inner());
            if backends.shut_down {
                return;
            }
            backends.shut_down = true;
            let drained: Vec<_> = backends.connections.drain().map(|(_, conn)| conn).collect();
            backends.retired.extend(drained.iter().map(|conn| conn.name().to_string()));
            drained
        };

        let event_loop = self.event_loop.lock().unwrap_or_else(|e| e.into_inner()).take();
        drop(event_loop);

        tracing::info!(count = connections.len(), "Shutting down backends");
        futures::future::join_all(connections.iter().map(|conn| conn.close())).await;

        for name in self.catalog.snapshot().backends() {
            self.catalog.remove_backend(&name);
        }
    }

    fn handle_event(&self, event: BackendEvent) -> Option<BackendConnection> {
        match event {
            BackendEvent::CapabilitiesChanged { backend, kind, items } => {
                let backends = self.backends.lock().unwrap_or_else(|e| e.into_inner());
                if !backends.connections.contains_key(&backend) {
                    tracing::debug!(backend = %backend, "Ignoring update from detached backend");
                    return None;
                }
                let report = self.catalog.apply(&backend, kind, items);
                drop(backends);

                if !report.changed() {
                    tracing::debug!(backend = %backend, kind = %kind, "Capability list unchanged");
                    return None;
                }
                tracing::info!(
                    backend = %backend,
                    kind = %kind,
                    added = report.added.len(),
                    removed = report.removed.len(),
                    updated = report.updated.len(),
                    "Backend capabilities changed"
                );
                let _ = self.changes.send(kind);
                None
            }
            BackendEvent::Closed { backend, reason } => {
                let closed = self.detach(&backend);
                if closed.is_some() {
                    tracing::warn!(backend = %backend, reason = %reason, "Pruned disconnected backend");
                }
                closed
            }
        }
    }
}

async fn run_event_loop(supervisor: Weak<Supervisor>, mut events: mpsc::UnboundedReceiver<BackendEvent>) {
    while let Some(event) = events.recv().await {
        let Some(supervisor) = supervisor.upgrade() else {
            return;
        };
        // Reap the dead connection (process wait) outside the lock
        if let Some(closed) = supervisor.handle_event(event) {
            closed.close().await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::mcp::testing::{FakeBackend, FakeConnector};
    use std::time::{Duration, Instant};

    fn descriptor(name: &str) -> BackendDescriptor {
        BackendDescriptor::stdio(name, "fake", vec![])
    }

    fn supervisor(connector: &FakeConnector, handshake: Duration) -> Arc<Supervisor> {
        Supervisor::new(
            Arc::new(connector.clone()),
            Timeouts {
                handshake,
                request: Duration::from_secs(1),
            },
        )
    }

    fn tool_ids(supervisor: &Supervisor) -> Vec<String> {
        supervisor
            .catalog()
            .list_all(CapabilityKind::Tool)
            .iter()
            .map(|e| e.aggregated_id.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_slow_backend_does_not_block_others() {
        let connector = FakeConnector::new();
        connector.add(
            FakeBackend::new("a")
                .with_tools(&["fast"])
                .with_init_delay(Duration::from_millis(50)),
        );
        connector.add(FakeBackend::new("b").with_tools(&["never"]).hang_on_initialize());

        let supervisor = supervisor(&connector, Duration::from_millis(100));
        let started = Instant::now();
        let report = supervisor.start(vec![descriptor("a"), descriptor("b")]).await;

        // Concurrent opens: bounded by the handshake timeout, not the sum of delays
        assert!(started.elapsed() < Duration::from_millis(300), "took {:?}", started.elapsed());
        assert_eq!(report.ready, vec!["a"]);
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(report.failed[0].1, ProxyError::HandshakeTimeout { .. }));
        assert_eq!(tool_ids(&supervisor), vec!["a::fast"]);
    }

    #[tokio::test]
    async fn test_catalog_order_follows_descriptors() {
        let connector = FakeConnector::new();
        connector.add(
            FakeBackend::new("first")
                .with_tools(&["t"])
                .with_init_delay(Duration::from_millis(80)),
        );
        connector.add(FakeBackend::new("second").with_tools(&["t"]));
        connector.add(FakeBackend::new("third").with_tools(&["t"]));

        let supervisor = supervisor(&connector, Duration::from_millis(500));
        let report = supervisor
            .start(vec![
                descriptor("first"),
                descriptor("missing"),
                descriptor("second"),
                descriptor("third"),
            ])
            .await;

        assert_eq!(report.ready.len(), 3);
        assert_eq!(tool_ids(&supervisor), vec!["first::t", "second::t", "third::t"]);
        // The failed backend leaves no slot behind
        assert_eq!(
            supervisor.catalog().snapshot().backends(),
            vec!["first", "second", "third"]
        );
    }

    #[tokio::test]
    async fn test_unchanged_list_is_not_announced() {
        let connector = FakeConnector::new();
        let control = connector.add(FakeBackend::new("a").with_tools(&["one"]));

        let supervisor = supervisor(&connector, Duration::from_millis(500));
        supervisor.start(vec![descriptor("a")]).await;
        let mut changes = supervisor.subscribe_changes();

        control.set_tools(&["one"]);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(changes.try_recv().is_err());

        control.set_tools(&["one", "two"]);
        let kind = tokio::time::timeout(Duration::from_secs(2), changes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kind, CapabilityKind::Tool);
        assert_eq!(tool_ids(&supervisor), vec!["a::one", "a::two"]);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_isolated() {
        let connector = FakeConnector::new();
        connector.add(FakeBackend::new("ok").with_tools(&["t"]));

        let supervisor = supervisor(&connector, Duration::from_millis(500));
        let report = supervisor.start(vec![descriptor("missing"), descriptor("ok")]).await;

        assert_eq!(report.ready, vec!["ok"]);
        assert!(matches!(
            report.failed[0].1,
            ProxyError::BackendUnreachable { .. }
        ));
        assert_eq!(tool_ids(&supervisor), vec!["ok::t"]);
    }

    #[tokio::test]
    async fn test_crashed_backend_is_pruned_and_announced() {
        let connector = FakeConnector::new();
        connector.add(FakeBackend::new("a").with_tools(&["x"]));
        let control_b = connector.add(FakeBackend::new("b").with_tools(&["x", "y"]));
        connector.add(FakeBackend::new("c").with_tools(&["z"]));

        let supervisor = supervisor(&connector, Duration::from_millis(500));
        supervisor
            .start(vec![descriptor("a"), descriptor("b"), descriptor("c")])
            .await;
        let mut changes = supervisor.subscribe_changes();
        let before: Vec<_> = tool_ids(&supervisor)
            .into_iter()
            .filter(|id| !id.starts_with("b::"))
            .collect();

        control_b.crash();
        let kind = tokio::time::timeout(Duration::from_secs(2), changes.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(kind, CapabilityKind::Tool);
        assert_eq!(tool_ids(&supervisor), before);
        assert!(supervisor.connection("b").is_none());
    }

    #[tokio::test]
    async fn test_list_changed_is_merged_and_broadcast() {
        let connector = FakeConnector::new();
        connector.add(FakeBackend::new("a").with_tools(&["one"]));
        let control_b = connector.add(FakeBackend::new("b").with_tools(&["two"]));

        let supervisor = supervisor(&connector, Duration::from_millis(500));
        supervisor.start(vec![descriptor("a"), descriptor("b")]).await;
        let mut changes = supervisor.subscribe_changes();

        control_b.set_tools(&["two", "three"]);
        let kind = tokio::time::timeout(Duration::from_secs(2), changes.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(kind, CapabilityKind::Tool);
        let ids = tool_ids(&supervisor);
        assert!(ids.contains(&"b::three".to_string()));
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn test_drop_backend_retires_name() {
        let connector = FakeConnector::new();
        connector.add(FakeBackend::new("a").with_tools(&["x"]));

        let supervisor = supervisor(&connector, Duration::from_millis(500));
        supervisor.start(vec![descriptor("a")]).await;

        assert!(supervisor.drop_backend("a").await);
        assert!(!supervisor.drop_backend("a").await);
        assert!(tool_ids(&supervisor).is_empty());

        let report = supervisor.start(vec![descriptor("a")]).await;
        assert!(report.ready.is_empty());
        assert!(matches!(report.failed[0].1, ProxyError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_shutdown_releases_pending_requests() {
        let connector = FakeConnector::new();
        connector.add(
            FakeBackend::new("slow")
                .with_tools(&["wait"])
                .with_call_delay(Duration::from_secs(5)),
        );

        let supervisor = supervisor(&connector, Duration::from_millis(500));
        supervisor.start(vec![descriptor("slow")]).await;
        let conn = supervisor.connection("slow").unwrap();

        let call = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.invoke(
                    CapabilityKind::Tool,
                    "wait",
                    serde_json::json!({}),
                    None,
                    Duration::from_secs(5),
                )
                .await
            })
        };
        while conn.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        supervisor.shutdown().await;
        assert!(matches!(call.await.unwrap(), Err(ProxyError::BackendClosed { .. })));
        assert!(supervisor.connections().is_empty());
        assert!(supervisor.catalog().snapshot().is_empty());
    }
}

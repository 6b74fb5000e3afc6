//! Aggregate capability catalog
//!
//! Holds every tool, resource and prompt the session's backends currently
//! advertise, keyed by aggregated id (`<backend>::<original>`). Readers take
//! an `Arc` snapshot and never see a half-applied update; writers build a new
//! snapshot and swap it in under a writer lock.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;

use super::router::aggregate_id;
use super::types::{Prompt, Resource, Tool};

/// The three kinds of capability a backend can advertise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    Tool,
    Resource,
    Prompt,
}

impl CapabilityKind {
    pub const ALL: [CapabilityKind; 3] = [
        CapabilityKind::Tool,
        CapabilityKind::Resource,
        CapabilityKind::Prompt,
    ];

    fn slot(self) -> usize {
        match self {
            CapabilityKind::Tool => 0,
            CapabilityKind::Resource => 1,
            CapabilityKind::Prompt => 2,
        }
    }

    /// Method used to fetch the list from a backend
    pub fn list_method(self) -> &'static str {
        match self {
            CapabilityKind::Tool => "tools/list",
            CapabilityKind::Resource => "resources/list",
            CapabilityKind::Prompt => "prompts/list",
        }
    }

    /// Method used to invoke one capability
    pub fn invoke_method(self) -> &'static str {
        match self {
            CapabilityKind::Tool => "tools/call",
            CapabilityKind::Resource => "resources/read",
            CapabilityKind::Prompt => "prompts/get",
        }
    }

    /// Field in list results and invoke params that carries the identifier
    pub fn id_field(self) -> &'static str {
        match self {
            CapabilityKind::Tool | CapabilityKind::Prompt => "name",
            CapabilityKind::Resource => "uri",
        }
    }

    /// Key of the item array in list results
    pub fn result_key(self) -> &'static str {
        match self {
            CapabilityKind::Tool => "tools",
            CapabilityKind::Resource => "resources",
            CapabilityKind::Prompt => "prompts",
        }
    }

    pub fn list_changed_notification(self) -> &'static str {
        match self {
            CapabilityKind::Tool => "notifications/tools/list_changed",
            CapabilityKind::Resource => "notifications/resources/list_changed",
            CapabilityKind::Prompt => "notifications/prompts/list_changed",
        }
    }

    /// Reverse of [`list_changed_notification`](Self::list_changed_notification)
    pub fn from_list_changed(method: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.list_changed_notification() == method)
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityKind::Tool => write!(f, "tool"),
            CapabilityKind::Resource => write!(f, "resource"),
            CapabilityKind::Prompt => write!(f, "prompt"),
        }
    }
}

/// A backend's own definition of a capability
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityItem {
    Tool(Tool),
    Resource(Resource),
    Prompt(Prompt),
}

impl CapabilityItem {
    pub fn kind(&self) -> CapabilityKind {
        match self {
            CapabilityItem::Tool(_) => CapabilityKind::Tool,
            CapabilityItem::Resource(_) => CapabilityKind::Resource,
            CapabilityItem::Prompt(_) => CapabilityKind::Prompt,
        }
    }

    /// Identifier the backend knows this capability by (name, or URI for resources)
    pub fn original_id(&self) -> &str {
        match self {
            CapabilityItem::Tool(tool) => &tool.name,
            CapabilityItem::Resource(resource) => &resource.uri,
            CapabilityItem::Prompt(prompt) => &prompt.name,
        }
    }

    pub fn description(&self) -> Option<&str> {
        match self {
            CapabilityItem::Tool(tool) => tool.description.as_deref(),
            CapabilityItem::Resource(resource) => resource.description.as_deref(),
            CapabilityItem::Prompt(prompt) => prompt.description.as_deref(),
        }
    }

    pub fn to_value(&self) -> Value {
        let value = match self {
            CapabilityItem::Tool(tool) => serde_json::to_value(tool),
            CapabilityItem::Resource(resource) => serde_json::to_value(resource),
            CapabilityItem::Prompt(prompt) => serde_json::to_value(prompt),
        };
        value.unwrap_or(Value::Null)
    }
}

/// One capability as seen upstream
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityEntry {
    pub aggregated_id: String,
    pub owner_backend: String,
    pub original_id: String,
    pub kind: CapabilityKind,
    pub metadata: CapabilityItem,
}

/// A backend listed the same original id more than once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateCapability {
    pub backend: String,
    pub kind: CapabilityKind,
    pub original_id: String,
}

/// Outcome of one [`Catalog::apply`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Kept ids whose definition differs from the previous one
    pub updated: Vec<String>,
    /// Same ids as before, in a different order
    pub reordered: bool,
    pub duplicates: Vec<DuplicateCapability>,
}

impl MergeReport {
    /// Whether upstream would see a different list
    pub fn changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty() || !self.updated.is_empty() || self.reordered
    }
}

type EntryList = Arc<Vec<Arc<CapabilityEntry>>>;

#[derive(Debug, Clone)]
struct BackendSlot {
    backend: String,
    entries: [EntryList; 3],
}

impl BackendSlot {
    fn new(backend: &str) -> Self {
        Self {
            backend: backend.to_string(),
            entries: Default::default(),
        }
    }
}

/// Immutable view of the catalog at one point in time
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    /// Backends in reservation (or first attach) order
    slots: Vec<BackendSlot>,
    index: HashMap<(CapabilityKind, String), Arc<CapabilityEntry>>,
}

impl CatalogSnapshot {
    /// Entries of `kind`, in backend order then original order
    pub fn list_all(&self, kind: CapabilityKind) -> Vec<Arc<CapabilityEntry>> {
        self.slots
            .iter()
            .flat_map(|slot| slot.entries[kind.slot()].iter().cloned())
            .collect()
    }

    pub fn resolve(&self, kind: CapabilityKind, aggregated_id: &str) -> Option<Arc<CapabilityEntry>> {
        self.index.get(&(kind, aggregated_id.to_string())).cloned()
    }

    pub fn backends(&self) -> Vec<String> {
        self.slots.iter().map(|slot| slot.backend.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

/// Copy-on-write capability catalog shared by the supervisor and router
#[derive(Debug, Default)]
pub struct Catalog {
    current: RwLock<Arc<CatalogSnapshot>>,
    writer: Mutex<()>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current consistent snapshot
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn list_all(&self, kind: CapabilityKind) -> Vec<Arc<CapabilityEntry>> {
        self.snapshot().list_all(kind)
    }

    pub fn resolve(&self, kind: CapabilityKind, aggregated_id: &str) -> Option<Arc<CapabilityEntry>> {
        self.snapshot().resolve(kind, aggregated_id)
    }

    /// Reserve empty slots, in order, for backends about to be opened
    ///
    /// Presentation order then follows `backends` no matter which backend
    /// finishes its handshake first. Names that already have a slot keep it.
    pub fn reserve<'a>(&self, backends: impl IntoIterator<Item = &'a str>) {
        let _writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = (*self.snapshot()).clone();

        for backend in backends {
            if !next.slots.iter().any(|slot| slot.backend == backend) {
                next.slots.push(BackendSlot::new(backend));
            }
        }
        self.publish(next);
    }

    /// Replace everything `backend` advertises for `kind` with `items`
    ///
    /// A backend without a reserved slot gets one after every existing
    /// backend; later updates keep that slot.
    pub fn apply(&self, backend: &str, kind: CapabilityKind, items: Vec<CapabilityItem>) -> MergeReport {
        let _writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = (*self.snapshot()).clone();
        let mut report = MergeReport::default();

        // Deduplicate: later definition wins, keeping the position of the first
        let mut entries: Vec<Arc<CapabilityEntry>> = Vec::with_capacity(items.len());
        let mut positions: HashMap<String, usize> = HashMap::new();
        for item in items {
            if item.kind() != kind {
                tracing::warn!(backend = %backend, expected = %kind, got = %item.kind(), "Ignoring capability of wrong kind");
                continue;
            }
            let original_id = item.original_id().to_string();
            let entry = Arc::new(CapabilityEntry {
                aggregated_id: aggregate_id(backend, &original_id),
                owner_backend: backend.to_string(),
                original_id: original_id.clone(),
                kind,
                metadata: item,
            });
            match positions.get(&original_id) {
                Some(&pos) => {
                    tracing::warn!(
                        backend = %backend,
                        kind = %kind,
                        id = %original_id,
                        "Backend advertised duplicate capability, keeping the later definition"
                    );
                    report.duplicates.push(DuplicateCapability {
                        backend: backend.to_string(),
                        kind,
                        original_id,
                    });
                    entries[pos] = entry;
                }
                None => {
                    positions.insert(original_id, entries.len());
                    entries.push(entry);
                }
            }
        }

        let slot_pos = match next.slots.iter().position(|slot| slot.backend == backend) {
            Some(pos) => pos,
            None => {
                next.slots.push(BackendSlot::new(backend));
                next.slots.len() - 1
            }
        };

        let previous = std::mem::replace(
            &mut next.slots[slot_pos].entries[kind.slot()],
            Arc::new(entries),
        );

        let new_ids: HashSet<&str> = next.slots[slot_pos].entries[kind.slot()]
            .iter()
            .map(|e| e.aggregated_id.as_str())
            .collect();
        let old_ids: HashSet<&str> = previous.iter().map(|e| e.aggregated_id.as_str()).collect();

        report.removed = previous
            .iter()
            .filter(|e| !new_ids.contains(e.aggregated_id.as_str()))
            .map(|e| e.aggregated_id.clone())
            .collect();
        report.added = next.slots[slot_pos].entries[kind.slot()]
            .iter()
            .filter(|e| !old_ids.contains(e.aggregated_id.as_str()))
            .map(|e| e.aggregated_id.clone())
            .collect();

        let current = &next.slots[slot_pos].entries[kind.slot()];
        let old_by_id: HashMap<&str, &CapabilityItem> = previous
            .iter()
            .map(|e| (e.aggregated_id.as_str(), &e.metadata))
            .collect();
        report.updated = current
            .iter()
            .filter(|e| {
                old_by_id
                    .get(e.aggregated_id.as_str())
                    .is_some_and(|old| **old != e.metadata)
            })
            .map(|e| e.aggregated_id.clone())
            .collect();
        report.reordered = report.added.is_empty()
            && report.removed.is_empty()
            && !current
                .iter()
                .map(|e| e.aggregated_id.as_str())
                .eq(previous.iter().map(|e| e.aggregated_id.as_str()));

        for entry in previous.iter() {
            next.index.remove(&(kind, entry.aggregated_id.clone()));
        }
        for entry in next.slots[slot_pos].entries[kind.slot()].iter() {
            next.index
                .insert((kind, entry.aggregated_id.clone()), entry.clone());
        }

        self.publish(next);

        tracing::debug!(
            backend = %backend,
            kind = %kind,
            added = report.added.len(),
            removed = report.removed.len(),
            "Merged capability list"
        );

        report
    }

    /// Drop every entry owned by `backend`; returns the kinds that lost entries
    pub fn remove_backend(&self, backend: &str) -> Vec<CapabilityKind> {
        let _writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = (*self.snapshot()).clone();

        let Some(pos) = next.slots.iter().position(|slot| slot.backend == backend) else {
            return Vec::new();
        };
        let slot = next.slots.remove(pos);

        let mut lost = Vec::new();
        for kind in CapabilityKind::ALL {
            let entries = &slot.entries[kind.slot()];
            if entries.is_empty() {
                continue;
            }
            for entry in entries.iter() {
                next.index.remove(&(kind, entry.aggregated_id.clone()));
            }
            lost.push(kind);
        }

        self.publish(next);
        tracing::info!(backend = %backend, "Removed backend from catalog");
        lost
    }

    fn publish(&self, next: CatalogSnapshot) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(next);
    }
}

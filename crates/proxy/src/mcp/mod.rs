//! MCP (Model Context Protocol) Proxy Module
//!
//! Aggregates several backend MCP servers behind one upstream connection.
//!
//! # Architecture
//!
//! ```text
//! Client (Claude/Cursor) --> Router --> Supervisor --> BackendConnection (github)
//!                              |                  --> BackendConnection (slack)
//!                              +--> Catalog       --> BackendConnection (...)
//! ```
//!
//! # Features
//!
//! - Namespacing: `{backend}::{original}` for tools, resources and prompts
//! - Partial failure handling: a backend that fails or disappears is pruned,
//!   the rest keep serving
//! - Pipelined requests per backend, with per-request timeouts and cancellation
//! - Stdio, streamable HTTP and HTTP+SSE backend transports

pub mod catalog;
pub mod client;
pub mod router;
pub mod streaming;
pub mod supervisor;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use catalog::{
    CapabilityEntry, CapabilityItem, CapabilityKind, Catalog, CatalogSnapshot, DuplicateCapability,
    MergeReport,
};
pub use client::{BackendConnection, BackendEvent, ConnectionState, Timeouts};
pub use router::{aggregate_id, split_aggregate_id, McpMethod, Router};
pub use streaming::UpstreamEvent;
pub use supervisor::{StartReport, Supervisor};
pub use transport::{Connector, Transport, TransportConnector, TransportHandle};
pub use types::*;

//! Common types used across mcpfuse

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DescriptorError;

/// Separator between backend name and original identifier in aggregated ids
pub const NAMESPACE_SEPARATOR: &str = "::";

// =============================================================================
// Backend Descriptors
// =============================================================================

/// Coarse transport classification of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Spawned subprocess speaking over stdio
    Process,
    /// Network stream (streamable HTTP or HTTP+SSE)
    Stream,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Process => write!(f, "process"),
            TransportKind::Stream => write!(f, "stream"),
        }
    }
}

/// Transport parameters for one backend MCP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendTransport {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Streamable HTTP: every message is a POST, replies come in the body
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    /// Legacy HTTP+SSE: a long-lived GET event stream plus POSTs to the announced endpoint
    Sse {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl BackendTransport {
    /// Which family of transport this is
    pub fn kind(&self) -> TransportKind {
        match self {
            BackendTransport::Stdio { .. } => TransportKind::Process,
            BackendTransport::Http { .. } | BackendTransport::Sse { .. } => TransportKind::Stream,
        }
    }

    /// Short label for logs
    pub fn label(&self) -> &'static str {
        match self {
            BackendTransport::Stdio { .. } => "stdio",
            BackendTransport::Http { .. } => "http",
            BackendTransport::Sse { .. } => "sse",
        }
    }
}

/// A resolved backend: immutable once handed to the supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub name: String,
    pub transport: BackendTransport,
}

impl BackendDescriptor {
    pub fn new(name: impl Into<String>, transport: BackendTransport) -> Self {
        Self {
            name: name.into(),
            transport,
        }
    }

    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self::new(
            name,
            BackendTransport::Stdio {
                command: command.into(),
                args,
                env: HashMap::new(),
            },
        )
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Check the name can be used as a namespace prefix
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.name.trim().is_empty() {
            return Err(DescriptorError::EmptyName);
        }
        if self.name.contains(NAMESPACE_SEPARATOR) {
            return Err(DescriptorError::ReservedSeparator(self.name.clone()));
        }
        match &self.transport {
            BackendTransport::Stdio { command, .. } if command.trim().is_empty() => {
                Err(DescriptorError::MissingCommand(self.name.clone()))
            }
            BackendTransport::Http { url, .. } | BackendTransport::Sse { url, .. }
                if url.trim().is_empty() =>
            {
                Err(DescriptorError::MissingUrl(self.name.clone()))
            }
            _ => Ok(()),
        }
    }
}

/// Filter a resolved list down to descriptors that can be attached
///
/// Order is preserved. Invalid and duplicate-named descriptors are returned
/// separately so callers can report them without aborting the rest.
pub fn validate_descriptors(
    descriptors: Vec<BackendDescriptor>,
) -> (Vec<BackendDescriptor>, Vec<DescriptorError>) {
    let mut seen = HashSet::new();
    let mut accepted = Vec::with_capacity(descriptors.len());
    let mut rejected = Vec::new();

    for descriptor in descriptors {
        if let Err(e) = descriptor.validate() {
            tracing::warn!(backend = %descriptor.name, error = %e, "Rejecting backend descriptor");
            rejected.push(e);
            continue;
        }
        if !seen.insert(descriptor.name.clone()) {
            tracing::warn!(backend = %descriptor.name, "Duplicate backend name, keeping the first");
            rejected.push(DescriptorError::DuplicateName(descriptor.name));
            continue;
        }
        accepted.push(descriptor);
    }

    (accepted, rejected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind() {
        let stdio = BackendDescriptor::stdio("fs", "npx", vec![]);
        assert_eq!(stdio.kind(), TransportKind::Process);

        let sse = BackendDescriptor::new(
            "remote",
            BackendTransport::Sse {
                url: "http://localhost:3001/sse".to_string(),
                headers: HashMap::new(),
            },
        );
        assert_eq!(sse.kind(), TransportKind::Stream);
    }

    #[test]
    fn test_transport_parsing() {
        let json = r#"{"name": "logseq", "transport": {"type": "sse", "url": "http://0.0.0.0:3412/sse"}}"#;
        let descriptor: BackendDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(descriptor.name, "logseq");
        assert!(matches!(descriptor.transport, BackendTransport::Sse { .. }));
    }

    #[test]
    fn test_validate_rejects_separator_and_duplicates() {
        let descriptors = vec![
            BackendDescriptor::stdio("a", "node", vec![]),
            BackendDescriptor::stdio("b::c", "node", vec![]),
            BackendDescriptor::stdio("a", "python", vec![]),
            BackendDescriptor::stdio("", "node", vec![]),
            BackendDescriptor::stdio("d", "node", vec![]),
        ];

        let (accepted, rejected) = validate_descriptors(descriptors);
        let names: Vec<_> = accepted.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["a", "d"]);
        assert_eq!(rejected.len(), 3);
        assert!(rejected.contains(&DescriptorError::DuplicateName("a".to_string())));
    }

    #[test]
    fn test_validate_rejects_missing_command() {
        let descriptor = BackendDescriptor::stdio("empty", "  ", vec![]);
        assert_eq!(
            descriptor.validate(),
            Err(DescriptorError::MissingCommand("empty".to_string()))
        );
    }
}

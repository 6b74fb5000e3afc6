//! Proxy error types and their upstream mapping

use mcpfuse_shared::ResolveError;

use crate::mcp::types::JsonRpcError;

/// Errors raised by the proxy core
///
/// Per-backend failures are isolated by the supervisor, per-request failures
/// go back to the caller as JSON-RPC errors, and only resolver and upstream
/// transport failures end a session.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProxyError {
    // Backend lifecycle
    #[error("Backend '{backend}' unreachable: {reason}")]
    BackendUnreachable { backend: String, reason: String },
    #[error("Backend '{backend}' did not complete the handshake in time")]
    HandshakeTimeout { backend: String },
    #[error("Backend '{backend}' closed")]
    BackendClosed { backend: String },

    // Routing
    #[error("Unknown capability: {0}")]
    UnknownCapability(String),
    #[error("Request timed out after {0} ms")]
    RequestTimeout(u64),
    #[error("Request cancelled")]
    Cancelled,
    #[error("Invalid params: {0}")]
    InvalidParams(String),
    /// Error object returned by a backend, forwarded verbatim
    #[error("Backend error {}: {}", .0.code, .0.message)]
    Backend(JsonRpcError),
    #[error("Protocol error: {0}")]
    Protocol(String),

    // Session
    #[error("Invalid credential")]
    InvalidCredential,
    #[error("Forbidden")]
    Forbidden,
    #[error("Descriptor resolver unavailable: {0}")]
    ResolverUnavailable(String),
    #[error("No usable backends")]
    NoUsableBackends,
    #[error("Upstream transport error: {0}")]
    UpstreamTransportError(String),
}

impl ProxyError {
    /// Convert to the error object sent upstream
    ///
    /// Messages never name the backend that failed; upstream only knows the
    /// aggregated identifiers it asked for.
    pub fn to_json_rpc(&self) -> JsonRpcError {
        match self {
            ProxyError::Backend(err) => err.clone(),
            ProxyError::UnknownCapability(id) => {
                JsonRpcError::invalid_params(format!("Unknown capability: {}", id))
            }
            ProxyError::InvalidParams(msg) => JsonRpcError::invalid_params(msg.clone()),
            ProxyError::RequestTimeout(ms) => {
                JsonRpcError::internal_error(format!("Request timed out after {} ms", ms))
            }
            ProxyError::Cancelled => JsonRpcError::internal_error("Request cancelled"),
            ProxyError::BackendClosed { .. } => {
                JsonRpcError::internal_error("The server handling this request is no longer available")
            }
            ProxyError::BackendUnreachable { .. } | ProxyError::HandshakeTimeout { .. } => {
                JsonRpcError::internal_error("The server handling this request is unreachable")
            }
            ProxyError::Protocol(_) => {
                JsonRpcError::internal_error("Invalid response from the server handling this request")
            }
            ProxyError::InvalidCredential
            | ProxyError::Forbidden
            | ProxyError::ResolverUnavailable(_)
            | ProxyError::NoUsableBackends
            | ProxyError::UpstreamTransportError(_) => JsonRpcError::internal_error(self.to_string()),
        }
    }
}

impl From<ResolveError> for ProxyError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::InvalidCredential => ProxyError::InvalidCredential,
            ResolveError::Forbidden => ProxyError::Forbidden,
            ResolveError::ResolverUnavailable(msg) => ProxyError::ResolverUnavailable(msg),
        }
    }
}

/// Result type alias for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;

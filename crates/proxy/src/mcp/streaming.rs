//! SSE (Server-Sent Events) framing for the upstream stream
//!
//! An upstream SSE connection first receives an `endpoint` event naming the
//! URL it must POST its messages to, then one `message` event per JSON-RPC
//! response or notification.

use axum::response::sse::Event;

use super::types::JsonRpcMessage;

/// Events that can be streamed to the client via SSE
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    /// Where to POST client messages for this session
    Endpoint { url: String },

    /// A response or notification for the client
    Message(JsonRpcMessage),
}

impl UpstreamEvent {
    /// Convert event to SSE data string
    pub fn to_sse_data(&self) -> String {
        match self {
            UpstreamEvent::Endpoint { url } => url.clone(),
            UpstreamEvent::Message(message) => serde_json::to_string(message).unwrap_or_default(),
        }
    }

    /// Get the SSE event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            UpstreamEvent::Endpoint { .. } => "endpoint",
            UpstreamEvent::Message(_) => "message",
        }
    }

    pub fn into_sse(self) -> Event {
        Event::default()
            .event(self.event_type())
            .data(self.to_sse_data())
    }
}

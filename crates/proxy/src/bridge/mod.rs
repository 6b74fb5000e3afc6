//! Upstream bridges
//!
//! - `stdio`: a single session on the proxy's own stdin/stdout
//! - `sse`: an axum server opening one session per SSE stream

pub mod sse;
pub mod state;
pub mod stdio;

pub use sse::{create_router, BridgeError};
pub use state::{BridgeState, SessionRegistry};

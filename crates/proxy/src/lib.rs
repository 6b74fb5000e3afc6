//! mcpfuse proxy library
//!
//! Aggregates the tools, resources and prompts of several MCP servers behind
//! one upstream connection, served over stdio or HTTP+SSE.

pub mod bridge;
pub mod config;
pub mod error;
pub mod mcp;
pub mod session;

pub use config::{Config, ConfigError, LogFormat, UpstreamMode};
pub use error::{ProxyError, ProxyResult};
pub use session::Session;

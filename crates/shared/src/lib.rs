//! mcpfuse Shared Types and Utilities
//!
//! Backend descriptors and the resolver boundary shared by the proxy and any
//! tooling that issues credentials.

pub mod error;
pub mod resolver;
pub mod types;

pub use error::*;
pub use resolver::{DescriptorResolver, HttpResolver, StaticResolver};
pub use types::*;

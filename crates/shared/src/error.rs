//! Error types shared by the resolver boundary

use thiserror::Error;

/// Failure of the descriptor resolver. Every variant is fatal to the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("Invalid credential")]
    InvalidCredential,

    #[error("Credential is not allowed to access any backend")]
    Forbidden,

    #[error("Descriptor resolver unavailable: {0}")]
    ResolverUnavailable(String),
}

/// Reason a single descriptor was not attached
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("Backend name must not be empty")]
    EmptyName,

    #[error("Backend name '{0}' contains the reserved separator '::'")]
    ReservedSeparator(String),

    #[error("Backend name '{0}' is already in use")]
    DuplicateName(String),

    #[error("Backend '{0}' has no command")]
    MissingCommand(String),

    #[error("Backend '{0}' has no URL")]
    MissingUrl(String),
}

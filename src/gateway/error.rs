// Error taxonomy for the gateway core

use thiserror::Error;

/// Errors produced by the persistence collaborators
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no {0} record matched")]
    Missing(&'static str),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Failure classes surfaced by the routing and authentication paths
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Missing, malformed, expired or mismatched credential
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Request rejected before any side effect
    #[error("invalid request: {0}")]
    Validation(String),

    /// Unknown group or identity reference
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    /// Store unreachable or write failed
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),
}

impl GatewayError {
    pub fn validation(message: impl Into<String>) -> Self {
        GatewayError::Validation(message.into())
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        GatewayError::Authentication(message.into())
    }

    /// Short label used in structured log fields
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Authentication(_) => "authentication",
            GatewayError::Validation(_) => "validation",
            GatewayError::NotFound { .. } => "not_found",
            GatewayError::Persistence(_) => "persistence",
        }
    }
}

use std::io;

use crate::rule::RuleError;

/// Errors surfaced by the fleet's control operations
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("rule not found: {0}")]
    NotFound(String),

    #[error("rule {0} is not running")]
    NotRunning(String),

    #[error("rule id already exists: {0}")]
    DuplicateId(String),

    #[error("invalid rule: {0}")]
    InvalidRule(#[from] RuleError),

    #[error("failed to listen on port {port} for rule {id}: {source}")]
    Bind {
        id: String,
        port: u16,
        #[source]
        source: io::Error,
    },
}

impl FleetError {
    /// Whether this error only reports an unknown or idle rule
    pub fn is_not_found(&self) -> bool {
        matches!(self, FleetError::NotFound(_) | FleetError::NotRunning(_))
    }
}

/// Result type for fleet operations
pub type FleetResult<T> = Result<T, FleetError>;

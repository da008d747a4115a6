//! Error types for layered-memory.

use thiserror::Error;

/// Result type alias using layered-memory's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during memory operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Empty or malformed input
    #[error("Validation error: {0}")]
    Validation(String),

    /// An external collaborator (LLM, vector store, session store) failed
    #[error("Collaborator error: {collaborator} - {message}")]
    Collaborator {
        collaborator: String,
        message: String,
    },

    /// Durable write failed while durability was required
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// SQLite-backed storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// A consolidation task could not be scheduled
    #[error("Failed to schedule consolidation for session {session_id}: {message}")]
    ConsolidationScheduling { session_id: String, message: String },

    /// Context retrieval failed outside the isolated branches
    #[error("Context retrieval failed: {message}")]
    Retrieval {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout during operation
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a collaborator error.
    pub fn collaborator(collaborator: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Collaborator {
            collaborator: collaborator.into(),
            message: message.into(),
        }
    }

    /// Create a scheduling error.
    pub fn consolidation_scheduling(
        session_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ConsolidationScheduling {
            session_id: session_id.into(),
            message: message.into(),
        }
    }

    /// Wrap an error that escaped the retrieval branches.
    pub fn retrieval(source: Error) -> Self {
        Self::Retrieval {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Whether the error came from an external collaborator.
    pub fn is_collaborator(&self) -> bool {
        matches!(self, Self::Collaborator { .. })
    }
}

/// Reject empty or whitespace-only identifiers.
pub(crate) fn require_id(kind: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::validation(format!("{} must not be empty", kind)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_id_rejects_blank() {
        assert!(require_id("session_id", "").is_err());
        assert!(require_id("session_id", "   ").is_err());
        assert!(require_id("session_id", "s-1").is_ok());
    }

    #[test]
    fn test_retrieval_wraps_source() {
        let err = Error::retrieval(Error::collaborator("sanitizer", "boom"));
        assert!(err.to_string().contains("sanitizer"));
        assert!(std::error::Error::source(&err).is_some());
    }
}

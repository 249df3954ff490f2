//! Error types for the state-storage layer
//!
//! Every fallible operation in the library returns [`StateError`]. The
//! variants follow the recoverability classes callers care about: absent
//! records, create conflicts, store failures, pool exhaustion and terminal
//! watch outcomes.

use std::time::Duration;

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, StateError>;

/// Error taxonomy for ledger, visibility, index and assignment operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StateError {
    #[error("Player request not found: {id}")]
    NotFound { id: String },

    #[error("Player request already exists: {id}")]
    AlreadyExists { id: String },

    #[error("Duplicate matchmaking request: {id}")]
    DuplicateRequest { id: String },

    #[error("State storage error during {operation}: {message}")]
    Store { operation: String, message: String },

    #[error("Connection pool exhausted after waiting {waited:?}")]
    PoolExhausted { waited: Duration },

    #[error("No assignment for {id} after {waited:?}")]
    TimedOut { id: String, waited: Duration },

    #[error("Assignment watch cancelled for {id}")]
    Cancelled { id: String },

    #[error("Unknown ignore list: {name}")]
    UnknownIgnoreList { name: String },

    #[error("Invalid properties for {id}: {reason}")]
    InvalidProperties { id: String, reason: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl StateError {
    /// Build a store error for the given operation
    pub fn store(operation: impl Into<String>, message: impl ToString) -> Self {
        StateError::Store {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StateError::Store { .. } | StateError::PoolExhausted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StateError::store("HGET", "connection reset").is_transient());
        assert!(StateError::PoolExhausted {
            waited: Duration::from_millis(50)
        }
        .is_transient());
        assert!(!StateError::NotFound { id: "p1".into() }.is_transient());
        assert!(!StateError::Cancelled { id: "p1".into() }.is_transient());
    }

    #[test]
    fn test_error_messages_carry_context() {
        let err = StateError::store("ZADD", "WRONGTYPE");
        assert_eq!(
            err.to_string(),
            "State storage error during ZADD: WRONGTYPE"
        );
    }
}

//! State machine error types

use thiserror::Error;

use crate::store::StoreError;

/// Errors raised while processing a single entity.
///
/// None of these are retried by the engine: an invalid transition is a logic defect
/// and aborts the entity's pass; a store failure releases the lease.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Invalid state transition for {entity_id}: {from} -> {to}")]
    InvalidTransition {
        entity_id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Raised when a persisted state code does not map to a declared state
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Unknown state code: {0}")]
pub struct UnknownStateCode(pub i32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = EngineError::InvalidTransition {
            entity_id: "tp-1".to_string(),
            from: "INITIAL",
            to: "REQUESTED",
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition for tp-1: INITIAL -> REQUESTED"
        );
        assert_eq!(UnknownStateCode(7).to_string(), "Unknown state code: 7");
    }
}

//! Transfer Process Error Types

use thiserror::Error;

use crate::statemachine::EngineError;
use crate::store::StoreError;

/// Errors returned by transfer process commands
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferProcessError {
    #[error("Transfer process not found: {0}")]
    NotFound(String),

    /// The process is leased by a worker or another command; nothing was changed
    #[error("Transfer process is being processed: {0}")]
    Conflict(String),

    #[error("Transfer process {id} cannot be {action} in state {state}")]
    InvalidState {
        id: String,
        action: &'static str,
        state: &'static str,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl TransferProcessError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            TransferProcessError::NotFound(_) => "NOT_FOUND",
            TransferProcessError::Conflict(_) => "CONFLICT",
            TransferProcessError::InvalidState { .. } => "INVALID_STATE",
            TransferProcessError::InvalidRequest(_) => "INVALID_REQUEST",
            TransferProcessError::DatabaseError(_) => "DATABASE_ERROR",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            TransferProcessError::NotFound(_) => 404,
            TransferProcessError::Conflict(_) | TransferProcessError::InvalidState { .. } => 409,
            TransferProcessError::InvalidRequest(_) => 400,
            TransferProcessError::DatabaseError(_) => 500,
        }
    }
}

impl From<StoreError> for TransferProcessError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => TransferProcessError::NotFound(id),
            StoreError::AlreadyLeased(id) | StoreError::NotLeased(id) => {
                TransferProcessError::Conflict(id)
            }
            StoreError::AlreadyExists(id) => {
                TransferProcessError::InvalidRequest(format!("duplicate id {id}"))
            }
            other => TransferProcessError::DatabaseError(other.to_string()),
        }
    }
}

impl From<EngineError> for TransferProcessError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::InvalidTransition {
                entity_id, from, ..
            } => TransferProcessError::InvalidState {
                id: entity_id,
                action: "transitioned",
                state: from,
            },
            EngineError::Store(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(TransferProcessError::NotFound("tp".into()).code(), "NOT_FOUND");
        assert_eq!(TransferProcessError::Conflict("tp".into()).http_status(), 409);
    }

    #[test]
    fn test_store_contention_is_conflict() {
        let err: TransferProcessError = StoreError::AlreadyLeased("tp-1".into()).into();
        assert_eq!(err, TransferProcessError::Conflict("tp-1".into()));
    }

    #[test]
    fn test_display() {
        let err = TransferProcessError::InvalidState {
            id: "tp-1".into(),
            action: "completed",
            state: "REQUESTED",
        };
        assert_eq!(
            err.to_string(),
            "Transfer process tp-1 cannot be completed in state REQUESTED"
        );
    }
}

//! Data Plane Error Types

use thiserror::Error;

use crate::spi::ServiceFailure;
use crate::statemachine::EngineError;
use crate::store::StoreError;

/// Errors returned by data flow commands
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataPlaneError {
    #[error("Data flow not found: {0}")]
    NotFound(String),

    #[error("Data flow is being processed: {0}")]
    Conflict(String),

    #[error("Data flow {id} cannot be {action} in state {state}")]
    InvalidState {
        id: String,
        action: &'static str,
        state: &'static str,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Transfer service failed: {0}")]
    TransferFailed(String),

    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl DataPlaneError {
    pub fn code(&self) -> &'static str {
        match self {
            DataPlaneError::NotFound(_) => "NOT_FOUND",
            DataPlaneError::Conflict(_) => "CONFLICT",
            DataPlaneError::InvalidState { .. } => "INVALID_STATE",
            DataPlaneError::InvalidRequest(_) => "INVALID_REQUEST",
            DataPlaneError::TransferFailed(_) => "TRANSFER_FAILED",
            DataPlaneError::DatabaseError(_) => "DATABASE_ERROR",
        }
    }

    /// Whether the caller may try again later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DataPlaneError::Conflict(_)
                | DataPlaneError::TransferFailed(_)
                | DataPlaneError::DatabaseError(_)
        )
    }
}

impl From<StoreError> for DataPlaneError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => DataPlaneError::NotFound(id),
            StoreError::AlreadyLeased(id) | StoreError::NotLeased(id) => {
                DataPlaneError::Conflict(id)
            }
            StoreError::AlreadyExists(id) => DataPlaneError::Conflict(id),
            other => DataPlaneError::DatabaseError(other.to_string()),
        }
    }
}

impl From<EngineError> for DataPlaneError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::InvalidTransition {
                entity_id, from, ..
            } => DataPlaneError::InvalidState {
                id: entity_id,
                action: "transitioned",
                state: from,
            },
            EngineError::Store(e) => e.into(),
        }
    }
}

impl From<DataPlaneError> for ServiceFailure {
    fn from(e: DataPlaneError) -> Self {
        if e.is_retryable() {
            ServiceFailure::retry(e.to_string())
        } else {
            ServiceFailure::fatal(e.to_string())
        }
    }
}

//! Data Flow State Definitions
//!
//! ```text
//! PROVISIONING → PROVISION_REQUESTED → PROVISION_NOTIFYING → PROVISIONED
//!                                                               │ start
//! RECEIVED ←────────────────────────────────────────────────────┘
//!    └→ STARTED → COMPLETED → NOTIFIED / DEPROVISIONING → DEPROVISIONED
//!          └→ FAILED → NOTIFIED
//!          └→ SUSPENDED → RECEIVED
//! ```

crate::entity_states! {
    /// Data flow states
    ///
    /// Final states: TERMINATED (250), NOTIFIED (400), DEPROVISIONED (600)
    pub enum DataFlowState {
        Provisioning = 25 => "PROVISIONING",
        /// Waiting for asynchronous provisioners
        ProvisionRequested = 40 => "PROVISION_REQUESTED",
        /// Control plane to be told that provisioning finished
        ProvisionNotifying = 45 => "PROVISION_NOTIFYING",
        /// Parked until the control plane starts the flow again
        Provisioned = 50 => "PROVISIONED",
        Received = 100 => "RECEIVED",
        Started = 150 => "STARTED",
        Completed = 200 => "COMPLETED",
        Suspended = 225 => "SUSPENDED",
        Terminated = 250 => "TERMINATED",
        Failed = 300 => "FAILED",
        /// Control plane informed about the outcome
        Notified = 400 => "NOTIFIED",
        Deprovisioning = 500 => "DEPROVISIONING",
        DeprovisionRequested = 550 => "DEPROVISION_REQUESTED",
        Deprovisioned = 600 => "DEPROVISIONED",
    }
    final = [Terminated, Notified, Deprovisioned];
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statemachine::EntityState;

    #[test]
    fn test_final_states() {
        assert!(DataFlowState::Notified.is_final());
        assert!(DataFlowState::Terminated.is_final());
        assert!(DataFlowState::Deprovisioned.is_final());
        assert!(!DataFlowState::Failed.is_final());
        assert!(!DataFlowState::Completed.is_final());
    }

    #[test]
    fn test_codes() {
        assert_eq!(DataFlowState::Received.code(), 100);
        assert_eq!(DataFlowState::from_code(45), Some(DataFlowState::ProvisionNotifying));
        assert_eq!(DataFlowState::ProvisionNotifying.to_string(), "PROVISION_NOTIFYING");
    }
}

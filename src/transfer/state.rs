//! Transfer Process State Definitions
//!
//! State codes are spaced so that intermediate states can be added without renumbering
//! stored rows.
//!
//! ```text
//! CONSUMER: INITIAL → PROVISIONING → PROVISIONED → REQUESTING → REQUESTED → STARTED
//! PROVIDER: INITIAL → PROVISIONING → PROVISIONED → STARTING → STARTED
//!
//! STARTED → COMPLETING → COMPLETED → DEPROVISIONING → DEPROVISIONED
//!         → SUSPENDING → SUSPENDED → STARTING (provider) / STARTED (consumer)
//!   any   → TERMINATING → TERMINATED → DEPROVISIONING
//! ```

crate::entity_states! {
    /// Transfer process states
    ///
    /// Final states: COMPLETED (800), TERMINATED (850), DEPROVISIONED (1000)
    pub enum TransferProcessState {
        /// Created, manifest not generated yet
        Initial = 100 => "INITIAL",
        Provisioning = 200 => "PROVISIONING",
        /// Waiting for asynchronous provisioners
        ProvisioningRequested = 250 => "PROVISIONING_REQUESTED",
        Provisioned = 300 => "PROVISIONED",
        /// Consumer only: transfer request to be dispatched
        Requesting = 400 => "REQUESTING",
        /// Consumer only: waiting for the provider's start message
        Requested = 500 => "REQUESTED",
        /// Provider only: data flow to be started
        Starting = 550 => "STARTING",
        Started = 600 => "STARTED",
        Suspending = 650 => "SUSPENDING",
        Suspended = 700 => "SUSPENDED",
        Completing = 750 => "COMPLETING",
        Completed = 800 => "COMPLETED",
        Terminating = 825 => "TERMINATING",
        Terminated = 850 => "TERMINATED",
        Deprovisioning = 900 => "DEPROVISIONING",
        /// Waiting for asynchronous deprovisioners
        DeprovisioningRequested = 950 => "DEPROVISIONING_REQUESTED",
        Deprovisioned = 1000 => "DEPROVISIONED",
    }
    final = [Completed, Terminated, Deprovisioned];
}

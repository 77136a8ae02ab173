//! Transfer Processes
//!
//! Control plane side of a data exchange. A consumer process requests a transfer from
//! the provider; the provider process answers by starting a data flow on its data
//! plane. Both sides keep a persistent process driven by the state machine in
//! [`manager`] and mutated from outside through the commands in [`service`].
//!
//! # Safety Invariants
//!
//! 1. **Lease before mutate**: every mutation holds the store lease of the process.
//! 2. **One step per pass**: a processor performs one side effect and persists.
//! 3. **Explicit give-up**: abnormal terminal states always carry `error_detail`.

pub mod error;
pub mod listener;
pub mod manager;
pub mod process;
pub mod service;
pub mod state;

pub use error::TransferProcessError;
pub use listener::{TransferProcessListener, TransferProcessObservable};
pub use manager::{TransferProcessCollaborators, TransferProcessManager};
pub use process::{CallbackAddress, TransferProcess, TransferProcessType, TransferRequest};
pub use service::TransferProcessService;
pub use state::TransferProcessState;

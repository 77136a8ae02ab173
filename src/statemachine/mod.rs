//! State Machine Engine
//!
//! Generic orchestration of long-lived entities persisted in a [`LeasedStore`]:
//!
//! ```text
//! ┌─────────────────┐  lease batch   ┌────────────────┐  handler   ┌───────────────┐
//! │  StateMachine   │ ─────────────→ │ StateProcessor │ ─────────→ │ entity logic  │
//! │ (1 task / proc) │                │  (per state)   │ ←───────── │ guard + retry │
//! └─────────────────┘                └────────────────┘   entity   └───────────────┘
//!                                           │ save (releases lease)
//!                                           ▼
//!                                    ┌────────────────┐
//!                                    │  LeasedStore   │
//!                                    └────────────────┘
//! ```
//!
//! Mutual exclusion between workers, local or in other runtimes, comes only from the
//! store lease. Failures are classified by [`RetryPolicy`]; invalid transitions are
//! logic errors surfaced as [`EngineError::InvalidTransition`].
//!
//! [`LeasedStore`]: crate::store::LeasedStore

pub mod entity;
pub mod error;
pub mod observable;
pub mod pending;
pub mod processor;
pub mod retry;
pub mod runner;
pub mod wait;

pub use entity::{EntityCore, EntityState, StatefulEntity};
pub use error::{EngineError, UnknownStateCode};
pub use observable::{Observable, TransitionCounter};
pub use pending::{PendingGuard, SharedPendingGuard};
pub use processor::{Handler, Processor, StateProcessor, TransitionHook, handler};
pub use retry::{Outcome, RetryDecision, RetryPolicy};
pub use runner::{StateMachine, StateMachineHandle};
pub use wait::{ExponentialWaitStrategy, WaitStrategy, WaitStrategyFactory};

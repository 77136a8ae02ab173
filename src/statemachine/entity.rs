//! Stateful entity base
//!
//! Every entity driven by the engine embeds an [`EntityCore`] carrying its id, current
//! state and the bookkeeping the runner and retry policy rely on. State enums are
//! declared with [`entity_states!`](crate::entity_states) which also derives the numeric
//! state codes used for storage.
//!
//! # Transition rules
//!
//! - A transition to a *different* state is only legal from the listed source states.
//!   Anything else is a logic defect and yields [`EngineError::InvalidTransition`].
//! - A transition to the *current* state is a retry: `state_count` is incremented.
//! - Every transition stamps `state_timestamp`, clears `error_detail` and `pending`.

use std::fmt;
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::error::EngineError;

/// A named state of an entity type, stored as an integer code
pub trait EntityState:
    Copy
    + Eq
    + Hash
    + fmt::Debug
    + fmt::Display
    + Send
    + Sync
    + Serialize
    + DeserializeOwned
    + 'static
{
    /// Numeric state code used for storage and queries
    fn code(self) -> i32;

    /// Convert from a stored state code
    fn from_code(code: i32) -> Option<Self>;

    /// Human-readable state name
    fn name(self) -> &'static str;

    /// Final states are retained for audit but never processed again
    fn is_final(self) -> bool;
}

/// Declares an entity state enum with its storage codes and final states.
///
/// ```ignore
/// entity_states! {
///     pub enum JobState {
///         Queued = 100 => "QUEUED",
///         Done = 200 => "DONE",
///     }
///     final = [Done];
/// }
/// ```
#[macro_export]
macro_rules! entity_states {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $code:literal => $label:literal ),+ $(,)?
        }
        final = [ $( $final:ident ),+ $(,)? ];
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(into = "i32", try_from = "i32")]
        #[repr(i32)]
        $vis enum $name {
            $( $(#[$vmeta])* $variant = $code ),+
        }

        impl $crate::statemachine::EntityState for $name {
            #[inline]
            fn code(self) -> i32 {
                self as i32
            }

            fn from_code(code: i32) -> Option<Self> {
                match code {
                    $( $code => Some($name::$variant), )+
                    _ => None,
                }
            }

            fn name(self) -> &'static str {
                match self {
                    $( $name::$variant => $label, )+
                }
            }

            #[inline]
            fn is_final(self) -> bool {
                matches!(self, $( $name::$final )|+)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str($crate::statemachine::EntityState::name(*self))
            }
        }

        impl From<$name> for i32 {
            fn from(state: $name) -> i32 {
                state as i32
            }
        }

        impl TryFrom<i32> for $name {
            type Error = $crate::statemachine::UnknownStateCode;

            fn try_from(code: i32) -> Result<Self, Self::Error> {
                <$name as $crate::statemachine::EntityState>::from_code(code)
                    .ok_or($crate::statemachine::UnknownStateCode(code))
            }
        }
    };
}

/// Fields shared by every stateful entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityCore<S> {
    id: String,
    state: S,
    state_count: u32,
    state_timestamp: i64,
    created_at: i64,
    updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_detail: Option<String>,
    #[serde(default)]
    pending: bool,
}

impl<S: EntityState> EntityCore<S> {
    /// Create the core of a new entity in its initial state
    pub fn new(id: impl Into<String>, initial: S, now: i64) -> Self {
        Self {
            id: id.into(),
            state: initial,
            state_count: 0,
            state_timestamp: now,
            created_at: now,
            updated_at: now,
            error_detail: None,
            pending: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> S {
        self.state
    }

    pub fn state_count(&self) -> u32 {
        self.state_count
    }

    pub fn state_timestamp(&self) -> i64 {
        self.state_timestamp
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn updated_at(&self) -> i64 {
        self.updated_at
    }

    pub fn error_detail(&self) -> Option<&str> {
        self.error_detail.as_deref()
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Check whether `target` is reachable from the current state
    pub fn can_transition(&self, target: S, allowed_from: &[S]) -> bool {
        self.state == target || allowed_from.contains(&self.state)
    }

    /// Guarded transition to `target`.
    pub fn transition(
        &mut self,
        target: S,
        allowed_from: &[S],
        now: i64,
    ) -> Result<(), EngineError> {
        if self.state == target {
            self.state_count += 1;
        } else if allowed_from.contains(&self.state) {
            self.state = target;
            self.state_count = 0;
        } else {
            return Err(EngineError::InvalidTransition {
                entity_id: self.id.clone(),
                from: self.state.name(),
                to: target.name(),
            });
        }

        self.state_timestamp = now;
        self.error_detail = None;
        self.pending = false;
        Ok(())
    }

    /// Re-enter the current state after a retryable failure
    pub fn retry(&mut self, reason: impl Into<String>, now: i64) {
        self.state_count += 1;
        self.state_timestamp = now;
        self.pending = false;
        self.error_detail = Some(reason.into());
    }

    pub fn set_error_detail(&mut self, detail: impl Into<String>) {
        self.error_detail = Some(detail.into());
    }

    pub fn set_pending(&mut self, pending: bool) {
        self.pending = pending;
    }

    /// Stamp a persisted mutation (called by stores on save)
    pub fn touch(&mut self, now: i64) {
        self.updated_at = now;
    }
}

/// An entity the state machine engine can lease, process and persist
pub trait StatefulEntity:
    Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    type State: EntityState;

    /// Collection name used by persistent stores
    const KIND: &'static str;

    fn core(&self) -> &EntityCore<Self::State>;

    fn core_mut(&mut self) -> &mut EntityCore<Self::State>;

    /// Type discriminator usable in store queries (e.g. CONSUMER / PROVIDER)
    fn discriminator(&self) -> Option<&str> {
        None
    }

    /// Owning runtime, if the entity type tracks one
    fn owner(&self) -> Option<&str> {
        None
    }

    fn id(&self) -> &str {
        self.core().id()
    }

    fn state(&self) -> Self::State {
        self.core().state()
    }

    fn state_count(&self) -> u32 {
        self.core().state_count()
    }

    fn state_timestamp(&self) -> i64 {
        self.core().state_timestamp()
    }

    fn updated_at(&self) -> i64 {
        self.core().updated_at()
    }

    fn error_detail(&self) -> Option<&str> {
        self.core().error_detail()
    }

    fn is_pending(&self) -> bool {
        self.core().is_pending()
    }
}

use std::sync::Arc;

use super::entity::StatefulEntity;

/// Parks entities awaiting an out-of-band event
///
/// A matching entity is saved with `pending = true` instead of being processed, and is
/// excluded from polling until a command transitions it.
pub trait PendingGuard<E>: Send + Sync {
    fn is_pending(&self, entity: &E) -> bool;
}

impl<E, F> PendingGuard<E> for F
where
    E: StatefulEntity,
    F: Fn(&E) -> bool + Send + Sync,
{
    fn is_pending(&self, entity: &E) -> bool {
        self(entity)
    }
}

pub type SharedPendingGuard<E> = Arc<dyn PendingGuard<E>>;

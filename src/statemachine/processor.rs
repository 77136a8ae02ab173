//! Per-state processors
//!
//! A [`StateProcessor`] owns one scheduling concern: the entities matching its criteria
//! (usually a single state). Every poll it leases a batch, runs its handler on each
//! entity concurrently and persists each result on its own.
//!
//! ```text
//! next_not_leased(batch) ─┬─ not due yet (retry delay) ──→ break_lease
//!                         ├─ pending guard matches ─────→ pending = true, save
//!                         └─ handler(entity)
//!                              ├─ Ok(entity) ──────────────→ save, on_saved hook
//!                              ├─ Err(InvalidTransition) ──→ error!, stored entity parked
//!                              ├─ Err(other) ──────────────→ warn!, break_lease
//!                              └─ panic ───────────────────→ error!, stored entity parked
//! ```
//!
//! A parked entity is saved with `pending = true` and the defect as error detail, so it
//! is not polled again until a command moves it on.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use tracing::{debug, error, warn};

use super::entity::StatefulEntity;
use super::error::EngineError;
use super::pending::SharedPendingGuard;
use super::retry::RetryPolicy;
use crate::clock::{Clock, SystemClock};
use crate::store::{Criteria, LeasedStore};

/// Asynchronous per-entity handler; returns the entity to persist
pub type Handler<E> = Arc<dyn Fn(E) -> BoxFuture<'static, Result<E, EngineError>> + Send + Sync>;

/// Called after a handler result was persisted, with the state the entity had before
pub type TransitionHook<E> = Arc<dyn Fn(&E, <E as StatefulEntity>::State) + Send + Sync>;

/// One schedulable unit of a state machine
#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;

    /// Run one poll; returns the number of entities that were worked on
    async fn process(&self) -> usize;
}

pub struct StateProcessor<E: StatefulEntity> {
    name: String,
    store: Arc<dyn LeasedStore<E>>,
    criteria: Criteria,
    handler: Handler<E>,
    batch_size: usize,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    pending_guard: Option<SharedPendingGuard<E>>,
    on_saved: Option<TransitionHook<E>>,
}

impl<E: StatefulEntity> StateProcessor<E> {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn LeasedStore<E>>,
        criteria: Criteria,
        handler: Handler<E>,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            criteria,
            handler,
            batch_size: 20,
            retry: RetryPolicy::immediate(u32::MAX),
            clock: Arc::new(SystemClock),
            pending_guard: None,
            on_saved: None,
        }
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Entities retried in place are deferred until their retry delay elapsed
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn pending_guard(mut self, guard: Option<SharedPendingGuard<E>>) -> Self {
        self.pending_guard = guard;
        self
    }

    pub fn on_saved(mut self, hook: TransitionHook<E>) -> Self {
        self.on_saved = Some(hook);
        self
    }

    async fn process_one(&self, entity: E, now: i64) -> bool {
        let id = entity.id().to_string();

        if !self
            .retry
            .is_due(entity.state_count(), entity.state_timestamp(), now)
        {
            self.release(&id).await;
            return false;
        }

        if let Some(guard) = &self.pending_guard
            && guard.is_pending(&entity)
        {
            debug!(processor = %self.name, entity_id = %id, "Entity parked as pending");
            let mut parked = entity;
            parked.core_mut().set_pending(true);
            let previous = parked.state();
            self.persist(parked, previous).await;
            return true;
        }

        let previous = entity.state();
        match AssertUnwindSafe((self.handler)(entity)).catch_unwind().await {
            Ok(Ok(updated)) => self.persist(updated, previous).await,
            Ok(Err(e @ EngineError::InvalidTransition { .. })) => {
                error!(
                    processor = %self.name,
                    entity_id = %id,
                    error = %e,
                    "Invalid transition, entity parked"
                );
                self.park_defective(&id, e.to_string()).await;
            }
            Ok(Err(e)) => {
                warn!(processor = %self.name, entity_id = %id, error = %e, "Handler failed");
                self.release(&id).await;
            }
            Err(_) => {
                error!(processor = %self.name, entity_id = %id, "Handler panicked, entity parked");
                self.park_defective(&id, format!("{} handler panicked", self.name)).await;
            }
        }
        true
    }

    async fn persist(&self, entity: E, previous: E::State) {
        match self.store.save(&entity).await {
            Ok(()) => {
                debug!(
                    processor = %self.name,
                    entity_id = %entity.id(),
                    from = %previous,
                    to = %entity.state(),
                    state_count = entity.state_count(),
                    "Entity saved"
                );
                if let Some(hook) = &self.on_saved {
                    hook(&entity, previous);
                }
            }
            Err(e) if e.is_contention() => {
                warn!(
                    processor = %self.name,
                    entity_id = %entity.id(),
                    error = %e,
                    "Lease lost before save, result discarded"
                );
            }
            Err(e) => {
                error!(
                    processor = %self.name,
                    entity_id = %entity.id(),
                    error = %e,
                    "Failed to save entity"
                );
            }
        }
    }

    /// Save the stored (pre-handler) version of a still leased entity as pending
    async fn park_defective(&self, id: &str, detail: String) {
        let mut parked = match self.store.find_by_id(id).await {
            Ok(Some(entity)) => entity,
            Ok(None) => return,
            Err(e) => {
                error!(processor = %self.name, entity_id = %id, error = %e, "Failed to load entity");
                self.release(id).await;
                return;
            }
        };
        parked.core_mut().set_pending(true);
        parked.core_mut().set_error_detail(detail);
        let previous = parked.state();
        self.persist(parked, previous).await;
    }

    async fn release(&self, id: &str) {
        if let Err(e) = self.store.break_lease(id).await {
            warn!(processor = %self.name, entity_id = %id, error = %e, "Failed to break lease");
        }
    }
}

#[async_trait]
impl<E: StatefulEntity> Processor for StateProcessor<E> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self) -> usize {
        let entities = match self
            .store
            .next_not_leased(self.batch_size, &self.criteria)
            .await
        {
            Ok(entities) => entities,
            Err(e) => {
                error!(processor = %self.name, error = %e, "Failed to lease entities");
                return 0;
            }
        };
        if entities.is_empty() {
            return 0;
        }

        let now = self.clock.now_millis();
        join_all(entities.into_iter().map(|e| self.process_one(e, now)))
            .await
            .into_iter()
            .filter(|worked| *worked)
            .count()
    }
}

/// Build a [`Handler`] from an async closure-producing function
pub fn handler<E, F, Fut>(f: F) -> Handler<E>
where
    E: StatefulEntity,
    F: Fn(E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<E, EngineError>> + Send + 'static,
{
    Arc::new(move |entity| f(entity).boxed())
}

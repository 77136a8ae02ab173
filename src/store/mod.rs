//! Leased Entity Store
//!
//! Persistence contract of the state machine engine. Mutual exclusion between workers,
//! in this runtime or any other runtime sharing the store, comes entirely from the
//! lease recorded next to each entity.
//!
//! # Lease rules
//!
//! 1. `next_not_leased` and `find_by_id_and_lease` only hand out entities without an
//!    unexpired lease, and lease them to this store's lessor atomically.
//! 2. `save` is only accepted from the current lease holder and releases the lease.
//! 3. An expired lease can be taken over; the previous holder's late `save` is then
//!    rejected with [`StoreError::AlreadyLeased`].

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::statemachine::{EntityState, StatefulEntity};

/// Store error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Entity already leased: {0}")]
    AlreadyLeased(String),

    #[error("Entity not leased by this runtime: {0}")]
    NotLeased(String),

    #[error("Entity already exists: {0}")]
    AlreadyExists(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Contention is not an entity failure: the operation is simply skipped
    pub fn is_contention(&self) -> bool {
        matches!(self, StoreError::AlreadyLeased(_) | StoreError::NotLeased(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Ownership filter on [`StatefulEntity::owner`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerFilter {
    Is(String),
    /// Owned by anyone else, including nobody
    IsNot(String),
}

/// Predicate of a store query
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Criteria {
    /// State codes to match; empty matches every state
    pub states: Vec<i32>,
    pub discriminator: Option<String>,
    pub owner: Option<OwnerFilter>,
    /// Only entities whose `updated_at` is strictly older
    pub updated_before: Option<i64>,
    /// Pending entities are excluded unless set
    pub include_pending: bool,
}

impl Criteria {
    pub fn in_states<S: EntityState>(states: &[S]) -> Self {
        Self {
            states: states.iter().map(|s| s.code()).collect(),
            ..Self::default()
        }
    }

    pub fn with_discriminator(mut self, discriminator: impl Into<String>) -> Self {
        self.discriminator = Some(discriminator.into());
        self
    }

    pub fn with_owner(mut self, owner: OwnerFilter) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn updated_before(mut self, millis: i64) -> Self {
        self.updated_before = Some(millis);
        self
    }

    pub fn including_pending(mut self) -> Self {
        self.include_pending = true;
        self
    }

    /// Evaluate the predicate in memory
    pub fn matches<E: StatefulEntity>(&self, entity: &E) -> bool {
        if !self.states.is_empty() && !self.states.contains(&entity.state().code()) {
            return false;
        }
        if !self.include_pending && entity.is_pending() {
            return false;
        }
        if let Some(discriminator) = &self.discriminator
            && entity.discriminator() != Some(discriminator.as_str())
        {
            return false;
        }
        match &self.owner {
            Some(OwnerFilter::Is(owner)) if entity.owner() != Some(owner.as_str()) => {
                return false;
            }
            Some(OwnerFilter::IsNot(owner)) if entity.owner() == Some(owner.as_str()) => {
                return false;
            }
            _ => {}
        }
        if let Some(before) = self.updated_before
            && entity.updated_at() >= before
        {
            return false;
        }
        true
    }
}

/// Persistence contract required by the state machine engine
#[async_trait]
pub trait LeasedStore<E: StatefulEntity>: Send + Sync {
    /// Identity recorded as lease holder
    fn lessor(&self) -> &str;

    /// Insert a new, unleased entity
    async fn create(&self, entity: &E) -> Result<(), StoreError>;

    /// Read without leasing
    async fn find_by_id(&self, id: &str) -> Result<Option<E>, StoreError>;

    /// Read without leasing; pending entities included unless the criteria exclude them
    async fn query(&self, criteria: &Criteria, limit: usize) -> Result<Vec<E>, StoreError>;

    /// Atomically lease up to `limit` unleased entities matching `criteria`, oldest
    /// `state_timestamp` first
    async fn next_not_leased(&self, limit: usize, criteria: &Criteria)
    -> Result<Vec<E>, StoreError>;

    /// Lease a single entity; fails with `AlreadyLeased` while any lease is active
    async fn find_by_id_and_lease(&self, id: &str) -> Result<E, StoreError>;

    /// Persist the entity, stamp `updated_at`, and release the lease
    async fn save(&self, entity: &E) -> Result<(), StoreError>;

    /// Release this lessor's lease without writing
    async fn break_lease(&self, id: &str) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statemachine::entity::tests::JobState;
    use crate::testing::Job;

    #[test]
    fn test_criteria_state_and_pending() {
        let mut job = Job::new("job-1", JobState::Queued, 100);
        let criteria = Criteria::in_states(&[JobState::Queued]);
        assert!(criteria.matches(&job));
        assert!(!Criteria::in_states(&[JobState::Running]).matches(&job));

        job.core.set_pending(true);
        assert!(!criteria.matches(&job));
        assert!(criteria.clone().including_pending().matches(&job));
    }

    #[test]
    fn test_criteria_owner_and_staleness() {
        let mut job = Job::new("job-1", JobState::Running, 100);
        job.owner = Some("runtime-a".to_string());

        let not_mine = Criteria::in_states(&[JobState::Running])
            .with_owner(OwnerFilter::IsNot("runtime-b".to_string()));
        assert!(not_mine.matches(&job));

        let mine = Criteria::default().with_owner(OwnerFilter::Is("runtime-b".to_string()));
        assert!(!mine.matches(&job));

        assert!(Criteria::default().updated_before(101).matches(&job));
        assert!(!Criteria::default().updated_before(100).matches(&job));
    }

    #[test]
    fn test_contention_classification() {
        assert!(StoreError::AlreadyLeased("x".into()).is_contention());
        assert!(!StoreError::NotFound("x".into()).is_contention());
    }
}

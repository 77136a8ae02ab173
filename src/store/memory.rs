//! In-memory leased store
//!
//! Single-process implementation of [`LeasedStore`]. Several handles created with
//! [`InMemoryStore::for_lessor`] share one table, which is how tests simulate multiple
//! runtime instances working against the same database.
//!
//! ## Limitations
//!
//! - **No persistence**: all state is lost when the process exits
//! - **Coarse locking**: one mutex guards the whole table

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{Criteria, LeasedStore, StoreError};
use crate::clock::Clock;
use crate::statemachine::StatefulEntity;

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    expires_at: i64,
}

#[derive(Debug, Clone)]
struct Record<E> {
    entity: E,
    lease: Option<Lease>,
}

impl<E> Record<E> {
    fn is_leased(&self, now: i64) -> bool {
        self.lease.as_ref().is_some_and(|l| l.expires_at > now)
    }
}

type Table<E> = BTreeMap<String, Record<E>>;

/// In-memory store shared by every handle cloned from it
pub struct InMemoryStore<E> {
    table: Arc<Mutex<Table<E>>>,
    lessor: String,
    lease_duration: Duration,
    clock: Arc<dyn Clock>,
}

fn poison_err<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Database("store lock poisoned".to_string())
}

impl<E: StatefulEntity> InMemoryStore<E> {
    pub fn new(lessor: impl Into<String>, lease_duration: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            table: Arc::new(Mutex::new(BTreeMap::new())),
            lessor: lessor.into(),
            lease_duration,
            clock,
        }
    }

    /// Handle on the same table leasing under another runtime identity
    pub fn for_lessor(&self, lessor: impl Into<String>) -> Self {
        Self {
            table: Arc::clone(&self.table),
            lessor: lessor.into(),
            lease_duration: self.lease_duration,
            clock: Arc::clone(&self.clock),
        }
    }

    /// Current lease holder of an entity, if the lease is active
    pub fn lease_holder(&self, id: &str) -> Option<String> {
        let now = self.clock.now_millis();
        let table = self.table.lock().ok()?;
        table
            .get(id)
            .filter(|record| record.is_leased(now))
            .and_then(|record| record.lease.as_ref().map(|l| l.holder.clone()))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Table<E>>, StoreError> {
        self.table.lock().map_err(poison_err)
    }

    fn new_lease(&self, now: i64) -> Lease {
        Lease {
            holder: self.lessor.clone(),
            expires_at: now.saturating_add(self.lease_duration.as_millis() as i64),
        }
    }
}

#[async_trait]
impl<E: StatefulEntity> LeasedStore<E> for InMemoryStore<E> {
    fn lessor(&self) -> &str {
        &self.lessor
    }

    async fn create(&self, entity: &E) -> Result<(), StoreError> {
        let mut table = self.lock()?;
        if table.contains_key(entity.id()) {
            return Err(StoreError::AlreadyExists(entity.id().to_string()));
        }
        table.insert(
            entity.id().to_string(),
            Record {
                entity: entity.clone(),
                lease: None,
            },
        );
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<E>, StoreError> {
        Ok(self.lock()?.get(id).map(|record| record.entity.clone()))
    }

    async fn query(&self, criteria: &Criteria, limit: usize) -> Result<Vec<E>, StoreError> {
        Ok(self
            .lock()?
            .values()
            .filter(|record| criteria.matches(&record.entity))
            .take(limit)
            .map(|record| record.entity.clone())
            .collect())
    }

    async fn next_not_leased(
        &self,
        limit: usize,
        criteria: &Criteria,
    ) -> Result<Vec<E>, StoreError> {
        let now = self.clock.now_millis();
        let mut table = self.lock()?;

        let mut candidates: Vec<(i64, String)> = table
            .values()
            .filter(|record| !record.is_leased(now) && criteria.matches(&record.entity))
            .map(|record| (record.entity.state_timestamp(), record.entity.id().to_string()))
            .collect();
        candidates.sort();
        candidates.truncate(limit);

        let mut leased = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(record) = table.get_mut(&id) {
                record.lease = Some(self.new_lease(now));
                leased.push(record.entity.clone());
            }
        }
        Ok(leased)
    }

    async fn find_by_id_and_lease(&self, id: &str) -> Result<E, StoreError> {
        let now = self.clock.now_millis();
        let lease = self.new_lease(now);
        let mut table = self.lock()?;
        let record = table
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if record.is_leased(now) {
            return Err(StoreError::AlreadyLeased(id.to_string()));
        }
        record.lease = Some(lease);
        Ok(record.entity.clone())
    }

    async fn save(&self, entity: &E) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        let mut table = self.lock()?;
        let record = table
            .get_mut(entity.id())
            .ok_or_else(|| StoreError::NotFound(entity.id().to_string()))?;

        match &record.lease {
            Some(lease) if lease.holder == self.lessor => {}
            Some(_) => return Err(StoreError::AlreadyLeased(entity.id().to_string())),
            None => return Err(StoreError::NotLeased(entity.id().to_string())),
        }

        let mut updated = entity.clone();
        updated.core_mut().touch(now);
        record.entity = updated;
        record.lease = None;
        Ok(())
    }

    async fn break_lease(&self, id: &str) -> Result<(), StoreError> {
        let mut table = self.lock()?;
        if let Some(record) = table.get_mut(id)
            && record.lease.as_ref().is_some_and(|l| l.holder == self.lessor)
        {
            record.lease = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::statemachine::entity::tests::JobState;
    use crate::testing::Job;

    fn store(clock: &Arc<ManualClock>) -> InMemoryStore<Job> {
        InMemoryStore::new("runtime-a", Duration::from_secs(60), clock.clone())
    }

    async fn seed(store: &InMemoryStore<Job>, ids: &[(&str, i64)]) {
        for (id, ts) in ids {
            store
                .create(&Job::new(id, JobState::Queued, *ts))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_next_not_leased_is_fifo_and_exclusive() {
        let clock = Arc::new(ManualClock::default());
        let store = store(&clock);
        seed(&store, &[("c", 3), ("a", 1), ("b", 2)]).await;

        let criteria = Criteria::in_states(&[JobState::Queued]);
        let first = store.next_not_leased(2, &criteria).await.unwrap();
        let ids: Vec<_> = first.iter().map(|j| j.id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let other = store.for_lessor("runtime-b");
        let second = other.next_not_leased(10, &criteria).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id(), "c");

        assert!(other.next_not_leased(10, &criteria).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_by_id_and_lease_conflicts() {
        let clock = Arc::new(ManualClock::default());
        let store = store(&clock);
        seed(&store, &[("a", 1)]).await;

        store.find_by_id_and_lease("a").await.unwrap();
        assert_eq!(
            store.find_by_id_and_lease("a").await.unwrap_err(),
            StoreError::AlreadyLeased("a".to_string())
        );
        assert_eq!(
            store.find_by_id_and_lease("missing").await.unwrap_err(),
            StoreError::NotFound("missing".to_string())
        );
    }

    #[tokio::test]
    async fn test_save_releases_lease_and_stamps_updated_at() {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = store(&clock);
        seed(&store, &[("a", 1)]).await;

        let mut job = store.find_by_id_and_lease("a").await.unwrap();
        clock.advance(Duration::from_millis(500));
        job.core
            .transition(JobState::Running, &[JobState::Queued], clock.now_millis())
            .unwrap();
        store.save(&job).await.unwrap();

        let stored = store.find_by_id("a").await.unwrap().unwrap();
        assert_eq!(stored.state(), JobState::Running);
        assert_eq!(stored.updated_at(), 1_500);
        assert_eq!(store.lease_holder("a"), None);

        // A second save without a lease is rejected
        assert_eq!(
            store.save(&job).await.unwrap_err(),
            StoreError::NotLeased("a".to_string())
        );
    }

    #[tokio::test]
    async fn test_expired_lease_taken_over_rejects_stale_save() {
        let clock = Arc::new(ManualClock::default());
        let store_a = store(&clock);
        let store_b = store_a.for_lessor("runtime-b");
        seed(&store_a, &[("a", 1)]).await;

        let job = store_a.find_by_id_and_lease("a").await.unwrap();
        assert!(store_b.find_by_id_and_lease("a").await.is_err());

        clock.advance(Duration::from_secs(61));
        let taken = store_b.find_by_id_and_lease("a").await.unwrap();
        assert_eq!(store_a.lease_holder("a"), Some("runtime-b".to_string()));

        assert_eq!(
            store_a.save(&job).await.unwrap_err(),
            StoreError::AlreadyLeased("a".to_string())
        );
        store_b.save(&taken).await.unwrap();
    }

    #[tokio::test]
    async fn test_break_lease_only_for_holder() {
        let clock = Arc::new(ManualClock::default());
        let store_a = store(&clock);
        let store_b = store_a.for_lessor("runtime-b");
        seed(&store_a, &[("a", 1)]).await;

        store_a.find_by_id_and_lease("a").await.unwrap();
        store_b.break_lease("a").await.unwrap();
        assert_eq!(store_a.lease_holder("a"), Some("runtime-a".to_string()));

        store_a.break_lease("a").await.unwrap();
        assert_eq!(store_a.lease_holder("a"), None);
    }

    #[tokio::test]
    async fn test_create_duplicate() {
        let clock = Arc::new(ManualClock::default());
        let store = store(&clock);
        seed(&store, &[("a", 1)]).await;
        assert_eq!(
            store
                .create(&Job::new("a", JobState::Queued, 1))
                .await
                .unwrap_err(),
            StoreError::AlreadyExists("a".to_string())
        );
    }
}

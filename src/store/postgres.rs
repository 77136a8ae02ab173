//! PostgreSQL leased store
//!
//! One table per entity kind. The entity itself is stored as JSON in `body`; the
//! columns next to it exist only so the lease queries can filter without decoding.
//! All lease operations are single conditional statements (CAS on the lease columns).
//!
//! ```text
//! id | state | state_count | state_timestamp | updated_at | pending | discriminator
//!    | owner | body | lease_holder | lease_expires_at
//! ```

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use super::{Criteria, LeasedStore, OwnerFilter, StoreError};
use crate::clock::Clock;
use crate::statemachine::{EntityState, StatefulEntity};

/// PostgreSQL implementation of [`LeasedStore`]
pub struct PgStore<E> {
    pool: PgPool,
    table: String,
    lessor: String,
    lease_duration: Duration,
    clock: Arc<dyn Clock>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: StatefulEntity> PgStore<E> {
    /// Create a store on `E::KIND`'s table
    pub fn new(
        pool: PgPool,
        lessor: impl Into<String>,
        lease_duration: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pool,
            table: E::KIND.to_string(),
            lessor: lessor.into(),
            lease_duration,
            clock,
            _entity: PhantomData,
        }
    }

    /// Create the entity table and its polling index if missing
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id               TEXT PRIMARY KEY,
                state            INTEGER NOT NULL,
                state_count      INTEGER NOT NULL DEFAULT 0,
                state_timestamp  BIGINT  NOT NULL,
                updated_at       BIGINT  NOT NULL,
                pending          BOOLEAN NOT NULL DEFAULT FALSE,
                discriminator    TEXT,
                owner            TEXT,
                body             TEXT    NOT NULL,
                lease_holder     TEXT,
                lease_expires_at BIGINT
            )
            "#,
            table = self.table
        );
        sqlx::query(&ddl).execute(&self.pool).await?;

        let index = format!(
            "CREATE INDEX IF NOT EXISTS {table}_state_idx ON {table} (state, state_timestamp)",
            table = self.table
        );
        sqlx::query(&index).execute(&self.pool).await?;
        Ok(())
    }

    fn lease_expiry(&self, now: i64) -> i64 {
        now.saturating_add(self.lease_duration.as_millis() as i64)
    }

    fn decode(body: &str) -> Result<E, StoreError> {
        Ok(serde_json::from_str(body)?)
    }

    fn decode_rows(rows: &[sqlx::postgres::PgRow]) -> Result<Vec<E>, StoreError> {
        rows.iter()
            .map(|row| Self::decode(&row.try_get::<String, _>("body")?))
            .collect()
    }

    /// Shared WHERE clause of the criteria queries; binds start at `$first`
    fn criteria_clause(first: usize) -> String {
        format!(
            r#"
                (cardinality(${s}::INTEGER[]) = 0 OR state = ANY(${s}))
                AND (${p}::BOOLEAN OR pending = FALSE)
                AND (${d}::TEXT IS NULL OR discriminator = ${d})
                AND (${oi}::TEXT IS NULL OR owner = ${oi})
                AND (${on}::TEXT IS NULL OR owner IS DISTINCT FROM ${on})
                AND (${u}::BIGINT IS NULL OR updated_at < ${u})
            "#,
            s = first,
            p = first + 1,
            d = first + 2,
            oi = first + 3,
            on = first + 4,
            u = first + 5,
        )
    }
}

fn owner_binds(criteria: &Criteria) -> (Option<String>, Option<String>) {
    match &criteria.owner {
        Some(OwnerFilter::Is(owner)) => (Some(owner.clone()), None),
        Some(OwnerFilter::IsNot(owner)) => (None, Some(owner.clone())),
        None => (None, None),
    }
}

#[async_trait]
impl<E: StatefulEntity> LeasedStore<E> for PgStore<E> {
    fn lessor(&self) -> &str {
        &self.lessor
    }

    async fn create(&self, entity: &E) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            INSERT INTO {table}
                (id, state, state_count, state_timestamp, updated_at, pending,
                 discriminator, owner, body)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO NOTHING
            "#,
            table = self.table
        );
        let result = sqlx::query(&sql)
            .bind(entity.id())
            .bind(entity.state().code())
            .bind(entity.state_count() as i32)
            .bind(entity.state_timestamp())
            .bind(entity.updated_at())
            .bind(entity.is_pending())
            .bind(entity.discriminator())
            .bind(entity.owner())
            .bind(serde_json::to_string(entity)?)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(entity.id().to_string()));
        }
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<E>, StoreError> {
        let sql = format!("SELECT body FROM {table} WHERE id = $1", table = self.table);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(Self::decode(&row.try_get::<String, _>("body")?)?)),
            None => Ok(None),
        }
    }

    async fn query(&self, criteria: &Criteria, limit: usize) -> Result<Vec<E>, StoreError> {
        let (owner_is, owner_is_not) = owner_binds(criteria);
        let sql = format!(
            "SELECT body FROM {table} WHERE {clause} ORDER BY state_timestamp, id LIMIT $7",
            table = self.table,
            clause = Self::criteria_clause(1)
        );
        let rows = sqlx::query(&sql)
            .bind(criteria.states.as_slice())
            .bind(criteria.include_pending)
            .bind(criteria.discriminator.as_deref())
            .bind(owner_is)
            .bind(owner_is_not)
            .bind(criteria.updated_before)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Self::decode_rows(&rows)
    }

    async fn next_not_leased(
        &self,
        limit: usize,
        criteria: &Criteria,
    ) -> Result<Vec<E>, StoreError> {
        let now = self.clock.now_millis();
        let (owner_is, owner_is_not) = owner_binds(criteria);

        // SKIP LOCKED keeps concurrent pollers from blocking on, or double-leasing,
        // the same rows
        let sql = format!(
            r#"
            UPDATE {table} SET lease_holder = $1, lease_expires_at = $2
            WHERE id IN (
                SELECT id FROM {table}
                WHERE (lease_holder IS NULL OR lease_expires_at <= $3)
                  AND {clause}
                ORDER BY state_timestamp, id
                LIMIT $10
                FOR UPDATE SKIP LOCKED
            )
            RETURNING body, state_timestamp, id
            "#,
            table = self.table,
            clause = Self::criteria_clause(4)
        );
        let mut rows = sqlx::query(&sql)
            .bind(&self.lessor)
            .bind(self.lease_expiry(now))
            .bind(now)
            .bind(criteria.states.as_slice())
            .bind(criteria.include_pending)
            .bind(criteria.discriminator.as_deref())
            .bind(owner_is)
            .bind(owner_is_not)
            .bind(criteria.updated_before)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        // RETURNING carries no ordering guarantee
        rows.sort_by_key(|row| {
            (
                row.try_get::<i64, _>("state_timestamp").unwrap_or_default(),
                row.try_get::<String, _>("id").unwrap_or_default(),
            )
        });
        Self::decode_rows(&rows)
    }

    async fn find_by_id_and_lease(&self, id: &str) -> Result<E, StoreError> {
        let now = self.clock.now_millis();
        let sql = format!(
            r#"
            UPDATE {table} SET lease_holder = $1, lease_expires_at = $2
            WHERE id = $3 AND (lease_holder IS NULL OR lease_expires_at <= $4)
            RETURNING body
            "#,
            table = self.table
        );
        let row = sqlx::query(&sql)
            .bind(&self.lessor)
            .bind(self.lease_expiry(now))
            .bind(id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Self::decode(&row.try_get::<String, _>("body")?),
            None => match self.find_by_id(id).await? {
                Some(_) => Err(StoreError::AlreadyLeased(id.to_string())),
                None => Err(StoreError::NotFound(id.to_string())),
            },
        }
    }

    async fn save(&self, entity: &E) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        let mut updated = entity.clone();
        updated.core_mut().touch(now);

        let sql = format!(
            r#"
            UPDATE {table}
            SET state = $1, state_count = $2, state_timestamp = $3, updated_at = $4,
                pending = $5, discriminator = $6, owner = $7, body = $8,
                lease_holder = NULL, lease_expires_at = NULL
            WHERE id = $9 AND lease_holder = $10
            "#,
            table = self.table
        );
        let result = sqlx::query(&sql)
            .bind(updated.state().code())
            .bind(updated.state_count() as i32)
            .bind(updated.state_timestamp())
            .bind(now)
            .bind(updated.is_pending())
            .bind(updated.discriminator())
            .bind(updated.owner())
            .bind(serde_json::to_string(&updated)?)
            .bind(updated.id())
            .bind(&self.lessor)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let sql = format!(
            "SELECT lease_holder FROM {table} WHERE id = $1",
            table = self.table
        );
        let holder = sqlx::query(&sql)
            .bind(updated.id())
            .fetch_optional(&self.pool)
            .await?;
        match holder {
            None => Err(StoreError::NotFound(updated.id().to_string())),
            Some(row) => match row.try_get::<Option<String>, _>("lease_holder")? {
                Some(_) => Err(StoreError::AlreadyLeased(updated.id().to_string())),
                None => Err(StoreError::NotLeased(updated.id().to_string())),
            },
        }
    }

    async fn break_lease(&self, id: &str) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            UPDATE {table} SET lease_holder = NULL, lease_expires_at = NULL
            WHERE id = $1 AND lease_holder = $2
            "#,
            table = self.table
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(&self.lessor)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

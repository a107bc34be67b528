use std::{collections::BTreeMap, ops::Deref};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use taskmill::{
    dead_letter::{DeadLetterEntry, DeadLetterError, DeadLetterQuery, DeadLetterStats, DeadLetterStore},
    job::JobId,
};

use crate::{
    types::{self, store_error},
    MIGRATOR,
};

/// A [`DeadLetterStore`] backed by the `taskmill_dead_letters` table.
#[derive(Clone, Debug)]
pub struct PgDeadLetterStore {
    pool: PgPool,
}

impl Deref for PgDeadLetterStore {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl From<PgPool> for PgDeadLetterStore {
    fn from(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl From<&PgPool> for PgDeadLetterStore {
    fn from(value: &PgPool) -> Self {
        value.to_owned().into()
    }
}

impl PgDeadLetterStore {
    /// Wraps `pool`, running any pending migrations first.
    pub async fn from_pool(pool: PgPool) -> Result<Self, DeadLetterError> {
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|error| DeadLetterError::Store(error.to_string()))?;
        Ok(pool.into())
    }

    async fn counts(&self, column: &str) -> Result<BTreeMap<String, usize>, DeadLetterError> {
        let query =
            format!("SELECT {column} AS key, COUNT(*) FROM taskmill_dead_letters GROUP BY key");
        let rows: Vec<(Option<String>, i64)> = sqlx::query_as(&query)
            .fetch_all(self.deref())
            .await
            .map_err(store_error)?;
        Ok(rows
            .into_iter()
            .map(|(key, count)| (key.unwrap_or_default(), count as usize))
            .collect())
    }
}

#[async_trait]
impl DeadLetterStore for PgDeadLetterStore {
    async fn upsert(&self, entry: DeadLetterEntry) -> Result<(), DeadLetterError> {
        sqlx::query(
            r#"INSERT INTO taskmill_dead_letters (
                job_id,
                kind,
                payload,
                reason,
                error,
                attempts_made,
                max_attempts,
                history,
                dead_lettered_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (job_id) DO UPDATE SET
                kind = EXCLUDED.kind,
                payload = EXCLUDED.payload,
                reason = EXCLUDED.reason,
                error = EXCLUDED.error,
                attempts_made = EXCLUDED.attempts_made,
                max_attempts = EXCLUDED.max_attempts,
                history = EXCLUDED.history,
                dead_lettered_at = EXCLUDED.dead_lettered_at
            "#,
        )
        .bind(entry.job_id.as_str())
        .bind(&entry.kind)
        .bind(&entry.payload)
        .bind(entry.reason.as_str())
        .bind(serde_json::to_value(&entry.error)?)
        .bind(i32::from(entry.attempts_made))
        .bind(i32::from(entry.max_attempts))
        .bind(serde_json::to_value(&entry.history)?)
        .bind(entry.dead_lettered_at)
        .execute(self.deref())
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<Option<DeadLetterEntry>, DeadLetterError> {
        sqlx::query_as::<_, types::DeadLetter>(
            "SELECT * FROM taskmill_dead_letters WHERE job_id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(self.deref())
        .await
        .map_err(store_error)?
        .map(DeadLetterEntry::try_from)
        .transpose()
    }

    async fn list(&self, query: &DeadLetterQuery) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        sqlx::query_as::<_, types::DeadLetter>(
            r#"SELECT * FROM taskmill_dead_letters
            WHERE ($1::text IS NULL OR kind = $1)
            AND ($2::timestamptz IS NULL OR dead_lettered_at >= $2)
            AND ($3::timestamptz IS NULL OR dead_lettered_at < $3)
            ORDER BY dead_lettered_at DESC, job_id
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(query.kind.as_deref())
        .bind(query.since)
        .bind(query.until)
        .bind(i64::try_from(query.limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(query.offset).unwrap_or(i64::MAX))
        .fetch_all(self.deref())
        .await
        .map_err(store_error)?
        .into_iter()
        .map(DeadLetterEntry::try_from)
        .collect()
    }

    async fn stats(&self) -> Result<DeadLetterStats, DeadLetterError> {
        let (total, oldest, newest): (i64, Option<DateTime<Utc>>, Option<DateTime<Utc>>) =
            sqlx::query_as(
                r#"SELECT COUNT(*), MIN(dead_lettered_at), MAX(dead_lettered_at)
                FROM taskmill_dead_letters
                "#,
            )
            .fetch_one(self.deref())
            .await
            .map_err(store_error)?;
        Ok(DeadLetterStats {
            total: total as usize,
            by_kind: self.counts("kind").await?,
            by_error_type: self.counts("error->>'error_type'").await?,
            by_reason: self.counts("reason").await?,
            oldest,
            newest,
        })
    }

    async fn remove(&self, id: &JobId) -> Result<bool, DeadLetterError> {
        let outcome = sqlx::query("DELETE FROM taskmill_dead_letters WHERE job_id = $1")
            .bind(id.as_str())
            .execute(self.deref())
            .await
            .map_err(store_error)?;
        Ok(outcome.rows_affected() > 0)
    }

    async fn purge(&self) -> Result<u64, DeadLetterError> {
        let outcome = sqlx::query("DELETE FROM taskmill_dead_letters")
            .execute(self.deref())
            .await
            .map_err(store_error)?;
        Ok(outcome.rows_affected())
    }
}

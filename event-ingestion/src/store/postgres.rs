use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{AggregateStore, SignalStore, StoreError, StoreTransaction};
use crate::aggregates::{AggregateUpdate, VideoCounters, VideoDaily};
use crate::event::Event;

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn video_counters(
        &self,
        video_id: &Uuid,
    ) -> Result<Option<VideoCounters>, StoreError> {
        sqlx::query_as::<_, VideoCounters>(
            r#"
SELECT video_id, views, completes, likes, last_event_at
FROM video_counters
WHERE video_id = $1
            "#,
        )
        .bind(video_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| StoreError::from_query("SELECT video_counters", error))
    }

    pub async fn video_daily(
        &self,
        video_id: &Uuid,
        day: NaiveDate,
    ) -> Result<Option<VideoDaily>, StoreError> {
        sqlx::query_as::<_, VideoDaily>(
            r#"
SELECT video_id, day, views, completes, likes, clicks, impressions, dwell_ms_sum
FROM video_daily
WHERE video_id = $1 AND day = $2
            "#,
        )
        .bind(video_id)
        .bind(day)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| StoreError::from_query("SELECT video_daily", error))
    }

    pub async fn last_seen(&self, key: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT last_seen_at FROM user_signals WHERE user_or_session = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| StoreError::from_query("SELECT user_signals", error))
    }
}

#[async_trait]
impl AggregateStore for PostgresStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        // Must be the first statement of the transaction
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(|error| StoreError::from_query("SET TRANSACTION", error))?;

        Ok(Box::new(PostgresTransaction { tx }))
    }

    async fn event_exists(&self, event_id: &Uuid) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM events WHERE event_id = $1)")
            .bind(event_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| StoreError::from_query("SELECT events", error))
    }
}

#[async_trait]
impl SignalStore for PostgresStore {
    async fn touch_last_seen(&self, key: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
INSERT INTO user_signals (user_or_session, last_seen_at)
VALUES ($1, $2)
ON CONFLICT (user_or_session) DO UPDATE
SET last_seen_at = GREATEST(user_signals.last_seen_at, EXCLUDED.last_seen_at)
            "#,
        )
        .bind(key)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::from_query("UPSERT user_signals", error))?;

        Ok(())
    }
}

pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    async fn insert_event(&mut self, event: &Event) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
INSERT INTO events (event_id, ts, type, session_id, user_id, video_id, query, dwell_ms)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event.event_id)
        .bind(event.timestamp)
        .bind(event.event_type.as_str())
        .bind(&event.session_id)
        .bind(event.user_id)
        .bind(event.video_id)
        .bind(&event.query)
        .bind(event.dwell_ms)
        .execute(&mut *self.tx)
        .await
        .map_err(|error| StoreError::from_query("INSERT events", error))?;

        Ok(result.rows_affected() == 1)
    }

    async fn upsert_video_counters(&mut self, update: &AggregateUpdate) -> Result<(), StoreError> {
        sqlx::query(
            r#"
INSERT INTO video_counters (video_id, views, completes, likes, last_event_at)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (video_id) DO UPDATE
SET views = video_counters.views + EXCLUDED.views,
    completes = video_counters.completes + EXCLUDED.completes,
    likes = video_counters.likes + EXCLUDED.likes,
    last_event_at = GREATEST(video_counters.last_event_at, EXCLUDED.last_event_at)
            "#,
        )
        .bind(update.video_id)
        .bind(update.counters.views)
        .bind(update.counters.completes)
        .bind(update.counters.likes)
        .bind(update.last_event_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|error| StoreError::from_query("UPSERT video_counters", error))?;

        Ok(())
    }

    async fn upsert_video_daily(&mut self, update: &AggregateUpdate) -> Result<(), StoreError> {
        sqlx::query(
            r#"
INSERT INTO video_daily (video_id, day, views, completes, likes, clicks, impressions, dwell_ms_sum)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
ON CONFLICT (video_id, day) DO UPDATE
SET views = video_daily.views + EXCLUDED.views,
    completes = video_daily.completes + EXCLUDED.completes,
    likes = video_daily.likes + EXCLUDED.likes,
    clicks = video_daily.clicks + EXCLUDED.clicks,
    impressions = video_daily.impressions + EXCLUDED.impressions,
    dwell_ms_sum = LEAST(video_daily.dwell_ms_sum::numeric + EXCLUDED.dwell_ms_sum, 9223372036854775807)::bigint
            "#,
        )
        .bind(update.video_id)
        .bind(update.day)
        .bind(update.daily.views)
        .bind(update.daily.completes)
        .bind(update.daily.likes)
        .bind(update.daily.clicks)
        .bind(update.daily.impressions)
        .bind(update.daily.dwell_ms_sum)
        .execute(&mut *self.tx)
        .await
        .map_err(|error| StoreError::from_query("UPSERT video_daily", error))?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(StoreError::from_commit)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|error| StoreError::from_query("ROLLBACK", error))
    }
}

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use common_redis::MockRedisClient;
use event_ingestion::event::RawEvent;
use event_ingestion::idempotency::{reservation_key, IdempotencyService};
use event_ingestion::ingest::{Ingestor, IngestorConfig};
use event_ingestion::signals::SignalUpdater;
use event_ingestion::store::MemoryStore;
use uuid::Uuid;

pub struct TestContext {
    pub ingestor: Arc<Ingestor>,
    pub store: MemoryStore,
    pub redis: MockRedisClient,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(IngestorConfig::default())
    }

    /// Must be called from within a tokio runtime, the signal worker is spawned on it.
    pub fn with_config(config: IngestorConfig) -> Self {
        let store = MemoryStore::new();
        let redis = MockRedisClient::new();

        let idempotency = Arc::new(IdempotencyService::new(
            Arc::new(redis.clone()),
            Duration::from_secs(30),
            Duration::from_secs(48 * 3600),
        ));
        let (signals, _worker) = SignalUpdater::start(
            Arc::new(store.clone()),
            Duration::from_millis(100),
            128,
            4,
        );
        let ingestor = Arc::new(Ingestor::new(
            Arc::new(store.clone()),
            idempotency,
            signals,
            config,
        ));

        Self {
            ingestor,
            store,
            redis,
        }
    }

    pub fn reservation(&self, event_id: &Uuid) -> Option<String> {
        self.redis.value_of(&reservation_key(event_id))
    }
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_714_521_600 + secs, 0).unwrap()
}

pub fn event(event_type: &str, video_id: Option<Uuid>, ts: DateTime<Utc>) -> RawEvent {
    RawEvent {
        event_id: Some(Uuid::now_v7()),
        timestamp: Some(ts),
        event_type: event_type.to_string(),
        session_id: "session-1".to_string(),
        video_id,
        ..Default::default()
    }
}

pub fn view_start(video_id: Uuid, ts: DateTime<Utc>) -> RawEvent {
    event("view_start", Some(video_id), ts)
}

pub fn like(video_id: Uuid, ts: DateTime<Utc>) -> RawEvent {
    event("like", Some(video_id), ts)
}

pub fn click(video_id: Uuid, query: &str, ts: DateTime<Utc>) -> RawEvent {
    RawEvent {
        query: Some(query.to_string()),
        ..event("click_result", Some(video_id), ts)
    }
}

pub fn search(query: &str, ts: DateTime<Utc>) -> RawEvent {
    RawEvent {
        query: Some(query.to_string()),
        ..event("search_query", None, ts)
    }
}

/// Poll until the best-effort updater has written the signal for `key`.
pub async fn wait_for_last_seen(store: &MemoryStore, key: &str) -> Option<DateTime<Utc>> {
    for _ in 0..100 {
        if let Some(seen) = store.last_seen(key) {
            return Some(seen);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    None
}

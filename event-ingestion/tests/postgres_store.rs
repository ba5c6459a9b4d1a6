use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use common_redis::MockRedisClient;
use event_ingestion::aggregates::aggregate_update;
use event_ingestion::event::Event;
use event_ingestion::idempotency::IdempotencyService;
use event_ingestion::ingest::{Ingestor, IngestorConfig};
use event_ingestion::signals::SignalUpdater;
use event_ingestion::store::{AggregateStore, PostgresStore, SignalStore, StoreTransaction};
use sqlx::PgPool;
use uuid::Uuid;

mod common;
use common::{at, click, like, view_start};

fn ingestor(store: &PostgresStore) -> Ingestor {
    let idempotency = Arc::new(IdempotencyService::new(
        Arc::new(MockRedisClient::new()),
        Duration::from_secs(30),
        Duration::from_secs(3600),
    ));
    let (signals, _worker) =
        SignalUpdater::start(Arc::new(store.clone()), Duration::from_millis(500), 16, 2);
    Ingestor::new(
        Arc::new(store.clone()),
        idempotency,
        signals,
        IngestorConfig::default(),
    )
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires postgres"]
async fn test_insert_event_is_append_once(db: PgPool) {
    let store = PostgresStore::new(db);
    let event = Event::try_from(view_start(Uuid::new_v4(), at(100))).unwrap();

    let mut tx = store.begin().await.unwrap();
    assert!(tx.insert_event(&event).await.unwrap());
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    assert!(!tx.insert_event(&event).await.unwrap());
    tx.rollback().await.unwrap();

    assert!(store.event_exists(&event.event_id).await.unwrap());
    assert!(!store.event_exists(&Uuid::new_v4()).await.unwrap());
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires postgres"]
async fn test_rolled_back_transaction_leaves_no_rows(db: PgPool) {
    let store = PostgresStore::new(db);
    let event = Event::try_from(view_start(Uuid::new_v4(), at(100))).unwrap();
    let update = aggregate_update(&event).unwrap();

    let mut tx = store.begin().await.unwrap();
    assert!(tx.insert_event(&event).await.unwrap());
    tx.upsert_video_counters(&update).await.unwrap();
    tx.rollback().await.unwrap();

    assert!(!store.event_exists(&event.event_id).await.unwrap());
    assert_eq!(store.video_counters(&update.video_id).await.unwrap(), None);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires postgres"]
async fn test_aggregates_through_ingestor(db: PgPool) {
    let store = PostgresStore::new(db);
    let ingestor = ingestor(&store);
    let video_id = Uuid::new_v4();

    let first = view_start(video_id, at(100));
    assert!(ingestor.ingest(first.clone()).await.unwrap().inserted);
    assert!(!ingestor.ingest(first).await.unwrap().inserted);
    assert!(ingestor.ingest(like(video_id, at(50))).await.unwrap().inserted);
    let mut clicked = click(video_id, "cats", at(60));
    clicked.dwell_ms = Some(250);
    assert!(ingestor.ingest(clicked).await.unwrap().inserted);

    let counters = store.video_counters(&video_id).await.unwrap().unwrap();
    assert_eq!((counters.views, counters.likes, counters.completes), (1, 1, 0));
    assert_eq!(counters.last_event_at, at(100));

    let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
    let daily = store.video_daily(&video_id, day).await.unwrap().unwrap();
    assert_eq!((daily.views, daily.likes, daily.clicks), (1, 1, 1));
    assert_eq!(daily.dwell_ms_sum, 250);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires postgres"]
async fn test_last_seen_is_monotonic(db: PgPool) {
    let store = PostgresStore::new(db);

    store.touch_last_seen("session-9", at(200)).await.unwrap();
    store.touch_last_seen("session-9", at(100)).await.unwrap();

    assert_eq!(store.last_seen("session-9").await.unwrap(), Some(at(200)));
}

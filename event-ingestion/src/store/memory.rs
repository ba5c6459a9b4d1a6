use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use super::{AggregateStore, SignalStore, StoreError, StoreTransaction};
use crate::aggregates::{AggregateUpdate, VideoCounters, VideoDaily};
use crate::event::Event;

/// How the next commit should misbehave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitFault {
    /// The write is applied but the caller sees an error.
    AcknowledgementLost,
    /// The caller sees an error and nothing is written.
    FailedBeforeWrite,
}

#[derive(Default)]
struct Tables {
    events: HashMap<Uuid, Event>,
    counters: HashMap<Uuid, VideoCounters>,
    daily: HashMap<(Uuid, NaiveDate), VideoDaily>,
}

#[derive(Default)]
struct Faults {
    fail_begin: bool,
    fail_exists_check: bool,
    next_commit: Option<CommitFault>,
    serialization_failures: usize,
    commit_delay: Option<Duration>,
    fail_signals: bool,
    signal_delay: Option<Duration>,
}

/// An in-process store with the same transactional contract as postgres.
///
/// Transactions hold an exclusive lock on all tables until they finish, so
/// concurrent writers are fully serialized. Writes are staged and applied
/// on commit. Faults can be injected to exercise error paths.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<tokio::sync::Mutex<Tables>>,
    signals: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
    faults: Arc<Mutex<Faults>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn unavailable() -> sqlx::Error {
    sqlx::Error::PoolTimedOut
}

fn connection_reset() -> sqlx::Error {
    sqlx::Error::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "connection reset while awaiting commit",
    ))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_begin(&self, fail: bool) {
        lock(&self.faults).fail_begin = fail;
    }

    pub fn fail_exists_check(&self, fail: bool) {
        lock(&self.faults).fail_exists_check = fail;
    }

    pub fn fail_next_commit(&self, fault: CommitFault) {
        lock(&self.faults).next_commit = Some(fault);
    }

    /// The next `count` commits are aborted as if they lost a serialization race.
    pub fn fail_commits_with_serialization(&self, count: usize) {
        lock(&self.faults).serialization_failures = count;
    }

    pub fn delay_commits(&self, delay: Option<Duration>) {
        lock(&self.faults).commit_delay = delay;
    }

    pub fn fail_signals(&self, fail: bool) {
        lock(&self.faults).fail_signals = fail;
    }

    pub fn delay_signals(&self, delay: Option<Duration>) {
        lock(&self.faults).signal_delay = delay;
    }

    pub async fn event(&self, event_id: &Uuid) -> Option<Event> {
        self.tables.lock().await.events.get(event_id).cloned()
    }

    pub async fn event_count(&self) -> usize {
        self.tables.lock().await.events.len()
    }

    pub async fn video_counters(&self, video_id: &Uuid) -> Option<VideoCounters> {
        self.tables.lock().await.counters.get(video_id).cloned()
    }

    pub async fn video_daily(&self, video_id: &Uuid, day: NaiveDate) -> Option<VideoDaily> {
        self.tables
            .lock()
            .await
            .daily
            .get(&(*video_id, day))
            .cloned()
    }

    pub fn last_seen(&self, key: &str) -> Option<DateTime<Utc>> {
        lock(&self.signals).get(key).copied()
    }
}

#[async_trait]
impl AggregateStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        if lock(&self.faults).fail_begin {
            return Err(StoreError::ConnectionError {
                error: unavailable(),
            });
        }

        let tables = self.tables.clone().lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            tables,
            faults: self.faults.clone(),
            events: Vec::new(),
            updates: Vec::new(),
        }))
    }

    async fn event_exists(&self, event_id: &Uuid) -> Result<bool, StoreError> {
        if lock(&self.faults).fail_exists_check {
            return Err(StoreError::from_query("SELECT events", unavailable()));
        }
        Ok(self.tables.lock().await.events.contains_key(event_id))
    }
}

#[async_trait]
impl SignalStore for MemoryStore {
    async fn touch_last_seen(&self, key: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let (fail, delay) = {
            let faults = lock(&self.faults);
            (faults.fail_signals, faults.signal_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(StoreError::from_query("UPSERT user_signals", unavailable()));
        }

        let mut signals = lock(&self.signals);
        let last_seen = signals.entry(key.to_owned()).or_insert(at);
        *last_seen = (*last_seen).max(at);
        Ok(())
    }
}

enum StagedUpdate {
    Counters(AggregateUpdate),
    Daily(AggregateUpdate),
}

pub struct MemoryTransaction {
    tables: OwnedMutexGuard<Tables>,
    faults: Arc<Mutex<Faults>>,
    events: Vec<Event>,
    updates: Vec<StagedUpdate>,
}

impl MemoryTransaction {
    fn apply(mut self) {
        let tables = &mut *self.tables;
        for event in self.events.drain(..) {
            tables.events.insert(event.event_id, event);
        }
        for update in self.updates.drain(..) {
            match update {
                StagedUpdate::Counters(update) => {
                    tables
                        .counters
                        .entry(update.video_id)
                        .and_modify(|c| c.apply(&update))
                        .or_insert_with(|| VideoCounters::from_update(&update));
                }
                StagedUpdate::Daily(update) => {
                    tables
                        .daily
                        .entry((update.video_id, update.day))
                        .and_modify(|d| d.apply(&update))
                        .or_insert_with(|| VideoDaily::from_update(&update));
                }
            }
        }
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn insert_event(&mut self, event: &Event) -> Result<bool, StoreError> {
        let exists = self.tables.events.contains_key(&event.event_id)
            || self.events.iter().any(|e| e.event_id == event.event_id);
        if exists {
            return Ok(false);
        }
        self.events.push(event.clone());
        Ok(true)
    }

    async fn upsert_video_counters(&mut self, update: &AggregateUpdate) -> Result<(), StoreError> {
        self.updates.push(StagedUpdate::Counters(update.clone()));
        Ok(())
    }

    async fn upsert_video_daily(&mut self, update: &AggregateUpdate) -> Result<(), StoreError> {
        self.updates.push(StagedUpdate::Daily(update.clone()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let (delay, fault, serialization_failure) = {
            let mut faults = lock(&self.faults);
            let serialization_failure = faults.serialization_failures > 0;
            if serialization_failure {
                faults.serialization_failures -= 1;
            }
            let fault = if serialization_failure {
                None
            } else {
                faults.next_commit.take()
            };
            (faults.commit_delay, fault, serialization_failure)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if serialization_failure {
            return Err(StoreError::SerializationFailure {
                command: "COMMIT",
                error: sqlx::Error::Protocol(
                    "could not serialize access due to read/write dependencies".to_string(),
                ),
            });
        }

        match fault {
            None => {
                self.apply();
                Ok(())
            }
            Some(CommitFault::AcknowledgementLost) => {
                self.apply();
                Err(StoreError::from_commit(connection_reset()))
            }
            Some(CommitFault::FailedBeforeWrite) => {
                Err(StoreError::from_commit(connection_reset()))
            }
        }
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregates::aggregate_update;
    use crate::event::EventType;
    use chrono::TimeZone;

    fn view(video_id: Uuid) -> Event {
        Event {
            event_id: Uuid::new_v4(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
            event_type: EventType::ViewStart,
            session_id: "s".to_string(),
            user_id: None,
            video_id: Some(video_id),
            query: None,
            dwell_ms: Some(100),
        }
    }

    async fn write(store: &MemoryStore, event: &Event) -> Result<(), StoreError> {
        let update = aggregate_update(event).unwrap();
        let mut tx = store.begin().await?;
        assert!(tx.insert_event(event).await?);
        tx.upsert_video_counters(&update).await?;
        tx.upsert_video_daily(&update).await?;
        tx.commit().await
    }

    #[tokio::test]
    async fn test_commit_applies_staged_writes() {
        let store = MemoryStore::new();
        let video_id = Uuid::new_v4();
        let event = view(video_id);

        write(&store, &event).await.unwrap();

        assert_eq!(store.event_count().await, 1);
        assert_eq!(store.video_counters(&video_id).await.unwrap().views, 1);
        let day = event.timestamp.date_naive();
        assert_eq!(
            store.video_daily(&video_id, day).await.unwrap().dwell_ms_sum,
            100
        );
    }

    #[tokio::test]
    async fn test_dropped_transaction_writes_nothing() {
        let store = MemoryStore::new();
        let event = view(Uuid::new_v4());

        {
            let mut tx = store.begin().await.unwrap();
            assert!(tx.insert_event(&event).await.unwrap());
        }

        assert_eq!(store.event_count().await, 0);
        assert!(!store.event_exists(&event.event_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_insert_reports_false() {
        let store = MemoryStore::new();
        let event = view(Uuid::new_v4());
        write(&store, &event).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(!tx.insert_event(&event).await.unwrap());
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_faults() {
        let store = MemoryStore::new();

        store.fail_next_commit(CommitFault::AcknowledgementLost);
        let acked = view(Uuid::new_v4());
        let err = write(&store, &acked).await.unwrap_err();
        assert!(err.is_ambiguous_commit());
        assert!(store.event_exists(&acked.event_id).await.unwrap());

        store.fail_next_commit(CommitFault::FailedBeforeWrite);
        let lost = view(Uuid::new_v4());
        let err = write(&store, &lost).await.unwrap_err();
        assert!(err.is_ambiguous_commit());
        assert!(!store.event_exists(&lost.event_id).await.unwrap());

        store.fail_commits_with_serialization(1);
        let retried = view(Uuid::new_v4());
        let err = write(&store, &retried).await.unwrap_err();
        assert!(err.is_serialization_failure());
        write(&store, &retried).await.unwrap();
    }

    #[tokio::test]
    async fn test_last_seen_only_moves_forward() {
        let store = MemoryStore::new();
        let later = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();
        let earlier = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();

        store.touch_last_seen("u", later).await.unwrap();
        store.touch_last_seen("u", earlier).await.unwrap();

        assert_eq!(store.last_seen("u"), Some(later));
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::aggregates::AggregateUpdate;
use crate::event::Event;

pub mod memory;
pub mod postgres;

pub use memory::{CommitFault, MemoryStore};
pub use postgres::PostgresStore;

// SQLSTATEs for which postgres guarantees the transaction did not commit
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError {
        command: &'static str,
        error: sqlx::Error,
    },
    #[error("commit failed with: {error}")]
    CommitError { error: sqlx::Error },
    #[error("{command} aborted by a concurrent transaction: {error}")]
    SerializationFailure {
        command: &'static str,
        error: sqlx::Error,
    },
}

impl StoreError {
    pub fn from_query(command: &'static str, error: sqlx::Error) -> Self {
        if is_serialization_error(&error) {
            StoreError::SerializationFailure { command, error }
        } else {
            StoreError::QueryError { command, error }
        }
    }

    pub fn from_commit(error: sqlx::Error) -> Self {
        if is_serialization_error(&error) {
            StoreError::SerializationFailure {
                command: "COMMIT",
                error,
            }
        } else {
            StoreError::CommitError { error }
        }
    }

    /// The transaction was rolled back by the server and can be replayed as-is.
    pub fn is_serialization_failure(&self) -> bool {
        matches!(self, StoreError::SerializationFailure { .. })
    }

    /// The commit was sent but we don't know whether it landed.
    pub fn is_ambiguous_commit(&self) -> bool {
        matches!(self, StoreError::CommitError { .. })
    }
}

fn is_serialization_error(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .and_then(|e| e.code())
        .is_some_and(|code| code == SERIALIZATION_FAILURE || code == DEADLOCK_DETECTED)
}

/// Durable home of the event log and the per-video aggregates.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Open a serializable transaction.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;

    /// Primary key lookup outside of any transaction.
    async fn event_exists(&self, event_id: &Uuid) -> Result<bool, StoreError>;
}

/// Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Returns `false` if an event with the same id is already stored.
    async fn insert_event(&mut self, event: &Event) -> Result<bool, StoreError>;

    async fn upsert_video_counters(&mut self, update: &AggregateUpdate) -> Result<(), StoreError>;

    async fn upsert_video_daily(&mut self, update: &AggregateUpdate) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Coarse per-user activity signals, written outside the aggregate transaction.
#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Moves `last_seen_at` forward to `at`, never backwards.
    async fn touch_last_seen(&self, key: &str, at: DateTime<Utc>) -> Result<(), StoreError>;
}

use std::sync::Arc;
use std::time::Duration;

use common_metrics::timing_guard;
use serde::Serialize;
use thiserror::Error;
use tokio::runtime;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::aggregates::aggregate_update;
use crate::event::{Event, RawEvent, ValidationError};
use crate::idempotency::{IdempotencyService, ReservationStatus, UnavailablePolicy};
use crate::metrics_consts::{
    AMBIGUOUS_COMMITS, EVENTS_DROPPED, EVENTS_DUPLICATE, EVENTS_FAILED, EVENTS_INSERTED,
    EVENTS_INVALID, EVENTS_RECEIVED, INGEST_TIME, RESERVATION_RELEASED, SERIALIZATION_RETRIES,
};
use crate::signals::SignalUpdater;
use crate::store::{AggregateStore, StoreError, StoreTransaction};

#[derive(Debug, Clone)]
pub struct IngestorConfig {
    pub unavailable_policy: UnavailablePolicy,
    pub max_serialization_retries: u32,
    /// Deadline for the transactional part of an ingestion.
    pub timeout: Duration,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            unavailable_policy: UnavailablePolicy::FailClosed,
            max_serialization_retries: 3,
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    /// `false` means the event had already been processed.
    pub inserted: bool,
}

impl IngestOutcome {
    const INSERTED: IngestOutcome = IngestOutcome { inserted: true };
    const DUPLICATE: IngestOutcome = IngestOutcome { inserted: false };
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("invalid event: {0}")]
    Validation(#[from] ValidationError),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("ingestion did not finish within {0:?}")]
    Timeout(Duration),
}

impl IngestError {
    /// Whether the caller may succeed by sending the same event again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, IngestError::Validation(_))
    }
}

enum WriteOutcome {
    Inserted,
    AlreadyStored,
}

/// Writes events exactly once and keeps the video aggregates in step.
///
/// An attempt first reserves the event id in redis, so concurrent
/// deliveries of the same event don't race into the database. The event
/// row and its aggregate increments are then written in one serializable
/// transaction. The event primary key is the final authority: a duplicate
/// that slips past the reservation inserts nothing and increments nothing.
pub struct Ingestor {
    store: Arc<dyn AggregateStore>,
    idempotency: Arc<IdempotencyService>,
    signals: SignalUpdater,
    config: IngestorConfig,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn AggregateStore>,
        idempotency: Arc<IdempotencyService>,
        signals: SignalUpdater,
        config: IngestorConfig,
    ) -> Self {
        Self {
            store,
            idempotency,
            signals,
            config,
        }
    }

    #[instrument(skip_all, fields(event_id))]
    pub async fn ingest(&self, raw: RawEvent) -> Result<IngestOutcome, IngestError> {
        metrics::counter!(EVENTS_RECEIVED).increment(1);

        let event = match Event::try_from(raw) {
            Ok(event) => event,
            Err(err) => {
                let labels = [("reason", validation_reason(&err))];
                metrics::counter!(EVENTS_INVALID, &labels).increment(1);
                return Err(err.into());
            }
        };
        tracing::Span::current().record("event_id", tracing::field::display(event.event_id));

        let timer = timing_guard(INGEST_TIME, &[]);
        let result = self.ingest_event(&event).await;

        let outcome = match &result {
            Ok(IngestOutcome { inserted: true }) => {
                metrics::counter!(EVENTS_INSERTED).increment(1);
                "inserted"
            }
            Ok(IngestOutcome { inserted: false }) => {
                metrics::counter!(EVENTS_DUPLICATE).increment(1);
                "duplicate"
            }
            Err(err) => {
                error!(error = %err, "failed to ingest event");
                let labels = [("kind", error_kind(err))];
                metrics::counter!(EVENTS_FAILED, &labels).increment(1);
                "error"
            }
        };
        timer.label("outcome", outcome).fin();

        result
    }

    async fn ingest_event(&self, event: &Event) -> Result<IngestOutcome, IngestError> {
        let guard = match self.idempotency.try_reserve(&event.event_id).await {
            ReservationStatus::Miss => Some(ReservationGuard::new(
                self.idempotency.clone(),
                event.event_id,
            )),
            ReservationStatus::Duplicate => {
                debug!("event already reserved or processed");
                return Ok(IngestOutcome::DUPLICATE);
            }
            ReservationStatus::Unknown => match self.config.unavailable_policy {
                UnavailablePolicy::FailClosed => {
                    error!(
                        event_id = %event.event_id,
                        policy = UnavailablePolicy::FailClosed.as_str(),
                        "reservation store unavailable, dropping event"
                    );
                    let labels = [("reason", "reservation_unavailable")];
                    metrics::counter!(EVENTS_DROPPED, &labels).increment(1);
                    return Ok(IngestOutcome::DUPLICATE);
                }
                UnavailablePolicy::FailOpen => {
                    warn!(
                        event_id = %event.event_id,
                        policy = UnavailablePolicy::FailOpen.as_str(),
                        "reservation store unavailable, writing without a reservation"
                    );
                    None
                }
            },
        };

        let write = self.write_with_retries(event);
        let written = match tokio::time::timeout(self.config.timeout, write).await {
            Ok(Ok(written)) => written,
            Ok(Err(err)) => {
                if let Some(guard) = guard {
                    guard.release().await;
                }
                return Err(err.into());
            }
            Err(_elapsed) => {
                warn!(timeout = ?self.config.timeout, "ingestion deadline elapsed");
                if let Some(guard) = guard {
                    guard.release().await;
                }
                return Err(IngestError::Timeout(self.config.timeout));
            }
        };

        if let Some(guard) = guard {
            guard.finalize().await;
        }

        match written {
            WriteOutcome::Inserted => {
                self.signals.dispatch(event);
                Ok(IngestOutcome::INSERTED)
            }
            WriteOutcome::AlreadyStored => {
                debug!("event already stored");
                Ok(IngestOutcome::DUPLICATE)
            }
        }
    }

    async fn write_with_retries(&self, event: &Event) -> Result<WriteOutcome, StoreError> {
        let mut retries = 0;
        loop {
            match self.write_once(event).await {
                Err(err)
                    if err.is_serialization_failure()
                        && retries < self.config.max_serialization_retries =>
                {
                    retries += 1;
                    debug!(retries, error = %err, "transaction aborted, retrying");
                    metrics::counter!(SERIALIZATION_RETRIES).increment(1);
                }
                Err(err) if err.is_ambiguous_commit() => {
                    return self.resolve_ambiguous_commit(&event.event_id, err).await;
                }
                result => return result,
            }
        }
    }

    async fn write_once(&self, event: &Event) -> Result<WriteOutcome, StoreError> {
        // Any early return drops the transaction, which rolls it back
        let mut tx = self.store.begin().await?;

        if !tx.insert_event(event).await? {
            if let Err(err) = tx.rollback().await {
                warn!(error = %err, "failed to roll back duplicate insert");
            }
            return Ok(WriteOutcome::AlreadyStored);
        }

        if let Some(update) = aggregate_update(event) {
            tx.upsert_video_counters(&update).await?;
            tx.upsert_video_daily(&update).await?;
        }

        tx.commit().await?;
        Ok(WriteOutcome::Inserted)
    }

    /// A failed commit may still have landed. The event row decides.
    async fn resolve_ambiguous_commit(
        &self,
        event_id: &Uuid,
        commit_error: StoreError,
    ) -> Result<WriteOutcome, StoreError> {
        match self.store.event_exists(event_id).await {
            Ok(true) => {
                warn!(error = %commit_error, "commit reported an error but the event is stored");
                let labels = [("resolution", "stored")];
                metrics::counter!(AMBIGUOUS_COMMITS, &labels).increment(1);
                Ok(WriteOutcome::Inserted)
            }
            Ok(false) => {
                let labels = [("resolution", "not_stored")];
                metrics::counter!(AMBIGUOUS_COMMITS, &labels).increment(1);
                Err(commit_error)
            }
            Err(check_error) => {
                error!(
                    error = %commit_error,
                    check_error = %check_error,
                    "could not determine outcome of failed commit"
                );
                let labels = [("resolution", "unknown")];
                metrics::counter!(AMBIGUOUS_COMMITS, &labels).increment(1);
                Err(commit_error)
            }
        }
    }
}

fn validation_reason(err: &ValidationError) -> &'static str {
    match err {
        ValidationError::MissingEventId => "missing_event_id",
        ValidationError::MissingSessionId => "missing_session_id",
        ValidationError::MissingType => "missing_type",
        ValidationError::MissingTimestamp => "missing_timestamp",
        ValidationError::UnknownType(_) => "unknown_type",
        ValidationError::MissingVideoId(_) => "missing_video_id",
        ValidationError::MissingQuery(_) => "missing_query",
        ValidationError::NegativeDwell(_) => "negative_dwell",
        ValidationError::DwellTooLarge(_) => "dwell_too_large",
    }
}

fn error_kind(err: &IngestError) -> &'static str {
    match err {
        IngestError::Validation(_) => "validation",
        IngestError::Storage(_) => "storage",
        IngestError::Timeout(_) => "timeout",
    }
}

/// Owns a pending reservation until the attempt reaches a terminal state.
///
/// Known exits call `finalize` or `release`. If the guard is dropped while
/// still armed, e.g. because the request future was cancelled, the release
/// is spawned onto the current runtime.
struct ReservationGuard {
    idempotency: Arc<IdempotencyService>,
    event_id: Uuid,
    armed: bool,
}

impl ReservationGuard {
    fn new(idempotency: Arc<IdempotencyService>, event_id: Uuid) -> Self {
        Self {
            idempotency,
            event_id,
            armed: true,
        }
    }

    async fn finalize(mut self) {
        self.armed = false;
        self.idempotency.mark_done(&self.event_id).await;
    }

    async fn release(mut self) {
        self.armed = false;
        self.idempotency.release(&self.event_id).await;
        metrics::counter!(RESERVATION_RELEASED).increment(1);
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        if let Ok(handle) = runtime::Handle::try_current() {
            let idempotency = self.idempotency.clone();
            let event_id = self.event_id;
            handle.spawn(async move {
                idempotency.release(&event_id).await;
                metrics::counter!(RESERVATION_RELEASED).increment(1);
            });
        } else {
            warn!(event_id = %self.event_id, "no runtime to release reservation, leaving it to expire");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_redis::MockRedisClient;

    use crate::idempotency::reservation_key;

    fn idempotency(client: &MockRedisClient) -> Arc<IdempotencyService> {
        Arc::new(IdempotencyService::new(
            Arc::new(client.clone()),
            Duration::from_secs(30),
            Duration::from_secs(3600),
        ))
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_reservation() {
        let client = MockRedisClient::new();
        let idem = idempotency(&client);
        let event_id = Uuid::new_v4();

        assert_eq!(idem.try_reserve(&event_id).await, ReservationStatus::Miss);
        drop(ReservationGuard::new(idem.clone(), event_id));

        // let the spawned release run
        for _ in 0..50 {
            if client.value_of(&reservation_key(&event_id)).is_none() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(client.value_of(&reservation_key(&event_id)), None);
    }

    #[tokio::test]
    async fn test_finalized_guard_does_not_release() {
        let client = MockRedisClient::new();
        let idem = idempotency(&client);
        let event_id = Uuid::new_v4();

        idem.try_reserve(&event_id).await;
        ReservationGuard::new(idem.clone(), event_id)
            .finalize()
            .await;
        tokio::task::yield_now().await;

        assert_eq!(
            client.value_of(&reservation_key(&event_id)),
            Some("done".to_string())
        );
        assert!(!client.get_calls().iter().any(|call| call.op == "del"));
    }

    #[test]
    fn test_only_validation_errors_are_final() {
        assert!(!IngestError::Validation(ValidationError::MissingType).is_retryable());
        assert!(IngestError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(IngestError::Storage(StoreError::ConnectionError {
            error: sqlx::Error::PoolTimedOut
        })
        .is_retryable());
    }
}

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use common_redis::{Client, CustomRedisError};
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

use crate::metrics_consts::RESERVATION_ERRORS;

pub const IDEMPOTENCY_KEY_PREFIX: &str = "idem:event:";
pub const PENDING_VALUE: &str = "pending";
pub const DONE_VALUE: &str = "done";

pub fn reservation_key(event_id: &Uuid) -> String {
    format!("{IDEMPOTENCY_KEY_PREFIX}{event_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationStatus {
    /// We created the pending key and own the reservation.
    Miss,
    /// Someone else holds a pending or done key.
    Duplicate,
    /// The store could not be asked.
    Unknown,
}

/// What to do with an event when the reservation store can't answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailablePolicy {
    /// Treat the event as a duplicate and drop it.
    FailClosed,
    /// Write without a reservation and rely on the event primary key.
    FailOpen,
}

impl UnavailablePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnavailablePolicy::FailClosed => "fail_closed",
            UnavailablePolicy::FailOpen => "fail_open",
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid reservation policy {0:?}, expected fail_closed or fail_open")]
pub struct ParseUnavailablePolicyError(String);

impl FromStr for UnavailablePolicy {
    type Err = ParseUnavailablePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail_closed" => Ok(UnavailablePolicy::FailClosed),
            "fail_open" => Ok(UnavailablePolicy::FailOpen),
            _ => Err(ParseUnavailablePolicyError(s.to_owned())),
        }
    }
}

/// Short-lived per-event reservations held in redis.
///
/// A key moves from absent to `pending` when an attempt starts, to `done`
/// once the event is durably stored, and back to absent if the attempt
/// fails before commit. Only `try_reserve` reports errors to the caller,
/// and only as `ReservationStatus::Unknown`; the other two operations are
/// best-effort since the pending TTL bounds the damage of a lost write.
pub struct IdempotencyService {
    client: Arc<dyn Client + Send + Sync>,
    pending_ttl: Duration,
    done_ttl: Duration,
}

impl IdempotencyService {
    pub fn new(
        client: Arc<dyn Client + Send + Sync>,
        pending_ttl: Duration,
        done_ttl: Duration,
    ) -> Self {
        Self {
            client,
            pending_ttl,
            done_ttl,
        }
    }

    pub async fn try_reserve(&self, event_id: &Uuid) -> ReservationStatus {
        let result = self
            .client
            .set_nx_ex(
                reservation_key(event_id),
                PENDING_VALUE.to_string(),
                ttl_secs(self.pending_ttl),
            )
            .await;

        match result {
            Ok(true) => ReservationStatus::Miss,
            Ok(false) => ReservationStatus::Duplicate,
            Err(err) => {
                report_error("reserve", event_id, &err);
                ReservationStatus::Unknown
            }
        }
    }

    pub async fn mark_done(&self, event_id: &Uuid) {
        let result = self
            .client
            .setex(
                reservation_key(event_id),
                DONE_VALUE.to_string(),
                ttl_secs(self.done_ttl),
            )
            .await;

        if let Err(err) = result {
            report_error("mark_done", event_id, &err);
        }
    }

    pub async fn release(&self, event_id: &Uuid) {
        if let Err(err) = self.client.del(reservation_key(event_id)).await {
            report_error("release", event_id, &err);
        }
    }
}

// Redis rejects EX 0, and sub-second TTLs would silently round down to it
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

// A misconfigured or rejecting server won't heal on its own, unlike a timeout
fn report_error(op: &'static str, event_id: &Uuid, err: &CustomRedisError) {
    let kind = error_kind(err);
    if kind == "unrecoverable" {
        error!(event_id = %event_id, op, error = %err, "reservation store rejected call");
    } else {
        warn!(event_id = %event_id, op, error = %err, "reservation store call failed");
    }
    let labels = [("op", op), ("kind", kind)];
    metrics::counter!(RESERVATION_ERRORS, &labels).increment(1);
}

fn error_kind(err: &CustomRedisError) -> &'static str {
    if err.is_unrecoverable_error() {
        "unrecoverable"
    } else {
        "transient"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_redis::{MockRedisClient, MockRedisValue};

    fn service(client: &MockRedisClient) -> IdempotencyService {
        IdempotencyService::new(
            Arc::new(client.clone()),
            Duration::from_secs(30),
            Duration::from_secs(48 * 3600),
        )
    }

    #[tokio::test]
    async fn test_first_reservation_wins() {
        let client = MockRedisClient::new();
        let idem = service(&client);
        let event_id = Uuid::new_v4();

        assert_eq!(idem.try_reserve(&event_id).await, ReservationStatus::Miss);
        assert_eq!(
            idem.try_reserve(&event_id).await,
            ReservationStatus::Duplicate
        );

        let key = reservation_key(&event_id);
        assert!(key.starts_with("idem:event:"));
        assert_eq!(client.value_of(&key), Some("pending".to_string()));
        assert_eq!(
            client.get_calls()[0].value,
            MockRedisValue::StringWithTTL("pending".to_string(), 30)
        );
    }

    #[tokio::test]
    async fn test_mark_done_extends_ttl() {
        let client = MockRedisClient::new();
        let idem = service(&client);
        let event_id = Uuid::new_v4();

        idem.try_reserve(&event_id).await;
        idem.mark_done(&event_id).await;

        let key = reservation_key(&event_id);
        assert_eq!(client.value_of(&key), Some("done".to_string()));
        assert!(client.ttl_of(&key).unwrap() > Duration::from_secs(47 * 3600));
        assert_eq!(
            idem.try_reserve(&event_id).await,
            ReservationStatus::Duplicate
        );
    }

    #[tokio::test]
    async fn test_release_allows_new_reservation() {
        let client = MockRedisClient::new();
        let idem = service(&client);
        let event_id = Uuid::new_v4();

        idem.try_reserve(&event_id).await;
        idem.release(&event_id).await;

        assert_eq!(client.value_of(&reservation_key(&event_id)), None);
        assert_eq!(idem.try_reserve(&event_id).await, ReservationStatus::Miss);
    }

    #[tokio::test]
    async fn test_unreachable_store_is_unknown() {
        let client = MockRedisClient::new();
        client.set_unavailable(Some(CustomRedisError::Timeout));
        let idem = service(&client);
        let event_id = Uuid::new_v4();

        assert_eq!(idem.try_reserve(&event_id).await, ReservationStatus::Unknown);
        // best-effort calls swallow the error
        idem.mark_done(&event_id).await;
        idem.release(&event_id).await;
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!(
            "fail_closed".parse::<UnavailablePolicy>(),
            Ok(UnavailablePolicy::FailClosed)
        );
        assert_eq!(
            "FAIL_OPEN".parse::<UnavailablePolicy>(),
            Ok(UnavailablePolicy::FailOpen)
        );
        assert!("maybe".parse::<UnavailablePolicy>().is_err());
    }

    #[test]
    fn test_policy_parse_error_names_the_value() {
        let err = "maybe".parse::<UnavailablePolicy>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid reservation policy \"maybe\", expected fail_closed or fail_open"
        );
    }

    #[test]
    fn test_error_kind_separates_misconfiguration_from_outage() {
        assert_eq!(error_kind(&CustomRedisError::Timeout), "transient");
        assert_eq!(
            error_kind(&CustomRedisError::InvalidConfiguration("x".to_string())),
            "unrecoverable"
        );
    }

    #[test]
    fn test_sub_second_ttl_rounds_up() {
        assert_eq!(ttl_secs(Duration::from_millis(200)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(30)), 30);
    }
}

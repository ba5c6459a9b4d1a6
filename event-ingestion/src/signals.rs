use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::event::Event;
use crate::metrics_consts::{SIGNAL_UPDATES, SIGNAL_UPDATES_DROPPED, SIGNAL_UPDATE_TIME};
use crate::store::SignalStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalUpdate {
    pub key: String,
    pub seen_at: DateTime<Utc>,
}

impl From<&Event> for SignalUpdate {
    fn from(event: &Event) -> Self {
        SignalUpdate {
            key: event.signal_key(),
            seen_at: event.timestamp,
        }
    }
}

/// Fire-and-forget "last seen" updates, applied off the request path.
///
/// `dispatch` never waits: updates go to a bounded queue and are dropped
/// when it is full. A worker task drains the queue and runs each update on
/// its own task, bounded by `max_in_flight` and a per-update timeout.
/// Failures are logged and counted, never retried.
#[derive(Clone)]
pub struct SignalUpdater {
    sender: mpsc::Sender<SignalUpdate>,
}

impl SignalUpdater {
    pub fn start(
        store: Arc<dyn SignalStore>,
        timeout: Duration,
        capacity: usize,
        max_in_flight: usize,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(run_worker(
            receiver,
            store,
            timeout,
            Arc::new(Semaphore::new(max_in_flight.max(1))),
        ));
        (Self { sender }, worker)
    }

    pub fn dispatch(&self, event: &Event) {
        match self.sender.try_send(SignalUpdate::from(event)) {
            Ok(()) => {}
            Err(TrySendError::Full(update)) => {
                debug!(key = %update.key, "signal queue full, dropping update");
                let labels = [("reason", "queue_full")];
                metrics::counter!(SIGNAL_UPDATES_DROPPED, &labels).increment(1);
            }
            Err(TrySendError::Closed(_)) => {
                let labels = [("reason", "closed")];
                metrics::counter!(SIGNAL_UPDATES_DROPPED, &labels).increment(1);
            }
        }
    }
}

async fn run_worker(
    mut receiver: mpsc::Receiver<SignalUpdate>,
    store: Arc<dyn SignalStore>,
    timeout: Duration,
    semaphore: Arc<Semaphore>,
) {
    while let Some(update) = receiver.recv().await {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            // only happens if the semaphore is closed, which we never do
            break;
        };
        let store = store.clone();

        tokio::spawn(async move {
            let _permit = permit;
            apply(store.as_ref(), update, timeout).await;
        });
    }
}

async fn apply(store: &dyn SignalStore, update: SignalUpdate, timeout: Duration) {
    let timer = common_metrics::timing_guard(SIGNAL_UPDATE_TIME, &[]);

    let touch = store.touch_last_seen(&update.key, update.seen_at);
    let outcome = match tokio::time::timeout(timeout, touch).await {
        Ok(Ok(())) => "success",
        Ok(Err(err)) => {
            warn!(key = %update.key, error = %err, "failed to update last seen signal");
            "error"
        }
        Err(_) => {
            warn!(key = %update.key, ?timeout, "last seen signal update timed out");
            "timeout"
        }
    };

    let labels = [("outcome", outcome)];
    metrics::counter!(SIGNAL_UPDATES, &labels).increment(1);
    timer.label("outcome", outcome).fin();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn event(user_id: Option<Uuid>) -> Event {
        Event {
            event_id: Uuid::new_v4(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
            event_type: EventType::SearchQuery,
            session_id: "session-7".to_string(),
            user_id,
            video_id: None,
            query: Some("q".to_string()),
            dwell_ms: None,
        }
    }

    async fn wait_for_signal(store: &MemoryStore, key: &str) -> Option<DateTime<Utc>> {
        for _ in 0..100 {
            if let Some(seen) = store.last_seen(key) {
                return Some(seen);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        None
    }

    #[tokio::test]
    async fn test_dispatched_update_is_applied() {
        let store = MemoryStore::new();
        let (updater, _worker) =
            SignalUpdater::start(Arc::new(store.clone()), Duration::from_millis(500), 8, 2);

        let user_id = Uuid::new_v4();
        let event = event(Some(user_id));
        updater.dispatch(&event);

        assert_eq!(
            wait_for_signal(&store, &user_id.to_string()).await,
            Some(event.timestamp)
        );
    }

    #[tokio::test]
    async fn test_session_key_without_user() {
        let store = MemoryStore::new();
        let (updater, _worker) =
            SignalUpdater::start(Arc::new(store.clone()), Duration::from_millis(500), 8, 2);

        updater.dispatch(&event(None));

        assert!(wait_for_signal(&store, "session-7").await.is_some());
    }

    #[tokio::test]
    async fn test_slow_store_times_out_without_blocking_dispatch() {
        let store = MemoryStore::new();
        store.delay_signals(Some(Duration::from_secs(5)));
        let (updater, _worker) =
            SignalUpdater::start(Arc::new(store.clone()), Duration::from_millis(20), 1, 1);

        let started = std::time::Instant::now();
        for _ in 0..10 {
            updater.dispatch(&event(None));
        }
        assert!(started.elapsed() < Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.last_seen("session-7"), None);
    }
}

pub const EVENTS_RECEIVED: &str = "ingest_events_received_total";
pub const EVENTS_INSERTED: &str = "ingest_events_inserted_total";
pub const EVENTS_DUPLICATE: &str = "ingest_events_duplicate_total";
pub const EVENTS_INVALID: &str = "ingest_events_invalid_total";
pub const EVENTS_FAILED: &str = "ingest_events_failed_total";
pub const EVENTS_DROPPED: &str = "ingest_events_dropped_total";
pub const INGEST_TIME: &str = "ingest_event_time_ms";

pub const RESERVATION_ERRORS: &str = "ingest_reservation_errors_total";
pub const RESERVATION_RELEASED: &str = "ingest_reservation_released_total";

pub const AMBIGUOUS_COMMITS: &str = "ingest_ambiguous_commits_total";
pub const SERIALIZATION_RETRIES: &str = "ingest_serialization_retries_total";

pub const SIGNAL_UPDATES: &str = "ingest_signal_updates_total";
pub const SIGNAL_UPDATES_DROPPED: &str = "ingest_signal_updates_dropped_total";
pub const SIGNAL_UPDATE_TIME: &str = "ingest_signal_update_time_ms";

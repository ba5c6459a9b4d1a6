pub mod aggregates;
pub mod api;
pub mod config;
pub mod event;
pub mod idempotency;
pub mod ingest;
pub mod metrics_consts;
pub mod router;
pub mod server;
pub mod signals;
pub mod store;

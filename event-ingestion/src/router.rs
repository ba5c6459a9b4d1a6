use std::sync::Arc;

use axum::{routing, Router};
use tower_http::trace::TraceLayer;

use crate::api;
use crate::ingest::Ingestor;

pub async fn index() -> &'static str {
    "event ingestion"
}

pub fn router(ingestor: Arc<Ingestor>, metrics: bool) -> Router {
    let router = Router::new()
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(index)) // No background loops to watch, axum being up is enough
        .route("/events", routing::post(api::post_event))
        .layer(TraceLayer::new_for_http())
        .with_state(ingestor);

    // Don't install metrics unless asked to
    // Installing a global recorder when the service is used as a library (during tests etc)
    // does not work well.
    if metrics {
        common_metrics::setup_metrics_routes(router)
    } else {
        router
    }
}

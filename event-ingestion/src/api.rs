use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::RawEvent;
use crate::ingest::{IngestError, IngestOutcome, Ingestor};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    InvalidBody(#[from] JsonRejection),
    #[error(transparent)]
    Ingest(#[from] IngestError),
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            // 400 for syntax errors, 422 for well-formed JSON with the wrong shape
            ApiError::InvalidBody(rejection) => (rejection.status(), rejection.body_text()),
            ApiError::Ingest(IngestError::Validation(err)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
            }
            // storage details stay in the logs
            ApiError::Ingest(IngestError::Storage(_)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_owned(),
            ),
            ApiError::Ingest(err @ IngestError::Timeout(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        };

        (status, Json(ErrorResponse { error })).into_response()
    }
}

/// 201 when the event was stored by this request, 200 when it was already known.
pub async fn post_event(
    State(ingestor): State<Arc<Ingestor>>,
    payload: Result<Json<RawEvent>, JsonRejection>,
) -> Result<(StatusCode, Json<IngestOutcome>), ApiError> {
    let Json(raw) = payload?;

    let outcome = ingestor.ingest(raw).await?;
    let status = if outcome.inserted {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };

    Ok((status, Json(outcome)))
}

//! HTTP boundary: shared handler state and the error-to-response mapping.

use std::sync::Arc;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::core::queue::{InboundQueue, OutboundRegistry};
use crate::error::EngineError;

pub mod completions;

/// Handles shared by every HTTP handler: the queue pair, nothing else.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<InboundQueue>,
    pub registry: Arc<OutboundRegistry>,
}

/// Errors a handler can answer with.
#[derive(Debug)]
pub enum ApiError {
    /// Well-formed JSON that fails validation. Reported before a task is
    /// created; never enters the queue.
    Validation(&'static str),
    /// The engine failed on this request. Other in-flight requests are
    /// unaffected.
    Engine(EngineError),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Validation(message) => (StatusCode::BAD_REQUEST, message.to_string()),
            ApiError::Engine(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        };

        (status, Json(ErrorBody { error: message })).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError::Engine(err)
    }
}

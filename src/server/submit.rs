//! Producer-facing submission service.
//!
//! `POST /submit` creates a task, enqueues it and answers with the new id.
//! Any internal fault, panics included, becomes a plain 500 without an id.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::model::Task;
use crate::queue::Queue;

/// Task name used when the request body does not name one.
pub const DEFAULT_TASK_NAME: &str = "ExampleTask";

#[derive(Clone)]
struct SubmitState {
    queue: Arc<dyn Queue>,
    max_retries: u32,
}

/// Optional JSON body of `POST /submit`.
#[derive(Debug, Default, Deserialize)]
struct SubmitRequest {
    name: Option<String>,
    payload: Option<String>,
    max_retries: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub id: String,
    pub message: String,
}

/// Routes `/submit` and `/health`, with CORS for `allowed_origin`.
pub fn submission_router(
    queue: Arc<dyn Queue>,
    max_retries: u32,
    allowed_origin: &str,
) -> Result<Router> {
    let origin = HeaderValue::from_str(allowed_origin)
        .map_err(|e| Error::Config(format!("bad ALLOWED_ORIGIN {allowed_origin:?}: {e}")))?;
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::POST, Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Ok(Router::new()
        .route("/submit", post(submit))
        .route("/health", get(health))
        .with_state(SubmitState { queue, max_retries })
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(cors))
}

async fn health() -> &'static str {
    "OK"
}

async fn submit(State(state): State<SubmitState>, body: Bytes) -> Response {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        SubmitRequest::default()
    } else {
        match serde_json::from_slice::<SubmitRequest>(&body) {
            Ok(r) => r,
            Err(e) => {
                return (StatusCode::BAD_REQUEST, format!("invalid request body: {e}"))
                    .into_response();
            }
        }
    };

    let task = Task::new(request.name.unwrap_or_else(|| DEFAULT_TASK_NAME.to_string()))
        .payload(request.payload.unwrap_or_default())
        .max_retries(request.max_retries.unwrap_or(state.max_retries));
    info!(task_id = %task.id, name = %task.name, "created task");

    match state.queue.enqueue(&task).await {
        Ok(()) => Json(SubmitResponse {
            id: task.id.to_string(),
            message: "Task enqueued successfully!".to_string(),
        })
        .into_response(),
        Err(e) => {
            error!(task_id = %task.id, "enqueue error: {e}");
            internal_error()
        }
    }
}

fn handle_panic(_: Box<dyn std::any::Any + Send + 'static>) -> Response {
    error!("submit handler panicked");
    internal_error()
}

fn internal_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
}

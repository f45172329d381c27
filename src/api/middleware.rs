//! Request correlation ids and panic recovery.

use axum::{
    body::Body,
    extract::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::any::Any;
use std::backtrace::Backtrace;
use tracing::Instrument;

use super::error::ApiError;

/// Numeric id attached to every request, logged as `log_id` and returned as
/// `error_id` in error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

impl RequestId {
    pub fn generate() -> Self {
        Self(rand::random())
    }
}

tokio::task_local! {
    pub static REQUEST_ID: RequestId;
}

/// The id of the request being served, or a fresh one outside a request.
pub fn current_request_id() -> RequestId {
    REQUEST_ID
        .try_with(|id| *id)
        .unwrap_or_else(|_| RequestId::generate())
}

pub async fn request_id(mut request: Request, next: Next) -> Response {
    let id = RequestId::generate();
    request.extensions_mut().insert(id);

    let span = tracing::info_span!("request", log_id = id.0);
    REQUEST_ID.scope(id, next.run(request)).instrument(span).await
}

/// Turn a handler panic into the generic internal error.
pub fn handle_panic(payload: Box<dyn Any + Send + 'static>) -> Response<Body> {
    let detail = if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else {
        "unknown panic payload"
    };
    let backtrace = Backtrace::force_capture();
    tracing::error!(panic = %detail, backtrace = %backtrace, "Request handler panicked");

    ApiError::internal().into_response()
}

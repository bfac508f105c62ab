//! Outermost stage: turns panics from the rest of the chain into 500s.

use std::any::Any;
use std::panic::{resume_unwind, AssertUnwindSafe};

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use tracing::error;

use super::{Next, QueryContext, Stage};

/// Panic payload signalling that the client transport is gone and no
/// response can be written. Re-raised instead of being answered.
pub struct ConnectionAbort;

pub struct Recovery;

#[async_trait]
impl Stage for Recovery {
    async fn handle(&self, ctx: QueryContext, next: Next<'_>) -> Response {
        match AssertUnwindSafe(next.run(ctx)).catch_unwind().await {
            Ok(response) => response,
            Err(payload) => {
                if payload.is::<ConnectionAbort>() {
                    resume_unwind(payload);
                }
                error!(panic = panic_message(&payload), "recovered from panic");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error has occurred",
                )
                    .into_response()
            }
        }
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

//! Innermost stage before the executor: bounds the time a query may hold
//! a connection and a client socket.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use super::{Next, QueryContext, Stage};

pub struct Timeout {
    limit: Duration,
}

impl Timeout {
    pub fn new(limit: Duration) -> Self {
        Self { limit }
    }
}

#[async_trait]
impl Stage for Timeout {
    async fn handle(&self, mut ctx: QueryContext, next: Next<'_>) -> Response {
        // The deadline rides along on the context so the executor can keep
        // enforcing it while it streams rows, past the point where this
        // future has already resolved with the response headers.
        let deadline = tokio::time::Instant::now() + self.limit;
        ctx.deadline = Some(deadline);

        match tokio::time::timeout_at(deadline, next.run(ctx)).await {
            Ok(response) => response,
            Err(_) => {
                warn!(limit = ?self.limit, "request timed out");
                (StatusCode::SERVICE_UNAVAILABLE, "Request timed out").into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::HeaderMap;
    use bytes::Bytes;

    use super::super::testing::{body_text, RecordingHandler};
    use super::super::{Handler, Pipeline};
    use super::*;

    struct SlowHandler;

    #[async_trait]
    impl Handler for SlowHandler {
        async fn call(&self, _ctx: QueryContext) -> Response {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            (StatusCode::OK, "too late").into_response()
        }
    }

    fn ctx() -> QueryContext {
        QueryContext::new(HeaderMap::new(), Bytes::new())
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handlers_are_cut_off() {
        let pipeline = Pipeline::new(
            vec![Arc::new(Timeout::new(Duration::from_secs(1)))],
            Arc::new(SlowHandler),
        );
        let response = pipeline.dispatch(ctx()).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_text(response).await, "Request timed out");
    }

    #[tokio::test]
    async fn fast_handlers_are_untouched() {
        let pipeline = Pipeline::new(
            vec![Arc::new(Timeout::new(Duration::from_secs(1)))],
            Arc::new(RecordingHandler::default()),
        );
        let response = pipeline.dispatch(ctx()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn deadline_is_stamped_on_the_context() {
        let terminal = Arc::new(RecordingHandler::default());
        let pipeline = Pipeline::new(
            vec![Arc::new(Timeout::new(Duration::from_secs(1)))],
            terminal.clone(),
        );
        pipeline.dispatch(ctx()).await;

        let deadline = terminal.last_deadline.lock().unwrap();
        assert!(deadline.is_some());
    }
}

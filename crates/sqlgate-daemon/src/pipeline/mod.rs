//! The `/query` processing pipeline.
//!
//! Stages run in a fixed order composed once at startup: recovery,
//! authorization, expiration, audit capture, timeout, then the terminal
//! query executor. Each stage either short-circuits with a response or
//! hands an updated [`QueryContext`] to the rest of the chain.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::response::Response;
use bytes::Bytes;

pub mod audit;
pub mod authorization;
pub mod expiration;
pub mod recovery;
pub mod timeout;

pub use audit::AuditCapture;
pub use authorization::Authorization;
pub use expiration::Expiration;
pub use recovery::{ConnectionAbort, Recovery};
pub use timeout::Timeout;

pub const FORWARDED_USER_HEADER: &str = "x-forwarded-user";

/// Per-request state threaded through the stage chain. Stages own the
/// context and pass it on, filling in what they resolved.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub headers: HeaderMap,
    pub body: Bytes,
    pub base64_query: bool,
    pub base64_results: bool,
    /// Identity resolved by the authorization stage.
    pub user: Option<String>,
    /// Query text resolved by the audit stage.
    pub query: Option<String>,
    /// Absolute deadline stamped by the timeout stage. The executor keeps
    /// honoring it while streaming rows, after the response headers are
    /// already out.
    pub deadline: Option<tokio::time::Instant>,
}

impl QueryContext {
    pub fn new(headers: HeaderMap, body: Bytes) -> Self {
        Self {
            headers,
            body,
            base64_query: false,
            base64_results: false,
            user: None,
            query: None,
            deadline: None,
        }
    }
}

/// One link in the chain. Implementations call `next.run(ctx)` to continue
/// or return a response of their own to short-circuit.
#[async_trait]
pub trait Stage: Send + Sync {
    async fn handle(&self, ctx: QueryContext, next: Next<'_>) -> Response;
}

/// The terminal request handler sitting past the last stage.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, ctx: QueryContext) -> Response;
}

/// The remainder of the chain, handed to each stage.
pub struct Next<'a> {
    stages: &'a [Arc<dyn Stage>],
    terminal: &'a dyn Handler,
}

impl Next<'_> {
    pub async fn run(self, ctx: QueryContext) -> Response {
        match self.stages.split_first() {
            Some((stage, rest)) => {
                let next = Next {
                    stages: rest,
                    terminal: self.terminal,
                };
                stage.handle(ctx, next).await
            }
            None => self.terminal.call(ctx).await,
        }
    }
}

pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    terminal: Arc<dyn Handler>,
}

impl Pipeline {
    pub fn new(stages: Vec<Arc<dyn Stage>>, terminal: Arc<dyn Handler>) -> Self {
        Self { stages, terminal }
    }

    pub async fn dispatch(&self, ctx: QueryContext) -> Response {
        let next = Next {
            stages: &self.stages,
            terminal: self.terminal.as_ref(),
        };
        next.run(ctx).await
    }
}

/// Query-parameter flag grammar carried over from the legacy gateway:
/// the accepted true spellings of Go's `strconv.ParseBool`.
pub fn parse_flag(raw: Option<&str>) -> bool {
    matches!(raw, Some("1" | "t" | "T" | "true" | "TRUE" | "True"))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    use super::*;

    /// Terminal that records how often it ran and with which context.
    #[derive(Default)]
    pub struct RecordingHandler {
        pub calls: AtomicUsize,
        pub last_user: Mutex<Option<String>>,
        pub last_query: Mutex<Option<String>>,
        pub last_deadline: Mutex<Option<tokio::time::Instant>>,
    }

    #[async_trait]
    impl Handler for RecordingHandler {
        async fn call(&self, ctx: QueryContext) -> Response {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_user.lock().unwrap() = ctx.user;
            *self.last_query.lock().unwrap() = ctx.query;
            *self.last_deadline.lock().unwrap() = ctx.deadline;
            (StatusCode::OK, "ok").into_response()
        }
    }

    /// Runs a single stage in front of a recording terminal.
    pub async fn run_stage(
        stage: Arc<dyn Stage>,
        ctx: QueryContext,
    ) -> (Response, Arc<RecordingHandler>) {
        let terminal = Arc::new(RecordingHandler::default());
        let pipeline = Pipeline::new(vec![stage], terminal.clone());
        (pipeline.dispatch(ctx).await, terminal)
    }

    pub fn context_with_user(user: &str) -> QueryContext {
        let mut headers = HeaderMap::new();
        headers.insert(FORWARDED_USER_HEADER, user.parse().unwrap());
        QueryContext::new(headers, Bytes::new())
    }

    pub async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }
}

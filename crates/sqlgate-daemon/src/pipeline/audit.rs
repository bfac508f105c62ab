//! Audit stage: no query executes unless its record reached the remote
//! collector. The local log sink is best effort.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use sqlgate_core::{AuditEntry, AuditSink, LogAudit};
use tracing::{debug, error, warn};

use super::{Next, QueryContext, Stage, FORWARDED_USER_HEADER};
use crate::models::QueryRequest;

pub struct AuditCapture {
    local: LogAudit,
    remote: Arc<dyn AuditSink>,
}

impl AuditCapture {
    pub fn new(remote: Arc<dyn AuditSink>) -> Self {
        Self {
            local: LogAudit,
            remote,
        }
    }
}

#[async_trait]
impl Stage for AuditCapture {
    async fn handle(&self, mut ctx: QueryContext, next: Next<'_>) -> Response {
        let timestamp = Utc::now().timestamp();

        if !ctx.headers.contains_key(header::CONTENT_LENGTH) {
            return (
                StatusCode::BAD_REQUEST,
                "Request without required header: Content-Length",
            )
                .into_response();
        }

        let user = match resolve_user(&ctx) {
            Some(user) => user,
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    "Request without required header: X-Forwarded-User",
                )
                    .into_response()
            }
        };

        // An unparsable body is not audited here; the executor produces the
        // client-facing error for it.
        let request: QueryRequest = match serde_json::from_slice(&ctx.body) {
            Ok(request) => request,
            Err(error) => {
                debug!(%error, "request body is not a query; skipping audit");
                return next.run(ctx).await;
            }
        };

        let query = if ctx.base64_query {
            match decode_query(&request.query) {
                Some(query) => query,
                None => {
                    return (
                        StatusCode::BAD_REQUEST,
                        "Unable to decode Base64-encoded query",
                    )
                        .into_response()
                }
            }
        } else {
            request.query
        };

        let entry = AuditEntry {
            query: query.clone(),
            user,
            timestamp,
        };

        if let Err(error) = self.local.write(&entry).await {
            warn!(%error, "local audit write failed");
        }

        if let Err(error) = self.remote.write(&entry).await {
            error!(%error, "remote audit write failed; refusing to run query");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "An internal error has occurred",
            )
                .into_response();
        }

        ctx.query = Some(query);
        next.run(ctx).await
    }
}

fn resolve_user(ctx: &QueryContext) -> Option<String> {
    if let Some(user) = &ctx.user {
        return Some(user.clone());
    }
    ctx.headers
        .get(FORWARDED_USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|user| !user.is_empty())
        .map(str::to_owned)
}

fn decode_query(encoded: &str) -> Option<String> {
    let bytes = STANDARD.decode(encoded.trim()).ok()?;
    String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    use axum::http::HeaderMap;
    use bytes::Bytes;
    use sqlgate_core::AuditError;

    use super::super::testing::{body_text, run_stage};
    use super::*;

    /// In-memory stand-in for the collector sink.
    #[derive(Default)]
    struct StubSink {
        entries: Mutex<Vec<AuditEntry>>,
        fail: bool,
    }

    impl StubSink {
        fn failing() -> Self {
            Self {
                entries: Mutex::new(Vec::new()),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl AuditSink for StubSink {
        async fn write(&self, entry: &AuditEntry) -> Result<(), AuditError> {
            if self.fail {
                return Err(AuditError::Rejected {
                    code: 4,
                    text: "Invalid token".to_owned(),
                });
            }
            self.entries.lock().unwrap().push(entry.clone());
            Ok(())
        }
    }

    fn ctx(body: &str) -> QueryContext {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, body.len().to_string().parse().unwrap());
        let mut ctx = QueryContext::new(headers, Bytes::copy_from_slice(body.as_bytes()));
        ctx.user = Some("alice".to_owned());
        ctx
    }

    #[tokio::test]
    async fn audits_and_forwards_the_query() {
        let sink = Arc::new(StubSink::default());
        let stage = Arc::new(AuditCapture::new(sink.clone()));

        let (response, terminal) = run_stage(stage, ctx(r#"{"query":"select 1;"}"#)).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(terminal.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            terminal.last_query.lock().unwrap().as_deref(),
            Some("select 1;")
        );

        let entries = sink.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].query, "select 1;");
        assert_eq!(entries[0].user, "alice");
        assert!(entries[0].timestamp > 0);
    }

    #[tokio::test]
    async fn missing_content_length_is_rejected_before_auditing() {
        let sink = Arc::new(StubSink::default());
        let stage = Arc::new(AuditCapture::new(sink.clone()));

        let mut ctx = QueryContext::new(HeaderMap::new(), Bytes::from_static(b"{}"));
        ctx.user = Some("alice".to_owned());
        let (response, terminal) = run_stage(stage, ctx).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_text(response).await,
            "Request without required header: Content-Length"
        );
        assert_eq!(terminal.calls.load(Ordering::SeqCst), 0);
        assert!(sink.entries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn remote_failure_blocks_the_query() {
        let sink = Arc::new(StubSink::failing());
        let stage = Arc::new(AuditCapture::new(sink));

        let (response, terminal) = run_stage(stage, ctx(r#"{"query":"select 1;"}"#)).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_text(response).await, "An internal error has occurred");
        assert_eq!(terminal.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn base64_query_is_decoded_before_auditing() {
        let sink = Arc::new(StubSink::default());
        let stage = Arc::new(AuditCapture::new(sink.clone()));

        let encoded = STANDARD.encode("select 2;");
        let mut ctx = ctx(&format!(r#"{{"query":"{encoded}"}}"#));
        ctx.base64_query = true;
        let (response, terminal) = run_stage(stage, ctx).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            terminal.last_query.lock().unwrap().as_deref(),
            Some("select 2;")
        );
        assert_eq!(sink.entries.lock().unwrap()[0].query, "select 2;");
    }

    #[tokio::test]
    async fn undecodable_base64_query_is_rejected() {
        let sink = Arc::new(StubSink::default());
        let stage = Arc::new(AuditCapture::new(sink.clone()));

        let mut ctx = ctx(r#"{"query":"not base64!"}"#);
        ctx.base64_query = true;
        let (response, terminal) = run_stage(stage, ctx).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_text(response).await,
            "Unable to decode Base64-encoded query"
        );
        assert_eq!(terminal.calls.load(Ordering::SeqCst), 0);
        assert!(sink.entries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unparsable_body_passes_through_unaudited() {
        let sink = Arc::new(StubSink::default());
        let stage = Arc::new(AuditCapture::new(sink.clone()));

        let (response, terminal) = run_stage(stage, ctx("not json")).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(terminal.calls.load(Ordering::SeqCst), 1);
        assert!(sink.entries.lock().unwrap().is_empty());
    }
}

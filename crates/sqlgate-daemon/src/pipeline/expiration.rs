//! Expiration stage: instances are provisioned with a shutdown date and
//! refuse queries past it.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use sqlgate_core::UserAccess;
use tracing::warn;

use super::{Next, QueryContext, Stage};

pub struct Expiration {
    access: Arc<UserAccess>,
}

impl Expiration {
    pub fn new(access: Arc<UserAccess>) -> Self {
        Self { access }
    }
}

#[async_trait]
impl Stage for Expiration {
    async fn handle(&self, ctx: QueryContext, next: Next<'_>) -> Response {
        if self.access.is_expired() {
            warn!(expiration = ?self.access.expiration(), "rejected request: instance has expired");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                "The service instance has expired",
            )
                .into_response();
        }
        next.run(ctx).await
    }
}

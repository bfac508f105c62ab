//! Identity stage: the gateway trusts the `X-Forwarded-User` header set by
//! the fronting proxy and checks it against the configured user set.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use sqlgate_core::UserAccess;
use tracing::warn;

use super::{Next, QueryContext, Stage, FORWARDED_USER_HEADER};

pub struct Authorization {
    access: Arc<UserAccess>,
}

impl Authorization {
    pub fn new(access: Arc<UserAccess>) -> Self {
        Self { access }
    }
}

#[async_trait]
impl Stage for Authorization {
    async fn handle(&self, mut ctx: QueryContext, next: Next<'_>) -> Response {
        let user = match ctx
            .headers
            .get(FORWARDED_USER_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            Some(user) if !user.is_empty() => user.to_owned(),
            _ => {
                return (
                    StatusCode::BAD_REQUEST,
                    "Request without required header: X-Forwarded-User",
                )
                    .into_response()
            }
        };

        if self.access.users().is_empty() {
            warn!(%user, "rejected request: no users are authorized");
            return (StatusCode::UNAUTHORIZED, "Request cannot be authorized").into_response();
        }

        if !self.access.contains(&user) {
            warn!(%user, "rejected request: user is not authorized");
            return (
                StatusCode::FORBIDDEN,
                "User does not have required permissions",
            )
                .into_response();
        }

        ctx.user = Some(user);
        next.run(ctx).await
    }
}

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use sqlgate_core::{
    AuditSink, DatabaseConfig, DatabaseTarget, SplunkAudit, SplunkConfig, UserAccess,
};

use crate::config::AppConfig;
use crate::models::{DbNameResponse, SwitchDbNameRequest};
use crate::pipeline::{
    parse_flag, AuditCapture, Authorization, Expiration, Pipeline, QueryContext, Recovery, Timeout,
};
use crate::query::QueryExecutor;

const DRIFT_WARNING: &str = "Current database differs from the default";

pub struct AppState {
    pub pipeline: Pipeline,
    pub target: Arc<DatabaseTarget>,
}

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;

    let db_config = DatabaseConfig::from_env().context("loading database configuration")?;
    info!(driver = %db_config.driver, host = %db_config.host, db_name = %db_config.name,
        allow_write = db_config.allow_write, "database target configured");

    let target = Arc::new(
        DatabaseTarget::connect(db_config)
            .await
            .context("failed to open database")?,
    );

    let access = Arc::new(UserAccess::from_env().context("loading user configuration")?);
    if access.is_deprecated() {
        warn!("no expiration date configured; running in deprecated legacy mode");
    }
    info!(users = access.users().len(), expiration = ?access.expiration(), "user access configured");

    let splunk = SplunkConfig::from_env().context("loading Splunk configuration")?;
    let remote = Arc::new(SplunkAudit::new(splunk).context("building Splunk audit client")?);

    let pipeline = build_pipeline(access, remote, target.clone(), config.request_timeout);
    let state = Arc::new(AppState { pipeline, target });

    let app = build_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;

    info!(addr = %config.listen_addr, "sqlgate-daemon listening");
    axum::serve(listener, app)
        .await
        .context("HTTP server exited")?;
    Ok(())
}

pub fn build_pipeline(
    access: Arc<UserAccess>,
    remote: Arc<dyn AuditSink>,
    target: Arc<DatabaseTarget>,
    request_timeout: Duration,
) -> Pipeline {
    Pipeline::new(
        vec![
            Arc::new(Recovery),
            Arc::new(Authorization::new(access.clone())),
            Arc::new(Expiration::new(access)),
            Arc::new(AuditCapture::new(remote)),
            Arc::new(Timeout::new(request_timeout)),
        ],
        Arc::new(QueryExecutor::new(target)),
    )
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/query", post(query))
        .route("/dbname", get(get_dbname))
        .route("/dbname/switch", post(switch_dbname))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct QueryFlags {
    #[serde(default)]
    base64_query: Option<String>,
    #[serde(default)]
    base64_results: Option<String>,
}

/// The only route wired through the stage pipeline.
async fn query(
    State(state): State<Arc<AppState>>,
    Query(flags): Query<QueryFlags>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut ctx = QueryContext::new(headers, body);
    ctx.base64_query = parse_flag(flags.base64_query.as_deref());
    ctx.base64_results = parse_flag(flags.base64_results.as_deref());
    state.pipeline.dispatch(ctx).await
}

async fn healthcheck(State(state): State<Arc<AppState>>) -> Response {
    let current = state.target.current_name().await;
    drift_warnings(&state.target, &current);

    match state.target.ping().await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "OK"}))).into_response(),
        Err(err) => {
            error!(error = %err, "healthcheck could not reach the database");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "Service Unavailable",
                    "errors": {
                        "database": "failed to connect to the database... see the gateway logs for further details"
                    },
                })),
            )
                .into_response()
        }
    }
}

async fn get_dbname(State(state): State<Arc<AppState>>) -> Json<DbNameResponse> {
    let current = state.target.current_name().await;
    let warnings = drift_warnings(&state.target, &current);
    Json(DbNameResponse {
        db_name: current,
        warnings,
    })
}

/// Validate-then-commit: a failed switch leaves the previous target
/// serving, and the response always carries whichever name is active
/// after the attempt.
async fn switch_dbname(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request: SwitchDbNameRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            debug!(error = %err, "malformed switch payload");
            return (StatusCode::BAD_REQUEST, "Invalid request payload").into_response();
        }
    };

    if let Err(err) = state.target.switch(&request.db_name).await {
        error!(error = %err, db_name = %request.db_name, "database switch failed; keeping current target");
    }

    Json(DbNameResponse {
        db_name: state.target.current_name().await,
        warnings: Vec::new(),
    })
    .into_response()
}

fn drift_warnings(target: &DatabaseTarget, current: &str) -> Vec<String> {
    if current != target.default_name() {
        warn!(current = %current, default = %target.default_name(), "{DRIFT_WARNING}");
        vec![DRIFT_WARNING.to_owned()]
    } else {
        Vec::new()
    }
}

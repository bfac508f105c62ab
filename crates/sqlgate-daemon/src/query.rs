//! Terminal pipeline handler: runs the query inside a read-only (by
//! default) transaction and streams the result set row by row.
//!
//! A spawned task owns the database connection for the whole exchange. It
//! reports readiness (or an error) once over a oneshot channel before any
//! response byte exists, then feeds encoded chunks through a bounded
//! channel backing the response body. Errors after the first chunk can
//! only truncate the body: the commit runs before the closing marker, so
//! a client that received the full frame knows the transaction committed.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt, TryStreamExt};
use sqlx::database::HasStatement;
use sqlx::pool::PoolConnection;
use sqlx::{
    Column, ColumnIndex, Database, Decode, Executor, Pool, Row, Statement, Type, TypeInfo,
    ValueRef,
};
use tokio::time::Instant;
use tracing::{error, warn};

use crate::models::{QueryRequest, QueryResponse};
use crate::pipeline::{Handler, QueryContext};
use sqlgate_core::{DatabaseTarget, TargetPool};

const CHUNK_BUFFER: usize = 16;

pub struct QueryExecutor {
    target: Arc<DatabaseTarget>,
}

impl QueryExecutor {
    pub fn new(target: Arc<DatabaseTarget>) -> Self {
        Self { target }
    }
}

#[async_trait]
impl Handler for QueryExecutor {
    async fn call(&self, ctx: QueryContext) -> Response {
        let query = match resolve_query(&ctx) {
            Ok(query) => query,
            Err(response) => return response,
        };

        let config = self.target.config();
        let begin = config.driver.begin_statement(!config.allow_write);

        let (init_tx, init_rx) = tokio::sync::oneshot::channel();
        let (chunk_tx, chunk_rx) = mpsc::channel::<Bytes>(CHUNK_BUFFER);

        match self.target.pool().await {
            TargetPool::MySql(pool) => {
                tokio::spawn(stream_rows::<sqlx::MySql>(
                    pool,
                    begin,
                    query,
                    ctx.base64_results,
                    ctx.deadline,
                    init_tx,
                    chunk_tx,
                ));
            }
            TargetPool::Postgres(pool) => {
                tokio::spawn(stream_rows::<sqlx::Postgres>(
                    pool,
                    begin,
                    query,
                    ctx.base64_results,
                    ctx.deadline,
                    init_tx,
                    chunk_tx,
                ));
            }
        }

        match init_rx.await {
            Ok(Ok(())) => {
                let body = Body::from_stream(chunk_rx.map(Ok::<_, Infallible>));
                (
                    StatusCode::OK,
                    [
                        (header::CONTENT_TYPE, "application/json; charset=utf-8"),
                        (header::CACHE_CONTROL, "private, no-store"),
                    ],
                    body,
                )
                    .into_response()
            }
            Ok(Err(error)) => query_error_response(&error),
            Err(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "An internal error has occurred",
            )
                .into_response(),
        }
    }
}

/// Query text for this request: what the audit stage resolved, or the raw
/// body when the request reached us unaudited. An empty query string is
/// handed to the driver as-is; only an empty request body is rejected.
fn resolve_query(ctx: &QueryContext) -> Result<String, Response> {
    match &ctx.query {
        Some(query) => Ok(query.clone()),
        None => {
            if ctx.body.is_empty() {
                return Err(
                    (StatusCode::BAD_REQUEST, "Request body cannot be empty").into_response()
                );
            }
            let request: QueryRequest = serde_json::from_slice(&ctx.body)
                .map_err(|error| query_error_body(StatusCode::BAD_REQUEST, &error.to_string()))?;
            if ctx.base64_query {
                decode_base64_query(&request.query)
            } else {
                Ok(request.query)
            }
        }
    }
}

fn decode_base64_query(encoded: &str) -> Result<String, Response> {
    let rejected = || {
        (
            StatusCode::BAD_REQUEST,
            "Unable to decode Base64-encoded query",
        )
            .into_response()
    };
    let bytes = STANDARD.decode(encoded.trim()).map_err(|_| rejected())?;
    String::from_utf8(bytes).map_err(|_| rejected())
}

enum StreamEnd {
    /// Every row was sent; commit and close the frame.
    Done,
    /// Row error, a dropped receiver, or a passed deadline; roll back and
    /// leave the body truncated.
    Abort,
}

/// Races the given future against the request deadline, if one was set.
async fn until_deadline<T>(deadline: Option<Instant>, work: impl Future<Output = T>) -> Option<T> {
    match deadline {
        Some(at) => tokio::time::timeout_at(at, work).await.ok(),
        None => Some(work.await),
    }
}

async fn stream_rows<DB>(
    pool: Pool<DB>,
    begin: &'static str,
    query: String,
    base64_results: bool,
    deadline: Option<Instant>,
    init_tx: tokio::sync::oneshot::Sender<Result<(), sqlx::Error>>,
    mut chunk_tx: mpsc::Sender<Bytes>,
) where
    DB: Database,
    for<'c> &'c mut DB::Connection: Executor<'c, Database = DB>,
    for<'q> <DB as HasStatement<'q>>::Statement: Statement<'q, Database = DB>,
    usize: ColumnIndex<DB::Row>,
    String: Type<DB> + for<'r> Decode<'r, DB>,
    Vec<u8>: Type<DB> + for<'r> Decode<'r, DB>,
    bool: Type<DB> + for<'r> Decode<'r, DB>,
{
    let mut conn = match pool.acquire().await {
        Ok(conn) => conn,
        Err(error) => {
            let _ = init_tx.send(Err(error));
            return;
        }
    };

    if let Err(error) = (&mut *conn).execute(begin).await {
        let _ = init_tx.send(Err(error));
        return;
    }

    let columns: Vec<String> = match (&mut *conn).prepare(query.as_str()).await {
        Ok(statement) => statement
            .columns()
            .iter()
            .map(|column| column.name().to_owned())
            .collect(),
        Err(error) => {
            roll_back(&mut conn).await;
            let _ = init_tx.send(Err(error));
            return;
        }
    };

    let finished = {
        // Executing the raw string takes the unprepared path: the server
        // returns every column in its text representation, whatever the
        // column type.
        let mut rows = (&mut *conn).fetch(query.as_str());

        // Pull the first row before committing to a 200: execution-time
        // errors (a write under a read-only transaction, for one) must
        // still produce a whole error response.
        let first = match until_deadline(deadline, rows.try_next()).await {
            Some(Ok(first)) => first,
            Some(Err(error)) => {
                drop(rows);
                roll_back(&mut conn).await;
                let _ = init_tx.send(Err(error));
                return;
            }
            None => {
                // The timeout stage already answered 503.
                drop(rows);
                roll_back(&mut conn).await;
                return;
            }
        };

        let _ = init_tx.send(Ok(()));

        pump_rows::<DB>(
            &mut chunk_tx,
            &columns,
            first,
            &mut rows,
            base64_results,
            deadline,
        )
        .await
    };

    match finished {
        StreamEnd::Done => {
            if let Err(error) = (&mut *conn).execute("COMMIT").await {
                error!(%error, "commit failed; truncating response");
                return;
            }
            let _ = chunk_tx.send(Bytes::from_static(b"],\"error\":\"\"}")).await;
        }
        StreamEnd::Abort => {
            // Close the body first so the client sees the truncation
            // without waiting on the rollback.
            drop(chunk_tx);
            roll_back(&mut conn).await;
        }
    }
}

async fn pump_rows<DB>(
    chunk_tx: &mut mpsc::Sender<Bytes>,
    columns: &[String],
    first: Option<DB::Row>,
    rows: &mut BoxStream<'_, Result<DB::Row, sqlx::Error>>,
    base64_results: bool,
    deadline: Option<Instant>,
) -> StreamEnd
where
    DB: Database,
    usize: ColumnIndex<DB::Row>,
    String: Type<DB> + for<'r> Decode<'r, DB>,
    Vec<u8>: Type<DB> + for<'r> Decode<'r, DB>,
    bool: Type<DB> + for<'r> Decode<'r, DB>,
{
    let header = match serde_json::to_string(columns) {
        Ok(json) => format!("{{\"result\":[{json}\n"),
        Err(error) => {
            error!(%error, "unable to encode column names");
            return StreamEnd::Abort;
        }
    };
    if chunk_tx.send(Bytes::from(header)).await.is_err() {
        return StreamEnd::Abort;
    }

    let mut current = match first {
        Some(row) => row,
        None => return StreamEnd::Done,
    };

    loop {
        let encoded = match encode_row::<DB>(&current, base64_results) {
            Ok(encoded) => encoded,
            Err(error) => {
                error!(%error, "row decode failed; truncating response");
                return StreamEnd::Abort;
            }
        };
        match until_deadline(deadline, chunk_tx.send(Bytes::from(format!(",{encoded}\n")))).await {
            Some(Ok(())) => {}
            Some(Err(_)) => return StreamEnd::Abort,
            None => {
                warn!("request deadline passed mid-stream; truncating response");
                return StreamEnd::Abort;
            }
        }

        match until_deadline(deadline, rows.try_next()).await {
            Some(Ok(Some(row))) => current = row,
            Some(Ok(None)) => return StreamEnd::Done,
            Some(Err(error)) => {
                error!(%error, "row scan failed; truncating response");
                return StreamEnd::Abort;
            }
            None => {
                warn!("request deadline passed mid-stream; truncating response");
                return StreamEnd::Abort;
            }
        }
    }
}

async fn roll_back<DB>(conn: &mut PoolConnection<DB>)
where
    DB: Database,
    for<'c> &'c mut DB::Connection: Executor<'c, Database = DB>,
{
    if let Err(error) = (&mut **conn).execute("ROLLBACK").await {
        warn!(%error, "rollback failed");
    }
}

fn encode_row<DB>(row: &DB::Row, base64_results: bool) -> Result<String, sqlx::Error>
where
    DB: Database,
    usize: ColumnIndex<DB::Row>,
    String: Type<DB> + for<'r> Decode<'r, DB>,
    Vec<u8>: Type<DB> + for<'r> Decode<'r, DB>,
    bool: Type<DB> + for<'r> Decode<'r, DB>,
{
    let mut cells = Vec::with_capacity(row.len());
    for index in 0..row.len() {
        cells.push(cell_text::<DB>(row, index)?);
    }
    encode_json_row(&encode_cells(cells, base64_results))
}

/// Stringifies one cell from its wire text. NULLs become empty strings,
/// the contract the legacy clients rely on; booleans normalize to
/// `true`/`false`; binary columns pass through as lossy UTF-8. Everything
/// else (numerics, timestamps, uuids, arrays) keeps the server's text
/// rendering.
fn cell_text<DB>(row: &DB::Row, index: usize) -> Result<String, sqlx::Error>
where
    DB: Database,
    usize: ColumnIndex<DB::Row>,
    String: Type<DB> + for<'r> Decode<'r, DB>,
    Vec<u8>: Type<DB> + for<'r> Decode<'r, DB>,
    bool: Type<DB> + for<'r> Decode<'r, DB>,
{
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(String::new());
    }
    let type_name = raw.type_info().name().to_uppercase();

    let text = match type_name.as_str() {
        "BOOL" | "BOOLEAN" => row.try_get_unchecked::<bool, _>(index)?.to_string(),
        "BYTEA" | "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BINARY" | "VARBINARY" => {
            String::from_utf8_lossy(&row.try_get_unchecked::<Vec<u8>, _>(index)?).into_owned()
        }
        _ => row.try_get_unchecked::<String, _>(index)?,
    };
    Ok(text)
}

fn encode_cells(cells: Vec<String>, base64_results: bool) -> Vec<String> {
    if !base64_results {
        return cells;
    }
    cells.into_iter().map(|cell| STANDARD.encode(cell)).collect()
}

fn encode_json_row(cells: &[String]) -> Result<String, sqlx::Error> {
    serde_json::to_string(cells).map_err(|error| sqlx::Error::Decode(Box::new(error)))
}

/// Failures that look like reachability problems must not leak connection
/// details (the DSN carries credentials); everything else surfaces the
/// driver's message in a structured error body.
fn query_error_response(error: &sqlx::Error) -> Response {
    if is_connection_error(error) {
        warn!(%error, "database connection failed");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "Unable to connect to the database",
        )
            .into_response();
    }
    query_error_body(StatusCode::BAD_REQUEST, &error.to_string())
}

fn query_error_body(status: StatusCode, message: &str) -> Response {
    let body = serde_json::to_string(&QueryResponse {
        result: None,
        error: message.to_owned(),
    })
    .unwrap_or_else(|_| r#"{"result":null,"error":"An internal error has occurred"}"#.to_owned());
    (
        status,
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        body,
    )
        .into_response()
}

fn is_connection_error(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Configuration(_)
    )
}

//! HTTP request handlers for the log API.

use std::collections::HashSet;
use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Response};
use futures::stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use kubestream_logs::{
    LiveMultiplexer, LogRecord, LogSource, MembershipTracker, RangeQuery, RangeSearcher,
    SourceDescriptor, SourceKey, SourcePredicate,
};

use crate::error::ApiResult;
use crate::params::LogQuery;
use crate::sse::event_stream;
use crate::state::AppState;

/// Content type of historical responses, one record per line
pub const NDJSON: &str = "application/x-jsonl; charset=UTF-8";

/// Session events (or history records) buffered toward the client
const EVENT_BUFFER: usize = 64;

type Pairs = Query<Vec<(String, String)>>;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Handle GET /api/health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Handle GET /api/hosts/{host}/containers/{id}/logs
pub async fn fetch_logs_between<S>(
    State(state): State<AppState<S>>,
    Path((host, id)): Path<(String, String)>,
    Query(pairs): Pairs,
) -> ApiResult<Response>
where
    S: LogSource + MembershipTracker,
{
    let capacity = state.settings.buffer_capacity;
    let query = LogQuery::from_pairs(pairs).range_query(capacity)?;

    let descriptor = state.sources.find(&host, &id).await?;
    let searcher = RangeSearcher::new(&*state.sources, &descriptor).with_capacity(capacity);
    if query.everything {
        searcher.validate(&query)?;
        return Ok(stream_history(&state, descriptor, query));
    }

    let result = searcher.search(&query).await?;
    let mut body = Vec::new();
    for record in &result.records {
        body.extend(ndjson_line(record)?);
    }

    Ok(([(header::CONTENT_TYPE, NDJSON)], body).into_response())
}

/// Answer an everything query with records written as they are read
fn stream_history<S>(
    state: &AppState<S>,
    descriptor: SourceDescriptor,
    query: RangeQuery,
) -> Response
where
    S: LogSource + MembershipTracker,
{
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let sources = Arc::clone(&state.sources);
    let capacity = state.settings.buffer_capacity;

    tokio::spawn(async move {
        let searcher = RangeSearcher::new(&*sources, &descriptor).with_capacity(capacity);
        if let Err(err) = searcher.send_everything(&query, tx).await {
            error!(source = %descriptor.key(), error = %err, "error while streaming logs");
        }
    });

    let lines = stream::unfold(rx, |mut rx| async move {
        let record = rx.recv().await?;
        Some((ndjson_line(&record), rx))
    });
    ([(header::CONTENT_TYPE, NDJSON)], Body::from_stream(lines)).into_response()
}

fn ndjson_line(record: &LogRecord) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    Ok(line)
}

/// Handle GET /api/hosts/{host}/containers/{id}/logs/stream
pub async fn stream_container_logs<S>(
    State(state): State<AppState<S>>,
    Path((host, id)): Path<(String, String)>,
    Query(pairs): Pairs,
) -> ApiResult<Response>
where
    S: LogSource + MembershipTracker,
{
    stream_logs(state, SourcePredicate::Id(SourceKey::new(host, id)), pairs)
}

/// Handle GET /api/hosts/{host}/logs/mergedStream/{ids}
pub async fn stream_merged_logs<S>(
    State(state): State<AppState<S>>,
    Path((host, ids)): Path<(String, String)>,
    Query(pairs): Pairs,
) -> ApiResult<Response>
where
    S: LogSource + MembershipTracker,
{
    let ids: HashSet<String> = ids
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect();
    stream_logs(state, SourcePredicate::Ids { host, ids }, pairs)
}

/// Handle GET /api/services/{service}/logs/stream
pub async fn stream_service_logs<S>(
    State(state): State<AppState<S>>,
    Path(service): Path<String>,
    Query(pairs): Pairs,
) -> ApiResult<Response>
where
    S: LogSource + MembershipTracker,
{
    stream_logs(state, SourcePredicate::Service(service), pairs)
}

/// Handle GET /api/groups/{group}/logs/stream
pub async fn stream_group_logs<S>(
    State(state): State<AppState<S>>,
    Path(group): Path<String>,
    Query(pairs): Pairs,
) -> ApiResult<Response>
where
    S: LogSource + MembershipTracker,
{
    stream_logs(state, SourcePredicate::Group(group), pairs)
}

/// Handle GET /api/stacks/{stack}/logs/stream
pub async fn stream_stack_logs<S>(
    State(state): State<AppState<S>>,
    Path(stack): Path<String>,
    Query(pairs): Pairs,
) -> ApiResult<Response>
where
    S: LogSource + MembershipTracker,
{
    stream_logs(state, SourcePredicate::Stack(stack), pairs)
}

/// Start a live session and answer with its event stream
///
/// The session runs in its own task and ends when the response body is
/// dropped.
fn stream_logs<S>(
    state: AppState<S>,
    predicate: SourcePredicate,
    pairs: Vec<(String, String)>,
) -> ApiResult<Response>
where
    S: LogSource + MembershipTracker,
{
    let options = LogQuery::from_pairs(pairs).session_options(&state.settings)?;
    let multiplexer = LiveMultiplexer::new(Arc::clone(&state.sources), predicate, options);
    multiplexer.validate()?;

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    tokio::spawn(async move {
        match multiplexer.run(tx, cancel).await {
            Ok(summary) => debug!(records = summary.records, "client went away"),
            Err(err) => error!(error = %err, "live session failed"),
        }
    });

    Ok(Sse::new(event_stream(rx, guard)).into_response())
}

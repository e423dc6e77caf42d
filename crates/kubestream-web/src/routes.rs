//! Route configuration for the log API.

use axum::Router;
use axum::routing::get;
use tower_http::trace::TraceLayer;

use kubestream_logs::{LogSource, MembershipTracker};

use crate::handlers::{
    fetch_logs_between, health_check, stream_container_logs, stream_group_logs,
    stream_merged_logs, stream_service_logs, stream_stack_logs,
};
use crate::state::AppState;

/// Create the API router.
pub fn create_router<S>(state: AppState<S>) -> Router
where
    S: LogSource + MembershipTracker,
{
    let api_routes = Router::new()
        .route("/health", get(health_check))
        // Historical range
        .route("/hosts/{host}/containers/{id}/logs", get(fetch_logs_between::<S>))
        // Live sessions
        .route(
            "/hosts/{host}/containers/{id}/logs/stream",
            get(stream_container_logs::<S>),
        )
        .route(
            "/hosts/{host}/logs/mergedStream/{ids}",
            get(stream_merged_logs::<S>),
        )
        .route("/services/{service}/logs/stream", get(stream_service_logs::<S>))
        .route("/groups/{group}/logs/stream", get(stream_group_logs::<S>))
        .route("/stacks/{stack}/logs/stream", get(stream_stack_logs::<S>));

    Router::new()
        .nest("/api", api_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use chrono::{TimeDelta, Utc};
    use http_body_util::BodyExt;
    use kubestream_logs::memory::MemorySources;
    use kubestream_logs::{LogRecord, SourceDescriptor, SourceKey};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    use crate::handlers::NDJSON;
    use crate::state::StreamSettings;

    const WAIT: Duration = Duration::from_secs(2);

    fn make_test_state() -> (Arc<MemorySources>, AppState<MemorySources>) {
        let sources = Arc::new(MemorySources::new());
        let settings = StreamSettings {
            heartbeat: Duration::from_secs(3600),
            ..Default::default()
        };
        (Arc::clone(&sources), AppState::new(sources, settings))
    }

    /// A source created a minute ago with one record per second over its last 10 seconds
    fn seed(sources: &MemorySources) -> SourceKey {
        let now = Utc::now();
        let descriptor = SourceDescriptor::new("local", "api", now - TimeDelta::seconds(60));
        let key = descriptor.key();
        sources.insert(descriptor);
        sources.extend_history(
            &key,
            (1..=10).map(|i| {
                let level = if i % 2 == 0 { "error" } else { "info" };
                let at = now - TimeDelta::seconds(11 - i as i64);
                LogRecord::text(&key, i, at, level, format!("request {}", i))
            }),
        );
        key
    }

    async fn get(app: Router, uri: &str) -> axum::response::Response {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        app.oneshot(request).await.unwrap()
    }

    fn range_uri(query: &str) -> String {
        let to = Utc::now();
        let from = to - TimeDelta::seconds(30);
        format!(
            "/api/hosts/local/containers/api/logs?from={}&to={}&{}",
            from.format("%Y-%m-%dT%H:%M:%S%.fZ"),
            to.format("%Y-%m-%dT%H:%M:%S%.fZ"),
            query
        )
    }

    async fn ndjson_ids(response: axum::response::Response) -> Vec<u64> {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        std::str::from_utf8(&body)
            .unwrap()
            .lines()
            .map(|line| {
                let json: serde_json::Value = serde_json::from_str(line).unwrap();
                json["id"].as_u64().unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (_, state) = make_test_state();
        let response = get(create_router(state), "/api/health").await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_range_returns_ndjson() {
        let (sources, state) = make_test_state();
        seed(&sources);

        let response = get(
            create_router(state),
            &range_uri("stdout&levels=info&levels=error"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], NDJSON);
        assert_eq!(ndjson_ids(response).await, (1..=10).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_range_applies_levels_and_filter() {
        let (sources, state) = make_test_state();
        seed(&sources);

        let response = get(create_router(state.clone()), &range_uri("stdout&levels=error")).await;
        assert_eq!(ndjson_ids(response).await, vec![2, 4, 6, 8, 10]);

        let response = get(
            create_router(state.clone()),
            &range_uri("stdout&levels=info&levels=error&filter=request%201"),
        )
        .await;
        assert_eq!(ndjson_ids(response).await, vec![1, 10]);

        // No levels keeps nothing
        let response = get(create_router(state), &range_uri("stdout")).await;
        assert!(ndjson_ids(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_range_everything_streams_history() {
        let (sources, state) = make_test_state();
        seed(&sources);

        let response = get(
            create_router(state),
            "/api/hosts/local/containers/api/logs?stdout&everything",
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], NDJSON);
        assert_eq!(ndjson_ids(response).await, (1..=10).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_range_errors() {
        let (sources, state) = make_test_state();
        let key = seed(&sources);

        let cases = [
            (range_uri("levels=info"), StatusCode::BAD_REQUEST),
            (range_uri("stdout&minimum=501"), StatusCode::BAD_REQUEST),
            (range_uri("stdout&lastSeenId=abc"), StatusCode::BAD_REQUEST),
            (range_uri("stdout&filter=%28"), StatusCode::BAD_REQUEST),
            (
                "/api/hosts/local/containers/missing/logs?stdout&everything".to_string(),
                StatusCode::NOT_FOUND,
            ),
        ];
        for (uri, status) in cases {
            let response = get(create_router(state.clone()), &uri).await;
            assert_eq!(response.status(), status, "{}", uri);
        }

        sources.fail_queries(&key);
        let response = get(create_router(state), &range_uri("stdout&levels=info")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_stream_requires_selector() {
        let (sources, state) = make_test_state();
        seed(&sources);

        let response = get(
            create_router(state),
            "/api/hosts/local/containers/api/logs/stream?levels=info",
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    async fn next_frame(body: &mut Body) -> String {
        let frame = tokio::time::timeout(WAIT, body.frame())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .unwrap();
        String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_stream_sends_records() {
        let (sources, state) = make_test_state();
        let key = seed(&sources);

        let response = get(
            create_router(state),
            "/api/hosts/local/containers/api/logs/stream?stdout&levels=info",
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/event-stream")
        );

        let mut body = response.into_body();
        assert!(next_frame(&mut body).await.contains("ping"));

        tokio::time::timeout(WAIT, sources.wait_for_tails(&key, 1)).await.unwrap();
        sources.emit(LogRecord::text(&key, 42, Utc::now(), "error", "dropped"));
        sources.emit(LogRecord::text(&key, 43, Utc::now(), "info", "kept"));

        let frame = next_frame(&mut body).await;
        assert!(frame.starts_with("data: "), "{}", frame);
        assert!(frame.contains("\"id\":43"), "{}", frame);

        // Closing the response ends the session
        drop(body);
        tokio::time::timeout(WAIT, async {
            while sources.tail_count(&key) > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_filtered_stream_is_backfilled() {
        let (sources, state) = make_test_state();
        let key = seed(&sources);

        let response = get(
            create_router(state),
            "/api/hosts/local/containers/api/logs/stream?stdout&levels=info&filter=request",
        )
        .await;
        let mut body = response.into_body();

        let batch = loop {
            let frame = next_frame(&mut body).await;
            if let Some(rest) = frame.strip_prefix("event: logs-backfill\n") {
                break rest.to_string();
            }
            assert!(frame.contains("ping"), "{}", frame);
        };
        let data = batch.strip_prefix("data: ").unwrap().trim_end();
        let records: Vec<serde_json::Value> = serde_json::from_str(data).unwrap();
        assert!(!records.is_empty());
        for record in &records {
            assert_eq!(record["level"], "info");
            assert_eq!(record["id"].as_u64().unwrap() % 2, 1);
        }

        tokio::time::timeout(WAIT, sources.wait_for_tails(&key, 1)).await.unwrap();
        sources.emit(LogRecord::text(&key, 77, Utc::now(), "info", "request live"));
        let frame = loop {
            let frame = next_frame(&mut body).await;
            if frame.starts_with("data: ") {
                break frame;
            }
        };
        assert!(frame.contains("\"id\":77"), "{}", frame);
    }

    #[tokio::test]
    async fn test_stream_announces_stopped_source() {
        let (sources, state) = make_test_state();
        let key = seed(&sources);

        let response = get(
            create_router(state),
            "/api/hosts/local/logs/mergedStream/api,other?stdout&stderr",
        )
        .await;
        let mut body = response.into_body();
        assert!(next_frame(&mut body).await.contains("ping"));

        tokio::time::timeout(WAIT, sources.wait_for_tails(&key, 1)).await.unwrap();
        sources.stop(&key);

        let frame = next_frame(&mut body).await;
        assert!(frame.starts_with("event: container-event"), "{}", frame);
        assert!(frame.contains("source-stopped"), "{}", frame);
        assert!(frame.contains("\"source\":\"api\""), "{}", frame);
    }
}

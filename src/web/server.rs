use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::future::Future;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use super::{api, AppState};

/// Large enough for a raw float tensor of a full-resolution frame.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ensemble", post(api::post_ensemble))
        .route("/ensemble_service", post(api::post_ensemble))
        .route("/change_config", post(api::post_change_config))
        .route("/config", get(api::get_config))
        .route("/api/health", get(api::health_check))
        .route("/api/stats", get(api::get_stats))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub async fn start_server<F>(state: AppState, host: &str, port: u16, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    info!("Ensemble service listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

    info!("Ensemble service stopped accepting requests");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::StrategyConfig;
    use crate::backend::{MockBackendClient, TensorShape};
    use crate::config::{ConfigStore, EnsembleConfig};
    use crate::engine::{job_queue, EnsembleCoordinator, JobRunner};
    use crate::types::{BackendEndpoint, BackendResult, ClassScore};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(capacity: usize) -> (Router, AppState, JobRunner) {
        app_with(capacity, MockBackendClient::new())
    }

    fn app_with(capacity: usize, client: MockBackendClient) -> (Router, AppState, JobRunner) {
        let config = EnsembleConfig::new(
            vec![
                BackendEndpoint::new("http://vgg16-service:5012/inference"),
                BackendEndpoint::new("http://resnet-service:5012/inference"),
            ],
            StrategyConfig::default(),
        );
        let store = Arc::new(ConfigStore::new(config).unwrap());
        let coordinator = Arc::new(EnsembleCoordinator::new(
            Arc::new(client),
            TensorShape::default(),
        ));
        let (jobs, runner) = job_queue(capacity, coordinator, Arc::clone(&store), None);
        let state = AppState::new(store, jobs);
        (build_router(state.clone()), state, runner)
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_ensemble_request_is_accepted() {
        let (app, state, _runner) = app(4);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/ensemble?request_id=frame-1")
                    .header("Timestamp", "1700000000.25")
                    .body(Body::from(vec![0u8; 16]))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert!(body["response"].as_str().unwrap().contains("frame-1"));
        assert_eq!(state.jobs.pending(), 1);
        assert_eq!(state.stats.snapshot().accepted, 1);
    }

    #[tokio::test]
    async fn test_missing_request_id() {
        let (app, _state, _runner) = app(4);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/ensemble_service")
                    .body(Body::from("payload"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_enqueue_failure_is_500() {
        let (app, _state, _runner) = app(1);
        let request = || {
            Request::builder()
                .method("POST")
                .uri("/ensemble?request_id=frame-2")
                .body(Body::from("payload"))
                .unwrap()
        };

        let first = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);

        let second = app.oneshot(request()).await.unwrap();
        assert_eq!(second.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_json(second).await["error"].as_str().unwrap().contains("full"));
    }

    #[tokio::test]
    async fn test_change_config_echoes_new_config() {
        let (app, state, _runner) = app(4);

        let response = app
            .clone()
            .oneshot(post_json(
                "/change_config",
                json!({"strategy": {"name": "median"}, "endpoints": [{"url": "http://llm:5012/inference", "tag": "llm"}, {"url": "http://vgg16:5012/inference"}]}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["strategy"]["name"], "median");
        assert_eq!(body["endpoints"][0]["tag"], "llm");
        assert_eq!(state.config.snapshot().await.strategy.name(), "median");

        let response = app
            .oneshot(Request::builder().uri("/config").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["endpoints"].as_array().unwrap().len(), 2);
        assert!(body["available_strategies"]
            .as_array()
            .unwrap()
            .contains(&json!("rank_averaging")));
    }

    #[tokio::test]
    async fn test_change_config_rejects_unknown_strategy() {
        let (app, state, _runner) = app(4);

        let response = app
            .oneshot(post_json("/change_config", json!({"strategy": {"name": "stacking"}})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"].as_str().unwrap().contains("stacking"));
        assert_eq!(state.config.snapshot().await.strategy.name(), "average");
    }

    #[tokio::test]
    async fn test_health_and_stats() {
        let (app, _state, _runner) = app(4);

        let health = app
            .clone()
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);
        assert_eq!(body_json(health).await["status"], "ok");

        let stats = app
            .oneshot(Request::builder().uri("/api/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(stats).await;
        assert_eq!(body["endpoints"], 2);
        assert_eq!(body["strategy"], "average");
        assert_eq!(body["jobs"]["accepted"], 0);
    }

    #[tokio::test]
    async fn test_trace_headers_reach_backends() {
        let mut client = MockBackendClient::new();
        client
            .expect_infer()
            .withf(|_, _, headers| {
                headers.contains(&("traceparent".to_string(), "00-4bf92f-01".to_string()))
                    && headers.contains(&("Timestamp".to_string(), "1700000000.5".to_string()))
                    && !headers.iter().any(|(name, _)| name == "cookie")
            })
            .times(2)
            .returning(|_, _, _| BackendResult::Success(vec![ClassScore::new("cat", 0.7)]));
        let (app, state, runner) = app_with(4, client);
        tokio::spawn(runner.run());

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/ensemble?request_id=frame-3")
                    .header("Timestamp", "1700000000.5")
                    .header("Traceparent", "00-4bf92f-01")
                    .header("Cookie", "session=1")
                    .body(Body::from(vec![0u8; 16]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        tokio::time::timeout(Duration::from_secs(5), async {
            while state.stats.snapshot().aggregated < 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}

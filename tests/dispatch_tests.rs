//! Dispatch-plane property tests through the full router: request
//! distribution, coalescing and cache behavior observed from the
//! outside.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use llm_gateway::{create_router, AppState, Config};
use serde_json::{json, Value};
use std::time::Duration;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const NDJSON: &str = "application/x-ndjson";
const API_KEY: &str = "test-api-key";

fn test_config(instances: String) -> Config {
    let mut config = Config::for_test();
    config.ollama_instances = instances;
    config
}

fn build_app(config: Config) -> (Router, AppState) {
    let state = AppState::new(config).unwrap();
    (create_router(state.clone()), state)
}

fn chat_request(body: Value) -> Request<Body> {
    Request::builder()
        .uri("/api/chat")
        .method("POST")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", API_KEY))
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn generate_mock(response_text: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            format!("{{\"response\":\"{}\"}}\n{{\"done\":true,\"total_tokens\":1}}\n", response_text),
            NDJSON,
        ))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn round_robin_spreads_requests_evenly() {
    let first = generate_mock("one").await;
    let second = generate_mock("two").await;

    let (app, state) = build_app(test_config(format!("{},{}", first.uri(), second.uri())));

    // Distinct prompts with caching off so every request dispatches.
    for i in 0..6 {
        let response = app
            .clone()
            .oneshot(chat_request(
                json!({ "message": format!("prompt {}", i), "cache": false }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let one = state.registry.get("ollama-1").unwrap();
    let two = state.registry.get("ollama-2").unwrap();
    assert_eq!(one.total_requests, 3);
    assert_eq!(two.total_requests, 3);
    assert_eq!(one.active_connections, 0);
    assert_eq!(two.active_connections, 0);

    // The even split shows up in the admin request distribution.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/admin/stats")
                .header("authorization", format!("Bearer {}", API_KEY))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["request_distribution"]["ollama-1"], 50.0);
    assert_eq!(body["request_distribution"]["ollama-2"], 50.0);
}

#[tokio::test]
async fn concurrent_identical_requests_coalesce_to_one_upstream_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_millis(150))
                .set_body_raw(
                    "{\"response\":\"the one answer\"}\n{\"done\":true,\"total_tokens\":3}\n",
                    NDJSON,
                ),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (app, _state) = build_app(test_config(server.uri()));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let app = app.clone();
        tasks.push(tokio::spawn(async move {
            app.oneshot(chat_request(json!({ "message": "identical prompt" })))
                .await
                .unwrap()
        }));
    }

    for task in tasks {
        let response = task.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["message"], "the one answer");
    }
    // The mock's expect(1) verifies exactly one upstream call on drop.
}

#[tokio::test]
async fn repeated_request_is_served_from_cache_until_ttl() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "{\"response\":\"cached answer\"}\n{\"done\":true,\"total_tokens\":2}\n",
            NDJSON,
        ))
        .expect(2)
        .mount(&server)
        .await;

    let mut config = test_config(server.uri());
    config.cache_ttl = 1;
    let (app, state) = build_app(config);

    // First call dispatches, second is a cache hit.
    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(chat_request(json!({ "message": "remember me" })))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["message"], "cached answer");
    }
    let stats = state.cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);

    // Past the TTL the entry is gone and the backend is hit again.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let response = app
        .clone()
        .oneshot(chat_request(json!({ "message": "remember me" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(state.cache.stats().misses, 2);
}

#[tokio::test]
async fn streaming_requests_bypass_the_cache() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "{\"response\":\"streamed\"}\n{\"done\":true}\n",
            NDJSON,
        ))
        .expect(2)
        .mount(&server)
        .await;

    let (app, state) = build_app(test_config(server.uri()));

    for _ in 0..2 {
        let request = Request::builder()
            .uri("/api/chat/stream")
            .method("POST")
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {}", API_KEY))
            .body(Body::from(json!({ "message": "stream twice" }).to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        // Drain the SSE body so the dispatch completes.
        let _ = axum::body::to_bytes(response.into_body(), usize::MAX).await;
    }

    let stats = state.cache.stats();
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.hits, 0);
}

#[tokio::test]
async fn least_connections_strategy_dispatches_all_backends_under_load() {
    let first = generate_mock("a").await;
    let second = generate_mock("b").await;

    let mut config = test_config(format!("{},{}", first.uri(), second.uri()));
    config.load_balancer_strategy = "least_connections".to_string();
    let (app, state) = build_app(config);

    for i in 0..4 {
        let response = app
            .clone()
            .oneshot(chat_request(
                json!({ "message": format!("lc {}", i), "cache": false }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    // Sequential requests at equal load alternate through the tie-break.
    let one = state.registry.get("ollama-1").unwrap();
    let two = state.registry.get("ollama-2").unwrap();
    assert_eq!(one.total_requests + two.total_requests, 4);
    assert!(one.total_requests >= 1 && two.total_requests >= 1);
}

#[tokio::test]
async fn backend_metrics_accumulate_across_requests() {
    let server = generate_mock("metrics").await;
    let (app, state) = build_app(test_config(server.uri()));

    for i in 0..3 {
        let response = app
            .clone()
            .oneshot(chat_request(
                json!({ "message": format!("m {}", i), "cache": false }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let backend = state.registry.get("ollama-1").unwrap();
    assert_eq!(backend.total_requests, 3);
    assert_eq!(backend.successful_requests, 3);
    assert_eq!(backend.total_tokens, 3);
    assert!(backend.average_response_time > 0.0);
    assert!(backend.last_request_at.is_some());
}

//! # Server Handlers
//!
//! HTTP route handlers. The chat handlers compose the dispatch plane:
//! Auth (middleware) → RateLimit (middleware) → Cache → SingleFlight →
//! LoadBalancer → StreamingProxy.

use super::AppState;
use crate::{
    auth::AuthUser,
    codeblocks::extract_code_blocks,
    error::GatewayError,
    rate_limit::EndpointClass,
    schemas::{ChatRequest, ChatResponse, ModelInfo, PullAccepted},
    upstream::{error_stream, SseStream},
};
use axum::{
    extract::{ConnectInfo, Path, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json as JsonResponse, Response},
    Extension, Json,
};
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;
use tracing::{info, warn};

// =============================================================================
// MIDDLEWARE
// =============================================================================

/// Bearer validation for the dispatch routes. Runs before rate limiting
/// so an unauthenticated caller never charges anyone's budget; the
/// resolved identity rides in the request extensions for the handlers.
/// `/`, `/health` and `/metrics` live outside `/api/` and pass through.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    if request.uri().path().starts_with("/api/") {
        let user = match state.auth.authenticate(request.headers()).await {
            Ok(user) => user,
            Err(err) => return err.into_response(),
        };
        request.extensions_mut().insert(user);
    }
    next.run(request).await
}

/// Resolve the client address: `X-Forwarded-For` first (reverse-proxy
/// deployments), then the socket peer, then loopback.
fn client_addr(request: &Request) -> IpAddr {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|value| value.trim().parse::<IpAddr>().ok())
    {
        return forwarded;
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or_else(|| IpAddr::from([127, 0, 0, 1]))
}

/// Sliding-window rate limiting over the endpoint classes. Allowed
/// requests get the `X-RateLimit-*` headers; exceeded windows get an
/// empty-bodied 429 without reaching the handler.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let class = EndpointClass::classify(request.uri().path());
    let client = client_addr(&request);

    let decision = match state.limiter.check(client, class) {
        Some(decision) => decision,
        None => return next.run(request).await,
    };

    if !decision.allowed {
        return GatewayError::RateLimited.into_response();
    }

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&decision.limit.to_string()) {
        headers.insert("X-RateLimit-Limit", value);
    }
    if let Ok(value) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert("X-RateLimit-Remaining", value);
    }
    if let Ok(value) = HeaderValue::from_str(&decision.reset_unix.to_string()) {
        headers.insert("X-RateLimit-Reset", value);
    }
    response
}

// =============================================================================
// UNAUTHENTICATED SURFACE
// =============================================================================

/// Service banner with the endpoint map.
pub async fn root() -> impl IntoResponse {
    JsonResponse(json!({
        "service": "llm-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "endpoints": {
            "/health": "Health check",
            "/metrics": "Prometheus metrics",
            "/api/models": "List available models",
            "/api/chat": "Chat with LLM",
            "/api/chat/stream": "Chat with streaming response"
        }
    }))
}

pub async fn health() -> impl IntoResponse {
    (
        StatusCode::OK,
        JsonResponse(json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "service": "llm-gateway",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// Prometheus text exposition.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state
        .metrics
        .set_healthy_backends(state.registry.healthy_count() as u64);

    (
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.metrics.render(),
    )
}

// =============================================================================
// MODELS
// =============================================================================

pub async fn list_models(
    State(state): State<AppState>,
) -> Result<Json<Vec<ModelInfo>>, GatewayError> {
    Ok(Json(state.dispatcher.list_models().await))
}

/// Enqueue a model pull on every backend; progress is consumed in the
/// background.
pub async fn pull_model(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, GatewayError> {
    let dispatcher = state.dispatcher.clone();
    let model_name = name.clone();
    tokio::spawn(async move {
        let outcomes = dispatcher.pull_model(&model_name).await;
        for outcome in outcomes {
            match outcome.error {
                None => info!("pull of {} on {}: {}", model_name, outcome.instance, outcome.status),
                Some(err) => warn!("pull of {} on {} failed: {}", model_name, outcome.instance, err),
            }
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(PullAccepted {
            message: format!("Model pull started on {} backend(s)", state.registry.len()),
            model_name: name,
        }),
    ))
}

// =============================================================================
// CHAT
// =============================================================================

fn frame_prompt(message: &str) -> String {
    format!("Human: {}\nAssistant:", message)
}

fn conversation_id(request: &ChatRequest) -> i64 {
    request.conversation_id.unwrap_or(1)
}

/// Non-streaming chat completion.
pub async fn chat(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, GatewayError> {
    if request.message.trim().is_empty() {
        return Err(GatewayError::BadRequest("Message is required".to_string()));
    }

    let mut params = state
        .dispatcher
        .resolve(&request, frame_prompt(&request.message));
    // This endpoint always completes; streaming lives at /api/chat/stream.
    params.stream = false;
    info!("chat request from {} for model {}", user.username, params.model);

    let started = Instant::now();
    match state.dispatcher.complete(&params).await {
        Ok(outcome) => {
            let elapsed = started.elapsed().as_secs_f64();
            let tokens = if outcome.tokens > 0 {
                outcome.tokens
            } else {
                outcome.text.split_whitespace().count() as u64
            };

            state.metrics.record_request(&params.model, "chat", "success");
            state.metrics.record_tokens(&params.model, "chat", tokens);
            state
                .metrics
                .observe_response_time(&params.model, "chat", elapsed);

            Ok(Json(ChatResponse {
                code_blocks: extract_code_blocks(&outcome.text),
                message: outcome.text,
                conversation_id: conversation_id(&request),
                tokens_used: tokens,
                model: params.model,
            }))
        }
        Err(err) if err.is_upstream() && state.config.fallback_response => {
            // Retry budget exhausted; serve the synthetic body so clients
            // without retry logic still surface a message.
            warn!("all generation attempts failed, serving fallback: {}", err);
            state.metrics.record_request(&params.model, "chat", "error");

            Ok(Json(ChatResponse {
                message: state.dispatcher.fallback_text(&params),
                conversation_id: conversation_id(&request),
                code_blocks: Vec::new(),
                tokens_used: 0,
                model: params.model,
            }))
        }
        Err(err) => {
            state.metrics.record_request(&params.model, "chat", "error");
            Err(err)
        }
    }
}

/// Streaming chat completion over SSE.
pub async fn chat_stream(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<SseStream, GatewayError> {
    if request.message.trim().is_empty() {
        return Err(GatewayError::BadRequest("Message is required".to_string()));
    }

    let mut params = state
        .dispatcher
        .resolve(&request, frame_prompt(&request.message));
    params.stream = true;

    match state.dispatcher.stream(&params).await {
        Ok(sse) => Ok(sse),
        Err(err) if err.is_upstream() => {
            // No backend could be engaged before the first byte; the SSE
            // contract still applies, so close with an error frame.
            warn!("streaming dispatch failed, closing with error frame: {}", err);
            state
                .metrics
                .record_request(&params.model, "chat_stream", "error");
            Ok(error_stream(&err.to_string()))
        }
        Err(err) => Err(err),
    }
}

// =============================================================================
// ADMIN
// =============================================================================

pub async fn admin_stats(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<impl IntoResponse, GatewayError> {
    state.auth.require_admin(&user)?;

    let backends = state.registry.list();
    let healthy = backends.iter().filter(|b| b.is_healthy).count();
    let total_requests: u64 = backends.iter().map(|b| b.total_requests).sum();
    let total_tokens: u64 = backends.iter().map(|b| b.total_tokens).sum();
    let response_times: Vec<f64> = backends
        .iter()
        .filter(|b| b.average_response_time > 0.0)
        .map(|b| b.average_response_time)
        .collect();
    let average_response_time = if response_times.is_empty() {
        0.0
    } else {
        response_times.iter().sum::<f64>() / response_times.len() as f64
    };

    // Share of total requests served by each backend, in percent.
    let mut request_distribution = serde_json::Map::new();
    if total_requests > 0 {
        for backend in &backends {
            request_distribution.insert(
                backend.id.clone(),
                json!(backend.total_requests as f64 / total_requests as f64 * 100.0),
            );
        }
    }

    Ok(JsonResponse(json!({
        "strategy": state.balancer.strategy().to_string(),
        "total_instances": backends.len(),
        "healthy_instances": healthy,
        "unhealthy_instances": backends.len() - healthy,
        "total_requests": total_requests,
        "request_distribution": request_distribution,
        "total_tokens_served": total_tokens,
        "average_response_time": average_response_time,
        "cache": state.cache.stats(),
        "rate_limit_buckets": state.limiter.bucket_count(),
        "instances": backends,
    })))
}

pub async fn admin_backends(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<impl IntoResponse, GatewayError> {
    state.auth.require_admin(&user)?;
    Ok(JsonResponse(state.registry.list()))
}

#[derive(Debug, Default, serde::Deserialize)]
pub struct CacheClearRequest {
    #[serde(default)]
    prefix: Option<String>,
}

pub async fn admin_cache_clear(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, GatewayError> {
    state.auth.require_admin(&user)?;

    // The body is optional; an absent or empty one clears everything.
    let prefix = serde_json::from_slice::<CacheClearRequest>(&body)
        .ok()
        .and_then(|request| request.prefix)
        .unwrap_or_default();
    let cleared = state.cache.clear_prefix(&prefix);
    info!("cache clear (prefix '{}'): {} entries removed", prefix, cleared);
    Ok(JsonResponse(json!({ "cleared": cleared })))
}

// =============================================================================
// EXTERNAL COLLABORATORS
// =============================================================================

/// Fine-tuning lives in the training job runner; these routes only
/// reserve the path space.
pub async fn finetune_placeholder() -> Result<Response, GatewayError> {
    Err(GatewayError::NotImplemented(
        "Fine-tuning is handled by the training job runner".to_string(),
    ))
}

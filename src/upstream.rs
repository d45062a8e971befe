//! # Streaming Proxy
//!
//! The dispatch plane's upstream side: opens generations against the
//! selected backend, parses the NDJSON frame stream, and either
//! accumulates the full response (non-streaming, cacheable, coalesced
//! through the single-flight gate) or fans frames out to the client as
//! SSE while keeping the registry's accounting honest.
//!
//! Every dispatch follows the same contract: a backend reserved through
//! the load balancer gets exactly one `update_metrics` call with the
//! outcome.

use crate::{
    balancer::LoadBalancer,
    cache::{cache_key, ResponseCache},
    core::http_client::HttpClientBuilder,
    error::GatewayError,
    metrics::MetricsSink,
    registry::{BackendRegistry, BackendSnapshot},
    retry::{retry, Backoff},
    schemas::{
        ChatRequest, GenerateFrame, GenerateOptions, GenerateRequest, ModelInfo, PullFrame,
        PullOutcome, TagsResponse,
    },
    single_flight::SingleFlight,
};
use axum::response::sse::{Event, Sse};
use futures::future::join_all;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Maximum silence between streamed frames before the upstream is
/// declared stuck.
pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// SSE response type returned to streaming clients.
pub type SseStream = Sse<Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>>;

/// A fully resolved generation request: every default applied, ready to
/// be dispatched.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub prompt: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
    pub cache: bool,
}

/// The accumulated result of one non-streaming generation.
#[derive(Debug, Clone)]
pub struct GenerateOutcome {
    pub text: String,
    pub tokens: u64,
    pub elapsed_secs: f64,
    pub cached: bool,
}

pub struct Dispatcher {
    registry: Arc<BackendRegistry>,
    balancer: Arc<LoadBalancer>,
    cache: Arc<ResponseCache>,
    metrics: Arc<MetricsSink>,
    gate: SingleFlight<GenerateOutcome>,
    client: Client,
    stream_client: Client,
    default_model: String,
    default_temperature: f32,
    default_max_tokens: u32,
    retry_policy: Backoff,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<BackendRegistry>,
        balancer: Arc<LoadBalancer>,
        cache: Arc<ResponseCache>,
        metrics: Arc<MetricsSink>,
        default_model: String,
        default_temperature: f32,
        default_max_tokens: u32,
    ) -> Result<Self, GatewayError> {
        let client = HttpClientBuilder::generation()
            .build()
            .map_err(|err| GatewayError::Internal(format!("HTTP client: {}", err)))?;
        let stream_client = HttpClientBuilder::streaming()
            .build()
            .map_err(|err| GatewayError::Internal(format!("HTTP client: {}", err)))?;

        Ok(Self {
            registry,
            balancer,
            cache,
            metrics,
            gate: SingleFlight::new(),
            client,
            stream_client,
            default_model,
            default_temperature,
            default_max_tokens,
            retry_policy: Backoff::default(),
        })
    }

    /// Replace the retry policy; test hook for fast backoff.
    pub fn with_retry_policy(mut self, policy: Backoff) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Apply configuration defaults to an incoming chat request. The
    /// prompt framing is the caller's business; everything else resolves
    /// here.
    pub fn resolve(&self, request: &ChatRequest, prompt: String) -> GenerationParams {
        GenerationParams {
            prompt,
            model: request
                .model_name
                .clone()
                .unwrap_or_else(|| self.default_model.clone()),
            temperature: request.temperature.unwrap_or(self.default_temperature),
            max_tokens: request.max_tokens.unwrap_or(self.default_max_tokens),
            stream: request.stream.unwrap_or(false),
            cache: request.cache.unwrap_or(true),
        }
    }

    // =========================================================================
    // NON-STREAMING
    // =========================================================================

    /// Complete a generation: cache lookup, single-flight coalescing on
    /// the cache key, then retried dispatch. Streaming and `cache=false`
    /// requests skip both the cache and the gate.
    pub async fn complete(&self, params: &GenerationParams) -> Result<GenerateOutcome, GatewayError> {
        if !params.cache || params.stream {
            return self.complete_uncached(params).await;
        }

        let key = cache_key(
            &params.model,
            &params.prompt,
            params.temperature,
            params.max_tokens,
        );

        if let Some(text) = self.cache.get(&key) {
            self.metrics.cache_hit();
            return Ok(GenerateOutcome {
                text,
                tokens: 0,
                elapsed_secs: 0.0,
                cached: true,
            });
        }
        self.metrics.cache_miss();

        let stored_key = key.clone();
        self.gate
            .run(&key, move || async move {
                let outcome = self.complete_uncached(params).await?;
                self.cache.set(&stored_key, &outcome.text);
                Ok(outcome)
            })
            .await
    }

    async fn complete_uncached(
        &self,
        params: &GenerationParams,
    ) -> Result<GenerateOutcome, GatewayError> {
        retry(self.retry_policy, |attempt| async move {
            if attempt > 1 {
                debug!("generation retry, attempt {}", attempt);
            }
            self.attempt_generate(params).await
        })
        .await
    }

    /// One dispatch: reserve a backend, run the generation, settle the
    /// reservation.
    async fn attempt_generate(
        &self,
        params: &GenerationParams,
    ) -> Result<GenerateOutcome, GatewayError> {
        let backend = self.balancer.acquire()?;
        let started = Instant::now();

        let result = self.send_generate(&backend, params).await;
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok((text, tokens)) => {
                self.registry
                    .update_metrics(&backend.id, true, elapsed, tokens);
                Ok(GenerateOutcome {
                    text,
                    tokens,
                    elapsed_secs: elapsed,
                    cached: false,
                })
            }
            Err(err) => {
                warn!("generation on {} failed: {}", backend.id, err);
                self.registry.update_metrics(&backend.id, false, elapsed, 0);
                self.registry.mark_unhealthy(&backend.id);
                Err(err)
            }
        }
    }

    async fn send_generate(
        &self,
        backend: &BackendSnapshot,
        params: &GenerationParams,
    ) -> Result<(String, u64), GatewayError> {
        let response = self
            .client
            .post(format!("{}/api/generate", backend.url))
            .json(&generate_body(params, false))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(GatewayError::UpstreamBadResponse(format!(
                "HTTP {}",
                response.status().as_u16()
            )));
        }

        accumulate_frames(response.bytes_stream()).await
    }

    /// The synthetic body served when the retry budget is exhausted and
    /// fallback mode is on.
    pub fn fallback_text(&self, params: &GenerationParams) -> String {
        format!(
            "No LLM backend is currently available. You asked: '{}' (model: {}). \
            The request was retried against every backend without success; \
            please try again shortly.",
            params.prompt.trim(),
            params.model
        )
    }

    // =========================================================================
    // STREAMING
    // =========================================================================

    /// Open a streaming generation and fan the frames out to the client
    /// as SSE. Retries are only attempted while establishing the upstream
    /// response — before any byte has been emitted; after that the stream
    /// either completes or closes with an error frame.
    pub async fn stream(&self, params: &GenerationParams) -> Result<SseStream, GatewayError> {
        let (backend, response) = retry(self.retry_policy, |_| async move {
            let backend = self.balancer.acquire()?;
            let started = Instant::now();

            let sent = self
                .stream_client
                .post(format!("{}/api/generate", backend.url))
                .json(&generate_body(params, true))
                .send()
                .await;

            match sent {
                Ok(response) if response.status().is_success() => Ok((backend, response)),
                Ok(response) => {
                    let err = GatewayError::UpstreamBadResponse(format!(
                        "HTTP {}",
                        response.status().as_u16()
                    ));
                    self.registry.update_metrics(
                        &backend.id,
                        false,
                        started.elapsed().as_secs_f64(),
                        0,
                    );
                    self.registry.mark_unhealthy(&backend.id);
                    Err(err)
                }
                Err(err) => {
                    self.registry.update_metrics(
                        &backend.id,
                        false,
                        started.elapsed().as_secs_f64(),
                        0,
                    );
                    self.registry.mark_unhealthy(&backend.id);
                    Err(err.into())
                }
            }
        })
        .await?;

        let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(32);
        let registry = self.registry.clone();
        let metrics = self.metrics.clone();
        let model = params.model.clone();
        let request_id = Uuid::new_v4();

        tokio::spawn(async move {
            let started = Instant::now();
            let mut upstream = response.bytes_stream();
            let mut buffer = String::new();
            let backend_id = backend.id;
            debug!("stream {} dispatched to {}", request_id, backend_id);

            let settle = |success: bool, tokens: u64| {
                let elapsed = started.elapsed().as_secs_f64();
                registry.update_metrics(&backend_id, success, elapsed, tokens);
                let status = if success { "success" } else { "error" };
                metrics.record_request(&model, "chat_stream", status);
                if success {
                    metrics.record_tokens(&model, "chat_stream", tokens);
                    metrics.observe_response_time(&model, "chat_stream", elapsed);
                }
            };

            loop {
                let next = tokio::time::timeout(STREAM_IDLE_TIMEOUT, upstream.next()).await;
                let chunk = match next {
                    Err(_) => {
                        warn!("stream {} idle timeout from {}", request_id, backend_id);
                        registry.mark_unhealthy(&backend_id);
                        settle(false, 0);
                        let _ = tx.send(Ok(error_event("upstream idle timeout"))).await;
                        return;
                    }
                    Ok(None) => {
                        // Upstream closed without a done frame; end the
                        // stream politely.
                        settle(true, 0);
                        let _ = tx.send(Ok(done_event())).await;
                        return;
                    }
                    Ok(Some(Err(err))) => {
                        warn!("stream {} transport error: {}", request_id, err);
                        registry.mark_unhealthy(&backend_id);
                        settle(false, 0);
                        let _ = tx.send(Ok(error_event(&err.to_string()))).await;
                        return;
                    }
                    Ok(Some(Ok(bytes))) => bytes,
                };

                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);
                    if line.is_empty() {
                        continue;
                    }
                    // Malformed frames are skipped without failing the stream.
                    let Ok(frame) = serde_json::from_str::<GenerateFrame>(&line) else {
                        continue;
                    };

                    if let Some(text) = frame.response {
                        if tx.send(Ok(chunk_event(&text))).await.is_err() {
                            // Client went away: dropping `upstream` cancels
                            // the backend request.
                            debug!("stream {} client disconnected", request_id);
                            settle(false, 0);
                            return;
                        }
                    }

                    if frame.done == Some(true) {
                        settle(true, frame.total_tokens.unwrap_or(0));
                        let _ = tx.send(Ok(done_event())).await;
                        return;
                    }
                }
            }
        });

        let stream: Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>> =
            Box::pin(ReceiverStream::new(rx));
        Ok(Sse::new(stream))
    }

    // =========================================================================
    // MODEL MANAGEMENT
    // =========================================================================

    /// List models across every backend, tagged with the serving
    /// instance. Unreachable backends are skipped; if nothing answers, a
    /// static default list keeps clients working.
    pub async fn list_models(&self) -> Vec<ModelInfo> {
        let mut models = Vec::new();

        for backend in self.registry.list() {
            let request = self
                .client
                .get(format!("{}/api/tags", backend.url))
                .timeout(Duration::from_secs(10));

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    match response.json::<TagsResponse>().await {
                        Ok(tags) => {
                            for model in tags.models {
                                models.push(ModelInfo {
                                    name: model.name,
                                    model_type: None,
                                    size: model.size,
                                    modified: model.modified_at,
                                    available: true,
                                    instance_id: Some(backend.id.clone()),
                                });
                            }
                        }
                        Err(err) => warn!("bad tags payload from {}: {}", backend.id, err),
                    }
                }
                Ok(response) => {
                    warn!("tags from {} returned HTTP {}", backend.id, response.status())
                }
                Err(err) => warn!("could not fetch models from {}: {}", backend.id, err),
            }
        }

        if models.is_empty() {
            return default_models();
        }
        models
    }

    /// Pull a model onto every backend concurrently, consuming the NDJSON
    /// progress stream until the terminal success frame.
    pub async fn pull_model(&self, name: &str) -> Vec<PullOutcome> {
        let backends = self.registry.list();
        let pulls = backends
            .iter()
            .map(|backend| self.pull_to_instance(backend, name));
        join_all(pulls).await
    }

    async fn pull_to_instance(&self, backend: &BackendSnapshot, name: &str) -> PullOutcome {
        let sent = self
            .stream_client
            .post(format!("{}/api/pull", backend.url))
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await;

        let response = match sent {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                return PullOutcome {
                    instance: backend.id.clone(),
                    status: "error".to_string(),
                    error: Some(format!("HTTP {}", response.status().as_u16())),
                }
            }
            Err(err) => {
                return PullOutcome {
                    instance: backend.id.clone(),
                    status: "error".to_string(),
                    error: Some(err.to_string()),
                }
            }
        };

        let mut upstream = response.bytes_stream();
        let mut buffer = String::new();
        while let Some(chunk) = upstream.next().await {
            let Ok(bytes) = chunk else { break };
            buffer.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer.drain(..=newline);
                if line.is_empty() {
                    continue;
                }
                if let Ok(frame) = serde_json::from_str::<PullFrame>(&line) {
                    if frame.status.as_deref() == Some("success") {
                        info!("model {} pulled to {}", name, backend.id);
                        return PullOutcome {
                            instance: backend.id.clone(),
                            status: "success".to_string(),
                            error: None,
                        };
                    }
                }
            }
        }

        PullOutcome {
            instance: backend.id.clone(),
            status: "error".to_string(),
            error: Some("pull stream ended without success".to_string()),
        }
    }
}

fn generate_body(params: &GenerationParams, stream: bool) -> GenerateRequest {
    GenerateRequest {
        model: params.model.clone(),
        prompt: params.prompt.clone(),
        stream,
        options: GenerateOptions {
            temperature: params.temperature,
            num_predict: params.max_tokens,
        },
    }
}

fn chunk_event(text: &str) -> Event {
    Event::default().data(serde_json::json!({ "chunk": text }).to_string())
}

fn done_event() -> Event {
    Event::default().data(serde_json::json!({ "done": true }).to_string())
}

fn error_event(message: &str) -> Event {
    Event::default().data(serde_json::json!({ "error": message }).to_string())
}

/// An SSE body consisting of a single error frame; used when streaming
/// dispatch fails before any byte reached the client.
pub fn error_stream(message: &str) -> SseStream {
    let frames = futures_util::stream::iter(vec![Ok(error_event(message))]);
    let stream: Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>> = Box::pin(frames);
    Sse::new(stream)
}

/// Fallback catalogue used when no backend answers the tags request.
fn default_models() -> Vec<ModelInfo> {
    [
        ("deepseek-coder:6.7b", "code"),
        ("llama2:7b", "chat"),
        ("mistral:7b", "chat"),
    ]
    .into_iter()
    .map(|(name, model_type)| ModelInfo {
        name: name.to_string(),
        model_type: Some(model_type.to_string()),
        size: None,
        modified: None,
        available: true,
        instance_id: None,
    })
    .collect()
}

/// Accumulate a generation's NDJSON frames into the full response text
/// and the reported token total. Malformed lines are skipped; the stream
/// ends at the first `done` frame or at EOF.
async fn accumulate_frames<S, E>(mut stream: S) -> Result<(String, u64), GatewayError>
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Unpin,
    E: Into<GatewayError>,
{
    let mut buffer = String::new();
    let mut text = String::new();
    let mut tokens = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(Into::into)?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(newline) = buffer.find('\n') {
            let line = buffer[..newline].trim().to_string();
            buffer.drain(..=newline);
            if line.is_empty() {
                continue;
            }
            if apply_frame(&line, &mut text, &mut tokens) {
                return Ok((text, tokens));
            }
        }
    }

    // Trailing frame without a final newline.
    let line = buffer.trim();
    if !line.is_empty() {
        apply_frame(line, &mut text, &mut tokens);
    }
    Ok((text, tokens))
}

/// Fold one frame into the accumulator; returns whether it was terminal.
fn apply_frame(line: &str, text: &mut String, tokens: &mut u64) -> bool {
    let Ok(frame) = serde_json::from_str::<GenerateFrame>(line) else {
        return false;
    };
    if let Some(chunk) = frame.response {
        text.push_str(&chunk);
    }
    if frame.done == Some(true) {
        *tokens = frame.total_tokens.unwrap_or(0);
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::Strategy;
    use futures_util::stream;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const NDJSON: &str = "application/x-ndjson";

    fn fast_backoff() -> Backoff {
        Backoff {
            max_attempts: 3,
            base: Duration::from_millis(1),
            cap: Duration::from_millis(4),
            multiplier: 2,
        }
    }

    fn dispatcher_for(urls: Vec<String>) -> (Dispatcher, Arc<BackendRegistry>) {
        let registry = Arc::new(BackendRegistry::from_urls(&urls));
        let balancer = Arc::new(LoadBalancer::new(registry.clone(), Strategy::RoundRobin, false));
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(60)));
        let metrics = Arc::new(MetricsSink::new());
        let dispatcher = Dispatcher::new(
            registry.clone(),
            balancer,
            cache,
            metrics,
            "test-model".to_string(),
            0.7,
            256,
        )
        .unwrap()
        .with_retry_policy(fast_backoff());
        (dispatcher, registry)
    }

    fn params(prompt: &str, cache: bool) -> GenerationParams {
        GenerationParams {
            prompt: prompt.to_string(),
            model: "test-model".to_string(),
            temperature: 0.7,
            max_tokens: 256,
            stream: false,
            cache,
        }
    }

    #[tokio::test]
    async fn accumulates_frames_in_order() {
        let body = stream::iter(vec![
            Ok::<_, GatewayError>(bytes::Bytes::from_static(b"{\"response\":\"hel\"}\n{\"resp")),
            Ok(bytes::Bytes::from_static(b"onse\":\"lo\"}\n")),
            Ok(bytes::Bytes::from_static(
                b"{\"done\":true,\"total_tokens\":5}\n",
            )),
        ]);

        let (text, tokens) = accumulate_frames(body).await.unwrap();
        assert_eq!(text, "hello");
        assert_eq!(tokens, 5);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let body = stream::iter(vec![Ok::<_, GatewayError>(bytes::Bytes::from_static(
            b"{\"response\":\"a\"}\nnot json\n{\"response\":\"b\"}\n{\"done\":true}\n",
        ))]);

        let (text, tokens) = accumulate_frames(body).await.unwrap();
        assert_eq!(text, "ab");
        assert_eq!(tokens, 0);
    }

    #[tokio::test]
    async fn complete_happy_path_updates_registry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "{\"response\":\"print\"}\n{\"response\":\"(\\\"hi\\\")\"}\n{\"done\":true,\"total_tokens\":3}\n",
                NDJSON,
            ))
            .mount(&server)
            .await;

        let (dispatcher, registry) = dispatcher_for(vec![server.uri()]);
        let outcome = dispatcher.complete(&params("hello", false)).await.unwrap();

        assert_eq!(outcome.text, "print(\"hi\")");
        assert_eq!(outcome.tokens, 3);
        assert!(!outcome.cached);

        let backend = registry.get("ollama-1").unwrap();
        assert_eq!(backend.successful_requests, 1);
        assert_eq!(backend.active_connections, 0);
        assert_eq!(backend.total_tokens, 3);
    }

    #[tokio::test]
    async fn failover_reaches_second_backend() {
        let bad = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&bad)
            .await;

        let good = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "{\"response\":\"ok\"}\n{\"done\":true,\"total_tokens\":1}\n",
                NDJSON,
            ))
            .mount(&good)
            .await;

        let (dispatcher, registry) = dispatcher_for(vec![bad.uri(), good.uri()]);
        let outcome = dispatcher.complete(&params("failover", false)).await.unwrap();
        assert_eq!(outcome.text, "ok");

        let failed = registry.get("ollama-1").unwrap();
        assert_eq!(failed.failed_requests, 1);
        assert_eq!(failed.consecutive_errors, 1);
        assert!(!failed.is_healthy);

        let succeeded = registry.get("ollama-2").unwrap();
        assert_eq!(succeeded.successful_requests, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_upstream_error() {
        let bad = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&bad)
            .await;

        let (dispatcher, _registry) = dispatcher_for(vec![bad.uri()]);
        let result = dispatcher.complete(&params("doomed", false)).await;
        assert!(matches!(result, Err(GatewayError::UpstreamBadResponse(_))));
    }

    #[tokio::test]
    async fn identical_cacheable_requests_make_one_upstream_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(100))
                    .set_body_raw("{\"response\":\"once\"}\n{\"done\":true}\n", NDJSON),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (dispatcher, _registry) = dispatcher_for(vec![server.uri()]);
        let dispatcher = Arc::new(dispatcher);

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let dispatcher = dispatcher.clone();
            tasks.push(tokio::spawn(async move {
                dispatcher.complete(&params("same prompt", true)).await
            }));
        }

        for task in tasks {
            let outcome = task.await.unwrap().unwrap();
            assert_eq!(outcome.text, "once");
        }
    }

    #[tokio::test]
    async fn completed_generation_is_served_from_cache() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "{\"response\":\"cached\"}\n{\"done\":true,\"total_tokens\":2}\n",
                NDJSON,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let (dispatcher, _registry) = dispatcher_for(vec![server.uri()]);

        let first = dispatcher.complete(&params("repeat me", true)).await.unwrap();
        assert!(!first.cached);

        let second = dispatcher.complete(&params("repeat me", true)).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.text, "cached");
    }

    #[tokio::test]
    async fn cache_false_bypasses_the_cache() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "{\"response\":\"fresh\"}\n{\"done\":true}\n",
                NDJSON,
            ))
            .expect(2)
            .mount(&server)
            .await;

        let (dispatcher, _registry) = dispatcher_for(vec![server.uri()]);
        for _ in 0..2 {
            let outcome = dispatcher.complete(&params("no cache", false)).await.unwrap();
            assert!(!outcome.cached);
        }
    }

    #[tokio::test]
    async fn list_models_tags_instances_and_falls_back() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "models": [{ "name": "llama2:7b", "size": 3825819519u64, "modified_at": "2024-01-01T00:00:00Z" }]
            })))
            .mount(&server)
            .await;

        let (dispatcher, _registry) = dispatcher_for(vec![server.uri()]);
        let models = dispatcher.list_models().await;
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].name, "llama2:7b");
        assert_eq!(models[0].instance_id.as_deref(), Some("ollama-1"));

        // Unreachable backend: static fallback catalogue.
        let (dispatcher, _registry) = dispatcher_for(vec!["http://127.0.0.1:1".to_string()]);
        let models = dispatcher.list_models().await;
        assert!(!models.is_empty());
        assert!(models.iter().all(|m| m.instance_id.is_none()));
    }

    #[tokio::test]
    async fn pull_model_reports_per_instance_outcomes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/pull"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "{\"status\":\"downloading\"}\n{\"status\":\"success\"}\n",
                NDJSON,
            ))
            .mount(&server)
            .await;

        let (dispatcher, _registry) =
            dispatcher_for(vec![server.uri(), "http://127.0.0.1:1".to_string()]);
        let outcomes = dispatcher.pull_model("mistral:7b").await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].status, "success");
        assert_eq!(outcomes[1].status, "error");
    }

    #[tokio::test]
    async fn stream_emits_chunks_then_done() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "{\"response\":\"a\"}\n{\"response\":\"b\"}\n{\"done\":true,\"total_tokens\":2}\n",
                NDJSON,
            ))
            .mount(&server)
            .await;

        let (dispatcher, registry) = dispatcher_for(vec![server.uri()]);
        let mut stream_params = params("stream me", false);
        stream_params.stream = true;

        let sse = dispatcher.stream(&stream_params).await.unwrap();
        let response = axum::response::IntoResponse::into_response(sse);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = String::from_utf8_lossy(&body);

        assert!(body.contains("data: {\"chunk\":\"a\"}"));
        assert!(body.contains("data: {\"chunk\":\"b\"}"));
        assert!(body.contains("data: {\"done\":true}"));
        // Chunk order is preserved.
        let a = body.find("{\"chunk\":\"a\"}").unwrap();
        let b = body.find("{\"chunk\":\"b\"}").unwrap();
        assert!(a < b);

        // The fan-out task settles the reservation.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let backend = registry.get("ollama-1").unwrap();
        assert_eq!(backend.successful_requests, 1);
        assert_eq!(backend.active_connections, 0);
        assert_eq!(backend.total_tokens, 2);
    }

    #[tokio::test]
    async fn stream_failure_before_first_byte_is_retried() {
        let bad = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&bad)
            .await;

        let good = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "{\"response\":\"x\"}\n{\"done\":true}\n",
                NDJSON,
            ))
            .mount(&good)
            .await;

        let (dispatcher, _registry) = dispatcher_for(vec![bad.uri(), good.uri()]);
        let mut stream_params = params("retry stream", false);
        stream_params.stream = true;

        let sse = dispatcher.stream(&stream_params).await.unwrap();
        let response = axum::response::IntoResponse::into_response(sse);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = String::from_utf8_lossy(&body);
        assert!(body.contains("data: {\"chunk\":\"x\"}"));
    }

    #[tokio::test]
    async fn fallback_text_names_prompt_and_model() {
        let (dispatcher, _registry) = dispatcher_for(vec!["http://127.0.0.1:1".to_string()]);
        let text = dispatcher.fallback_text(&params("what is rust", false));
        assert!(text.contains("what is rust"));
        assert!(text.contains("test-model"));
    }
}

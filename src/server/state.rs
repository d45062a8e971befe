//! # Application State
//!
//! The shared state threaded through every HTTP handler. The state owns
//! the registry, dispatcher, cache, limiter, auth gate and metrics sink;
//! background tasks hold cancellation handles registered with the
//! supervisor so shutdown can drain them.

use crate::{
    auth::{AuthGate, StaticDirectory},
    balancer::LoadBalancer,
    cache::ResponseCache,
    config::Config,
    core::http_client::HttpClientBuilder,
    error::GatewayError,
    health::HealthProber,
    metrics::MetricsSink,
    rate_limit::RateLimiter,
    registry::BackendRegistry,
    shutdown::TaskSupervisor,
    upstream::Dispatcher,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<BackendRegistry>,
    pub balancer: Arc<LoadBalancer>,
    pub cache: Arc<ResponseCache>,
    pub dispatcher: Arc<Dispatcher>,
    pub limiter: Arc<RateLimiter>,
    pub auth: Arc<AuthGate>,
    pub metrics: Arc<MetricsSink>,
    pub supervisor: Arc<TaskSupervisor>,
}

impl AppState {
    /// Wire up all components from configuration. Background tasks are
    /// not started here; call `start_background` once the process is
    /// committed to serving.
    pub fn new(config: Config) -> Result<Self, GatewayError> {
        let registry = Arc::new(BackendRegistry::from_urls(&config.backend_urls()));
        let balancer = Arc::new(LoadBalancer::new(
            registry.clone(),
            config.strategy(),
            config.strict_unhealthy,
        ));
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(config.cache_ttl)));
        let metrics = Arc::new(MetricsSink::new());
        let limiter = Arc::new(RateLimiter::new(config.rate_limit_per_minute));
        let auth = Arc::new(AuthGate::new(
            config.api_key.clone(),
            config.secret_key.clone(),
            &config.jwt_algorithm,
            config.jwt_expire_minutes,
            Arc::new(StaticDirectory),
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            balancer.clone(),
            cache.clone(),
            metrics.clone(),
            config.default_model.clone(),
            config.temperature,
            config.max_tokens,
        )?);

        info!(
            "gateway state initialized: {} backend(s), strategy {}",
            registry.len(),
            balancer.strategy()
        );

        Ok(Self {
            config: Arc::new(config),
            registry,
            balancer,
            cache,
            dispatcher,
            limiter,
            auth,
            metrics,
            supervisor: Arc::new(TaskSupervisor::new()),
        })
    }

    /// Spawn the health prober under the supervisor's cancellation
    /// token.
    pub fn start_background(&self) -> Result<(), GatewayError> {
        let probe_client = HttpClientBuilder::probing()
            .build()
            .map_err(|err| GatewayError::Internal(format!("HTTP client: {}", err)))?;

        let prober = HealthProber::new(self.registry.clone(), probe_client);
        let handle = prober.spawn(self.supervisor.cancellation());
        self.supervisor.register("health-prober", handle);
        Ok(())
    }
}

//! # llm-gateway — Multi-Backend LLM Dispatch Gateway
//!
//! A gateway that sits in front of one or more Ollama-compatible
//! model-serving backends and presents a unified chat/generation API.
//! The dispatch plane selects a healthy backend per request, streams
//! tokens back to the caller, deduplicates identical requests through a
//! content-addressed response cache and a single-flight gate, tracks
//! per-backend health and metrics, and enforces per-client rate limits.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use llm_gateway::{Config, AppState, create_router};
//! use std::net::SocketAddr;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::for_test(); // or Config::parse_args() for CLI
//!     let state = AppState::new(config)?;
//!     let app = create_router(state);
//!
//!     let addr = SocketAddr::from(([0, 0, 0, 0], 8080));
//!     let listener = tokio::net::TcpListener::bind(addr).await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`registry`] — backend records: health flags, weights, live metrics
//! - [`balancer`] — strategy-driven backend selection
//! - [`health`] — background probing of backend tag endpoints
//! - [`cache`] — TTL'd content-addressed response cache
//! - [`single_flight`] — coalescing of concurrent identical requests
//! - [`upstream`] — the streaming proxy speaking the Ollama protocol
//! - [`rate_limit`] — sliding-window per-client limits
//! - [`auth`] — bearer validation (static key or signed token)
//! - [`server`] — axum routes, handlers and application state
//! - [`metrics`] — counters, histograms, gauges and text exposition

// Core infrastructure
pub mod core;
pub mod config;
pub mod error;
pub mod schemas;
pub mod shutdown;

// Dispatch plane
pub mod registry;
pub mod balancer;
pub mod health;
pub mod cache;
pub mod single_flight;
pub mod retry;
pub mod upstream;

// Request surface
pub mod auth;
pub mod rate_limit;
pub mod codeblocks;
pub mod metrics;
pub mod server;

// Re-export commonly used types for convenience
pub use balancer::{LoadBalancer, Strategy};
pub use cache::{cache_key, CacheStats, ResponseCache};
pub use config::Config;
pub use core::http_client::HttpClientBuilder;
pub use error::GatewayError;
pub use health::HealthProber;
pub use metrics::MetricsSink;
pub use rate_limit::{EndpointClass, RateLimiter};
pub use registry::{BackendRegistry, BackendSnapshot};
pub use schemas::{ChatRequest, ChatResponse, ModelInfo};
pub use server::{create_router, AppState};
pub use single_flight::SingleFlight;
pub use upstream::{Dispatcher, GenerateOutcome, GenerationParams};

/// The result type used throughout the library
pub type Result<T> = std::result::Result<T, GatewayError>;

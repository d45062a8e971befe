//! # HTTP Client Factory
//!
//! Centralized reqwest client construction so every component sees the
//! same pool settings. Three deadline profiles exist: non-streaming
//! generation (30s overall), health probing (5s), and streaming (no
//! overall deadline; the proxy enforces a per-frame idle timeout
//! instead).

use reqwest::Client;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpClientError {
    #[error("Failed to build HTTP client: {0}")]
    BuildError(#[from] reqwest::Error),
}

/// Connection pool settings shared by all profiles.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
    pub keepalive: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            keepalive: Some(Duration::from_secs(60)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Overall request deadline; `None` for streaming clients.
    pub timeout: Option<Duration>,
    pub connect_timeout: Duration,
    pub pool: PoolConfig,
    pub compression: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(30)),
            connect_timeout: Duration::from_secs(10),
            pool: PoolConfig::default(),
            compression: true,
        }
    }
}

pub struct HttpClientBuilder {
    config: HttpClientConfig,
}

impl HttpClientBuilder {
    pub fn new() -> Self {
        Self {
            config: HttpClientConfig::default(),
        }
    }

    /// Client for non-streaming generation: 30s overall deadline.
    pub fn generation() -> Self {
        Self::new()
    }

    /// Client for streaming generation: no overall deadline. The proxy
    /// applies a 120s per-frame idle timeout on top.
    pub fn streaming() -> Self {
        Self {
            config: HttpClientConfig {
                timeout: None,
                ..HttpClientConfig::default()
            },
        }
    }

    /// Client for health probes: short deadline, no compression.
    pub fn probing() -> Self {
        Self {
            config: HttpClientConfig {
                timeout: Some(Duration::from_secs(5)),
                connect_timeout: Duration::from_secs(5),
                pool: PoolConfig {
                    max_idle_per_host: 2,
                    ..PoolConfig::default()
                },
                compression: false,
            },
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn pool_config(mut self, pool: PoolConfig) -> Self {
        self.config.pool = pool;
        self
    }

    pub fn build(self) -> Result<Client, HttpClientError> {
        let mut builder = Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .pool_max_idle_per_host(self.config.pool.max_idle_per_host)
            .pool_idle_timeout(self.config.pool.idle_timeout);

        if let Some(timeout) = self.config.timeout {
            builder = builder.timeout(timeout);
        }

        if let Some(keepalive) = self.config.pool.keepalive {
            builder = builder.tcp_keepalive(keepalive);
        }

        if self.config.compression {
            builder = builder.gzip(true).brotli(true);
        }

        builder.build().map_err(HttpClientError::from)
    }
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

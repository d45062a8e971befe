//! # Health Prober
//!
//! A single background task that probes every registered backend's
//! tag-listing endpoint on a fixed cadence and flips the registry health
//! flags. The prober never adds or removes backends; that stays with the
//! registry API.

use crate::registry::BackendRegistry;
use futures::future::join_all;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const PROBE_INTERVAL: Duration = Duration::from_secs(30);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HealthProber {
    registry: Arc<BackendRegistry>,
    client: Client,
    interval: Duration,
}

impl HealthProber {
    pub fn new(registry: Arc<BackendRegistry>, client: Client) -> Self {
        Self {
            registry,
            client,
            interval: PROBE_INTERVAL,
        }
    }

    /// Shorten the probe cadence; test hook.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Spawn the probing loop. The task runs until the token is
    /// cancelled; each round probes all backends concurrently.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // The immediate first tick seeds health state right after startup.
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("health prober stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.probe_all().await;
                    }
                }
            }
        })
    }

    /// One probing round over every registered backend.
    pub async fn probe_all(&self) {
        let backends = self.registry.list();
        let probes = backends
            .iter()
            .map(|backend| self.probe_one(&backend.id, &backend.url));
        join_all(probes).await;
    }

    async fn probe_one(&self, id: &str, url: &str) {
        let request = self
            .client
            .get(format!("{}/api/tags", url))
            .timeout(PROBE_TIMEOUT);

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                self.registry.mark_healthy(id);
            }
            Ok(response) => {
                warn!("health check for {} failed: HTTP {}", id, response.status());
                self.registry.mark_unhealthy(id);
            }
            Err(err) => {
                warn!("health check for {} errored: {}", id, err);
                self.registry.mark_unhealthy(id);
            }
        }
    }
}

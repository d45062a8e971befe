//! # Backend Registry
//!
//! The registry is the single owner of backend records: identity, static
//! weight, health flags and live request metrics. Every mutation runs
//! under one registry-wide mutex held for short critical sections only;
//! readers copy snapshots out under the same lock. Nothing in this module
//! suspends while the lock is held.

use crate::error::GatewayError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{info, warn};

/// A backend becomes unhealthy after this many consecutive request
/// failures, independent of probe results.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Registry-owned backend record.
#[derive(Debug, Clone)]
struct Backend {
    id: String,
    url: String,
    weight: f64,
    is_healthy: bool,
    consecutive_errors: u32,
    health_check_failures: u32,
    active_connections: u32,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    total_response_time: f64,
    average_response_time: f64,
    total_tokens: u64,
    last_request_at: Option<DateTime<Utc>>,
    last_error_at: Option<DateTime<Utc>>,
}

impl Backend {
    fn new(id: String, url: String, weight: f64) -> Self {
        Self {
            id,
            url: url.trim_end_matches('/').to_string(),
            weight,
            is_healthy: true,
            consecutive_errors: 0,
            health_check_failures: 0,
            active_connections: 0,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            total_response_time: 0.0,
            average_response_time: 0.0,
            total_tokens: 0,
            last_request_at: None,
            last_error_at: None,
        }
    }
}

/// Immutable copy of a backend record, safe to hand to handlers, the
/// admin surface and metrics without touching the lock again.
#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    pub id: String,
    pub url: String,
    pub weight: f64,
    pub is_healthy: bool,
    pub consecutive_errors: u32,
    pub health_check_failures: u32,
    pub active_connections: u32,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_response_time: f64,
    pub total_tokens: u64,
    pub last_request_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
}

impl From<&Backend> for BackendSnapshot {
    fn from(backend: &Backend) -> Self {
        Self {
            id: backend.id.clone(),
            url: backend.url.clone(),
            weight: backend.weight,
            is_healthy: backend.is_healthy,
            consecutive_errors: backend.consecutive_errors,
            health_check_failures: backend.health_check_failures,
            active_connections: backend.active_connections,
            total_requests: backend.total_requests,
            successful_requests: backend.successful_requests,
            failed_requests: backend.failed_requests,
            average_response_time: backend.average_response_time,
            total_tokens: backend.total_tokens,
            last_request_at: backend.last_request_at,
            last_error_at: backend.last_error_at,
        }
    }
}

/// The fields a selection strategy is allowed to look at.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: String,
    pub active_connections: u32,
    pub total_requests: u64,
    pub weight: f64,
}

struct RegistryInner {
    backends: HashMap<String, Backend>,
    /// Insertion order; keeps round-robin selection stable.
    order: Vec<String>,
}

pub struct BackendRegistry {
    inner: Mutex<RegistryInner>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                backends: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    /// Build a registry from an ordered URL list, ids `ollama-1..n`.
    pub fn from_urls(urls: &[String]) -> Self {
        let registry = Self::new();
        for (i, url) in urls.iter().enumerate() {
            registry.add(&format!("ollama-{}", i + 1), url, 1.0);
        }
        registry
    }

    /// Register a backend. Idempotent by id: re-adding an existing id is
    /// a no-op.
    pub fn add(&self, id: &str, url: &str, weight: f64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.backends.contains_key(id) {
            return;
        }
        inner
            .backends
            .insert(id.to_string(), Backend::new(id.to_string(), url.to_string(), weight));
        inner.order.push(id.to_string());
        info!("registered backend {} ({})", id, url);
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.backends.remove(id).is_some() {
            inner.order.retain(|existing| existing != id);
            info!("removed backend {}", id);
            true
        } else {
            false
        }
    }

    pub fn get(&self, id: &str) -> Option<BackendSnapshot> {
        let inner = self.inner.lock().unwrap();
        inner.backends.get(id).map(BackendSnapshot::from)
    }

    /// Snapshots in registration order.
    pub fn list(&self) -> Vec<BackendSnapshot> {
        let inner = self.inner.lock().unwrap();
        inner
            .order
            .iter()
            .filter_map(|id| inner.backends.get(id))
            .map(BackendSnapshot::from)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn healthy_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.backends.values().filter(|b| b.is_healthy).count()
    }

    /// Select and reserve a backend in one critical section.
    ///
    /// Candidates are the healthy backends in registration order; when
    /// none are healthy the full set is offered unless `strict`, which
    /// yields `NoHealthyBackend` instead. The chosen backend's
    /// active-connection and total-request counters are incremented before
    /// the lock is released, so concurrent selections observe each other.
    /// The caller owes exactly one `update_metrics` call for the returned
    /// reservation.
    pub fn reserve_with<F>(&self, strict: bool, choose: F) -> Result<BackendSnapshot, GatewayError>
    where
        F: FnOnce(&[Candidate]) -> usize,
    {
        let mut inner = self.inner.lock().unwrap();
        if inner.backends.is_empty() {
            return Err(GatewayError::NoHealthyBackend);
        }

        let mut candidate_ids: Vec<String> = inner
            .order
            .iter()
            .filter(|id| inner.backends.get(*id).map(|b| b.is_healthy).unwrap_or(false))
            .cloned()
            .collect();

        if candidate_ids.is_empty() {
            if strict {
                return Err(GatewayError::NoHealthyBackend);
            }
            // Transient all-unhealthy state: offer the full set rather
            // than black-holing traffic.
            candidate_ids = inner.order.clone();
        }

        let candidates: Vec<Candidate> = candidate_ids
            .iter()
            .filter_map(|id| inner.backends.get(id))
            .map(|b| Candidate {
                id: b.id.clone(),
                active_connections: b.active_connections,
                total_requests: b.total_requests,
                weight: b.weight,
            })
            .collect();

        let index = choose(&candidates).min(candidates.len() - 1);
        let chosen_id = candidates[index].id.clone();

        let backend = inner
            .backends
            .get_mut(&chosen_id)
            .ok_or(GatewayError::NoHealthyBackend)?;
        backend.active_connections += 1;
        backend.total_requests += 1;
        backend.last_request_at = Some(Utc::now());

        Ok(BackendSnapshot::from(&*backend))
    }

    /// Record the outcome of a dispatch. Releases the reservation taken
    /// by `reserve_with` (active connections floored at zero) and updates
    /// success/failure accounting. Five consecutive failures clear the
    /// healthy flag.
    pub fn update_metrics(&self, id: &str, success: bool, response_time: f64, tokens: u64) {
        let mut inner = self.inner.lock().unwrap();
        let Some(backend) = inner.backends.get_mut(id) else {
            return;
        };

        backend.active_connections = backend.active_connections.saturating_sub(1);

        if success {
            backend.successful_requests += 1;
            backend.total_response_time += response_time;
            backend.total_tokens += tokens;
            backend.average_response_time =
                backend.total_response_time / backend.successful_requests as f64;
            backend.consecutive_errors = 0;
        } else {
            backend.failed_requests += 1;
            backend.consecutive_errors += 1;
            backend.last_error_at = Some(Utc::now());
            if backend.consecutive_errors >= MAX_CONSECUTIVE_ERRORS && backend.is_healthy {
                backend.is_healthy = false;
                warn!(
                    "backend {} marked unhealthy after {} consecutive errors",
                    id, backend.consecutive_errors
                );
            }
        }
    }

    pub fn mark_healthy(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(backend) = inner.backends.get_mut(id) {
            if !backend.is_healthy {
                info!("backend {} is healthy again", id);
            }
            backend.is_healthy = true;
            backend.health_check_failures = 0;
        }
    }

    pub fn mark_unhealthy(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(backend) = inner.backends.get_mut(id) {
            if backend.is_healthy {
                warn!("backend {} marked unhealthy", id);
            }
            backend.is_healthy = false;
            backend.health_check_failures += 1;
        }
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

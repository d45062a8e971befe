//! # Load Balancer
//!
//! Strategy-driven backend selection over the registry. Selection and
//! reservation happen in one registry critical section; the strategies
//! themselves are pure index choices over the candidate list.

use crate::error::GatewayError;
use crate::registry::{BackendRegistry, BackendSnapshot, Candidate};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Backend selection strategy, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    LeastConnections,
    Random,
    WeightedRandom,
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Strategy::RoundRobin),
            "least_connections" => Ok(Strategy::LeastConnections),
            "random" => Ok(Strategy::Random),
            "weighted_random" => Ok(Strategy::WeightedRandom),
            other => Err(format!("unknown load balancer strategy: {}", other)),
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::LeastConnections => "least_connections",
            Strategy::Random => "random",
            Strategy::WeightedRandom => "weighted_random",
        };
        f.write_str(name)
    }
}

pub struct LoadBalancer {
    registry: Arc<BackendRegistry>,
    strategy: Strategy,
    strict_unhealthy: bool,
    /// Monotonic round-robin cursor; wraps via modulo.
    cursor: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(registry: Arc<BackendRegistry>, strategy: Strategy, strict_unhealthy: bool) -> Self {
        Self {
            registry,
            strategy,
            strict_unhealthy,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Select and reserve a backend for one dispatch. The returned
    /// snapshot has its active-connection counter already incremented;
    /// the caller must follow up with exactly one
    /// `registry.update_metrics` call for it.
    pub fn acquire(&self) -> Result<BackendSnapshot, GatewayError> {
        let strategy = self.strategy;
        self.registry
            .reserve_with(self.strict_unhealthy, |candidates| match strategy {
                Strategy::RoundRobin => {
                    let cursor = self.cursor.fetch_add(1, Ordering::Relaxed);
                    cursor % candidates.len()
                }
                Strategy::LeastConnections => least_connections(candidates),
                Strategy::Random => fastrand::usize(..candidates.len()),
                Strategy::WeightedRandom => weighted_random(candidates),
            })
    }
}

/// Minimum active connections; ties broken by lowest total requests,
/// then lexicographically smallest id.
fn least_connections(candidates: &[Candidate]) -> usize {
    let mut best = 0;
    for (i, candidate) in candidates.iter().enumerate().skip(1) {
        let current = &candidates[best];
        let key = (
            candidate.active_connections,
            candidate.total_requests,
            candidate.id.as_str(),
        );
        let best_key = (
            current.active_connections,
            current.total_requests,
            current.id.as_str(),
        );
        if key < best_key {
            best = i;
        }
    }
    best
}

/// Probability proportional to weight; weight 0 is never selected while
/// any positive weight exists. An all-zero candidate set degrades to a
/// uniform pick so the no-black-hole property holds.
fn weighted_random(candidates: &[Candidate]) -> usize {
    let total: f64 = candidates.iter().map(|c| c.weight.max(0.0)).sum();
    if total <= 0.0 {
        return fastrand::usize(..candidates.len());
    }

    let mut roll = fastrand::f64() * total;
    for (i, candidate) in candidates.iter().enumerate() {
        roll -= candidate.weight.max(0.0);
        if roll < 0.0 {
            return i;
        }
    }
    candidates.len() - 1
}

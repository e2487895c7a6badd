/// Balancing algorithms between a vector of backend items.
///
/// Provides a public trait `LoadBalancing`, every different balancing algorithm implements this
/// trait exposing `next_backend` method.
use crate::backend::Backend;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Supported balancing algorithm types
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub enum BalancingAlgorithm {
    #[serde(rename = "round-robin")]
    RoundRobin,
    #[serde(rename = "least-connections")]
    LeastConnections,
}

impl Default for BalancingAlgorithm {
    fn default() -> BalancingAlgorithm {
        BalancingAlgorithm::RoundRobin
    }
}

/// Factory function, used to create the balancing policy based on the
/// requested type. The policy is a single startup decision; it never
/// changes for the life of the pool.
pub fn get_balancer(balancing_algo: &BalancingAlgorithm) -> Box<dyn LoadBalancing + Send + Sync> {
    match balancing_algo {
        BalancingAlgorithm::RoundRobin => Box::new(RoundRobinBalancing::new()),
        BalancingAlgorithm::LeastConnections => Box::new(LeastConnectionsBalancing::new()),
    }
}

/// Generic balancing algorithm trait. Exposes only one method `next_backend` which takes a
/// reference to a `Vec<Backend>` type. Implementations keep whatever cursor
/// state they need in atomics, so a shared pool can call them without a lock.
pub trait LoadBalancing {
    /// Return the index of the backend the next request should go to, or
    /// `None` if the algorithm cannot produce one.
    fn next_backend(&self, backends: &Vec<Backend>) -> Option<usize>;
}

pub struct RoundRobinBalancing {
    next_index: AtomicUsize,
}

impl RoundRobinBalancing {
    /// Create a new RoundRobinBalancing algorithm, cursor at the first
    /// backend.
    pub fn new() -> RoundRobinBalancing {
        RoundRobinBalancing {
            next_index: AtomicUsize::new(0),
        }
    }
}

impl LoadBalancing for RoundRobinBalancing {
    /// Cycle through the backends in index order, one step per call.
    ///
    /// Health is deliberately not inspected: a cycling cursor keeps the
    /// distribution uniform, and unhealthy picks surface as tracked
    /// failures instead.
    fn next_backend(&self, backends: &Vec<Backend>) -> Option<usize> {
        if backends.is_empty() {
            return None;
        }
        Some(self.next_index.fetch_add(1, Ordering::Relaxed) % backends.len())
    }
}

pub struct LeastConnectionsBalancing;

impl LeastConnectionsBalancing {
    pub fn new() -> LeastConnectionsBalancing {
        LeastConnectionsBalancing {}
    }
}

impl LoadBalancing for LeastConnectionsBalancing {
    /// Find the healthy backend with the fewest requests in flight, ties
    /// broken by the lowest index.
    ///
    /// Returns `None` when no backend is healthy; the pool decides what to
    /// do about a fully-dark registry. The in-flight counts read here may
    /// be a step stale under concurrency, which skews a selection by at
    /// most one request.
    fn next_backend(&self, backends: &Vec<Backend>) -> Option<usize> {
        backends
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_healthy())
            .min_by_key(|(_, b)| b.current_requests())
            .map(|(i, _)| i)
    }
}

use crate::balancing::LoadBalancing;
use log::info;
use std::error::Error;
use std::fmt;
use std::ops::Index;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, PartialEq)]
pub enum BackendError {
    EmptyPool,
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no backend servers configured")
    }
}

impl Error for BackendError {}

/// A single backend server and its runtime state: health, consecutive
/// failure strikes and the per-server metrics. Every mutable field is an
/// atomic so the state can be shared across tasks and threads without a
/// lock.
#[derive(Debug)]
pub struct Backend {
    pub address: String,
    pub port: u16,
    is_healthy: AtomicBool,
    failed_responses: AtomicU32,
    current_requests: AtomicUsize,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
    total_response_time_ms: AtomicU64,
}

impl Backend {
    /// Create a new Backend, initially healthy with zeroed metrics.
    pub fn new(address: String, port: u16) -> Backend {
        Backend {
            address,
            port,
            is_healthy: AtomicBool::new(true),
            failed_responses: AtomicU32::new(0),
            current_requests: AtomicUsize::new(0),
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_response_time_ms: AtomicU64::new(0),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.is_healthy.load(Ordering::SeqCst)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn failed_responses(&self) -> u32 {
        self.failed_responses.load(Ordering::Relaxed)
    }

    /// Requests currently in flight on this backend.
    pub fn current_requests(&self) -> usize {
        self.current_requests.load(Ordering::Relaxed)
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }

    pub fn total_response_time_ms(&self) -> u64 {
        self.total_response_time_ms.load(Ordering::Relaxed)
    }

    /// Mean response time over every tracked request, failures included.
    pub fn avg_response_time_ms(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            return 0.0;
        }
        self.total_response_time_ms() as f64 / total as f64
    }

    pub fn failure_rate_pct(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            return 0.0;
        }
        self.total_failures() as f64 / total as f64 * 100.0
    }

    /// A request was routed here: one more in flight, one more total.
    pub fn track_start(&self) {
        self.current_requests.fetch_add(1, Ordering::Relaxed);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// The request finished; fold its outcome into the metrics.
    pub fn track_end(&self, success: bool, response_time_ms: u64) {
        self.current_requests.fetch_sub(1, Ordering::Relaxed);
        if !success {
            self.total_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.total_response_time_ms
            .fetch_add(response_time_ms, Ordering::Relaxed);
    }

    /// Advance the health state machine. A failure adds a strike and flips
    /// the server unhealthy at `max_failures` consecutive strikes; any
    /// success clears the strikes and restores health. Returns the new
    /// health value when it actually changed, so callers can log the
    /// transition exactly once.
    pub fn update_status(&self, success: bool, max_failures: u32) -> Option<bool> {
        if success {
            self.failed_responses.store(0, Ordering::Relaxed);
            if !self.is_healthy.swap(true, Ordering::SeqCst) {
                return Some(true);
            }
        } else {
            let failed = self.failed_responses.fetch_add(1, Ordering::Relaxed) + 1;
            if failed >= max_failures && self.is_healthy.swap(false, Ordering::SeqCst) {
                return Some(false);
            }
        }
        None
    }

    /// Force the server back into rotation: strikes cleared, healthy again.
    /// Returns true when it was unhealthy before.
    pub fn revive(&self) -> bool {
        self.failed_responses.store(0, Ordering::Relaxed);
        !self.is_healthy.swap(true, Ordering::SeqCst)
    }
}

/// The fixed registry of backend servers, the balancing policy chosen at
/// startup and the aggregate metrics. Selection and metric updates are all
/// lock-free; nothing here is held across I/O.
pub struct BackendPool {
    backends: Vec<Backend>,
    balancing_algo: Box<dyn LoadBalancing + Send + Sync>,
    max_failures: u32,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
    total_response_time_ms: AtomicU64,
}

impl BackendPool {
    /// Create a new, empty BackendPool.
    pub fn new(balancing_algo: Box<dyn LoadBalancing + Send + Sync>, max_failures: u32) -> BackendPool {
        BackendPool {
            backends: Vec::new(),
            balancing_algo,
            max_failures,
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_response_time_ms: AtomicU64::new(0),
        }
    }

    pub fn from_backends_list(
        backends: Vec<Backend>,
        balancing_algo: Box<dyn LoadBalancing + Send + Sync>,
        max_failures: u32,
    ) -> BackendPool {
        BackendPool {
            backends,
            balancing_algo,
            max_failures,
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_response_time_ms: AtomicU64::new(0),
        }
    }

    pub fn push(&mut self, backend: Backend) {
        self.backends.push(backend);
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<Backend> {
        self.backends.iter()
    }

    /// Pick the backend for the next request according to the configured
    /// policy.
    ///
    /// When the policy cannot produce a server because every backend is
    /// unhealthy, the first server is forced back to healthy and returned:
    /// the proxy degrades through a bad backend rather than dead-stopping
    /// on a transient outage.
    ///
    /// # Errors
    ///
    /// Returns `Err(BackendError::EmptyPool)` only when the pool holds no
    /// servers at all.
    pub fn next_backend(&self) -> Result<usize, BackendError> {
        if self.backends.is_empty() {
            return Err(BackendError::EmptyPool);
        }
        let index = match self.balancing_algo.next_backend(&self.backends) {
            Some(i) => i,
            None => self.revive_first(),
        };
        let server = &self.backends[index];
        info!("Selected backend server {}:{}", server.address, server.port);
        Ok(index)
    }

    fn revive_first(&self) -> usize {
        let server = &self.backends[0];
        if server.revive() {
            info!(
                "[STATUS] Server {}:{} marked as healthy",
                server.address, server.port
            );
        }
        0
    }

    pub fn has_healthy_backend(&self) -> bool {
        self.backends.iter().any(|b| b.is_healthy())
    }

    pub fn is_available(&self, index: usize) -> bool {
        self.backends[index].is_healthy()
    }

    /// Record the start of a request routed to `backends[index]`.
    pub fn track_start(&self, index: usize) {
        self.backends[index].track_start();
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the end of a request: per-server and aggregate metrics,
    /// health-state update, then the metric log records.
    pub fn track_end(&self, index: usize, success: bool, response_time_ms: u64) {
        self.backends[index].track_end(success, response_time_ms);
        if !success {
            self.total_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.total_response_time_ms
            .fetch_add(response_time_ms, Ordering::Relaxed);
        self.update_status(index, success);
        self.log_metrics(index);
    }

    /// Fold a request outcome into the server's health state, logging the
    /// transition when it flips.
    pub fn update_status(&self, index: usize, success: bool) {
        let server = &self.backends[index];
        if let Some(healthy) = server.update_status(success, self.max_failures) {
            info!(
                "[STATUS] Server {}:{} marked as {}",
                server.address,
                server.port,
                if healthy { "healthy" } else { "unhealthy" }
            );
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }

    pub fn total_response_time_ms(&self) -> u64 {
        self.total_response_time_ms.load(Ordering::Relaxed)
    }

    pub fn avg_response_time_ms(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            return 0.0;
        }
        self.total_response_time_ms() as f64 / total as f64
    }

    fn log_metrics(&self, index: usize) {
        let server = &self.backends[index];
        info!(
            "[METRIC][SERVER {}:{}] Active: {}, Total: {}, Failures: {}, Avg Response: {:.2}ms",
            server.address,
            server.port,
            server.current_requests(),
            server.total_requests(),
            server.total_failures(),
            server.avg_response_time_ms()
        );
        info!(
            "[METRIC][SYSTEM] Total Requests: {}, Total Failures: {}, Avg Response: {:.2}ms",
            self.total_requests(),
            self.total_failures(),
            self.avg_response_time_ms()
        );
    }
}

impl Index<usize> for BackendPool {
    type Output = Backend;
    fn index(&self, index: usize) -> &Self::Output {
        &self.backends[index]
    }
}

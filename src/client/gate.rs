//! Concurrency gate shared by all fetches of one dispatch call.
//!
//! Epistemic foundation:
//! - K_i: Every fetch holds one global permit and one permit for its host
//! - K_i: Global capacity and per-host capacity are configured independently
//! - I^B: Backend capacity is unknowable → bound outstanding work instead

use crate::models::FetchError;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

/// Held for the duration of one request; releases both permits on drop.
#[derive(Debug)]
pub struct GatePermit {
    _host: OwnedSemaphorePermit,
    _global: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Fixed-capacity permit set with a per-host cap.
#[derive(Debug)]
pub struct ConcurrencyGate {
    global: Arc<Semaphore>,
    hosts: DashMap<String, Arc<Semaphore>>,
    capacity: usize,
    per_host_limit: usize,
    // Stats
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: AtomicUsize,
    total_acquired: AtomicU64,
}

impl ConcurrencyGate {
    /// Create a gate. Zero capacities are raised to one.
    pub fn new(capacity: usize, per_host_limit: usize) -> Self {
        let capacity = capacity.max(1);
        let per_host_limit = per_host_limit.max(1);
        Self {
            global: Arc::new(Semaphore::new(capacity)),
            hosts: DashMap::new(),
            capacity,
            per_host_limit,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: AtomicUsize::new(0),
            total_acquired: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn per_host_limit(&self) -> usize {
        self.per_host_limit
    }

    fn host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        self.hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    /// Wait for a host permit, then a global permit.
    pub async fn acquire(&self, host: &str) -> Result<GatePermit, FetchError> {
        let host_permit = self
            .host_semaphore(host)
            .acquire_owned()
            .await
            .map_err(|_| FetchError::GateClosed)?;
        let global_permit = Arc::clone(&self.global)
            .acquire_owned()
            .await
            .map_err(|_| FetchError::GateClosed)?;

        let now = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::Relaxed);
        self.total_acquired.fetch_add(1, Ordering::Relaxed);
        trace!(host = host, in_flight = now, "Gate permit acquired");

        Ok(GatePermit {
            _host: host_permit,
            _global: global_permit,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// Get statistics.
    pub fn stats(&self) -> GateStats {
        GateStats {
            in_flight: self.in_flight.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::Relaxed),
            total_acquired: self.total_acquired.load(Ordering::Relaxed),
            hosts_tracked: self.hosts.len(),
        }
    }
}

/// Gate statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateStats {
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub total_acquired: u64,
    pub hosts_tracked: usize,
}

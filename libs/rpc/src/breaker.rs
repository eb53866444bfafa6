//! Failure-counting circuit breaker.
//!
//! Two states only: closed and open. An open breaker closes again purely by
//! elapsed time; there is no half-open probe. A success resets the failure
//! counter but never shortens an open window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use switchboard_core::{BreakerConfig, BreakerScope};
use tokio::time::Instant;
use tracing::warn;

use crate::error::{Result, RpcError};

#[derive(Debug, Default)]
struct BreakerState {
    fail_count: u32,
    opened_at: Option<Instant>,
}

/// Shared failure counter plus open-until timestamp.
///
/// Clone the surrounding `Arc` to share one breaker between clients.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    open_for: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_for: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            open_for,
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub fn from_config(config: &BreakerConfig) -> Self {
        Self::new(config.failure_threshold, config.open_for())
    }

    /// Gate a call. Rejects while open; trips a breaker that has reached its
    /// threshold but was never marked open.
    pub fn check(&self) -> Result<()> {
        let now = Instant::now();
        let mut state = self.state.lock();
        if self.is_open_at(&state, now) {
            return Err(RpcError::CircuitOpen);
        }
        if state.fail_count >= self.failure_threshold && state.opened_at.is_none() {
            state.opened_at = Some(now);
            warn!(
                fail_count = state.fail_count,
                open_for = ?self.open_for,
                "circuit breaker opened"
            );
            return Err(RpcError::CircuitOpen);
        }
        Ok(())
    }

    pub fn record_success(&self) {
        self.state.lock().fail_count = 0;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.fail_count = state.fail_count.saturating_add(1);
    }

    /// Re-evaluate after a call ran out of attempts. Returns whether the
    /// breaker opened now.
    pub fn trip_if_exhausted(&self) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.fail_count >= self.failure_threshold && !self.is_open_at(&state, now) {
            state.opened_at = Some(now);
            warn!(
                fail_count = state.fail_count,
                open_for = ?self.open_for,
                "circuit breaker opened"
            );
            return true;
        }
        false
    }

    pub fn is_open(&self) -> bool {
        let state = self.state.lock();
        self.is_open_at(&state, Instant::now())
    }

    pub fn fail_count(&self) -> u32 {
        self.state.lock().fail_count
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    fn is_open_at(&self, state: &BreakerState, now: Instant) -> bool {
        state
            .opened_at
            .is_some_and(|opened_at| now.saturating_duration_since(opened_at) < self.open_for)
    }
}

/// Hands out the breaker that governs a given queue.
#[derive(Debug)]
pub struct BreakerPool {
    config: BreakerConfig,
    shared: Arc<CircuitBreaker>,
    per_queue: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerPool {
    pub fn new(config: BreakerConfig) -> Self {
        let shared = Arc::new(CircuitBreaker::from_config(&config));
        Self::with_shared(config, shared)
    }

    /// Pool whose process-scope breaker is `shared`.
    pub fn with_shared(config: BreakerConfig, shared: Arc<CircuitBreaker>) -> Self {
        Self {
            config,
            shared,
            per_queue: Mutex::new(HashMap::new()),
        }
    }

    pub fn scope(&self) -> BreakerScope {
        self.config.scope
    }

    pub fn for_queue(&self, queue: &str) -> Arc<CircuitBreaker> {
        match self.config.scope {
            BreakerScope::Process => Arc::clone(&self.shared),
            BreakerScope::Endpoint => Arc::clone(
                self.per_queue
                    .lock()
                    .entry(queue.to_owned())
                    .or_insert_with(|| Arc::new(CircuitBreaker::from_config(&self.config))),
            ),
        }
    }
}

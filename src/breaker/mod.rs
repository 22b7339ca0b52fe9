//! Per-device circuit breaker + concurrency limiter.
//!
//! State transitions and the concurrency cap are implemented lock-free
//! via atomics ("Breaker state: lock-free via atomics"),
//! in the style of `connector_runtime::CircuitBreaker` and
//! `queue_keeper_core::circuit_breaker` from the retrieved resilience
//! examples.

use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

/// Observable state of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub timeout: Duration,
    pub max_concurrency: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            max_concurrency: 16,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerMetrics {
    pub state: CircuitState,
    pub total_requests: u64,
    pub total_failures: u64,
    pub current_failures: u32,
    pub successes: u64,
    pub current_concurrency: u32,
}

/// Errors the breaker itself produces, distinct from the wrapped
/// operation's own error type. These are never counted as
/// operation failures, since no I/O was attempted).
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum BreakerRejection {
    #[error("circuit is open")]
    CircuitOpen,
    #[error("concurrency limit exceeded")]
    ConcurrencyExceeded,
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error(transparent)]
    Rejected(#[from] BreakerRejection),
    #[error("operation failed: {0}")]
    Operation(E),
}

/// Lets `CircuitBreaker::call` tell transient I/O failures (which should
/// trip the breaker) apart from validation errors that were surfaced
/// without any I/O being attempted ("NOT counted as breaker failure").
/// Defaults to `true` so error types that don't opt in behave as before.
pub trait BreakerFailure {
    fn counts_as_breaker_failure(&self) -> bool {
        true
    }
}

/// RAII guard for the concurrency slot acquired by `CircuitBreaker::call`.
/// Release on every exit path, including the wrapped future panicking.
struct ConcurrencyPermit<'a> {
    counter: &'a AtomicU32,
}

impl Drop for ConcurrencyPermit<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A circuit breaker guarding one device (or any other gated resource).
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: AtomicU8,
    failures: AtomicU32,
    concurrent_requests: AtomicU32,
    last_failure_at: AtomicI64,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
    successes: AtomicU64,
    // Guards the Open -> HalfOpen transition so only one caller "wins"
    // the probe slot; plain atomics can't express that compare-and-swap
    // cleanly across (state, failures-reset) together.
    half_open_gate: Mutex<()>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(CircuitState::Closed.to_u8()),
            failures: AtomicU32::new(0),
            concurrent_requests: AtomicU32::new(0),
            last_failure_at: AtomicI64::new(0),
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            half_open_gate: Mutex::new(()),
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn metrics(&self) -> BreakerMetrics {
        BreakerMetrics {
            state: self.state(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            current_failures: self.failures.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            current_concurrency: self.concurrent_requests.load(Ordering::Relaxed),
        }
    }

    pub fn force_open(&self) {
        self.state.store(CircuitState::Open.to_u8(), Ordering::Release);
        self.last_failure_at.store(now_millis(), Ordering::Release);
    }

    pub fn force_close(&self) {
        self.state.store(CircuitState::Closed.to_u8(), Ordering::Release);
        self.failures.store(0, Ordering::Release);
    }

    pub fn reset(&self) {
        self.force_close();
        self.total_requests.store(0, Ordering::Release);
        self.total_failures.store(0, Ordering::Release);
        self.successes.store(0, Ordering::Release);
    }

    /// Whether a call would be allowed right now, without acquiring a
    /// concurrency slot or mutating the half-open gate. Used by callers
    /// that want to short-circuit before doing any setup work.
    pub fn allows_requests(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = now_millis() - self.last_failure_at.load(Ordering::Acquire);
                elapsed >= self.config.timeout.as_millis() as i64
            }
        }
    }

    /// Execute `operation` under breaker + concurrency-limiter protection
    /// Always releases the concurrency slot on every exit
    /// path, including the operation panicking.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: BreakerFailure,
    {
        if let Err(rejection) = self.try_enter() {
            return Err(rejection.into());
        }

        // `fetch_add` returns the pre-increment value, so `+ 1` below is
        // the post-increment count this call just raised it to.
        let permit = ConcurrencyPermit {
            counter: &self.concurrent_requests,
        };
        if self.concurrent_requests.fetch_add(1, Ordering::AcqRel) + 1 > self.config.max_concurrency
        {
            // `permit`'s `Drop` undoes the increment we just made.
            return Err(BreakerRejection::ConcurrencyExceeded.into());
        }

        self.total_requests.fetch_add(1, Ordering::Relaxed);
        // `permit` is dropped (releasing the concurrency slot) whether
        // `operation()` resolves normally or this call frame unwinds from
        // a panic inside it, since the guard's `Drop` always runs during
        // unwinding.
        let result = operation().await;
        drop(permit);

        match result {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                if err.counts_as_breaker_failure() {
                    self.on_failure();
                }
                Err(BreakerError::Operation(err))
            }
        }
    }

    /// Checks state and performs the Open -> HalfOpen transition if the
    /// timeout has elapsed, without touching the concurrency counter.
    fn try_enter(&self) -> Result<(), BreakerRejection> {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let _gate = self.half_open_gate.lock();
                // Re-check under the gate: another caller may have
                // already flipped us to HalfOpen while we waited.
                if self.state() != CircuitState::Open {
                    return Ok(());
                }
                let elapsed = now_millis() - self.last_failure_at.load(Ordering::Acquire);
                if elapsed >= self.config.timeout.as_millis() as i64 {
                    self.state
                        .store(CircuitState::HalfOpen.to_u8(), Ordering::Release);
                    self.failures.store(0, Ordering::Release);
                    Ok(())
                } else {
                    Err(BreakerRejection::CircuitOpen)
                }
            }
        }
    }

    fn on_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        match self.state() {
            CircuitState::HalfOpen => {
                self.state.store(CircuitState::Closed.to_u8(), Ordering::Release);
                self.failures.store(0, Ordering::Release);
            }
            CircuitState::Closed => {
                self.failures.store(0, Ordering::Release);
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        self.last_failure_at.store(now_millis(), Ordering::Release);
        match self.state() {
            CircuitState::HalfOpen => {
                self.state.store(CircuitState::Open.to_u8(), Ordering::Release);
            }
            CircuitState::Closed => {
                let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.state.store(CircuitState::Open.to_u8(), Ordering::Release);
                }
            }
            CircuitState::Open => {}
        }
    }
}

/// Wall-clock milliseconds, used for the breaker's recovery-timeout
/// bookkeeping (comparable across the whole process lifetime, unlike a
/// `tokio::time::Instant` epoch).
fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

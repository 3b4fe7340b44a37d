//! Circuit breaker with dual-level failure accounting and durable state
//!
//! The breaker is a CLOSED / OPEN / HALF_OPEN state machine. It keeps two
//! independent failure accountings (whole-request outcomes and individual
//! attempt outcomes) and trips on whichever one `track_individual_attempts`
//! selects. State is persisted through an optional [`BreakerStore`] after
//! every mutation so a process restart resumes where the last one left off.
//!
//! ```text
//! CLOSED (normal) ──[failure rate ≥ threshold]──► OPEN (rejecting)
//!                                                     │
//!                                            [recovery timeout]
//!                                                     │
//!                                                     ▼
//!                                               HALF_OPEN (probing)
//!                                                     │
//!                              ┌──────────────────────┴──────────────┐
//!                      [probe success rate ≥ threshold]       [below threshold]
//!                              │                                     │
//!                              ▼                                     ▼
//!                           CLOSED                                 OPEN
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, StableError};

/// State of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Requests pass through normally
    Closed,
    /// Requests are rejected until the recovery timeout elapses
    Open,
    /// A bounded probe window decides between re-close and re-open
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("CLOSED"),
            CircuitState::Open => f.write_str("OPEN"),
            CircuitState::HalfOpen => f.write_str("HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior.
///
/// Values are clamped at construction: the failure threshold to `[0, 100]`,
/// `minimum_requests` to at least 1 and `recovery_timeout_ms` to at least
/// 100.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failure percentage at which the closed circuit opens
    pub failure_threshold_percentage: f64,

    /// Outcomes required before the failure rate is evaluated
    pub minimum_requests: u64,

    /// How long the circuit stays open before probing
    pub recovery_timeout_ms: u64,

    /// Probe success percentage required to re-close
    pub success_threshold_percentage: f64,

    /// Number of probe outcomes collected in half-open
    pub half_open_max_requests: u64,

    /// Trip on per-attempt outcomes instead of whole-request outcomes
    pub track_individual_attempts: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold_percentage: 50.0,
            minimum_requests: 10,
            recovery_timeout_ms: 30_000,
            success_threshold_percentage: 50.0,
            half_open_max_requests: 5,
            track_individual_attempts: false,
        }
    }
}

impl CircuitBreakerConfig {
    fn clamped(mut self) -> Self {
        self.failure_threshold_percentage = self.failure_threshold_percentage.clamp(0.0, 100.0);
        self.minimum_requests = self.minimum_requests.max(1);
        self.recovery_timeout_ms = self.recovery_timeout_ms.max(100);
        self
    }
}

/// One total/failed/succeeded accounting bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterTriplet {
    pub total: u64,
    pub failed: u64,
    pub succeeded: u64,
}

impl CounterTriplet {
    fn record(&mut self, success: bool) {
        self.total += 1;
        if success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn failure_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failed as f64 / self.total as f64 * 100.0
        }
    }

    fn is_consistent(&self) -> bool {
        self.failed + self.succeeded <= self.total
    }
}

/// Persistable breaker state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,

    pub requests: CounterTriplet,
    pub attempts: CounterTriplet,
    pub half_open: CounterTriplet,

    /// Epoch ms of the last recorded failure
    pub last_failure_time: i64,

    pub state_transitions: u64,
    pub last_state_change_time: i64,
    pub open_count: u64,
    pub half_open_count: u64,
    pub total_open_duration_ms: i64,
    pub last_open_time: i64,

    pub recovery_attempts: u64,
    pub successful_recoveries: u64,
    pub failed_recoveries: u64,
}

impl Default for BreakerSnapshot {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            requests: CounterTriplet::default(),
            attempts: CounterTriplet::default(),
            half_open: CounterTriplet::default(),
            last_failure_time: 0,
            state_transitions: 0,
            last_state_change_time: 0,
            open_count: 0,
            half_open_count: 0,
            total_open_duration_ms: 0,
            last_open_time: 0,
            recovery_attempts: 0,
            successful_recoveries: 0,
            failed_recoveries: 0,
        }
    }
}

impl BreakerSnapshot {
    /// Validate the structural invariants of a restored snapshot.
    pub fn is_consistent(&self) -> bool {
        self.requests.is_consistent()
            && self.attempts.is_consistent()
            && self.half_open.is_consistent()
            && (self.state != CircuitState::Open || self.last_open_time > 0)
    }
}

/// Derived statistics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub requests: CounterTriplet,
    pub attempts: CounterTriplet,
    pub half_open: CounterTriplet,

    pub state_transitions: u64,
    pub open_count: u64,
    pub half_open_count: u64,
    pub total_open_duration_ms: i64,

    pub recovery_attempts: u64,
    pub successful_recoveries: u64,
    pub failed_recoveries: u64,

    pub average_open_duration_ms: f64,
    pub recovery_success_rate: f64,

    /// Projected end of the current open window, when open
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_until: Option<i64>,
}

/// Persistence hook for breaker state. Failures are logged and swallowed.
#[async_trait]
pub trait BreakerStore: Send + Sync {
    async fn load(&self) -> std::result::Result<Option<BreakerSnapshot>, String>;
    async fn store(&self, snapshot: &BreakerSnapshot) -> std::result::Result<(), String>;
}

/// Which accounting bucket a recorded outcome belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Accounting {
    Request,
    Attempt,
}

/// Circuit breaker protecting one upstream.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerSnapshot>,
    store: Option<Arc<dyn BreakerStore>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config: config.clamped(),
            inner: Mutex::new(BreakerSnapshot::default()),
            store: None,
        }
    }

    pub fn new_default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    pub fn with_store(config: CircuitBreakerConfig, store: Arc<dyn BreakerStore>) -> Self {
        Self {
            config: config.clamped(),
            inner: Mutex::new(BreakerSnapshot::default()),
            store: Some(store),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Restore persisted state, when a store is attached. Inconsistent or
    /// unreadable snapshots are discarded with a warning.
    pub async fn initialize(&self) {
        let Some(store) = &self.store else { return };

        match store.load().await {
            Ok(Some(snapshot)) => {
                if snapshot.is_consistent() {
                    debug!(state = %snapshot.state, "breaker state restored");
                    *self.inner.lock().await = snapshot;
                } else {
                    warn!("persisted breaker state is inconsistent, starting fresh");
                }
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "breaker load failed, starting fresh"),
        }
    }

    /// Current state without side effects.
    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Full persistable snapshot.
    pub async fn snapshot(&self) -> BreakerSnapshot {
        self.inner.lock().await.clone()
    }

    /// Admission check. May transition OPEN → HALF_OPEN when the recovery
    /// timeout has elapsed.
    pub async fn can_execute(&self) -> bool {
        let now = Utc::now().timestamp_millis();
        let mut inner = self.inner.lock().await;

        let (allowed, mutated) = match inner.state {
            CircuitState::Closed => (true, false),
            CircuitState::Open => {
                if now - inner.last_failure_time >= self.config.recovery_timeout_ms as i64 {
                    transition(&mut inner, CircuitState::HalfOpen, now);
                    inner.recovery_attempts += 1;
                    debug!("circuit breaker probing after recovery timeout");
                    (true, true)
                } else {
                    (false, false)
                }
            }
            CircuitState::HalfOpen => {
                (inner.half_open.total < self.config.half_open_max_requests, false)
            }
        };

        let snapshot = mutated.then(|| inner.clone());
        drop(inner);

        if let Some(snapshot) = snapshot {
            self.persist(&snapshot).await;
        }

        allowed
    }

    /// Record a whole-request success.
    pub async fn record_success(&self) {
        self.record(Accounting::Request, true).await;
    }

    /// Record a whole-request failure.
    pub async fn record_failure(&self) {
        self.record(Accounting::Request, false).await;
    }

    /// Record a single attempt's success.
    pub async fn record_attempt_success(&self) {
        self.record(Accounting::Attempt, true).await;
    }

    /// Record a single attempt's failure.
    pub async fn record_attempt_failure(&self) {
        self.record(Accounting::Attempt, false).await;
    }

    async fn record(&self, accounting: Accounting, success: bool) {
        let now = Utc::now().timestamp_millis();
        let mut inner = self.inner.lock().await;

        match accounting {
            Accounting::Request => inner.requests.record(success),
            Accounting::Attempt => inner.attempts.record(success),
        }
        if !success {
            inner.last_failure_time = now;
        }

        match inner.state {
            CircuitState::Closed => {
                // Only the accounting selected by the config trips the
                // threshold check.
                let active = match (self.config.track_individual_attempts, accounting) {
                    (true, Accounting::Attempt) => Some(inner.attempts),
                    (false, Accounting::Request) => Some(inner.requests),
                    _ => None,
                };

                if let Some(triplet) = active {
                    if triplet.total >= self.config.minimum_requests
                        && triplet.failure_rate() >= self.config.failure_threshold_percentage
                    {
                        transition(&mut inner, CircuitState::Open, now);
                        inner.open_count += 1;
                        inner.last_open_time = now;
                        warn!(
                            failure_rate = triplet.failure_rate(),
                            "circuit breaker opened"
                        );
                    } else if triplet.total >= 10 * self.config.minimum_requests {
                        // Periodic reset keeps stale history from dominating
                        // the failure rate.
                        inner.requests.reset();
                        inner.attempts.reset();
                        inner.half_open.reset();
                    }
                }
            }
            CircuitState::HalfOpen => {
                inner.half_open.record(success);

                if inner.half_open.total >= self.config.half_open_max_requests {
                    let success_rate = if inner.half_open.total == 0 {
                        0.0
                    } else {
                        inner.half_open.succeeded as f64 / inner.half_open.total as f64 * 100.0
                    };

                    if success_rate >= self.config.success_threshold_percentage {
                        transition(&mut inner, CircuitState::Closed, now);
                        inner.successful_recoveries += 1;
                        inner.requests.reset();
                        inner.attempts.reset();
                        debug!(success_rate, "circuit breaker recovered");
                    } else {
                        transition(&mut inner, CircuitState::Open, now);
                        inner.failed_recoveries += 1;
                        inner.open_count += 1;
                        inner.last_open_time = now;
                        warn!(success_rate, "circuit breaker re-opened after probing");
                    }
                }
            }
            // Results landing after the circuit opened are counted in the
            // triplets above but never drive a transition.
            CircuitState::Open => {}
        }

        let snapshot = inner.clone();
        drop(inner);
        self.persist(&snapshot).await;
    }

    /// Run an operation under breaker protection.
    ///
    /// Admission denial yields [`StableError::CircuitOpen`]; the operation's
    /// own error is recorded and rethrown.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if !self.can_execute().await {
            return Err(StableError::CircuitOpen);
        }

        match op().await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(err) => {
                if err.should_trip_breaker() {
                    self.record_failure().await;
                }
                Err(err)
            }
        }
    }

    /// Derived statistics.
    pub async fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock().await;

        BreakerStats {
            state: inner.state,
            requests: inner.requests,
            attempts: inner.attempts,
            half_open: inner.half_open,
            state_transitions: inner.state_transitions,
            open_count: inner.open_count,
            half_open_count: inner.half_open_count,
            total_open_duration_ms: inner.total_open_duration_ms,
            recovery_attempts: inner.recovery_attempts,
            successful_recoveries: inner.successful_recoveries,
            failed_recoveries: inner.failed_recoveries,
            average_open_duration_ms: if inner.open_count == 0 {
                0.0
            } else {
                inner.total_open_duration_ms as f64 / inner.open_count as f64
            },
            recovery_success_rate: if inner.recovery_attempts == 0 {
                0.0
            } else {
                inner.successful_recoveries as f64 / inner.recovery_attempts as f64 * 100.0
            },
            open_until: (inner.state == CircuitState::Open)
                .then(|| inner.last_failure_time + self.config.recovery_timeout_ms as i64),
        }
    }

    async fn persist(&self, snapshot: &BreakerSnapshot) {
        if let Some(store) = &self.store {
            if let Err(err) = store.store(snapshot).await {
                warn!(error = %err, "breaker store failed");
            }
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("store", &self.store.is_some())
            .finish()
    }
}

/// Apply a state change with the shared bookkeeping: transition count,
/// half-open counter reset and open-duration accumulation.
fn transition(inner: &mut BreakerSnapshot, next: CircuitState, now: i64) {
    if inner.state == CircuitState::Open && inner.last_open_time > 0 {
        inner.total_open_duration_ms += now - inner.last_open_time;
    }
    if next == CircuitState::HalfOpen {
        inner.half_open_count += 1;
    }

    inner.state = next;
    inner.state_transitions += 1;
    inner.last_state_change_time = now;
    inner.half_open.reset();
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use super::*;

    fn quick_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold_percentage: 50.0,
            minimum_requests: 4,
            recovery_timeout_ms: 100,
            success_threshold_percentage: 50.0,
            half_open_max_requests: 2,
            track_individual_attempts: false,
        }
    }

    async fn open_breaker(breaker: &CircuitBreaker) {
        for _ in 0..breaker.config().minimum_requests {
            breaker.record_failure().await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[test]
    fn test_config_clamping() {
        let config = CircuitBreakerConfig {
            failure_threshold_percentage: 150.0,
            minimum_requests: 0,
            recovery_timeout_ms: 5,
            ..Default::default()
        };
        let breaker = CircuitBreaker::new(config);

        assert_eq!(breaker.config().failure_threshold_percentage, 100.0);
        assert_eq!(breaker.config().minimum_requests, 1);
        assert_eq!(breaker.config().recovery_timeout_ms, 100);
    }

    #[tokio::test]
    async fn test_opens_at_failure_threshold() {
        let breaker = CircuitBreaker::new(quick_config());

        // Two failures, two successes: 50% at minimum volume.
        breaker.record_failure().await;
        breaker.record_success().await;
        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);

        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        let stats = breaker.stats().await;
        assert_eq!(stats.open_count, 1);
        assert!(stats.open_until.is_some());
    }

    #[tokio::test]
    async fn test_does_not_open_below_minimum_requests() {
        let breaker = CircuitBreaker::new(quick_config());

        breaker.record_failure().await;
        breaker.record_failure().await;
        breaker.record_failure().await;

        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert!(breaker.can_execute().await);
    }

    #[tokio::test]
    async fn test_open_denies_until_recovery_timeout() {
        let breaker = CircuitBreaker::new(quick_config());
        open_breaker(&breaker).await;

        assert!(!breaker.can_execute().await);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(breaker.can_execute().await);
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        let stats = breaker.stats().await;
        assert_eq!(stats.recovery_attempts, 1);
        assert_eq!(stats.half_open_count, 1);
        assert!(stats.total_open_duration_ms >= 100);
    }

    #[tokio::test]
    async fn test_half_open_closes_on_probe_success() {
        let breaker = CircuitBreaker::new(quick_config());
        open_breaker(&breaker).await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(breaker.can_execute().await);

        breaker.record_success().await;
        breaker.record_success().await;

        assert_eq!(breaker.state().await, CircuitState::Closed);

        let stats = breaker.stats().await;
        assert_eq!(stats.successful_recoveries, 1);
        assert_eq!(stats.recovery_success_rate, 100.0);
        // Closed-state triplets reset on recovery.
        assert_eq!(stats.requests, CounterTriplet::default());
        assert_eq!(stats.attempts, CounterTriplet::default());
    }

    #[tokio::test]
    async fn test_half_open_reopens_on_probe_failure() {
        let breaker = CircuitBreaker::new(quick_config());
        open_breaker(&breaker).await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(breaker.can_execute().await);

        breaker.record_failure().await;
        breaker.record_failure().await;

        assert_eq!(breaker.state().await, CircuitState::Open);
        assert_eq!(breaker.stats().await.failed_recoveries, 1);
        assert!(!breaker.can_execute().await);
    }

    #[tokio::test]
    async fn test_half_open_mixed_probe_meets_threshold() {
        // 50% threshold with one success and one failure re-closes.
        let breaker = CircuitBreaker::new(quick_config());
        open_breaker(&breaker).await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(breaker.can_execute().await);

        breaker.record_failure().await;
        breaker.record_success().await;

        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_admission_bounded_by_probe_window() {
        let breaker = CircuitBreaker::new(quick_config());
        open_breaker(&breaker).await;
        tokio::time::sleep(Duration::from_millis(120)).await;

        // First call transitions to half-open; admissions continue until the
        // probe window fills with outcomes.
        assert!(breaker.can_execute().await);
        assert!(breaker.can_execute().await);

        breaker.record_failure().await;
        breaker.record_failure().await;

        // Window evaluated, breaker re-opened, admission denied again.
        assert!(!breaker.can_execute().await);
    }

    #[tokio::test]
    async fn test_counter_hygiene_resets_at_ten_times_minimum() {
        let config = CircuitBreakerConfig {
            minimum_requests: 1,
            failure_threshold_percentage: 100.0,
            ..quick_config()
        };
        let breaker = CircuitBreaker::new(config);

        for _ in 0..10 {
            breaker.record_success().await;
        }

        // Total hit 10 × minimum and reset to zero.
        assert_eq!(breaker.snapshot().await.requests, CounterTriplet::default());
    }

    #[tokio::test]
    async fn test_attempt_level_tracking_trips_on_attempts() {
        let config = CircuitBreakerConfig {
            track_individual_attempts: true,
            ..quick_config()
        };
        let breaker = CircuitBreaker::new(config);

        for _ in 0..4 {
            breaker.record_attempt_failure().await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_request_records_do_not_trip_in_attempt_mode() {
        let config = CircuitBreakerConfig {
            track_individual_attempts: true,
            ..quick_config()
        };
        let breaker = CircuitBreaker::new(config);

        for _ in 0..6 {
            breaker.record_failure().await;
        }
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_execute_rejects_when_open() {
        let breaker = CircuitBreaker::new(quick_config());
        open_breaker(&breaker).await;

        let result = breaker.execute(|| async { Ok(42) }).await;
        assert!(matches!(result, Err(StableError::CircuitOpen)));
    }

    #[tokio::test]
    async fn test_execute_records_outcomes() {
        let breaker = CircuitBreaker::new(quick_config());

        let value = breaker.execute(|| async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);

        let result: Result<()> = breaker
            .execute(|| async { Err(StableError::Transport("boom".to_string())) })
            .await;
        assert!(result.is_err());

        let snapshot = breaker.snapshot().await;
        assert_eq!(snapshot.requests.succeeded, 1);
        assert_eq!(snapshot.requests.failed, 1);
    }

    #[derive(Default)]
    struct MemoryStore {
        snapshot: StdMutex<Option<BreakerSnapshot>>,
    }

    #[async_trait]
    impl BreakerStore for MemoryStore {
        async fn load(&self) -> std::result::Result<Option<BreakerSnapshot>, String> {
            Ok(self.snapshot.lock().unwrap().clone())
        }

        async fn store(
            &self,
            snapshot: &BreakerSnapshot,
        ) -> std::result::Result<(), String> {
            *self.snapshot.lock().unwrap() = Some(snapshot.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let store = Arc::new(MemoryStore::default());

        let breaker = CircuitBreaker::with_store(quick_config(), store.clone());
        open_breaker(&breaker).await;

        let restored = CircuitBreaker::with_store(quick_config(), store);
        restored.initialize().await;

        assert_eq!(restored.state().await, CircuitState::Open);
        assert!(!restored.can_execute().await);
    }

    #[tokio::test]
    async fn test_inconsistent_snapshot_discarded_on_load() {
        let store = Arc::new(MemoryStore::default());
        *store.snapshot.lock().unwrap() = Some(BreakerSnapshot {
            state: CircuitState::Open,
            last_open_time: 0, // violates the open-state invariant
            ..Default::default()
        });

        let breaker = CircuitBreaker::with_store(quick_config(), store);
        breaker.initialize().await;

        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_snapshot_invariants_hold_under_mixed_recording() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());

        for i in 0..20 {
            if i % 3 == 0 {
                breaker.record_failure().await;
            } else {
                breaker.record_success().await;
            }
            breaker.record_attempt_success().await;

            let snapshot = breaker.snapshot().await;
            assert!(snapshot.is_consistent());
        }
    }
}

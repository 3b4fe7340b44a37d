/*!
 * Stable Request - resilient HTTP request orchestration
 *
 * Wraps an HTTP transport with composable policy layers so one logical
 * request against an unreliable upstream yields either a validated response
 * or a structured failure report with full metrics:
 * - Retry with fixed, linear or exponential backoff and jitter
 * - Response validation through a user-supplied analyzer hook
 * - Circuit breaking with request- and attempt-level accounting
 * - Response caching (bounded LRU honoring HTTP cache-control)
 * - A serialized transactional state buffer shared by all hooks
 * - Durable breaker and cache state via pluggable persistence
 */

pub mod backoff;
pub mod breaker;
pub mod buffer;
pub mod cache;
pub mod classify;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod metrics;
pub mod persist;
pub mod registry;
pub mod report;
pub mod transport;

// Re-export commonly used types for convenience
pub use backoff::{BackoffPolicy, RetryStrategy};
pub use breaker::{BreakerSnapshot, BreakerStore, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use buffer::{
    PlainBuffer, StableBuffer, StableBufferOptions, StateBuffer, StateCloneFn, StateMap,
    TransactionLogEntry, TransactionOptions,
};
pub use cache::{CacheEntry, CacheStore, ResponseCache, ResponseCacheConfig};
pub use config::{Protocol, RequestTarget, StableRequestOptions, TrialMode};
pub use context::ExecutionContext;
pub use engine::{RequestOutcome, StableRequest};
pub use error::{Result, StableError};
pub use hooks::RequestHooks;
pub use metrics::{Guardrail, RequestMetrics};
pub use persist::{
    CoordinatedBreakerStore, CoordinatedCacheStore, PersistenceHooks, PersistenceOp,
};
pub use registry::InfraRegistry;
pub use report::{AttemptResult, ErrorKind, ErrorLogEntry, SuccessLogEntry};
pub use transport::{HttpMethod, HttpTransport, Transport, TransportConfig, TransportResponse};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use stable_request::prelude::*;
/// ```
pub mod prelude {
    pub use crate::breaker::{CircuitBreaker, CircuitBreakerConfig};
    pub use crate::buffer::{PlainBuffer, StableBuffer, StableBufferOptions, StateBuffer};
    pub use crate::cache::{ResponseCache, ResponseCacheConfig};
    pub use crate::config::{RequestTarget, StableRequestOptions};
    pub use crate::engine::{RequestOutcome, StableRequest};
    pub use crate::error::{Result, StableError};
    pub use crate::hooks::RequestHooks;
}

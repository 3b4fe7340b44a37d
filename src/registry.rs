//! Acquire-or-create registry for shared infrastructure
//!
//! Breakers and caches are usually shared across calls against the same
//! upstream. The registry hands out named instances with first-configuration-
//! wins semantics: the config supplied by the first caller creates the
//! instance, later configs for the same name are ignored. A process-wide
//! registry is available through [`InfraRegistry::global`]; nothing resets it
//! except the explicit [`reset`](InfraRegistry::reset) entrypoint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::cache::{ResponseCache, ResponseCacheConfig};

/// Named registry of circuit breakers and response caches.
#[derive(Default)]
pub struct InfraRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    caches: Mutex<HashMap<String, Arc<ResponseCache>>>,
}

impl InfraRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static InfraRegistry {
        static GLOBAL: OnceLock<InfraRegistry> = OnceLock::new();
        GLOBAL.get_or_init(InfraRegistry::new)
    }

    /// Acquire the named breaker, creating it with `config` when absent.
    ///
    /// The first configuration wins; later calls get the existing instance
    /// regardless of their config.
    pub fn breaker(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|err| err.into_inner());
        Arc::clone(
            breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(config))),
        )
    }

    /// Acquire the named cache, creating it with `config` when absent.
    pub fn cache(&self, name: &str, config: ResponseCacheConfig) -> Arc<ResponseCache> {
        let mut caches = self.caches.lock().unwrap_or_else(|err| err.into_inner());
        Arc::clone(
            caches
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(ResponseCache::new(config))),
        )
    }

    /// Drop every registered instance. Existing `Arc` handles keep working;
    /// the names become available for fresh configuration.
    pub fn reset(&self) {
        self.breakers
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clear();
        self.caches
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clear();
    }
}

impl std::fmt::Debug for InfraRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let breakers = self
            .breakers
            .lock()
            .map(|map| map.len())
            .unwrap_or_default();
        let caches = self.caches.lock().map(|map| map.len()).unwrap_or_default();
        f.debug_struct("InfraRegistry")
            .field("breakers", &breakers)
            .field("caches", &caches)
            .finish()
    }
}

//! State buffers: shared mutable state with a transaction discipline
//!
//! A buffer owns one JSON state map. Callers never touch the map directly;
//! they submit transaction bodies that receive exclusive mutable access. Two
//! implementations exist:
//!
//! - [`PlainBuffer`]: in-memory map, transactions run immediately under a
//!   lock. No queueing, no logging, no timeout.
//! - [`StableBuffer`]: serialized single-writer queue with FIFO ordering,
//!   per-transaction logging and replay support.
//!
//! Persistence coordinators and the hook runner depend only on the
//! [`StateBuffer`] trait, so either implementation can back a request.

mod replay;
mod stable;

pub use replay::{replay_transactions, ReplayHandler, ReplayOptions, ReplayReport};
pub use stable::{StableBuffer, StableBufferOptions};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::context::ExecutionContext;
use crate::error::{Result, StableError};
use crate::metrics::BufferMetrics;

/// The buffer's state: a JSON object shared across transactions.
pub type StateMap = serde_json::Map<String, Value>;

/// Outcome of a transaction body. The error side is a plain message: bodies
/// wrap user hooks whose failures must stay stringly observable in logs.
pub type TxnResult = std::result::Result<Value, String>;

/// A transaction body with exclusive access to the state map.
pub type TxnBody = Box<dyn for<'a> FnOnce(&'a mut StateMap) -> BoxFuture<'a, TxnResult> + Send>;

/// Callback invoked with each completed transaction's log entry.
///
/// Errors returned here are logged and swallowed; they never affect the
/// transaction's observed outcome.
pub type TransactionLogger =
    Arc<dyn Fn(&TransactionLogEntry) -> std::result::Result<(), String> + Send + Sync>;

/// Pluggable clone strategy for state snapshots (reads and log entries).
/// The default is a structural deep copy.
pub type StateCloneFn = Arc<dyn Fn(&StateMap) -> StateMap + Send + Sync>;

/// Descriptive options attached to a transaction for logging purposes.
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    pub activity: Option<String>,
    pub hook_name: Option<String>,
    pub hook_params: Option<Value>,
    pub context: ExecutionContext,
}

impl TransactionOptions {
    pub fn for_activity(activity: impl Into<String>) -> Self {
        Self {
            activity: Some(activity.into()),
            ..Default::default()
        }
    }
}

/// Record of one executed transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionLogEntry {
    pub transaction_id: String,

    /// Epoch milliseconds; `queued_at <= started_at <= finished_at`
    pub queued_at: i64,
    pub started_at: i64,
    pub finished_at: i64,

    /// `finished_at - started_at`
    pub duration_ms: i64,

    /// `started_at - queued_at`
    pub queue_wait_ms: i64,

    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    pub state_before: StateMap,
    pub state_after: StateMap,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook_params: Option<Value>,

    #[serde(default, skip_serializing_if = "ExecutionContext::is_empty")]
    pub context: ExecutionContext,
}

/// Shared-state buffer contract.
#[async_trait]
pub trait StateBuffer: Send + Sync {
    /// Deep clone of the current state.
    async fn read(&self) -> StateMap;

    /// Atomically replace the state.
    async fn set_state(&self, next: StateMap);

    /// Run a transaction body with exclusive access to the state and return
    /// its result.
    async fn run(&self, body: TxnBody, opts: TransactionOptions) -> Result<Value>;

    /// Run a transaction and discard its result.
    async fn update(&self, body: TxnBody, opts: TransactionOptions) -> Result<()> {
        self.run(body, opts).await.map(|_| ())
    }

    /// Metrics snapshot for this buffer.
    fn metrics(&self) -> BufferMetrics;
}

/// Simple transaction counters shared by both buffer implementations.
#[derive(Debug, Default)]
pub(crate) struct BufferCounters {
    total: AtomicU64,
    queue_wait_sum_ms: AtomicU64,
}

impl BufferCounters {
    pub(crate) fn record(&self, queue_wait_ms: u64) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.queue_wait_sum_ms
            .fetch_add(queue_wait_ms, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> BufferMetrics {
        let total = self.total.load(Ordering::Relaxed);
        let sum = self.queue_wait_sum_ms.load(Ordering::Relaxed);
        BufferMetrics {
            total_transactions: total,
            average_queue_wait_ms: if total == 0 {
                0.0
            } else {
                sum as f64 / total as f64
            },
            anomalies: Vec::new(),
        }
    }
}

/// In-memory buffer without queueing or logging.
///
/// Transactions still get exclusive access to the state, but run inline on
/// the caller's task. This is the default backing for calls that do not
/// share state across requests.
#[derive(Debug, Default)]
pub struct PlainBuffer {
    state: Mutex<StateMap>,
    counters: BufferCounters,
}

impl PlainBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: StateMap) -> Self {
        Self {
            state: Mutex::new(state),
            counters: BufferCounters::default(),
        }
    }
}

#[async_trait]
impl StateBuffer for PlainBuffer {
    async fn read(&self) -> StateMap {
        self.state.lock().await.clone()
    }

    async fn set_state(&self, next: StateMap) {
        *self.state.lock().await = next;
    }

    async fn run(&self, body: TxnBody, _opts: TransactionOptions) -> Result<Value> {
        let mut state = self.state.lock().await;
        let result = body(&mut state).await;
        self.counters.record(0);
        result.map_err(StableError::Transaction)
    }

    fn metrics(&self) -> BufferMetrics {
        self.counters.snapshot()
    }
}

/// Box a closure into a transaction body.
///
/// Convenience for the common case of a synchronous mutation:
///
/// ```
/// use stable_request::buffer::{sync_txn, PlainBuffer, StateBuffer, TransactionOptions};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let buffer = PlainBuffer::new();
/// buffer
///     .run(
///         sync_txn(|state| {
///             state.insert("counter".to_string(), 1u64.into());
///             Ok(serde_json::Value::Null)
///         }),
///         TransactionOptions::default(),
///     )
///     .await
///     .unwrap();
/// # }
/// ```
pub fn sync_txn<F>(f: F) -> TxnBody
where
    F: FnOnce(&mut StateMap) -> TxnResult + Send + 'static,
{
    Box::new(move |state| Box::pin(async move { f(state) }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_plain_buffer_run_and_read() {
        let buffer = PlainBuffer::new();

        let result = buffer
            .run(
                sync_txn(|state| {
                    state.insert("key".to_string(), Value::from("value"));
                    Ok(Value::from(42))
                }),
                TransactionOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(result, Value::from(42));
        assert_eq!(buffer.read().await.get("key"), Some(&Value::from("value")));
    }

    #[tokio::test]
    async fn test_plain_buffer_failed_transaction_keeps_state_changes() {
        let buffer = PlainBuffer::new();

        let err = buffer
            .run(
                sync_txn(|state| {
                    state.insert("partial".to_string(), Value::Bool(true));
                    Err("boom".to_string())
                }),
                TransactionOptions::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StableError::Transaction(msg) if msg == "boom"));
        // No rollback semantics: the body owns its effects.
        assert_eq!(
            buffer.read().await.get("partial"),
            Some(&Value::Bool(true))
        );
    }

    #[tokio::test]
    async fn test_set_state_replaces() {
        let buffer = PlainBuffer::new();
        let mut next = StateMap::new();
        next.insert("fresh".to_string(), Value::from(1));

        buffer.set_state(next).await;

        let state = buffer.read().await;
        assert_eq!(state.len(), 1);
        assert!(state.contains_key("fresh"));
    }

    #[tokio::test]
    async fn test_metrics_count_transactions() {
        let buffer = PlainBuffer::new();
        for _ in 0..3 {
            buffer
                .run(sync_txn(|_| Ok(Value::Null)), TransactionOptions::default())
                .await
                .unwrap();
        }

        assert_eq!(buffer.metrics().total_transactions, 3);
    }
}

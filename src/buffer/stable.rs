//! Serialized transactional buffer
//!
//! A dedicated worker task drains a FIFO channel of transaction bodies.
//! Exactly one body runs at a time, each sees the full effect of every
//! earlier transaction, and a failing body neither aborts nor reorders the
//! queue. Callers await their transaction's result through a oneshot reply;
//! an optional timeout bounds the await without aborting the body itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::warn;

use super::{
    BufferCounters, StateBuffer, StateCloneFn, StateMap, TransactionLogEntry, TransactionLogger,
    TransactionOptions, TxnBody, TxnResult,
};
use crate::error::{Result, StableError};
use crate::metrics::{evaluate_guardrails, BufferMetrics, MetricsGuardrails};

/// Configuration for a [`StableBuffer`].
#[derive(Clone, Default)]
pub struct StableBufferOptions {
    /// Budget for the caller's await, in milliseconds. `0` disables the
    /// timeout. The transaction body is never aborted; later transactions
    /// still wait for it to finish.
    pub transaction_timeout_ms: u64,

    /// Invoked with every completed transaction's log entry
    pub logger: Option<TransactionLogger>,

    /// Guardrails evaluated on each metrics snapshot
    pub guardrails: Option<MetricsGuardrails>,

    /// Overrides the structural deep copy used for reads and log snapshots
    pub clone_state: Option<StateCloneFn>,
}

impl std::fmt::Debug for StableBufferOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StableBufferOptions")
            .field("transaction_timeout_ms", &self.transaction_timeout_ms)
            .field("logger", &self.logger.is_some())
            .field("guardrails", &self.guardrails.is_some())
            .field("clone_state", &self.clone_state.is_some())
            .finish()
    }
}

struct QueuedTransaction {
    id: String,
    body: TxnBody,
    opts: TransactionOptions,
    queued_at: i64,
    reply: oneshot::Sender<TxnResult>,
}

/// Single-writer serialized buffer.
pub struct StableBuffer {
    sender: mpsc::UnboundedSender<QueuedTransaction>,
    state: Arc<Mutex<StateMap>>,
    counters: Arc<BufferCounters>,
    sequence: AtomicU64,
    options: StableBufferOptions,
}

impl StableBuffer {
    /// Spawn the worker and return a ready buffer with empty state.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(options: StableBufferOptions) -> Self {
        Self::with_state(StateMap::new(), options)
    }

    pub fn with_state(initial: StateMap, options: StableBufferOptions) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(initial));
        let counters = Arc::new(BufferCounters::default());

        tokio::spawn(worker_loop(
            receiver,
            Arc::clone(&state),
            Arc::clone(&counters),
            options.logger.clone(),
            options.clone_state.clone(),
        ));

        Self {
            sender,
            state,
            counters,
            sequence: AtomicU64::new(0),
            options,
        }
    }

    fn next_transaction_id(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("stable-buffer-{}-{}", Utc::now().timestamp_millis(), seq)
    }
}

async fn worker_loop(
    mut receiver: mpsc::UnboundedReceiver<QueuedTransaction>,
    state: Arc<Mutex<StateMap>>,
    counters: Arc<BufferCounters>,
    logger: Option<TransactionLogger>,
    clone_state: Option<StateCloneFn>,
) {
    let snapshot = |map: &StateMap| match &clone_state {
        Some(clone_state) => clone_state(map),
        None => map.clone(),
    };

    while let Some(txn) = receiver.recv().await {
        let started_at = Utc::now().timestamp_millis().max(txn.queued_at);

        let mut guard = state.lock().await;
        let state_before = logger.as_ref().map(|_| snapshot(&guard));
        let result = (txn.body)(&mut guard).await;
        let state_after = logger.as_ref().map(|_| snapshot(&guard));
        drop(guard);

        let finished_at = Utc::now().timestamp_millis().max(started_at);
        counters.record((started_at - txn.queued_at) as u64);

        if let Some(logger) = &logger {
            let entry = TransactionLogEntry {
                transaction_id: txn.id.clone(),
                queued_at: txn.queued_at,
                started_at,
                finished_at,
                duration_ms: finished_at - started_at,
                queue_wait_ms: started_at - txn.queued_at,
                success: result.is_ok(),
                error_message: result.as_ref().err().cloned(),
                state_before: state_before.unwrap_or_default(),
                state_after: state_after.unwrap_or_default(),
                activity: txn.opts.activity.clone(),
                hook_name: txn.opts.hook_name.clone(),
                hook_params: txn.opts.hook_params.clone(),
                context: txn.opts.context.clone(),
            };

            if let Err(err) = logger(&entry) {
                warn!(transaction_id = %txn.id, error = %err, "transaction logger failed");
            }
        }

        // The caller may have timed out and dropped its receiver.
        let _ = txn.reply.send(result);
    }
}

#[async_trait::async_trait]
impl StateBuffer for StableBuffer {
    async fn read(&self) -> StateMap {
        let guard = self.state.lock().await;
        match &self.options.clone_state {
            Some(clone_state) => clone_state(&guard),
            None => guard.clone(),
        }
    }

    async fn set_state(&self, next: StateMap) {
        *self.state.lock().await = next;
    }

    async fn run(&self, body: TxnBody, opts: TransactionOptions) -> Result<Value> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let txn = QueuedTransaction {
            id: self.next_transaction_id(),
            body,
            opts,
            queued_at: Utc::now().timestamp_millis(),
            reply: reply_tx,
        };

        self.sender
            .send(txn)
            .map_err(|_| StableError::BufferClosed)?;

        let outcome = if self.options.transaction_timeout_ms > 0 {
            let budget = Duration::from_millis(self.options.transaction_timeout_ms);
            match tokio::time::timeout(budget, reply_rx).await {
                Ok(received) => received,
                Err(_) => {
                    return Err(StableError::BufferTimeout(
                        self.options.transaction_timeout_ms,
                    ))
                }
            }
        } else {
            reply_rx.await
        };

        match outcome {
            Ok(result) => result.map_err(StableError::Transaction),
            Err(_) => Err(StableError::BufferClosed),
        }
    }

    fn metrics(&self) -> BufferMetrics {
        let mut snapshot = self.counters.snapshot();
        if let Some(guardrails) = &self.options.guardrails {
            let values = HashMap::from([
                (
                    "total_transactions".to_string(),
                    snapshot.total_transactions as f64,
                ),
                (
                    "average_queue_wait_ms".to_string(),
                    snapshot.average_queue_wait_ms,
                ),
            ]);
            snapshot.anomalies = evaluate_guardrails(guardrails, &values);
        }
        snapshot
    }
}

//! Persistence coordination with at-most-once semantics
//!
//! Breaker and cache state travel through user-supplied persistence hooks.
//! The coordinator wraps every load/store in a buffer transaction and tags it
//! with a unique operation id. The id is recorded under a reserved key of the
//! buffer state before the hook runs; a transaction that sees its own id
//! already recorded short-circuits with `skipped=true`. Replaying a recorded
//! transaction log therefore re-executes each persistence operation at most
//! once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::buffer::{StateBuffer, TransactionOptions, TxnBody};
use crate::context::ExecutionContext;
use crate::error::{Result, StableError};

/// Reserved buffer-state key holding executed operation ids.
pub const PERSISTENCE_OPS_KEY: &str = "__persistence_ops";

/// Kind of persistence operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceOpType {
    Load,
    Store,
}

impl std::fmt::Display for PersistenceOpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistenceOpType::Load => f.write_str("load"),
            PersistenceOpType::Store => f.write_str("store"),
        }
    }
}

/// One persistence operation as seen by a user `transaction` hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceOp {
    pub operation_id: String,

    #[serde(rename = "type")]
    pub op_type: PersistenceOpType,

    /// Epoch ms when the operation was created
    pub timestamp: i64,

    /// Serialized component state for stores; absent for loads
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
}

/// Result of a coordinated operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,

    #[serde(default)]
    pub skipped: bool,
}

/// Async hook returning serialized state, or nothing when no prior state
/// exists.
pub type LoadFn =
    Arc<dyn Fn() -> BoxFuture<'static, std::result::Result<Option<Value>, String>> + Send + Sync>;

/// Async hook storing serialized state.
pub type StoreFn =
    Arc<dyn Fn(Value) -> BoxFuture<'static, std::result::Result<(), String>> + Send + Sync>;

/// Async hook handling both operation kinds. Preferred over separate
/// load/store hooks when supplied. May return the state directly, a
/// `{state, skipped}` envelope, or nothing.
pub type TransactionFn = Arc<
    dyn Fn(PersistenceOp) -> BoxFuture<'static, std::result::Result<Option<Value>, String>>
        + Send
        + Sync,
>;

/// User-supplied persistence hooks for one component.
#[derive(Clone, Default)]
pub struct PersistenceHooks {
    pub load: Option<LoadFn>,
    pub store: Option<StoreFn>,
    pub transaction: Option<TransactionFn>,
}

impl std::fmt::Debug for PersistenceHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceHooks")
            .field("load", &self.load.is_some())
            .field("store", &self.store.is_some())
            .field("transaction", &self.transaction.is_some())
            .finish()
    }
}

/// Coordinates one component's persistence through a buffer.
pub struct PersistenceCoordinator {
    label: String,
    buffer: Arc<dyn StateBuffer>,
    hooks: PersistenceHooks,
    sequence: AtomicU64,
    context: ExecutionContext,
}

impl PersistenceCoordinator {
    pub fn new(
        label: impl Into<String>,
        buffer: Arc<dyn StateBuffer>,
        hooks: PersistenceHooks,
        context: ExecutionContext,
    ) -> Self {
        Self {
            label: label.into(),
            buffer,
            hooks,
            sequence: AtomicU64::new(0),
            context,
        }
    }

    /// Build a freshly-tagged operation.
    pub fn next_op(&self, op_type: PersistenceOpType, state: Option<Value>) -> PersistenceOp {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now().timestamp_millis();
        PersistenceOp {
            operation_id: format!("{}-{}-{}-{}", self.label, op_type, now, seq),
            op_type,
            timestamp: now,
            state,
        }
    }

    /// Load typed state through the coordinator.
    pub async fn load<S: DeserializeOwned>(&self) -> Result<Option<S>> {
        let op = self.next_op(PersistenceOpType::Load, None);
        let outcome = self.run_op(op).await?;
        match outcome.state {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|err| StableError::Persistence(err.to_string())),
            None => Ok(None),
        }
    }

    /// Store typed state through the coordinator.
    pub async fn store<S: Serialize>(&self, state: &S) -> Result<OpOutcome> {
        let value = serde_json::to_value(state)
            .map_err(|err| StableError::Persistence(err.to_string()))?;
        let op = self.next_op(PersistenceOpType::Store, Some(value));
        self.run_op(op).await
    }

    /// Execute one operation inside a buffer transaction.
    ///
    /// The operation id is recorded in [`PERSISTENCE_OPS_KEY`] before the
    /// user hook runs; an id seen twice short-circuits with `skipped=true`.
    pub async fn run_op(&self, op: PersistenceOp) -> Result<OpOutcome> {
        let hooks = self.hooks.clone();

        let body: TxnBody = Box::new(move |state| {
            Box::pin(async move {
                if record_op_id(state, &op.operation_id) {
                    return serde_json::to_value(OpOutcome {
                        state: None,
                        skipped: true,
                    })
                    .map_err(|err| err.to_string());
                }

                let state_out = invoke_hooks(&hooks, op).await?;

                serde_json::to_value(OpOutcome {
                    state: state_out,
                    skipped: false,
                })
                .map_err(|err| err.to_string())
            })
        });

        let opts = TransactionOptions {
            activity: Some("persistence".to_string()),
            hook_name: Some(self.label.clone()),
            hook_params: None,
            context: self.context.clone(),
        };

        let value = self.buffer.run(body, opts).await?;
        serde_json::from_value(value).map_err(|err| StableError::Persistence(err.to_string()))
    }
}

impl std::fmt::Debug for PersistenceCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceCoordinator")
            .field("label", &self.label)
            .field("hooks", &self.hooks)
            .finish()
    }
}

/// Record an op id under the reserved key. Returns true when the id was
/// already present.
fn record_op_id(state: &mut crate::buffer::StateMap, operation_id: &str) -> bool {
    let entry = state
        .entry(PERSISTENCE_OPS_KEY.to_string())
        .or_insert_with(|| Value::Object(serde_json::Map::new()));

    // A caller clobbering the reserved key resets the ledger.
    if !entry.is_object() {
        *entry = Value::Object(serde_json::Map::new());
    }

    if let Value::Object(ops) = entry {
        if ops.contains_key(operation_id) {
            return true;
        }
        ops.insert(
            operation_id.to_string(),
            Value::from(Utc::now().timestamp_millis()),
        );
    }
    false
}

async fn invoke_hooks(
    hooks: &PersistenceHooks,
    op: PersistenceOp,
) -> std::result::Result<Option<Value>, String> {
    // A transaction hook takes precedence over separate load/store hooks.
    if let Some(transaction) = &hooks.transaction {
        let returned = transaction(op).await?;
        return Ok(returned.map(unwrap_envelope));
    }

    match op.op_type {
        PersistenceOpType::Load => match &hooks.load {
            Some(load) => Ok(load().await?.map(unwrap_envelope)),
            None => Ok(None),
        },
        PersistenceOpType::Store => {
            if let Some(store) = &hooks.store {
                let state = op.state.ok_or_else(|| "store without state".to_string())?;
                store(state).await?;
            }
            Ok(None)
        }
    }
}

/// Accept either raw state or a `{state, skipped}` envelope from user hooks.
fn unwrap_envelope(value: Value) -> Value {
    match &value {
        Value::Object(map) if map.contains_key("state") && map.len() <= 2 => map
            .get("state")
            .cloned()
            .unwrap_or(Value::Null),
        _ => value,
    }
}

/// Breaker persistence routed through a coordinator.
///
/// Attach to a [`CircuitBreaker`](crate::breaker::CircuitBreaker) via
/// `with_store`; every snapshot write becomes an idempotent buffer
/// transaction.
pub struct CoordinatedBreakerStore {
    coordinator: PersistenceCoordinator,
}

impl CoordinatedBreakerStore {
    pub fn new(
        buffer: Arc<dyn StateBuffer>,
        hooks: PersistenceHooks,
        context: ExecutionContext,
    ) -> Self {
        Self {
            coordinator: PersistenceCoordinator::new("breaker", buffer, hooks, context),
        }
    }
}

#[async_trait::async_trait]
impl crate::breaker::BreakerStore for CoordinatedBreakerStore {
    async fn load(&self) -> std::result::Result<Option<crate::breaker::BreakerSnapshot>, String> {
        self.coordinator.load().await.map_err(|err| err.to_string())
    }

    async fn store(
        &self,
        snapshot: &crate::breaker::BreakerSnapshot,
    ) -> std::result::Result<(), String> {
        self.coordinator
            .store(snapshot)
            .await
            .map(|_| ())
            .map_err(|err| err.to_string())
    }
}

/// Cache persistence routed through a coordinator.
pub struct CoordinatedCacheStore {
    coordinator: PersistenceCoordinator,
}

impl CoordinatedCacheStore {
    pub fn new(
        buffer: Arc<dyn StateBuffer>,
        hooks: PersistenceHooks,
        context: ExecutionContext,
    ) -> Self {
        Self {
            coordinator: PersistenceCoordinator::new("cache", buffer, hooks, context),
        }
    }
}

#[async_trait::async_trait]
impl crate::cache::CacheStore for CoordinatedCacheStore {
    async fn load(&self) -> std::result::Result<Option<crate::cache::CacheSnapshot>, String> {
        self.coordinator.load().await.map_err(|err| err.to_string())
    }

    async fn store(
        &self,
        snapshot: &crate::cache::CacheSnapshot,
    ) -> std::result::Result<(), String> {
        self.coordinator
            .store(snapshot)
            .await
            .map(|_| ())
            .map_err(|err| err.to_string())
    }
}

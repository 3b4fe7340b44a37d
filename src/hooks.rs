//! User hooks and the persistence-aware hook runner
//!
//! Five hooks customize a request's lifecycle: one before the attempt loop,
//! two observability hooks per attempt, the response analyzer and the final
//! error analyzer. Every hook executes inside a buffer transaction with
//! exclusive access to the shared state map, optionally sandwiched between a
//! persisted-state load and store.
//!
//! Hook failures follow the lifecycle contract: the runner propagates them
//! to the engine, which decides per hook whether to swallow, retry or abort.
//! Persistence failures around a hook are always logged and swallowed.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::buffer::{StateBuffer, StateMap, TransactionLogEntry, TransactionOptions, TxnBody};
use crate::config::{OptionsOverride, RequestTarget, StableRequestOptions, TrialMode};
use crate::context::ExecutionContext;
use crate::error::{Result, StableError};
use crate::report::{ErrorLogEntry, SuccessLogEntry};

/// Fallback identifier for hooks registered without a name.
pub const ANONYMOUS_HOOK: &str = "anonymous-hook";

/// A hook body: exclusive state access plus a typed argument payload.
pub type BufferHook<A, R> =
    Arc<dyn for<'a> Fn(&'a mut StateMap, A) -> BoxFuture<'a, std::result::Result<R, String>> + Send + Sync>;

/// Runs once before the attempt loop; may override the active options.
pub type PreExecutionHook = BufferHook<PreExecutionArgs, Option<OptionsOverride>>;

/// Judges each ok transport response: `true` accepts, `false` retries.
pub type ResponseAnalyzer = BufferHook<AnalyzerArgs, bool>;

/// Observability hook for failed attempts.
pub type ErrorHandler = BufferHook<ErrorHandlerArgs, ()>;

/// Observability hook for accepted attempts.
pub type SuccessHandler = BufferHook<SuccessHandlerArgs, ()>;

/// Judges the terminal failure: `true` marks it handled.
pub type FinalErrorAnalyzer = BufferHook<FinalErrorArgs, bool>;

/// The five hook slots for one request.
#[derive(Clone, Default)]
pub struct RequestHooks {
    pub pre_execution: Option<PreExecutionHook>,
    pub response_analyzer: Option<ResponseAnalyzer>,
    pub handle_errors: Option<ErrorHandler>,
    pub handle_successful_attempt: Option<SuccessHandler>,
    pub final_error_analyzer: Option<FinalErrorAnalyzer>,
}

impl std::fmt::Debug for RequestHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHooks")
            .field("pre_execution", &self.pre_execution.is_some())
            .field("response_analyzer", &self.response_analyzer.is_some())
            .field("handle_errors", &self.handle_errors.is_some())
            .field(
                "handle_successful_attempt",
                &self.handle_successful_attempt.is_some(),
            )
            .field("final_error_analyzer", &self.final_error_analyzer.is_some())
            .finish()
    }
}

/// Payload for the pre-execution hook.
#[derive(Debug, Clone)]
pub struct PreExecutionArgs {
    pub input_params: Option<Value>,
    pub request: RequestTarget,
    pub options: StableRequestOptions,
    pub transaction_logs: Arc<Vec<TransactionLogEntry>>,
}

/// Payload for the response analyzer.
#[derive(Debug, Clone)]
pub struct AnalyzerArgs {
    pub request: RequestTarget,
    pub data: Value,
    pub status_code: Option<u16>,
    pub trial_mode: Option<TrialMode>,
    pub params: Option<Value>,
    pub pre_execution_result: Option<OptionsOverride>,
    pub context: ExecutionContext,
    pub transaction_logs: Arc<Vec<TransactionLogEntry>>,
}

/// Payload for the error-reporting hook.
#[derive(Debug, Clone)]
pub struct ErrorHandlerArgs {
    pub request: RequestTarget,
    pub error_log: ErrorLogEntry,
    pub max_serializable_chars: usize,
    pub params: Option<Value>,
    pub context: ExecutionContext,
}

/// Payload for the success-reporting hook.
#[derive(Debug, Clone)]
pub struct SuccessHandlerArgs {
    pub request: RequestTarget,
    pub successful_attempt: SuccessLogEntry,
    pub params: Option<Value>,
    pub context: ExecutionContext,
}

/// Payload for the final error analyzer.
#[derive(Debug, Clone)]
pub struct FinalErrorArgs {
    pub request: RequestTarget,
    pub error: String,
    pub trial_mode: Option<TrialMode>,
    pub params: Option<Value>,
    pub context: ExecutionContext,
}

/// Stage passed to the state-persistence function around a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PersistenceStage {
    BeforeHook,
    AfterHook,
}

/// Loads or stores hook-adjacent state. Receives the stage, a snapshot of
/// the buffer state, the execution context and opaque params. A map returned
/// at the before stage is merged into the buffer state by key assignment.
pub type StatePersistenceFn = Arc<
    dyn Fn(
            PersistenceStage,
            StateMap,
            ExecutionContext,
            Option<Value>,
        ) -> BoxFuture<'static, std::result::Result<Option<StateMap>, String>>
        + Send
        + Sync,
>;

/// Configuration for state persistence around hooks.
#[derive(Clone)]
pub struct StatePersistence {
    pub load_before_hooks: bool,
    pub store_after_hooks: bool,
    pub persistence: StatePersistenceFn,
    pub params: Option<Value>,
}

impl std::fmt::Debug for StatePersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatePersistence")
            .field("load_before_hooks", &self.load_before_hooks)
            .field("store_after_hooks", &self.store_after_hooks)
            .field("params", &self.params)
            .finish()
    }
}

/// Execute one hook inside a buffer transaction.
///
/// Lifecycle inside the transaction: optional persisted-state load and merge,
/// the hook body itself, optional state store. Load/store failures are logged
/// and swallowed; a hook body failure surfaces as [`StableError::Hook`].
pub async fn run_hook<A, R>(
    buffer: &dyn StateBuffer,
    name: &str,
    hook: BufferHook<A, R>,
    args: A,
    persistence: Option<StatePersistence>,
    context: &ExecutionContext,
    hook_params: Option<Value>,
) -> Result<R>
where
    A: Send + 'static,
    R: Serialize + DeserializeOwned + Send + 'static,
{
    let hook_name = if name.is_empty() {
        ANONYMOUS_HOOK.to_string()
    } else {
        name.to_string()
    };

    let opts = TransactionOptions {
        activity: Some("hook".to_string()),
        hook_name: Some(hook_name.clone()),
        hook_params: hook_params.clone(),
        context: context.clone(),
    };

    let txn_context = context.clone();
    let body: TxnBody = Box::new(move |state| {
        Box::pin(async move {
            if let Some(persistence) = persistence
                .as_ref()
                .filter(|persistence| persistence.load_before_hooks)
            {
                match (persistence.persistence)(
                    PersistenceStage::BeforeHook,
                    state.clone(),
                    txn_context.clone(),
                    persistence.params.clone(),
                )
                .await
                {
                    Ok(Some(loaded)) => {
                        for (key, value) in loaded {
                            state.insert(key, value);
                        }
                    }
                    Ok(None) => {}
                    Err(err) => warn!(error = %err, "state load before hook failed"),
                }
            }

            let result = hook(&mut *state, args).await?;

            if let Some(persistence) = persistence
                .as_ref()
                .filter(|persistence| persistence.store_after_hooks)
            {
                if let Err(err) = (persistence.persistence)(
                    PersistenceStage::AfterHook,
                    state.clone(),
                    txn_context.clone(),
                    persistence.params.clone(),
                )
                .await
                {
                    warn!(error = %err, "state store after hook failed");
                }
            }

            serde_json::to_value(result).map_err(|err| err.to_string())
        })
    });

    let value = match buffer.run(body, opts).await {
        Ok(value) => value,
        Err(StableError::Transaction(message)) => {
            return Err(StableError::Hook {
                hook: hook_name,
                message,
            })
        }
        Err(other) => return Err(other),
    };

    serde_json::from_value(value).map_err(|err| StableError::Hook {
        hook: hook_name,
        message: format!("result deserialization failed: {}", err),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::buffer::{PlainBuffer, StableBuffer, StableBufferOptions};

    fn state_persistence(
        loads: Arc<StdMutex<Vec<PersistenceStage>>>,
        seeded: StateMap,
    ) -> StatePersistence {
        StatePersistence {
            load_before_hooks: true,
            store_after_hooks: true,
            params: None,
            persistence: Arc::new(move |stage, _snapshot, _ctx, _params| {
                loads.lock().unwrap().push(stage);
                let seeded = seeded.clone();
                Box::pin(async move {
                    match stage {
                        PersistenceStage::BeforeHook => Ok(Some(seeded)),
                        PersistenceStage::AfterHook => Ok(None),
                    }
                })
            }),
        }
    }

    fn recording_hook(seen: Arc<StdMutex<Option<Value>>>) -> BufferHook<Value, bool> {
        Arc::new(move |state, args| {
            let seen = Arc::clone(&seen);
            Box::pin(async move {
                *seen.lock().unwrap() = state.get("seeded").cloned();
                state.insert("hook_ran".to_string(), args);
                Ok(true)
            })
        })
    }

    #[tokio::test]
    async fn test_hook_runs_in_transaction_and_returns_value() {
        let buffer = PlainBuffer::new();
        let seen = Arc::new(StdMutex::new(None));

        let accepted = run_hook(
            &buffer,
            "analyzer",
            recording_hook(Arc::clone(&seen)),
            Value::from("payload"),
            None,
            &ExecutionContext::default(),
            None,
        )
        .await
        .unwrap();

        assert!(accepted);
        assert_eq!(
            buffer.read().await.get("hook_ran"),
            Some(&Value::from("payload"))
        );
    }

    #[tokio::test]
    async fn test_load_before_merges_state_for_hook() {
        let buffer = PlainBuffer::new();
        let stages = Arc::new(StdMutex::new(Vec::new()));
        let seen = Arc::new(StdMutex::new(None));

        let mut seeded = StateMap::new();
        seeded.insert("seeded".to_string(), Value::from("from-disk"));

        run_hook(
            &buffer,
            "analyzer",
            recording_hook(Arc::clone(&seen)),
            Value::Null,
            Some(state_persistence(Arc::clone(&stages), seeded)),
            &ExecutionContext::default(),
            None,
        )
        .await
        .unwrap();

        // The hook observed the merged state, and both stages fired.
        assert_eq!(*seen.lock().unwrap(), Some(Value::from("from-disk")));
        assert_eq!(
            *stages.lock().unwrap(),
            vec![PersistenceStage::BeforeHook, PersistenceStage::AfterHook]
        );
    }

    #[tokio::test]
    async fn test_persistence_failure_is_swallowed() {
        let buffer = PlainBuffer::new();

        let persistence = StatePersistence {
            load_before_hooks: true,
            store_after_hooks: true,
            params: None,
            persistence: Arc::new(|_, _, _, _| {
                Box::pin(async { Err("backing store offline".to_string()) })
            }),
        };

        let passing: BufferHook<Value, bool> =
            Arc::new(|_state, _args| Box::pin(async { Ok(true) }));

        let result: bool = run_hook(
            &buffer,
            "analyzer",
            passing,
            Value::Null,
            Some(persistence),
            &ExecutionContext::default(),
            None,
        )
        .await
        .unwrap();

        assert!(result);
    }

    #[tokio::test]
    async fn test_hook_failure_propagates() {
        let buffer = PlainBuffer::new();

        let failing: BufferHook<Value, bool> = Arc::new(|_state, _args| {
            Box::pin(async { Err("analyzer exploded".to_string()) })
        });

        let err = run_hook(
            &buffer,
            "analyzer",
            failing,
            Value::Null,
            None,
            &ExecutionContext::default(),
            None,
        )
        .await
        .unwrap_err();

        match err {
            StableError::Hook { hook, message } => {
                assert_eq!(hook, "analyzer");
                assert_eq!(message, "analyzer exploded");
            }
            other => panic!("expected hook error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transaction_metadata_defaults() {
        let entries = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&entries);

        let buffer = StableBuffer::new(StableBufferOptions {
            logger: Some(Arc::new(move |entry: &TransactionLogEntry| {
                sink.lock().unwrap().push(entry.clone());
                Ok(())
            })),
            ..Default::default()
        });

        let noop: BufferHook<Value, ()> =
            Arc::new(|_state, _args| Box::pin(async { Ok(()) }));

        run_hook(
            &buffer,
            "",
            noop,
            Value::Null,
            None,
            &ExecutionContext::for_request("req-1"),
            Some(Value::from("params")),
        )
        .await
        .unwrap();

        let entries = entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].activity.as_deref(), Some("hook"));
        assert_eq!(entries[0].hook_name.as_deref(), Some(ANONYMOUS_HOOK));
        assert_eq!(entries[0].hook_params, Some(Value::from("params")));
        assert_eq!(
            entries[0].context.request_id.as_deref(),
            Some("req-1")
        );
    }
}

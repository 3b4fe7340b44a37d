//! Request engine: the attempt loop composing every policy layer
//!
//! One [`StableRequest`] drives a single logical request: breaker admission,
//! cache lookup, transport execution, response validation, outcome recording,
//! observability hooks and backoff, attempt after attempt until an accepted
//! response or an exhausted budget. Every return path carries metrics; user-
//! visible failures are consolidated into the outcome record, and only the
//! explicitly configured rethrow conditions raise.

use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::buffer::{PlainBuffer, StateBuffer, TransactionLogEntry};
use crate::breaker::{CircuitBreaker, CircuitState};
use crate::cache::ResponseCache;
use crate::classify::is_retryable_error;
use crate::config::{OptionsOverride, RequestTarget, StableRequestOptions};
use crate::context::ExecutionContext;
use crate::error::{Result, StableError};
use crate::hooks::{
    run_hook, AnalyzerArgs, ErrorHandlerArgs, FinalErrorArgs, PreExecutionArgs, RequestHooks,
    StatePersistence, SuccessHandlerArgs,
};
use crate::metrics::RequestMetrics;
use crate::report::{
    now_rfc3339, truncate_for_log, AttemptResult, ErrorKind, ErrorLogEntry, SuccessLogEntry,
};
use crate::transport::{
    HttpTransport, Transport, TransportConfig, TransportError, TransportResponse,
};

/// Loads previously recorded transaction logs for the execution context.
pub type TransactionLogLoader = Arc<
    dyn Fn(
            &ExecutionContext,
        ) -> BoxFuture<'static, std::result::Result<Vec<TransactionLogEntry>, String>>
        + Send
        + Sync,
>;

/// Final outcome of one logical request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestOutcome {
    pub success: bool,

    /// Present iff `success`; the payload when `res_req` was set, otherwise
    /// a bare `true`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Present iff at least one error entry was recorded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_logs: Option<Vec<ErrorLogEntry>>,

    /// Present iff at least one success entry was recorded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub successful_attempts: Option<Vec<SuccessLogEntry>>,

    pub metrics: RequestMetrics,
}

/// Builder-style entrypoint for one logical request.
///
/// ```no_run
/// use stable_request::engine::StableRequest;
/// use stable_request::config::{RequestTarget, StableRequestOptions};
///
/// # async fn example() -> stable_request::error::Result<()> {
/// let target = RequestTarget::builder("api.example.com")
///     .path("/v1/status")
///     .build()?;
///
/// let outcome = StableRequest::new(target)
///     .options(StableRequestOptions {
///         attempts: 3,
///         res_req: true,
///         ..Default::default()
///     })
///     .execute()
///     .await?;
///
/// assert!(outcome.metrics.total_attempts >= 1);
/// # Ok(())
/// # }
/// ```
pub struct StableRequest {
    target: RequestTarget,
    options: StableRequestOptions,
    hooks: RequestHooks,
    transport: Arc<dyn Transport>,
    buffer: Option<Arc<dyn StateBuffer>>,
    breaker: Option<Arc<CircuitBreaker>>,
    cache: Option<Arc<ResponseCache>>,
    state_persistence: Option<StatePersistence>,
    transaction_log_loader: Option<TransactionLogLoader>,
}

impl StableRequest {
    pub fn new(target: RequestTarget) -> Self {
        Self {
            target,
            options: StableRequestOptions::default(),
            hooks: RequestHooks::default(),
            transport: Arc::new(HttpTransport::new()),
            buffer: None,
            breaker: None,
            cache: None,
            state_persistence: None,
            transaction_log_loader: None,
        }
    }

    pub fn options(mut self, options: StableRequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn hooks(mut self, hooks: RequestHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    /// Share a buffer across calls; defaults to a fresh in-memory buffer.
    pub fn buffer(mut self, buffer: Arc<dyn StateBuffer>) -> Self {
        self.buffer = Some(buffer);
        self
    }

    pub fn breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn state_persistence(mut self, persistence: StatePersistence) -> Self {
        self.state_persistence = Some(persistence);
        self
    }

    pub fn transaction_log_loader(mut self, loader: TransactionLogLoader) -> Self {
        self.transaction_log_loader = Some(loader);
        self
    }

    /// Run the request lifecycle to completion.
    pub async fn execute(self) -> Result<RequestOutcome> {
        let buffer: Arc<dyn StateBuffer> = self
            .buffer
            .clone()
            .unwrap_or_else(|| Arc::new(PlainBuffer::new()));

        let mut options = self.options.clone().clamped();
        let context = options.context.clone();

        // Previously recorded transaction logs feed the pre-execution hook
        // and the analyzer; loader failures are logged and ignored.
        let transaction_logs = Arc::new(match &self.transaction_log_loader {
            Some(loader) => match loader(&context).await {
                Ok(logs) => logs,
                Err(err) => {
                    warn!(error = %err, "transaction log loader failed");
                    Vec::new()
                }
            },
            None => Vec::new(),
        });

        let mut run = RunState::new(now_rfc3339());

        // Pre-execution hook: may override the active options or abort the
        // whole call.
        let mut pre_execution_result = None;
        if let Some(hook) = &self.hooks.pre_execution {
            let args = PreExecutionArgs {
                input_params: options.hook_params.clone(),
                request: self.target.clone(),
                options: options.clone(),
                transaction_logs: Arc::clone(&transaction_logs),
            };

            match run_hook(
                buffer.as_ref(),
                "pre-execution",
                Arc::clone(hook),
                args,
                self.state_persistence.clone(),
                &context,
                options.hook_params.clone(),
            )
            .await
            {
                Ok(result) => {
                    if let Some(update) = &result {
                        if options.apply_pre_execution_config_override {
                            options.apply_override(update);
                        }
                    }
                    pre_execution_result = result;
                }
                Err(err) => {
                    warn!(error = %err, "pre-execution hook failed");
                    if !options.continue_on_pre_execution_hook_failure {
                        if options.throw_on_failed_error_analysis {
                            return Err(err);
                        }
                        return Ok(self.finish_failure(run, &options, err.to_string()).await);
                    }
                }
            }
        }

        // Transport config and trial-mode validation.
        self.target.validate()?;
        if let Some(trial) = &options.trial_mode {
            trial.validate()?;
        }
        let transport_config = self.target.to_transport_config();
        let cache_url = format!("{}{}", transport_config.base_url, transport_config.url);
        let backoff = options.backoff_policy();

        let attempts = options.attempts;
        for attempt in 1..=attempts {
            run.attempts_made = attempt;

            // Breaker admission: every attempt in attempt-tracking mode,
            // otherwise only the first.
            if let Some(breaker) = &self.breaker {
                if breaker.config().track_individual_attempts || attempt == 1 {
                    if !breaker.can_execute().await {
                        debug!(attempt, "request rejected by circuit breaker");
                        run.abort = Some(StableError::CircuitOpen);
                        break;
                    }
                }
            }

            // Cache lookup: a hit short-circuits the entire call.
            if let Some(cache) = &self.cache {
                if cache.is_cacheable_method(transport_config.method) {
                    let key = cache.cache_key(
                        transport_config.method,
                        &cache_url,
                        &transport_config.params,
                        &transport_config.headers,
                    );
                    if let Some(entry) = cache.get(&key).await {
                        debug!(attempt, "serving response from cache");
                        return Ok(self.finish_cache_hit(run, &options, entry.data).await);
                    }
                }
            }

            // Transport execution (or trial-mode synthesis), normalized into
            // an attempt result.
            run.executed_any_attempt = true;
            let attempt_started = Instant::now();
            let transport_outcome = self.execute_attempt(&options, &transport_config).await;
            let execution_time_ms = attempt_started.elapsed().as_millis() as u64;
            run.attempt_time_sum_ms += execution_time_ms;

            let attempt_result = normalize_attempt(&transport_outcome, execution_time_ms);

            match transport_outcome {
                Err(transport_error) => {
                    if self.breaker_tracks_attempts() {
                        if let Some(breaker) = &self.breaker {
                            breaker.record_attempt_failure().await;
                            if breaker.state().await == CircuitState::Open {
                                run.record_failed_attempt(
                                    &self.hooks,
                                    buffer.as_ref(),
                                    &self.target,
                                    &options,
                                    self.state_persistence.clone(),
                                    attempts,
                                    &attempt_result,
                                )
                                .await;
                                run.abort = Some(StableError::CircuitOpen);
                                break;
                            }
                        }
                    }

                    run.record_failed_attempt(
                        &self.hooks,
                        buffer.as_ref(),
                        &self.target,
                        &options,
                        self.state_persistence.clone(),
                        attempts,
                        &attempt_result,
                    )
                    .await;

                    if transport_error.cancelled {
                        run.abort = Some(StableError::Cancelled);
                        break;
                    }

                    let more_attempts = attempt < attempts;
                    if !(more_attempts
                        && (attempt_result.is_retryable || options.perform_all_attempts))
                    {
                        break;
                    }
                }
                Ok(response) => {
                    let accepted = self
                        .analyze_response(
                            buffer.as_ref(),
                            &options,
                            &context,
                            &response,
                            &pre_execution_result,
                            &transaction_logs,
                        )
                        .await;

                    if self.breaker_tracks_attempts() {
                        if let Some(breaker) = &self.breaker {
                            if accepted {
                                breaker.record_attempt_success().await;
                            } else {
                                breaker.record_attempt_failure().await;
                            }
                            if breaker.state().await == CircuitState::Open {
                                run.abort = Some(StableError::CircuitOpen);
                                break;
                            }
                        }
                    }

                    if accepted {
                        run.record_accepted_attempt(
                            &self.hooks,
                            buffer.as_ref(),
                            &self.target,
                            &options,
                            self.state_persistence.clone(),
                            attempt,
                            &attempt_result,
                        )
                        .await;

                        if let Some(cache) = &self.cache {
                            if cache.is_cacheable_method(transport_config.method) {
                                let key = cache.cache_key(
                                    transport_config.method,
                                    &cache_url,
                                    &transport_config.params,
                                    &transport_config.headers,
                                );
                                cache.set(&key, &response).await;
                            }
                        }

                        run.last_accepted = Some(response);

                        if !(options.perform_all_attempts && attempt < attempts) {
                            break;
                        }
                    } else {
                        run.record_rejected_attempt(
                            &self.hooks,
                            buffer.as_ref(),
                            &self.target,
                            &options,
                            self.state_persistence.clone(),
                            attempts,
                            &attempt_result,
                        )
                        .await;

                        if attempt >= attempts {
                            break;
                        }
                    }
                }
            }

            tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
        }

        // Termination: record the whole-request outcome on the breaker, then
        // build the result record.
        if run.last_accepted.is_some() {
            if let Some(breaker) = &self.breaker {
                if run.executed_any_attempt {
                    breaker.record_success().await;
                }
            }
            Ok(self.finish_success(run, &options).await)
        } else {
            if let Some(breaker) = &self.breaker {
                if run.executed_any_attempt {
                    breaker.record_failure().await;
                }
            }

            let final_error = run.final_error_message();
            let handled = self
                .analyze_final_error(buffer.as_ref(), &options, &context, &final_error)
                .await;

            if options.throw_on_failed_error_analysis && !handled {
                return Err(run.abort.take().unwrap_or(StableError::AttemptsExhausted {
                    attempts: run.attempts_made,
                    last_error: final_error,
                }));
            }

            Ok(self.finish_failure(run, &options, final_error).await)
        }
    }

    fn breaker_tracks_attempts(&self) -> bool {
        self.breaker
            .as_ref()
            .is_some_and(|breaker| breaker.config().track_individual_attempts)
    }

    async fn execute_attempt(
        &self,
        options: &StableRequestOptions,
        config: &TransportConfig,
    ) -> std::result::Result<TransportResponse, TransportError> {
        if let Some(trial) = options.trial_mode.as_ref().filter(|trial| trial.enabled) {
            let fail = rand::rng().random_bool(trial.req_failure_probability);
            return if fail {
                Err(TransportError::from_status(500, "Trial Mode Failure", None))
            } else {
                Ok(TransportResponse {
                    data: serde_json::json!({ "trial": true }),
                    status: 200,
                    status_text: "OK".to_string(),
                    headers: Default::default(),
                })
            };
        }

        self.transport
            .execute(config, self.target.cancel.as_ref())
            .await
    }

    async fn analyze_response(
        &self,
        buffer: &dyn StateBuffer,
        options: &StableRequestOptions,
        context: &ExecutionContext,
        response: &TransportResponse,
        pre_execution_result: &Option<OptionsOverride>,
        transaction_logs: &Arc<Vec<TransactionLogEntry>>,
    ) -> bool {
        let Some(analyzer) = &self.hooks.response_analyzer else {
            return true;
        };

        let args = AnalyzerArgs {
            request: self.target.clone(),
            data: response.data.clone(),
            status_code: Some(response.status),
            trial_mode: options.trial_mode.clone(),
            params: options.hook_params.clone(),
            pre_execution_result: pre_execution_result.clone(),
            context: context.clone(),
            transaction_logs: Arc::clone(transaction_logs),
        };

        match run_hook(
            buffer,
            "response-analyzer",
            Arc::clone(analyzer),
            args,
            self.state_persistence.clone(),
            context,
            options.hook_params.clone(),
        )
        .await
        {
            Ok(accepted) => accepted,
            Err(err) => {
                // An exploding analyzer cannot accept a response.
                warn!(error = %err, "response analyzer failed, treating as retry");
                false
            }
        }
    }

    async fn analyze_final_error(
        &self,
        buffer: &dyn StateBuffer,
        options: &StableRequestOptions,
        context: &ExecutionContext,
        final_error: &str,
    ) -> bool {
        let Some(analyzer) = &self.hooks.final_error_analyzer else {
            return false;
        };

        let args = FinalErrorArgs {
            request: self.target.clone(),
            error: final_error.to_string(),
            trial_mode: options.trial_mode.clone(),
            params: options.hook_params.clone(),
            context: context.clone(),
        };

        match run_hook(
            buffer,
            "final-error-analyzer",
            Arc::clone(analyzer),
            args,
            self.state_persistence.clone(),
            context,
            options.hook_params.clone(),
        )
        .await
        {
            Ok(handled) => handled,
            Err(err) => {
                warn!(error = %err, "final error analyzer failed, treating as unhandled");
                false
            }
        }
    }

    async fn finish_success(&self, run: RunState, options: &StableRequestOptions) -> RequestOutcome {
        let data = if options.res_req {
            run.last_accepted.as_ref().map(|response| response.data.clone())
        } else {
            Some(Value::Bool(true))
        };

        RequestOutcome {
            success: true,
            data,
            error: None,
            error_logs: (!run.error_logs.is_empty()).then(|| run.error_logs.clone()),
            successful_attempts: (!run.successful_attempts.is_empty())
                .then(|| run.successful_attempts.clone()),
            metrics: self.build_metrics(&run, options).await,
        }
    }

    async fn finish_cache_hit(
        &self,
        mut run: RunState,
        options: &StableRequestOptions,
        data: Value,
    ) -> RequestOutcome {
        run.from_cache = true;
        RequestOutcome {
            success: true,
            data: Some(if options.res_req { data } else { Value::Bool(true) }),
            error: None,
            error_logs: None,
            successful_attempts: None,
            metrics: self.build_metrics(&run, options).await,
        }
    }

    async fn finish_failure(
        &self,
        run: RunState,
        options: &StableRequestOptions,
        error: String,
    ) -> RequestOutcome {
        RequestOutcome {
            success: false,
            data: None,
            error: Some(error),
            error_logs: (!run.error_logs.is_empty()).then(|| run.error_logs.clone()),
            successful_attempts: (!run.successful_attempts.is_empty())
                .then(|| run.successful_attempts.clone()),
            metrics: self.build_metrics(&run, options).await,
        }
    }

    async fn build_metrics(
        &self,
        run: &RunState,
        options: &StableRequestOptions,
    ) -> RequestMetrics {
        let mut metrics = RequestMetrics {
            total_attempts: run.attempts_made,
            successful_attempts: run.successful_count,
            failed_attempts: run.failed_count,
            total_execution_time_ms: run.attempt_time_sum_ms,
            average_attempt_time_ms: if run.attempts_made == 0 {
                0.0
            } else {
                run.attempt_time_sum_ms as f64 / f64::from(run.attempts_made)
            },
            from_cache: run.from_cache,
            started_at: run.started_at.clone(),
            finished_at: now_rfc3339(),
            circuit_breaker_state: match &self.breaker {
                Some(breaker) => Some(breaker.state().await.to_string()),
                None => None,
            },
            anomalies: Vec::new(),
        };

        if let Some(guardrails) = &options.metrics_guardrails {
            metrics.validate(guardrails);
        }
        metrics
    }
}

impl std::fmt::Debug for StableRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StableRequest")
            .field("target", &self.target)
            .field("options", &self.options)
            .field("hooks", &self.hooks)
            .field("breaker", &self.breaker.is_some())
            .field("cache", &self.cache.is_some())
            .finish()
    }
}

/// Normalize a transport outcome into the attempt-result record.
fn normalize_attempt(
    outcome: &std::result::Result<TransportResponse, TransportError>,
    execution_time_ms: u64,
) -> AttemptResult {
    match outcome {
        Ok(response) => AttemptResult {
            ok: true,
            is_retryable: false,
            timestamp: now_rfc3339(),
            execution_time_ms,
            status_code: Some(response.status),
            error: None,
            data: Some(response.data.clone()),
            from_cache: false,
        },
        Err(error) => AttemptResult {
            ok: false,
            is_retryable: is_retryable_error(error),
            timestamp: now_rfc3339(),
            execution_time_ms,
            status_code: error.status,
            error: Some(error.message.clone()),
            data: error.data.clone(),
            from_cache: false,
        },
    }
}

/// Mutable per-call bookkeeping.
struct RunState {
    started_at: String,
    attempts_made: u32,
    successful_count: u32,
    failed_count: u32,
    attempt_time_sum_ms: u64,
    executed_any_attempt: bool,
    from_cache: bool,
    last_accepted: Option<TransportResponse>,
    last_error: Option<String>,
    abort: Option<StableError>,
    error_logs: Vec<ErrorLogEntry>,
    successful_attempts: Vec<SuccessLogEntry>,
}

impl RunState {
    fn new(started_at: String) -> Self {
        Self {
            started_at,
            attempts_made: 0,
            successful_count: 0,
            failed_count: 0,
            attempt_time_sum_ms: 0,
            executed_any_attempt: false,
            from_cache: false,
            last_accepted: None,
            last_error: None,
            abort: None,
            error_logs: Vec::new(),
            successful_attempts: Vec::new(),
        }
    }

    fn final_error_message(&self) -> String {
        if let Some(abort) = &self.abort {
            return abort.to_string();
        }
        self.last_error
            .clone()
            .unwrap_or_else(|| "Request failed without a recorded error".to_string())
    }

    /// Record a transport failure: counters, error log entry and the
    /// error-reporting hook.
    async fn record_failed_attempt(
        &mut self,
        hooks: &RequestHooks,
        buffer: &dyn StateBuffer,
        target: &RequestTarget,
        options: &StableRequestOptions,
        persistence: Option<StatePersistence>,
        attempts: u32,
        attempt_result: &AttemptResult,
    ) {
        self.failed_count += 1;
        self.last_error = attempt_result.error.clone();

        if !options.log_all_errors {
            return;
        }

        let entry = ErrorLogEntry {
            timestamp: attempt_result.timestamp.clone(),
            attempt: format!("{}/{}", self.attempts_made, attempts),
            error: attempt_result.error.clone().unwrap_or_default(),
            kind: ErrorKind::HttpError,
            is_retryable: attempt_result.is_retryable,
            execution_time_ms: attempt_result.execution_time_ms,
            status_code: attempt_result.status_code,
        };
        self.error_logs.push(entry.clone());
        self.run_error_hook(hooks, buffer, target, options, persistence, entry)
            .await;
    }

    /// Record an analyzer rejection: counters, error log entry and the
    /// error-reporting hook.
    async fn record_rejected_attempt(
        &mut self,
        hooks: &RequestHooks,
        buffer: &dyn StateBuffer,
        target: &RequestTarget,
        options: &StableRequestOptions,
        persistence: Option<StatePersistence>,
        attempts: u32,
        attempt_result: &AttemptResult,
    ) {
        self.failed_count += 1;
        let rendered = attempt_result
            .data
            .as_ref()
            .map(|data| truncate_for_log(data, options.max_serializable_chars))
            .unwrap_or_default();
        let message = format!("Response rejected by analyzer: {}", rendered);
        self.last_error = Some(message.clone());

        if !options.log_all_errors {
            return;
        }

        let entry = ErrorLogEntry {
            timestamp: attempt_result.timestamp.clone(),
            attempt: format!("{}/{}", self.attempts_made, attempts),
            error: message,
            kind: ErrorKind::InvalidContent,
            is_retryable: true,
            execution_time_ms: attempt_result.execution_time_ms,
            status_code: attempt_result.status_code,
        };
        self.error_logs.push(entry.clone());
        self.run_error_hook(hooks, buffer, target, options, persistence, entry)
            .await;
    }

    async fn run_error_hook(
        &mut self,
        hooks: &RequestHooks,
        buffer: &dyn StateBuffer,
        target: &RequestTarget,
        options: &StableRequestOptions,
        persistence: Option<StatePersistence>,
        entry: ErrorLogEntry,
    ) {
        let Some(handler) = &hooks.handle_errors else {
            return;
        };

        let args = ErrorHandlerArgs {
            request: target.clone(),
            error_log: entry,
            max_serializable_chars: options.max_serializable_chars,
            params: options.hook_params.clone(),
            context: options.context.clone(),
        };

        if let Err(err) = run_hook(
            buffer,
            "handle-errors",
            Arc::clone(handler),
            args,
            persistence,
            &options.context,
            options.hook_params.clone(),
        )
        .await
        {
            warn!(error = %err, "error-reporting hook failed");
        }
    }

    /// Record an accepted attempt: counters, success log entry and the
    /// success-reporting hook.
    async fn record_accepted_attempt(
        &mut self,
        hooks: &RequestHooks,
        buffer: &dyn StateBuffer,
        target: &RequestTarget,
        options: &StableRequestOptions,
        persistence: Option<StatePersistence>,
        attempt: u32,
        attempt_result: &AttemptResult,
    ) {
        self.successful_count += 1;

        if !options.log_all_successful_attempts {
            return;
        }

        let entry = SuccessLogEntry {
            attempt,
            timestamp: attempt_result.timestamp.clone(),
            data: attempt_result.data.clone().unwrap_or(Value::Null),
            execution_time_ms: attempt_result.execution_time_ms,
            status_code: attempt_result.status_code,
        };
        self.successful_attempts.push(entry.clone());

        let Some(handler) = &hooks.handle_successful_attempt else {
            return;
        };

        let args = SuccessHandlerArgs {
            request: target.clone(),
            successful_attempt: entry,
            params: options.hook_params.clone(),
            context: options.context.clone(),
        };

        if let Err(err) = run_hook(
            buffer,
            "handle-successful-attempt",
            Arc::clone(handler),
            args,
            persistence,
            &options.context,
            options.hook_params.clone(),
        )
        .await
        {
            warn!(error = %err, "success-reporting hook failed");
        }
    }
}

//! Request descriptor and engine configuration
//!
//! The request descriptor names the upstream; the options record carries the
//! retry/backoff/reporting knobs. A validating builder replaces ad-hoc
//! option spreading: every field is checked at construction and numeric
//! ranges are clamped in one place.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::backoff::{BackoffPolicy, RetryStrategy};
use crate::context::ExecutionContext;
use crate::error::{Result, StableError};
use crate::metrics::MetricsGuardrails;
use crate::transport::{HttpMethod, TransportConfig};

/// URL scheme for the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    #[default]
    Https,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Http => f.write_str("http"),
            Protocol::Https => f.write_str("https"),
        }
    }
}

/// Where and how to reach the upstream for one logical request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestTarget {
    pub hostname: String,

    #[serde(default)]
    pub protocol: Protocol,

    #[serde(default)]
    pub method: HttpMethod,

    /// Must begin with `/`
    #[serde(default = "default_path")]
    pub path: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default)]
    pub query: HashMap<String, String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Forwarded to the transport; firing terminates the attempt loop
    #[serde(skip)]
    pub cancel: Option<CancellationToken>,
}

fn default_path() -> String {
    "/".to_string()
}

fn default_port() -> u16 {
    443
}

fn default_timeout_ms() -> u64 {
    15_000
}

impl RequestTarget {
    /// Start a validated builder for the given hostname.
    pub fn builder(hostname: impl Into<String>) -> RequestTargetBuilder {
        RequestTargetBuilder::new(hostname)
    }

    /// Check the descriptor's structural requirements.
    pub fn validate(&self) -> Result<()> {
        if self.hostname.trim().is_empty() {
            return Err(StableError::Config("hostname must not be empty".to_string()));
        }
        if !self.path.starts_with('/') {
            return Err(StableError::Config(format!(
                "path must begin with '/', got '{}'",
                self.path
            )));
        }
        Ok(())
    }

    /// Compose the transport-ready config with explicit defaults.
    pub fn to_transport_config(&self) -> TransportConfig {
        TransportConfig {
            method: self.method,
            url: self.path.clone(),
            base_url: format!("{}://{}:{}", self.protocol, self.hostname, self.port),
            headers: self.headers.clone(),
            params: self.query.clone(),
            data: self.body.clone(),
            timeout_ms: self.timeout_ms,
        }
    }
}

/// Field-by-field validating builder for [`RequestTarget`].
#[derive(Debug, Clone)]
pub struct RequestTargetBuilder {
    target: RequestTarget,
}

impl RequestTargetBuilder {
    fn new(hostname: impl Into<String>) -> Self {
        Self {
            target: RequestTarget {
                hostname: hostname.into(),
                protocol: Protocol::default(),
                method: HttpMethod::default(),
                path: default_path(),
                port: default_port(),
                headers: HashMap::new(),
                query: HashMap::new(),
                body: None,
                timeout_ms: default_timeout_ms(),
                cancel: None,
            },
        }
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.target.protocol = protocol;
        self
    }

    pub fn method(mut self, method: HttpMethod) -> Self {
        self.target.method = method;
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.target.path = path.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.target.port = port;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.target.headers.insert(name.into(), value.into());
        self
    }

    pub fn query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.target.query.insert(name.into(), value.into());
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.target.body = Some(body);
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.target.timeout_ms = timeout_ms;
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.target.cancel = Some(token);
        self
    }

    pub fn build(self) -> Result<RequestTarget> {
        self.target.validate()?;
        Ok(self.target)
    }
}

/// Synthetic failure injection for rehearsing failure paths.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrialMode {
    pub enabled: bool,

    /// Probability in `[0, 1]` that an attempt is replaced with a synthetic
    /// failure; otherwise a synthetic 200 response is substituted
    pub req_failure_probability: f64,
}

impl TrialMode {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.req_failure_probability) {
            return Err(StableError::Config(format!(
                "trial mode probability must be within [0, 1], got {}",
                self.req_failure_probability
            )));
        }
        Ok(())
    }
}

/// Engine knobs for one logical request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StableRequestOptions {
    /// Attempt budget, one-based
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Keep attempting even after an accepted response
    #[serde(default)]
    pub perform_all_attempts: bool,

    #[serde(default = "default_wait_ms")]
    pub wait_ms: u64,

    #[serde(default = "default_max_allowed_wait_ms")]
    pub max_allowed_wait_ms: u64,

    #[serde(default)]
    pub retry_strategy: RetryStrategy,

    /// Jitter factor in `[0, 1)`
    #[serde(default)]
    pub jitter: f64,

    /// Include the response payload in the outcome (`data` is otherwise a
    /// bare `true`)
    #[serde(default)]
    pub res_req: bool,

    #[serde(default)]
    pub log_all_errors: bool,

    #[serde(default)]
    pub log_all_successful_attempts: bool,

    #[serde(default = "default_max_serializable_chars")]
    pub max_serializable_chars: usize,

    /// Rethrow when the final error analyzer leaves the failure unhandled
    #[serde(default)]
    pub throw_on_failed_error_analysis: bool,

    /// Carry on when the pre-execution hook fails
    #[serde(default)]
    pub continue_on_pre_execution_hook_failure: bool,

    /// Merge the pre-execution hook's returned overrides into these options
    #[serde(default)]
    pub apply_pre_execution_config_override: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub trial_mode: Option<TrialMode>,

    /// Opaque payload forwarded to every hook
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook_params: Option<Value>,

    #[serde(default, skip_serializing_if = "ExecutionContext::is_empty")]
    pub context: ExecutionContext,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_guardrails: Option<MetricsGuardrails>,
}

fn default_attempts() -> u32 {
    1
}

fn default_wait_ms() -> u64 {
    1_000
}

fn default_max_allowed_wait_ms() -> u64 {
    60_000
}

fn default_max_serializable_chars() -> usize {
    1_000
}

impl Default for StableRequestOptions {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            perform_all_attempts: false,
            wait_ms: default_wait_ms(),
            max_allowed_wait_ms: default_max_allowed_wait_ms(),
            retry_strategy: RetryStrategy::default(),
            jitter: 0.0,
            res_req: false,
            log_all_errors: false,
            log_all_successful_attempts: false,
            max_serializable_chars: default_max_serializable_chars(),
            throw_on_failed_error_analysis: false,
            continue_on_pre_execution_hook_failure: false,
            apply_pre_execution_config_override: false,
            trial_mode: None,
            hook_params: None,
            context: ExecutionContext::default(),
            metrics_guardrails: None,
        }
    }
}

impl StableRequestOptions {
    /// Clamp numeric ranges. All range policing lives here so overrides and
    /// deserialized configs go through the same funnel.
    pub fn clamped(mut self) -> Self {
        self.attempts = self.attempts.max(1);
        self.jitter = if self.jitter.is_finite() {
            self.jitter.clamp(0.0, 0.99)
        } else {
            0.0
        };
        self.max_allowed_wait_ms = self.max_allowed_wait_ms.max(1);
        self
    }

    /// Preset for quick retries against flaky-but-fast upstreams.
    pub fn fast_preset() -> Self {
        Self {
            attempts: 5,
            wait_ms: 50,
            max_allowed_wait_ms: 5_000,
            retry_strategy: RetryStrategy::Linear,
            ..Default::default()
        }
    }

    /// Preset for unreliable networks: generous budget with jittered
    /// exponential backoff.
    pub fn network_preset() -> Self {
        Self {
            attempts: 10,
            wait_ms: 100,
            max_allowed_wait_ms: 30_000,
            retry_strategy: RetryStrategy::Exponential,
            jitter: 0.5,
            ..Default::default()
        }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            wait_ms: self.wait_ms,
            max_allowed_wait_ms: self.max_allowed_wait_ms,
            strategy: self.retry_strategy,
            jitter: self.jitter,
        }
    }

    /// Apply a pre-execution override on top of these options and re-clamp.
    pub fn apply_override(&mut self, update: &OptionsOverride) {
        if let Some(attempts) = update.attempts {
            self.attempts = attempts;
        }
        if let Some(perform_all_attempts) = update.perform_all_attempts {
            self.perform_all_attempts = perform_all_attempts;
        }
        if let Some(wait_ms) = update.wait_ms {
            self.wait_ms = wait_ms;
        }
        if let Some(max_allowed_wait_ms) = update.max_allowed_wait_ms {
            self.max_allowed_wait_ms = max_allowed_wait_ms;
        }
        if let Some(retry_strategy) = update.retry_strategy {
            self.retry_strategy = retry_strategy;
        }
        if let Some(jitter) = update.jitter {
            self.jitter = jitter;
        }
        if let Some(res_req) = update.res_req {
            self.res_req = res_req;
        }
        if let Some(log_all_errors) = update.log_all_errors {
            self.log_all_errors = log_all_errors;
        }
        if let Some(log_all_successful_attempts) = update.log_all_successful_attempts {
            self.log_all_successful_attempts = log_all_successful_attempts;
        }

        let clamped = std::mem::take(self).clamped();
        *self = clamped;
    }
}

/// Partial options returned by the pre-execution hook.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptionsOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub perform_all_attempts: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_allowed_wait_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_strategy: Option<RetryStrategy>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub res_req: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_all_errors: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_all_successful_attempts: Option<bool>,
}

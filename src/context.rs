//! Execution context carried through hooks and transaction logs
//!
//! The context is a correlation tuple only. It tags log entries and hook
//! invocations so callers can stitch a request back into a larger workflow,
//! and it never influences behavior.

use serde::{Deserialize, Serialize};

/// Correlation identifiers threaded through every hook and log entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ExecutionContext {
    /// Context with only a request id set.
    pub fn for_request(request_id: impl Into<String>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            ..Default::default()
        }
    }

    /// True when no identifier is set.
    pub fn is_empty(&self) -> bool {
        self.workflow_id.is_none()
            && self.branch_id.is_none()
            && self.phase_id.is_none()
            && self.request_id.is_none()
    }
}

//! Transaction-log replay
//!
//! Re-applies a recorded transaction sequence to a fresh buffer. Without a
//! matching handler an entry is replayed by installing its recorded terminal
//! state, which reproduces the original buffer state for any log produced by
//! deterministic transactions. Handlers keyed by activity take over when the
//! caller wants the side effects re-executed instead.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use super::{StateBuffer, StateMap, TransactionLogEntry, TransactionOptions, TxnBody};
use crate::error::Result;

/// Re-executes one recorded transaction against the live state.
pub type ReplayHandler =
    Arc<dyn Fn(&TransactionLogEntry, &mut StateMap) -> std::result::Result<(), String> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayOptions {
    /// Skip entries whose `transaction_id` was already replayed
    pub dedupe: bool,
}

/// Outcome of a replay run. With `dedupe`, `applied + skipped + failed`
/// equals the input size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Replay recorded transactions onto a buffer.
pub async fn replay_transactions(
    buffer: &dyn StateBuffer,
    entries: &[TransactionLogEntry],
    handlers: &HashMap<String, ReplayHandler>,
    options: ReplayOptions,
) -> Result<ReplayReport> {
    let mut report = ReplayReport::default();
    let mut seen: HashSet<String> = HashSet::new();

    for entry in entries {
        if options.dedupe && !seen.insert(entry.transaction_id.clone()) {
            report.skipped += 1;
            continue;
        }

        let handler = entry
            .activity
            .as_ref()
            .and_then(|activity| handlers.get(activity))
            .cloned();

        let replayed = entry.clone();
        let body: TxnBody = Box::new(move |state| {
            Box::pin(async move {
                match handler {
                    Some(handler) => handler(&replayed, state)?,
                    None => {
                        *state = replayed.state_after.clone();
                    }
                }
                Ok(Value::Null)
            })
        });

        let opts = TransactionOptions {
            activity: entry.activity.clone(),
            hook_name: entry.hook_name.clone(),
            hook_params: entry.hook_params.clone(),
            context: entry.context.clone(),
        };

        match buffer.run(body, opts).await {
            Ok(_) => report.applied += 1,
            Err(err) => {
                warn!(
                    transaction_id = %entry.transaction_id,
                    error = %err,
                    "replay of transaction failed"
                );
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{PlainBuffer, StableBuffer, StableBufferOptions};
    use crate::context::ExecutionContext;

    fn entry(id: &str, activity: Option<&str>, counter: i64) -> TransactionLogEntry {
        let mut after = StateMap::new();
        after.insert("counter".to_string(), Value::from(counter));
        TransactionLogEntry {
            transaction_id: id.to_string(),
            queued_at: 1_000,
            started_at: 1_001,
            finished_at: 1_002,
            duration_ms: 1,
            queue_wait_ms: 1,
            success: true,
            error_message: None,
            state_before: StateMap::new(),
            state_after: after,
            activity: activity.map(str::to_string),
            hook_name: None,
            hook_params: None,
            context: ExecutionContext::default(),
        }
    }

    #[tokio::test]
    async fn test_replay_reproduces_terminal_state() {
        let buffer = PlainBuffer::new();
        let entries = vec![
            entry("stable-buffer-1-0", None, 1),
            entry("stable-buffer-1-1", None, 2),
            entry("stable-buffer-1-2", None, 7),
        ];

        let report =
            replay_transactions(&buffer, &entries, &HashMap::new(), ReplayOptions::default())
                .await
                .unwrap();

        assert_eq!(report.applied, 3);
        assert_eq!(report.skipped, 0);
        assert_eq!(buffer.read().await.get("counter"), Some(&Value::from(7)));
    }

    #[tokio::test]
    async fn test_replay_dedupe_filters_identical_ids() {
        let buffer = StableBuffer::new(StableBufferOptions::default());
        let entries = vec![
            entry("stable-buffer-1-0", None, 1),
            entry("stable-buffer-1-0", None, 1),
            entry("stable-buffer-1-1", None, 2),
        ];

        let report = replay_transactions(
            &buffer,
            &entries,
            &HashMap::new(),
            ReplayOptions { dedupe: true },
        )
        .await
        .unwrap();

        assert_eq!(report.applied, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.applied + report.skipped, entries.len());
    }

    #[tokio::test]
    async fn test_replay_prefers_matching_handler() {
        let buffer = PlainBuffer::new();
        let handler: ReplayHandler = Arc::new(|entry, state| {
            // Re-execute instead of installing the recorded state.
            let recorded = entry
                .state_after
                .get("counter")
                .and_then(Value::as_i64)
                .unwrap_or_default();
            state.insert("counter".to_string(), Value::from(recorded * 10));
            Ok(())
        });

        let handlers = HashMap::from([("increment".to_string(), handler)]);
        let entries = vec![entry("stable-buffer-2-0", Some("increment"), 3)];

        let report = replay_transactions(&buffer, &entries, &handlers, ReplayOptions::default())
            .await
            .unwrap();

        assert_eq!(report.applied, 1);
        assert_eq!(buffer.read().await.get("counter"), Some(&Value::from(30)));
    }

    #[tokio::test]
    async fn test_replay_counts_handler_failures() {
        let buffer = PlainBuffer::new();
        let handler: ReplayHandler = Arc::new(|_, _| Err("cannot re-execute".to_string()));
        let handlers = HashMap::from([("broken".to_string(), handler)]);

        let entries = vec![
            entry("stable-buffer-3-0", Some("broken"), 1),
            entry("stable-buffer-3-1", None, 2),
        ];

        let report = replay_transactions(&buffer, &entries, &handlers, ReplayOptions::default())
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.applied, 1);
        assert_eq!(buffer.read().await.get("counter"), Some(&Value::from(2)));
    }
}

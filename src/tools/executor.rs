//! Tool execution with permission gates, timeouts, and bounded history.
//!
//! [`ToolExecutor::execute`] is the only way a parsed tool call becomes a
//! side effect. The sequence is fixed: resolve → permission → parameter
//! validation → timeout bracket → truncation → record. A timeout or
//! cancellation produces a failure result immediately without waiting for
//! the worker — the worker holds a child cancellation token and is expected
//! to honour it, but the executor never blocks on it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::CoreError;

use super::{PermissionLevel, ToolCall, ToolParams, ToolRegistry};

/// Default per-call timeout when the caller supplies none.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);
/// Hard cap on any caller-supplied timeout.
pub const MAX_TOOL_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// Tool output is truncated at this many bytes.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 30 * 1024;
/// Bounded execution history; oldest records evicted first.
pub const MAX_HISTORY: usize = 1000;

/// Outcome of one execution attempt.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub truncated: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl ToolResult {
    fn failure(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            truncated: false,
            duration_ms,
            exit_code: None,
        }
    }
}

/// One entry of the bounded execution history.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub tool_name: String,
    pub params: ToolParams,
    /// First line of the output or the error text.
    pub result: String,
    pub approved: bool,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Approval callback for `Ask`-level calls. Returning `false` denies.
pub type Approver = Arc<dyn Fn(&str, &ToolParams) -> bool + Send + Sync>;

/// Executes registered tools under the permission and resource policy.
pub struct ToolExecutor {
    registry: ToolRegistry,
    approver: Option<Approver>,
    max_output_bytes: usize,
    history: Mutex<VecDeque<ExecutionRecord>>,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry,
            approver: None,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            history: Mutex::new(VecDeque::with_capacity(MAX_HISTORY)),
        }
    }

    /// Install the interactive approval callback. Without one, every
    /// `Ask`-level call is denied.
    pub fn with_approver(mut self, approver: Approver) -> Self {
        self.approver = Some(approver);
        self
    }

    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ToolRegistry {
        &mut self.registry
    }

    /// Execute one tool call.
    ///
    /// `timeout` is clamped to [`MAX_TOOL_TIMEOUT`]; `None` means
    /// [`DEFAULT_TOOL_TIMEOUT`]. Errors surface inside the returned
    /// [`ToolResult`] — the function itself only fails on executor bugs.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        call: ToolCall,
        timeout: Option<Duration>,
    ) -> ToolResult {
        let started = std::time::Instant::now();

        let Some(tool) = self.registry.get(&call.name) else {
            return ToolResult::failure(format!("unknown tool: {}", call.name), 0);
        };

        // Permission gate. The dynamic path-aware verdict has already been
        // folded in by the registry.
        let permission = self
            .registry
            .permission_with_params(&call.name, &call.params)
            .unwrap_or(PermissionLevel::Never);
        let approved = match permission {
            PermissionLevel::Auto => true,
            PermissionLevel::Ask => self
                .approver
                .as_ref()
                .map(|approve| approve(&call.name, &call.params))
                .unwrap_or(false),
            PermissionLevel::Never => false,
        };
        if !approved {
            let result = ToolResult::failure("permission denied", elapsed_ms(started));
            self.record(&call, &result, false).await;
            return result;
        }

        if let Err(e) = tool.schema.validate(&call.params) {
            let result = ToolResult::failure(e.to_string(), elapsed_ms(started));
            self.record(&call, &result, true).await;
            return result;
        }

        let timeout = timeout.unwrap_or(DEFAULT_TOOL_TIMEOUT).min(MAX_TOOL_TIMEOUT);

        // Fire-and-forget worker: it gets a child token that is cancelled on
        // timeout or caller cancellation, and a channel to report through.
        // The executor never awaits the worker beyond the bracket.
        let worker_token = cancel.child_token();
        let (result_tx, mut result_rx) = tokio::sync::mpsc::channel(1);
        let run = Arc::clone(&tool.run);
        let params = call.params.clone();
        {
            let worker_token = worker_token.clone();
            tokio::spawn(async move {
                let outcome = run(params, worker_token).await;
                let _ = result_tx.send(outcome).await;
            });
        }

        let result = tokio::select! {
            outcome = result_rx.recv() => match outcome {
                Some(Ok(output)) => {
                    let (text, truncated) = truncate(output.output, self.max_output_bytes);
                    ToolResult {
                        success: output.exit_code.unwrap_or(0) == 0,
                        output: text,
                        error: None,
                        truncated,
                        duration_ms: elapsed_ms(started),
                        exit_code: output.exit_code,
                    }
                }
                Some(Err(e)) => ToolResult::failure(e.to_string(), elapsed_ms(started)),
                None => ToolResult::failure("tool worker vanished", elapsed_ms(started)),
            },
            _ = tokio::time::sleep(timeout) => {
                worker_token.cancel();
                warn!(tool = %call.name, ?timeout, "tool call timed out");
                ToolResult::failure(
                    format!("timed out after {}s", timeout.as_secs()),
                    elapsed_ms(started),
                )
            }
            _ = cancel.cancelled() => {
                worker_token.cancel();
                ToolResult::failure(CoreError::Cancelled.to_string(), elapsed_ms(started))
            }
        };

        self.record(&call, &result, true).await;
        result
    }

    /// Recent execution records, newest first.
    pub async fn history(&self, limit: usize) -> Vec<ExecutionRecord> {
        let history = self.history.lock().await;
        history.iter().rev().take(limit).cloned().collect()
    }

    async fn record(&self, call: &ToolCall, result: &ToolResult, approved: bool) {
        let summary = result
            .error
            .clone()
            .unwrap_or_else(|| result.output.lines().next().unwrap_or("").to_string());
        debug!(tool = %call.name, success = result.success, "tool executed");

        let mut history = self.history.lock().await;
        if history.len() == MAX_HISTORY {
            history.pop_front();
        }
        history.push_back(ExecutionRecord {
            tool_name: call.name.clone(),
            params: call.params.clone(),
            result: summary,
            approved,
            timestamp: Utc::now(),
            duration_ms: result.duration_ms,
        });
    }
}

fn elapsed_ms(started: std::time::Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Truncate at a char boundary at or below `max` bytes.
fn truncate(mut text: String, max: usize) -> (String, bool) {
    if text.len() <= max {
        return (text, false);
    }
    let mut cut = max;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str("\n[output truncated]");
    (text, true)
}

//! Tool descriptors, permissions, and the registry.
//!
//! A [`Tool`] bundles a name, a parameter schema, a static permission level,
//! an optional *dynamic* permission function, and the async closure that
//! does the work. The registry maps names to descriptors and layers user
//! preferences (always-allow, per-tool overrides) on top — with one
//! deliberate asymmetry: a dynamic permission verdict other than `Auto`
//! cannot be downgraded by any user preference. "Always allow reads" must
//! not silently cover a read of `~/.aws/credentials`.

pub mod builtin;
pub mod executor;
pub mod parse;
pub mod schema;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

pub use executor::{ExecutionRecord, ToolExecutor, ToolResult};
pub use parse::extract_tool_calls;
pub use schema::{ParamSchema, ParamType, ToolParams};

/// What the executor needs from the user before running a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    /// Run without asking.
    Auto,
    /// Require interactive approval.
    Ask,
    /// Refuse unconditionally.
    Never,
}

/// Coarse blast-radius grade, surfaced in approval prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// A parsed tool invocation from model output.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub params: ToolParams,
}

/// Output of one tool run, before executor-side truncation.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub output: String,
    pub exit_code: Option<i32>,
}

/// Boxed future returned by tool closures.
pub type ToolFuture = Pin<Box<dyn std::future::Future<Output = Result<ToolOutput, CoreError>> + Send>>;

/// The work function: parameters + a cancellation token the tool must
/// honour (the executor cancels it on timeout).
pub type ToolFn =
    Arc<dyn Fn(ToolParams, tokio_util::sync::CancellationToken) -> ToolFuture + Send + Sync>;

/// Dynamic permission function, consulted per call with the actual params.
pub type PermissionFn = Arc<dyn Fn(&ToolParams) -> PermissionLevel + Send + Sync>;

/// A registered tool.
pub struct Tool {
    pub name: String,
    pub description: String,
    pub permission: PermissionLevel,
    pub permission_fn: Option<PermissionFn>,
    pub risk: RiskLevel,
    pub schema: ParamSchema,
    pub run: ToolFn,
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("permission", &self.permission)
            .field("risk", &self.risk)
            .finish()
    }
}

/// Name-keyed tool registry with layered user preferences.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<Tool>>,
    always_allow: HashMap<String, bool>,
    overrides: HashMap<String, PermissionLevel>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Tool) {
        self.tools.insert(tool.name.clone(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// User preference: skip approval prompts for this tool.
    pub fn set_always_allow(&mut self, tool: &str, allow: bool) {
        self.always_allow.insert(tool.to_string(), allow);
    }

    /// User preference: replace the tool's static permission level.
    pub fn set_permission_override(&mut self, tool: &str, level: PermissionLevel) {
        self.overrides.insert(tool.to_string(), level);
    }

    /// Effective permission for a concrete call.
    ///
    /// Order: the tool's dynamic permission function runs first with the
    /// actual parameters — any non-`Auto` verdict is final. Only an `Auto`
    /// verdict (or no function) falls through to the user override, then the
    /// always-allow toggle, then the tool's static level.
    pub fn permission_with_params(&self, name: &str, params: &ToolParams) -> Option<PermissionLevel> {
        let tool = self.tools.get(name)?;

        if let Some(dynamic) = &tool.permission_fn {
            let verdict = dynamic(params);
            if verdict != PermissionLevel::Auto {
                return Some(verdict);
            }
        }

        if let Some(level) = self.overrides.get(name) {
            return Some(*level);
        }
        if self.always_allow.get(name).copied().unwrap_or(false) {
            return Some(PermissionLevel::Auto);
        }
        Some(tool.permission)
    }
}

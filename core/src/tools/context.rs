//! Invocation and output records shared by every tool handler.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Function,
}

/// How a command is (or is not) confined while it runs. The concrete
/// wrapper is supplied by the deployment; the default passes commands
/// through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SandboxMode {
    #[default]
    None,
    ReadOnly,
    WorkspaceWrite,
}

/// Wraps a command vector in the deployment's sandbox. Identity unless a
/// wrapper is installed.
pub trait SandboxWrapper: Send + Sync {
    fn wrap(&self, command: Vec<String>, mode: SandboxMode) -> Vec<String>;
}

/// The default wrapper: no confinement.
pub struct NoopSandbox;

impl SandboxWrapper for NoopSandbox {
    fn wrap(&self, command: Vec<String>, _mode: SandboxMode) -> Vec<String> {
        command
    }
}

pub type HeartbeatFn = Arc<dyn Fn() + Send + Sync>;

/// One tool call, fully resolved for execution.
#[derive(Clone)]
pub struct ToolInvocation {
    pub call_id: String,
    pub tool_name: String,
    /// Parsed argument object; handlers deserialize their own parameter
    /// structs from it.
    pub arguments: Value,
    pub cwd: PathBuf,
    /// Sandbox mode for this execution; `None` on escalated re-runs.
    pub sandbox: SandboxMode,
    /// Liveness callback for long-running work; called at least every
    /// five seconds.
    pub heartbeat: Option<HeartbeatFn>,
}

impl ToolInvocation {
    pub fn heartbeat_ref(&self) -> Option<&(dyn Fn() + Send + Sync)> {
        self.heartbeat.as_deref()
    }
}

impl std::fmt::Debug for ToolInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolInvocation")
            .field("call_id", &self.call_id)
            .field("tool_name", &self.tool_name)
            .field("cwd", &self.cwd)
            .field("sandbox", &self.sandbox)
            .finish()
    }
}

/// What a handler hands back; the orchestrator turns it into a
/// `function_call_output` item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub content: String,
    pub success: bool,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            success: true,
        }
    }

    pub fn failed(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            success: false,
        }
    }
}

//! Approval classification for tool calls.
//!
//! Each function call the model emits is bucketed before dispatch: `Skip`
//! executes immediately, `Needed` waits for the user, `Forbidden` is
//! answered with a synthetic failure and never executed.

use std::collections::HashSet;

use serde_json::Value;
use tracing::warn;

use crate::exec_policy::ExecPolicy;
use crate::exec_policy::PolicyDecision;
use crate::shell;
use tether_protocol::ApprovalMode;
use tether_protocol::FunctionCallOutputPayload;
use tether_protocol::ItemPayload;
use tether_protocol::PendingApproval;

/// Tools the orchestrator intercepts itself; they never reach the
/// dispatcher and never need approval.
pub const INTERCEPTED_TOOLS: &[&str] = &["update_plan", "request_user_input"];

/// Read-only tools that are always safe to run.
pub const READ_ONLY_TOOLS: &[&str] = &["read_file", "list_dir", "grep_files"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalRequirement {
    Skip,
    Needed { reason: String },
    Forbidden { reason: String },
}

/// User decision over a batch of pending approvals. Call ids in
/// `approved_for_session` additionally mark their tool as trusted for the
/// rest of this session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApprovalDecision {
    pub approved: Vec<String>,
    pub denied: Vec<String>,
    pub approved_for_session: Vec<String>,
}

/// User decision over pending escalations: which failed calls to re-run
/// without the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EscalationDecision {
    pub approved: Vec<String>,
    pub denied: Vec<String>,
}

pub struct ApprovalGate {
    mode: ApprovalMode,
    policy: ExecPolicy,
    trusted_tools: HashSet<String>,
}

/// Result of classifying one batch of function calls.
#[derive(Debug, Default)]
pub struct Classification {
    /// Calls that may execute without asking.
    pub auto_approved: Vec<String>,
    /// Calls waiting on the user.
    pub pending: Vec<PendingApproval>,
    /// Synthetic outputs for forbidden calls, in call order.
    pub forbidden: Vec<ItemPayload>,
}

impl ApprovalGate {
    pub fn new(mode: ApprovalMode, policy: ExecPolicy) -> Self {
        Self {
            mode,
            policy,
            trusted_tools: HashSet::new(),
        }
    }

    pub fn trust_tool(&mut self, tool_name: &str) {
        self.trusted_tools.insert(tool_name.to_string());
    }

    pub fn is_trusted(&self, tool_name: &str) -> bool {
        self.trusted_tools.contains(tool_name)
    }

    pub fn trusted_tool_names(&self) -> HashSet<String> {
        self.trusted_tools.clone()
    }

    /// Bucket every call in the batch.
    pub fn classify(&self, calls: &[(String, String, String)]) -> Classification {
        let mut result = Classification::default();
        for (call_id, name, arguments) in calls {
            match self.evaluate(name, arguments) {
                ApprovalRequirement::Skip => result.auto_approved.push(call_id.clone()),
                ApprovalRequirement::Needed { reason } => result.pending.push(PendingApproval {
                    call_id: call_id.clone(),
                    tool_name: name.clone(),
                    arguments: arguments.clone(),
                    reason,
                }),
                ApprovalRequirement::Forbidden { reason } => {
                    let message = if reason.is_empty() {
                        "Forbidden: this command is blocked by exec policy.".to_string()
                    } else {
                        format!("Forbidden: {reason}")
                    };
                    result.forbidden.push(ItemPayload::FunctionCallOutput {
                        call_id: call_id.clone(),
                        output: FunctionCallOutputPayload::failed(message),
                    });
                }
            }
        }
        result
    }

    /// The approval requirement for a single call.
    pub fn evaluate(&self, tool_name: &str, arguments: &str) -> ApprovalRequirement {
        if INTERCEPTED_TOOLS.contains(&tool_name) || READ_ONLY_TOOLS.contains(&tool_name) {
            return ApprovalRequirement::Skip;
        }

        if self.mode == ApprovalMode::Never {
            return ApprovalRequirement::Skip;
        }

        if self.trusted_tools.contains(tool_name) {
            return ApprovalRequirement::Skip;
        }

        match tool_name {
            "shell" => match parse_command_array(arguments) {
                Ok(command) => self.evaluate_command(&command),
                Err(reason) => ApprovalRequirement::Needed { reason },
            },
            "shell_command" | "exec_command" => match parse_command_string(arguments, tool_name) {
                Ok(command) => self.evaluate_command(&command),
                Err(reason) => ApprovalRequirement::Needed { reason },
            },
            "write_stdin" => ApprovalRequirement::Skip,
            "write_file" | "apply_patch" => ApprovalRequirement::Needed {
                reason: "mutating file operation".into(),
            },
            _ => ApprovalRequirement::Needed {
                reason: "unknown tool".into(),
            },
        }
    }

    fn evaluate_command(&self, command: &[String]) -> ApprovalRequirement {
        let eval = self.policy.evaluate_with_mode(command, self.mode);
        match eval.decision {
            PolicyDecision::Allow => ApprovalRequirement::Skip,
            PolicyDecision::Prompt => ApprovalRequirement::Needed {
                reason: eval.justification,
            },
            PolicyDecision::Forbid => ApprovalRequirement::Forbidden {
                reason: eval.justification,
            },
        }
    }
}

/// The array-form `shell` tool: `{"command": ["git", "status"]}`.
fn parse_command_array(arguments: &str) -> Result<Vec<String>, String> {
    let value: Value = match serde_json::from_str(arguments) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "cannot parse shell arguments for approval");
            return Err("cannot parse arguments".into());
        }
    };
    let Some(array) = value.get("command").and_then(Value::as_array) else {
        return Err("missing command".into());
    };
    if array.is_empty() {
        return Err("missing command".into());
    }
    array
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| "command array contains non-string element".to_string())
        })
        .collect()
}

/// The string-form tools (`shell_command`, `exec_command`): the command is
/// wrapped through the user's detected shell before evaluation.
fn parse_command_string(arguments: &str, tool_name: &str) -> Result<Vec<String>, String> {
    let value: Value = match serde_json::from_str(arguments) {
        Ok(value) => value,
        Err(err) => {
            warn!(tool = tool_name, error = %err, "cannot parse arguments for approval");
            return Err("cannot parse arguments".into());
        }
    };
    let key = if tool_name == "exec_command" {
        "cmd"
    } else {
        "command"
    };
    let Some(command) = value.get(key).and_then(Value::as_str).filter(|s| !s.is_empty()) else {
        return Err("missing command".into());
    };
    let login = value.get("login").and_then(Value::as_bool).unwrap_or(true);
    Ok(shell::detect_user_shell().derive_exec_args(command, login))
}

/// Split a batch of calls into approved calls and synthetic denied
/// outputs. Independent of the order ids appear in the decision.
pub fn apply_decision(
    calls: &[(String, String, String)],
    decision: &ApprovalDecision,
) -> (Vec<String>, Vec<ItemPayload>) {
    let denied_set: HashSet<&str> = decision.denied.iter().map(String::as_str).collect();

    let mut approved = Vec::new();
    let mut denied = Vec::new();
    for (call_id, _, _) in calls {
        if denied_set.contains(call_id.as_str()) {
            denied.push(ItemPayload::FunctionCallOutput {
                call_id: call_id.clone(),
                output: FunctionCallOutputPayload::failed(
                    "User denied execution of this tool call.",
                ),
            });
        } else {
            approved.push(call_id.clone());
        }
    }
    (approved, denied)
}

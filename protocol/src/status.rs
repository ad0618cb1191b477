use serde::Deserialize;
use serde::Serialize;

use crate::plan::PlanState;
use crate::user_input::UserInputQuestion;

/// The orchestrator's current substate inside (or between) turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Idle,
    WaitingForInput,
    LlmCalling,
    ToolExecuting,
    ApprovalPending,
    EscalationPending,
    UserInputPending,
}

/// Cumulative token accounting across the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
    pub cached: u64,
    pub total: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt += other.prompt;
        self.completion += other.completion;
        self.cached += other.cached;
        self.total += other.total;
    }
}

/// A tool call waiting on the user's go-ahead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: String,
    pub reason: String,
}

/// A failed tool call that looks sandbox-denied, offered for an
/// unsandboxed retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEscalation {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: String,
    pub output: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUserInput {
    pub call_id: String,
    pub questions: Vec<UserInputQuestion>,
}

/// Snapshot returned by the status query. Consistent with some prefix of
/// the conversation log: the phase reflects a point at or after the last
/// item the caller has seen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnStatus {
    pub phase: SessionPhase,
    pub total_tokens: TokenUsage,
    pub turn_count: u64,
    #[serde(default)]
    pub tools_in_flight: Vec<String>,
    #[serde(default)]
    pub pending_approvals: Vec<PendingApproval>,
    #[serde(default)]
    pub pending_escalations: Vec<PendingEscalation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_user_input: Option<PendingUserInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanState>,
}

/// Delivered once, after `shutdown` settles the final turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResult {
    pub total_tokens: TokenUsage,
    pub tool_calls_executed: u64,
    pub interrupted: bool,
}

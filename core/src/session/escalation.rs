//! On-failure escalation: failed tool outputs that look like a sandbox
//! said no are offered to the user for one unsandboxed retry.
//!
//! The substring heuristic overlaps with ordinary failures on some
//! platforms, so escalation is always user-visible and declinable; a
//! declined (or interrupted) escalation keeps the original output.

use std::collections::HashSet;

use tracing::info;

use crate::error::Result;
use crate::session::turn::CallRecord;
use crate::session::SessionCore;
use crate::tools::context::SandboxMode;
use tether_protocol::FunctionCallOutputPayload;
use tether_protocol::PendingEscalation;
use tether_protocol::SessionPhase;

/// Output substrings that indicate a sandbox or permission denial rather
/// than a normal command failure.
const SANDBOX_DENIAL_KEYWORDS: &[&str] = &[
    "operation not permitted",
    "permission denied",
    "read-only file system",
    "seccomp",
    "sandbox",
    "landlock",
    "failed to write file",
];

/// Whether a failed tool result looks like the sandbox blocked it.
pub(crate) fn is_likely_sandbox_denial(output: &str) -> bool {
    let lower = output.to_lowercase();
    SANDBOX_DENIAL_KEYWORDS
        .iter()
        .any(|keyword| lower.contains(keyword))
}

impl SessionCore {
    /// Scan executed outputs for sandbox denials, wait for the user's
    /// verdict, and re-run approved calls without the sandbox, replacing
    /// their outputs in place.
    pub(crate) async fn escalate_sandbox_denials(
        &mut self,
        calls: &[CallRecord],
        outputs: &mut [Option<FunctionCallOutputPayload>],
    ) -> Result<()> {
        let mut escalations = Vec::new();
        for (index, record) in calls.iter().enumerate() {
            let Some(output) = &outputs[index] else {
                continue;
            };
            if output.is_failure() && is_likely_sandbox_denial(&output.content) {
                escalations.push(PendingEscalation {
                    call_id: record.call_id.clone(),
                    tool_name: record.name.clone(),
                    arguments: record.arguments.clone(),
                    output: output.content.clone(),
                    reason: "command failed in sandbox".into(),
                });
            }
        }

        if escalations.is_empty() {
            return Ok(());
        }

        info!(count = escalations.len(), "waiting for escalation decision");
        self.with_shared(|shared| {
            shared.status.pending_escalations = escalations;
            shared.status.phase = SessionPhase::EscalationPending;
        });

        let decision = self.wait_for_escalation_decision().await;
        self.with_shared(|shared| shared.status.pending_escalations.clear());
        let decision = decision?;

        let approved: HashSet<&str> = decision.approved.iter().map(String::as_str).collect();
        for (index, record) in calls.iter().enumerate() {
            let denied_here = match &outputs[index] {
                Some(output) => output.is_failure() && is_likely_sandbox_denial(&output.content),
                None => false,
            };
            if !denied_here || !approved.contains(record.call_id.as_str()) {
                continue;
            }

            info!(tool = %record.name, "re-executing without sandbox");
            let inv = self.build_invocation(record, SandboxMode::None);
            let payload = self.registry.dispatch(inv).await;
            self.tool_calls_executed += 1;
            outputs[index] = Some(payload);
        }

        Ok(())
    }
}

//! Interception of the `update_plan` tool. Unlike `request_user_input`
//! this never blocks: the plan is validated, stored, and surfaced through
//! the status query.

use tracing::warn;

use crate::session::SessionCore;
use tether_protocol::FunctionCallOutputPayload;
use tether_protocol::PlanState;
use tether_protocol::PlanStep;
use tether_protocol::StepStatus;

impl SessionCore {
    pub(crate) fn handle_update_plan(&mut self, arguments: &str) -> FunctionCallOutputPayload {
        match parse_plan(arguments) {
            Ok(plan) => {
                self.with_shared(|shared| shared.status.plan = Some(plan));
                FunctionCallOutputPayload::ok("Plan updated.")
            }
            Err(reason) => {
                warn!(reason = %reason, "invalid update_plan arguments");
                FunctionCallOutputPayload::failed(format!(
                    "Invalid update_plan arguments: {reason}"
                ))
            }
        }
    }
}

fn parse_plan(arguments: &str) -> Result<PlanState, String> {
    #[derive(serde::Deserialize)]
    struct RawStep {
        step: String,
        status: String,
    }

    #[derive(serde::Deserialize)]
    struct Args {
        #[serde(default)]
        explanation: Option<String>,
        plan: Vec<RawStep>,
    }

    let args: Args =
        serde_json::from_str(arguments).map_err(|err| format!("invalid JSON: {err}"))?;

    if args.plan.is_empty() {
        return Err("plan array must not be empty".into());
    }

    let mut in_progress = 0usize;
    let mut steps = Vec::with_capacity(args.plan.len());
    for (index, raw) in args.plan.into_iter().enumerate() {
        if raw.step.is_empty() {
            return Err(format!("step {}: step description must not be empty", index + 1));
        }
        let status = match raw.status.as_str() {
            "pending" => StepStatus::Pending,
            "in_progress" => StepStatus::InProgress,
            "completed" => StepStatus::Completed,
            other => {
                return Err(format!(
                    "step {}: invalid status `{other}` (must be pending, in_progress, or completed)",
                    index + 1
                ));
            }
        };
        if status == StepStatus::InProgress {
            in_progress += 1;
        }
        steps.push(PlanStep {
            step: raw.step,
            status,
        });
    }

    if in_progress > 1 {
        return Err(format!(
            "at most one step can be in_progress, got {in_progress}"
        ));
    }

    Ok(PlanState {
        explanation: args.explanation,
        steps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn parses_a_valid_plan() {
        let args = json!({
            "explanation": "three phases",
            "plan": [
                {"step": "read the code", "status": "completed"},
                {"step": "make the change", "status": "in_progress"},
                {"step": "run the tests", "status": "pending"},
            ],
        });
        let plan = parse_plan(&args.to_string()).expect("parse");
        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.steps[1].status, StepStatus::InProgress);
        assert_eq!(plan.explanation.as_deref(), Some("three phases"));
    }

    #[test]
    fn rejects_two_in_progress_steps() {
        let args = json!({
            "plan": [
                {"step": "a", "status": "in_progress"},
                {"step": "b", "status": "in_progress"},
            ],
        });
        let err = parse_plan(&args.to_string()).expect_err("reject");
        assert!(err.contains("at most one"));
    }

    #[test]
    fn rejects_bad_status_and_empty_plan() {
        let bad_status = json!({"plan": [{"step": "a", "status": "done"}]});
        assert!(parse_plan(&bad_status.to_string()).is_err());

        assert!(parse_plan("{\"plan\":[]}").is_err());
        assert!(parse_plan("junk").is_err());
    }
}

//! The inner turn loop: model call, approval gating, parallel tool
//! dispatch, escalation, repeat detection, and context compaction, until
//! the model answers without function calls.

use std::collections::HashSet;
use std::sync::Arc;

use sha2::Digest;
use sha2::Sha256;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::client::complete_with_retries;
use crate::client::ModelRequest;
use crate::compaction;
use crate::error::Result;
use crate::error::TetherErr;
use crate::instructions;
use crate::safety;
use crate::session::SessionCore;
use crate::tools::context::SandboxMode;
use crate::tools::context::ToolInvocation;
use crate::tools::spec::tool_specs;
use tether_protocol::ApprovalMode;
use tether_protocol::FunctionCallOutputPayload;
use tether_protocol::ItemPayload;
use tether_protocol::SessionPhase;

pub(crate) const USER_DENIED_MESSAGE: &str = "User denied execution of this tool call.";

/// One function call from the current batch, in emission order.
#[derive(Debug, Clone)]
pub(crate) struct CallRecord {
    pub(crate) call_id: String,
    pub(crate) name: String,
    pub(crate) arguments: String,
}

impl SessionCore {
    pub(crate) async fn run_turn(&mut self, content: String) {
        self.interrupted = false;
        self.compacted_this_turn = false;
        self.repeat_key = None;
        self.repeat_count = 0;

        self.append_item(ItemPayload::UserMessage { content }).await;

        self.turn_counter += 1;
        let turn_id = format!("turn-{}", self.turn_counter);
        self.with_shared(|shared| shared.status.turn_count = self.turn_counter);
        self.append_item(ItemPayload::TurnStarted {
            turn_id: turn_id.clone(),
        })
        .await;

        loop {
            // Context pressure is checked before every model call; a
            // failed proactive compaction is survivable (the call itself
            // may still fit).
            if compaction::should_compact(
                &self.transcript,
                self.config.auto_compact_token_limit,
                self.config.model.context_window,
            ) && !self.compacted_this_turn
            {
                if let Err(err) = self.run_compaction().await {
                    if matches!(err, TetherErr::Interrupted) {
                        self.finish_interrupted(&turn_id, &[], &mut Vec::new()).await;
                        return;
                    }
                    warn!(error = %err, "auto-compaction failed; continuing uncompacted");
                }
            }

            self.set_phase(SessionPhase::LlmCalling);
            let request = self.build_request();
            let client = Arc::clone(&self.client);
            let response = match self
                .await_with_ops(async move { complete_with_retries(client.as_ref(), &request).await })
                .await
            {
                Ok(response) => response,
                Err(TetherErr::Interrupted) => {
                    self.finish_interrupted(&turn_id, &[], &mut Vec::new()).await;
                    return;
                }
                Err(TetherErr::ContextOverflow(detail)) if !self.compacted_this_turn => {
                    info!("model reported context overflow; compacting and retrying");
                    match self.run_compaction().await {
                        Ok(()) => continue,
                        Err(TetherErr::Interrupted) => {
                            self.finish_interrupted(&turn_id, &[], &mut Vec::new()).await;
                            return;
                        }
                        Err(err) => {
                            self.fail_turn(
                                &turn_id,
                                format!(
                                    "The conversation no longer fits the model's context \
                                     window and compaction failed ({err}); original error: \
                                     {detail}"
                                ),
                            )
                            .await;
                            return;
                        }
                    }
                }
                Err(err) => {
                    self.fail_turn(&turn_id, format!("The model request failed: {err}"))
                        .await;
                    return;
                }
            };

            self.with_shared(|shared| shared.status.total_tokens.add(response.usage));
            if self.client.supports_server_state(&self.config.model) {
                self.last_response_id = response.response_id.clone();
            }

            for item in &response.items {
                self.append_item(item.clone()).await;
            }
            // Anything appended from here on is the unsent suffix for
            // providers holding server-side state.
            self.transcript_sent = self.transcript.len();

            let calls: Vec<CallRecord> = response
                .items
                .iter()
                .filter_map(|item| match item {
                    ItemPayload::FunctionCall {
                        call_id,
                        name,
                        arguments,
                    } => Some(CallRecord {
                        call_id: call_id.clone(),
                        name: name.clone(),
                        arguments: arguments.clone(),
                    }),
                    _ => None,
                })
                .collect();

            if calls.is_empty() {
                self.append_item(ItemPayload::TurnComplete {
                    turn_id,
                    interrupted: false,
                })
                .await;
                return;
            }

            let outputs = match self.run_tool_batch(&turn_id, &calls).await {
                Some(outputs) => outputs,
                None => return, // turn already finished (interrupt)
            };

            for (record, output) in calls.iter().zip(outputs.iter()) {
                self.append_item(ItemPayload::FunctionCallOutput {
                    call_id: record.call_id.clone(),
                    output: output.clone(),
                })
                .await;
            }

            if self.detect_repeat_loop(&calls, &outputs) {
                self.append_item(ItemPayload::AssistantMessage {
                    content: format!(
                        "Stopping: the last {} tool batches were identical and produced \
                         identical results, so continuing would loop without progress. \
                         Tell me how you would like to proceed.",
                        self.repeat_count
                    ),
                })
                .await;
                self.append_item(ItemPayload::TurnComplete {
                    turn_id,
                    interrupted: false,
                })
                .await;
                return;
            }
        }
    }

    /// Classify, gate, execute, and (when warranted) escalate one batch.
    /// Returns outputs aligned with `calls`, or `None` when the turn was
    /// finished early by an interrupt.
    async fn run_tool_batch(
        &mut self,
        turn_id: &str,
        calls: &[CallRecord],
    ) -> Option<Vec<FunctionCallOutputPayload>> {
        let mut outputs: Vec<Option<FunctionCallOutputPayload>> = vec![None; calls.len()];

        // Intercepted tools run inline in emission order; request_user_input
        // blocks on the user.
        for (index, record) in calls.iter().enumerate() {
            match record.name.as_str() {
                "update_plan" => {
                    outputs[index] = Some(self.handle_update_plan(&record.arguments));
                }
                "request_user_input" => {
                    match self
                        .handle_request_user_input(&record.call_id, &record.arguments)
                        .await
                    {
                        Ok(output) => outputs[index] = Some(output),
                        Err(TetherErr::Interrupted) => {
                            outputs[index] = Some(FunctionCallOutputPayload::failed(
                                "User input request was interrupted.",
                            ));
                            self.finish_interrupted(turn_id, calls, &mut outputs).await;
                            return None;
                        }
                        Err(err) => {
                            outputs[index] =
                                Some(FunctionCallOutputPayload::failed(err.to_string()));
                        }
                    }
                }
                _ => {}
            }
        }

        // Approval classification for everything not yet answered.
        let gated: Vec<(String, String, String)> = calls
            .iter()
            .enumerate()
            .filter(|(index, _)| outputs[*index].is_none())
            .map(|(_, record)| {
                (
                    record.call_id.clone(),
                    record.name.clone(),
                    record.arguments.clone(),
                )
            })
            .collect();
        let classification = self.gate.classify(&gated);

        for forbidden in classification.forbidden {
            if let ItemPayload::FunctionCallOutput { call_id, output } = forbidden {
                if let Some(index) = index_of(calls, &call_id) {
                    outputs[index] = Some(output);
                }
            }
        }

        let mut approved_ids: HashSet<String> =
            classification.auto_approved.into_iter().collect();

        if !classification.pending.is_empty() {
            self.with_shared(|shared| {
                shared.status.pending_approvals = classification.pending.clone();
                shared.status.phase = SessionPhase::ApprovalPending;
            });

            let decision = self.wait_for_approval_decision().await;
            self.with_shared(|shared| shared.status.pending_approvals.clear());

            match decision {
                Ok(decision) => {
                    for call_id in &decision.approved_for_session {
                        if let Some(index) = index_of(calls, call_id) {
                            let tool_name = calls[index].name.clone();
                            self.gate.trust_tool(&tool_name);
                        }
                    }
                    let pending_calls: Vec<(String, String, String)> = classification
                        .pending
                        .iter()
                        .map(|p| (p.call_id.clone(), p.tool_name.clone(), p.arguments.clone()))
                        .collect();
                    let (approved, denied) = safety::apply_decision(&pending_calls, &decision);
                    approved_ids.extend(approved);
                    approved_ids.extend(decision.approved_for_session.iter().cloned());
                    for item in denied {
                        if let ItemPayload::FunctionCallOutput { call_id, output } = item {
                            if let Some(index) = index_of(calls, &call_id) {
                                outputs[index] = Some(output);
                            }
                        }
                    }
                }
                Err(_) => {
                    self.finish_interrupted(turn_id, calls, &mut outputs).await;
                    return None;
                }
            }
        }

        // Execute approved calls in parallel; results come back in
        // whatever order they finish and are re-slotted by index.
        let sandbox = self.batch_sandbox_mode();
        let to_execute: Vec<(usize, ToolInvocation)> = calls
            .iter()
            .enumerate()
            .filter(|(index, record)| {
                outputs[*index].is_none() && approved_ids.contains(&record.call_id)
            })
            .map(|(index, record)| (index, self.build_invocation(record, sandbox)))
            .collect();

        if !to_execute.is_empty() {
            self.with_shared(|shared| {
                shared.status.tools_in_flight = to_execute
                    .iter()
                    .map(|(index, _)| calls[*index].name.clone())
                    .collect();
                shared.status.phase = SessionPhase::ToolExecuting;
            });

            let registry = Arc::clone(&self.registry);
            let futures: Vec<_> = to_execute
                .into_iter()
                .map(|(index, inv)| {
                    let registry = Arc::clone(&registry);
                    async move { (index, registry.dispatch(inv).await) }
                })
                .collect();

            let batch = self
                .await_with_ops(async move {
                    Ok::<_, TetherErr>(futures::future::join_all(futures).await)
                })
                .await;
            self.with_shared(|shared| shared.status.tools_in_flight.clear());

            match batch {
                Ok(results) => {
                    self.tool_calls_executed += results.len() as u64;
                    for (index, payload) in results {
                        outputs[index] = Some(payload);
                    }
                }
                Err(_) => {
                    self.finish_interrupted(turn_id, calls, &mut outputs).await;
                    return None;
                }
            }

            // Failures that look like the sandbox said no are offered to
            // the user for an unsandboxed retry.
            if self.config.approval_mode != ApprovalMode::Never {
                match self.escalate_sandbox_denials(calls, &mut outputs).await {
                    Ok(()) => {}
                    Err(TetherErr::Interrupted) => {
                        self.finish_interrupted(turn_id, calls, &mut outputs).await;
                        return None;
                    }
                    Err(err) => {
                        warn!(error = %err, "escalation pass failed; keeping original outputs");
                    }
                }
            }
        }

        // Anything still unanswered was neither approved nor executed.
        Some(
            outputs
                .into_iter()
                .map(|output| {
                    output.unwrap_or_else(|| FunctionCallOutputPayload::failed(USER_DENIED_MESSAGE))
                })
                .collect(),
        )
    }

    fn build_request(&self) -> ModelRequest {
        let server_state = self.client.supports_server_state(&self.config.model)
            && self.last_response_id.is_some();
        let history = if server_state {
            self.transcript[self.transcript_sent.min(self.transcript.len())..].to_vec()
        } else {
            self.transcript.clone()
        };
        ModelRequest {
            model: self.config.model.clone(),
            base_instructions: self.config.base_instructions.clone().unwrap_or_default(),
            developer_instructions: self.config.developer_instructions.clone(),
            user_instructions: instructions::user_instruction_block(&self.config),
            history,
            tools: tool_specs(&self.config.tools),
            previous_response_id: if server_state {
                self.last_response_id.clone()
            } else {
                None
            },
            web_search_mode: self.config.web_search_mode,
        }
    }

    pub(crate) fn build_invocation(
        &self,
        record: &CallRecord,
        sandbox: SandboxMode,
    ) -> ToolInvocation {
        let arguments = serde_json::from_str(&record.arguments)
            .unwrap_or(serde_json::Value::Null);
        ToolInvocation {
            call_id: record.call_id.clone(),
            tool_name: record.name.clone(),
            arguments,
            cwd: self.config.cwd.clone(),
            sandbox,
            heartbeat: None,
        }
    }

    pub(crate) fn batch_sandbox_mode(&self) -> SandboxMode {
        match self.config.approval_mode {
            ApprovalMode::OnFailure => SandboxMode::WorkspaceWrite,
            ApprovalMode::Never | ApprovalMode::UnlessTrusted => SandboxMode::None,
        }
    }

    /// Track consecutive identical (batch key, outputs) pairs; true once
    /// the configured threshold is reached.
    fn detect_repeat_loop(
        &mut self,
        calls: &[CallRecord],
        outputs: &[FunctionCallOutputPayload],
    ) -> bool {
        let threshold = self.config.repeat_detection_threshold;
        if threshold == 0 {
            return false;
        }

        let key = batch_key(calls, outputs);
        if self.repeat_key.as_deref() == Some(key.as_str()) {
            self.repeat_count += 1;
        } else {
            self.repeat_key = Some(key);
            self.repeat_count = 1;
        }
        self.repeat_count >= threshold
    }

    async fn fail_turn(&mut self, turn_id: &str, message: String) {
        self.append_item(ItemPayload::AssistantMessage { content: message })
            .await;
        self.append_item(ItemPayload::TurnComplete {
            turn_id: turn_id.to_string(),
            interrupted: false,
        })
        .await;
    }

    /// Close out an interrupted turn: every unanswered call gets a denied
    /// output, then exactly one interrupted turn-complete marker.
    pub(crate) async fn finish_interrupted(
        &mut self,
        turn_id: &str,
        calls: &[CallRecord],
        outputs: &mut Vec<Option<FunctionCallOutputPayload>>,
    ) {
        outputs.resize(calls.len(), None);
        for (record, slot) in calls.iter().zip(outputs.iter_mut()) {
            let output = slot
                .take()
                .unwrap_or_else(|| FunctionCallOutputPayload::failed(USER_DENIED_MESSAGE));
            self.append_item(ItemPayload::FunctionCallOutput {
                call_id: record.call_id.clone(),
                output,
            })
            .await;
        }
        self.with_shared(|shared| {
            shared.status.pending_approvals.clear();
            shared.status.pending_escalations.clear();
            shared.status.pending_user_input = None;
            shared.status.tools_in_flight.clear();
        });
        self.append_item(ItemPayload::TurnComplete {
            turn_id: turn_id.to_string(),
            interrupted: true,
        })
        .await;
        info!("turn interrupted");
    }

    /// Summarize the transcript prefix and rebuild it behind a compaction
    /// marker. The rebuilt transcript must be strictly smaller.
    pub(crate) async fn run_compaction(&mut self) -> Result<()> {
        let before = compaction::estimated_tokens(&self.transcript);
        let budget = compaction::retained_budget(self.config.model.context_window);
        let recent = compaction::collect_recent_items(&self.transcript, budget);
        let prefix = compaction::compaction_prefix(&self.transcript, &recent);
        if prefix.is_empty() {
            return Err(TetherErr::Fatal(
                "nothing left to compact: the retained tail already fills the budget".into(),
            ));
        }

        let transcript_text = compaction::render_transcript(&prefix);
        let client = Arc::clone(&self.client);
        let model = self.config.model.clone();
        let summary = self
            .await_with_ops(async move {
                client
                    .summarize(
                        &model,
                        &transcript_text,
                        compaction::SUMMARIZATION_INSTRUCTIONS,
                    )
                    .await
            })
            .await?;

        let rebuilt = compaction::build_compacted_history(&summary, &recent);
        let after = compaction::estimated_tokens(&rebuilt);
        if after >= before {
            return Err(TetherErr::Fatal(format!(
                "compaction did not shrink the transcript ({before} -> {after} tokens)"
            )));
        }

        debug!(before, after, "transcript compacted");
        self.transcript = rebuilt;
        self.compacted_this_turn = true;
        // Server-side conversation state is invalidated; resend everything.
        self.last_response_id = None;
        self.transcript_sent = 0;

        self.append_log_only(ItemPayload::Compaction { summary }).await;
        Ok(())
    }
}

fn index_of(calls: &[CallRecord], call_id: &str) -> Option<usize> {
    calls.iter().position(|record| record.call_id == call_id)
}

/// Deterministic digest of a batch and its outputs: the sorted
/// `name:arguments` pairs hashed together with the output contents.
fn batch_key(calls: &[CallRecord], outputs: &[FunctionCallOutputPayload]) -> String {
    let mut parts: Vec<String> = calls
        .iter()
        .map(|record| format!("{}:{}", record.name, record.arguments))
        .collect();
    parts.sort();

    let mut hasher = Sha256::new();
    for part in &parts {
        hasher.update(part.as_bytes());
        hasher.update([0]);
    }
    for output in outputs {
        hasher.update(output.content.as_bytes());
        hasher.update([output.success.map(u8::from).unwrap_or(2)]);
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(name: &str, arguments: &str) -> CallRecord {
        CallRecord {
            call_id: format!("{name}-id"),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }
    }

    #[test]
    fn batch_key_ignores_call_order() {
        let a = vec![record("shell", "{\"command\":[\"ls\"]}"), record("read_file", "{}")];
        let b = vec![record("read_file", "{}"), record("shell", "{\"command\":[\"ls\"]}")];
        let outputs = vec![
            FunctionCallOutputPayload::ok("one"),
            FunctionCallOutputPayload::ok("two"),
        ];
        assert_eq!(batch_key(&a, &outputs), batch_key(&b, &outputs));
    }

    #[test]
    fn batch_key_changes_with_outputs() {
        let calls = vec![record("shell", "{}")];
        let first = batch_key(&calls, &[FunctionCallOutputPayload::ok("same")]);
        let second = batch_key(&calls, &[FunctionCallOutputPayload::ok("different")]);
        assert_ne!(first, second);
    }

    #[test]
    fn batch_key_changes_with_arguments() {
        let outputs = vec![FunctionCallOutputPayload::ok("same")];
        let first = batch_key(&[record("shell", "{\"command\":[\"ls\"]}")], &outputs);
        let second = batch_key(&[record("shell", "{\"command\":[\"pwd\"]}")], &outputs);
        assert_ne!(first, second);
    }
}

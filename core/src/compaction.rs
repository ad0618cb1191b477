//! Context-pressure detection and transcript rebuilding.
//!
//! When the estimated prompt size for the next model call crosses the
//! effective limit, an early prefix of the transcript is summarized and
//! replaced by a compaction marker plus a summary message. The rebuilt
//! transcript must estimate strictly smaller than what it replaced.

use tether_protocol::ItemPayload;

/// Estimated bytes per token.
const BYTES_PER_TOKEN: u64 = 4;

/// Fraction of the context window the retained tail may occupy.
const RETAINED_WINDOW_FRACTION: f64 = 0.2;

pub const SUMMARY_PREFIX: &str =
    "Another language model started this conversation with the user. \
     Here is a summary of what has happened so far:\n\n";

pub const SUMMARIZATION_INSTRUCTIONS: &str = "\
You are summarizing an agentic coding conversation so another model can \
continue it. Produce a compact narrative covering: the user's goals, what \
has been tried, commands that were run and their important results, files \
that were read or modified, decisions made, and any unresolved problems. \
Keep exact file paths, command names, and error messages. Do not invent \
details. Respond with the summary only.";

/// Rough token estimate for a set of items; markers carry no content.
pub fn estimated_tokens(items: &[ItemPayload]) -> u64 {
    let bytes: usize = items.iter().map(ItemPayload::content_len).sum();
    bytes as u64 / BYTES_PER_TOKEN
}

/// The trigger threshold: the configured limit clamped to 90% of the
/// context window. Zero disables auto-compaction entirely.
pub fn effective_auto_compact_limit(configured: u64, context_window: u64) -> u64 {
    if configured == 0 {
        return 0;
    }
    if context_window == 0 {
        return configured;
    }
    configured.min(context_window * 9 / 10)
}

/// Whether the next model call would exceed the effective limit.
pub fn should_compact(items: &[ItemPayload], configured: u64, context_window: u64) -> bool {
    let limit = effective_auto_compact_limit(configured, context_window);
    limit > 0 && estimated_tokens(items) > limit
}

/// Token budget for the retained tail.
pub fn retained_budget(context_window: u64) -> u64 {
    if context_window == 0 {
        // No window information: keep a fixed tail.
        return 8_192;
    }
    (context_window as f64 * RETAINED_WINDOW_FRACTION) as u64
}

/// Walk backwards from the end collecting the most recent content items
/// that fit in the budget. Markers are dropped; at least the final item is
/// always retained.
pub fn collect_recent_items(items: &[ItemPayload], token_budget: u64) -> Vec<ItemPayload> {
    let byte_budget = token_budget.saturating_mul(BYTES_PER_TOKEN) as usize;
    let mut used = 0usize;
    let mut recent = Vec::new();

    for item in items.iter().rev() {
        if item.is_marker() {
            continue;
        }
        let cost = item.content_len();
        if used + cost > byte_budget && !recent.is_empty() {
            break;
        }
        used += cost;
        recent.push(item.clone());
        if used > byte_budget {
            break;
        }
    }

    recent.reverse();
    recent
}

/// The transcript prefix to summarize: every content item that did not
/// make it into the retained tail.
pub fn compaction_prefix(items: &[ItemPayload], retained: &[ItemPayload]) -> Vec<ItemPayload> {
    let keep = retained.len();
    let mut content: Vec<ItemPayload> = items
        .iter()
        .filter(|item| !item.is_marker())
        .cloned()
        .collect();
    let split = content.len().saturating_sub(keep);
    content.truncate(split);
    content
}

/// Rebuild the transcript: compaction marker, summary message, retained
/// tail.
pub fn build_compacted_history(summary: &str, recent: &[ItemPayload]) -> Vec<ItemPayload> {
    let mut history = Vec::with_capacity(recent.len() + 2);
    history.push(ItemPayload::Compaction {
        summary: summary.to_string(),
    });
    history.push(ItemPayload::AssistantMessage {
        content: format!("{SUMMARY_PREFIX}{summary}"),
    });
    history.extend(recent.iter().cloned());
    history
}

/// Render items into a plain-text transcript for the summarizer.
pub fn render_transcript(items: &[ItemPayload]) -> String {
    let mut out = String::new();
    for item in items {
        match item {
            ItemPayload::UserMessage { content } => {
                out.push_str("User: ");
                out.push_str(content);
                out.push('\n');
            }
            ItemPayload::AssistantMessage { content } => {
                out.push_str("Assistant: ");
                out.push_str(content);
                out.push('\n');
            }
            ItemPayload::FunctionCall {
                name, arguments, ..
            } => {
                out.push_str(&format!("Tool call {name}: {arguments}\n"));
            }
            ItemPayload::FunctionCallOutput { output, .. } => {
                out.push_str("Tool output: ");
                out.push_str(&output.content);
                out.push('\n');
            }
            ItemPayload::WebSearchCall { action, .. } => {
                out.push_str(&format!("Web search: {action}\n"));
            }
            ItemPayload::TurnStarted { .. }
            | ItemPayload::TurnComplete { .. }
            | ItemPayload::Compaction { .. } => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn user(content: &str) -> ItemPayload {
        ItemPayload::UserMessage {
            content: content.into(),
        }
    }

    fn assistant(content: &str) -> ItemPayload {
        ItemPayload::AssistantMessage {
            content: content.into(),
        }
    }

    #[test]
    fn limit_is_clamped_to_ninety_percent_of_window() {
        assert_eq!(effective_auto_compact_limit(200_000, 128_000), 115_200);
        assert_eq!(effective_auto_compact_limit(80_000, 128_000), 80_000);
        assert_eq!(effective_auto_compact_limit(0, 128_000), 0);
        assert_eq!(effective_auto_compact_limit(100_000, 0), 100_000);
    }

    #[test]
    fn collects_everything_within_budget() {
        let items = vec![
            user("msg1"),
            assistant("reply1"),
            user("msg2"),
            assistant("reply2"),
        ];
        let recent = collect_recent_items(&items, 100_000);
        assert_eq!(recent.len(), 4);
        assert_eq!(recent[0], user("msg1"));
        assert_eq!(recent[3], assistant("reply2"));
    }

    #[test]
    fn tiny_budget_keeps_only_the_most_recent_items() {
        let items = vec![
            user("old message that is quite long"),
            assistant("old reply that is also quite long"),
            user("new"),
            assistant("new reply"),
        ];
        let recent = collect_recent_items(&items, 5);
        assert!(recent.len() < 4);
        assert!(!recent.is_empty());
        assert_eq!(recent.last(), Some(&assistant("new reply")));
    }

    #[test]
    fn markers_are_dropped_from_the_retained_tail() {
        let items = vec![
            ItemPayload::TurnStarted {
                turn_id: "turn-1".into(),
            },
            user("msg1"),
            ItemPayload::Compaction {
                summary: "earlier".into(),
            },
            assistant("reply1"),
            ItemPayload::TurnComplete {
                turn_id: "turn-1".into(),
                interrupted: false,
            },
        ];
        let recent = collect_recent_items(&items, 100_000);
        assert_eq!(recent, vec![user("msg1"), assistant("reply1")]);
    }

    #[test]
    fn compacted_history_has_marker_then_summary_then_tail() {
        let recent = vec![user("recent msg"), assistant("recent reply")];
        let rebuilt = build_compacted_history("This is the summary", &recent);

        assert_eq!(rebuilt.len(), 4);
        match &rebuilt[0] {
            ItemPayload::Compaction { summary } => assert_eq!(summary, "This is the summary"),
            other => panic!("expected compaction marker, got {other:?}"),
        }
        match &rebuilt[1] {
            ItemPayload::AssistantMessage { content } => {
                assert!(content.contains("Another language model started"));
                assert!(content.contains("This is the summary"));
            }
            other => panic!("expected summary message, got {other:?}"),
        }
        assert_eq!(rebuilt[2], user("recent msg"));
        assert_eq!(rebuilt[3], assistant("recent reply"));
    }

    #[test]
    fn empty_tail_still_produces_marker_and_summary() {
        let rebuilt = build_compacted_history("Summary text", &[]);
        assert_eq!(rebuilt.len(), 2);
        assert!(matches!(rebuilt[0], ItemPayload::Compaction { .. }));
        assert!(matches!(rebuilt[1], ItemPayload::AssistantMessage { .. }));
    }

    #[test]
    fn prefix_is_everything_not_retained() {
        let items = vec![
            user("aaaaaa"),
            assistant("bbbbbb"),
            user("cccccc"),
            assistant("dddddd"),
        ];
        // Two-token budget (~8 bytes) keeps only the final item.
        let recent = collect_recent_items(&items, 2);
        assert_eq!(recent, vec![assistant("dddddd")]);

        let prefix = compaction_prefix(&items, &recent);
        assert_eq!(
            prefix,
            vec![user("aaaaaa"), assistant("bbbbbb"), user("cccccc")]
        );
    }

    #[test]
    fn summary_shrinks_the_estimate() {
        let prefix: Vec<ItemPayload> = (0..50)
            .map(|i| assistant(&format!("a fairly long reply number {i} with plenty of text")))
            .collect();
        let summary_items = vec![ItemPayload::AssistantMessage {
            content: format!("{SUMMARY_PREFIX}short summary"),
        }];
        assert!(estimated_tokens(&summary_items) < estimated_tokens(&prefix));
    }

    #[test]
    fn transcript_rendering_skips_markers() {
        let items = vec![
            ItemPayload::TurnStarted {
                turn_id: "turn-1".into(),
            },
            user("hello"),
            assistant("hi"),
        ];
        let transcript = render_transcript(&items);
        assert!(transcript.contains("User: hello"));
        assert!(transcript.contains("Assistant: hi"));
        assert!(!transcript.contains("turn-1"));
    }
}

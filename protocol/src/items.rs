use serde::Deserialize;
use serde::Serialize;

/// Result of a tool invocation as recorded in the conversation.
///
/// `success` is `None` when the tool did not report an explicit outcome
/// (some providers omit it for their own built-in calls).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCallOutputPayload {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

impl FunctionCallOutputPayload {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            success: Some(true),
        }
    }

    pub fn failed(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            success: Some(false),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.success == Some(false)
    }
}

/// One entry in the conversation, discriminated by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemPayload {
    UserMessage {
        content: String,
    },
    AssistantMessage {
        content: String,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: FunctionCallOutputPayload,
    },
    TurnStarted {
        turn_id: String,
    },
    TurnComplete {
        turn_id: String,
        #[serde(default)]
        interrupted: bool,
    },
    Compaction {
        summary: String,
    },
    /// Provider-side web activity, fed back verbatim on later requests.
    WebSearchCall {
        call_id: String,
        action: String,
        detail: String,
    },
}

impl ItemPayload {
    /// Markers carry no conversational content and are skipped when
    /// estimating transcript size.
    pub fn is_marker(&self) -> bool {
        matches!(
            self,
            ItemPayload::TurnStarted { .. }
                | ItemPayload::TurnComplete { .. }
                | ItemPayload::Compaction { .. }
        )
    }

    /// Bytes of model-visible content in this item.
    pub fn content_len(&self) -> usize {
        match self {
            ItemPayload::UserMessage { content } | ItemPayload::AssistantMessage { content } => {
                content.len()
            }
            ItemPayload::FunctionCall {
                name, arguments, ..
            } => name.len() + arguments.len(),
            ItemPayload::FunctionCallOutput { output, .. } => output.content.len(),
            ItemPayload::WebSearchCall { action, detail, .. } => action.len() + detail.len(),
            ItemPayload::TurnStarted { .. }
            | ItemPayload::TurnComplete { .. }
            | ItemPayload::Compaction { .. } => 0,
        }
    }
}

/// An appended conversation entry with its monotonically increasing
/// sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationItem {
    pub seq: u64,
    #[serde(flatten)]
    pub payload: ItemPayload,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn markers_have_no_content() {
        assert!(ItemPayload::TurnStarted {
            turn_id: "turn-1".into()
        }
        .is_marker());
        assert!(ItemPayload::Compaction {
            summary: "s".into()
        }
        .is_marker());
        assert_eq!(
            ItemPayload::Compaction {
                summary: "long summary text".into()
            }
            .content_len(),
            0
        );
    }

    #[test]
    fn item_round_trips_through_json() {
        let item = ConversationItem {
            seq: 7,
            payload: ItemPayload::FunctionCall {
                call_id: "call-1".into(),
                name: "shell".into(),
                arguments: "{\"command\":[\"ls\"]}".into(),
            },
        };
        let encoded = serde_json::to_string(&item).expect("serialize");
        let decoded: ConversationItem = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(item, decoded);
    }

    #[test]
    fn output_success_defaults_to_none() {
        let decoded: FunctionCallOutputPayload =
            serde_json::from_str("{\"content\":\"ok\"}").expect("deserialize");
        assert_eq!(decoded.success, None);
        assert!(!decoded.is_failure());
    }
}

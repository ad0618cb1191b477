//! Interception of the `request_user_input` tool: validate the questions,
//! park the turn until the user answers, echo the answers back as the
//! tool output.

use tracing::info;
use tracing::warn;

use crate::error::Result;
use crate::session::SessionCore;
use tether_protocol::FunctionCallOutputPayload;
use tether_protocol::PendingUserInput;
use tether_protocol::SessionPhase;
use tether_protocol::UserInputQuestion;

const MAX_QUESTIONS: usize = 4;

impl SessionCore {
    pub(crate) async fn handle_request_user_input(
        &mut self,
        call_id: &str,
        arguments: &str,
    ) -> Result<FunctionCallOutputPayload> {
        let questions = match parse_questions(arguments) {
            Ok(questions) => questions,
            Err(reason) => {
                warn!(reason = %reason, "invalid request_user_input arguments");
                return Ok(FunctionCallOutputPayload::failed(format!(
                    "Invalid request_user_input arguments: {reason}"
                )));
            }
        };

        info!(count = questions.len(), "waiting for user input answers");
        self.with_shared(|shared| {
            shared.status.pending_user_input = Some(PendingUserInput {
                call_id: call_id.to_string(),
                questions: questions.clone(),
            });
            shared.status.phase = SessionPhase::UserInputPending;
        });

        let answers = self.wait_for_user_input_answers().await;
        self.with_shared(|shared| shared.status.pending_user_input = None);
        let answers = answers?;

        let content = serde_json::to_string(&answers)?;
        Ok(FunctionCallOutputPayload::ok(content))
    }
}

fn parse_questions(arguments: &str) -> std::result::Result<Vec<UserInputQuestion>, String> {
    #[derive(serde::Deserialize)]
    struct Args {
        questions: Vec<UserInputQuestion>,
    }

    let args: Args =
        serde_json::from_str(arguments).map_err(|err| format!("invalid JSON: {err}"))?;

    if args.questions.is_empty() {
        return Err("questions array must not be empty".into());
    }
    if args.questions.len() > MAX_QUESTIONS {
        return Err(format!(
            "at most {MAX_QUESTIONS} questions allowed, got {}",
            args.questions.len()
        ));
    }
    for (index, question) in args.questions.iter().enumerate() {
        if question.id.is_empty() {
            return Err(format!("question {}: id is required", index + 1));
        }
        if question.question.is_empty() {
            return Err(format!("question {}: question text is required", index + 1));
        }
        if question.options.is_empty() {
            return Err(format!("question {}: options must not be empty", index + 1));
        }
        for (opt_index, option) in question.options.iter().enumerate() {
            if option.label.is_empty() {
                return Err(format!(
                    "question {}, option {}: label is required",
                    index + 1,
                    opt_index + 1
                ));
            }
        }
    }

    Ok(args.questions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn valid_question(id: &str) -> serde_json::Value {
        json!({
            "id": id,
            "question": "Which one?",
            "options": [{"label": "A"}, {"label": "B", "description": "second"}],
        })
    }

    #[test]
    fn accepts_well_formed_questions() {
        let args = json!({"questions": [valid_question("q1"), valid_question("q2")]});
        let questions = parse_questions(&args.to_string()).expect("parse");
        assert_eq!(questions.len(), 2);
        assert_eq!(questions[0].id, "q1");
        assert_eq!(questions[1].options.len(), 2);
    }

    #[test]
    fn rejects_empty_and_oversized_batches() {
        assert!(parse_questions("{\"questions\":[]}").is_err());

        let too_many: Vec<_> = (0..5).map(|i| valid_question(&format!("q{i}"))).collect();
        let err = parse_questions(&json!({"questions": too_many}).to_string())
            .expect_err("too many");
        assert!(err.contains("at most 4"));
    }

    #[test]
    fn rejects_missing_fields() {
        let no_id = json!({"questions": [{"id": "", "question": "?", "options": [{"label": "A"}]}]});
        assert!(parse_questions(&no_id.to_string()).is_err());

        let no_options = json!({"questions": [{"id": "q", "question": "?", "options": []}]});
        assert!(parse_questions(&no_options.to_string()).is_err());

        let blank_label =
            json!({"questions": [{"id": "q", "question": "?", "options": [{"label": ""}]}]});
        assert!(parse_questions(&blank_label.to_string()).is_err());

        assert!(parse_questions("not json").is_err());
    }
}

//! Wire and data types shared between the session core and its front-ends.
//!
//! Everything here is plain data: conversation items, session configuration,
//! plan state, user-input questions, and the status snapshot returned to
//! observers. The core owns all behavior.

pub mod config;
pub mod items;
pub mod plan;
pub mod status;
pub mod user_input;

pub use config::ApprovalMode;
pub use config::ModelConfig;
pub use config::ModelProvider;
pub use config::SessionConfiguration;
pub use config::ToolsConfig;
pub use config::WebSearchMode;
pub use items::ConversationItem;
pub use items::FunctionCallOutputPayload;
pub use items::ItemPayload;
pub use plan::PlanState;
pub use plan::PlanStep;
pub use plan::StepStatus;
pub use status::PendingApproval;
pub use status::PendingEscalation;
pub use status::PendingUserInput;
pub use status::SessionPhase;
pub use status::SessionResult;
pub use status::TokenUsage;
pub use status::TurnStatus;
pub use user_input::UserInputAnswers;
pub use user_input::UserInputOption;
pub use user_input::UserInputQuestion;

//! Durable core of an agentic coding session.
//!
//! A long-lived, resumable conversation between a user, a model, and a
//! bounded set of side-effectful tools. The [`session::Session`] owns the
//! turn loop; tool execution, exec sessions, approval gating, and context
//! compaction hang off it.

pub mod client;
pub mod command_safety;
pub mod compaction;
pub mod conversation_log;
pub mod error;
pub mod exec_policy;
pub mod exec_sessions;
pub mod instructions;
pub mod rollout;
pub mod safety;
pub mod session;
pub mod shell;
pub mod tools;

pub use error::Result;
pub use error::TetherErr;
pub use session::Session;
pub use session::SessionHandle;

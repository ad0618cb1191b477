use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TetherErr>;

/// Every failure the core can surface, bucketed by disposition: validation
/// errors become failed tool outputs, transient/api-limit errors are
/// retried, context overflow triggers compaction, fatal errors end the
/// turn, and interruption propagates out of every await.
#[derive(Debug, Error)]
pub enum TetherErr {
    /// Malformed tool arguments or an impossible request. Never retried.
    #[error("{0}")]
    Validation(String),

    /// Network hiccups, 408/409/5xx, and other failures worth retrying
    /// with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// 429 from the provider. Retried honouring `Retry-After` when the
    /// provider sent one.
    #[error("rate limited: {message}")]
    ApiLimit {
        message: String,
        retry_after: Option<Duration>,
    },

    /// The provider reported the prompt no longer fits; the compactor runs
    /// before the request is retried.
    #[error("context window exceeded: {0}")]
    ContextOverflow(String),

    /// 400/401/403/404/422 and anything else that will not succeed on
    /// retry. Ends the turn with a synthetic assistant message.
    #[error("fatal provider error: {0}")]
    Fatal(String),

    /// The user interrupted or shut down the session mid-await.
    #[error("interrupted")]
    Interrupted,

    /// An exec-session id that is not (or no longer) in the store.
    #[error("Unknown session ID: {0}")]
    UnknownSessionId(String),

    /// `write_stdin` against a pipe-mode session, or a PTY whose writer
    /// has gone away.
    #[error("session stdin is closed")]
    StdinClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl TetherErr {
    /// Whether the retry loop should try again (possibly after a delay).
    pub fn is_retryable(&self) -> bool {
        matches!(self, TetherErr::Transient(_) | TetherErr::ApiLimit { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes() {
        assert!(TetherErr::Transient("boom".into()).is_retryable());
        assert!(TetherErr::ApiLimit {
            message: "slow down".into(),
            retry_after: None
        }
        .is_retryable());
        assert!(!TetherErr::Fatal("no".into()).is_retryable());
        assert!(!TetherErr::ContextOverflow("full".into()).is_retryable());
        assert!(!TetherErr::Interrupted.is_retryable());
    }
}

//! Error taxonomy shared by the core and the agent runtime.
//!
//! Every fallible operation classifies its failure into one of these kinds.
//! The scheduler and orchestrator rely on the classification to decide what
//! is retried, what is fed back to the model and what fails the task.

use thiserror::Error;

/// Closed set of error kinds for the runtime.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad input: empty instruction, malformed tool name, unknown chat id.
    /// Surfaced to the caller, never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Invariant violation: embedding dimension mismatch, illegal edge triple.
    #[error("schema error: {0}")]
    Schema(String),

    /// Entity not present.
    #[error("not found: {0}")]
    NotFound(String),

    /// Tool-server I/O failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Provider refused or produced unusable output.
    #[error("model error: {0}")]
    Model(String),

    /// Bounded operation exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A middleware guard blocked a tool call.
    #[error("blocked by middleware: {0}")]
    Veto(String),

    /// Unexpected bug; logged with full context, fails the current task only.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Whether a tool-call retry is allowed for this error.
    ///
    /// Only timeout-class transport failures are retried; everything else is
    /// reported back immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Timeout(_))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Validation(format!(
            "{} at line {} column {}",
            err,
            err.line(),
            err.column()
        ))
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Transport(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeouts_are_retryable() {
        assert!(CoreError::Timeout("slow".into()).is_retryable());
        assert!(!CoreError::Transport("refused".into()).is_retryable());
        assert!(!CoreError::Validation("empty".into()).is_retryable());
        assert!(!CoreError::Model("refused".into()).is_retryable());
    }

    #[test]
    fn json_errors_classify_as_validation() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let core: CoreError = err.into();
        assert!(matches!(core, CoreError::Validation(_)));
    }
}

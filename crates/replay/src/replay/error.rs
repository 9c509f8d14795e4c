//! Replay error types

use thiserror::Error;

/// Errors raised while applying a history window to a decider
#[derive(Debug, Clone, Error)]
pub enum ReplayError {
    /// The window does not continue where the decider left off
    #[error("history gap: expected event {expected}, got {actual}")]
    HistoryGap { expected: i64, actual: i64 },

    #[error("empty history window")]
    EmptyHistory,

    /// History and workflow code disagree
    #[error("non-deterministic workflow: {0}")]
    NonDeterministic(String),

    /// Workflow code panicked in a logical thread
    #[error("workflow thread '{thread}' panicked: {message}")]
    WorkflowPanicked { thread: String, message: String },

    /// No thread permit available and nothing could be evicted
    #[error("workflow thread budget of {capacity} exhausted")]
    ThreadBudgetExhausted { capacity: usize },

    /// Threads kept making progress without ever settling
    #[error("workflow did not settle after {passes} scheduler passes")]
    Livelock { passes: usize },

    #[error("decider is closed")]
    Closed,
}

impl ReplayError {
    /// History does not line up with the decider's state
    ///
    /// The decider must be discarded and rebuilt from full history.
    pub fn is_history_inconsistency(&self) -> bool {
        matches!(self, Self::HistoryGap { .. } | Self::EmptyHistory | Self::Closed)
    }

    pub fn is_non_deterministic(&self) -> bool {
        matches!(self, Self::NonDeterministic(_))
    }
}

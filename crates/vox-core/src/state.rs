//! Lifecycle states of a volume writer.

use serde::{Deserialize, Serialize};

/// Explicit state machine for the writer lifecycle.
///
/// ```text
/// IDLE --configure--> CONFIGURED --start--> RUNNING --(last frame)--> FINALIZING --> DONE
///   any state --(unrecoverable fault)--> ERROR
/// ```
///
/// `Error` is absorbing: nothing leaves it except constructing a new writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriterState {
    /// Freshly constructed, nothing allocated.
    #[default]
    Idle,
    /// Metadata validated and shared buffer allocated.
    Configured,
    /// Worker running, frames may be written.
    Running,
    /// Final batch dispatched, waiting for the backend to finalize.
    Finalizing,
    /// Output complete and resources released.
    Done,
    /// Terminal failure; the latched error is surfaced on every call.
    Error,
}

impl WriterState {
    /// Whether the state is terminal (`Done` or `Error`).
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, WriterState::Done | WriterState::Error)
    }

    /// Whether a worker is expected to be alive in this state.
    #[must_use]
    pub fn has_worker(self) -> bool {
        matches!(self, WriterState::Running | WriterState::Finalizing)
    }
}

impl std::fmt::Display for WriterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            WriterState::Idle => "IDLE",
            WriterState::Configured => "CONFIGURED",
            WriterState::Running => "RUNNING",
            WriterState::Finalizing => "FINALIZING",
            WriterState::Done => "DONE",
            WriterState::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

//! Error types for the runner layer.

/// Errors produced while supervising processes and running tests.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("empty command")]
    EmptyCommand,

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("interrupted by user")]
    Interrupted,

    #[error("no free port in [{low}, {high}) after {attempts} attempt(s)")]
    PortExhausted { low: u16, high: u16, attempts: u32 },

    #[error("server unavailable after {attempts} attempt(s): {reason}")]
    ServerUnavailable { attempts: u32, reason: String },

    #[error("server not ready: {0}")]
    ServerStart(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("domain error: {0}")]
    Core(#[from] mtest_core::MtestError),
}

impl RunnerError {
    /// Conditions that abort the whole run rather than a single test.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RunnerError::PortExhausted { .. } | RunnerError::ServerUnavailable { .. }
        )
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, RunnerError::Interrupted)
    }
}

impl From<mtest_core::Interrupted> for RunnerError {
    fn from(_: mtest_core::Interrupted) -> Self {
        RunnerError::Interrupted
    }
}

/// Result type for runner operations.
pub type RunnerResult<T> = std::result::Result<T, RunnerError>;

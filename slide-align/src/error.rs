use thiserror::Error;

/// Errors that end an alignment session without a transform
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlignmentError {
    /// Stage refused or failed a commanded move
    #[error("stage move failed at step {step}: {reason}")]
    MoveFailed { step: usize, reason: String },

    /// Stage position could not be read after confirmation
    #[error("stage position read failed at step {step}: {reason}")]
    PositionReadFailed { step: usize, reason: String },

    /// Configuration rejected before the session started
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Session reached a state the driver cannot continue from
    #[error("alignment session stalled in state {0}")]
    Stalled(String),
}

use std::fmt;

/// Error type returned when a block fails validation.
///
/// These are the recoverable failures: the offending block (and the
/// chain it belongs to) is rejected, partial mutations are reversed, and
/// the node continues.
#[derive(Debug)]
pub enum ValidationError {
    /// Block is invalid according to a validity predicate.
    Invalid(&'static str),
    /// Block is invalid with a dynamic error message.
    Custom(String),
}

/// High-level errors that can occur in the consensus engine, split into
/// the three bands the pipeline distinguishes.
#[derive(Debug)]
pub enum ChainError {
    /// Recoverable block-level failure.
    Validation(ValidationError),
    /// Soft transport failure: a missing ancestor or transaction could
    /// not be fetched from the network before the timeout.
    Transport(String),
    /// Invariant breakage implying local corruption. The engine refuses
    /// further work after surfacing one of these.
    Critical(String),
}

impl ChainError {
    pub fn is_critical(&self) -> bool {
        matches!(self, ChainError::Critical(_))
    }
}

impl From<ValidationError> for ChainError {
    fn from(e: ValidationError) -> Self {
        ChainError::Validation(e)
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::Invalid(msg) => write!(f, "invalid block: {msg}"),
            ValidationError::Custom(msg) => write!(f, "invalid block: {msg}"),
        }
    }
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::Validation(e) => write!(f, "{e}"),
            ChainError::Transport(msg) => write!(f, "transport error: {msg}"),
            ChainError::Critical(msg) => write!(f, "critical chain error: {msg}"),
        }
    }
}

impl std::error::Error for ValidationError {}
impl std::error::Error for ChainError {}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackerError {
    /// The signal source could not produce a roster or presence view.
    /// Aborts the current tick; the next scheduled tick retries.
    #[error("Signal source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Invalid entry: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

impl TrackerError {
    /// True for failures that abort a whole tick rather than one member.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SourceUnavailable(_))
    }

    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Self::ConstraintViolation(_))
    }
}

pub type Result<T> = std::result::Result<T, TrackerError>;

impl<T> From<std::sync::PoisonError<T>> for TrackerError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<std::io::Error> for TrackerError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

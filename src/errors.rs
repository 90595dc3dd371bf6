use core::fmt::Display;
use core::fmt::Result;

/// Result type used by transaction bodies and commit hooks.
pub type StmResult<T> = core::result::Result<T, StmError>;

#[derive(Debug)]
pub enum StmError {
    /// The transaction observed a conflicting commit or an invalid snapshot
    /// and must be re-executed from a fresh log.
    Rerun,
    /// The transaction body asked to block until one of its read variables
    /// changes. Handled by the driver, never by the commit engine.
    Retry,
    /// A generic error string (for user logic).
    User(String),
}

impl Display for StmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> Result {
        match self {
            StmError::Rerun => write!(f, "Transaction rerun required"),
            StmError::Retry => write!(f, "Transaction blocked on retry"),
            StmError::User(s) => write!(f, "Transaction error: {}", s),
        }
    }
}

impl std::error::Error for StmError {}

//! Error types for lrumemo

use std::fmt;

/// Result type alias for lrumemo operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for store construction and consistency checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Capacity must be at least 1
    InvalidCapacity(usize),

    /// Internal structure is inconsistent (a bug in the store, not caller misuse)
    InvariantViolation(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidCapacity(cap) => {
                write!(f, "Invalid capacity: {} (must be positive)", cap)
            }
            Error::InvariantViolation(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

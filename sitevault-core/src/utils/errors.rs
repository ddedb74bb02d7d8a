//! Error taxonomy shared by every pipeline stage.

use std::fmt;
use thiserror::Error;

/// Why a job stopped early on request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Paused,
    Cancelled,
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interrupt::Paused => f.write_str("job paused"),
            Interrupt::Cancelled => f.write_str("job cancelled"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Integrity error: expected sha256 {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Interrupted: {0}")]
    Interrupted(Interrupt),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Task error: {0}")]
    Task(String),
}

impl Error {
    /// Pause and cancel are deliberate early returns, not failures.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Error::Interrupted(_))
    }

    pub fn integrity(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Error::Integrity {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Short machine-friendly name, used as the failure stage label.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration",
            Error::Integrity { .. } => "integrity",
            Error::Extraction(_) => "extraction",
            Error::Transfer(_) => "transfer",
            Error::Interrupted(_) => "interrupted",
            Error::Database(_) => "database",
            Error::Archive(_) => "archive",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
            Error::Task(_) => "task",
        }
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(e: zip::result::ZipError) -> Self {
        Error::Archive(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Task(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_is_not_a_failure() {
        assert!(Error::Interrupted(Interrupt::Paused).is_interrupt());
        assert!(Error::Interrupted(Interrupt::Cancelled).is_interrupt());
        assert!(!Error::Transfer("reset".into()).is_interrupt());
    }

    #[test]
    fn test_integrity_message() {
        let err = Error::integrity("aa", "bb");
        assert_eq!(err.kind(), "integrity");
        assert!(err.to_string().contains("expected sha256 aa"));
    }
}

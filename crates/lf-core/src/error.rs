//! Unified error type for the load-flow workspace.
//!
//! Domain-specific error types in `lf-algo` convert into [`LfError`] at API
//! boundaries so callers can handle everything uniformly. Numerical
//! non-convergence is deliberately NOT an error: solvers report it through
//! their status enums and callers must branch on status.

use thiserror::Error;

/// Unified error type for load-flow operations.
#[derive(Error, Debug)]
pub enum LfError {
    /// I/O errors (file access, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Data validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Solver/algorithm errors (factorization failure, contract violation)
    #[error("Solver error: {0}")]
    Solver(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network structure errors
    #[error("Network error: {0}")]
    Network(String),

    /// Generic errors (for wrapping external errors)
    #[error("{0}")]
    Other(String),
}

/// Convenience type alias for Results using LfError.
pub type LfResult<T> = Result<T, LfError>;

impl From<anyhow::Error> for LfError {
    fn from(err: anyhow::Error) -> Self {
        LfError::Other(err.to_string())
    }
}

impl From<String> for LfError {
    fn from(s: String) -> Self {
        LfError::Other(s)
    }
}

impl From<&str> for LfError {
    fn from(s: &str) -> Self {
        LfError::Other(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LfError::Solver("jacobian is singular".into());
        assert!(err.to_string().contains("Solver error"));
        assert!(err.to_string().contains("jacobian is singular"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let lf_err: LfError = io_err.into();
        assert!(matches!(lf_err, LfError::Io(_)));
    }

    #[test]
    fn test_question_mark_operator() {
        fn inner() -> LfResult<()> {
            Err(LfError::Validation("test".into()))
        }
        fn outer() -> LfResult<()> {
            inner()?;
            Ok(())
        }
        assert!(outer().is_err());
    }
}

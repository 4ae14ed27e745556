//! Unified error types for the gridflow crates
//!
//! This module provides a common error type [`GridError`] that can represent
//! errors from any part of the system. Domain-specific error types defined
//! next to the algorithms convert into `GridError` for uniform handling at
//! API boundaries.
//!
//! # Example
//!
//! ```ignore
//! use gridflow_core::{GridError, GridResult};
//!
//! fn run_study(net: &Network) -> GridResult<()> {
//!     net.validate()?;
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Unified error type for all gridflow operations.
#[derive(Error, Debug)]
pub enum GridError {
    /// Data validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Solver/algorithm errors
    #[error("Solver error: {0}")]
    Solver(String),

    /// Network structure errors
    #[error("Network error: {0}")]
    Network(String),

    /// Generic errors (for wrapping external errors)
    #[error("{0}")]
    Other(String),
}

/// Convenience type alias for Results using GridError.
pub type GridResult<T> = Result<T, GridError>;

impl From<anyhow::Error> for GridError {
    fn from(err: anyhow::Error) -> Self {
        GridError::Other(err.to_string())
    }
}

impl From<String> for GridError {
    fn from(s: String) -> Self {
        GridError::Other(s)
    }
}

impl From<&str> for GridError {
    fn from(s: &str) -> Self {
        GridError::Other(s.to_string())
    }
}

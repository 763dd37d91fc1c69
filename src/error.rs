//! Crate-level error type spanning planning, binding, execution and
//! configuration failures.
use thiserror::Error;

use crate::config::ConfigError;
use crate::query::errors::{BindingError, ExecutionError, PlanningError};

/// Result alias used by the public planning and execution entry points.
pub type Result<T> = std::result::Result<T, QueryError>;

/// Any error surfaced by the query core.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The plan could not be built.
    #[error(transparent)]
    Planning(#[from] PlanningError),
    /// A late-bound value is missing.
    #[error(transparent)]
    Binding(#[from] BindingError),
    /// An operator failed while running.
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl QueryError {
    /// Returns a machine-readable code for the error.
    pub fn code(&self) -> &'static str {
        match self {
            QueryError::Planning(err) => err.code(),
            QueryError::Binding(err) => err.code(),
            QueryError::Execution(err) => err.code(),
            QueryError::Config(_) => "Config",
        }
    }
}

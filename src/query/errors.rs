#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::fmt;

use thiserror::Error;

use crate::query::context::GroupId;

/// Errors detected while turning a logical tree into a physical plan.
///
/// Planning errors are reported before any tuple is produced and are never
/// retried: the same input always fails the same way.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlanningError {
    /// A node requires a column none of its inputs produce.
    #[error("{node} requires column '{column}' which is not produced by its inputs")]
    MissingColumn {
        /// Operator name of the offending node.
        node: &'static str,
        /// Name of the missing column.
        column: String,
    },
    /// Column referenced by name does not exist on the entity or input.
    #[error("unknown column '{column}' on {context}")]
    UnknownColumn { column: String, context: String },
    /// No function matches the requested name and argument types.
    #[error("no function '{name}' accepts ({args})")]
    IncompatibleSignature { name: String, args: String },
    /// Weights or factors of a cost policy are out of range.
    #[error("invalid cost policy: {reason}")]
    InvalidCostPolicy { reason: String },
    /// Rewrite rules kept firing after the configured number of passes.
    #[error("rewrite did not reach a fixpoint within {passes} passes")]
    RewriteLimitExceeded { passes: usize },
    /// A node was constructed with the wrong number of inputs.
    #[error("{node} expects {expected} input(s), got {found}")]
    Arity {
        node: &'static str,
        expected: usize,
        found: usize,
    },
    /// Generic structural problem with the tree.
    #[error("invalid plan: {0}")]
    InvalidPlan(String),
}

impl PlanningError {
    /// Builds a [`PlanningError::MissingColumn`].
    pub fn missing_column(node: &'static str, column: impl Into<String>) -> Self {
        PlanningError::MissingColumn {
            node,
            column: column.into(),
        }
    }

    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            PlanningError::MissingColumn { .. } => "MissingColumn",
            PlanningError::UnknownColumn { .. } => "UnknownColumn",
            PlanningError::IncompatibleSignature { .. } => "IncompatibleSignature",
            PlanningError::InvalidCostPolicy { .. } => "InvalidCostPolicy",
            PlanningError::RewriteLimitExceeded { .. } => "RewriteLimitExceeded",
            PlanningError::Arity { .. } => "Arity",
            PlanningError::InvalidPlan(_) => "InvalidPlan",
        }
    }
}

/// Errors raised when late-bound values cannot be resolved.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BindingError {
    /// A literal binding points past the end of the context.
    #[error("literal binding {index} is not registered in the binding context")]
    UnknownLiteral { index: usize },
    /// A parameter placeholder was never given a value.
    #[error("parameter {index} has not been bound")]
    UnboundParameter { index: usize },
    /// The binding context has no values for a sub-query group.
    #[error("sub-query of group {group} has not been bound")]
    MissingSubquery { group: GroupId },
    /// A column binding was resolved without a tuple or the tuple lacks it.
    #[error("column '{column}' is not available for binding")]
    MissingColumn { column: String },
    /// A value of the wrong type was supplied for a binding.
    #[error("binding {index} expects {expected}, got {found}")]
    TypeMismatch {
        index: usize,
        expected: String,
        found: &'static str,
    },
}

impl BindingError {
    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            BindingError::UnknownLiteral { .. } => "UnknownLiteral",
            BindingError::UnboundParameter { .. } => "UnboundParameter",
            BindingError::MissingSubquery { .. } => "MissingSubquery",
            BindingError::MissingColumn { .. } => "MissingColumn",
            BindingError::TypeMismatch { .. } => "TypeMismatch",
        }
    }
}

/// Errors raised while operators run.
///
/// Tuples delivered before the error stay valid; the stream ends with the
/// error attached.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The storage collaborator failed.
    #[error("storage error: {0}")]
    Storage(String),
    /// A function invocation failed.
    #[error("function '{name}' failed: {message}")]
    Function { name: String, message: String },
    /// A value could not be resolved at runtime.
    #[error(transparent)]
    Binding(#[from] BindingError),
    /// The query was cancelled.
    #[error("query cancelled")]
    Cancelled,
    /// Spill file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Spilled tuples could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// A value had the wrong type for the operation.
    #[error("type mismatch in {context}: expected {expected}, got {found}")]
    TypeMismatch {
        context: &'static str,
        expected: &'static str,
        found: &'static str,
    },
    /// A worker thread panicked or disappeared.
    #[error("worker for group {group} terminated abnormally")]
    WorkerLost { group: GroupId },
}

impl ExecutionError {
    /// Builds an [`ExecutionError::Function`].
    pub fn function(name: impl Into<String>, message: impl Into<String>) -> Self {
        ExecutionError::Function {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            ExecutionError::Storage(_) => "Storage",
            ExecutionError::Function { .. } => "Function",
            ExecutionError::Binding(err) => err.code(),
            ExecutionError::Cancelled => "Cancelled",
            ExecutionError::Io(_) => "Io",
            ExecutionError::Serialization(_) => "Serialization",
            ExecutionError::TypeMismatch { .. } => "TypeMismatch",
            ExecutionError::WorkerLost { .. } => "WorkerLost",
        }
    }

    /// Returns `true` for cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecutionError::Cancelled)
    }
}

/// Convenience wrapper that formats planning errors with their codes.
pub struct PlanningErrorWithCode<'a>(pub &'a PlanningError);

impl fmt::Display for PlanningErrorWithCode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.0.code(), self.0)
    }
}

//! Tessera: cost-based query planning and parallel pull-based execution over
//! pluggable entity storage.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod query;

pub use error::{QueryError, Result};

#![forbid(unsafe_code)]

//! Query planning and execution core.
//!
//! Logical trees built with [`LogicalPlanBuilder`] are planned into physical
//! trees by the [`Planner`] and run by the [`Executor`] as lazy, cancellable
//! tuple streams.

/// Late-bound values: literals, parameters, columns and sub-query results.
pub mod binding;

/// Fluent construction of logical plans.
pub mod builder;

/// Entity and index contracts, with in-memory implementations.
pub mod catalog;

/// Per-query state: hints, policy, bindings, group ids, cancellation.
pub mod context;

/// Cost vectors and the policy that scores them.
pub mod cost;

/// Planning, binding and execution error taxonomy.
pub mod errors;

/// Group scheduler and result streams.
pub mod executor;

/// Function contract, registry and built-in distances.
pub mod function;

/// Logical plan representation.
pub mod logical;

/// Runtime operators lowered from physical nodes.
pub mod operators;

/// Physical plan representation.
pub mod physical;

/// Plan generation, caching and explain output.
pub mod planner;

/// Boolean predicates over bindings.
pub mod predicate;

/// Performance profiling for planning and execution.
///
/// Collects timing and count statistics to identify performance bottlenecks.
pub mod profile;

/// Rewrite rules and the fixpoint driver.
pub mod rules;

/// Selectivity estimation.
pub mod selectivity;

/// Column value statistics.
pub mod statistics;

/// Physical properties attached to nodes.
pub mod traits;

/// Values, columns and tuples.
pub mod value;

pub use builder::LogicalPlanBuilder;
pub use context::{QueryContext, QueryHint, QueryHints};
pub use executor::{Executor, ResultStream};
pub use planner::{PhysicalPlan, PlanExplain, Planner};

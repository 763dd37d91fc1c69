//! Per-query state: hints, effective cost policy, bindings, group ids and the
//! cancellation token.
use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::config::QueryConfig;
use crate::query::binding::{BindingContext, SharedBindings};
use crate::query::cost::CostPolicy;
use crate::query::errors::{ExecutionError, PlanningError};
use crate::query::function::FunctionRegistry;

/// Tag of the parallel partition an operator belongs to.
pub type GroupId = u32;

/// Planner hints attached to a query.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryHint {
    /// Never replace scans with index scans.
    NoIndex,
    /// Never partition the plan.
    NoParallel,
    /// Use this policy instead of the configured default.
    CostPolicy(CostPolicy),
}

/// Normalised set of [`QueryHint`]s.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryHints {
    /// See [`QueryHint::NoIndex`].
    pub no_index: bool,
    /// See [`QueryHint::NoParallel`].
    pub no_parallel: bool,
    /// See [`QueryHint::CostPolicy`].
    pub cost_policy: Option<CostPolicy>,
}

impl QueryHints {
    /// Adds a hint; a later policy hint replaces an earlier one.
    pub fn with(mut self, hint: QueryHint) -> Self {
        match hint {
            QueryHint::NoIndex => self.no_index = true,
            QueryHint::NoParallel => self.no_parallel = true,
            QueryHint::CostPolicy(policy) => self.cost_policy = Some(policy),
        }
        self
    }

    /// Feeds the hints into a digest so cached plans are keyed per hint set.
    pub fn hash_into<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.no_index as u8);
        state.write_u8(self.no_parallel as u8);
        match &self.cost_policy {
            Some(policy) => {
                state.write_u8(1);
                policy.hash_into(state);
            }
            None => state.write_u8(0),
        }
    }
}

impl FromIterator<QueryHint> for QueryHints {
    fn from_iter<T: IntoIterator<Item = QueryHint>>(iter: T) -> Self {
        iter.into_iter().fold(QueryHints::default(), QueryHints::with)
    }
}

/// Shared flag every operator checks; setting it stops all groups.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Fresh, not-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fails with [`ExecutionError::Cancelled`] once cancellation was requested.
    pub fn check(&self) -> Result<(), ExecutionError> {
        if self.is_cancelled() {
            Err(ExecutionError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// State shared by planning and execution of one query.
#[derive(Debug)]
pub struct QueryContext {
    query_id: String,
    hints: QueryHints,
    policy: CostPolicy,
    bindings: SharedBindings,
    config: Arc<QueryConfig>,
    functions: Arc<FunctionRegistry>,
    next_group: AtomicU32,
    cancel: CancelToken,
}

impl QueryContext {
    /// Context with default hints, built-in functions and an empty binding
    /// context.
    pub fn new(query_id: impl Into<String>, config: Arc<QueryConfig>) -> Self {
        Self {
            query_id: query_id.into(),
            hints: QueryHints::default(),
            policy: config.cost,
            bindings: BindingContext::new().shared(),
            config,
            functions: Arc::new(FunctionRegistry::with_builtins()),
            next_group: AtomicU32::new(0),
            cancel: CancelToken::new(),
        }
    }

    /// Applies hints; a policy hint must be valid.
    pub fn with_hints(mut self, hints: QueryHints) -> Result<Self, PlanningError> {
        if let Some(policy) = &hints.cost_policy {
            policy.validate()?;
            self.policy = *policy;
        } else {
            self.policy = self.config.cost;
        }
        self.hints = hints;
        Ok(self)
    }

    /// Replaces the function registry.
    pub fn with_functions(mut self, functions: Arc<FunctionRegistry>) -> Self {
        self.functions = functions;
        self
    }

    /// Replaces the binding context.
    pub fn with_bindings(mut self, bindings: BindingContext) -> Self {
        self.bindings = bindings.shared();
        self
    }

    /// Query identifier used in log events.
    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    /// Active hints.
    pub fn hints(&self) -> &QueryHints {
        &self.hints
    }

    /// Effective cost policy (hint or configured default).
    pub fn policy(&self) -> &CostPolicy {
        &self.policy
    }

    /// Shared binding context.
    pub fn bindings(&self) -> &SharedBindings {
        &self.bindings
    }

    /// Configuration.
    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Function registry.
    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    /// Cancellation token of this query.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Allocates a fresh group id.
    pub fn next_group_id(&self) -> GroupId {
        self.next_group.fetch_add(1, Ordering::Relaxed)
    }

    /// Independent context for another execution of the same plan: bindings
    /// are copied, the cancellation token is fresh and group ids continue.
    pub fn fork(&self, query_id: impl Into<String>) -> QueryContext {
        QueryContext {
            query_id: query_id.into(),
            hints: self.hints.clone(),
            policy: self.policy,
            bindings: self.bindings.read().copy().shared(),
            config: Arc::clone(&self.config),
            functions: Arc::clone(&self.functions),
            next_group: AtomicU32::new(self.next_group.load(Ordering::Relaxed)),
            cancel: CancelToken::new(),
        }
    }
}

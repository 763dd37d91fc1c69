//! Turns logical trees into physical plans.
//!
//! Planning validates the logical tree, checks bindings, implements every
//! node, rewrites the physical tree to a fixpoint, and finally partitions it
//! when the cost policy says parallelism pays off. Results are cached by the
//! logical digest combined with the query's hints.
use std::hash::Hasher;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};
use xxhash_rust::xxh64::Xxh64;

use crate::config::PlannerConfig;
use crate::error::Result;
use crate::query::binding::BindingContext;
use crate::query::context::{GroupId, QueryContext};
use crate::query::cost::Cost;
use crate::query::logical::LogicalNode;
use crate::query::physical::PhysicalNode;
use crate::query::profile::{
    profile_timer, record_plan_cache_hit, record_profile_timer, QueryProfileKind,
};
use crate::query::rules::{default_rules, rewrite, RewriteRule, RuleContext};
use crate::query::value::ColumnDef;

/// Physical plan ready for execution.
#[derive(Clone, Debug)]
pub struct PhysicalPlan {
    /// Root of the physical tree; private to this plan instance.
    pub root: Arc<PhysicalNode>,
    /// Structural digest of `root`.
    pub digest: u64,
    /// Explain tree.
    pub explain: PlanExplain,
}

impl PhysicalPlan {
    /// Output columns, known before execution starts.
    pub fn columns(&self) -> Vec<ColumnDef> {
        self.root.columns()
    }

    /// Independent copy of the tree for another concurrent execution.
    pub fn instantiate(&self) -> PhysicalNode {
        self.root.copy()
    }
}

/// Human-readable explain tree.
#[derive(Clone, Debug, Serialize)]
pub struct PlanExplain {
    /// Root node of the explain tree.
    pub root: ExplainNode,
    /// Deterministic digest of the plan.
    pub digest: u64,
    /// Number of partitions the plan was split into (1 when sequential).
    pub partitions: usize,
    /// Rewrite rules that fired, in order.
    pub rules: Vec<String>,
    /// Whether the plan came from the plan cache.
    pub cached: bool,
}

impl PlanExplain {
    /// Serializes the explain tree as pretty-printed JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Explain node representing an operator with its estimates.
#[derive(Clone, Debug, Serialize)]
pub struct ExplainNode {
    /// Operator name.
    pub op: String,
    /// Group the operator runs in.
    pub group: GroupId,
    /// Estimated output rows.
    pub rows: u64,
    /// Node-local cost estimate.
    pub cost: Cost,
    /// Additional properties describing the operator.
    pub props: Vec<ExplainProp>,
    /// Input operators.
    pub inputs: Vec<ExplainNode>,
}

impl ExplainNode {
    /// Creates a new explain node with the given operator name.
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            group: 0,
            rows: 0,
            cost: Cost::ZERO,
            props: Vec::new(),
            inputs: Vec::new(),
        }
    }

    /// Value of the property `key`, if present.
    pub fn prop(&self, key: &str) -> Option<&str> {
        self.props
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.value.as_str())
    }
}

/// Single property associated with an [`ExplainNode`].
#[derive(Clone, Debug, Serialize)]
pub struct ExplainProp {
    /// Property key.
    pub key: String,
    /// Property value serialized for display.
    pub value: String,
}

impl ExplainProp {
    pub(crate) fn plain(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

struct CachedPlan {
    root: Arc<PhysicalNode>,
    partitions: usize,
    rules: Vec<String>,
}

/// Query planner with a bounded plan cache.
pub struct Planner {
    config: PlannerConfig,
    rules: Vec<RewriteRule>,
    cache: Mutex<LruCache<u64, Arc<CachedPlan>>>,
}

impl std::fmt::Debug for Planner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Planner")
            .field("config", &self.config)
            .field("rules", &self.rules)
            .field("cached", &self.cache.lock().len())
            .finish()
    }
}

impl Planner {
    /// Creates a planner with the default rule set.
    pub fn new(config: PlannerConfig) -> Self {
        let capacity = NonZeroUsize::new(config.plan_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            rules: default_rules(),
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Replaces the rule set.
    pub fn with_rules(mut self, rules: Vec<RewriteRule>) -> Self {
        self.rules = rules;
        self.cache.lock().clear();
        self
    }

    /// Planner settings.
    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Number of plans in the cache.
    pub fn cached_plans(&self) -> usize {
        self.cache.lock().len()
    }

    /// Plans `logical` for execution under `ctx`.
    ///
    /// Fails with a planning error for malformed trees and with a binding
    /// error when a parameter has no value. A cache hit returns a fresh copy
    /// of the cached tree.
    pub fn plan(&self, logical: &LogicalNode, ctx: &QueryContext) -> Result<PhysicalPlan> {
        let timer = profile_timer();
        logical.validate()?;
        let bindings = ctx.bindings().read();
        logical.bind(&bindings)?;
        let key = self.cache_key(logical, ctx);

        let cached = self.cache.lock().get(&key).cloned();
        let (entry, hit) = match cached {
            Some(entry) => {
                record_plan_cache_hit();
                debug!(query = ctx.query_id(), key, "planner.cache.hit");
                (entry, true)
            }
            None => {
                let entry = Arc::new(self.optimise(logical, ctx, &bindings)?);
                self.cache.lock().put(key, Arc::clone(&entry));
                (entry, false)
            }
        };

        let root = Arc::new(entry.root.copy());
        let digest = root.digest();
        let explain = PlanExplain {
            root: root.explain(&bindings),
            digest,
            partitions: entry.partitions,
            rules: entry.rules.clone(),
            cached: hit,
        };
        info!(
            query = ctx.query_id(),
            digest,
            partitions = entry.partitions,
            cached = hit,
            "planner.plan.done"
        );
        record_profile_timer(QueryProfileKind::Plan, timer);
        Ok(PhysicalPlan {
            root,
            digest,
            explain,
        })
    }

    fn optimise(
        &self,
        logical: &LogicalNode,
        ctx: &QueryContext,
        bindings: &BindingContext,
    ) -> Result<CachedPlan> {
        let rule_ctx = RuleContext {
            bindings,
            policy: ctx.policy(),
            config: &self.config,
            hints: ctx.hints(),
        };
        let outcome = rewrite(
            Arc::new(logical.implement()),
            &self.rules,
            &rule_ctx,
            self.config.match_order,
            self.config.max_rewrite_passes,
        )?;
        outcome.root.validate()?;
        debug!(
            query = ctx.query_id(),
            passes = outcome.passes,
            fired = outcome.fired.len(),
            "planner.rewrite.done"
        );

        let mut root = outcome.root;
        let mut partitions = 1;
        if !ctx.hints().no_parallel {
            let workers = ctx.policy().parallelisation(
                root.parallelisable_cost(bindings),
                root.total_cost(bindings),
                ctx.config().execution.max_workers,
            );
            if workers > 1 {
                if let Some(partitioned) = root.try_partition(workers, &mut || ctx.next_group_id()) {
                    partitioned.validate()?;
                    debug!(query = ctx.query_id(), workers, "planner.partition.split");
                    root = Arc::new(partitioned);
                    partitions = workers;
                }
            }
        }
        Ok(CachedPlan {
            root,
            partitions,
            rules: outcome.fired.iter().map(|r| r.to_string()).collect(),
        })
    }

    fn cache_key(&self, logical: &LogicalNode, ctx: &QueryContext) -> u64 {
        let mut hasher = Xxh64::new(0);
        hasher.write_u64(logical.digest());
        ctx.hints().hash_into(&mut hasher);
        ctx.policy().hash_into(&mut hasher);
        hasher.write_usize(ctx.config().execution.max_workers);
        hasher.finish()
    }
}

//! Rewrite rules and the fixpoint driver that applies them.
//!
//! A rule is a plain function from a node to an optional replacement. Rules
//! only look at the node and its direct inputs, never at the rest of the tree,
//! and must not fire again on their own output.
use std::sync::Arc;

use tracing::{debug, trace};

use crate::config::{MatchOrder, PlannerConfig};
use crate::query::binding::BindingContext;
use crate::query::context::QueryHints;
use crate::query::cost::CostPolicy;
use crate::query::errors::PlanningError;
use crate::query::physical::PhysicalNode;
use crate::query::profile::{profile_timer, record_profile_timer, record_rules_fired, QueryProfileKind};

mod count_pushdown;
mod external_sort;
mod index_scan;
mod limiting_sort;
mod vectorisation;

pub use count_pushdown::COUNT_PUSHDOWN;
pub use external_sort::EXTERNAL_SORT;
pub use index_scan::BOOLEAN_INDEX_SCAN;
pub use limiting_sort::LIMITING_SORT_MERGE;
pub use vectorisation::FUNCTION_VECTORISATION;

/// Everything a rule may consult besides the node itself.
#[derive(Clone, Copy, Debug)]
pub struct RuleContext<'a> {
    /// Bindings used for estimates.
    pub bindings: &'a BindingContext,
    /// Policy arbitrating between alternatives.
    pub policy: &'a CostPolicy,
    /// Planner settings (memory budget, vectorisation threshold).
    pub config: &'a PlannerConfig,
    /// Query hints.
    pub hints: &'a QueryHints,
}

/// Signature of a rule body.
pub type RuleFn = fn(&PhysicalNode, &RuleContext<'_>) -> Option<PhysicalNode>;

/// Named, pure rewrite.
#[derive(Clone, Copy)]
pub struct RewriteRule {
    /// Name used in logs and explain output.
    pub name: &'static str,
    /// Rule body.
    pub apply: RuleFn,
}

impl RewriteRule {
    /// Returns the replacement for `node`, or `None` when the rule does not
    /// match.
    pub fn try_apply(&self, node: &PhysicalNode, ctx: &RuleContext<'_>) -> Option<PhysicalNode> {
        (self.apply)(node, ctx)
    }
}

impl std::fmt::Debug for RewriteRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RewriteRule").field(&self.name).finish()
    }
}

/// Rules applied by default, in priority order.
pub fn default_rules() -> Vec<RewriteRule> {
    vec![
        COUNT_PUSHDOWN,
        BOOLEAN_INDEX_SCAN,
        LIMITING_SORT_MERGE,
        EXTERNAL_SORT,
        FUNCTION_VECTORISATION,
    ]
}

/// Result of a rewrite.
#[derive(Clone, Debug)]
pub struct RewriteOutcome {
    /// Rewritten tree.
    pub root: Arc<PhysicalNode>,
    /// Number of passes run, including the final pass that changed nothing.
    pub passes: usize,
    /// Names of the rules that fired, in order.
    pub fired: Vec<&'static str>,
}

/// Applies `rules` until a full pass changes nothing.
///
/// Every pass visits each node once in `order`; at each node the first
/// matching rule wins. Fails with [`PlanningError::RewriteLimitExceeded`]
/// when `max_passes` passes all changed the tree.
pub fn rewrite(
    root: Arc<PhysicalNode>,
    rules: &[RewriteRule],
    ctx: &RuleContext<'_>,
    order: MatchOrder,
    max_passes: usize,
) -> Result<RewriteOutcome, PlanningError> {
    let timer = profile_timer();
    let mut root = root;
    let mut fired = Vec::new();
    for pass in 1..=max_passes {
        let before = fired.len();
        root = visit(&root, rules, ctx, order, &mut fired);
        trace!(pass, fired = fired.len() - before, "planner.rewrite.pass");
        if fired.len() == before {
            record_profile_timer(QueryProfileKind::Rewrite, timer);
            record_rules_fired(fired.len());
            return Ok(RewriteOutcome {
                root,
                passes: pass,
                fired,
            });
        }
    }
    record_profile_timer(QueryProfileKind::Rewrite, timer);
    Err(PlanningError::RewriteLimitExceeded { passes: max_passes })
}

fn visit(
    node: &Arc<PhysicalNode>,
    rules: &[RewriteRule],
    ctx: &RuleContext<'_>,
    order: MatchOrder,
    fired: &mut Vec<&'static str>,
) -> Arc<PhysicalNode> {
    match order {
        MatchOrder::TopDown => {
            let node = apply_first(node, rules, ctx, fired).unwrap_or_else(|| Arc::clone(node));
            visit_inputs(&node, rules, ctx, order, fired)
        }
        MatchOrder::BottomUp => {
            let node = visit_inputs(node, rules, ctx, order, fired);
            apply_first(&node, rules, ctx, fired).unwrap_or(node)
        }
    }
}

fn visit_inputs(
    node: &Arc<PhysicalNode>,
    rules: &[RewriteRule],
    ctx: &RuleContext<'_>,
    order: MatchOrder,
    fired: &mut Vec<&'static str>,
) -> Arc<PhysicalNode> {
    let inputs: Vec<Arc<PhysicalNode>> = node
        .inputs
        .iter()
        .map(|input| visit(input, rules, ctx, order, fired))
        .collect();
    let unchanged = inputs
        .iter()
        .zip(&node.inputs)
        .all(|(new, old)| Arc::ptr_eq(new, old));
    if unchanged {
        Arc::clone(node)
    } else {
        Arc::new(node.with_inputs(inputs))
    }
}

fn apply_first(
    node: &PhysicalNode,
    rules: &[RewriteRule],
    ctx: &RuleContext<'_>,
    fired: &mut Vec<&'static str>,
) -> Option<Arc<PhysicalNode>> {
    rules.iter().find_map(|rule| {
        let replacement = rule.try_apply(node, ctx)?;
        debug!(
            rule = rule.name,
            node = node.name(),
            replacement = replacement.name(),
            "planner.rule.fired"
        );
        fired.push(rule.name);
        Some(Arc::new(replacement))
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use crate::config::PlannerConfig;
    use crate::query::binding::BindingContext;
    use crate::query::catalog::{MemoryTable, TableHandle};
    use crate::query::context::QueryHints;
    use crate::query::cost::CostPolicy;
    use crate::query::physical::{PhysicalNode, PhysicalOp};
    use crate::query::value::{ColumnDef, ColumnType, Value};

    pub(crate) struct Fixture {
        pub bindings: BindingContext,
        pub policy: CostPolicy,
        pub config: PlannerConfig,
        pub hints: QueryHints,
    }

    impl Fixture {
        pub(crate) fn new() -> Self {
            Self {
                bindings: BindingContext::new(),
                policy: CostPolicy::default(),
                config: PlannerConfig::default(),
                hints: QueryHints::default(),
            }
        }

        pub(crate) fn ctx(&self) -> super::RuleContext<'_> {
            super::RuleContext {
                bindings: &self.bindings,
                policy: &self.policy,
                config: &self.config,
                hints: &self.hints,
            }
        }
    }

    pub(crate) fn entity(rows: i64) -> (Arc<MemoryTable>, ColumnDef) {
        let id = ColumnDef::new("t.id", ColumnType::Long);
        let table = Arc::new(MemoryTable::new("t", vec![id.clone()]));
        for i in 0..rows {
            table.push(vec![Value::Long(i)]).expect("insert");
        }
        (table, id)
    }

    pub(crate) fn scan(entity: Arc<dyn TableHandle>, fetch: Vec<ColumnDef>) -> Arc<PhysicalNode> {
        Arc::new(PhysicalNode::new(
            0,
            PhysicalOp::EntityScan {
                entity,
                fetch,
                partition: 0,
                partitions: 1,
            },
            vec![],
        ))
    }
}

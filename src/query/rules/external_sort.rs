//! Sorts that would not fit the memory budget spill to disk.
use super::{RewriteRule, RuleContext};
use crate::query::physical::{PhysicalNode, PhysicalOp};

/// Replaces an in-memory `Sort` whose estimated input exceeds
/// `memory_budget_bytes` with an `ExternalSort` of
/// `floor(budget / tuple_size)` tuples per chunk.
pub const EXTERNAL_SORT: RewriteRule = RewriteRule {
    name: "ExternalSort",
    apply: external_sort,
};

fn external_sort(node: &PhysicalNode, ctx: &RuleContext<'_>) -> Option<PhysicalNode> {
    let PhysicalOp::Sort { order } = &node.op else {
        return None;
    };
    let tuple_size = node.tuple_size() as u64;
    let rows = node.input()?.output_size(ctx.bindings);
    let budget = ctx.config.memory_budget_bytes;
    if rows.saturating_mul(tuple_size) <= budget {
        return None;
    }
    let chunk_size = usize::try_from(budget / tuple_size).unwrap_or(usize::MAX).max(1);
    Some(PhysicalNode::new(
        node.group_id,
        PhysicalOp::ExternalSort {
            order: order.clone(),
            chunk_size,
        },
        node.inputs.clone(),
    ))
}

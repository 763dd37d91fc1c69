//! `Limit` directly above a sort becomes a bounded heap sort.
use super::{RewriteRule, RuleContext};
use crate::query::physical::{PhysicalNode, PhysicalOp};

/// Fuses `Limit(skip, limit)` over `Sort` into `LimitingSort`, which retains
/// at most `skip + limit` tuples and drops the first `skip` on output.
pub const LIMITING_SORT_MERGE: RewriteRule = RewriteRule {
    name: "LimitingSortMerge",
    apply: limiting_sort_merge,
};

fn limiting_sort_merge(node: &PhysicalNode, _ctx: &RuleContext<'_>) -> Option<PhysicalNode> {
    let PhysicalOp::Limit { skip, limit } = node.op else {
        return None;
    };
    let [sort] = node.inputs.as_slice() else {
        return None;
    };
    let (PhysicalOp::Sort { order } | PhysicalOp::ExternalSort { order, .. }) = &sort.op else {
        return None;
    };
    Some(PhysicalNode::new(
        node.group_id,
        PhysicalOp::LimitingSort {
            order: order.clone(),
            skip,
            limit,
        },
        sort.inputs.clone(),
    ))
}

//! `COUNT(*)` over a full, unfiltered scan becomes a metadata lookup.
use std::sync::Arc;

use super::{RewriteRule, RuleContext};
use crate::query::logical::ProjectionKind;
use crate::query::physical::{PhysicalNode, PhysicalOp};

/// Replaces `Count(EntityScan)` with `EntityCount`.
pub const COUNT_PUSHDOWN: RewriteRule = RewriteRule {
    name: "CountPushdown",
    apply: count_pushdown,
};

fn count_pushdown(node: &PhysicalNode, _ctx: &RuleContext<'_>) -> Option<PhysicalNode> {
    let PhysicalOp::Projection {
        kind: kind @ ProjectionKind::Count,
    } = &node.op
    else {
        return None;
    };
    let [input] = node.inputs.as_slice() else {
        return None;
    };
    let PhysicalOp::EntityScan {
        entity,
        partitions: 1,
        ..
    } = &input.op
    else {
        return None;
    };
    let out = kind.columns().into_iter().next()?;
    Some(PhysicalNode::new(
        node.group_id,
        PhysicalOp::EntityCount {
            entity: Arc::clone(entity),
            out,
        },
        Vec::new(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::rules::test_support::{entity, scan, Fixture};

    #[test]
    fn fuses_count_over_scan() {
        let (table, id) = entity(4);
        let count = PhysicalNode::unary(
            PhysicalOp::Projection {
                kind: ProjectionKind::Count,
            },
            scan(table, vec![id]),
        );
        let fixture = Fixture::new();
        let fused = COUNT_PUSHDOWN.try_apply(&count, &fixture.ctx()).expect("fires");
        assert!(matches!(fused.op, PhysicalOp::EntityCount { .. }));
        assert_eq!(fused.columns(), count.columns());
        assert!(fused.cost(&fixture.bindings).io < count.total_cost(&fixture.bindings).io);
        assert!(COUNT_PUSHDOWN.try_apply(&fused, &fixture.ctx()).is_none());
    }

    #[test]
    fn ignores_filtered_and_partitioned_inputs() {
        let (table, id) = entity(4);
        let scan = scan(table, vec![id]);
        let limited = Arc::new(PhysicalNode::unary(PhysicalOp::Limit { skip: 0, limit: 1 }, scan));
        let count = PhysicalNode::unary(
            PhysicalOp::Projection {
                kind: ProjectionKind::Count,
            },
            limited,
        );
        let fixture = Fixture::new();
        assert!(COUNT_PUSHDOWN.try_apply(&count, &fixture.ctx()).is_none());
    }
}

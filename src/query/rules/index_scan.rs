//! Filters over a full scan that a secondary index can answer.
use std::sync::Arc;

use tracing::trace;

use super::{RewriteRule, RuleContext};
use crate::query::logical::ProjectionKind;
use crate::query::physical::{PhysicalNode, PhysicalOp};
use crate::query::value::ColumnDef;

/// Replaces `Filter(EntityScan)` with an `IndexScan` (plus a `Fetch` of the
/// columns the index does not carry) when an index can process the whole
/// predicate and the policy scores the alternative cheaper. Disabled by the
/// `NoIndex` hint.
pub const BOOLEAN_INDEX_SCAN: RewriteRule = RewriteRule {
    name: "BooleanIndexScan",
    apply: boolean_index_scan,
};

fn boolean_index_scan(node: &PhysicalNode, ctx: &RuleContext<'_>) -> Option<PhysicalNode> {
    if ctx.hints.no_index {
        return None;
    }
    let PhysicalOp::Filter { predicate } = &node.op else {
        return None;
    };
    let [input] = node.inputs.as_slice() else {
        return None;
    };
    let PhysicalOp::EntityScan {
        entity,
        fetch,
        partitions: 1,
        ..
    } = &input.op
    else {
        return None;
    };
    let current = node.total_cost(ctx.bindings);
    let mut best: Option<(f32, PhysicalNode)> = None;
    for index in entity.indexes() {
        if !index.can_process(predicate) {
            continue;
        }
        let scan = PhysicalNode::new(
            node.group_id,
            PhysicalOp::IndexScan {
                index: Arc::clone(&index),
                entity: Arc::clone(entity),
                predicate: predicate.clone(),
            },
            Vec::new(),
        );
        let carried = index.columns();
        let remaining: Vec<ColumnDef> = fetch.iter().filter(|c| !carried.contains(c)).cloned().collect();
        let mut candidate = if remaining.is_empty() {
            scan
        } else {
            PhysicalNode::unary(
                PhysicalOp::Fetch {
                    entity: Arc::clone(entity),
                    fetch: remaining,
                },
                Arc::new(scan),
            )
        };
        if candidate.columns() != *fetch {
            candidate = PhysicalNode::unary(
                PhysicalOp::Projection {
                    kind: ProjectionKind::Select(fetch.clone()),
                },
                Arc::new(candidate),
            );
        }
        let scores = ctx
            .policy
            .score_relative(&[current, candidate.total_cost(ctx.bindings)]);
        trace!(
            index = index.name(),
            scan_score = scores[0],
            index_score = scores[1],
            "planner.rule.index_candidate"
        );
        if scores[1] < scores[0] && best.as_ref().map_or(true, |(score, _)| scores[1] < *score) {
            best = Some((scores[1], candidate));
        }
    }
    best.map(|(_, node)| node)
}

//! Swaps scalar function kernels for their vectorised variants.
use super::{RewriteRule, RuleContext};
use crate::query::function::Function;
use crate::query::physical::{PhysicalNode, PhysicalOp};

/// Substitutes the vectorised variant of a function whose widest operand
/// has at least `vectorisation_threshold` components. The output column is
/// kept.
pub const FUNCTION_VECTORISATION: RewriteRule = RewriteRule {
    name: "FunctionVectorisation",
    apply: function_vectorisation,
};

fn function_vectorisation(node: &PhysicalNode, ctx: &RuleContext<'_>) -> Option<PhysicalNode> {
    let PhysicalOp::Function {
        function,
        arguments,
        out,
    } = &node.op
    else {
        return None;
    };
    if function.is_vectorised() {
        return None;
    }
    let width = arguments
        .iter()
        .filter_map(|a| a.ty())
        .map(|ty| ty.logical_size())
        .max()
        .unwrap_or(0);
    if width < ctx.config.vectorisation_threshold {
        return None;
    }
    let vectorised = function.vectorised()?;
    Some(PhysicalNode::new(
        node.group_id,
        PhysicalOp::Function {
            function: vectorised,
            arguments: arguments.clone(),
            out: out.clone(),
        },
        node.inputs.clone(),
    ))
}

//! Runtime operators.
//!
//! Every physical node lowers to exactly one [`Operator`]: a pull-based
//! [`TupleStream`] plus the columns it produces. Inputs are lowered first;
//! inputs living in another group are handed to the scheduler, which runs
//! them on a worker and connects them through a bounded channel.
use std::sync::Arc;

use crate::query::catalog::BoxCursor;
use crate::query::context::GroupId;
use crate::query::errors::ExecutionError;
use crate::query::executor::ExecutionEnv;
use crate::query::physical::{PhysicalNode, PhysicalOp};
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::query::value::{Columns, Tuple};

mod merging;
mod pipeline;
mod sink;
mod sort;
mod source;

/// Fallible pull iterator every operator implements.
pub trait TupleStream: Send {
    /// Next tuple, `None` once exhausted.
    fn try_next(&mut self) -> Result<Option<Tuple>, ExecutionError>;
}

/// Owned tuple stream.
pub type BoxTupleStream = Box<dyn TupleStream>;

impl TupleStream for BoxCursor {
    fn try_next(&mut self) -> Result<Option<Tuple>, ExecutionError> {
        (**self).try_next()
    }
}

/// How an operator consumes its inputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperatorShape {
    /// Produces tuples without inputs.
    Source,
    /// Consumes one input; a breaker must see all of it before emitting.
    Pipeline {
        /// Whether the operator materialises its input.
        breaker: bool,
    },
    /// Consumes two or more inputs, synchronising on them.
    Merging,
    /// Consumes its input for side effects and emits nothing.
    Sink,
}

/// A lowered physical node.
pub struct Operator {
    /// Operator name, same as the physical node's.
    pub name: &'static str,
    /// Shape of the operator.
    pub shape: OperatorShape,
    /// Group the operator runs in.
    pub group_id: GroupId,
    /// Columns produced, known before the first tuple.
    pub columns: Columns,
    stream: BoxTupleStream,
}

impl Operator {
    fn new(node: &PhysicalNode, shape: OperatorShape, columns: Columns, stream: BoxTupleStream) -> Self {
        Self {
            name: node.name(),
            shape,
            group_id: node.group_id,
            columns,
            stream,
        }
    }

    /// Consumes the operator, returning its stream.
    pub fn into_stream(self) -> BoxTupleStream {
        self.stream
    }
}

impl std::fmt::Debug for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operator")
            .field("name", &self.name)
            .field("shape", &self.shape)
            .field("group_id", &self.group_id)
            .field("columns", &self.columns.len())
            .finish()
    }
}

/// Shape of the operator a physical node lowers to.
pub fn shape_of(op: &PhysicalOp) -> OperatorShape {
    match op {
        PhysicalOp::EntityScan { .. }
        | PhysicalOp::EntitySample { .. }
        | PhysicalOp::EntityCount { .. }
        | PhysicalOp::IndexScan { .. } => OperatorShape::Source,
        PhysicalOp::Filter { .. }
        | PhysicalOp::Function { .. }
        | PhysicalOp::Fetch { .. }
        | PhysicalOp::Limit { .. } => OperatorShape::Pipeline { breaker: false },
        PhysicalOp::Projection { kind } => OperatorShape::Pipeline {
            breaker: kind.is_aggregate(),
        },
        PhysicalOp::Sort { .. } | PhysicalOp::ExternalSort { .. } | PhysicalOp::LimitingSort { .. } => {
            OperatorShape::Pipeline { breaker: true }
        }
        PhysicalOp::FilterOnSubSelect { .. }
        | PhysicalOp::Merge
        | PhysicalOp::MergeLimitingSort { .. }
        | PhysicalOp::Union { .. }
        | PhysicalOp::Intersect => OperatorShape::Merging,
        PhysicalOp::Insert { .. } | PhysicalOp::Update { .. } | PhysicalOp::Delete { .. } => {
            OperatorShape::Sink
        }
    }
}

/// Lowers `node` and its inputs.
pub(crate) fn lower(node: &PhysicalNode, env: &ExecutionEnv) -> Result<Operator, ExecutionError> {
    let inputs = node
        .inputs
        .iter()
        .map(|input| {
            let operator = lower(input, env)?;
            if input.group_id == node.group_id {
                Ok(operator.into_stream())
            } else {
                env.connect(operator)
            }
        })
        .collect::<Result<Vec<_>, ExecutionError>>()?;
    let timer = profile_timer();
    let columns: Columns = node.columns().into();
    let stream = lower_node(node, inputs, Arc::clone(&columns), env)?;
    record_profile_timer(QueryProfileKind::Lower, timer);
    Ok(Operator::new(node, shape_of(&node.op), columns, stream))
}

fn lower_node(
    node: &PhysicalNode,
    mut inputs: Vec<BoxTupleStream>,
    columns: Columns,
    env: &ExecutionEnv,
) -> Result<BoxTupleStream, ExecutionError> {
    let bindings = Arc::clone(env.bindings());
    let cancel = env.cancel().clone();
    let stream: BoxTupleStream = match &node.op {
        PhysicalOp::EntityScan {
            entity,
            fetch,
            partition,
            partitions,
        } => Box::new(source::ScanStream::new(
            entity.scan(fetch, *partition, *partitions)?,
            cancel,
        )),
        PhysicalOp::EntitySample {
            entity,
            fetch,
            probability,
            seed,
        } => Box::new(source::SampleStream::new(
            entity.scan(fetch, 0, 1)?,
            *probability,
            *seed,
            cancel,
        )),
        PhysicalOp::EntityCount { entity, .. } => {
            Box::new(source::CountStream::new(Arc::clone(entity), columns, cancel))
        }
        PhysicalOp::IndexScan {
            index, predicate, ..
        } => {
            let cursor = index.filter(predicate, &bindings.read())?;
            Box::new(source::ScanStream::new(cursor, cancel))
        }
        PhysicalOp::Filter { predicate } => Box::new(pipeline::FilterStream::new(
            single(node, &mut inputs)?,
            predicate.clone(),
            bindings,
        )),
        PhysicalOp::Function {
            function,
            arguments,
            ..
        } => Box::new(pipeline::FunctionStream::new(
            single(node, &mut inputs)?,
            Arc::clone(function),
            arguments.clone(),
            bindings,
            columns,
        )),
        PhysicalOp::Fetch { entity, fetch } => Box::new(pipeline::FetchStream::new(
            single(node, &mut inputs)?,
            Arc::clone(entity),
            fetch.clone(),
            columns,
        )),
        PhysicalOp::Projection { kind } => pipeline::projection(single(node, &mut inputs)?, kind.clone(), columns),
        PhysicalOp::Limit { skip, limit } => {
            Box::new(pipeline::LimitStream::new(single(node, &mut inputs)?, *skip, *limit))
        }
        PhysicalOp::Sort { order } => Box::new(sort::SortStream::new(single(node, &mut inputs)?, order.clone())),
        PhysicalOp::ExternalSort { order, chunk_size } => Box::new(sort::ExternalSortStream::new(
            single(node, &mut inputs)?,
            order.clone(),
            *chunk_size,
            env.spill_dir().map(ToOwned::to_owned),
            columns,
        )),
        PhysicalOp::LimitingSort { order, skip, limit } => Box::new(
            sort::LimitingSortStream::new(single(node, &mut inputs)?, order.clone(), *skip, *limit),
        ),
        PhysicalOp::MergeLimitingSort { order, skip, limit } => Box::new(
            sort::MergeLimitingSortStream::new(inputs, order.clone(), *skip, *limit),
        ),
        PhysicalOp::Merge => Box::new(merging::ConcatStream::new(inputs, false, columns)),
        PhysicalOp::Union { distinct } => {
            Box::new(merging::ConcatStream::new(inputs, *distinct, columns))
        }
        PhysicalOp::Intersect => Box::new(merging::IntersectStream::new(inputs, columns)),
        PhysicalOp::FilterOnSubSelect { predicate } => {
            let groups = node.inputs.iter().skip(1).map(|i| i.group_id).collect();
            Box::new(merging::SubSelectFilterStream::new(
                inputs,
                groups,
                predicate.clone(),
                bindings,
            ))
        }
        PhysicalOp::Insert { entity, values } => Box::new(sink::InsertSink::new(
            Arc::clone(entity),
            values.clone(),
            bindings,
            env.rows_affected(),
        )),
        PhysicalOp::Update { entity, values } => Box::new(sink::UpdateSink::new(
            single(node, &mut inputs)?,
            Arc::clone(entity),
            values.clone(),
            bindings,
            env.rows_affected(),
        )),
        PhysicalOp::Delete { entity } => Box::new(sink::DeleteSink::new(
            single(node, &mut inputs)?,
            Arc::clone(entity),
            env.rows_affected(),
        )),
    };
    Ok(stream)
}

fn single(node: &PhysicalNode, inputs: &mut Vec<BoxTupleStream>) -> Result<BoxTupleStream, ExecutionError> {
    inputs
        .pop()
        .ok_or_else(|| ExecutionError::Storage(format!("{} has no input", node.name())))
}

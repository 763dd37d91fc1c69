//! Physical plan representation.
//!
//! A physical tree fixes access paths, ordering strategy and partitioning.
//! Nodes are immutable and share children through [`Arc`]; rewrites build new
//! spines and reuse untouched subtrees. Entity, index and function handles are
//! shared by reference and never deep-copied.
use std::fmt;
use std::hash::Hasher;
use std::sync::Arc;

use tracing::warn;
use xxhash_rust::xxh64::Xxh64;

use crate::query::binding::{Binding, BindingContext};
use crate::query::catalog::{IndexHandle, TableHandle};
use crate::query::context::GroupId;
use crate::query::cost::Cost;
use crate::query::errors::{BindingError, PlanningError};
use crate::query::function::Function;
use crate::query::logical::{write_str, ProjectionKind};
use crate::query::planner::{ExplainNode, ExplainProp};
use crate::query::predicate::BooleanPredicate;
use crate::query::selectivity::{NaiveSelectivityCalculator, StatisticsMap};
use crate::query::traits::{
    LimitTrait, MaterializedTrait, NodeWithTrait, NotPartitionableTrait, OrderTrait, SortOrder,
    TraitSet, TraitType,
};
use crate::query::value::ColumnDef;

/// Physical operators.
#[derive(Clone, Debug)]
pub enum PhysicalOp {
    /// Scans one partition of an entity.
    EntityScan {
        entity: Arc<dyn TableHandle>,
        fetch: Vec<ColumnDef>,
        partition: usize,
        partitions: usize,
    },
    /// Bernoulli sample of an entity.
    EntitySample {
        entity: Arc<dyn TableHandle>,
        fetch: Vec<ColumnDef>,
        probability: f32,
        seed: u64,
    },
    /// Row count answered from entity metadata.
    EntityCount {
        entity: Arc<dyn TableHandle>,
        out: ColumnDef,
    },
    /// Candidate rows produced by a secondary index.
    IndexScan {
        index: Arc<dyn IndexHandle>,
        entity: Arc<dyn TableHandle>,
        predicate: BooleanPredicate,
    },
    /// Keeps rows matching a predicate.
    Filter { predicate: BooleanPredicate },
    /// Filter whose predicate reads the results of sub-query inputs.
    FilterOnSubSelect { predicate: BooleanPredicate },
    /// Appends a function result column.
    Function {
        function: Arc<dyn Function>,
        arguments: Vec<Binding>,
        out: ColumnDef,
    },
    /// Fetches columns by row id.
    Fetch {
        entity: Arc<dyn TableHandle>,
        fetch: Vec<ColumnDef>,
    },
    /// Projection or aggregation.
    Projection { kind: ProjectionKind },
    /// In-memory sort.
    Sort { order: Vec<(ColumnDef, SortOrder)> },
    /// Spilling sort that keeps at most `chunk_size` tuples in memory.
    ExternalSort {
        order: Vec<(ColumnDef, SortOrder)>,
        chunk_size: usize,
    },
    /// Bounded heap sort retaining `skip + limit` tuples.
    LimitingSort {
        order: Vec<(ColumnDef, SortOrder)>,
        skip: u64,
        limit: u64,
    },
    /// Skips and limits rows.
    Limit { skip: u64, limit: u64 },
    /// Concatenates partitions in arrival order.
    Merge,
    /// Ordered merge of sorted partitions, applying skip and limit.
    MergeLimitingSort {
        order: Vec<(ColumnDef, SortOrder)>,
        skip: u64,
        limit: u64,
    },
    /// Concatenation of inputs, optionally distinct.
    Union { distinct: bool },
    /// Rows present in every input.
    Intersect,
    /// Inserts one row built from bindings.
    Insert {
        entity: Arc<dyn TableHandle>,
        values: Vec<(ColumnDef, Binding)>,
    },
    /// Updates input rows.
    Update {
        entity: Arc<dyn TableHandle>,
        values: Vec<(ColumnDef, Binding)>,
    },
    /// Deletes input rows.
    Delete { entity: Arc<dyn TableHandle> },
}

impl PhysicalOp {
    /// Operator name.
    pub fn name(&self) -> &'static str {
        match self {
            PhysicalOp::EntityScan { .. } => "EntityScan",
            PhysicalOp::EntitySample { .. } => "EntitySample",
            PhysicalOp::EntityCount { .. } => "EntityCount",
            PhysicalOp::IndexScan { .. } => "IndexScan",
            PhysicalOp::Filter { .. } => "Filter",
            PhysicalOp::FilterOnSubSelect { .. } => "FilterOnSubSelect",
            PhysicalOp::Function { .. } => "Function",
            PhysicalOp::Fetch { .. } => "Fetch",
            PhysicalOp::Projection { .. } => "Projection",
            PhysicalOp::Sort { .. } => "Sort",
            PhysicalOp::ExternalSort { .. } => "ExternalSort",
            PhysicalOp::LimitingSort { .. } => "LimitingSort",
            PhysicalOp::Limit { .. } => "Limit",
            PhysicalOp::Merge => "Merge",
            PhysicalOp::MergeLimitingSort { .. } => "MergeLimitingSort",
            PhysicalOp::Union { .. } => "Union",
            PhysicalOp::Intersect => "Intersect",
            PhysicalOp::Insert { .. } => "Insert",
            PhysicalOp::Update { .. } => "Update",
            PhysicalOp::Delete { .. } => "Delete",
        }
    }

    /// Allowed number of inputs as `(min, max)`.
    fn arity(&self) -> (usize, Option<usize>) {
        match self {
            PhysicalOp::EntityScan { .. }
            | PhysicalOp::EntitySample { .. }
            | PhysicalOp::EntityCount { .. }
            | PhysicalOp::IndexScan { .. }
            | PhysicalOp::Insert { .. } => (0, Some(0)),
            PhysicalOp::Filter { .. }
            | PhysicalOp::Function { .. }
            | PhysicalOp::Fetch { .. }
            | PhysicalOp::Projection { .. }
            | PhysicalOp::Sort { .. }
            | PhysicalOp::ExternalSort { .. }
            | PhysicalOp::LimitingSort { .. }
            | PhysicalOp::Limit { .. }
            | PhysicalOp::Update { .. }
            | PhysicalOp::Delete { .. } => (1, Some(1)),
            PhysicalOp::FilterOnSubSelect { .. }
            | PhysicalOp::Merge
            | PhysicalOp::MergeLimitingSort { .. }
            | PhysicalOp::Union { .. }
            | PhysicalOp::Intersect => (2, None),
        }
    }

    /// Feeds the operator and its properties into a digest.
    pub(crate) fn hash_into<H: Hasher>(&self, state: &mut H) {
        write_str(state, self.name());
        match self {
            PhysicalOp::EntityScan {
                entity,
                fetch,
                partition,
                partitions,
            } => {
                hash_entity(state, entity);
                hash_columns(state, fetch);
                state.write_usize(*partition);
                state.write_usize(*partitions);
            }
            PhysicalOp::EntitySample {
                entity,
                fetch,
                probability,
                seed,
            } => {
                hash_entity(state, entity);
                hash_columns(state, fetch);
                state.write_u32(probability.to_bits());
                state.write_u64(*seed);
            }
            PhysicalOp::EntityCount { entity, out } => {
                hash_entity(state, entity);
                write_str(state, &out.name);
            }
            PhysicalOp::IndexScan {
                index, predicate, ..
            } => {
                write_str(state, index.name());
                state.write_usize(Arc::as_ptr(index) as *const () as usize);
                predicate.hash_into(state);
            }
            PhysicalOp::Filter { predicate } | PhysicalOp::FilterOnSubSelect { predicate } => {
                predicate.hash_into(state)
            }
            PhysicalOp::Function {
                function,
                arguments,
                out,
            } => {
                write_str(state, &function.signature().to_string());
                state.write_u8(function.is_vectorised() as u8);
                for argument in arguments {
                    argument.hash_into(state);
                }
                write_str(state, &out.name);
            }
            PhysicalOp::Fetch { entity, fetch } => {
                hash_entity(state, entity);
                hash_columns(state, fetch);
            }
            PhysicalOp::Projection { kind } => kind.hash_into(state),
            PhysicalOp::Sort { order } => hash_order(state, order),
            PhysicalOp::ExternalSort { order, chunk_size } => {
                hash_order(state, order);
                state.write_usize(*chunk_size);
            }
            PhysicalOp::LimitingSort { order, skip, limit }
            | PhysicalOp::MergeLimitingSort { order, skip, limit } => {
                hash_order(state, order);
                state.write_u64(*skip);
                state.write_u64(*limit);
            }
            PhysicalOp::Limit { skip, limit } => {
                state.write_u64(*skip);
                state.write_u64(*limit);
            }
            PhysicalOp::Union { distinct } => state.write_u8(*distinct as u8),
            PhysicalOp::Merge | PhysicalOp::Intersect => {}
            PhysicalOp::Insert { entity, values } | PhysicalOp::Update { entity, values } => {
                hash_entity(state, entity);
                for (column, binding) in values {
                    write_str(state, &column.name);
                    binding.hash_into(state);
                }
            }
            PhysicalOp::Delete { entity } => write_str(state, entity.name()),
        }
    }
}

/// Entities are told apart by handle as well as name. A cached plan keeps its
/// handles alive, so an address cannot be reused while the entry exists.
fn hash_entity<H: Hasher>(state: &mut H, entity: &Arc<dyn TableHandle>) {
    write_str(state, entity.name());
    state.write_usize(Arc::as_ptr(entity) as *const () as usize);
}

fn hash_columns<H: Hasher>(state: &mut H, columns: &[ColumnDef]) {
    state.write_usize(columns.len());
    for column in columns {
        write_str(state, &column.name);
    }
}

fn hash_order<H: Hasher>(state: &mut H, order: &[(ColumnDef, SortOrder)]) {
    state.write_usize(order.len());
    for (column, direction) in order {
        write_str(state, &column.name);
        state.write_u8(matches!(direction, SortOrder::Descending) as u8);
    }
}

/// Node of a physical plan tree.
#[derive(Clone, Debug)]
pub struct PhysicalNode {
    /// Group the node executes in.
    pub group_id: GroupId,
    /// Operator.
    pub op: PhysicalOp,
    /// Inputs.
    pub inputs: Vec<Arc<PhysicalNode>>,
}

impl PhysicalNode {
    /// Creates a node.
    pub fn new(group_id: GroupId, op: PhysicalOp, inputs: Vec<Arc<PhysicalNode>>) -> Self {
        Self {
            group_id,
            op,
            inputs,
        }
    }

    /// Pipelined node over `input`, sharing its group.
    pub fn unary(op: PhysicalOp, input: Arc<PhysicalNode>) -> Self {
        Self::new(input.group_id, op, vec![input])
    }

    /// Merging node adopting the group of its left-most input.
    pub fn nary(op: PhysicalOp, inputs: Vec<Arc<PhysicalNode>>) -> Self {
        let group_id = inputs.first().map_or(0, |i| i.group_id);
        Self::new(group_id, op, inputs)
    }

    /// Same operator and group over new inputs.
    pub fn with_inputs(&self, inputs: Vec<Arc<PhysicalNode>>) -> Self {
        Self::new(self.group_id, self.op.clone(), inputs)
    }

    /// Operator name.
    pub fn name(&self) -> &'static str {
        self.op.name()
    }

    /// First input, if any.
    pub fn input(&self) -> Option<&Arc<PhysicalNode>> {
        self.inputs.first()
    }

    /// Columns produced by this node.
    pub fn columns(&self) -> Vec<ColumnDef> {
        let inherited = || self.input().map(|i| i.columns()).unwrap_or_default();
        match &self.op {
            PhysicalOp::EntityScan { fetch, .. } | PhysicalOp::EntitySample { fetch, .. } => {
                fetch.clone()
            }
            PhysicalOp::EntityCount { out, .. } => vec![out.clone()],
            PhysicalOp::IndexScan { index, .. } => index.columns().to_vec(),
            PhysicalOp::Function { out, .. } => {
                let mut columns = inherited();
                columns.push(out.clone());
                columns
            }
            PhysicalOp::Fetch { fetch, .. } => {
                let mut columns = inherited();
                let missing: Vec<ColumnDef> =
                    fetch.iter().filter(|c| !columns.contains(c)).cloned().collect();
                columns.extend(missing);
                columns
            }
            PhysicalOp::Projection { kind } => kind.columns(),
            PhysicalOp::Insert { .. } | PhysicalOp::Update { .. } | PhysicalOp::Delete { .. } => {
                Vec::new()
            }
            PhysicalOp::Filter { .. }
            | PhysicalOp::FilterOnSubSelect { .. }
            | PhysicalOp::Sort { .. }
            | PhysicalOp::ExternalSort { .. }
            | PhysicalOp::LimitingSort { .. }
            | PhysicalOp::Limit { .. }
            | PhysicalOp::Merge
            | PhysicalOp::MergeLimitingSort { .. }
            | PhysicalOp::Union { .. }
            | PhysicalOp::Intersect => inherited(),
        }
    }

    /// Columns this node reads from its first input.
    pub fn requires(&self) -> Vec<ColumnDef> {
        let order_columns =
            |order: &[(ColumnDef, SortOrder)]| order.iter().map(|(c, _)| c.clone()).collect();
        match &self.op {
            PhysicalOp::Filter { predicate } | PhysicalOp::FilterOnSubSelect { predicate } => {
                predicate.columns().into_iter().collect()
            }
            PhysicalOp::Function { arguments, .. } => {
                arguments.iter().flat_map(Binding::columns).collect()
            }
            PhysicalOp::Projection { kind } => kind.requires(),
            PhysicalOp::Sort { order }
            | PhysicalOp::ExternalSort { order, .. }
            | PhysicalOp::LimitingSort { order, .. }
            | PhysicalOp::MergeLimitingSort { order, .. } => order_columns(order),
            PhysicalOp::Update { values, .. } => {
                values.iter().flat_map(|(_, b)| b.columns()).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Checks arity, column availability and column compatibility of the
    /// whole tree.
    pub fn validate(&self) -> Result<(), PlanningError> {
        let name = self.name();
        let (min, max) = self.op.arity();
        let found = self.inputs.len();
        if found < min || max.is_some_and(|max| found > max) {
            return Err(PlanningError::Arity {
                node: name,
                expected: max.unwrap_or(min),
                found,
            });
        }
        if let Some(input) = self.input() {
            let available = input.columns();
            if let Some(missing) = self.requires().into_iter().find(|c| !available.contains(c)) {
                return Err(PlanningError::missing_column(name, missing.name));
            }
        }
        match &self.op {
            PhysicalOp::EntityScan { entity, fetch, .. }
            | PhysicalOp::EntitySample { entity, fetch, .. }
            | PhysicalOp::Fetch { entity, fetch } => check_entity_columns(entity.as_ref(), fetch)?,
            PhysicalOp::Insert { entity, values } | PhysicalOp::Update { entity, values } => {
                let columns: Vec<ColumnDef> = values.iter().map(|(c, _)| c.clone()).collect();
                check_entity_columns(entity.as_ref(), &columns)?;
            }
            PhysicalOp::Function {
                function,
                arguments,
                ..
            } => {
                let signature = function.signature();
                if signature.arguments.len() != arguments.len() {
                    return Err(PlanningError::IncompatibleSignature {
                        name: signature.name.clone(),
                        args: arguments
                            .iter()
                            .map(|a| a.to_string())
                            .collect::<Vec<_>>()
                            .join(", "),
                    });
                }
            }
            PhysicalOp::Merge
            | PhysicalOp::MergeLimitingSort { .. }
            | PhysicalOp::Union { .. }
            | PhysicalOp::Intersect => {
                let first = self.inputs[0].columns();
                if self.inputs.iter().skip(1).any(|i| i.columns() != first) {
                    return Err(PlanningError::InvalidPlan(format!(
                        "inputs of {name} produce different columns"
                    )));
                }
            }
            _ => {}
        }
        self.inputs.iter().try_for_each(|input| input.validate())
    }

    /// Checks that every binding of this node resolves in `ctx`.
    pub(crate) fn bind_local(&self, ctx: &BindingContext) -> Result<(), BindingError> {
        match &self.op {
            PhysicalOp::Filter { predicate }
            | PhysicalOp::FilterOnSubSelect { predicate }
            | PhysicalOp::IndexScan { predicate, .. } => predicate
                .atomics()
                .into_iter()
                .flat_map(|(op, _)| op.bindings())
                .try_for_each(|b| ctx.check(b)),
            PhysicalOp::Function { arguments, .. } => {
                arguments.iter().try_for_each(|b| ctx.check(b))
            }
            PhysicalOp::Insert { values, .. } | PhysicalOp::Update { values, .. } => {
                values.iter().try_for_each(|(_, b)| ctx.check(b))
            }
            _ => Ok(()),
        }
    }

    /// Checks every binding of the tree against `ctx`.
    pub fn bind(&self, ctx: &BindingContext) -> Result<(), BindingError> {
        self.bind_local(ctx)?;
        self.inputs.iter().try_for_each(|input| input.bind(ctx))
    }

    /// Statistics of the columns this node produces.
    pub fn statistics(&self) -> StatisticsMap {
        let from_entity = |entity: &Arc<dyn TableHandle>, columns: &[ColumnDef], map: &mut StatisticsMap| {
            for column in columns {
                if let Some(stats) = entity.statistics(column) {
                    map.insert(column.clone(), stats);
                }
            }
        };
        let mut map = StatisticsMap::default();
        match &self.op {
            PhysicalOp::EntityScan { entity, fetch, .. }
            | PhysicalOp::EntitySample { entity, fetch, .. } => from_entity(entity, fetch, &mut map),
            PhysicalOp::IndexScan { index, entity, .. } => {
                from_entity(entity, index.columns(), &mut map)
            }
            PhysicalOp::Fetch { entity, fetch } => {
                if let Some(input) = self.input() {
                    map = input.statistics();
                }
                from_entity(entity, fetch, &mut map);
            }
            PhysicalOp::EntityCount { .. }
            | PhysicalOp::Insert { .. }
            | PhysicalOp::Update { .. }
            | PhysicalOp::Delete { .. } => {}
            PhysicalOp::Projection { kind } if kind.is_aggregate() => {}
            _ => {
                if let Some(input) = self.input() {
                    map = input.statistics();
                }
            }
        }
        map
    }

    /// Estimated number of tuples this node emits.
    pub fn output_size(&self, ctx: &BindingContext) -> u64 {
        let input_rows = || self.input().map_or(0, |i| i.output_size(ctx));
        let all_rows = || self.inputs.iter().map(|i| i.output_size(ctx)).sum::<u64>();
        match &self.op {
            PhysicalOp::EntityScan {
                entity,
                partition,
                partitions,
                ..
            } => {
                let rows = count_rows(entity.as_ref());
                let partitions = (*partitions).max(1) as u64;
                rows / partitions + u64::from((*partition as u64) < rows % partitions)
            }
            PhysicalOp::EntitySample {
                entity, probability, ..
            } => (count_rows(entity.as_ref()) as f64 * f64::from(*probability)).ceil() as u64,
            PhysicalOp::EntityCount { .. } => 1,
            PhysicalOp::IndexScan {
                index, predicate, ..
            } => index.estimate_matches(predicate, ctx),
            PhysicalOp::Filter { predicate } | PhysicalOp::FilterOnSubSelect { predicate } => {
                let Some(input) = self.input() else {
                    return 0;
                };
                NaiveSelectivityCalculator
                    .estimate(predicate, &input.statistics(), ctx)
                    .apply(input.output_size(ctx))
            }
            PhysicalOp::Projection { kind } if kind.is_aggregate() => 1,
            PhysicalOp::Function { .. }
            | PhysicalOp::Fetch { .. }
            | PhysicalOp::Projection { .. }
            | PhysicalOp::Sort { .. }
            | PhysicalOp::ExternalSort { .. } => input_rows(),
            PhysicalOp::Limit { skip, limit } | PhysicalOp::LimitingSort { skip, limit, .. } => {
                bounded(input_rows(), *skip, *limit)
            }
            PhysicalOp::MergeLimitingSort { skip, limit, .. } => bounded(all_rows(), *skip, *limit),
            PhysicalOp::Merge | PhysicalOp::Union { .. } => all_rows(),
            PhysicalOp::Intersect => self
                .inputs
                .iter()
                .map(|i| i.output_size(ctx))
                .min()
                .unwrap_or(0),
            PhysicalOp::Insert { .. } | PhysicalOp::Update { .. } | PhysicalOp::Delete { .. } => 0,
        }
    }

    /// Estimated width of one output tuple in bytes.
    pub fn tuple_size(&self) -> usize {
        self.columns()
            .iter()
            .map(|c| c.ty.physical_size())
            .sum::<usize>()
            .max(1)
    }

    /// Node-local cost; inputs are not included.
    pub fn cost(&self, ctx: &BindingContext) -> Cost {
        let input_rows = || self.input().map_or(0, |i| i.output_size(ctx)) as f32;
        let all_rows = || self.inputs.iter().map(|i| i.output_size(ctx)).sum::<u64>() as f32;
        let tuple = self.tuple_size() as f32;
        match &self.op {
            PhysicalOp::EntityScan { fetch, .. } => {
                read_cost(fetch) * self.output_size(ctx) as f32
            }
            PhysicalOp::EntitySample {
                entity,
                fetch,
                probability,
                ..
            } => {
                read_cost(fetch) * count_rows(entity.as_ref()) as f32
                    + Cost::new(0.0, 0.0, 0.0, 1.0 - probability)
            }
            PhysicalOp::EntityCount { .. } => {
                Cost::DISK_ACCESS_READ * 8.0 + Cost::MEMORY_ACCESS
            }
            PhysicalOp::IndexScan {
                index, predicate, ..
            } => index.cost(predicate, ctx),
            PhysicalOp::Filter { predicate } | PhysicalOp::FilterOnSubSelect { predicate } => {
                predicate.cost() * input_rows()
            }
            PhysicalOp::Function {
                function,
                arguments,
                ..
            } => (function.cost() + Cost::MEMORY_ACCESS * arguments.len() as f32) * input_rows(),
            PhysicalOp::Fetch { fetch, .. } => read_cost(fetch) * input_rows(),
            PhysicalOp::Projection { kind } => match kind {
                ProjectionKind::Select(columns) => {
                    Cost::MEMORY_ACCESS * (columns.len() as f32 * input_rows())
                }
                ProjectionKind::Count | ProjectionKind::Exists => Cost::MEMORY_ACCESS * input_rows(),
                _ => (Cost::MEMORY_ACCESS + Cost::FLOP) * input_rows() + Cost::memory_bytes(tuple as f64),
            },
            PhysicalOp::Sort { order } => {
                let n = input_rows();
                Cost::MEMORY_ACCESS * (2.0 * n * log2(n) * order.len() as f32)
                    + Cost::memory_bytes(f64::from(n) * f64::from(tuple))
            }
            PhysicalOp::ExternalSort { order, chunk_size } => {
                let n = input_rows();
                (Cost::DISK_ACCESS_READ + Cost::DISK_ACCESS_WRITE) * (n * tuple)
                    + Cost::MEMORY_ACCESS * (2.0 * n * log2(n) * order.len() as f32)
                    + Cost::memory_bytes(*chunk_size as f64 * f64::from(tuple))
            }
            PhysicalOp::LimitingSort { order, skip, limit } => {
                let n = input_rows();
                let retained = n.min(skip.saturating_add(*limit) as f32);
                Cost::MEMORY_ACCESS * (2.0 * n * log2(retained) * order.len() as f32)
                    + Cost::memory_bytes(f64::from(retained) * f64::from(tuple))
            }
            PhysicalOp::MergeLimitingSort { order, skip, limit } => {
                let n = all_rows();
                let retained = n.min(skip.saturating_add(*limit) as f32);
                Cost::MEMORY_ACCESS * (n * log2(self.inputs.len() as f32) * order.len() as f32)
                    + Cost::memory_bytes(f64::from(retained) * f64::from(tuple))
            }
            PhysicalOp::Limit { skip, limit } => {
                Cost::MEMORY_ACCESS * input_rows().min(skip.saturating_add(*limit) as f32)
            }
            PhysicalOp::Merge => Cost::MEMORY_ACCESS * all_rows(),
            PhysicalOp::Union { distinct } => {
                let n = all_rows();
                let dedup = if *distinct {
                    Cost::memory_bytes(f64::from(n) * f64::from(tuple))
                } else {
                    Cost::ZERO
                };
                Cost::MEMORY_ACCESS * n + dedup
            }
            PhysicalOp::Intersect => {
                let buffered: u64 = self.inputs.iter().skip(1).map(|i| i.output_size(ctx)).sum();
                Cost::MEMORY_ACCESS * all_rows() + Cost::memory_bytes(buffered as f64 * f64::from(tuple))
            }
            PhysicalOp::Insert { values, .. } => {
                Cost::DISK_ACCESS_WRITE * width(values.iter().map(|(c, _)| c)) as f32
            }
            PhysicalOp::Update { values, .. } => {
                (Cost::DISK_ACCESS_WRITE * width(values.iter().map(|(c, _)| c)) as f32
                    + Cost::MEMORY_ACCESS)
                    * input_rows()
            }
            PhysicalOp::Delete { .. } => Cost::DISK_ACCESS_WRITE * 8.0 * input_rows(),
        }
    }

    /// Sum of node costs over the whole tree.
    pub fn total_cost(&self, ctx: &BindingContext) -> Cost {
        self.cost(ctx) + self.inputs.iter().map(|i| i.total_cost(ctx)).sum::<Cost>()
    }

    /// Share of [`PhysicalNode::total_cost`] spent in partitionable nodes.
    pub fn parallelisable_cost(&self, ctx: &BindingContext) -> Cost {
        let own = if self.has_trait(TraitType::NotPartitionable) {
            Cost::ZERO
        } else {
            self.cost(ctx)
        };
        own + self
            .inputs
            .iter()
            .map(|i| i.parallelisable_cost(ctx))
            .sum::<Cost>()
    }

    /// Structural hash. Group ids and literal values do not contribute.
    pub fn digest(&self) -> u64 {
        let mut hasher = Xxh64::new(0);
        self.hash_into(&mut hasher);
        hasher.finish()
    }

    fn hash_into<H: Hasher>(&self, state: &mut H) {
        self.op.hash_into(state);
        state.write_usize(self.inputs.len());
        for input in &self.inputs {
            input.hash_into(state);
        }
    }

    /// Deep copy that shares no node with `self`; handles stay shared.
    pub fn copy(&self) -> PhysicalNode {
        PhysicalNode {
            group_id: self.group_id,
            op: self.op.clone(),
            inputs: self.inputs.iter().map(|i| Arc::new(i.copy())).collect(),
        }
    }

    /// Visits the tree in pre-order.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a PhysicalNode)) {
        visit(self);
        for input in &self.inputs {
            input.walk(visit);
        }
    }

    /// Number of nodes named `name` in the tree.
    pub fn count(&self, name: &str) -> usize {
        let mut n = 0;
        self.walk(&mut |node| n += usize::from(node.name() == name));
        n
    }

    /// Distinct group ids used by the tree.
    pub fn groups(&self) -> Vec<GroupId> {
        let mut groups = Vec::new();
        self.walk(&mut |node| {
            if !groups.contains(&node.group_id) {
                groups.push(node.group_id);
            }
        });
        groups
    }

    /// Explain tree annotated with estimates under `ctx`.
    pub fn explain(&self, ctx: &BindingContext) -> ExplainNode {
        let mut node = ExplainNode::new(self.name());
        node.group = self.group_id;
        node.rows = self.output_size(ctx);
        node.cost = self.cost(ctx);
        node.props = self.explain_props();
        node.inputs = self.inputs.iter().map(|i| i.explain(ctx)).collect();
        node
    }

    fn explain_props(&self) -> Vec<ExplainProp> {
        let columns = |columns: &[ColumnDef]| {
            columns
                .iter()
                .map(|c| c.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        let order = |order: &[(ColumnDef, SortOrder)]| {
            order
                .iter()
                .map(|(c, d)| format!("{} {d}", c.name))
                .collect::<Vec<_>>()
                .join(", ")
        };
        match &self.op {
            PhysicalOp::EntityScan {
                entity,
                fetch,
                partition,
                partitions,
            } => {
                let mut props = vec![prop("entity", entity.name()), prop("columns", columns(fetch))];
                if *partitions > 1 {
                    props.push(prop("partition", format!("{partition}/{partitions}")));
                }
                props
            }
            PhysicalOp::EntitySample {
                entity,
                fetch,
                probability,
                seed,
            } => vec![
                prop("entity", entity.name()),
                prop("columns", columns(fetch)),
                prop("probability", probability.to_string()),
                prop("seed", seed.to_string()),
            ],
            PhysicalOp::EntityCount { entity, .. } => vec![prop("entity", entity.name())],
            PhysicalOp::IndexScan {
                index, predicate, ..
            } => vec![prop("index", index.name()), prop("predicate", predicate.to_string())],
            PhysicalOp::Filter { predicate } | PhysicalOp::FilterOnSubSelect { predicate } => {
                vec![prop("predicate", predicate.to_string())]
            }
            PhysicalOp::Function {
                function,
                arguments,
                out,
            } => vec![
                prop("function", function.signature().to_string()),
                prop(
                    "arguments",
                    arguments.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(", "),
                ),
                prop("vectorised", function.is_vectorised().to_string()),
                prop("out", out.name.clone()),
            ],
            PhysicalOp::Fetch { entity, fetch } => {
                vec![prop("entity", entity.name()), prop("columns", columns(fetch))]
            }
            PhysicalOp::Projection { kind } => {
                vec![prop("kind", kind.name()), prop("columns", columns(&kind.columns()))]
            }
            PhysicalOp::Sort { order: o } => vec![prop("order", order(o))],
            PhysicalOp::ExternalSort {
                order: o,
                chunk_size,
            } => vec![prop("order", order(o)), prop("chunk_size", chunk_size.to_string())],
            PhysicalOp::LimitingSort {
                order: o,
                skip,
                limit,
            }
            | PhysicalOp::MergeLimitingSort {
                order: o,
                skip,
                limit,
            } => vec![
                prop("order", order(o)),
                prop("skip", skip.to_string()),
                prop("limit", limit.to_string()),
            ],
            PhysicalOp::Limit { skip, limit } => {
                vec![prop("skip", skip.to_string()), prop("limit", limit.to_string())]
            }
            PhysicalOp::Union { distinct } => vec![prop("distinct", distinct.to_string())],
            PhysicalOp::Merge | PhysicalOp::Intersect => Vec::new(),
            PhysicalOp::Insert { entity, values } | PhysicalOp::Update { entity, values } => vec![
                prop("entity", entity.name()),
                prop(
                    "values",
                    values
                        .iter()
                        .map(|(c, b)| format!("{} = {b}", c.name))
                        .collect::<Vec<_>>()
                        .join(", "),
                ),
            ],
            PhysicalOp::Delete { entity } => vec![prop("entity", entity.name())],
        }
    }

    /// Splits the first partitionable chain of the tree into `partitions`
    /// partitions. Partition 0 keeps the chain's group; the others take ids
    /// from `next_group`. Returns `None` when nothing can be partitioned.
    pub fn try_partition(
        &self,
        partitions: usize,
        next_group: &mut dyn FnMut() -> GroupId,
    ) -> Option<PhysicalNode> {
        if partitions < 2 {
            return None;
        }
        if self.is_partitionable_chain() {
            let parts = self.split(partitions, next_group);
            return Some(PhysicalNode::nary(PhysicalOp::Merge, parts));
        }
        if let PhysicalOp::LimitingSort { order, skip, limit } = &self.op {
            if let Some(input) = self.input().filter(|i| i.is_partitionable_chain()) {
                let retained = skip.saturating_add(*limit);
                let parts = input
                    .split(partitions, next_group)
                    .into_iter()
                    .map(|part| {
                        Arc::new(PhysicalNode::unary(
                            PhysicalOp::LimitingSort {
                                order: order.clone(),
                                skip: 0,
                                limit: retained,
                            },
                            part,
                        ))
                    })
                    .collect();
                return Some(PhysicalNode::new(
                    self.group_id,
                    PhysicalOp::MergeLimitingSort {
                        order: order.clone(),
                        skip: *skip,
                        limit: *limit,
                    },
                    parts,
                ));
            }
        }
        for (i, input) in self.inputs.iter().enumerate() {
            if let Some(partitioned) = input.try_partition(partitions, next_group) {
                let mut inputs = self.inputs.clone();
                inputs[i] = Arc::new(partitioned);
                return Some(self.with_inputs(inputs));
            }
        }
        None
    }

    fn is_partitionable_chain(&self) -> bool {
        if self.has_trait(TraitType::NotPartitionable) {
            return false;
        }
        match &self.op {
            PhysicalOp::EntityScan { partitions: 1, .. } => true,
            PhysicalOp::Filter { .. }
            | PhysicalOp::Function { .. }
            | PhysicalOp::Fetch { .. }
            | PhysicalOp::Projection {
                kind: ProjectionKind::Select(_),
            } => self.inputs.len() == 1 && self.inputs[0].is_partitionable_chain(),
            _ => false,
        }
    }

    fn split(&self, partitions: usize, next_group: &mut dyn FnMut() -> GroupId) -> Vec<Arc<PhysicalNode>> {
        (0..partitions)
            .map(|partition| {
                let group = if partition == 0 {
                    self.group_id
                } else {
                    next_group()
                };
                Arc::new(self.partition_chain(partition, partitions, group))
            })
            .collect()
    }

    fn partition_chain(&self, partition: usize, partitions: usize, group: GroupId) -> PhysicalNode {
        let op = match &self.op {
            PhysicalOp::EntityScan { entity, fetch, .. } => PhysicalOp::EntityScan {
                entity: Arc::clone(entity),
                fetch: fetch.clone(),
                partition,
                partitions,
            },
            other => other.clone(),
        };
        let inputs = self
            .inputs
            .iter()
            .map(|i| Arc::new(i.partition_chain(partition, partitions, group)))
            .collect();
        PhysicalNode::new(group, op, inputs)
    }
}

impl NodeWithTrait for PhysicalNode {
    fn traits(&self) -> TraitSet {
        let inherited = || self.input().map(|i| i.traits()).unwrap_or_default();
        let blocked = || TraitSet::new().with(NotPartitionableTrait);
        let order_trait = |order: &[(ColumnDef, SortOrder)]| OrderTrait {
            order: order.to_vec(),
        };
        match &self.op {
            PhysicalOp::EntityScan { partitions, .. } => {
                if *partitions > 1 {
                    blocked()
                } else {
                    TraitSet::new()
                }
            }
            PhysicalOp::EntitySample { .. } => TraitSet::new(),
            PhysicalOp::EntityCount { .. } | PhysicalOp::IndexScan { .. } => blocked(),
            PhysicalOp::Filter { .. } | PhysicalOp::Function { .. } | PhysicalOp::Fetch { .. } => {
                inherited()
            }
            PhysicalOp::Projection { kind } => {
                if kind.is_aggregate() {
                    blocked().with(MaterializedTrait)
                } else {
                    inherited()
                }
            }
            PhysicalOp::FilterOnSubSelect { .. } => inherited().with(NotPartitionableTrait),
            PhysicalOp::Sort { order } | PhysicalOp::ExternalSort { order, .. } => inherited()
                .without(TraitType::Limit)
                .with(order_trait(order))
                .with(MaterializedTrait)
                .with(NotPartitionableTrait),
            PhysicalOp::LimitingSort { order, skip, limit } => TraitSet::new()
                .with(order_trait(order))
                .with(LimitTrait {
                    skip: *skip,
                    limit: *limit,
                })
                .with(MaterializedTrait)
                .with(NotPartitionableTrait),
            PhysicalOp::MergeLimitingSort { order, skip, limit } => blocked()
                .with(order_trait(order))
                .with(LimitTrait {
                    skip: *skip,
                    limit: *limit,
                }),
            PhysicalOp::Limit { skip, limit } => inherited()
                .with(LimitTrait {
                    skip: *skip,
                    limit: *limit,
                })
                .with(NotPartitionableTrait),
            PhysicalOp::Merge
            | PhysicalOp::Union { .. }
            | PhysicalOp::Intersect
            | PhysicalOp::Insert { .. }
            | PhysicalOp::Update { .. }
            | PhysicalOp::Delete { .. } => blocked(),
        }
    }
}

impl fmt::Display for PhysicalNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn render(node: &PhysicalNode, depth: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            writeln!(f, "{:indent$}{}#{}", "", node.name(), node.group_id, indent = depth * 2)?;
            node.inputs.iter().try_for_each(|i| render(i, depth + 1, f))
        }
        render(self, 0, f)
    }
}

fn prop(key: &'static str, value: impl Into<String>) -> ExplainProp {
    ExplainProp::plain(key, value)
}

fn check_entity_columns(entity: &dyn TableHandle, columns: &[ColumnDef]) -> Result<(), PlanningError> {
    match columns.iter().find(|c| !entity.columns().contains(c)) {
        Some(missing) => Err(PlanningError::UnknownColumn {
            column: missing.name.clone(),
            context: format!("entity {}", entity.name()),
        }),
        None => Ok(()),
    }
}

fn count_rows(entity: &dyn TableHandle) -> u64 {
    entity.count_rows().unwrap_or_else(|err| {
        warn!(entity = entity.name(), error = %err, "planner.estimate.count_failed");
        0
    })
}

fn read_cost(columns: &[ColumnDef]) -> Cost {
    Cost::DISK_ACCESS_READ * width(columns.iter()) as f32 + Cost::MEMORY_ACCESS * columns.len() as f32
}

fn width<'a>(columns: impl Iterator<Item = &'a ColumnDef>) -> usize {
    columns.map(|c| c.ty.physical_size()).sum()
}

fn log2(n: f32) -> f32 {
    n.max(2.0).log2()
}

fn bounded(rows: u64, skip: u64, limit: u64) -> u64 {
    rows.min(skip.saturating_add(limit)).saturating_sub(skip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::catalog::MemoryTable;
    use crate::query::predicate::ComparisonOperator;
    use crate::query::value::{ColumnType, Value};

    fn table(rows: i64) -> (Arc<dyn TableHandle>, ColumnDef) {
        let id = ColumnDef::new("t.id", ColumnType::Long);
        let table = MemoryTable::new("t", vec![id.clone()]);
        for i in 0..rows {
            table.push(vec![Value::Long(i)]).expect("insert");
        }
        (Arc::new(table), id)
    }

    fn scan(entity: &Arc<dyn TableHandle>, id: &ColumnDef) -> Arc<PhysicalNode> {
        Arc::new(PhysicalNode::new(
            0,
            PhysicalOp::EntityScan {
                entity: Arc::clone(entity),
                fetch: vec![id.clone()],
                partition: 0,
                partitions: 1,
            },
            vec![],
        ))
    }

    #[test]
    fn sort_carries_order_and_blocks_partitioning() {
        let (entity, id) = table(10);
        let sort = PhysicalNode::unary(
            PhysicalOp::Sort {
                order: vec![(id.clone(), SortOrder::Descending)],
            },
            scan(&entity, &id),
        );
        let order = sort.get_trait::<OrderTrait>().expect("order");
        assert_eq!(order.order[0].1, SortOrder::Descending);
        assert!(sort.has_trait(TraitType::Materialized));
        assert!(sort.has_trait(TraitType::NotPartitionable));
        assert!(!sort.has_trait(TraitType::Limit));
    }

    #[test]
    fn limit_bounds_output_size() {
        let (entity, id) = table(10);
        let ctx = BindingContext::new();
        let limit = PhysicalNode::unary(PhysicalOp::Limit { skip: 8, limit: 5 }, scan(&entity, &id));
        assert_eq!(limit.output_size(&ctx), 2);
        let limit = PhysicalNode::unary(PhysicalOp::Limit { skip: 0, limit: 3 }, scan(&entity, &id));
        assert_eq!(limit.output_size(&ctx), 3);
    }

    #[test]
    fn filter_output_never_exceeds_input() {
        let (entity, id) = table(100);
        let mut ctx = BindingContext::new();
        let value = ctx.bind(5i64);
        let filter = PhysicalNode::unary(
            PhysicalOp::Filter {
                predicate: BooleanPredicate::comparison(ComparisonOperator::Less(
                    Binding::Column(id.clone()),
                    value,
                )),
            },
            scan(&entity, &id),
        );
        let rows = filter.output_size(&ctx);
        assert!(rows <= 100);
        assert!(rows < 50, "range estimate should use bounds, got {rows}");
    }

    #[test]
    fn partitioning_splits_scan_chains() {
        let (entity, id) = table(10);
        let mut next = 10;
        let mut alloc = || {
            next += 1;
            next
        };
        let plan = PhysicalNode::unary(
            PhysicalOp::Projection {
                kind: ProjectionKind::Count,
            },
            scan(&entity, &id),
        );
        let partitioned = plan.try_partition(3, &mut alloc).expect("partitioned");
        assert_eq!(partitioned.name(), "Projection");
        let merge = &partitioned.inputs[0];
        assert_eq!(merge.name(), "Merge");
        assert_eq!(merge.group_id, 0);
        assert_eq!(merge.inputs.len(), 3);
        assert_eq!(partitioned.groups(), vec![0, 11, 12]);
        let ctx = BindingContext::new();
        let rows: u64 = merge.inputs.iter().map(|p| p.output_size(&ctx)).sum();
        assert_eq!(rows, 10);
        assert!(partitioned.try_partition(3, &mut alloc).is_none());
        partitioned.validate().expect("valid");
    }

    #[test]
    fn limiting_sort_partitions_into_ordered_merge() {
        let (entity, id) = table(10);
        let order = vec![(id.clone(), SortOrder::Ascending)];
        let plan = PhysicalNode::unary(
            PhysicalOp::LimitingSort {
                order,
                skip: 2,
                limit: 3,
            },
            scan(&entity, &id),
        );
        let mut next = 0;
        let partitioned = plan
            .try_partition(2, &mut || {
                next += 1;
                next
            })
            .expect("partitioned");
        assert!(matches!(
            partitioned.op,
            PhysicalOp::MergeLimitingSort { skip: 2, limit: 3, .. }
        ));
        for part in &partitioned.inputs {
            assert!(matches!(
                part.op,
                PhysicalOp::LimitingSort { skip: 0, limit: 5, .. }
            ));
        }
    }

    #[test]
    fn digest_tracks_structure_not_groups() {
        let (entity, id) = table(1);
        let a = PhysicalNode::unary(PhysicalOp::Limit { skip: 0, limit: 1 }, scan(&entity, &id));
        let mut b = a.copy();
        b.group_id = 42;
        assert_eq!(a.digest(), b.digest());
        let c = PhysicalNode::unary(PhysicalOp::Limit { skip: 0, limit: 2 }, scan(&entity, &id));
        assert_ne!(a.digest(), c.digest());
        assert!(!Arc::ptr_eq(&a.inputs[0], &b.inputs[0]));
    }

    #[test]
    fn arity_is_checked() {
        let (entity, id) = table(1);
        let union = PhysicalNode::nary(PhysicalOp::Union { distinct: false }, vec![scan(&entity, &id)]);
        let err = union.validate().expect_err("arity");
        assert_eq!(err.code(), "Arity");
    }
}

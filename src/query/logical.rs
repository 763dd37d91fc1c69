//! Logical plan representation: what to compute, not how.
//!
//! Every logical node implements into exactly one default physical node;
//! alternative access paths are introduced afterwards by rewrite rules.
use std::fmt;
use std::hash::Hasher;
use std::sync::Arc;

use xxhash_rust::xxh64::Xxh64;

use crate::query::binding::{Binding, BindingContext};
use crate::query::catalog::TableHandle;
use crate::query::context::GroupId;
use crate::query::errors::{BindingError, PlanningError};
use crate::query::function::Function;
use crate::query::physical::{PhysicalNode, PhysicalOp};
use crate::query::predicate::BooleanPredicate;
use crate::query::traits::SortOrder;
use crate::query::value::{ColumnDef, ColumnType};

/// Projection or aggregation applied to an input.
#[derive(Clone, Debug, PartialEq)]
pub enum ProjectionKind {
    /// Keeps the listed columns in order.
    Select(Vec<ColumnDef>),
    /// Number of input rows.
    Count,
    /// Whether the input produced any row.
    Exists,
    /// Smallest value of a column.
    Min(ColumnDef),
    /// Largest value of a column.
    Max(ColumnDef),
    /// Sum of a numeric column.
    Sum(ColumnDef),
    /// Arithmetic mean of a numeric column.
    Mean(ColumnDef),
}

impl ProjectionKind {
    /// Short name used in explain output.
    pub fn name(&self) -> &'static str {
        match self {
            ProjectionKind::Select(_) => "SELECT",
            ProjectionKind::Count => "COUNT",
            ProjectionKind::Exists => "EXISTS",
            ProjectionKind::Min(_) => "MIN",
            ProjectionKind::Max(_) => "MAX",
            ProjectionKind::Sum(_) => "SUM",
            ProjectionKind::Mean(_) => "MEAN",
        }
    }

    /// Returns `true` for aggregations producing a single row.
    pub fn is_aggregate(&self) -> bool {
        !matches!(self, ProjectionKind::Select(_))
    }

    /// Columns produced.
    pub fn columns(&self) -> Vec<ColumnDef> {
        match self {
            ProjectionKind::Select(columns) => columns.clone(),
            ProjectionKind::Count => vec![ColumnDef::new("count", ColumnType::Long)],
            ProjectionKind::Exists => vec![ColumnDef::new("exists", ColumnType::Boolean)],
            ProjectionKind::Min(c) => vec![ColumnDef::nullable(format!("min({})", c.name), c.ty)],
            ProjectionKind::Max(c) => vec![ColumnDef::nullable(format!("max({})", c.name), c.ty)],
            ProjectionKind::Sum(c) => vec![ColumnDef::nullable(
                format!("sum({})", c.name),
                ColumnType::Double,
            )],
            ProjectionKind::Mean(c) => vec![ColumnDef::nullable(
                format!("mean({})", c.name),
                ColumnType::Double,
            )],
        }
    }

    /// Input columns read.
    pub fn requires(&self) -> Vec<ColumnDef> {
        match self {
            ProjectionKind::Select(columns) => columns.clone(),
            ProjectionKind::Count | ProjectionKind::Exists => Vec::new(),
            ProjectionKind::Min(c)
            | ProjectionKind::Max(c)
            | ProjectionKind::Sum(c)
            | ProjectionKind::Mean(c) => vec![c.clone()],
        }
    }

    pub(crate) fn hash_into<H: Hasher>(&self, state: &mut H) {
        write_str(state, self.name());
        for column in self.requires() {
            write_str(state, &column.name);
        }
    }
}

/// Logical operators.
#[derive(Clone, Debug)]
pub enum LogicalOp {
    /// Reads `fetch` columns of every row.
    EntityScan {
        entity: Arc<dyn TableHandle>,
        fetch: Vec<ColumnDef>,
    },
    /// Reads a random sample of rows.
    EntitySample {
        entity: Arc<dyn TableHandle>,
        fetch: Vec<ColumnDef>,
        probability: f32,
        seed: u64,
    },
    /// Keeps rows matching the predicate.
    Filter { predicate: BooleanPredicate },
    /// Keeps rows matching a predicate that depends on sub-query inputs
    /// (inputs after the first).
    FilterOnSubSelect { predicate: BooleanPredicate },
    /// Appends the result of a function as column `out`.
    Function {
        function: Arc<dyn Function>,
        arguments: Vec<Binding>,
        out: ColumnDef,
    },
    /// Fetches additional columns by row id.
    Fetch {
        entity: Arc<dyn TableHandle>,
        fetch: Vec<ColumnDef>,
    },
    /// Projection or aggregation.
    Projection { kind: ProjectionKind },
    /// Orders rows.
    Sort { order: Vec<(ColumnDef, SortOrder)> },
    /// Skips and limits rows.
    Limit { skip: u64, limit: u64 },
    /// Concatenates inputs, optionally dropping duplicates.
    Union { distinct: bool },
    /// Rows present in every input.
    Intersect,
    /// Inserts one row built from bindings.
    Insert {
        entity: Arc<dyn TableHandle>,
        values: Vec<(ColumnDef, Binding)>,
    },
    /// Updates the input rows.
    Update {
        entity: Arc<dyn TableHandle>,
        values: Vec<(ColumnDef, Binding)>,
    },
    /// Deletes the input rows.
    Delete { entity: Arc<dyn TableHandle> },
}

impl LogicalOp {
    /// Operator name.
    pub fn name(&self) -> &'static str {
        match self {
            LogicalOp::EntityScan { .. } => "EntityScan",
            LogicalOp::EntitySample { .. } => "EntitySample",
            LogicalOp::Filter { .. } => "Filter",
            LogicalOp::FilterOnSubSelect { .. } => "FilterOnSubSelect",
            LogicalOp::Function { .. } => "Function",
            LogicalOp::Fetch { .. } => "Fetch",
            LogicalOp::Projection { .. } => "Projection",
            LogicalOp::Sort { .. } => "Sort",
            LogicalOp::Limit { .. } => "Limit",
            LogicalOp::Union { .. } => "Union",
            LogicalOp::Intersect => "Intersect",
            LogicalOp::Insert { .. } => "Insert",
            LogicalOp::Update { .. } => "Update",
            LogicalOp::Delete { .. } => "Delete",
        }
    }

    /// Default physical counterpart.
    fn implement(&self) -> PhysicalOp {
        match self.clone() {
            LogicalOp::EntityScan { entity, fetch } => PhysicalOp::EntityScan {
                entity,
                fetch,
                partition: 0,
                partitions: 1,
            },
            LogicalOp::EntitySample {
                entity,
                fetch,
                probability,
                seed,
            } => PhysicalOp::EntitySample {
                entity,
                fetch,
                probability,
                seed,
            },
            LogicalOp::Filter { predicate } => PhysicalOp::Filter { predicate },
            LogicalOp::FilterOnSubSelect { predicate } => PhysicalOp::FilterOnSubSelect { predicate },
            LogicalOp::Function {
                function,
                arguments,
                out,
            } => PhysicalOp::Function {
                function,
                arguments,
                out,
            },
            LogicalOp::Fetch { entity, fetch } => PhysicalOp::Fetch { entity, fetch },
            LogicalOp::Projection { kind } => PhysicalOp::Projection { kind },
            LogicalOp::Sort { order } => PhysicalOp::Sort { order },
            LogicalOp::Limit { skip, limit } => PhysicalOp::Limit { skip, limit },
            LogicalOp::Union { distinct } => PhysicalOp::Union { distinct },
            LogicalOp::Intersect => PhysicalOp::Intersect,
            LogicalOp::Insert { entity, values } => PhysicalOp::Insert { entity, values },
            LogicalOp::Update { entity, values } => PhysicalOp::Update { entity, values },
            LogicalOp::Delete { entity } => PhysicalOp::Delete { entity },
        }
    }
}

impl fmt::Display for LogicalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Node of a logical plan tree.
#[derive(Clone, Debug)]
pub struct LogicalNode {
    /// Group the node belongs to.
    pub group_id: GroupId,
    /// Operator.
    pub op: LogicalOp,
    /// Inputs; sub-queries follow the primary input.
    pub inputs: Vec<Arc<LogicalNode>>,
}

impl LogicalNode {
    /// Creates a node.
    pub fn new(group_id: GroupId, op: LogicalOp, inputs: Vec<Arc<LogicalNode>>) -> Self {
        Self {
            group_id,
            op,
            inputs,
        }
    }

    /// Returns a node with the same operator and group over new inputs.
    pub fn with_inputs(&self, inputs: Vec<Arc<LogicalNode>>) -> Self {
        Self {
            group_id: self.group_id,
            op: self.op.clone(),
            inputs,
        }
    }

    /// Converts the tree into its default physical tree.
    pub fn implement(&self) -> PhysicalNode {
        let inputs = self
            .inputs
            .iter()
            .map(|input| Arc::new(input.implement()))
            .collect();
        PhysicalNode::new(self.group_id, self.op.implement(), inputs)
    }

    /// Columns produced by this node.
    pub fn columns(&self) -> Vec<ColumnDef> {
        self.implement_shallow().columns()
    }

    /// Checks arity and that every required column is produced by the inputs.
    pub fn validate(&self) -> Result<(), PlanningError> {
        self.implement().validate()
    }

    /// Checks that every late-bound value of the tree can be resolved.
    pub fn bind(&self, ctx: &BindingContext) -> Result<(), BindingError> {
        self.implement_shallow().bind_local(ctx)?;
        self.inputs.iter().try_for_each(|input| input.bind(ctx))
    }

    /// Structural hash; group ids are not part of it.
    pub fn digest(&self) -> u64 {
        let mut hasher = Xxh64::new(0);
        self.hash_into(&mut hasher);
        hasher.finish()
    }

    pub(crate) fn hash_into<H: Hasher>(&self, state: &mut H) {
        write_str(state, "logical");
        let shallow = self.implement_shallow();
        shallow.op.hash_into(state);
        state.write_usize(self.inputs.len());
        for input in &self.inputs {
            input.hash_into(state);
        }
    }

    /// Deep copy that shares no node with `self`.
    pub fn copy(&self) -> LogicalNode {
        LogicalNode {
            group_id: self.group_id,
            op: self.op.clone(),
            inputs: self.inputs.iter().map(|i| Arc::new(i.copy())).collect(),
        }
    }

    /// Physical node for this operator over already-implemented inputs, used
    /// to share column and binding logic without implementing the subtree
    /// twice.
    fn implement_shallow(&self) -> PhysicalNode {
        let inputs = self
            .inputs
            .iter()
            .map(|input| Arc::new(input.implement()))
            .collect();
        PhysicalNode::new(self.group_id, self.op.implement(), inputs)
    }
}

pub(crate) fn write_str<H: Hasher>(state: &mut H, value: &str) {
    state.write_usize(value.len());
    state.write(value.as_bytes());
}

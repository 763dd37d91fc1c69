//! Fluent logical plan builder.
//!
//! Errors are deferred: the first failing call is remembered, later calls are
//! ignored, and [`LogicalPlanBuilder::build`] reports it.
use std::sync::Arc;

use crate::query::binding::Binding;
use crate::query::catalog::TableHandle;
use crate::query::context::{GroupId, QueryContext};
use crate::query::errors::PlanningError;
use crate::query::logical::{LogicalNode, LogicalOp, ProjectionKind};
use crate::query::predicate::BooleanPredicate;
use crate::query::traits::SortOrder;
use crate::query::value::{ColumnDef, ColumnType};

/// Builds a [`LogicalNode`] tree bottom-up.
pub struct LogicalPlanBuilder<'a> {
    ctx: &'a QueryContext,
    node: Option<Arc<LogicalNode>>,
    error: Option<PlanningError>,
}

impl<'a> LogicalPlanBuilder<'a> {
    /// Creates an empty builder allocating group ids from `ctx`.
    pub fn new(ctx: &'a QueryContext) -> Self {
        Self {
            ctx,
            node: None,
            error: None,
        }
    }

    /// Looks up a column of `entity` by qualified or simple name.
    pub fn column(entity: &dyn TableHandle, name: &str) -> Result<ColumnDef, PlanningError> {
        entity
            .columns()
            .iter()
            .find(|c| c.matches_name(name))
            .cloned()
            .ok_or_else(|| PlanningError::UnknownColumn {
                column: name.to_string(),
                context: format!("entity {}", entity.name()),
            })
    }

    /// Starts with a scan of `columns`; all columns when empty.
    pub fn scan(self, entity: Arc<dyn TableHandle>, columns: &[ColumnDef]) -> Self {
        let fetch = fetch_columns(entity.as_ref(), columns);
        self.source(LogicalOp::EntityScan { entity, fetch })
    }

    /// Starts with a scan of the named columns.
    pub fn scan_named(mut self, entity: Arc<dyn TableHandle>, names: &[&str]) -> Self {
        match names
            .iter()
            .map(|n| Self::column(entity.as_ref(), n))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(columns) => self.scan(entity, &columns),
            Err(err) => {
                self.fail(err);
                self
            }
        }
    }

    /// Starts with a Bernoulli sample keeping each row with `probability`.
    pub fn sample(mut self, entity: Arc<dyn TableHandle>, columns: &[ColumnDef], probability: f32, seed: u64) -> Self {
        if !(probability > 0.0 && probability <= 1.0) {
            self.fail(PlanningError::InvalidPlan(format!(
                "sample probability must be within (0, 1], got {probability}"
            )));
            return self;
        }
        let fetch = fetch_columns(entity.as_ref(), columns);
        self.source(LogicalOp::EntitySample {
            entity,
            fetch,
            probability,
            seed,
        })
    }

    /// Starts with an insert of one row.
    pub fn insert(self, entity: Arc<dyn TableHandle>, values: Vec<(ColumnDef, Binding)>) -> Self {
        self.source(LogicalOp::Insert { entity, values })
    }

    /// Keeps rows matching `predicate`.
    pub fn filter(self, predicate: BooleanPredicate) -> Self {
        self.unary(LogicalOp::Filter { predicate })
    }

    /// Keeps rows matching `predicate`, whose sub-query bindings are produced
    /// by `subqueries`. Use [`LogicalPlanBuilder::group_of`] to reference them.
    pub fn filter_on_subselect(mut self, predicate: BooleanPredicate, subqueries: Vec<LogicalNode>) -> Self {
        if self.error.is_some() {
            return self;
        }
        if subqueries.is_empty() {
            self.fail(PlanningError::InvalidPlan(
                "filter_on_subselect requires at least one sub-query".into(),
            ));
            return self;
        }
        let Some(primary) = self.take_input("FilterOnSubSelect") else {
            return self;
        };
        let group_id = primary.group_id;
        let mut inputs = vec![primary];
        inputs.extend(subqueries.into_iter().map(Arc::new));
        self.node = Some(Arc::new(LogicalNode::new(
            group_id,
            LogicalOp::FilterOnSubSelect { predicate },
            inputs,
        )));
        self
    }

    /// Group id to use in [`Binding::Subquery`] for a sub-query plan.
    pub fn group_of(subquery: &LogicalNode) -> GroupId {
        subquery.group_id
    }

    /// Appends the result of the function `name` as column `out`.
    pub fn function(mut self, name: &str, arguments: Vec<Binding>, out: &str) -> Self {
        if self.error.is_some() {
            return self;
        }
        let types: Option<Vec<ColumnType>> = arguments.iter().map(Binding::ty).collect();
        let resolved = match types {
            Some(types) => self.ctx.functions().resolve(name, &types),
            None => Err(PlanningError::IncompatibleSignature {
                name: name.to_string(),
                args: arguments
                    .iter()
                    .map(|a| a.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        };
        match resolved {
            Ok(function) => {
                let out = ColumnDef::nullable(out, function.signature().returns);
                self.unary(LogicalOp::Function {
                    function,
                    arguments,
                    out,
                })
            }
            Err(err) => {
                self.fail(err);
                self
            }
        }
    }

    /// Fetches additional columns by row id.
    pub fn fetch(self, entity: Arc<dyn TableHandle>, columns: &[ColumnDef]) -> Self {
        self.unary(LogicalOp::Fetch {
            entity,
            fetch: columns.to_vec(),
        })
    }

    /// Keeps `columns` in order.
    pub fn select(self, columns: Vec<ColumnDef>) -> Self {
        self.aggregate(ProjectionKind::Select(columns))
    }

    /// Counts rows.
    pub fn count(self) -> Self {
        self.aggregate(ProjectionKind::Count)
    }

    /// Emits whether any row exists.
    pub fn exists(self) -> Self {
        self.aggregate(ProjectionKind::Exists)
    }

    /// Applies a projection or aggregation.
    pub fn aggregate(self, kind: ProjectionKind) -> Self {
        self.unary(LogicalOp::Projection { kind })
    }

    /// Orders rows.
    pub fn sort(self, order: Vec<(ColumnDef, SortOrder)>) -> Self {
        self.unary(LogicalOp::Sort { order })
    }

    /// Skips `skip` rows and keeps at most `limit`.
    pub fn limit(self, skip: u64, limit: u64) -> Self {
        self.unary(LogicalOp::Limit { skip, limit })
    }

    /// Concatenates with `other`.
    pub fn union(self, other: LogicalNode, distinct: bool) -> Self {
        self.binary(LogicalOp::Union { distinct }, other)
    }

    /// Keeps rows also produced by `other`.
    pub fn intersect(self, other: LogicalNode) -> Self {
        self.binary(LogicalOp::Intersect, other)
    }

    /// Updates the current rows.
    pub fn update(self, entity: Arc<dyn TableHandle>, values: Vec<(ColumnDef, Binding)>) -> Self {
        self.unary(LogicalOp::Update { entity, values })
    }

    /// Deletes the current rows.
    pub fn delete(self, entity: Arc<dyn TableHandle>) -> Self {
        self.unary(LogicalOp::Delete { entity })
    }

    /// Finishes the tree.
    pub fn build(self) -> Result<LogicalNode, PlanningError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let node = self
            .node
            .ok_or_else(|| PlanningError::InvalidPlan("empty plan".into()))?;
        Ok(Arc::try_unwrap(node).unwrap_or_else(|shared| (*shared).clone()))
    }

    fn source(mut self, op: LogicalOp) -> Self {
        if self.error.is_some() {
            return self;
        }
        if self.node.is_some() {
            self.fail(PlanningError::InvalidPlan(format!(
                "{} must be the first operator",
                op.name()
            )));
            return self;
        }
        let group_id = self.ctx.next_group_id();
        self.node = Some(Arc::new(LogicalNode::new(group_id, op, Vec::new())));
        self
    }

    fn unary(mut self, op: LogicalOp) -> Self {
        if self.error.is_some() {
            return self;
        }
        let Some(input) = self.take_input(op.name()) else {
            return self;
        };
        self.node = Some(Arc::new(LogicalNode::new(input.group_id, op, vec![input])));
        self
    }

    fn binary(mut self, op: LogicalOp, other: LogicalNode) -> Self {
        if self.error.is_some() {
            return self;
        }
        let Some(input) = self.take_input(op.name()) else {
            return self;
        };
        self.node = Some(Arc::new(LogicalNode::new(
            input.group_id,
            op,
            vec![input, Arc::new(other)],
        )));
        self
    }

    fn take_input(&mut self, op: &str) -> Option<Arc<LogicalNode>> {
        let input = self.node.take();
        if input.is_none() {
            self.fail(PlanningError::InvalidPlan(format!("{op} requires an input")));
        }
        input
    }

    fn fail(&mut self, err: PlanningError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }
}

fn fetch_columns(entity: &dyn TableHandle, columns: &[ColumnDef]) -> Vec<ColumnDef> {
    if columns.is_empty() {
        entity.columns().to_vec()
    } else {
        columns.to_vec()
    }
}

//! Single-input operators: filters, functions, fetches, limits and
//! projections.
use std::cmp::Ordering;
use std::sync::Arc;

use crate::query::binding::{Binding, SharedBindings};
use crate::query::catalog::TableHandle;
use crate::query::errors::ExecutionError;
use crate::query::function::Function;
use crate::query::logical::ProjectionKind;
use crate::query::operators::{BoxTupleStream, TupleStream};
use crate::query::predicate::BooleanPredicate;
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::query::value::{ColumnDef, Columns, Tuple, Value, SYNTHETIC_ROW_ID};

pub(super) struct FilterStream {
    input: BoxTupleStream,
    predicate: BooleanPredicate,
    bindings: SharedBindings,
}

impl FilterStream {
    pub(super) fn new(input: BoxTupleStream, predicate: BooleanPredicate, bindings: SharedBindings) -> Self {
        Self {
            input,
            predicate,
            bindings,
        }
    }
}

impl TupleStream for FilterStream {
    fn try_next(&mut self) -> Result<Option<Tuple>, ExecutionError> {
        while let Some(tuple) = self.input.try_next()? {
            let timer = profile_timer();
            let keep = self.predicate.is_match(&self.bindings.read(), &tuple)?;
            record_profile_timer(QueryProfileKind::Filter, timer);
            if keep {
                return Ok(Some(tuple));
            }
        }
        Ok(None)
    }
}

pub(super) struct FunctionStream {
    input: BoxTupleStream,
    function: Arc<dyn Function>,
    arguments: Vec<Binding>,
    bindings: SharedBindings,
    columns: Columns,
}

impl FunctionStream {
    pub(super) fn new(
        input: BoxTupleStream,
        function: Arc<dyn Function>,
        arguments: Vec<Binding>,
        bindings: SharedBindings,
        columns: Columns,
    ) -> Self {
        Self {
            input,
            function,
            arguments,
            bindings,
            columns,
        }
    }
}

impl TupleStream for FunctionStream {
    fn try_next(&mut self) -> Result<Option<Tuple>, ExecutionError> {
        let Some(tuple) = self.input.try_next()? else {
            return Ok(None);
        };
        let args = {
            let bindings = self.bindings.read();
            self.arguments
                .iter()
                .map(|arg| bindings.resolve(arg, Some(&tuple)))
                .collect::<Result<Vec<_>, _>>()?
        };
        let value = self.function.invoke(&args)?;
        Ok(Some(tuple.extend(Arc::clone(&self.columns), value)))
    }
}

/// Reads missing columns by row id. Rows deleted since they were produced
/// upstream are dropped.
pub(super) struct FetchStream {
    input: BoxTupleStream,
    entity: Arc<dyn TableHandle>,
    fetch: Vec<ColumnDef>,
    columns: Columns,
}

impl FetchStream {
    pub(super) fn new(
        input: BoxTupleStream,
        entity: Arc<dyn TableHandle>,
        fetch: Vec<ColumnDef>,
        columns: Columns,
    ) -> Self {
        Self {
            input,
            entity,
            fetch,
            columns,
        }
    }
}

impl TupleStream for FetchStream {
    fn try_next(&mut self) -> Result<Option<Tuple>, ExecutionError> {
        while let Some(tuple) = self.input.try_next()? {
            let missing: Vec<ColumnDef> = self
                .fetch
                .iter()
                .filter(|c| tuple.get(c).is_none())
                .cloned()
                .collect();
            if missing.is_empty() {
                return Ok(Some(tuple.project(&self.columns)));
            }
            let Some(fetched) = self.entity.read(tuple.row_id, &missing)? else {
                continue;
            };
            let values = self
                .columns
                .iter()
                .map(|c| {
                    tuple
                        .get(c)
                        .or_else(|| fetched.get(c))
                        .cloned()
                        .unwrap_or(Value::Null)
                })
                .collect();
            return Ok(Some(Tuple::new(tuple.row_id, Arc::clone(&self.columns), values)));
        }
        Ok(None)
    }
}

pub(super) struct LimitStream {
    input: BoxTupleStream,
    skip: u64,
    remaining: u64,
}

impl LimitStream {
    pub(super) fn new(input: BoxTupleStream, skip: u64, limit: u64) -> Self {
        Self {
            input,
            skip,
            remaining: limit,
        }
    }
}

impl TupleStream for LimitStream {
    fn try_next(&mut self) -> Result<Option<Tuple>, ExecutionError> {
        while self.skip > 0 {
            if self.input.try_next()?.is_none() {
                self.skip = 0;
                self.remaining = 0;
                return Ok(None);
            }
            self.skip -= 1;
        }
        if self.remaining == 0 {
            return Ok(None);
        }
        let next = self.input.try_next()?;
        if next.is_some() {
            self.remaining -= 1;
        } else {
            self.remaining = 0;
        }
        Ok(next)
    }
}

/// Stream for a projection: a per-tuple select, or a single-row aggregate.
pub(super) fn projection(input: BoxTupleStream, kind: ProjectionKind, columns: Columns) -> BoxTupleStream {
    match kind {
        ProjectionKind::Select(_) => Box::new(SelectStream { input, columns }),
        kind => Box::new(AggregateStream {
            input: Some(input),
            kind,
            columns,
        }),
    }
}

struct SelectStream {
    input: BoxTupleStream,
    columns: Columns,
}

impl TupleStream for SelectStream {
    fn try_next(&mut self) -> Result<Option<Tuple>, ExecutionError> {
        Ok(self.input.try_next()?.map(|t| t.project(&self.columns)))
    }
}

struct AggregateStream {
    input: Option<BoxTupleStream>,
    kind: ProjectionKind,
    columns: Columns,
}

impl AggregateStream {
    fn aggregate(&self, input: &mut BoxTupleStream) -> Result<Value, ExecutionError> {
        match &self.kind {
            ProjectionKind::Count => {
                let mut count = 0i64;
                while input.try_next()?.is_some() {
                    count += 1;
                }
                Ok(Value::Long(count))
            }
            ProjectionKind::Exists => Ok(Value::Bool(input.try_next()?.is_some())),
            ProjectionKind::Min(column) => extremum(input, column, Ordering::Less),
            ProjectionKind::Max(column) => extremum(input, column, Ordering::Greater),
            ProjectionKind::Sum(column) => {
                Ok(sum(input, column)?.map_or(Value::Null, |(sum, _)| Value::Double(sum)))
            }
            ProjectionKind::Mean(column) => Ok(sum(input, column)?
                .map_or(Value::Null, |(sum, n)| Value::Double(sum / n as f64))),
            ProjectionKind::Select(_) => Err(ExecutionError::Storage(
                "select is not an aggregate".into(),
            )),
        }
    }
}

impl TupleStream for AggregateStream {
    fn try_next(&mut self) -> Result<Option<Tuple>, ExecutionError> {
        let Some(mut input) = self.input.take() else {
            return Ok(None);
        };
        let value = self.aggregate(&mut input)?;
        Ok(Some(Tuple::new(
            SYNTHETIC_ROW_ID,
            Arc::clone(&self.columns),
            vec![value],
        )))
    }
}

fn extremum(input: &mut BoxTupleStream, column: &ColumnDef, keep: Ordering) -> Result<Value, ExecutionError> {
    let mut best = Value::Null;
    while let Some(tuple) = input.try_next()? {
        let Some(value) = tuple.get(column).filter(|v| !v.is_null()) else {
            continue;
        };
        if best.is_null() || value.sort_cmp(&best) == keep {
            best = value.clone();
        }
    }
    Ok(best)
}

/// Sum and number of non-null values, `None` when there were none.
fn sum(input: &mut BoxTupleStream, column: &ColumnDef) -> Result<Option<(f64, u64)>, ExecutionError> {
    let mut total = 0.0;
    let mut n = 0u64;
    while let Some(tuple) = input.try_next()? {
        let Some(value) = tuple.get(column).filter(|v| !v.is_null()) else {
            continue;
        };
        let number = value.as_f64().ok_or(ExecutionError::TypeMismatch {
            context: "sum",
            expected: "number",
            found: value.type_name(),
        })?;
        total += number;
        n += 1;
    }
    Ok((n > 0).then_some((total, n)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::operators::test_support::{drain, VecStream};
    use crate::query::value::ColumnType;

    fn tuples(values: &[Option<i64>]) -> (ColumnDef, Vec<Tuple>) {
        let column = ColumnDef::nullable("t.n", ColumnType::Long);
        let columns: Columns = vec![column.clone()].into();
        let tuples = values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                Tuple::new(
                    i as i64,
                    Arc::clone(&columns),
                    vec![v.map_or(Value::Null, Value::Long)],
                )
            })
            .collect();
        (column, tuples)
    }

    fn aggregate(kind: ProjectionKind, tuples: Vec<Tuple>) -> Value {
        let columns: Columns = kind.columns().into();
        let mut stream = projection(VecStream::boxed(tuples), kind, columns);
        let out = drain(stream.as_mut());
        assert_eq!(out.len(), 1);
        out[0].values()[0].clone()
    }

    #[test]
    fn aggregates_skip_nulls() {
        let (n, rows) = tuples(&[Some(4), None, Some(-2), Some(7)]);
        assert_eq!(aggregate(ProjectionKind::Count, rows.clone()), Value::Long(4));
        assert_eq!(aggregate(ProjectionKind::Min(n.clone()), rows.clone()), Value::Long(-2));
        assert_eq!(aggregate(ProjectionKind::Max(n.clone()), rows.clone()), Value::Long(7));
        assert_eq!(aggregate(ProjectionKind::Sum(n.clone()), rows.clone()), Value::Double(9.0));
        assert_eq!(aggregate(ProjectionKind::Mean(n), rows), Value::Double(3.0));
    }

    #[test]
    fn aggregates_over_empty_input() {
        let (n, _) = tuples(&[]);
        assert_eq!(aggregate(ProjectionKind::Count, vec![]), Value::Long(0));
        assert_eq!(aggregate(ProjectionKind::Exists, vec![]), Value::Bool(false));
        assert_eq!(aggregate(ProjectionKind::Mean(n), vec![]), Value::Null);
    }

    #[test]
    fn limit_skips_then_stops() {
        let (_, rows) = tuples(&[Some(1), Some(2), Some(3), Some(4)]);
        let mut stream = LimitStream::new(VecStream::boxed(rows), 1, 2);
        let ids: Vec<i64> = drain(&mut stream).iter().map(|t| t.row_id).collect();
        assert_eq!(ids, vec![1, 2]);
        let (_, rows) = tuples(&[Some(1)]);
        let mut stream = LimitStream::new(VecStream::boxed(rows), 3, 2);
        assert!(drain(&mut stream).is_empty());
    }
}

//! Operators with two or more inputs.
use std::sync::Arc;

use rustc_hash::FxHashSet;
use tracing::trace;

use crate::query::binding::{Binding, SharedBindings};
use crate::query::context::GroupId;
use crate::query::errors::ExecutionError;
use crate::query::operators::{BoxTupleStream, TupleStream};
use crate::query::predicate::BooleanPredicate;
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::query::value::{ColumnDef, Columns, Tuple, ValueKey};

fn align(tuple: Tuple, columns: &Columns) -> Tuple {
    if Arc::ptr_eq(tuple.columns(), columns) || tuple.columns()[..] == columns[..] {
        tuple
    } else {
        tuple.project(columns)
    }
}

fn key(tuple: &Tuple) -> ValueKey {
    ValueKey(tuple.values().to_vec())
}

/// Drains inputs one after another; used for partition merges and unions.
pub(super) struct ConcatStream {
    inputs: Vec<BoxTupleStream>,
    current: usize,
    seen: Option<FxHashSet<ValueKey>>,
    columns: Columns,
}

impl ConcatStream {
    pub(super) fn new(inputs: Vec<BoxTupleStream>, distinct: bool, columns: Columns) -> Self {
        Self {
            inputs,
            current: 0,
            seen: distinct.then(FxHashSet::default),
            columns,
        }
    }
}

impl TupleStream for ConcatStream {
    fn try_next(&mut self) -> Result<Option<Tuple>, ExecutionError> {
        while self.current < self.inputs.len() {
            let Some(tuple) = self.inputs[self.current].try_next()? else {
                self.current += 1;
                continue;
            };
            let tuple = align(tuple, &self.columns);
            if let Some(seen) = self.seen.as_mut() {
                if !seen.insert(key(&tuple)) {
                    continue;
                }
            }
            return Ok(Some(tuple));
        }
        Ok(None)
    }
}

/// Emits distinct tuples of the first input present in every other input.
pub(super) struct IntersectStream {
    inputs: Vec<BoxTupleStream>,
    others: Option<Vec<FxHashSet<ValueKey>>>,
    emitted: FxHashSet<ValueKey>,
    columns: Columns,
}

impl IntersectStream {
    pub(super) fn new(inputs: Vec<BoxTupleStream>, columns: Columns) -> Self {
        Self {
            inputs,
            others: None,
            emitted: FxHashSet::default(),
            columns,
        }
    }

    fn materialise(&mut self) -> Result<Vec<FxHashSet<ValueKey>>, ExecutionError> {
        let mut sets = Vec::with_capacity(self.inputs.len().saturating_sub(1));
        for input in self.inputs.iter_mut().skip(1) {
            let mut set = FxHashSet::default();
            while let Some(tuple) = input.try_next()? {
                set.insert(key(&align(tuple, &self.columns)));
            }
            sets.push(set);
        }
        Ok(sets)
    }
}

impl TupleStream for IntersectStream {
    fn try_next(&mut self) -> Result<Option<Tuple>, ExecutionError> {
        if self.others.is_none() {
            self.others = Some(self.materialise()?);
        }
        let Some(primary) = self.inputs.first_mut() else {
            return Ok(None);
        };
        while let Some(tuple) = primary.try_next()? {
            let tuple = align(tuple, &self.columns);
            let key = key(&tuple);
            let in_all = self
                .others
                .as_ref()
                .is_some_and(|sets| sets.iter().all(|set| set.contains(&key)));
            if in_all && self.emitted.insert(key) {
                return Ok(Some(tuple));
            }
        }
        Ok(None)
    }
}

/// Filters the first input with a predicate reading sub-query results.
///
/// Every sub-query input is drained into the binding context before the
/// first primary tuple is pulled.
pub(super) struct SubSelectFilterStream {
    inputs: Vec<BoxTupleStream>,
    groups: Vec<GroupId>,
    predicate: BooleanPredicate,
    bindings: SharedBindings,
    ready: bool,
}

impl SubSelectFilterStream {
    pub(super) fn new(
        inputs: Vec<BoxTupleStream>,
        groups: Vec<GroupId>,
        predicate: BooleanPredicate,
        bindings: SharedBindings,
    ) -> Self {
        Self {
            inputs,
            groups,
            predicate,
            bindings,
            ready: false,
        }
    }

    fn column_of(&self, group: GroupId) -> Option<ColumnDef> {
        self.predicate.subqueries().into_iter().find_map(|b| match b {
            Binding::Subquery { group: g, column } if *g == group => Some(column.clone()),
            _ => None,
        })
    }

    fn drain_subqueries(&mut self) -> Result<(), ExecutionError> {
        for (position, group) in self.groups.clone().into_iter().enumerate() {
            let column = self.column_of(group);
            self.bindings.write().open_subquery(group);
            let input = &mut self.inputs[position + 1];
            let mut values = 0usize;
            while let Some(tuple) = input.try_next()? {
                let value = match &column {
                    Some(column) => tuple.get(column).cloned(),
                    None => tuple.values().first().cloned(),
                };
                if let Some(value) = value {
                    self.bindings.write().append(group, value);
                    values += 1;
                }
            }
            trace!(group, values, "executor.subquery.bound");
        }
        Ok(())
    }
}

impl TupleStream for SubSelectFilterStream {
    fn try_next(&mut self) -> Result<Option<Tuple>, ExecutionError> {
        if !self.ready {
            self.drain_subqueries()?;
            self.ready = true;
        }
        let Some(primary) = self.inputs.first_mut() else {
            return Ok(None);
        };
        while let Some(tuple) = primary.try_next()? {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::binding::BindingContext;
    use crate::query::operators::test_support::{drain, VecStream};
    use crate::query::predicate::ComparisonOperator;
    use crate::query::value::{ColumnType, Value};

    fn rows(column: &ColumnDef, values: &[i64]) -> Vec<Tuple> {
        let columns: Columns = vec![column.clone()].into();
        values
            .iter()
            .map(|v| Tuple::new(*v, Arc::clone(&columns), vec![Value::Long(*v)]))
            .collect()
    }

    #[test]
    fn distinct_union_drops_duplicates() {
        let n = ColumnDef::new("t.n", ColumnType::Long);
        let columns: Columns = vec![n.clone()].into();
        let mut stream = ConcatStream::new(
            vec![
                VecStream::boxed(rows(&n, &[1, 2, 2])),
                VecStream::boxed(rows(&n, &[2, 3])),
            ],
            true,
            columns,
        );
        let ids: Vec<i64> = drain(&mut stream).iter().map(|t| t.row_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn intersect_keeps_common_rows_once() {
        let n = ColumnDef::new("t.n", ColumnType::Long);
        let columns: Columns = vec![n.clone()].into();
        let mut stream = IntersectStream::new(
            vec![
                VecStream::boxed(rows(&n, &[1, 2, 2, 3, 4])),
                VecStream::boxed(rows(&n, &[4, 2, 9])),
            ],
            columns,
        );
        let ids: Vec<i64> = drain(&mut stream).iter().map(|t| t.row_id).collect();
        assert_eq!(ids, vec![2, 4]);
    }

    #[test]
    fn subquery_values_bind_before_filtering() {
        let n = ColumnDef::new("t.n", ColumnType::Long);
        let m = ColumnDef::new("s.m", ColumnType::Long);
        let predicate = BooleanPredicate::comparison(ComparisonOperator::In {
            value: Binding::Column(n.clone()),
            list: vec![Binding::Subquery {
                group: 5,
                column: m.clone(),
            }],
        });
        let bindings = BindingContext::new().shared();
        let mut stream = SubSelectFilterStream::new(
            vec![
                VecStream::boxed(rows(&n, &[1, 2, 3, 4])),
                VecStream::boxed(rows(&m, &[4, 2])),
            ],
            vec![5],
            predicate,
            Arc::clone(&bindings),
        );
        let ids: Vec<i64> = drain(&mut stream).iter().map(|t| t.row_id).collect();
        assert_eq!(ids, vec![2, 4]);
        assert_eq!(
            bindings.read().subquery(5).expect("bound"),
            &[Value::Long(4), Value::Long(2)]
        );
    }
}

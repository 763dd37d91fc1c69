//! DML sinks. They emit no tuples; affected rows are added to the
//! execution's counter.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::query::binding::{Binding, SharedBindings};
use crate::query::catalog::TableHandle;
use crate::query::errors::ExecutionError;
use crate::query::operators::{BoxTupleStream, TupleStream};
use crate::query::value::{ColumnDef, Tuple};

fn split(values: Vec<(ColumnDef, Binding)>) -> (Vec<ColumnDef>, Vec<Binding>) {
    values.into_iter().unzip()
}

pub(super) struct InsertSink {
    entity: Arc<dyn TableHandle>,
    columns: Vec<ColumnDef>,
    values: Vec<Binding>,
    bindings: SharedBindings,
    affected: Arc<AtomicU64>,
    done: bool,
}

impl InsertSink {
    pub(super) fn new(
        entity: Arc<dyn TableHandle>,
        values: Vec<(ColumnDef, Binding)>,
        bindings: SharedBindings,
        affected: Arc<AtomicU64>,
    ) -> Self {
        let (columns, values) = split(values);
        Self {
            entity,
            columns,
            values,
            bindings,
            affected,
            done: false,
        }
    }
}

impl TupleStream for InsertSink {
    fn try_next(&mut self) -> Result<Option<Tuple>, ExecutionError> {
        if std::mem::replace(&mut self.done, true) {
            return Ok(None);
        }
        let values = {
            let bindings = self.bindings.read();
            self.values
                .iter()
                .map(|b| bindings.resolve(b, None))
                .collect::<Result<Vec<_>, _>>()?
        };
        let row_id = self.entity.insert(&self.columns, values)?;
        self.affected.fetch_add(1, Ordering::SeqCst);
        debug!(entity = self.entity.name(), row_id, "executor.sink.inserted");
        Ok(None)
    }
}

pub(super) struct UpdateSink {
    input: BoxTupleStream,
    entity: Arc<dyn TableHandle>,
    columns: Vec<ColumnDef>,
    values: Vec<Binding>,
    bindings: SharedBindings,
    affected: Arc<AtomicU64>,
}

impl UpdateSink {
    pub(super) fn new(
        input: BoxTupleStream,
        entity: Arc<dyn TableHandle>,
        values: Vec<(ColumnDef, Binding)>,
        bindings: SharedBindings,
        affected: Arc<AtomicU64>,
    ) -> Self {
        let (columns, values) = split(values);
        Self {
            input,
            entity,
            columns,
            values,
            bindings,
            affected,
        }
    }
}

impl TupleStream for UpdateSink {
    fn try_next(&mut self) -> Result<Option<Tuple>, ExecutionError> {
        let mut rows = 0u64;
        while let Some(tuple) = self.input.try_next()? {
            let values = {
                let bindings = self.bindings.read();
                self.values
                    .iter()
                    .map(|b| bindings.resolve(b, Some(&tuple)))
                    .collect::<Result<Vec<_>, _>>()?
            };
            self.entity.update(tuple.row_id, &self.columns, values)?;
            self.affected.fetch_add(1, Ordering::SeqCst);
            rows += 1;
        }
        if rows > 0 {
            debug!(entity = self.entity.name(), rows, "executor.sink.updated");
        }
        Ok(None)
    }
}

pub(super) struct DeleteSink {
    input: BoxTupleStream,
    entity: Arc<dyn TableHandle>,
    affected: Arc<AtomicU64>,
}

impl DeleteSink {
    pub(super) fn new(input: BoxTupleStream, entity: Arc<dyn TableHandle>, affected: Arc<AtomicU64>) -> Self {
        Self {
            input,
            entity,
            affected,
        }
    }
}

impl TupleStream for DeleteSink {
    fn try_next(&mut self) -> Result<Option<Tuple>, ExecutionError> {
        let mut rows = 0u64;
        while let Some(tuple) = self.input.try_next()? {
            if self.entity.delete(tuple.row_id)? {
                self.affected.fetch_add(1, Ordering::SeqCst);
                rows += 1;
            }
        }
        if rows > 0 {
            debug!(entity = self.entity.name(), rows, "executor.sink.deleted");
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::binding::BindingContext;
    use crate::query::catalog::MemoryTable;
    use crate::query::value::{ColumnType, Value};

    #[test]
    fn insert_runs_once() {
        let id = ColumnDef::new("t.id", ColumnType::Long);
        let table = Arc::new(MemoryTable::new("t", vec![id.clone()]));
        let mut bindings = BindingContext::new();
        let value = bindings.bind(7i64);
        let affected = Arc::new(AtomicU64::new(0));
        let mut sink = InsertSink::new(
            Arc::clone(&table) as Arc<dyn TableHandle>,
            vec![(id.clone(), value)],
            bindings.shared(),
            Arc::clone(&affected),
        );
        assert!(sink.try_next().expect("insert").is_none());
        assert!(sink.try_next().expect("second pull").is_none());
        assert_eq!(affected.load(Ordering::SeqCst), 1);
        let row = table.read(0, &[id]).expect("read").expect("row");
        assert_eq!(row.values(), &[Value::Long(7)]);
    }
}

//! Source operators: scans, samples and metadata counts.
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::query::catalog::{BoxCursor, TableHandle};
use crate::query::errors::ExecutionError;
use crate::query::executor::CancelScope;
use crate::query::operators::TupleStream;
use crate::query::value::{Columns, Tuple, Value, SYNTHETIC_ROW_ID};

/// Pulls tuples from a storage or index cursor.
pub(super) struct ScanStream {
    cursor: BoxCursor,
    cancel: CancelScope,
}

impl ScanStream {
    pub(super) fn new(cursor: BoxCursor, cancel: CancelScope) -> Self {
        Self { cursor, cancel }
    }
}

impl TupleStream for ScanStream {
    fn try_next(&mut self) -> Result<Option<Tuple>, ExecutionError> {
        self.cancel.check()?;
        self.cursor.try_next()
    }
}

/// Bernoulli sample: keeps each scanned row with a fixed probability.
pub(super) struct SampleStream {
    cursor: BoxCursor,
    probability: f32,
    rng: StdRng,
    cancel: CancelScope,
}

impl SampleStream {
    pub(super) fn new(cursor: BoxCursor, probability: f32, seed: u64, cancel: CancelScope) -> Self {
        Self {
            cursor,
            probability,
            rng: StdRng::seed_from_u64(seed),
            cancel,
        }
    }
}

impl TupleStream for SampleStream {
    fn try_next(&mut self) -> Result<Option<Tuple>, ExecutionError> {
        loop {
            self.cancel.check()?;
            let Some(tuple) = self.cursor.try_next()? else {
                return Ok(None);
            };
            if self.rng.gen::<f32>() < self.probability {
                return Ok(Some(tuple));
            }
        }
    }
}

/// Emits the entity's row count as a single tuple.
pub(super) struct CountStream {
    entity: Option<Arc<dyn TableHandle>>,
    columns: Columns,
    cancel: CancelScope,
}

impl CountStream {
    pub(super) fn new(entity: Arc<dyn TableHandle>, columns: Columns, cancel: CancelScope) -> Self {
        Self {
            entity: Some(entity),
            columns,
            cancel,
        }
    }
}

impl TupleStream for CountStream {
    fn try_next(&mut self) -> Result<Option<Tuple>, ExecutionError> {
        self.cancel.check()?;
        let Some(entity) = self.entity.take() else {
            return Ok(None);
        };
        let rows = entity.count_rows()?;
        Ok(Some(Tuple::new(
            SYNTHETIC_ROW_ID,
            Arc::clone(&self.columns),
            vec![Value::Long(rows as i64)],
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::catalog::MemoryTable;
    use crate::query::operators::test_support::drain;
    use crate::query::value::{ColumnDef, ColumnType};

    fn table(rows: i64) -> Arc<MemoryTable> {
        let table = Arc::new(MemoryTable::new(
            "t",
            vec![ColumnDef::new("t.id", ColumnType::Long)],
        ));
        for i in 0..rows {
            table.push(vec![Value::Long(i)]).expect("insert");
        }
        table
    }

    #[test]
    fn samples_are_reproducible_per_seed() {
        let table = table(500);
        let columns = table.columns().to_vec();
        let run = |seed| {
            let mut stream = SampleStream::new(
                table.scan(&columns, 0, 1).expect("scan"),
                0.2,
                seed,
                CancelScope::default(),
            );
            drain(&mut stream).into_iter().map(|t| t.row_id).collect::<Vec<_>>()
        };
        let first = run(7);
        assert_eq!(first, run(7));
        assert!(first.len() > 50 && first.len() < 150, "{}", first.len());
    }

    #[test]
    fn cancelled_scans_stop() {
        let table = table(10);
        let cancel = CancelScope::default();
        let mut stream = ScanStream::new(
            table.scan(table.columns(), 0, 1).expect("scan"),
            cancel.clone(),
        );
        assert!(stream.try_next().expect("first").is_some());
        cancel.cancel();
        assert!(stream.try_next().expect_err("cancelled").is_cancelled());
    }

    #[test]
    fn count_emits_once() {
        let table = table(42);
        let columns: Columns = vec![ColumnDef::new("count", ColumnType::Long)].into();
        let mut stream = CountStream::new(table, columns, CancelScope::default());
        let tuples = drain(&mut stream);
        assert_eq!(tuples.len(), 1);
        assert_eq!(tuples[0].values(), &[Value::Long(42)]);
    }
}

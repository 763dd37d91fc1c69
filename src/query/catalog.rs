//! Collaborator contracts for entities and indexes, plus simple in-memory
//! implementations used for tests or prototyping.
//!
//! A handle is assumed to be bound to the caller's transaction; isolation is
//! the storage layer's concern.
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::query::binding::{Binding, BindingContext};
use crate::query::cost::Cost;
use crate::query::errors::ExecutionError;
use crate::query::predicate::{BooleanPredicate, ComparisonOperator};
use crate::query::statistics::{ColumnStatistics, ValueStatistics};
use crate::query::value::{ColumnDef, Columns, RowId, Tuple, Value, ValueKey};

/// Fallible pull iterator over tuples produced by a collaborator.
pub trait Cursor: Send {
    /// Next tuple, `None` once exhausted.
    fn try_next(&mut self) -> Result<Option<Tuple>, ExecutionError>;
}

/// Owned cursor.
pub type BoxCursor = Box<dyn Cursor>;

/// Cursor over pre-materialized tuples.
pub struct VecCursor {
    tuples: std::vec::IntoIter<Tuple>,
}

impl VecCursor {
    /// Wraps `tuples`.
    pub fn new(tuples: Vec<Tuple>) -> Self {
        Self {
            tuples: tuples.into_iter(),
        }
    }
}

impl Cursor for VecCursor {
    fn try_next(&mut self) -> Result<Option<Tuple>, ExecutionError> {
        Ok(self.tuples.next())
    }
}

/// Transactional access to one entity (table).
pub trait TableHandle: Send + Sync + fmt::Debug {
    /// Entity name.
    fn name(&self) -> &str;

    /// Columns of the entity.
    fn columns(&self) -> &[ColumnDef];

    /// Number of rows, answered from metadata.
    fn count_rows(&self) -> Result<u64, ExecutionError>;

    /// Scans partition `partition` of `partitions`, projecting `columns`.
    fn scan(
        &self,
        columns: &[ColumnDef],
        partition: usize,
        partitions: usize,
    ) -> Result<BoxCursor, ExecutionError>;

    /// Reads one row by id; `None` if it does not exist.
    fn read(&self, row_id: RowId, columns: &[ColumnDef]) -> Result<Option<Tuple>, ExecutionError>;

    /// Inserts a row; unspecified columns are null.
    fn insert(&self, columns: &[ColumnDef], values: Vec<Value>) -> Result<RowId, ExecutionError>;

    /// Overwrites `columns` of an existing row.
    fn update(&self, row_id: RowId, columns: &[ColumnDef], values: Vec<Value>) -> Result<(), ExecutionError>;

    /// Deletes a row, returning whether it existed.
    fn delete(&self, row_id: RowId) -> Result<bool, ExecutionError>;

    /// Value statistics of `column`.
    fn statistics(&self, column: &ColumnDef) -> Option<Arc<dyn ValueStatistics>>;

    /// Secondary indexes available on the entity.
    fn indexes(&self) -> Vec<Arc<dyn IndexHandle>> {
        Vec::new()
    }
}

/// Contract a secondary index exposes to the planner.
pub trait IndexHandle: Send + Sync + fmt::Debug {
    /// Index name.
    fn name(&self) -> &str;

    /// Columns carried by the tuples the index produces.
    fn columns(&self) -> &[ColumnDef];

    /// Returns `true` when [`IndexHandle::filter`] can answer `predicate`.
    fn can_process(&self, predicate: &BooleanPredicate) -> bool;

    /// Estimated cost of answering `predicate`.
    fn cost(&self, predicate: &BooleanPredicate, ctx: &BindingContext) -> Cost;

    /// Expected number of matches for `predicate`.
    fn estimate_matches(&self, predicate: &BooleanPredicate, ctx: &BindingContext) -> u64;

    /// Produces the candidate tuples matching `predicate`.
    fn filter(&self, predicate: &BooleanPredicate, ctx: &BindingContext) -> Result<BoxCursor, ExecutionError>;
}

type RowMap = Arc<RwLock<BTreeMap<RowId, Vec<Value>>>>;

/// Entity kept in memory.
#[derive(Debug)]
pub struct MemoryTable {
    name: String,
    columns: Vec<ColumnDef>,
    rows: RowMap,
    next_id: AtomicI64,
    indexes: RwLock<Vec<Arc<MemoryHashIndex>>>,
    reads: Arc<AtomicU64>,
    read_delay: Option<Duration>,
}

impl MemoryTable {
    /// Creates an empty entity.
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self {
            name: name.into(),
            columns,
            rows: Arc::new(RwLock::new(BTreeMap::new())),
            next_id: AtomicI64::new(0),
            indexes: RwLock::new(Vec::new()),
            reads: Arc::new(AtomicU64::new(0)),
            read_delay: None,
        }
    }

    /// Throttles every row read by `delay`, emulating slow storage.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    /// Inserts a full row in column order.
    pub fn push(&self, values: Vec<Value>) -> Result<RowId, ExecutionError> {
        let columns = self.columns.clone();
        self.insert(&columns, values)
    }

    /// Number of rows read by scans and point reads so far.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Builds a hash index over `column` and keeps it maintained.
    pub fn create_hash_index(&self, column: &ColumnDef) -> Result<Arc<MemoryHashIndex>, ExecutionError> {
        let position = self.position(column)?;
        let index = Arc::new(MemoryHashIndex::new(
            format!("{}.idx_{}", self.name, column.simple_name()),
            column.clone(),
        ));
        for (row_id, values) in self.rows.read().iter() {
            index.add(&values[position], *row_id);
        }
        self.indexes.write().push(Arc::clone(&index));
        Ok(index)
    }

    fn position(&self, column: &ColumnDef) -> Result<usize, ExecutionError> {
        self.columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| {
                ExecutionError::Storage(format!("entity {} has no column {}", self.name, column.name))
            })
    }

    fn positions(&self, columns: &[ColumnDef]) -> Result<Vec<usize>, ExecutionError> {
        columns.iter().map(|c| self.position(c)).collect()
    }

    fn check_value(&self, column: &ColumnDef, value: &Value) -> Result<(), ExecutionError> {
        if value.is_null() && !column.nullable {
            return Err(ExecutionError::Storage(format!(
                "column {} is not nullable",
                column.name
            )));
        }
        if !column.ty.accepts(value) {
            return Err(ExecutionError::Storage(format!(
                "column {} of type {} cannot store {}",
                column.name,
                column.ty,
                value.type_name()
            )));
        }
        Ok(())
    }

    fn index_position(&self, index: &MemoryHashIndex) -> Option<usize> {
        self.columns.iter().position(|c| *c == index.column)
    }
}

impl TableHandle for MemoryTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    fn count_rows(&self) -> Result<u64, ExecutionError> {
        Ok(self.rows.read().len() as u64)
    }

    fn scan(
        &self,
        columns: &[ColumnDef],
        partition: usize,
        partitions: usize,
    ) -> Result<BoxCursor, ExecutionError> {
        if partitions == 0 || partition >= partitions {
            return Err(ExecutionError::Storage(format!(
                "invalid partition {partition} of {partitions}"
            )));
        }
        Ok(Box::new(MemoryScanCursor {
            rows: Arc::clone(&self.rows),
            positions: self.positions(columns)?,
            columns: columns.to_vec().into(),
            after: None,
            partition: partition as i64,
            partitions: partitions as i64,
            reads: Arc::clone(&self.reads),
            delay: self.read_delay,
        }))
    }

    fn read(&self, row_id: RowId, columns: &[ColumnDef]) -> Result<Option<Tuple>, ExecutionError> {
        let positions = self.positions(columns)?;
        if let Some(delay) = self.read_delay {
            std::thread::sleep(delay);
        }
        let rows = self.rows.read();
        let Some(values) = rows.get(&row_id) else {
            return Ok(None);
        };
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Tuple::new(
            row_id,
            columns.to_vec().into(),
            positions.iter().map(|p| values[*p].clone()).collect(),
        )))
    }

    fn insert(&self, columns: &[ColumnDef], values: Vec<Value>) -> Result<RowId, ExecutionError> {
        if columns.len() != values.len() {
            return Err(ExecutionError::Storage(format!(
                "insert into {} supplies {} values for {} columns",
                self.name,
                values.len(),
                columns.len()
            )));
        }
        let mut row = vec![Value::Null; self.columns.len()];
        for (column, value) in columns.iter().zip(values) {
            row[self.position(column)?] = value;
        }
        for (column, value) in self.columns.iter().zip(&row) {
            self.check_value(column, value)?;
        }
        let row_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        for index in self.indexes.read().iter() {
            if let Some(p) = self.index_position(index) {
                index.add(&row[p], row_id);
            }
        }
        self.rows.write().insert(row_id, row);
        Ok(row_id)
    }

    fn update(&self, row_id: RowId, columns: &[ColumnDef], values: Vec<Value>) -> Result<(), ExecutionError> {
        let mut rows = self.rows.write();
        let row = rows
            .get_mut(&row_id)
            .ok_or_else(|| ExecutionError::Storage(format!("row {row_id} not found in {}", self.name)))?;
        for (column, value) in columns.iter().zip(values) {
            self.check_value(column, &value)?;
            let position = self.position(column)?;
            for index in self.indexes.read().iter() {
                if index.column == *column {
                    index.remove(&row[position], row_id);
                    index.add(&value, row_id);
                }
            }
            row[position] = value;
        }
        Ok(())
    }

    fn delete(&self, row_id: RowId) -> Result<bool, ExecutionError> {
        let removed = self.rows.write().remove(&row_id);
        if let Some(row) = &removed {
            for index in self.indexes.read().iter() {
                if let Some(p) = self.index_position(index) {
                    index.remove(&row[p], row_id);
                }
            }
        }
        Ok(removed.is_some())
    }

    fn statistics(&self, column: &ColumnDef) -> Option<Arc<dyn ValueStatistics>> {
        let position = self.position(column).ok()?;
        let rows = self.rows.read();
        let stats = ColumnStatistics::from_values(column.ty, rows.values().map(|r| &r[position]));
        Some(Arc::new(stats))
    }

    fn indexes(&self) -> Vec<Arc<dyn IndexHandle>> {
        self.indexes
            .read()
            .iter()
            .map(|i| Arc::clone(i) as Arc<dyn IndexHandle>)
            .collect()
    }
}

struct MemoryScanCursor {
    rows: RowMap,
    positions: Vec<usize>,
    columns: Columns,
    after: Option<RowId>,
    partition: i64,
    partitions: i64,
    reads: Arc<AtomicU64>,
    delay: Option<Duration>,
}

impl Cursor for MemoryScanCursor {
    fn try_next(&mut self) -> Result<Option<Tuple>, ExecutionError> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let rows = self.rows.read();
        let lower = match self.after {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        let next = rows
            .range((lower, Bound::Unbounded))
            .find(|(id, _)| id.rem_euclid(self.partitions) == self.partition);
        let Some((row_id, values)) = next else {
            return Ok(None);
        };
        self.after = Some(*row_id);
        self.reads.fetch_add(1, Ordering::SeqCst);
        let values = self.positions.iter().map(|p| values[*p].clone()).collect();
        Ok(Some(Tuple::new(*row_id, Arc::clone(&self.columns), values)))
    }
}

/// Hash index answering equality and `IN` predicates on one column.
#[derive(Debug)]
pub struct MemoryHashIndex {
    name: String,
    column: ColumnDef,
    columns: Vec<ColumnDef>,
    entries: RwLock<FxHashMap<ValueKey, Vec<RowId>>>,
    rows: AtomicU64,
}

impl MemoryHashIndex {
    fn new(name: String, column: ColumnDef) -> Self {
        Self {
            name,
            columns: vec![column.clone()],
            column,
            entries: RwLock::new(FxHashMap::default()),
            rows: AtomicU64::new(0),
        }
    }

    fn add(&self, value: &Value, row_id: RowId) {
        self.entries
            .write()
            .entry(ValueKey(vec![value.clone()]))
            .or_default()
            .push(row_id);
        self.rows.fetch_add(1, Ordering::Relaxed);
    }

    fn remove(&self, value: &Value, row_id: RowId) {
        let mut entries = self.entries.write();
        let key = ValueKey(vec![value.clone()]);
        if let Some(ids) = entries.get_mut(&key) {
            ids.retain(|id| *id != row_id);
            if ids.is_empty() {
                entries.remove(&key);
            }
        }
        let _ = self
            .rows
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
    }

    fn lookup_values<'a>(&self, predicate: &'a BooleanPredicate) -> Option<Vec<&'a Binding>> {
        let BooleanPredicate::Comparison { operator, not: false } = predicate else {
            return None;
        };
        match operator {
            ComparisonOperator::Equal(Binding::Column(c), value) if *c == self.column => {
                matches!(value, Binding::Literal { .. }).then(|| vec![value])
            }
            ComparisonOperator::In {
                value: Binding::Column(c),
                list,
            } if *c == self.column => list
                .iter()
                .all(|b| matches!(b, Binding::Literal { .. }))
                .then(|| list.iter().collect()),
            _ => None,
        }
    }

    fn keys(&self, predicate: &BooleanPredicate, ctx: &BindingContext) -> Result<Vec<Value>, ExecutionError> {
        let bindings = self.lookup_values(predicate).ok_or_else(|| {
            ExecutionError::Storage(format!("index {} cannot process {predicate}", self.name))
        })?;
        bindings.into_iter().map(|b| ctx.resolve(b, None)).collect()
    }
}

impl IndexHandle for MemoryHashIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    fn can_process(&self, predicate: &BooleanPredicate) -> bool {
        self.lookup_values(predicate).is_some()
    }

    fn cost(&self, predicate: &BooleanPredicate, ctx: &BindingContext) -> Cost {
        let lookups = self.lookup_values(predicate).map_or(1, |v| v.len()) as f32;
        let matches = self.estimate_matches(predicate, ctx) as f32;
        Cost::MEMORY_ACCESS * (4.0 * lookups)
            + (Cost::DISK_ACCESS_READ * self.column.ty.physical_size() as f32 + Cost::MEMORY_ACCESS)
                * matches
    }

    fn estimate_matches(&self, predicate: &BooleanPredicate, _ctx: &BindingContext) -> u64 {
        let entries = self.entries.read();
        let distinct = entries.len().max(1) as u64;
        let rows = self.rows.load(Ordering::Relaxed);
        let lookups = self.lookup_values(predicate).map_or(1, |v| v.len()) as u64;
        (rows / distinct).max(1) * lookups
    }

    fn filter(&self, predicate: &BooleanPredicate, ctx: &BindingContext) -> Result<BoxCursor, ExecutionError> {
        let keys = self.keys(predicate, ctx)?;
        let entries = self.entries.read();
        let columns: Columns = self.columns.clone().into();
        let mut tuples = Vec::new();
        for key in keys {
            if let Some(ids) = entries.get(&ValueKey(vec![key.clone()])) {
                for id in ids {
                    tuples.push(Tuple::new(*id, Arc::clone(&columns), vec![key.clone()]));
                }
            }
        }
        tuples.sort_by_key(|t| t.row_id);
        Ok(Box::new(VecCursor::new(tuples)))
    }
}

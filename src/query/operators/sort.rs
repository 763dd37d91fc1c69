//! Sorting operators.
//!
//! All sorts are stable: tuples with equal keys keep their input order, and
//! merges break ties by input position.
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::query::errors::ExecutionError;
use crate::query::operators::{BoxTupleStream, TupleStream};
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::query::traits::SortOrder;
use crate::query::value::{ColumnDef, Columns, RowId, Tuple, Value};

type Order = Arc<[(ColumnDef, SortOrder)]>;

/// Compares two tuples by `order`; missing columns sort as nulls.
pub(crate) fn compare_tuples(a: &Tuple, b: &Tuple, order: &[(ColumnDef, SortOrder)]) -> Ordering {
    for (column, direction) in order {
        let left = a.get(column).unwrap_or(&Value::Null);
        let right = b.get(column).unwrap_or(&Value::Null);
        let ordering = match direction {
            SortOrder::Ascending => left.sort_cmp(right),
            SortOrder::Descending => right.sort_cmp(left),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Tuple ordered by sort key, ties broken by `seq`.
struct Ranked {
    tuple: Tuple,
    seq: u64,
    order: Order,
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_tuples(&self.tuple, &other.tuple, &self.order).then(self.seq.cmp(&other.seq))
    }
}

/// Min-heap over the heads of several sorted sources.
struct MergeHeap {
    order: Order,
    heap: BinaryHeap<Reverse<Ranked>>,
}

impl MergeHeap {
    fn new(order: Order) -> Self {
        Self {
            order,
            heap: BinaryHeap::new(),
        }
    }

    fn push(&mut self, source: usize, tuple: Tuple) {
        self.heap.push(Reverse(Ranked {
            tuple,
            seq: source as u64,
            order: Arc::clone(&self.order),
        }));
    }

    fn pop(&mut self) -> Option<(usize, Tuple)> {
        self.heap
            .pop()
            .map(|Reverse(ranked)| (ranked.seq as usize, ranked.tuple))
    }
}

fn sort_in_memory(tuples: &mut [Tuple], order: &[(ColumnDef, SortOrder)]) {
    let timer = profile_timer();
    tuples.sort_by(|a, b| compare_tuples(a, b, order));
    record_profile_timer(QueryProfileKind::Sort, timer);
}

/// Materialises its input and emits it sorted.
pub(super) struct SortStream {
    input: Option<BoxTupleStream>,
    order: Order,
    sorted: std::vec::IntoIter<Tuple>,
}

impl SortStream {
    pub(super) fn new(input: BoxTupleStream, order: Vec<(ColumnDef, SortOrder)>) -> Self {
        Self {
            input: Some(input),
            order: order.into(),
            sorted: Vec::new().into_iter(),
        }
    }
}

impl TupleStream for SortStream {
    fn try_next(&mut self) -> Result<Option<Tuple>, ExecutionError> {
        if let Some(mut input) = self.input.take() {
            let mut tuples = Vec::new();
            while let Some(tuple) = input.try_next()? {
                tuples.push(tuple);
            }
            sort_in_memory(&mut tuples, &self.order);
            self.sorted = tuples.into_iter();
        }
        Ok(self.sorted.next())
    }
}

/// Keeps the best `skip + limit` tuples in a bounded max-heap, then emits
/// them in order after dropping the first `skip`.
pub(super) struct LimitingSortStream {
    input: Option<BoxTupleStream>,
    order: Order,
    skip: u64,
    limit: u64,
    sorted: std::vec::IntoIter<Tuple>,
}

impl LimitingSortStream {
    pub(super) fn new(input: BoxTupleStream, order: Vec<(ColumnDef, SortOrder)>, skip: u64, limit: u64) -> Self {
        Self {
            input: Some(input),
            order: order.into(),
            skip,
            limit,
            sorted: Vec::new().into_iter(),
        }
    }

    fn retain(&self, input: &mut BoxTupleStream) -> Result<Vec<Tuple>, ExecutionError> {
        let capacity = usize::try_from(self.skip.saturating_add(self.limit)).unwrap_or(usize::MAX);
        if capacity == 0 {
            return Ok(Vec::new());
        }
        let mut heap: BinaryHeap<Ranked> = BinaryHeap::with_capacity(capacity.min(4096) + 1);
        let mut seq = 0u64;
        while let Some(tuple) = input.try_next()? {
            let candidate = Ranked {
                tuple,
                seq,
                order: Arc::clone(&self.order),
            };
            seq += 1;
            if heap.len() < capacity {
                heap.push(candidate);
            } else if heap.peek().is_some_and(|worst| candidate < *worst) {
                heap.pop();
                heap.push(candidate);
            }
        }
        let timer = profile_timer();
        let retained = heap
            .into_sorted_vec()
            .into_iter()
            .skip(usize::try_from(self.skip).unwrap_or(usize::MAX))
            .map(|ranked| ranked.tuple)
            .collect();
        record_profile_timer(QueryProfileKind::Sort, timer);
        Ok(retained)
    }
}

impl TupleStream for LimitingSortStream {
    fn try_next(&mut self) -> Result<Option<Tuple>, ExecutionError> {
        if let Some(mut input) = self.input.take() {
            self.sorted = self.retain(&mut input)?.into_iter();
        }
        Ok(self.sorted.next())
    }
}

/// Ordered merge of sorted inputs applying skip and limit.
pub(super) struct MergeLimitingSortStream {
    inputs: Vec<BoxTupleStream>,
    heap: Option<MergeHeap>,
    order: Order,
    skip: u64,
    remaining: u64,
}

impl MergeLimitingSortStream {
    pub(super) fn new(inputs: Vec<BoxTupleStream>, order: Vec<(ColumnDef, SortOrder)>, skip: u64, limit: u64) -> Self {
        Self {
            inputs,
            heap: None,
            order: order.into(),
            skip,
            remaining: limit,
        }
    }

    fn next_merged(&mut self) -> Result<Option<Tuple>, ExecutionError> {
        if self.heap.is_none() {
            let mut heap = MergeHeap::new(Arc::clone(&self.order));
            for (source, input) in self.inputs.iter_mut().enumerate() {
                if let Some(tuple) = input.try_next()? {
                    heap.push(source, tuple);
                }
            }
            self.heap = Some(heap);
        }
        let Some(heap) = self.heap.as_mut() else {
            return Ok(None);
        };
        let Some((source, tuple)) = heap.pop() else {
            return Ok(None);
        };
        if let Some(next) = self.inputs[source].try_next()? {
            heap.push(source, next);
        }
        Ok(Some(tuple))
    }
}

impl TupleStream for MergeLimitingSortStream {
    fn try_next(&mut self) -> Result<Option<Tuple>, ExecutionError> {
        while self.skip > 0 {
            if self.next_merged()?.is_none() {
                self.skip = 0;
                self.remaining = 0;
            } else {
                self.skip -= 1;
            }
        }
        if self.remaining == 0 {
            return Ok(None);
        }
        let next = self.next_merged()?;
        self.remaining = if next.is_some() { self.remaining - 1 } else { 0 };
        Ok(next)
    }
}

#[derive(Serialize, Deserialize)]
struct SpilledTuple {
    row_id: RowId,
    values: Vec<SpilledValue>,
}

/// On-disk form of a [`Value`]. Floats travel as their bit patterns so that
/// NaN and infinities survive the JSON round trip.
#[derive(Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
enum SpilledValue {
    Null,
    Bool(bool),
    Long(i64),
    Float(u32),
    Double(u64),
    String(String),
    FloatVector(Vec<u32>),
    DoubleVector(Vec<u64>),
}

impl From<&Value> for SpilledValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => SpilledValue::Null,
            Value::Bool(v) => SpilledValue::Bool(*v),
            Value::Long(v) => SpilledValue::Long(*v),
            Value::Float(v) => SpilledValue::Float(v.to_bits()),
            Value::Double(v) => SpilledValue::Double(v.to_bits()),
            Value::String(v) => SpilledValue::String(v.clone()),
            Value::FloatVector(v) => SpilledValue::FloatVector(v.iter().map(|x| x.to_bits()).collect()),
            Value::DoubleVector(v) => SpilledValue::DoubleVector(v.iter().map(|x| x.to_bits()).collect()),
        }
    }
}

impl From<SpilledValue> for Value {
    fn from(value: SpilledValue) -> Self {
        match value {
            SpilledValue::Null => Value::Null,
            SpilledValue::Bool(v) => Value::Bool(v),
            SpilledValue::Long(v) => Value::Long(v),
            SpilledValue::Float(bits) => Value::Float(f32::from_bits(bits)),
            SpilledValue::Double(bits) => Value::Double(f64::from_bits(bits)),
            SpilledValue::String(v) => Value::String(v),
            SpilledValue::FloatVector(v) => Value::FloatVector(v.into_iter().map(f32::from_bits).collect()),
            SpilledValue::DoubleVector(v) => Value::DoubleVector(v.into_iter().map(f64::from_bits).collect()),
        }
    }
}

/// One sorted run written to a temporary file as JSON lines.
struct SpillRun {
    reader: BufReader<File>,
    line: String,
    columns: Columns,
}

impl SpillRun {
    fn write(tuples: &[Tuple], dir: Option<&PathBuf>, columns: Columns) -> Result<Self, ExecutionError> {
        let file = match dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        let mut writer = BufWriter::new(file);
        for tuple in tuples {
            let record = SpilledTuple {
                row_id: tuple.row_id,
                values: tuple.values().iter().map(SpilledValue::from).collect(),
            };
            serde_json::to_writer(&mut writer, &record)
                .map_err(|err| ExecutionError::Serialization(err.to_string()))?;
            writer.write_all(b"\n")?;
        }
        let mut file = writer
            .into_inner()
            .map_err(|err| ExecutionError::Io(err.into_error()))?;
        file.seek(SeekFrom::Start(0))?;
        Ok(Self {
            reader: BufReader::new(file),
            line: String::new(),
            columns,
        })
    }

    fn read_next(&mut self) -> Result<Option<Tuple>, ExecutionError> {
        self.line.clear();
        if self.reader.read_line(&mut self.line)? == 0 {
            return Ok(None);
        }
        let record: SpilledTuple = serde_json::from_str(self.line.trim_end())
            .map_err(|err| ExecutionError::Serialization(err.to_string()))?;
        Ok(Some(Tuple::new(
            record.row_id,
            Arc::clone(&self.columns),
            record.values.into_iter().map(Value::from).collect(),
        )))
    }
}

enum ExternalState {
    Pending(BoxTupleStream),
    Memory(std::vec::IntoIter<Tuple>),
    Merging(Vec<SpillRun>, MergeHeap),
    Done,
}

/// Sort holding at most `chunk_size` tuples in memory; full chunks are
/// sorted and spilled, then merged.
pub(super) struct ExternalSortStream {
    state: ExternalState,
    order: Order,
    chunk_size: usize,
    spill_dir: Option<PathBuf>,
    columns: Columns,
}

impl ExternalSortStream {
    pub(super) fn new(
        input: BoxTupleStream,
        order: Vec<(ColumnDef, SortOrder)>,
        chunk_size: usize,
        spill_dir: Option<PathBuf>,
        columns: Columns,
    ) -> Self {
        Self {
            state: ExternalState::Pending(input),
            order: order.into(),
            chunk_size: chunk_size.max(1),
            spill_dir,
            columns,
        }
    }

    fn spill(&self, mut chunk: Vec<Tuple>, runs: &mut Vec<SpillRun>) -> Result<(), ExecutionError> {
        sort_in_memory(&mut chunk, &self.order);
        runs.push(SpillRun::write(
            &chunk,
            self.spill_dir.as_ref(),
            Arc::clone(&self.columns),
        )?);
        Ok(())
    }

    fn start(&self, mut input: BoxTupleStream) -> Result<ExternalState, ExecutionError> {
        let mut runs = Vec::new();
        let mut chunk = Vec::new();
        while let Some(tuple) = input.try_next()? {
            chunk.push(tuple);
            if chunk.len() >= self.chunk_size {
                self.spill(std::mem::take(&mut chunk), &mut runs)?;
            }
        }
        if runs.is_empty() {
            sort_in_memory(&mut chunk, &self.order);
            return Ok(ExternalState::Memory(chunk.into_iter()));
        }
        if !chunk.is_empty() {
            self.spill(chunk, &mut runs)?;
        }
        debug!(runs = runs.len(), chunk_size = self.chunk_size, "executor.sort.spilled");
        let mut heap = MergeHeap::new(Arc::clone(&self.order));
        for (source, run) in runs.iter_mut().enumerate() {
            if let Some(tuple) = run.read_next()? {
                heap.push(source, tuple);
            }
        }
        Ok(ExternalState::Merging(runs, heap))
    }
}

impl TupleStream for ExternalSortStream {
    fn try_next(&mut self) -> Result<Option<Tuple>, ExecutionError> {
        if let ExternalState::Pending(_) = self.state {
            let ExternalState::Pending(input) = std::mem::replace(&mut self.state, ExternalState::Done)
            else {
                return Ok(None);
            };
            self.state = self.start(input)?;
        }
        match &mut self.state {
            ExternalState::Memory(tuples) => Ok(tuples.next()),
            ExternalState::Merging(runs, heap) => {
                let Some((source, tuple)) = heap.pop() else {
                    return Ok(None);
                };
                if let Some(next) = runs[source].read_next()? {
                    heap.push(source, next);
                }
                Ok(Some(tuple))
            }
            ExternalState::Pending(_) | ExternalState::Done => Ok(None),
        }
    }
}

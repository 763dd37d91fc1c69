//! Canonical value, column and tuple representation shared by the planner,
//! the operators and the collaborator contracts.
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Identifier of a row within an entity.
pub type RowId = i64;

/// Row id carried by tuples that do not originate from storage (aggregates,
/// counts, sink summaries).
pub const SYNTHETIC_ROW_ID: RowId = -1;

/// Typed runtime value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Value {
    /// Null literal.
    Null,
    /// Boolean literal.
    Bool(bool),
    /// Signed 64-bit integer.
    Long(i64),
    /// 32-bit floating point number.
    Float(f32),
    /// 64-bit floating point number.
    Double(f64),
    /// UTF-8 string.
    String(String),
    /// Dense vector of 32-bit floats.
    FloatVector(Vec<f32>),
    /// Dense vector of 64-bit floats.
    DoubleVector(Vec<f64>),
}

impl Value {
    /// Returns `true` for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view of scalar values, used by comparisons and statistics.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Long(v) => Some(*v as f64),
            Value::Float(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            Value::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Number of components of a vector value, `1` for scalars.
    pub fn logical_size(&self) -> usize {
        match self {
            Value::FloatVector(v) => v.len(),
            Value::DoubleVector(v) => v.len(),
            _ => 1,
        }
    }

    /// Short type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::FloatVector(_) => "float_vector",
            Value::DoubleVector(_) => "double_vector",
        }
    }

    /// Compares two values following SQL semantics: `None` when either side is
    /// null or the kinds are not comparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Long(a), Value::Long(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::FloatVector(a), Value::FloatVector(b)) => {
                (a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x == y))
                    .then_some(Ordering::Equal)
            }
            (Value::DoubleVector(a), Value::DoubleVector(b)) => {
                (a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x == y))
                    .then_some(Ordering::Equal)
            }
            (lhs, rhs) => match (lhs.as_f64(), rhs.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        }
    }

    /// Total order used by sort operators: nulls first, then by kind, numbers
    /// compared numerically with `total_cmp`.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Long(a), Value::Long(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::FloatVector(a), Value::FloatVector(b)) => cmp_slices(a, b, |x, y| x.total_cmp(y)),
            (Value::DoubleVector(a), Value::DoubleVector(b)) => {
                cmp_slices(a, b, |x, y| x.total_cmp(y))
            }
            (lhs, rhs) => match (lhs.as_f64(), rhs.as_f64()) {
                (Some(a), Some(b)) => a.total_cmp(&b),
                _ => lhs.kind_rank().cmp(&rhs.kind_rank()),
            },
        }
    }

    fn kind_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Long(_) | Value::Float(_) | Value::Double(_) => 2,
            Value::String(_) => 3,
            Value::FloatVector(_) => 4,
            Value::DoubleVector(_) => 5,
        }
    }

    /// Bitwise hash, consistent with [`Value::same_as`].
    pub fn hash_bits<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.kind_rank());
        match self {
            Value::Null => {}
            Value::Bool(v) => v.hash(state),
            Value::Long(v) => v.hash(state),
            Value::Float(v) => v.to_bits().hash(state),
            Value::Double(v) => v.to_bits().hash(state),
            Value::String(v) => v.hash(state),
            Value::FloatVector(v) => v.iter().for_each(|x| x.to_bits().hash(state)),
            Value::DoubleVector(v) => v.iter().for_each(|x| x.to_bits().hash(state)),
        }
    }

    /// Bitwise equality used by set operators (NaN equals NaN, `1` does not
    /// equal `1.0`).
    pub fn same_as(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::FloatVector(a), Value::FloatVector(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (Value::DoubleVector(a), Value::DoubleVector(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (a, b) => a == b,
        }
    }
}

fn cmp_slices<T>(a: &[T], b: &[T], cmp: impl Fn(&T, &T) -> Ordering) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        match cmp(x, y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "'{v}'"),
            Value::FloatVector(v) => write!(f, "{v:?}"),
            Value::DoubleVector(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Long(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Float(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<Vec<f32>> for Value {
    fn from(value: Vec<f32>) -> Self {
        Value::FloatVector(value)
    }
}

impl From<Vec<f64>> for Value {
    fn from(value: Vec<f64>) -> Self {
        Value::DoubleVector(value)
    }
}

/// Declared type of a column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "dims", rename_all = "snake_case")]
pub enum ColumnType {
    /// Boolean flag.
    Boolean,
    /// Signed 64-bit integer.
    Long,
    /// 32-bit float.
    Float,
    /// 64-bit float.
    Double,
    /// Variable-length UTF-8 string.
    String,
    /// Fixed-width vector of 32-bit floats.
    FloatVector(usize),
    /// Fixed-width vector of 64-bit floats.
    DoubleVector(usize),
}

/// Byte width assumed for strings when no statistics are available.
pub const DEFAULT_STRING_WIDTH: usize = 32;

impl ColumnType {
    /// Estimated in-memory size of one value in bytes.
    pub fn physical_size(&self) -> usize {
        match self {
            ColumnType::Boolean => 1,
            ColumnType::Long | ColumnType::Double => 8,
            ColumnType::Float => 4,
            ColumnType::String => DEFAULT_STRING_WIDTH,
            ColumnType::FloatVector(dims) => 4 * dims,
            ColumnType::DoubleVector(dims) => 8 * dims,
        }
    }

    /// Number of components (vector width, `1` for scalars).
    pub fn logical_size(&self) -> usize {
        match self {
            ColumnType::FloatVector(dims) | ColumnType::DoubleVector(dims) => *dims,
            _ => 1,
        }
    }

    /// Returns `true` for numeric scalar types.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ColumnType::Long | ColumnType::Float | ColumnType::Double
        )
    }

    /// Returns `true` for vector types.
    pub fn is_vector(&self) -> bool {
        matches!(self, ColumnType::FloatVector(_) | ColumnType::DoubleVector(_))
    }

    /// Checks whether `value` may be stored in a column of this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (ColumnType::Boolean, Value::Bool(_)) => true,
            (ColumnType::Long, Value::Long(_)) => true,
            (ColumnType::Float, Value::Float(_)) => true,
            (ColumnType::Double, Value::Double(_)) => true,
            (ColumnType::String, Value::String(_)) => true,
            (ColumnType::FloatVector(d), Value::FloatVector(v)) => *d == v.len(),
            (ColumnType::DoubleVector(d), Value::DoubleVector(v)) => *d == v.len(),
            _ => false,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Boolean => write!(f, "BOOLEAN"),
            ColumnType::Long => write!(f, "LONG"),
            ColumnType::Float => write!(f, "FLOAT"),
            ColumnType::Double => write!(f, "DOUBLE"),
            ColumnType::String => write!(f, "STRING"),
            ColumnType::FloatVector(d) => write!(f, "FLOAT_VECTOR({d})"),
            ColumnType::DoubleVector(d) => write!(f, "DOUBLE_VECTOR({d})"),
        }
    }
}

/// Column definition: a qualified name plus its type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Qualified column name, e.g. `warren.features.v`.
    pub name: String,
    /// Declared column type.
    pub ty: ColumnType,
    /// Whether the column may contain nulls.
    pub nullable: bool,
}

impl PartialOrd for ColumnType {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ColumnType {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

impl ColumnDef {
    /// Creates a non-nullable column.
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: false,
        }
    }

    /// Creates a nullable column.
    pub fn nullable(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: true,
        }
    }

    /// Unqualified part of the name (after the last `.`).
    pub fn simple_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }

    /// Matches either the qualified or the unqualified name.
    pub fn matches_name(&self, name: &str) -> bool {
        self.name == name || self.simple_name() == name
    }
}

impl fmt::Display for ColumnDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.ty)
    }
}

/// Shared, immutable column layout of a tuple stream.
pub type Columns = Arc<[ColumnDef]>;

/// A single row flowing through the operator graph.
#[derive(Clone, Debug, PartialEq)]
pub struct Tuple {
    /// Storage row id or [`SYNTHETIC_ROW_ID`].
    pub row_id: RowId,
    columns: Columns,
    values: Vec<Value>,
}

impl Tuple {
    /// Creates a tuple; `values` must line up with `columns`.
    pub fn new(row_id: RowId, columns: Columns, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self {
            row_id,
            columns,
            values,
        }
    }

    /// Column layout of this tuple.
    pub fn columns(&self) -> &Columns {
        &self.columns
    }

    /// Values in column order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Consumes the tuple returning its values.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Value of `column`, if present.
    pub fn get(&self, column: &ColumnDef) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|idx| &self.values[idx])
    }

    /// Value of the column called `name` (qualified or simple).
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.matches_name(name))
            .map(|idx| &self.values[idx])
    }

    /// Returns a tuple with `column` appended.
    pub fn extend(mut self, columns: Columns, value: Value) -> Self {
        self.values.push(value);
        self.columns = columns;
        self
    }

    /// Projects the tuple onto `columns`; missing columns become nulls.
    pub fn project(&self, columns: &Columns) -> Tuple {
        let values = columns
            .iter()
            .map(|c| self.get(c).cloned().unwrap_or(Value::Null))
            .collect();
        Tuple::new(self.row_id, Arc::clone(columns), values)
    }
}

/// Hashable, bitwise-equal view over a row of values used by set operators.
#[derive(Clone, Debug)]
pub struct ValueKey(pub Vec<Value>);

impl PartialEq for ValueKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len() && self.0.iter().zip(&other.0).all(|(a, b)| a.same_as(b))
    }
}

impl Eq for ValueKey {}

impl Hash for ValueKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_usize(self.0.len());
        for value in &self.0 {
            value.hash_bits(state);
        }
    }
}

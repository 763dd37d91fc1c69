//! Late-bound values: literals, parameters, columns, function outputs and
//! sub-query results.
//!
//! Plan nodes only hold [`Binding`]s. The values live in a [`BindingContext`]
//! that is shared by every node of one plan instance and rebound for each
//! execution, so a cached plan can be reused with new parameter values.
use std::fmt;
use std::hash::Hasher;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::query::context::GroupId;
use crate::query::errors::{BindingError, ExecutionError};
use crate::query::function::Function;
use crate::query::value::{ColumnDef, ColumnType, Tuple, Value};

/// Placeholder resolved against a [`BindingContext`] and, for columns, the
/// tuple being processed.
#[derive(Clone)]
pub enum Binding {
    /// Value stored in the context under `index`.
    Literal {
        /// Slot in the context.
        index: usize,
        /// Declared type of the slot.
        ty: Option<ColumnType>,
    },
    /// Value of a column of the current tuple.
    Column(ColumnDef),
    /// Result of applying a function to other bindings.
    Function {
        /// Resolved function.
        function: Arc<dyn Function>,
        /// Argument bindings.
        arguments: Vec<Binding>,
    },
    /// Values produced by the sub-query with the given group.
    Subquery {
        /// Group of the sub-query plan.
        group: GroupId,
        /// Column of the sub-query whose values are collected.
        column: ColumnDef,
    },
}

impl Binding {
    /// Columns of the current tuple this binding reads.
    pub fn columns(&self) -> Vec<ColumnDef> {
        match self {
            Binding::Column(column) => vec![column.clone()],
            Binding::Function { arguments, .. } => {
                arguments.iter().flat_map(Binding::columns).collect()
            }
            Binding::Literal { .. } | Binding::Subquery { .. } => Vec::new(),
        }
    }

    /// Type of the value this binding produces, when known statically.
    pub fn ty(&self) -> Option<ColumnType> {
        match self {
            Binding::Literal { ty, .. } => *ty,
            Binding::Column(column) => Some(column.ty),
            Binding::Function { function, .. } => Some(function.signature().returns),
            Binding::Subquery { column, .. } => Some(column.ty),
        }
    }

    /// Returns `true` for bindings that do not depend on the current tuple.
    pub fn is_static(&self) -> bool {
        match self {
            Binding::Literal { .. } | Binding::Subquery { .. } => true,
            Binding::Column(_) => false,
            Binding::Function { arguments, .. } => arguments.iter().all(Binding::is_static),
        }
    }

    /// Feeds the binding's structure into a digest. Literal slots are hashed by
    /// index, not value, so rebinding does not change the digest.
    pub fn hash_into<H: Hasher>(&self, state: &mut H) {
        match self {
            Binding::Literal { index, .. } => {
                state.write_u8(0);
                state.write_usize(*index);
            }
            Binding::Column(column) => {
                state.write_u8(1);
                state.write(column.name.as_bytes());
            }
            Binding::Function {
                function,
                arguments,
            } => {
                state.write_u8(2);
                state.write(function.signature().to_string().as_bytes());
                state.write_u8(function.is_vectorised() as u8);
                for argument in arguments {
                    argument.hash_into(state);
                }
            }
            Binding::Subquery { group, column } => {
                state.write_u8(3);
                state.write_u32(*group);
                state.write(column.name.as_bytes());
            }
        }
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Literal { index, .. } => write!(f, ":{index}"),
            Binding::Column(column) => write!(f, "{}", column.name),
            Binding::Function {
                function,
                arguments,
            } => {
                write!(f, "{}(", function.signature().name)?;
                for (i, arg) in arguments.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            Binding::Subquery { group, column } => write!(f, "subquery#{group}.{}", column.name),
        }
    }
}

/// Runtime values for the bindings of one plan instance.
#[derive(Clone, Debug, Default)]
pub struct BindingContext {
    literals: Vec<Option<Value>>,
    subqueries: FxHashMap<GroupId, Vec<Value>>,
}

/// Binding context shared by all nodes and operators of one execution.
pub type SharedBindings = Arc<RwLock<BindingContext>>;

impl BindingContext {
    /// Empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps the context for sharing.
    pub fn shared(self) -> SharedBindings {
        Arc::new(RwLock::new(self))
    }

    /// Registers a literal value and returns its binding.
    pub fn bind(&mut self, value: impl Into<Value>) -> Binding {
        let value = value.into();
        let ty = value_type(&value);
        self.literals.push(Some(value));
        Binding::Literal {
            index: self.literals.len() - 1,
            ty,
        }
    }

    /// Registers a parameter placeholder whose value is supplied later with
    /// [`BindingContext::update`].
    pub fn bind_parameter(&mut self, ty: Option<ColumnType>) -> Binding {
        self.literals.push(None);
        Binding::Literal {
            index: self.literals.len() - 1,
            ty,
        }
    }

    /// Binding that reads `column` from the current tuple.
    pub fn bind_column(&self, column: ColumnDef) -> Binding {
        Binding::Column(column)
    }

    /// Binding that collects `column` from the sub-query of `group`.
    pub fn bind_subquery(&self, group: GroupId, column: ColumnDef) -> Binding {
        Binding::Subquery { group, column }
    }

    /// Replaces the value of a literal binding.
    pub fn update(&mut self, binding: &Binding, value: impl Into<Value>) -> Result<(), BindingError> {
        let Binding::Literal { index, ty } = binding else {
            return Err(BindingError::MissingColumn {
                column: binding.to_string(),
            });
        };
        let value = value.into();
        if let Some(ty) = ty {
            if !ty.accepts(&value) {
                return Err(BindingError::TypeMismatch {
                    index: *index,
                    expected: ty.to_string(),
                    found: value.type_name(),
                });
            }
        }
        let slot = self
            .literals
            .get_mut(*index)
            .ok_or(BindingError::UnknownLiteral { index: *index })?;
        *slot = Some(value);
        Ok(())
    }

    /// Value of the literal slot `index`.
    pub fn literal(&self, index: usize) -> Result<&Value, BindingError> {
        match self.literals.get(index) {
            Some(Some(value)) => Ok(value),
            Some(None) => Err(BindingError::UnboundParameter { index }),
            None => Err(BindingError::UnknownLiteral { index }),
        }
    }

    /// Number of literal slots.
    pub fn len(&self) -> usize {
        self.literals.len()
    }

    /// Returns `true` when no literal has been registered.
    pub fn is_empty(&self) -> bool {
        self.literals.is_empty()
    }

    /// Appends a sub-query result value for `group`.
    pub fn append(&mut self, group: GroupId, value: Value) {
        self.subqueries.entry(group).or_default().push(value);
    }

    /// Marks the sub-query of `group` as bound with no values yet.
    pub fn open_subquery(&mut self, group: GroupId) {
        self.subqueries.entry(group).or_default().clear();
    }

    /// Drops all values of `group`.
    pub fn clear_subquery(&mut self, group: GroupId) {
        self.subqueries.remove(&group);
    }

    /// Drops all sub-query values, keeping literals.
    pub fn clear(&mut self) {
        self.subqueries.clear();
    }

    /// Values collected for the sub-query of `group`.
    pub fn subquery(&self, group: GroupId) -> Result<&[Value], BindingError> {
        self.subqueries
            .get(&group)
            .map(Vec::as_slice)
            .ok_or(BindingError::MissingSubquery { group })
    }

    /// Checks that a binding can be resolved before execution starts.
    /// Sub-query bindings are filled during execution and are not checked.
    pub fn check(&self, binding: &Binding) -> Result<(), BindingError> {
        match binding {
            Binding::Literal { index, .. } => self.literal(*index).map(|_| ()),
            Binding::Function { arguments, .. } => {
                arguments.iter().try_for_each(|arg| self.check(arg))
            }
            Binding::Column(_) | Binding::Subquery { .. } => Ok(()),
        }
    }

    /// Resolves a binding to a single value. A sub-query binding resolves to
    /// its first value, or null when it produced nothing.
    pub fn resolve(&self, binding: &Binding, tuple: Option<&Tuple>) -> Result<Value, ExecutionError> {
        match binding {
            Binding::Literal { index, .. } => Ok(self.literal(*index)?.clone()),
            Binding::Column(column) => tuple
                .and_then(|t| t.get(column))
                .cloned()
                .ok_or_else(|| {
                    BindingError::MissingColumn {
                        column: column.name.clone(),
                    }
                    .into()
                }),
            Binding::Function {
                function,
                arguments,
            } => {
                let args = arguments
                    .iter()
                    .map(|arg| self.resolve(arg, tuple))
                    .collect::<Result<Vec<_>, _>>()?;
                function.invoke(&args)
            }
            Binding::Subquery { group, .. } => {
                Ok(self.subquery(*group)?.first().cloned().unwrap_or(Value::Null))
            }
        }
    }

    /// Resolves a binding to all its values: sub-queries expand to their
    /// result list, everything else to a single value.
    pub fn resolve_all(
        &self,
        binding: &Binding,
        tuple: Option<&Tuple>,
    ) -> Result<Vec<Value>, ExecutionError> {
        match binding {
            Binding::Subquery { group, .. } => Ok(self.subquery(*group)?.to_vec()),
            other => Ok(vec![self.resolve(other, tuple)?]),
        }
    }

    /// Independent copy for a concurrent execution of the same plan.
    pub fn copy(&self) -> Self {
        self.clone()
    }
}

fn value_type(value: &Value) -> Option<ColumnType> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some(ColumnType::Boolean),
        Value::Long(_) => Some(ColumnType::Long),
        Value::Float(_) => Some(ColumnType::Float),
        Value::Double(_) => Some(ColumnType::Double),
        Value::String(_) => Some(ColumnType::String),
        Value::FloatVector(v) => Some(ColumnType::FloatVector(v.len())),
        Value::DoubleVector(v) => Some(ColumnType::DoubleVector(v.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::function::FunctionRegistry;

    #[test]
    fn parameters_must_be_bound_before_resolution() {
        let mut ctx = BindingContext::new();
        let param = ctx.bind_parameter(Some(ColumnType::Long));
        assert_eq!(
            ctx.check(&param),
            Err(BindingError::UnboundParameter { index: 0 })
        );
        ctx.update(&param, 42i64).expect("bind");
        assert_eq!(ctx.resolve(&param, None).expect("resolve"), Value::Long(42));
        let err = ctx.update(&param, "nope").expect_err("type mismatch");
        assert_eq!(err.code(), "TypeMismatch");
    }

    #[test]
    fn subquery_values_expand() {
        let mut ctx = BindingContext::new();
        let col = ColumnDef::new("s.id", ColumnType::Long);
        let binding = ctx.bind_subquery(3, col);
        assert!(ctx.resolve_all(&binding, None).is_err());
        ctx.open_subquery(3);
        ctx.append(3, Value::Long(1));
        ctx.append(3, Value::Long(2));
        assert_eq!(
            ctx.resolve_all(&binding, None).expect("values"),
            vec![Value::Long(1), Value::Long(2)]
        );
        assert_eq!(ctx.resolve(&binding, None).expect("first"), Value::Long(1));
    }

    #[test]
    fn copies_do_not_alias() {
        let mut ctx = BindingContext::new();
        let lit = ctx.bind(1i64);
        let mut copy = ctx.copy();
        copy.update(&lit, 2i64).expect("update copy");
        assert_eq!(ctx.literal(0).expect("original"), &Value::Long(1));
        assert_eq!(copy.literal(0).expect("copy"), &Value::Long(2));
    }

    #[test]
    fn function_bindings_resolve_against_tuple() {
        let registry = FunctionRegistry::with_builtins();
        let col = ColumnDef::new("t.v", ColumnType::FloatVector(2));
        let mut ctx = BindingContext::new();
        let query = ctx.bind(vec![0.0f32, 0.0]);
        let function = registry
            .resolve("euclidean", &[col.ty, ColumnType::FloatVector(2)])
            .expect("euclidean");
        let binding = Binding::Function {
            function,
            arguments: vec![Binding::Column(col.clone()), query],
        };
        let tuple = Tuple::new(
            1,
            vec![col].into(),
            vec![Value::FloatVector(vec![3.0, 4.0])],
        );
        assert_eq!(
            ctx.resolve(&binding, Some(&tuple)).expect("distance"),
            Value::Float(5.0)
        );
    }
}

//! Function contract, registry and the built-in vector distances.
use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::query::cost::Cost;
use crate::query::errors::{ExecutionError, PlanningError};
use crate::query::value::{ColumnType, Value};

/// Number of lanes processed per step by vectorised kernels.
pub const VECTOR_LANES: usize = 8;

/// Name, argument types and return type of a function.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Signature {
    /// Function name, lower case.
    pub name: String,
    /// Argument types.
    pub arguments: Vec<ColumnType>,
    /// Return type.
    pub returns: ColumnType,
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, arg) in self.arguments.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{arg}")?;
        }
        write!(f, ") -> {}", self.returns)
    }
}

/// A function the planner can cost and the operators can invoke.
pub trait Function: Send + Sync + fmt::Debug {
    /// Resolved signature.
    fn signature(&self) -> &Signature;

    /// Cost of one invocation.
    fn cost(&self) -> Cost;

    /// Evaluates the function.
    fn invoke(&self, args: &[Value]) -> Result<Value, ExecutionError>;

    /// Vectorised variant with the same signature, if one exists.
    fn vectorised(&self) -> Option<Arc<dyn Function>> {
        None
    }

    /// Returns `true` when this instance already is a vectorised variant.
    fn is_vectorised(&self) -> bool {
        false
    }
}

type FunctionFactory = Arc<dyn Fn(&[ColumnType]) -> Option<Arc<dyn Function>> + Send + Sync>;

/// Resolves functions by name and argument types.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    factories: FxHashMap<String, Vec<FunctionFactory>>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("FunctionRegistry")
            .field("functions", &names)
            .finish()
    }
}

impl FunctionRegistry {
    /// Registry without any function.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in vector distances.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for kind in DistanceKind::ALL {
            registry.register(kind.name(), move |args: &[ColumnType]| {
                VectorDistance::resolve(kind, args).map(|f| Arc::new(f) as Arc<dyn Function>)
            });
        }
        registry
    }

    /// Registers a factory producing an instance for matching argument types.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&[ColumnType]) -> Option<Arc<dyn Function>> + Send + Sync + 'static,
    {
        self.factories
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(Arc::new(factory));
    }

    /// Finds a function accepting `args`.
    pub fn resolve(&self, name: &str, args: &[ColumnType]) -> Result<Arc<dyn Function>, PlanningError> {
        self.factories
            .get(&name.to_ascii_lowercase())
            .and_then(|candidates| candidates.iter().find_map(|factory| factory(args)))
            .ok_or_else(|| PlanningError::IncompatibleSignature {
                name: name.to_string(),
                args: args
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }
}

/// Built-in distance measures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DistanceKind {
    /// L1 distance.
    Manhattan,
    /// L2 distance.
    Euclidean,
    /// Squared L2 distance.
    SquaredEuclidean,
    /// One minus cosine similarity.
    Cosine,
    /// One minus the dot product.
    InnerProduct,
}

impl DistanceKind {
    /// Every built-in distance.
    pub const ALL: [DistanceKind; 5] = [
        DistanceKind::Manhattan,
        DistanceKind::Euclidean,
        DistanceKind::SquaredEuclidean,
        DistanceKind::Cosine,
        DistanceKind::InnerProduct,
    ];

    /// Registry name.
    pub fn name(&self) -> &'static str {
        match self {
            DistanceKind::Manhattan => "manhattan",
            DistanceKind::Euclidean => "euclidean",
            DistanceKind::SquaredEuclidean => "squaredeuclidean",
            DistanceKind::Cosine => "cosine",
            DistanceKind::InnerProduct => "innerproduct",
        }
    }

    fn flops_per_component(&self) -> f32 {
        match self {
            DistanceKind::Manhattan => 2.0,
            DistanceKind::Euclidean | DistanceKind::SquaredEuclidean => 3.0,
            DistanceKind::InnerProduct => 2.0,
            DistanceKind::Cosine => 6.0,
        }
    }
}

/// A distance between two vectors of equal width.
#[derive(Debug)]
pub struct VectorDistance {
    kind: DistanceKind,
    signature: Signature,
    vectorised: bool,
}

impl VectorDistance {
    fn resolve(kind: DistanceKind, args: &[ColumnType]) -> Option<Self> {
        let returns = match args {
            [ColumnType::FloatVector(a), ColumnType::FloatVector(b)] if a == b => ColumnType::Float,
            [ColumnType::DoubleVector(a), ColumnType::DoubleVector(b)] if a == b => {
                ColumnType::Double
            }
            _ => return None,
        };
        Some(Self {
            kind,
            signature: Signature {
                name: kind.name().to_string(),
                arguments: args.to_vec(),
                returns,
            },
            vectorised: false,
        })
    }

    fn dims(&self) -> usize {
        self.signature.arguments[0].logical_size()
    }

    fn type_error(&self, found: &Value) -> ExecutionError {
        ExecutionError::TypeMismatch {
            context: "vector distance",
            expected: match self.signature.returns {
                ColumnType::Double => "double_vector",
                _ => "float_vector",
            },
            found: found.type_name(),
        }
    }
}

impl Function for VectorDistance {
    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn cost(&self) -> Cost {
        let dims = self.dims() as f32;
        let scalar = Cost::FLOP * (self.kind.flops_per_component() * dims)
            + Cost::MEMORY_ACCESS * (2.0 * dims);
        if self.vectorised {
            Cost::FLOP * (self.kind.flops_per_component() * dims / VECTOR_LANES as f32)
                + Cost::MEMORY_ACCESS * (2.0 * dims / VECTOR_LANES as f32)
        } else {
            scalar
        }
    }

    fn invoke(&self, args: &[Value]) -> Result<Value, ExecutionError> {
        let [left, right] = args else {
            return Err(ExecutionError::function(
                &self.signature.name,
                format!("expected 2 arguments, got {}", args.len()),
            ));
        };
        match (left, right) {
            (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
            (Value::FloatVector(a), Value::FloatVector(b)) => {
                if a.len() != b.len() {
                    return Err(ExecutionError::function(
                        &self.signature.name,
                        format!("vector widths differ ({} vs {})", a.len(), b.len()),
                    ));
                }
                let d = if self.vectorised {
                    kernels_f32::chunked(self.kind, a, b)
                } else {
                    kernels_f32::scalar(self.kind, a, b)
                };
                Ok(Value::Float(d))
            }
            (Value::DoubleVector(a), Value::DoubleVector(b)) => {
                if a.len() != b.len() {
                    return Err(ExecutionError::function(
                        &self.signature.name,
                        format!("vector widths differ ({} vs {})", a.len(), b.len()),
                    ));
                }
                let d = if self.vectorised {
                    kernels_f64::chunked(self.kind, a, b)
                } else {
                    kernels_f64::scalar(self.kind, a, b)
                };
                Ok(Value::Double(d))
            }
            (Value::FloatVector(_), other) | (Value::DoubleVector(_), other) => {
                Err(self.type_error(other))
            }
            (other, _) => Err(self.type_error(other)),
        }
    }

    fn vectorised(&self) -> Option<Arc<dyn Function>> {
        (!self.vectorised).then(|| {
            Arc::new(VectorDistance {
                kind: self.kind,
                signature: self.signature.clone(),
                vectorised: true,
            }) as Arc<dyn Function>
        })
    }

    fn is_vectorised(&self) -> bool {
        self.vectorised
    }
}

macro_rules! distance_kernels {
    ($module:ident, $t:ty) => {
        mod $module {
            use super::{DistanceKind, VECTOR_LANES};

            fn finish(kind: DistanceKind, acc: [$t; 3]) -> $t {
                let [a, b, c] = acc;
                match kind {
                    DistanceKind::Manhattan | DistanceKind::SquaredEuclidean => a,
                    DistanceKind::Euclidean => a.sqrt(),
                    DistanceKind::InnerProduct => 1.0 - a,
                    DistanceKind::Cosine => {
                        let denom = b.sqrt() * c.sqrt();
                        if denom == 0.0 {
                            1.0
                        } else {
                            1.0 - a / denom
                        }
                    }
                }
            }

            #[inline(always)]
            fn step(kind: DistanceKind, x: $t, y: $t, acc: &mut [$t; 3]) {
                match kind {
                    DistanceKind::Manhattan => acc[0] += (x - y).abs(),
                    DistanceKind::Euclidean | DistanceKind::SquaredEuclidean => {
                        let d = x - y;
                        acc[0] += d * d;
                    }
                    DistanceKind::InnerProduct => acc[0] += x * y,
                    DistanceKind::Cosine => {
                        acc[0] += x * y;
                        acc[1] += x * x;
                        acc[2] += y * y;
                    }
                }
            }

            pub(super) fn scalar(kind: DistanceKind, a: &[$t], b: &[$t]) -> $t {
                let mut acc = [0.0; 3];
                for (x, y) in a.iter().zip(b) {
                    step(kind, *x, *y, &mut acc);
                }
                finish(kind, acc)
            }

            /// Lane-chunked evaluation the compiler turns into SIMD code.
            pub(super) fn chunked(kind: DistanceKind, a: &[$t], b: &[$t]) -> $t {
                let mut lanes = [[0.0 as $t; 3]; VECTOR_LANES];
                let chunks_a = a.chunks_exact(VECTOR_LANES);
                let chunks_b = b.chunks_exact(VECTOR_LANES);
                let rest_a = chunks_a.remainder();
                let rest_b = chunks_b.remainder();
                for (ca, cb) in chunks_a.zip(chunks_b) {
                    for lane in 0..VECTOR_LANES {
                        step(kind, ca[lane], cb[lane], &mut lanes[lane]);
                    }
                }
                let mut acc = [0.0; 3];
                for lane in lanes {
                    acc[0] += lane[0];
                    acc[1] += lane[1];
                    acc[2] += lane[2];
                }
                for (x, y) in rest_a.iter().zip(rest_b) {
                    step(kind, *x, *y, &mut acc);
                }
                finish(kind, acc)
            }
        }
    };
}

distance_kernels!(kernels_f32, f32);
distance_kernels!(kernels_f64, f64);

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(name: &str, dims: usize) -> Arc<dyn Function> {
        FunctionRegistry::with_builtins()
            .resolve(name, &[ColumnType::FloatVector(dims), ColumnType::FloatVector(dims)])
            .expect("builtin distance")
    }

    #[test]
    fn euclidean_distance() {
        let f = resolve("euclidean", 2);
        let d = f
            .invoke(&[vec![0.0f32, 0.0].into(), vec![3.0f32, 4.0].into()])
            .expect("invoke");
        assert_eq!(d, Value::Float(5.0));
    }

    #[test]
    fn vectorised_variant_matches_scalar() {
        let a: Vec<f32> = (0..37).map(|i| i as f32 * 0.5).collect();
        let b: Vec<f32> = (0..37).map(|i| (37 - i) as f32 * 0.25).collect();
        for kind in DistanceKind::ALL {
            let scalar = resolve(kind.name(), 37);
            let vectorised = scalar.vectorised().expect("has vectorised variant");
            assert!(vectorised.is_vectorised());
            assert!(vectorised.vectorised().is_none());
            assert_eq!(scalar.signature(), vectorised.signature());
            let (Value::Float(x), Value::Float(y)) = (
                scalar.invoke(&[a.clone().into(), b.clone().into()]).expect("scalar"),
                vectorised.invoke(&[a.clone().into(), b.clone().into()]).expect("vectorised"),
            ) else {
                panic!("expected float results");
            };
            assert!((x - y).abs() <= 1e-3 * x.abs().max(1.0), "{kind:?}: {x} vs {y}");
            assert!(vectorised.cost().cpu < scalar.cost().cpu);
        }
    }

    #[test]
    fn incompatible_signature_is_a_planning_error() {
        let err = FunctionRegistry::with_builtins()
            .resolve("euclidean", &[ColumnType::FloatVector(3), ColumnType::FloatVector(4)])
            .expect_err("width mismatch");
        assert_eq!(err.code(), "IncompatibleSignature");
        assert!(FunctionRegistry::with_builtins()
            .resolve("nosuchfn", &[ColumnType::Long])
            .is_err());
    }

    #[test]
    fn null_arguments_yield_null() {
        let f = resolve("manhattan", 2);
        assert_eq!(
            f.invoke(&[Value::Null, vec![1.0f32, 2.0].into()]).expect("null"),
            Value::Null
        );
    }
}

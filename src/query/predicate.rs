//! Boolean predicates evaluated by filters and costed by the planner.
use std::collections::BTreeSet;
use std::fmt;
use std::hash::Hasher;

use crate::query::binding::{Binding, BindingContext};
use crate::query::cost::Cost;
use crate::query::errors::ExecutionError;
use crate::query::value::{ColumnDef, Tuple, Value};

/// Atomic comparison between bindings.
#[derive(Clone, Debug)]
pub enum ComparisonOperator {
    /// `left = right`.
    Equal(Binding, Binding),
    /// `left != right`.
    NotEqual(Binding, Binding),
    /// `left > right`.
    Greater(Binding, Binding),
    /// `left >= right`.
    GreaterEqual(Binding, Binding),
    /// `left < right`.
    Less(Binding, Binding),
    /// `left <= right`.
    LessEqual(Binding, Binding),
    /// `lower <= value <= upper`.
    Between {
        /// Tested value.
        value: Binding,
        /// Inclusive lower bound.
        lower: Binding,
        /// Inclusive upper bound.
        upper: Binding,
    },
    /// `value IN (list)`; sub-query bindings expand to their results.
    In {
        /// Tested value.
        value: Binding,
        /// Candidate values.
        list: Vec<Binding>,
    },
    /// `value IS NULL`.
    IsNull(Binding),
    /// `value LIKE pattern` with `%` and `_` wildcards.
    Like {
        /// Tested value.
        value: Binding,
        /// Pattern binding.
        pattern: Binding,
    },
}

impl ComparisonOperator {
    /// Operator name for explain output and digests.
    pub fn name(&self) -> &'static str {
        match self {
            ComparisonOperator::Equal(..) => "=",
            ComparisonOperator::NotEqual(..) => "!=",
            ComparisonOperator::Greater(..) => ">",
            ComparisonOperator::GreaterEqual(..) => ">=",
            ComparisonOperator::Less(..) => "<",
            ComparisonOperator::LessEqual(..) => "<=",
            ComparisonOperator::Between { .. } => "BETWEEN",
            ComparisonOperator::In { .. } => "IN",
            ComparisonOperator::IsNull(_) => "IS NULL",
            ComparisonOperator::Like { .. } => "LIKE",
        }
    }

    /// All bindings, left-hand side first.
    pub fn bindings(&self) -> Vec<&Binding> {
        match self {
            ComparisonOperator::Equal(l, r)
            | ComparisonOperator::NotEqual(l, r)
            | ComparisonOperator::Greater(l, r)
            | ComparisonOperator::GreaterEqual(l, r)
            | ComparisonOperator::Less(l, r)
            | ComparisonOperator::LessEqual(l, r) => vec![l, r],
            ComparisonOperator::Between {
                value,
                lower,
                upper,
            } => vec![value, lower, upper],
            ComparisonOperator::In { value, list } => {
                std::iter::once(value).chain(list.iter()).collect()
            }
            ComparisonOperator::IsNull(value) => vec![value],
            ComparisonOperator::Like { value, pattern } => vec![value, pattern],
        }
    }

    /// The column tested by this comparison (its left-hand side), if any.
    pub fn column(&self) -> Option<&ColumnDef> {
        match self.bindings().first() {
            Some(Binding::Column(column)) => Some(column),
            _ => None,
        }
    }

    /// Columns read by this comparison.
    pub fn columns(&self) -> Vec<ColumnDef> {
        self.bindings().into_iter().flat_map(Binding::columns).collect()
    }

    /// Cost of evaluating the comparison once.
    pub fn cost(&self) -> Cost {
        let bindings = self.bindings();
        let functions: Cost = bindings
            .iter()
            .filter_map(|b| match b {
                Binding::Function { function, .. } => Some(function.cost()),
                _ => None,
            })
            .sum();
        let base = match self {
            ComparisonOperator::Like { .. } => Cost::MEMORY_ACCESS * 4.0 + Cost::FLOP * 4.0,
            _ => Cost::MEMORY_ACCESS * bindings.len() as f32 + Cost::FLOP,
        };
        base + functions
    }

    /// Evaluates the comparison for `tuple`. Comparisons with null are false.
    pub fn matches(&self, ctx: &BindingContext, tuple: &Tuple) -> Result<bool, ExecutionError> {
        use std::cmp::Ordering::*;
        let resolve = |b: &Binding| ctx.resolve(b, Some(tuple));
        let cmp = |l: &Binding, r: &Binding| -> Result<Option<std::cmp::Ordering>, ExecutionError> {
            Ok(resolve(l)?.compare(&resolve(r)?))
        };
        Ok(match self {
            ComparisonOperator::Equal(l, r) => cmp(l, r)? == Some(Equal),
            ComparisonOperator::NotEqual(l, r) => matches!(cmp(l, r)?, Some(Less | Greater)),
            ComparisonOperator::Greater(l, r) => cmp(l, r)? == Some(Greater),
            ComparisonOperator::GreaterEqual(l, r) => matches!(cmp(l, r)?, Some(Greater | Equal)),
            ComparisonOperator::Less(l, r) => cmp(l, r)? == Some(Less),
            ComparisonOperator::LessEqual(l, r) => matches!(cmp(l, r)?, Some(Less | Equal)),
            ComparisonOperator::Between {
                value,
                lower,
                upper,
            } => {
                let v = resolve(value)?;
                matches!(v.compare(&resolve(lower)?), Some(Greater | Equal))
                    && matches!(v.compare(&resolve(upper)?), Some(Less | Equal))
            }
            ComparisonOperator::In { value, list } => {
                let v = resolve(value)?;
                let mut found = false;
                for candidate in list {
                    if ctx
                        .resolve_all(candidate, Some(tuple))?
                        .iter()
                        .any(|c| v.compare(c) == Some(Equal))
                    {
                        found = true;
                        break;
                    }
                }
                found
            }
            ComparisonOperator::IsNull(value) => resolve(value)?.is_null(),
            ComparisonOperator::Like { value, pattern } => match (resolve(value)?, resolve(pattern)?) {
                (Value::String(v), Value::String(p)) => like(v.as_bytes(), p.as_bytes()),
                _ => false,
            },
        })
    }

    /// Feeds the comparison into a digest.
    pub fn hash_into<H: Hasher>(&self, state: &mut H) {
        state.write(self.name().as_bytes());
        let bindings = self.bindings();
        state.write_usize(bindings.len());
        for binding in bindings {
            binding.hash_into(state);
        }
    }
}

/// Matches `value` against a pattern where `%` is any run and `_` any byte.
fn like(value: &[u8], pattern: &[u8]) -> bool {
    let (mut v, mut p) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while v < value.len() {
        match pattern.get(p) {
            Some(b'%') => {
                backtrack = Some((p, v));
                p += 1;
            }
            Some(c) if *c == b'_' || *c == value[v] => {
                p += 1;
                v += 1;
            }
            _ => match backtrack {
                Some((bp, bv)) => {
                    p = bp + 1;
                    v = bv + 1;
                    backtrack = Some((bp, bv + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|c| *c == b'%')
}

impl fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComparisonOperator::Between {
                value,
                lower,
                upper,
            } => write!(f, "{value} BETWEEN {lower} AND {upper}"),
            ComparisonOperator::In { value, list } => {
                write!(f, "{value} IN (")?;
                for (i, b) in list.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{b}")?;
                }
                write!(f, ")")
            }
            ComparisonOperator::IsNull(value) => write!(f, "{value} IS NULL"),
            ComparisonOperator::Like { value, pattern } => write!(f, "{value} LIKE {pattern}"),
            other => {
                let b = other.bindings();
                write!(f, "{} {} {}", b[0], other.name(), b[1])
            }
        }
    }
}

/// Boolean predicate tree.
#[derive(Clone, Debug)]
pub enum BooleanPredicate {
    /// Constant truth value.
    Literal(bool),
    /// Atomic comparison, optionally negated.
    Comparison {
        /// The comparison.
        operator: ComparisonOperator,
        /// Negates the result.
        not: bool,
    },
    /// Conjunction.
    And(Box<BooleanPredicate>, Box<BooleanPredicate>),
    /// Disjunction.
    Or(Box<BooleanPredicate>, Box<BooleanPredicate>),
}

impl BooleanPredicate {
    /// Atomic, non-negated comparison.
    pub fn comparison(operator: ComparisonOperator) -> Self {
        BooleanPredicate::Comparison {
            operator,
            not: false,
        }
    }

    /// Negated comparison.
    pub fn not(operator: ComparisonOperator) -> Self {
        BooleanPredicate::Comparison {
            operator,
            not: true,
        }
    }

    /// `self AND other`.
    pub fn and(self, other: BooleanPredicate) -> Self {
        BooleanPredicate::And(Box::new(self), Box::new(other))
    }

    /// `self OR other`.
    pub fn or(self, other: BooleanPredicate) -> Self {
        BooleanPredicate::Or(Box::new(self), Box::new(other))
    }

    /// Columns read by the predicate.
    pub fn columns(&self) -> BTreeSet<ColumnDef> {
        let mut out = BTreeSet::new();
        for (operator, _) in self.atomics() {
            out.extend(operator.columns());
        }
        out
    }

    /// Atomic comparisons with their negation flag.
    pub fn atomics(&self) -> Vec<(&ComparisonOperator, bool)> {
        match self {
            BooleanPredicate::Literal(_) => Vec::new(),
            BooleanPredicate::Comparison { operator, not } => vec![(operator, *not)],
            BooleanPredicate::And(l, r) | BooleanPredicate::Or(l, r) => {
                let mut out = l.atomics();
                out.extend(r.atomics());
                out
            }
        }
    }

    /// Cost of evaluating the predicate for one tuple.
    pub fn cost(&self) -> Cost {
        match self {
            BooleanPredicate::Literal(_) => Cost::ZERO,
            BooleanPredicate::Comparison { operator, .. } => operator.cost(),
            BooleanPredicate::And(l, r) | BooleanPredicate::Or(l, r) => l.cost() + r.cost(),
        }
    }

    /// Sub-query bindings referenced by the predicate.
    pub fn subqueries(&self) -> Vec<&Binding> {
        self.atomics()
            .into_iter()
            .flat_map(|(op, _)| op.bindings())
            .filter(|b| matches!(b, Binding::Subquery { .. }))
            .collect()
    }

    /// Evaluates the predicate for `tuple`, short-circuiting `AND`/`OR`.
    pub fn is_match(&self, ctx: &BindingContext, tuple: &Tuple) -> Result<bool, ExecutionError> {
        match self {
            BooleanPredicate::Literal(value) => Ok(*value),
            BooleanPredicate::Comparison { operator, not } => {
                Ok(operator.matches(ctx, tuple)? != *not)
            }
            BooleanPredicate::And(l, r) => Ok(l.is_match(ctx, tuple)? && r.is_match(ctx, tuple)?),
            BooleanPredicate::Or(l, r) => Ok(l.is_match(ctx, tuple)? || r.is_match(ctx, tuple)?),
        }
    }

    /// Feeds the predicate into a digest.
    pub fn hash_into<H: Hasher>(&self, state: &mut H) {
        match self {
            BooleanPredicate::Literal(value) => {
                state.write_u8(0);
                state.write_u8(*value as u8);
            }
            BooleanPredicate::Comparison { operator, not } => {
                state.write_u8(1);
                state.write_u8(*not as u8);
                operator.hash_into(state);
            }
            BooleanPredicate::And(l, r) => {
                state.write_u8(2);
                l.hash_into(state);
                r.hash_into(state);
            }
            BooleanPredicate::Or(l, r) => {
                state.write_u8(3);
                l.hash_into(state);
                r.hash_into(state);
            }
        }
    }
}

impl fmt::Display for BooleanPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BooleanPredicate::Literal(v) => write!(f, "{v}"),
            BooleanPredicate::Comparison { operator, not } => {
                if *not {
                    write!(f, "NOT ({operator})")
                } else {
                    write!(f, "{operator}")
                }
            }
            BooleanPredicate::And(l, r) => write!(f, "({l}) AND ({r})"),
            BooleanPredicate::Or(l, r) => write!(f, "({l}) OR ({r})"),
        }
    }
}

//! Per-column value statistics used for selectivity and size estimates.
use std::fmt;

use crate::query::binding::{Binding, BindingContext};
use crate::query::predicate::ComparisonOperator;
use crate::query::selectivity::Selectivity;
use crate::query::value::{ColumnType, Value, DEFAULT_STRING_WIDTH};

/// Selectivity assumed for equality without distinct-count information.
pub const DEFAULT_EQ_SELECTIVITY: f32 = 0.05;
/// Selectivity assumed for ranges without min/max information.
pub const DEFAULT_RANGE_SELECTIVITY: f32 = 0.3;
/// Lower bound applied to estimates so that no predicate is assumed empty.
pub const MIN_SELECTIVITY: f32 = 1e-6;

/// Statistics the planner can query for one column.
pub trait ValueStatistics: Send + Sync + fmt::Debug {
    /// Selectivity of an atomic comparison on this column.
    fn estimate_selectivity(&self, operator: &ComparisonOperator, ctx: &BindingContext) -> Selectivity;

    /// Average width of a value in bytes.
    fn avg_width(&self) -> usize;

    /// Number of rows the statistics were computed over.
    fn row_count(&self) -> u64;
}

/// Simple statistics: counts plus numeric bounds.
#[derive(Clone, Debug, PartialEq)]
pub struct ColumnStatistics {
    /// Column type.
    pub ty: ColumnType,
    /// Total rows.
    pub row_count: u64,
    /// Rows with a null value.
    pub null_count: u64,
    /// Distinct non-null values.
    pub distinct_count: u64,
    /// Smallest numeric value.
    pub min: Option<f64>,
    /// Largest numeric value.
    pub max: Option<f64>,
    /// Average width in bytes.
    pub avg_width: usize,
}

impl ColumnStatistics {
    /// Empty statistics for a column of type `ty`.
    pub fn new(ty: ColumnType) -> Self {
        Self {
            ty,
            row_count: 0,
            null_count: 0,
            distinct_count: 0,
            min: None,
            max: None,
            avg_width: match ty {
                ColumnType::String => DEFAULT_STRING_WIDTH,
                other => other.physical_size(),
            },
        }
    }

    /// Computes statistics over a sample of values.
    pub fn from_values<'a>(ty: ColumnType, values: impl IntoIterator<Item = &'a Value>) -> Self {
        let mut stats = Self::new(ty);
        let mut distinct = rustc_hash::FxHashSet::default();
        let mut width_total = 0usize;
        for value in values {
            stats.row_count += 1;
            if value.is_null() {
                stats.null_count += 1;
                continue;
            }
            let mut hasher = rustc_hash::FxHasher::default();
            value.hash_bits(&mut hasher);
            distinct.insert(std::hash::Hasher::finish(&hasher));
            if let Some(x) = value.as_f64() {
                stats.min = Some(stats.min.map_or(x, |m| m.min(x)));
                stats.max = Some(stats.max.map_or(x, |m| m.max(x)));
            }
            width_total += match value {
                Value::String(s) => s.len(),
                _ => ty.physical_size(),
            };
        }
        stats.distinct_count = distinct.len() as u64;
        let non_null = stats.row_count - stats.null_count;
        if non_null > 0 {
            stats.avg_width = (width_total / non_null as usize).max(1);
        }
        stats
    }

    fn non_null_fraction(&self) -> f32 {
        if self.row_count == 0 {
            return 1.0;
        }
        (self.row_count - self.null_count.min(self.row_count)) as f32 / self.row_count as f32
    }

    fn eq_selectivity(&self) -> f32 {
        if self.distinct_count == 0 {
            return DEFAULT_EQ_SELECTIVITY;
        }
        (self.non_null_fraction() / self.distinct_count as f32).max(MIN_SELECTIVITY)
    }

    /// Fraction of the `[min, max]` span covered by `[lower, upper]`.
    fn range_fraction(&self, lower: Option<f64>, upper: Option<f64>) -> f32 {
        let (Some(min), Some(max)) = (self.min, self.max) else {
            return DEFAULT_RANGE_SELECTIVITY;
        };
        let span = max - min;
        if span <= 0.0 {
            let lo_ok = lower.map_or(true, |l| l <= min);
            let hi_ok = upper.map_or(true, |u| u >= max);
            return if lo_ok && hi_ok { 1.0 } else { MIN_SELECTIVITY };
        }
        let lo = lower.map_or(min, |l| l.clamp(min, max));
        let hi = upper.map_or(max, |u| u.clamp(min, max));
        let fraction = ((hi - lo) / span).clamp(0.0, 1.0) as f32;
        (fraction * self.non_null_fraction()).max(MIN_SELECTIVITY)
    }
}

fn literal(binding: &Binding, ctx: &BindingContext) -> Option<Value> {
    match binding {
        Binding::Literal { index, .. } => ctx.literal(*index).ok().cloned(),
        _ => None,
    }
}

fn numeric(binding: &Binding, ctx: &BindingContext) -> Option<f64> {
    literal(binding, ctx).and_then(|v| v.as_f64())
}

impl ValueStatistics for ColumnStatistics {
    fn estimate_selectivity(&self, operator: &ComparisonOperator, ctx: &BindingContext) -> Selectivity {
        let estimate = match operator {
            ComparisonOperator::Equal(..) => self.eq_selectivity(),
            ComparisonOperator::NotEqual(..) => {
                (self.non_null_fraction() - self.eq_selectivity()).max(MIN_SELECTIVITY)
            }
            ComparisonOperator::Greater(_, r) | ComparisonOperator::GreaterEqual(_, r) => {
                match numeric(r, ctx) {
                    Some(bound) => self.range_fraction(Some(bound), None),
                    None => DEFAULT_RANGE_SELECTIVITY,
                }
            }
            ComparisonOperator::Less(_, r) | ComparisonOperator::LessEqual(_, r) => {
                match numeric(r, ctx) {
                    Some(bound) => self.range_fraction(None, Some(bound)),
                    None => DEFAULT_RANGE_SELECTIVITY,
                }
            }
            ComparisonOperator::Between { lower, upper, .. } => {
                match (numeric(lower, ctx), numeric(upper, ctx)) {
                    (Some(lo), Some(hi)) if lo <= hi => self.range_fraction(Some(lo), Some(hi)),
                    (Some(_), Some(_)) => MIN_SELECTIVITY,
                    _ => DEFAULT_RANGE_SELECTIVITY,
                }
            }
            ComparisonOperator::In { list, .. } => {
                let entries = list
                    .iter()
                    .map(|b| match b {
                        Binding::Subquery { group, .. } => {
                            ctx.subquery(*group).map(|v| v.len()).unwrap_or(1)
                        }
                        _ => 1,
                    })
                    .sum::<usize>();
                self.eq_selectivity() * entries as f32
            }
            ComparisonOperator::IsNull(_) => {
                if self.row_count == 0 {
                    MIN_SELECTIVITY
                } else {
                    (self.null_count as f32 / self.row_count as f32).max(MIN_SELECTIVITY)
                }
            }
            ComparisonOperator::Like { .. } => DEFAULT_RANGE_SELECTIVITY,
        };
        Selectivity::new(estimate)
    }

    fn avg_width(&self) -> usize {
        self.avg_width
    }

    fn row_count(&self) -> u64 {
        self.row_count
    }
}

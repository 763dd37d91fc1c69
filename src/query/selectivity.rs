//! Row-count multipliers and the naive estimator over predicate trees.
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::query::binding::BindingContext;
use crate::query::predicate::BooleanPredicate;
use crate::query::statistics::ValueStatistics;
use crate::query::value::ColumnDef;

/// Selectivity assumed when no statistics cover a predicate.
pub const DEFAULT_FILTER_SELECTIVITY: f32 = 0.25;

/// Fraction of rows that pass a predicate, always within `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub struct Selectivity(f32);

impl Selectivity {
    /// Every row passes.
    pub const ALL: Selectivity = Selectivity(1.0);
    /// No row passes.
    pub const NOTHING: Selectivity = Selectivity(0.0);
    /// Fallback estimate.
    pub const DEFAULT: Selectivity = Selectivity(DEFAULT_FILTER_SELECTIVITY);

    /// Clamps `value` into `[0, 1]`; NaN becomes [`Selectivity::DEFAULT`].
    pub fn new(value: f32) -> Self {
        if value.is_nan() {
            Self::DEFAULT
        } else {
            Selectivity(value.clamp(0.0, 1.0))
        }
    }

    /// Raw fraction.
    pub fn value(&self) -> f32 {
        self.0
    }

    /// Both predicates hold, assuming independence.
    pub fn and(self, other: Selectivity) -> Selectivity {
        Selectivity::new(self.0 * other.0)
    }

    /// Either predicate holds, assuming independence.
    pub fn or(self, other: Selectivity) -> Selectivity {
        Selectivity::new(self.0 + other.0 - self.0 * other.0)
    }

    /// Complement.
    pub fn not(self) -> Selectivity {
        Selectivity::new(1.0 - self.0)
    }

    /// Expected number of rows out of `row_count`; never exceeds it.
    pub fn apply(&self, row_count: u64) -> u64 {
        let rows = (row_count as f64 * self.0 as f64).round();
        (rows.max(0.0) as u64).min(row_count)
    }
}

/// Statistics available to an estimate, keyed by column.
pub type StatisticsMap = FxHashMap<ColumnDef, Arc<dyn ValueStatistics>>;

/// Estimates predicate selectivity by delegating atomic comparisons to the
/// column's statistics and combining the results as if independent.
#[derive(Clone, Copy, Debug, Default)]
pub struct NaiveSelectivityCalculator;

impl NaiveSelectivityCalculator {
    /// Estimates the selectivity of `predicate`.
    pub fn estimate(
        &self,
        predicate: &BooleanPredicate,
        statistics: &StatisticsMap,
        ctx: &BindingContext,
    ) -> Selectivity {
        match predicate {
            BooleanPredicate::Literal(true) => Selectivity::ALL,
            BooleanPredicate::Literal(false) => Selectivity::NOTHING,
            BooleanPredicate::Comparison { operator, not } => {
                let estimate = operator
                    .column()
                    .and_then(|column| statistics.get(column))
                    .map(|stats| stats.estimate_selectivity(operator, ctx))
                    .unwrap_or(Selectivity::DEFAULT);
                if *not {
                    estimate.not()
                } else {
                    estimate
                }
            }
            BooleanPredicate::And(l, r) => self
                .estimate(l, statistics, ctx)
                .and(self.estimate(r, statistics, ctx)),
            BooleanPredicate::Or(l, r) => self
                .estimate(l, statistics, ctx)
                .or(self.estimate(r, statistics, ctx)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::binding::Binding;
    use crate::query::predicate::ComparisonOperator;
    use crate::query::statistics::ColumnStatistics;
    use crate::query::value::{ColumnType, Value};

    #[test]
    fn combinators_follow_independence() {
        let a = Selectivity::new(0.5);
        let b = Selectivity::new(0.2);
        assert!((a.and(b).value() - 0.1).abs() < 1e-6);
        assert!((a.or(b).value() - 0.6).abs() < 1e-6);
        assert_eq!(Selectivity::new(7.0), Selectivity::ALL);
        assert_eq!(Selectivity::new(f32::NAN), Selectivity::DEFAULT);
        assert_eq!(Selectivity::ALL.apply(10), 10);
        assert_eq!(Selectivity::NOTHING.apply(10), 0);
    }

    #[test]
    fn delegates_to_column_statistics() {
        let column = ColumnDef::new("t.x", ColumnType::Long);
        let values: Vec<Value> = (0..10).map(Value::Long).collect();
        let mut statistics = StatisticsMap::default();
        statistics.insert(
            column.clone(),
            Arc::new(ColumnStatistics::from_values(ColumnType::Long, &values)),
        );
        let mut ctx = BindingContext::new();
        let eq = BooleanPredicate::comparison(ComparisonOperator::Equal(
            Binding::Column(column.clone()),
            ctx.bind(1i64),
        ));
        let s = NaiveSelectivityCalculator.estimate(&eq, &statistics, &ctx);
        assert!((s.value() - 0.1).abs() < 1e-6);

        let unknown = BooleanPredicate::comparison(ComparisonOperator::Equal(
            Binding::Column(ColumnDef::new("t.y", ColumnType::Long)),
            ctx.bind(1i64),
        ));
        let both = eq.clone().or(unknown);
        let s = NaiveSelectivityCalculator.estimate(&both, &statistics, &ctx);
        assert!((s.value() - (0.1 + 0.25 - 0.025)).abs() < 1e-6);
    }
}

//! Cost vectors and the policy that reduces them to comparable scores.
use std::hash::Hasher;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Mul, Sub};

use serde::{Deserialize, Serialize};

use crate::query::errors::PlanningError;

/// Tolerance applied when checking that policy weights sum to one.
pub const WEIGHT_TOLERANCE: f32 = 1e-5;

/// Plans whose total score is below this value are never partitioned.
pub const MIN_PARALLELISABLE_SCORE: f32 = 1e-3;

/// Node-local cost estimate.
///
/// Costs are additive; a plan's total is the sum over the executed path and is
/// only reduced to a scalar by a [`CostPolicy`] at comparison time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Cost {
    /// Storage access.
    pub io: f32,
    /// Computation.
    pub cpu: f32,
    /// Memory held while the operator runs.
    pub memory: f32,
    /// Loss of result accuracy (sampling, approximate kernels).
    pub accuracy: f32,
}

impl Cost {
    /// No cost at all.
    pub const ZERO: Cost = Cost::new(0.0, 0.0, 0.0, 0.0);
    /// Reading one byte from storage.
    pub const DISK_ACCESS_READ: Cost = Cost::new(1.0e-7, 0.0, 0.0, 0.0);
    /// Writing one byte to storage.
    pub const DISK_ACCESS_WRITE: Cost = Cost::new(5.0e-7, 0.0, 0.0, 0.0);
    /// Touching one value in memory.
    pub const MEMORY_ACCESS: Cost = Cost::new(0.0, 1.0e-8, 0.0, 0.0);
    /// One floating point operation.
    pub const FLOP: Cost = Cost::new(0.0, 1.0e-9, 0.0, 0.0);
    /// Holding one byte in memory.
    pub const MEMORY_BYTE: Cost = Cost::new(0.0, 0.0, 1.0e-8, 0.0);

    /// Creates a cost vector.
    pub const fn new(io: f32, cpu: f32, memory: f32, accuracy: f32) -> Self {
        Self {
            io,
            cpu,
            memory,
            accuracy,
        }
    }

    /// Cost of holding `bytes` in memory.
    pub fn memory_bytes(bytes: f64) -> Self {
        Cost::MEMORY_BYTE * bytes as f32
    }

    /// Returns `true` when every component is finite and non-negative.
    pub fn is_valid(&self) -> bool {
        [self.io, self.cpu, self.memory, self.accuracy]
            .iter()
            .all(|c| c.is_finite() && *c >= 0.0)
    }
}

impl Add for Cost {
    type Output = Cost;

    fn add(self, rhs: Cost) -> Cost {
        Cost::new(
            self.io + rhs.io,
            self.cpu + rhs.cpu,
            self.memory + rhs.memory,
            self.accuracy + rhs.accuracy,
        )
    }
}

impl AddAssign for Cost {
    fn add_assign(&mut self, rhs: Cost) {
        *self = *self + rhs;
    }
}

impl Sub for Cost {
    type Output = Cost;

    fn sub(self, rhs: Cost) -> Cost {
        Cost::new(
            (self.io - rhs.io).max(0.0),
            (self.cpu - rhs.cpu).max(0.0),
            (self.memory - rhs.memory).max(0.0),
            (self.accuracy - rhs.accuracy).max(0.0),
        )
    }
}

impl Mul<f32> for Cost {
    type Output = Cost;

    fn mul(self, rhs: f32) -> Cost {
        Cost::new(
            self.io * rhs,
            self.cpu * rhs,
            self.memory * rhs,
            self.accuracy * rhs,
        )
    }
}

impl Sum for Cost {
    fn sum<I: Iterator<Item = Cost>>(iter: I) -> Cost {
        iter.fold(Cost::ZERO, |acc, c| acc + c)
    }
}

/// Weights used to reduce a [`Cost`] to a single score, plus the factors that
/// drive intra-query parallelism.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostPolicy {
    /// Weight of the IO component.
    pub wio: f32,
    /// Weight of the CPU component.
    pub wcpu: f32,
    /// Weight of the memory component.
    pub wmemory: f32,
    /// Weight of the accuracy component.
    pub waccuracy: f32,
    /// Minimum marginal speed-up required to add another worker.
    pub speedup_per_worker: f32,
    /// Share of parallelisable IO that does not scale with workers.
    pub non_parallelisable_io: f32,
}

impl Default for CostPolicy {
    fn default() -> Self {
        Self {
            wio: 0.3,
            wcpu: 0.3,
            wmemory: 0.2,
            waccuracy: 0.2,
            speedup_per_worker: 0.1,
            non_parallelisable_io: 0.25,
        }
    }
}

impl CostPolicy {
    /// Creates a validated policy.
    pub fn new(
        wio: f32,
        wcpu: f32,
        wmemory: f32,
        waccuracy: f32,
        speedup_per_worker: f32,
        non_parallelisable_io: f32,
    ) -> Result<Self, PlanningError> {
        let policy = Self {
            wio,
            wcpu,
            wmemory,
            waccuracy,
            speedup_per_worker,
            non_parallelisable_io,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Checks weights (each in `[0, 1]`, summing to one within
    /// [`WEIGHT_TOLERANCE`]) and factors (each in `[0, 1]`).
    pub fn validate(&self) -> Result<(), PlanningError> {
        let invalid = |reason: String| Err(PlanningError::InvalidCostPolicy { reason });
        let weights = [
            ("wio", self.wio),
            ("wcpu", self.wcpu),
            ("wmemory", self.wmemory),
            ("waccuracy", self.waccuracy),
            ("speedup_per_worker", self.speedup_per_worker),
            ("non_parallelisable_io", self.non_parallelisable_io),
        ];
        for (name, value) in weights {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("{name} must be within [0, 1] (got {value})"));
            }
        }
        let sum = self.wio as f64 + self.wcpu as f64 + self.wmemory as f64 + self.waccuracy as f64;
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE as f64 {
            return invalid(format!("weights must sum to 1.0 (got {sum})"));
        }
        Ok(())
    }

    /// Weighted score of an absolute cost.
    pub fn score(&self, cost: &Cost) -> f32 {
        self.wio * cost.io
            + self.wcpu * cost.cpu
            + self.wmemory * cost.memory
            + self.waccuracy * cost.accuracy
    }

    /// Scores a set of alternatives after normalising every component by its
    /// maximum across the set, so no dimension dominates by unit alone.
    pub fn score_relative(&self, costs: &[Cost]) -> Vec<f32> {
        let max = costs.iter().fold(Cost::ZERO, |acc, c| {
            Cost::new(
                acc.io.max(c.io),
                acc.cpu.max(c.cpu),
                acc.memory.max(c.memory),
                acc.accuracy.max(c.accuracy),
            )
        });
        let norm = |v: f32, m: f32| if m > 0.0 { v / m } else { 0.0 };
        costs
            .iter()
            .map(|c| {
                self.score(&Cost::new(
                    norm(c.io, max.io),
                    norm(c.cpu, max.cpu),
                    norm(c.memory, max.memory),
                    norm(c.accuracy, max.accuracy),
                ))
            })
            .collect()
    }

    /// Chooses a worker count following Amdahl's law.
    ///
    /// Workers are added while the marginal speed-up of the next one is at
    /// least [`CostPolicy::speedup_per_worker`]. The non-parallelisable share
    /// of the parallelisable IO is counted as sequential work.
    pub fn parallelisation(&self, parallelisable: Cost, total: Cost, max_workers: usize) -> usize {
        if max_workers <= 1 {
            return 1;
        }
        let total_score = self.score(&total);
        if !(total_score > MIN_PARALLELISABLE_SCORE) {
            return 1;
        }
        let sequential_io = parallelisable.io * self.non_parallelisable_io;
        let scalable = Cost {
            io: parallelisable.io - sequential_io,
            ..parallelisable
        };
        let fraction = (self.score(&scalable) / total_score).clamp(0.0, 1.0);
        let speedup = |p: usize| 1.0 / ((1.0 - fraction) + fraction / p as f32);
        let mut workers = 1;
        while workers < max_workers {
            let gain = speedup(workers + 1) - speedup(workers);
            if gain <= 0.0 || gain < self.speedup_per_worker {
                break;
            }
            workers += 1;
        }
        workers
    }

    /// Feeds the policy into a digest.
    pub fn hash_into<H: Hasher>(&self, state: &mut H) {
        for value in [
            self.wio,
            self.wcpu,
            self.wmemory,
            self.waccuracy,
            self.speedup_per_worker,
            self.non_parallelisable_io,
        ] {
            state.write_u32(value.to_bits());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_valid() {
        CostPolicy::default().validate().expect("default policy");
    }

    #[test]
    fn rejects_weights_not_summing_to_one() {
        let err = CostPolicy::new(0.5, 0.5, 0.5, 0.0, 0.1, 0.1).expect_err("sum 1.5");
        assert_eq!(err.code(), "InvalidCostPolicy");
        assert!(CostPolicy::new(0.25, 0.25, 0.25, 0.250001, 0.1, 0.1).is_ok());
    }

    #[test]
    fn rejects_factors_out_of_range() {
        assert!(CostPolicy::new(1.0, 0.0, 0.0, 0.0, 1.5, 0.0).is_err());
        assert!(CostPolicy::new(1.0, 0.0, 0.0, 0.0, 0.1, -0.1).is_err());
    }

    #[test]
    fn cost_arithmetic() {
        let c = Cost::DISK_ACCESS_READ + Cost::MEMORY_ACCESS;
        let scaled = c * 10.0;
        assert!((scaled.io - 1.0e-6).abs() < 1e-12);
        assert!((scaled.cpu - 1.0e-7).abs() < 1e-12);
        let total: Cost = vec![c, c].into_iter().sum();
        assert_eq!(total, c * 2.0);
    }

    #[test]
    fn relative_scores_prefer_cheaper_plan() {
        let policy = CostPolicy::default();
        let scores = policy.score_relative(&[Cost::new(10.0, 1.0, 0.0, 0.0), Cost::new(1.0, 1.0, 0.0, 0.0)]);
        assert!(scores[1] < scores[0]);
    }

    #[test]
    fn parallelisation_grows_with_parallel_share() {
        let policy = CostPolicy::new(1.0, 0.0, 0.0, 0.0, 0.05, 0.0).expect("policy");
        let total = Cost::new(10.0, 0.0, 0.0, 0.0);
        assert_eq!(policy.parallelisation(Cost::ZERO, total, 8), 1);
        let workers = policy.parallelisation(total, total, 8);
        assert_eq!(workers, 8);
        let partial = policy.parallelisation(Cost::new(5.0, 0.0, 0.0, 0.0), total, 8);
        assert!(partial > 1 && partial < 8, "got {partial}");
        assert_eq!(policy.parallelisation(total, total, 1), 1);
    }

    #[test]
    fn tiny_plans_stay_sequential() {
        let policy = CostPolicy::default();
        let total = Cost::new(1.0e-6, 0.0, 0.0, 0.0);
        assert_eq!(policy.parallelisation(total, total, 16), 1);
    }
}

use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use tessera::config::{PlannerConfig, QueryConfig};
use tessera::query::binding::Binding;
use tessera::query::catalog::MemoryTable;
use tessera::query::cost::CostPolicy;
use tessera::query::physical::{PhysicalNode, PhysicalOp};
use tessera::query::traits::SortOrder;
use tessera::query::value::{ColumnDef, ColumnType, Tuple, Value};
use tessera::query::{Executor, LogicalPlanBuilder, Planner, QueryContext, QueryHint, QueryHints};

const DIMS: usize = 4;

fn id() -> ColumnDef {
    ColumnDef::new("e.id", ColumnType::Long)
}

fn vector() -> ColumnDef {
    ColumnDef::new("e.v", ColumnType::FloatVector(DIMS))
}

fn distance() -> ColumnDef {
    ColumnDef::nullable("distance", ColumnType::Float)
}

fn random_vector(rng: &mut ChaCha8Rng) -> Vec<f32> {
    (0..DIMS).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

fn entity(rows: i64, rng: &mut ChaCha8Rng) -> (Arc<MemoryTable>, Vec<(i64, Vec<f32>)>) {
    let table = Arc::new(MemoryTable::new("e", vec![id(), vector()]));
    let mut data = Vec::new();
    for i in 0..rows {
        let v = random_vector(rng);
        table
            .push(vec![Value::Long(i), Value::FloatVector(v.clone())])
            .expect("insert");
        data.push((i, v));
    }
    (table, data)
}

fn brute_force(data: &[(i64, Vec<f32>)], query: &[f32], skip: usize, limit: usize) -> Vec<i64> {
    let mut scored: Vec<(f64, i64)> = data
        .iter()
        .map(|(i, v)| {
            let d = v
                .iter()
                .zip(query)
                .map(|(a, b)| f64::from(a - b).powi(2))
                .sum::<f64>()
                .sqrt();
            (d, *i)
        })
        .collect();
    scored.sort_by(|a, b| a.0.total_cmp(&b.0));
    scored.into_iter().skip(skip).take(limit).map(|(_, i)| i).collect()
}

fn nearest(ctx: &QueryContext, table: Arc<MemoryTable>, query: Vec<f32>) -> tessera::query::logical::LogicalNode {
    let q = ctx.bindings().write().bind(query);
    LogicalPlanBuilder::new(ctx)
        .scan(table, &[id(), vector()])
        .function("euclidean", vec![Binding::Column(vector()), q], "distance")
        .sort(vec![(distance(), SortOrder::Ascending)])
        .limit(1, 3)
        .build()
        .expect("logical")
}

fn run(planner: &Planner, logical: &tessera::query::logical::LogicalNode, ctx: &QueryContext) -> (Vec<i64>, Vec<f32>) {
    let plan = planner.plan(logical, ctx).expect("plan");
    let tuples: Vec<Tuple> = Executor::new()
        .execute(&plan, ctx)
        .expect("execute")
        .collect::<Result<_, _>>()
        .expect("tuples");
    let ids = tuples
        .iter()
        .map(|t| match t.get(&id()) {
            Some(Value::Long(v)) => *v,
            other => panic!("unexpected id {other:?}"),
        })
        .collect();
    let distances = tuples
        .iter()
        .map(|t| match t.get(&distance()) {
            Some(Value::Float(d)) => *d,
            other => panic!("unexpected distance {other:?}"),
        })
        .collect();
    (ids, distances)
}

fn limiting_sorts(root: &PhysicalNode) -> Vec<(u64, u64)> {
    let mut found = Vec::new();
    root.walk(&mut |node| {
        if let PhysicalOp::LimitingSort { skip, limit, .. } = &node.op {
            found.push((*skip, *limit));
        }
    });
    found
}

#[test]
fn nearest_neighbours_with_skip() {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let (table, data) = entity(100, &mut rng);
    let query = random_vector(&mut rng);

    let mut config = QueryConfig::default();
    config.execution.max_workers = 1;
    let ctx = QueryContext::new("knn", Arc::new(config));
    let logical = nearest(&ctx, table, query.clone());
    let planner = Planner::new(PlannerConfig::default());

    let plan = planner.plan(&logical, &ctx).expect("plan");
    assert_eq!(limiting_sorts(&plan.root), vec![(1, 3)]);
    assert_eq!(plan.root.count("Sort"), 0);
    assert_eq!(plan.root.count("Limit"), 0);

    let (ids, distances) = run(&planner, &logical, &ctx);
    assert_eq!(ids, brute_force(&data, &query, 1, 3));
    assert!(distances.windows(2).all(|w| w[0] <= w[1]), "{distances:?}");
}

#[test]
fn partitioned_nearest_neighbours_agree() {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let (table, data) = entity(20_000, &mut rng);
    let query = random_vector(&mut rng);

    let mut config = QueryConfig::default();
    config.execution.max_workers = 4;
    let policy = CostPolicy::new(1.0, 0.0, 0.0, 0.0, 0.05, 0.0).expect("policy");
    let ctx = QueryContext::new("knn-parallel", Arc::new(config))
        .with_hints(QueryHints::default().with(QueryHint::CostPolicy(policy)))
        .expect("hints");
    let logical = nearest(&ctx, table, query.clone());
    let planner = Planner::new(PlannerConfig::default());

    let plan = planner.plan(&logical, &ctx).expect("plan");
    assert_eq!(plan.root.count("MergeLimitingSort"), 1);
    let partial = limiting_sorts(&plan.root);
    assert_eq!(partial.len(), plan.explain.partitions);
    assert!(partial.iter().all(|&(skip, limit)| skip == 0 && limit == 4));

    let (ids, distances) = run(&planner, &logical, &ctx);
    assert_eq!(ids, brute_force(&data, &query, 1, 3));
    assert!(distances.windows(2).all(|w| w[0] <= w[1]), "{distances:?}");
}

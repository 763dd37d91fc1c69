use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use tessera::config::{PlannerConfig, QueryConfig};
use tessera::query::binding::Binding;
use tessera::query::catalog::{MemoryTable, TableHandle};
use tessera::query::cost::CostPolicy;
use tessera::query::predicate::{BooleanPredicate, ComparisonOperator};
use tessera::query::value::{ColumnDef, ColumnType, Value};
use tessera::query::{Executor, LogicalPlanBuilder, Planner, QueryContext, QueryHint, QueryHints};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("tessera=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn id() -> ColumnDef {
    ColumnDef::new("t.id", ColumnType::Long)
}

fn slow_table(name: &str, column: &ColumnDef, rows: i64, delay: Duration) -> Arc<MemoryTable> {
    let table = MemoryTable::new(name, vec![column.clone()]).with_read_delay(delay);
    for i in 0..rows {
        table.push(vec![Value::Long(i)]).expect("insert");
    }
    Arc::new(table)
}

fn context(workers: usize) -> QueryContext {
    let mut config = QueryConfig::default();
    config.execution.max_workers = workers;
    config.execution.channel_capacity = 8;
    QueryContext::new("cancel", Arc::new(config))
}

#[test]
fn cancelling_a_partitioned_scan_stops_every_worker() {
    init_tracing();
    let table = slow_table("t", &id(), 20_000, Duration::from_millis(1));
    let policy = CostPolicy::new(1.0, 0.0, 0.0, 0.0, 0.05, 0.0).expect("policy");
    let ctx = context(4)
        .with_hints(QueryHints::default().with(QueryHint::CostPolicy(policy)))
        .expect("hints");
    let logical = LogicalPlanBuilder::new(&ctx)
        .scan(Arc::clone(&table) as Arc<dyn TableHandle>, &[id()])
        .build()
        .expect("logical");
    let plan = Planner::new(PlannerConfig::default())
        .plan(&logical, &ctx)
        .expect("plan");
    assert!(plan.explain.partitions > 1);

    let mut stream = Executor::new().execute(&plan, &ctx).expect("execute");
    for _ in 0..10 {
        stream.next().expect("tuple").expect("no error");
    }
    stream.cancel();
    let err = stream.next().expect("cancellation").expect_err("cancelled");
    assert!(err.is_cancelled());
    assert!(stream.next().is_none());
    assert!(!ctx.cancel_token().is_cancelled());
    drop(stream);

    let reads = table.read_count();
    assert!(reads < 20_000, "read {reads} rows");
    thread::sleep(Duration::from_millis(30));
    assert_eq!(table.read_count(), reads);
}

#[test]
fn cancelled_queries_do_not_start() {
    let table = slow_table("t", &id(), 10, Duration::from_millis(1));
    let ctx = context(1);
    let logical = LogicalPlanBuilder::new(&ctx)
        .scan(table, &[id()])
        .build()
        .expect("logical");
    let plan = Planner::new(PlannerConfig::default())
        .plan(&logical, &ctx)
        .expect("plan");
    ctx.cancel_token().cancel();
    let err = Executor::new().execute(&plan, &ctx).expect_err("cancelled");
    assert_eq!(err.code(), "Cancelled");
}

#[test]
fn cancelling_from_another_thread_unblocks_sub_selects() {
    init_tracing();
    let m = ColumnDef::new("s.m", ColumnType::Long);
    let slow = slow_table("s", &m, 500, Duration::from_millis(20));
    let table = slow_table("t", &id(), 50, Duration::ZERO);
    let ctx = context(2);
    let sub = LogicalPlanBuilder::new(&ctx)
        .scan(slow, &[m.clone()])
        .build()
        .expect("sub-query");
    let predicate = BooleanPredicate::comparison(ComparisonOperator::In {
        value: Binding::Column(id()),
        list: vec![Binding::Subquery {
            group: LogicalPlanBuilder::group_of(&sub),
            column: m,
        }],
    });
    let logical = LogicalPlanBuilder::new(&ctx)
        .scan(table, &[id()])
        .filter_on_subselect(predicate, vec![sub])
        .build()
        .expect("logical");
    let plan = Planner::new(PlannerConfig::default())
        .plan(&logical, &ctx)
        .expect("plan");
    let mut stream = Executor::new().execute(&plan, &ctx).expect("execute");

    let token = ctx.cancel_token().clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        token.cancel();
    });
    let started = Instant::now();
    let err = stream.next().expect("cancellation").expect_err("cancelled");
    assert!(err.is_cancelled());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(stream.next().is_none());
    canceller.join().expect("canceller");
}

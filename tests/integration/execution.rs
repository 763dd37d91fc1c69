use std::sync::{Arc, Once};
use std::time::Duration;

use tessera::config::{PlannerConfig, QueryConfig};
use tessera::query::binding::Binding;
use tessera::query::catalog::{BoxCursor, Cursor, MemoryTable, TableHandle};
use tessera::query::cost::CostPolicy;
use tessera::query::errors::ExecutionError;
use tessera::query::predicate::{BooleanPredicate, ComparisonOperator};
use tessera::query::statistics::ValueStatistics;
use tessera::query::traits::SortOrder;
use tessera::query::value::{ColumnDef, ColumnType, RowId, Tuple, Value};
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

fn tag() -> ColumnDef {
    ColumnDef::new("t.tag", ColumnType::String)
}

fn table(rows: i64) -> Arc<MemoryTable> {
    let table = Arc::new(MemoryTable::new("t", vec![id(), tag()]));
    for i in 0..rows {
        let tag = if i % 2 == 0 { "a" } else { "b" };
        table
            .push(vec![Value::Long(i), Value::String(tag.into())])
            .expect("insert");
    }
    table
}

fn context(workers: usize) -> QueryContext {
    let mut config = QueryConfig::default();
    config.execution.max_workers = workers;
    QueryContext::new("exec", Arc::new(config))
}

fn parallel(ctx: QueryContext) -> QueryContext {
    let policy = CostPolicy::new(1.0, 0.0, 0.0, 0.0, 0.05, 0.0).expect("policy");
    ctx.with_hints(QueryHints::default().with(QueryHint::CostPolicy(policy)))
        .expect("hints")
}

fn sequential(ctx: QueryContext) -> QueryContext {
    ctx.with_hints(QueryHints::default().with(QueryHint::NoParallel))
        .expect("hints")
}

fn collect(planner: &Planner, logical: &tessera::query::logical::LogicalNode, ctx: &QueryContext) -> Vec<Tuple> {
    let plan = planner.plan(logical, ctx).expect("plan");
    Executor::new()
        .execute(&plan, ctx)
        .expect("execute")
        .collect::<Result<Vec<_>, _>>()
        .expect("tuples")
}

fn longs(tuples: &[Tuple], column: &ColumnDef) -> Vec<i64> {
    tuples
        .iter()
        .map(|t| match t.get(column) {
            Some(Value::Long(v)) => *v,
            other => panic!("expected a long, got {other:?}"),
        })
        .collect()
}

fn compare(op: fn(Binding, Binding) -> ComparisonOperator, column: ColumnDef, value: Binding) -> BooleanPredicate {
    BooleanPredicate::comparison(op(Binding::Column(column), value))
}

#[test]
fn filter_sort_limit() {
    let ctx = sequential(context(1));
    let table = table(100);
    let ten = ctx.bindings().write().bind(10i64);
    let a = ctx.bindings().write().bind("a");
    let logical = LogicalPlanBuilder::new(&ctx)
        .scan(table, &[])
        .filter(
            compare(ComparisonOperator::GreaterEqual, id(), ten)
                .and(compare(ComparisonOperator::Equal, tag(), a)),
        )
        .sort(vec![(id(), SortOrder::Descending)])
        .limit(0, 5)
        .build()
        .expect("logical");
    let tuples = collect(&Planner::new(PlannerConfig::default()), &logical, &ctx);
    assert_eq!(longs(&tuples, &id()), vec![98, 96, 94, 92, 90]);
}

#[test]
fn count_pushdown_is_equivalent_to_counting() {
    for rows in [0, 1, 10_000] {
        let ctx = sequential(context(1));
        let logical = LogicalPlanBuilder::new(&ctx)
            .scan(table(rows), &[id()])
            .count()
            .build()
            .expect("logical");
        let pushed = Planner::new(PlannerConfig::default());
        let plain = Planner::new(PlannerConfig::default()).with_rules(Vec::new());
        assert_eq!(pushed.plan(&logical, &ctx).expect("plan").root.name(), "EntityCount");
        assert_eq!(plain.plan(&logical, &ctx).expect("plan").root.name(), "Projection");
        let count = ColumnDef::new("count", ColumnType::Long);
        assert_eq!(longs(&collect(&pushed, &logical, &ctx), &count), vec![rows]);
        assert_eq!(longs(&collect(&plain, &logical, &ctx), &count), vec![rows]);
    }
}

#[test]
fn partitioned_scans_return_every_row_once() {
    init_tracing();
    let ctx = parallel(context(4));
    let from = ctx.bindings().write().bind(5_000i64);
    let logical = LogicalPlanBuilder::new(&ctx)
        .scan(table(20_000), &[id()])
        .filter(compare(ComparisonOperator::GreaterEqual, id(), from))
        .build()
        .expect("logical");
    let planner = Planner::new(PlannerConfig::default());
    let plan = planner.plan(&logical, &ctx).expect("plan");
    assert!(plan.explain.partitions > 1);
    let mut ids = longs(&collect(&planner, &logical, &ctx), &id());
    ids.sort_unstable();
    assert_eq!(ids, (5_000..20_000).collect::<Vec<_>>());
}

#[test]
fn partitioned_top_k_merges_in_order() {
    let ctx = parallel(context(4));
    let logical = LogicalPlanBuilder::new(&ctx)
        .scan(table(20_000), &[id()])
        .sort(vec![(id(), SortOrder::Descending)])
        .limit(2, 5)
        .build()
        .expect("logical");
    let planner = Planner::new(PlannerConfig::default());
    let plan = planner.plan(&logical, &ctx).expect("plan");
    assert_eq!(plan.root.count("MergeLimitingSort"), 1);
    assert_eq!(plan.root.count("LimitingSort"), plan.explain.partitions);
    let tuples = collect(&planner, &logical, &ctx);
    assert_eq!(longs(&tuples, &id()), vec![19_997, 19_996, 19_995, 19_994, 19_993]);
}

fn slow_sub_select(
    ctx: &QueryContext,
    outer: Arc<MemoryTable>,
    values: impl IntoIterator<Item = i64>,
    delay: Duration,
) -> (tessera::query::logical::LogicalNode, Arc<MemoryTable>) {
    let m = ColumnDef::new("s.m", ColumnType::Long);
    let slow = Arc::new(MemoryTable::new("s", vec![m.clone()]).with_read_delay(delay));
    for v in values {
        slow.push(vec![Value::Long(v)]).expect("insert");
    }
    let sub = LogicalPlanBuilder::new(ctx)
        .scan(Arc::clone(&slow) as Arc<dyn TableHandle>, &[m.clone()])
        .build()
        .expect("sub-query");
    let predicate = BooleanPredicate::comparison(ComparisonOperator::In {
        value: Binding::Column(id()),
        list: vec![Binding::Subquery {
            group: LogicalPlanBuilder::group_of(&sub),
            column: m,
        }],
    });
    let logical = LogicalPlanBuilder::new(ctx)
        .scan(outer, &[id()])
        .filter_on_subselect(predicate, vec![sub])
        .build()
        .expect("logical");
    (logical, slow)
}

#[test]
fn sub_selects_finish_before_filtering() {
    init_tracing();
    let ctx = context(2);
    let (logical, slow) = slow_sub_select(&ctx, table(50), (0..20).map(|i| i * 3), Duration::from_millis(3));
    let plan = Planner::new(PlannerConfig::default())
        .plan(&logical, &ctx)
        .expect("plan");
    let mut stream = Executor::new().execute(&plan, &ctx).expect("execute");

    let first = stream.next().expect("tuple").expect("no error");
    assert_eq!(slow.read_count(), 20);
    let mut ids = longs(&[first], &id());
    ids.extend(longs(&stream.collect::<Result<Vec<_>, _>>().expect("tuples"), &id()));
    ids.sort_unstable();
    assert_eq!(ids, (0..17).map(|i| i * 3).collect::<Vec<_>>());
    assert_eq!(slow.read_count(), 20);
}

#[test]
fn overlapping_executions_keep_their_own_sub_query_results() {
    init_tracing();
    let ctx = context(2);
    let (logical, _) = slow_sub_select(&ctx, table(20), 0..20, Duration::from_millis(20));
    let plan = Planner::new(PlannerConfig::default())
        .plan(&logical, &ctx)
        .expect("plan");
    let executor = Executor::new();

    let mut first = executor.execute(&plan, &ctx).expect("execute");
    first.next().expect("tuple").expect("no error");
    let (first_rows, second_rows) = std::thread::scope(|scope| {
        let second = scope.spawn(|| {
            executor
                .execute(&plan, &ctx)
                .expect("execute")
                .collect::<Result<Vec<_>, _>>()
                .expect("tuples")
                .len()
        });
        std::thread::sleep(Duration::from_millis(50));
        let rest = first.by_ref().collect::<Result<Vec<_>, _>>().expect("tuples");
        (rest.len() + 1, second.join().expect("second execution"))
    });
    assert_eq!(first_rows, 20);
    assert_eq!(second_rows, 20);
}

#[test]
fn sinks_report_affected_rows() {
    let ctx = sequential(context(1));
    let table = table(10);
    let planner = Planner::new(PlannerConfig::default());
    let executor = Executor::new();

    let values = {
        let mut bindings = ctx.bindings().write();
        vec![(id(), bindings.bind(100i64)), (tag(), bindings.bind("a"))]
    };
    let insert = LogicalPlanBuilder::new(&ctx)
        .insert(Arc::clone(&table) as Arc<dyn TableHandle>, values)
        .build()
        .expect("insert");
    let mut stream = executor
        .execute(&planner.plan(&insert, &ctx).expect("plan"), &ctx)
        .expect("execute");
    assert!(stream.columns().is_empty());
    assert!(stream.next().is_none());
    assert_eq!(stream.rows_affected(), 1);

    let a = ctx.bindings().write().bind("a");
    let c = ctx.bindings().write().bind("c");
    let update = LogicalPlanBuilder::new(&ctx)
        .scan(Arc::clone(&table) as Arc<dyn TableHandle>, &[])
        .filter(compare(ComparisonOperator::Equal, tag(), a))
        .update(Arc::clone(&table) as Arc<dyn TableHandle>, vec![(tag(), c.clone())])
        .build()
        .expect("update");
    let mut stream = executor
        .execute(&planner.plan(&update, &ctx).expect("plan"), &ctx)
        .expect("execute");
    assert!(stream.next().is_none());
    assert_eq!(stream.rows_affected(), 6);

    let delete = LogicalPlanBuilder::new(&ctx)
        .scan(Arc::clone(&table) as Arc<dyn TableHandle>, &[])
        .filter(compare(ComparisonOperator::Equal, tag(), c))
        .delete(Arc::clone(&table) as Arc<dyn TableHandle>)
        .build()
        .expect("delete");
    let mut stream = executor
        .execute(&planner.plan(&delete, &ctx).expect("plan"), &ctx)
        .expect("execute");
    assert!(stream.next().is_none());
    assert_eq!(stream.rows_affected(), 6);
    assert_eq!(table.count_rows().expect("count"), 5);
}

#[test]
fn set_operators() {
    let n = ColumnDef::new("x.n", ColumnType::Long);
    let make = |name: &str, range: std::ops::Range<i64>| {
        let table = Arc::new(MemoryTable::new(name, vec![n.clone()]));
        for v in range {
            table.push(vec![Value::Long(v)]).expect("insert");
        }
        table
    };
    let left = make("l", 0..10);
    let right = make("r", 5..15);
    let ctx = sequential(context(2));
    let planner = Planner::new(PlannerConfig::default());

    let other = LogicalPlanBuilder::new(&ctx)
        .scan(Arc::clone(&right) as Arc<dyn TableHandle>, &[])
        .build()
        .expect("right");
    let union = LogicalPlanBuilder::new(&ctx)
        .scan(Arc::clone(&left) as Arc<dyn TableHandle>, &[])
        .union(other.clone(), true)
        .build()
        .expect("union");
    let mut values = longs(&collect(&planner, &union, &ctx), &n);
    values.sort_unstable();
    assert_eq!(values, (0..15).collect::<Vec<_>>());

    let all = LogicalPlanBuilder::new(&ctx)
        .scan(Arc::clone(&left) as Arc<dyn TableHandle>, &[])
        .union(other.clone(), false)
        .build()
        .expect("union all");
    assert_eq!(collect(&planner, &all, &ctx).len(), 20);

    let intersect = LogicalPlanBuilder::new(&ctx)
        .scan(left, &[])
        .intersect(other)
        .build()
        .expect("intersect");
    let mut values = longs(&collect(&planner, &intersect, &ctx), &n);
    values.sort_unstable();
    assert_eq!(values, (5..10).collect::<Vec<_>>());
}

#[test]
fn index_scans_match_full_scans() {
    let table = Arc::new(MemoryTable::new("t", vec![id(), tag()]));
    for i in 0..1_000 {
        table
            .push(vec![Value::Long(i), Value::String(format!("tag{}", i % 100))])
            .expect("insert");
    }
    table.create_hash_index(&tag()).expect("index");
    let ctx = sequential(context(1));
    let wanted = ctx.bindings().write().bind("tag7");
    let logical = LogicalPlanBuilder::new(&ctx)
        .scan(Arc::clone(&table) as Arc<dyn TableHandle>, &[id(), tag()])
        .filter(compare(ComparisonOperator::Equal, tag(), wanted))
        .build()
        .expect("logical");
    let planner = Planner::new(PlannerConfig::default());
    let plan = planner.plan(&logical, &ctx).expect("plan");
    assert_eq!(plan.root.count("IndexScan"), 1);
    let mut indexed = longs(&collect(&planner, &logical, &ctx), &id());
    indexed.sort_unstable();

    let no_index = ctx
        .fork("no-index")
        .with_hints([QueryHint::NoIndex, QueryHint::NoParallel].into_iter().collect())
        .expect("hints");
    let plan = planner.plan(&logical, &no_index).expect("plan");
    assert_eq!(plan.root.count("IndexScan"), 0);
    let mut scanned = longs(&collect(&planner, &logical, &no_index), &id());
    scanned.sort_unstable();

    assert_eq!(indexed, (0..10).map(|i| i * 100 + 7).collect::<Vec<_>>());
    assert_eq!(indexed, scanned);
}

#[test]
fn large_sorts_spill_to_disk() {
    init_tracing();
    let spill = tempfile::tempdir().expect("spill dir");
    let mut config = QueryConfig::default();
    config.execution.max_workers = 1;
    config.execution.spill_dir = Some(spill.path().to_path_buf());
    let ctx = QueryContext::new("spill", Arc::new(config));
    let logical = LogicalPlanBuilder::new(&ctx)
        .scan(table(500), &[id()])
        .sort(vec![(id(), SortOrder::Descending)])
        .build()
        .expect("logical");
    let planner = Planner::new(PlannerConfig {
        memory_budget_bytes: 256,
        ..PlannerConfig::default()
    });
    let plan = planner.plan(&logical, &ctx).expect("plan");
    assert_eq!(plan.root.name(), "ExternalSort");
    let ids = longs(&collect(&planner, &logical, &ctx), &id());
    assert_eq!(ids, (0..500).rev().collect::<Vec<_>>());
}

/// Entity whose scans fail after a fixed number of rows.
#[derive(Debug)]
struct FlakyTable {
    inner: MemoryTable,
    fail_after: usize,
}

struct FlakyCursor {
    inner: BoxCursor,
    left: usize,
}

impl Cursor for FlakyCursor {
    fn try_next(&mut self) -> Result<Option<Tuple>, ExecutionError> {
        if self.left == 0 {
            return Err(ExecutionError::Storage("disk went away".into()));
        }
        self.left -= 1;
        self.inner.try_next()
    }
}

impl TableHandle for FlakyTable {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn columns(&self) -> &[ColumnDef] {
        self.inner.columns()
    }

    fn count_rows(&self) -> Result<u64, ExecutionError> {
        self.inner.count_rows()
    }

    fn scan(&self, columns: &[ColumnDef], partition: usize, partitions: usize) -> Result<BoxCursor, ExecutionError> {
        Ok(Box::new(FlakyCursor {
            inner: self.inner.scan(columns, partition, partitions)?,
            left: self.fail_after,
        }))
    }

    fn read(&self, row_id: RowId, columns: &[ColumnDef]) -> Result<Option<Tuple>, ExecutionError> {
        self.inner.read(row_id, columns)
    }

    fn insert(&self, columns: &[ColumnDef], values: Vec<Value>) -> Result<RowId, ExecutionError> {
        self.inner.insert(columns, values)
    }

    fn update(&self, row_id: RowId, columns: &[ColumnDef], values: Vec<Value>) -> Result<(), ExecutionError> {
        self.inner.update(row_id, columns, values)
    }

    fn delete(&self, row_id: RowId) -> Result<bool, ExecutionError> {
        self.inner.delete(row_id)
    }

    fn statistics(&self, column: &ColumnDef) -> Option<Arc<dyn ValueStatistics>> {
        self.inner.statistics(column)
    }
}

#[test]
fn storage_errors_end_the_stream() {
    init_tracing();
    let inner = MemoryTable::new("t", vec![id()]);
    for i in 0..10 {
        inner.push(vec![Value::Long(i)]).expect("insert");
    }
    let flaky = Arc::new(FlakyTable {
        inner,
        fail_after: 3,
    });
    let ctx = sequential(context(1));
    let logical = LogicalPlanBuilder::new(&ctx)
        .scan(flaky, &[id()])
        .build()
        .expect("logical");
    let plan = Planner::new(PlannerConfig::default())
        .plan(&logical, &ctx)
        .expect("plan");
    let mut stream = Executor::new().execute(&plan, &ctx).expect("execute");
    let delivered: Vec<Tuple> = stream.by_ref().take(3).map(|t| t.expect("tuple")).collect();
    assert_eq!(longs(&delivered, &id()), vec![0, 1, 2]);
    let err = stream.next().expect("error").expect_err("storage failure");
    assert_eq!(err.code(), "Storage");
    assert!(stream.next().is_none());
}

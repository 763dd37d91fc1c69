use std::sync::Arc;

use tessera::config::{MatchOrder, PlannerConfig, QueryConfig};
use tessera::query::binding::{Binding, BindingContext};
use tessera::query::catalog::{MemoryTable, TableHandle};
use tessera::query::context::QueryHints;
use tessera::query::cost::CostPolicy;
use tessera::query::errors::PlanningError;
use tessera::query::logical::LogicalNode;
use tessera::query::physical::PhysicalNode;
use tessera::query::predicate::{BooleanPredicate, ComparisonOperator};
use tessera::query::rules::{default_rules, rewrite, RewriteRule, RuleContext};
use tessera::query::traits::SortOrder;
use tessera::query::value::{ColumnDef, ColumnType, Value};
use tessera::query::{LogicalPlanBuilder, Planner, QueryContext, QueryHint};

fn id() -> ColumnDef {
    ColumnDef::new("t.id", ColumnType::Long)
}

fn name() -> ColumnDef {
    ColumnDef::new("t.name", ColumnType::String)
}

fn embedding() -> ColumnDef {
    ColumnDef::new("t.embedding", ColumnType::FloatVector(32))
}

fn table() -> Arc<MemoryTable> {
    let table = Arc::new(MemoryTable::new("t", vec![id(), name(), embedding()]));
    for i in 0..2_000i64 {
        table
            .push(vec![
                Value::Long(i),
                Value::String(format!("n{}", i % 200)),
                Value::FloatVector(vec![i as f32; 32]),
            ])
            .expect("insert");
    }
    table.create_hash_index(&name()).expect("index");
    table
}

fn context() -> QueryContext {
    let mut config = QueryConfig::default();
    config.execution.max_workers = 1;
    QueryContext::new("rules", Arc::new(config))
}

/// One logical tree per rule, each shaped so that its rule matches.
fn trees(ctx: &QueryContext, table: &Arc<MemoryTable>) -> Vec<LogicalNode> {
    let wanted = ctx.bindings().write().bind("n7");
    let query_vector = ctx.bindings().write().bind(vec![0.5f32; 32]);
    let count = LogicalPlanBuilder::new(ctx)
        .scan(Arc::clone(table) as Arc<dyn TableHandle>, &[id()])
        .count()
        .build();
    let lookup = LogicalPlanBuilder::new(ctx)
        .scan(Arc::clone(table) as Arc<dyn TableHandle>, &[id(), name()])
        .filter(BooleanPredicate::comparison(ComparisonOperator::Equal(
            Binding::Column(name()),
            wanted,
        )))
        .build();
    let top_k = LogicalPlanBuilder::new(ctx)
        .scan(Arc::clone(table) as Arc<dyn TableHandle>, &[id(), embedding()])
        .function("cosine", vec![Binding::Column(embedding()), query_vector], "score")
        .sort(vec![(ColumnDef::nullable("score", ColumnType::Float), SortOrder::Ascending)])
        .limit(0, 10)
        .build();
    let sort = LogicalPlanBuilder::new(ctx)
        .scan(Arc::clone(table) as Arc<dyn TableHandle>, &[id()])
        .sort(vec![(id(), SortOrder::Descending)])
        .build();
    [count, lookup, top_k, sort]
        .into_iter()
        .map(|tree| tree.expect("logical"))
        .collect()
}

struct Fixture {
    bindings: BindingContext,
    policy: CostPolicy,
    config: PlannerConfig,
    hints: QueryHints,
}

impl Fixture {
    fn new(ctx: &QueryContext) -> Self {
        Self {
            bindings: ctx.bindings().read().copy(),
            policy: CostPolicy::default(),
            config: PlannerConfig {
                memory_budget_bytes: 1_024,
                vectorisation_threshold: 16,
                ..PlannerConfig::default()
            },
            hints: QueryHints::default(),
        }
    }

    fn rule_context(&self) -> RuleContext<'_> {
        RuleContext {
            bindings: &self.bindings,
            policy: &self.policy,
            config: &self.config,
            hints: &self.hints,
        }
    }
}

fn nodes(root: &PhysicalNode) -> Vec<&PhysicalNode> {
    let mut all = Vec::new();
    root.walk(&mut |node| all.push(node));
    all
}

#[test]
fn rules_do_not_refire_on_their_own_output() {
    let ctx = context();
    let table = table();
    let trees = trees(&ctx, &table);
    let fixture = Fixture::new(&ctx);
    let rule_ctx = fixture.rule_context();
    let mut fired = Vec::new();
    for tree in trees {
        let physical = tree.implement();
        for node in nodes(&physical) {
            for rule in default_rules() {
                if let Some(output) = rule.try_apply(node, &rule_ctx) {
                    fired.push(rule.name);
                    assert!(
                        rule.try_apply(&output, &rule_ctx).is_none(),
                        "{} fired twice",
                        rule.name
                    );
                }
            }
        }
    }
    for rule in default_rules() {
        assert!(fired.contains(&rule.name), "{} never fired", rule.name);
    }
}

#[test]
fn rewrite_reaches_a_stable_fixpoint() {
    let ctx = context();
    let table = table();
    let trees = trees(&ctx, &table);
    let fixture = Fixture::new(&ctx);
    let rule_ctx = fixture.rule_context();
    for order in [MatchOrder::TopDown, MatchOrder::BottomUp] {
        for tree in &trees {
            let outcome = rewrite(Arc::new(tree.implement()), &default_rules(), &rule_ctx, order, 8)
                .expect("rewrite");
            assert!(outcome.passes <= 8);
            assert!(!outcome.fired.is_empty());
            outcome.root.validate().expect("valid rewrite");
            let again = rewrite(Arc::clone(&outcome.root), &default_rules(), &rule_ctx, order, 8)
                .expect("second rewrite");
            assert_eq!(again.passes, 1);
            assert!(again.fired.is_empty());
            assert_eq!(again.root.digest(), outcome.root.digest());
        }
    }
}

fn always(node: &PhysicalNode, _ctx: &RuleContext<'_>) -> Option<PhysicalNode> {
    Some(node.with_inputs(node.inputs.clone()))
}

#[test]
fn runaway_rules_hit_the_pass_cap() {
    let ctx = context();
    let table = table();
    let tree = trees(&ctx, &table).remove(0);
    let fixture = Fixture::new(&ctx);
    let runaway = RewriteRule {
        name: "Runaway",
        apply: always,
    };
    let err = rewrite(
        Arc::new(tree.implement()),
        &[runaway],
        &fixture.rule_context(),
        MatchOrder::TopDown,
        3,
    )
    .expect_err("no fixpoint");
    assert!(matches!(err, PlanningError::RewriteLimitExceeded { passes: 3 }));
}

#[test]
fn digests_survive_copies_and_ignore_groups() {
    let table = table();
    let first = context();
    let second = context();
    second.next_group_id();
    second.next_group_id();
    let a = trees(&first, &table);
    let b = trees(&second, &table);
    for (x, y) in a.iter().zip(&b) {
        assert_ne!(x.group_id, y.group_id);
        assert_eq!(x.digest(), y.digest());
        assert_eq!(x.copy().digest(), x.digest());
        let physical = x.implement();
        assert_eq!(physical.copy().digest(), physical.digest());
    }
    let digests: Vec<u64> = a.iter().map(LogicalNode::digest).collect();
    for (i, d) in digests.iter().enumerate() {
        assert!(!digests[i + 1..].contains(d), "digest collision");
    }
}

#[test]
fn planner_caches_per_hint_set() {
    let ctx = context();
    let table = table();
    let planner = Planner::new(PlannerConfig::default());
    let tree = trees(&ctx, &table).remove(1);
    let first = planner.plan(&tree, &ctx).expect("plan");
    assert!(!first.explain.cached);
    assert!(first.explain.rules.iter().any(|r| r == "BooleanIndexScan"));
    let second = planner.plan(&tree, &ctx).expect("plan");
    assert!(second.explain.cached);
    assert_eq!(first.digest, second.digest);

    let no_index = ctx
        .fork("no-index")
        .with_hints(QueryHints::default().with(QueryHint::NoIndex))
        .expect("hints");
    let third = planner.plan(&tree, &no_index).expect("plan");
    assert!(!third.explain.cached);
    assert_eq!(third.root.count("IndexScan"), 0);
    assert_eq!(planner.cached_plans(), 2);
}

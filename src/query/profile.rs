use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// Environment variable enabling the profiling counters.
pub const PROFILE_ENV: &str = "TESSERA_PROFILE";

/// A snapshot of planning and execution profiling metrics.
///
/// Profiling is enabled via the `TESSERA_PROFILE` environment variable and
/// tracks time and call counts per phase across all queries of the process.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryProfileSnapshot {
    /// Total nanoseconds spent in `Planner::plan`.
    pub plan_ns: u64,
    /// Number of plans produced.
    pub plan_count: u64,
    /// Number of plans served from the plan cache.
    pub plan_cache_hits: u64,
    /// Total nanoseconds spent in the rewrite driver.
    pub rewrite_ns: u64,
    /// Number of rewrite rule applications.
    pub rule_fired_count: u64,
    /// Total nanoseconds spent lowering plans into operators.
    pub lower_ns: u64,
    /// Number of lowered operators.
    pub lower_count: u64,
    /// Total nanoseconds spent producing result tuples.
    pub stream_iter_ns: u64,
    /// Number of result tuples pulled.
    pub stream_iter_count: u64,
    /// Total nanoseconds spent in sort operators.
    pub sort_ns: u64,
    /// Number of sort runs (one per sort operator, plus one per spilled chunk).
    pub sort_count: u64,
    /// Total nanoseconds spent evaluating filter predicates.
    pub filter_ns: u64,
    /// Number of predicate evaluations.
    pub filter_count: u64,
}

#[derive(Default)]
struct QueryProfileCounters {
    plan_ns: AtomicU64,
    plan_count: AtomicU64,
    plan_cache_hits: AtomicU64,
    rewrite_ns: AtomicU64,
    rule_fired_count: AtomicU64,
    lower_ns: AtomicU64,
    lower_count: AtomicU64,
    stream_iter_ns: AtomicU64,
    stream_iter_count: AtomicU64,
    sort_ns: AtomicU64,
    sort_count: AtomicU64,
    filter_ns: AtomicU64,
    filter_count: AtomicU64,
}

static PROFILE_ENABLED: OnceLock<bool> = OnceLock::new();
static PROFILE_COUNTERS: OnceLock<QueryProfileCounters> = OnceLock::new();

fn profiling_enabled() -> bool {
    *PROFILE_ENABLED.get_or_init(|| std::env::var_os(PROFILE_ENV).is_some())
}

fn counters() -> Option<&'static QueryProfileCounters> {
    profiling_enabled().then(|| PROFILE_COUNTERS.get_or_init(QueryProfileCounters::default))
}

pub(crate) fn profile_timer() -> Option<Instant> {
    profiling_enabled().then(Instant::now)
}

pub(crate) enum QueryProfileKind {
    /// A complete `Planner::plan` call.
    Plan,
    /// The rewrite fixpoint loop.
    Rewrite,
    /// Lowering of one physical node.
    Lower,
    /// One pull on the result stream.
    StreamIter,
    /// One sort run.
    Sort,
    /// One predicate evaluation.
    Filter,
}

pub(crate) fn record_profile_timer(kind: QueryProfileKind, start: Option<Instant>) {
    let Some(start) = start else {
        return;
    };
    let Some(counters) = counters() else {
        return;
    };
    let nanos = start.elapsed().as_nanos().min(u64::MAX as u128) as u64;
    let (ns, count) = match kind {
        QueryProfileKind::Plan => (&counters.plan_ns, &counters.plan_count),
        QueryProfileKind::Rewrite => (&counters.rewrite_ns, &counters.rule_fired_count),
        QueryProfileKind::Lower => (&counters.lower_ns, &counters.lower_count),
        QueryProfileKind::StreamIter => (&counters.stream_iter_ns, &counters.stream_iter_count),
        QueryProfileKind::Sort => (&counters.sort_ns, &counters.sort_count),
        QueryProfileKind::Filter => (&counters.filter_ns, &counters.filter_count),
    };
    ns.fetch_add(nanos, Ordering::Relaxed);
    if !matches!(kind, QueryProfileKind::Rewrite) {
        count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Adds `fired` rule applications to the rewrite counter.
pub(crate) fn record_rules_fired(fired: usize) {
    if let Some(counters) = counters() {
        counters
            .rule_fired_count
            .fetch_add(fired as u64, Ordering::Relaxed);
    }
}

/// Counts a plan served from the plan cache.
pub(crate) fn record_plan_cache_hit() {
    if let Some(counters) = counters() {
        counters.plan_cache_hits.fetch_add(1, Ordering::Relaxed);
    }
}

/// Retrieves a snapshot of current profiling metrics.
///
/// # Arguments
///
/// * `reset` - If `true`, resets all counters to zero after reading them.
///
/// # Returns
///
/// Returns `Some(QueryProfileSnapshot)` if profiling is enabled via the
/// `TESSERA_PROFILE` environment variable, or `None` if profiling is disabled.
///
/// # Example
///
/// ```no_run
/// use tessera::query::profile::profile_snapshot;
///
/// if let Some(snapshot) = profile_snapshot(true) {
///     println!("plans: {} ({} cached)", snapshot.plan_count, snapshot.plan_cache_hits);
/// }
/// ```
pub fn profile_snapshot(reset: bool) -> Option<QueryProfileSnapshot> {
    let counters = counters()?;
    let load = |counter: &AtomicU64| {
        if reset {
            counter.swap(0, Ordering::Relaxed)
        } else {
            counter.load(Ordering::Relaxed)
        }
    };
    Some(QueryProfileSnapshot {
        plan_ns: load(&counters.plan_ns),
        plan_count: load(&counters.plan_count),
        plan_cache_hits: load(&counters.plan_cache_hits),
        rewrite_ns: load(&counters.rewrite_ns),
        rule_fired_count: load(&counters.rule_fired_count),
        lower_ns: load(&counters.lower_ns),
        lower_count: load(&counters.lower_count),
        stream_iter_ns: load(&counters.stream_iter_ns),
        stream_iter_count: load(&counters.stream_iter_count),
        sort_ns: load(&counters.sort_ns),
        sort_count: load(&counters.sort_count),
        filter_ns: load(&counters.filter_ns),
        filter_count: load(&counters.filter_count),
    })
}

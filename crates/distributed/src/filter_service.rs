//! Coordinator-side dynamic filter registry and aggregator.
//!
//! Responsibilities:
//! - keep one [`DynamicFilterContext`] per registered query;
//! - record partial domains reported by build-side tasks;
//! - publish one summary per filter once its completion policy holds;
//! - resolve lazy completion signals consumed by probe-side handles.
//!
//! Concurrency:
//! - all per-query state lives in concurrent maps; no caller waits on a
//!   coarse lock;
//! - a filter's partial-domain entry is removed exactly once, and only the
//!   caller that removed it publishes the summary;
//! - aggregation attempts run on the [`AggregationPool`] and may be repeated
//!   freely, later attempts find nothing left to do.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sift_common::metrics::global_metrics;
use sift_common::{
    DynamicFilterConfig, DynamicFilterId, QueryId, Result, SiftError, StageId, TaskId,
};
use sift_planner::{
    ColumnHandle, DynamicFilterDescriptor, Domain, PlanFragment, SubPlan, Symbol,
    classify_sub_plan, is_collecting_task_needed, source_stage_inner_lazy_dynamic_filters,
};
use tracing::{debug, error, info, warn};

use crate::dynamic_filter::{CoordinatorDynamicFilter, DynamicFilter, EmptyDynamicFilter};
use crate::pool::AggregationPool;
use crate::signal::CompletionSignal;

/// Per-filter diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicFilterDomainStats {
    pub dynamic_filter_id: DynamicFilterId,
    /// Summary collapsed to a single range for display.
    pub simplified_domain: String,
    pub range_count: usize,
    pub discrete_values_count: usize,
    /// Time from query registration to publication.
    pub collection_duration: Option<Duration>,
}

/// Per-query diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicFiltersStats {
    pub dynamic_filter_domain_stats: Vec<DynamicFilterDomainStats>,
    pub lazy_dynamic_filters: usize,
    pub replicated_dynamic_filters: usize,
    pub total_dynamic_filters: usize,
    pub dynamic_filters_completed: usize,
}

#[derive(Debug, Clone, Copy)]
struct SummaryLimits {
    max_domain_ranges: usize,
    max_discrete_values: usize,
}

impl SummaryLimits {
    fn apply(&self, domain: Domain) -> Domain {
        let threshold = if domain.is_discrete() {
            self.max_discrete_values
        } else {
            self.max_domain_ranges
        };
        domain.simplify(threshold)
    }
}

/// Filter bookkeeping for one query.
#[derive(Debug)]
pub(crate) struct DynamicFilterContext {
    query_id: QueryId,
    registered_at: Instant,
    limits: SummaryLimits,
    produced: BTreeSet<DynamicFilterId>,
    replicated: BTreeSet<DynamicFilterId>,
    /// Fixed at registration; one signal per lazy filter.
    lazy_signals: HashMap<DynamicFilterId, CompletionSignal>,
    /// Published summaries; written once per filter.
    summaries: DashMap<DynamicFilterId, Domain>,
    /// Partial domains of not-yet-published filters. Removal elects the publisher.
    task_domains: DashMap<DynamicFilterId, Arc<DashMap<TaskId, Domain>>>,
    /// First report of each replicated filter; later reports only check against it.
    replicated_reports: DashMap<DynamicFilterId, (TaskId, Domain)>,
    stage_task_counts: DashMap<StageId, usize>,
    collection_durations: DashMap<DynamicFilterId, Duration>,
    completed: AtomicUsize,
    removed: AtomicBool,
}

impl DynamicFilterContext {
    fn new(
        query_id: QueryId,
        produced: BTreeSet<DynamicFilterId>,
        lazy: BTreeSet<DynamicFilterId>,
        replicated: BTreeSet<DynamicFilterId>,
        limits: SummaryLimits,
    ) -> Self {
        let task_domains = DashMap::new();
        for id in &produced {
            task_domains.insert(*id, Arc::new(DashMap::new()));
        }
        Self {
            query_id,
            registered_at: Instant::now(),
            limits,
            lazy_signals: lazy
                .into_iter()
                .map(|id| (id, CompletionSignal::new()))
                .collect(),
            produced,
            replicated,
            summaries: DashMap::new(),
            task_domains,
            replicated_reports: DashMap::new(),
            stage_task_counts: DashMap::new(),
            collection_durations: DashMap::new(),
            completed: AtomicUsize::new(0),
            removed: AtomicBool::new(false),
        }
    }

    pub(crate) fn summary(&self, id: &DynamicFilterId) -> Option<Domain> {
        self.summaries.get(id).map(|d| d.value().clone())
    }

    pub(crate) fn lazy_signal(&self, id: &DynamicFilterId) -> Option<&CompletionSignal> {
        self.lazy_signals.get(id)
    }

    fn record_partials(&self, task_id: TaskId, domains: &HashMap<DynamicFilterId, Domain>) -> Result<()> {
        for (id, domain) in domains {
            // Absent entry: already published or not produced by this query.
            let Some(partials) = self.task_domains.get(id).map(|e| Arc::clone(e.value())) else {
                continue;
            };
            if self.replicated.contains(id) {
                self.record_replicated(*id, task_id, domain, &partials)?;
                continue;
            }
            let previous = partials.entry(task_id).or_insert_with(|| domain.clone());
            if previous.value() != domain {
                return Err(SiftError::InternalState(format!(
                    "task {task_id} reported different domains for dynamic filter {id}: {} vs {domain}",
                    previous.value()
                )));
            }
        }
        Ok(())
    }

    /// The entry lock makes the first report the only partial ever recorded.
    fn record_replicated(
        &self,
        id: DynamicFilterId,
        task_id: TaskId,
        domain: &Domain,
        partials: &DashMap<TaskId, Domain>,
    ) -> Result<()> {
        match self.replicated_reports.entry(id) {
            dashmap::Entry::Occupied(first) => {
                let (first_task, first_domain) = first.get();
                if first_domain != domain {
                    return Err(SiftError::InternalState(format!(
                        "replicated dynamic filter {id} reported different domains by tasks {first_task} and {task_id}: {first_domain} vs {domain}"
                    )));
                }
            }
            dashmap::Entry::Vacant(slot) => {
                partials.insert(task_id, domain.clone());
                slot.insert((task_id, domain.clone()));
            }
        }
        Ok(())
    }

    fn uncollected(&self) -> Vec<DynamicFilterId> {
        self.task_domains.iter().map(|e| *e.key()).collect()
    }

    fn is_complete(&self, id: &DynamicFilterId, partials: &DashMap<TaskId, Domain>) -> bool {
        if partials.iter().any(|e| e.value().is_all()) {
            return true;
        }
        if self.replicated.contains(id) {
            return partials.len() == 1;
        }
        let stages = partials
            .iter()
            .map(|e| e.key().stage_id)
            .collect::<BTreeSet<_>>();
        if stages.len() != 1 {
            return false;
        }
        let Some(stage) = stages.first() else {
            return false;
        };
        self.stage_task_counts
            .get(stage)
            .is_some_and(|count| *count == partials.len())
    }

    /// One aggregation attempt over `ids`. Safe to run concurrently and repeatedly.
    fn collect(&self, ids: &[DynamicFilterId]) -> Result<()> {
        for id in ids {
            if self.removed.load(Ordering::Acquire) {
                return Ok(());
            }
            let Some(partials) = self.task_domains.get(id).map(|e| Arc::clone(e.value())) else {
                continue;
            };
            if !self.is_complete(id, &partials) {
                continue;
            }
            let Some((_, partials)) = self.task_domains.remove(id) else {
                // Another attempt won the publish.
                continue;
            };
            let summary = if self.replicated.contains(id) {
                // Only the first report is recorded, so this is the single partial.
                partials
                    .iter()
                    .next()
                    .map(|e| e.value().clone())
                    .unwrap_or_else(Domain::none)
            } else {
                let collected = partials.iter().map(|e| e.value().clone()).collect::<Vec<_>>();
                Domain::union_all(collected.iter())
            };
            self.publish(*id, self.limits.apply(summary));
        }
        Ok(())
    }

    fn publish(&self, id: DynamicFilterId, summary: Domain) {
        let elapsed = self.registered_at.elapsed();
        debug!(
            query_id = %self.query_id,
            dynamic_filter_id = %id,
            domain = %summary.simplify(1),
            operator = "DynamicFilterPublish",
            "dynamic filter collected"
        );
        self.summaries.insert(id, summary);
        self.collection_durations.insert(id, elapsed);
        self.completed.fetch_add(1, Ordering::AcqRel);
        if let Some(signal) = self.lazy_signals.get(&id) {
            signal.complete();
        }
        global_metrics().record_dynamic_filter_published(self.query_id.0, elapsed.as_secs_f64());
    }

    fn stats(&self) -> DynamicFiltersStats {
        let mut dynamic_filter_domain_stats = self
            .summaries
            .iter()
            .map(|e| DynamicFilterDomainStats {
                dynamic_filter_id: *e.key(),
                simplified_domain: e.value().simplify(1).to_string(),
                range_count: e.value().range_count(),
                discrete_values_count: e.value().discrete_values_count(),
                collection_duration: self.collection_durations.get(e.key()).map(|d| *d),
            })
            .collect::<Vec<_>>();
        dynamic_filter_domain_stats.sort_by_key(|s| s.dynamic_filter_id);
        DynamicFiltersStats {
            dynamic_filter_domain_stats,
            lazy_dynamic_filters: self.lazy_signals.len(),
            replicated_dynamic_filters: self.replicated.len(),
            total_dynamic_filters: self.produced.len(),
            dynamic_filters_completed: self.completed.load(Ordering::Acquire),
        }
    }
}

/// Registry of per-query dynamic filter contexts.
#[derive(Debug)]
pub struct DynamicFilterService {
    config: DynamicFilterConfig,
    pool: Arc<AggregationPool>,
    contexts: DashMap<QueryId, Arc<DynamicFilterContext>>,
}

impl DynamicFilterService {
    pub fn new(config: DynamicFilterConfig, pool: AggregationPool) -> Self {
        Self {
            config,
            pool: Arc::new(pool),
            contexts: DashMap::new(),
        }
    }

    /// Service aggregating on the current tokio runtime with
    /// `service_thread_count` concurrent jobs.
    pub fn with_current_runtime(config: DynamicFilterConfig) -> Result<Self> {
        config.validate()?;
        let pool = AggregationPool::current(config.service_thread_count)?;
        Ok(Self::new(config, pool))
    }

    /// Service with an inline pool: aggregation completes before each call returns.
    pub fn inline(config: DynamicFilterConfig) -> Self {
        Self::new(config, AggregationPool::inline())
    }

    pub fn config(&self) -> &DynamicFilterConfig {
        &self.config
    }

    /// Idempotent; a second registration of the same query is ignored.
    pub fn register_query(
        &self,
        query_id: QueryId,
        produced: BTreeSet<DynamicFilterId>,
        lazy: BTreeSet<DynamicFilterId>,
        replicated: BTreeSet<DynamicFilterId>,
    ) {
        if !self.config.enabled {
            return;
        }
        let limits = SummaryLimits {
            max_domain_ranges: self.config.max_domain_ranges,
            max_discrete_values: self.config.max_discrete_values,
        };
        let mut created = false;
        self.contexts.entry(query_id).or_insert_with(|| {
            created = true;
            Arc::new(DynamicFilterContext::new(
                query_id, produced, lazy, replicated, limits,
            ))
        });
        if created {
            info!(
                query_id = %query_id,
                operator = "DynamicFilterRegister",
                "query registered for dynamic filtering"
            );
        }
    }

    /// Registers the filters produced anywhere in `plan`.
    pub fn register_query_plan(&self, query_id: QueryId, plan: &SubPlan) {
        let classified = classify_sub_plan(plan);
        if classified.produced.is_empty() {
            return;
        }
        self.register_query(
            query_id,
            classified.produced,
            classified.lazy,
            classified.replicated,
        );
    }

    pub fn is_registered(&self, query_id: QueryId) -> bool {
        self.contexts.contains_key(&query_id)
    }

    /// Drops the query context and resolves every lazy signal still pending.
    pub fn remove_query(&self, query_id: QueryId) {
        let Some((_, context)) = self.contexts.remove(&query_id) else {
            return;
        };
        context.removed.store(true, Ordering::Release);
        let released = context
            .lazy_signals
            .values()
            .filter(|signal| signal.complete())
            .count();
        info!(
            query_id = %query_id,
            released_signals = released,
            operator = "DynamicFilterRemove",
            "query removed from dynamic filtering"
        );
    }

    fn context(&self, query_id: QueryId) -> Option<Arc<DynamicFilterContext>> {
        self.contexts.get(&query_id).map(|c| Arc::clone(c.value()))
    }

    /// Records partial domains reported by one build-side task.
    ///
    /// A task must report a stable value: a different domain for a
    /// `(filter, task)` pair it already reported is an [`SiftError::InternalState`].
    pub fn add_task_dynamic_filters(
        &self,
        task_id: TaskId,
        domains: HashMap<DynamicFilterId, Domain>,
    ) -> Result<()> {
        let Some(context) = self.context(task_id.query_id()) else {
            return Ok(());
        };
        context.record_partials(task_id, &domains)?;
        let ids = domains.into_keys().collect::<Vec<_>>();
        self.submit_collect(context, ids);
        Ok(())
    }

    /// Records the final task count of a stage, enabling the all-tasks-reported test.
    pub fn stage_cannot_schedule_more_tasks(&self, stage_id: StageId, number_of_tasks: usize) {
        let Some(context) = self.context(stage_id.query_id) else {
            return;
        };
        context.stage_task_counts.insert(stage_id, number_of_tasks);
        debug!(
            stage_id = %stage_id,
            number_of_tasks,
            operator = "DynamicFilterStageTasks",
            "stage task count finalized"
        );
        let ids = context.uncollected();
        self.submit_collect(context, ids);
    }

    fn submit_collect(&self, context: Arc<DynamicFilterContext>, ids: Vec<DynamicFilterId>) {
        if ids.is_empty() {
            return;
        }
        self.pool.execute(move || {
            if let Err(e) = context.collect(&ids) {
                error!(
                    query_id = %context.query_id,
                    error = %e,
                    operator = "DynamicFilterCollect",
                    "dynamic filter aggregation failed"
                );
            }
        });
    }

    pub fn is_collecting_task_needed(&self, query_id: QueryId, fragment: &PlanFragment) -> bool {
        self.is_registered(query_id) && is_collecting_task_needed(fragment)
    }

    /// Resolves, without data, the lazy signals of filters produced and
    /// consumed inside `fragment`'s source stage.
    pub fn unblock_stage_dynamic_filters(&self, query_id: QueryId, fragment: &PlanFragment) {
        let Some(context) = self.context(query_id) else {
            return;
        };
        let released = source_stage_inner_lazy_dynamic_filters(fragment)
            .iter()
            .filter_map(|id| context.lazy_signal(id))
            .filter(|signal| signal.complete())
            .count();
        if released > 0 {
            warn!(
                query_id = %query_id,
                fragment_id = %fragment.id,
                released,
                operator = "DynamicFilterUnblock",
                "lazy dynamic filters unblocked without data"
            );
            global_metrics().inc_dynamic_filters_forced_unblock(query_id.0, released as u64);
        }
    }

    /// Consumer handle for probe-side execution.
    ///
    /// Unregistered queries get a handle that never blocks and never filters.
    pub fn create_dynamic_filter(
        &self,
        query_id: QueryId,
        descriptors: Vec<DynamicFilterDescriptor>,
        column_mapping: HashMap<Symbol, ColumnHandle>,
    ) -> Result<Arc<dyn DynamicFilter>> {
        let Some(context) = self.context(query_id) else {
            return Ok(Arc::new(EmptyDynamicFilter));
        };
        if descriptors.is_empty() {
            return Ok(Arc::new(EmptyDynamicFilter));
        }
        Ok(Arc::new(CoordinatorDynamicFilter::new(
            context,
            descriptors,
            &column_mapping,
        )?))
    }

    pub fn get_summary(&self, query_id: QueryId, id: DynamicFilterId) -> Option<Domain> {
        self.context(query_id).and_then(|c| c.summary(&id))
    }

    pub fn dynamic_filtering_stats(&self, query_id: QueryId) -> Option<DynamicFiltersStats> {
        self.context(query_id).map(|c| c.stats())
    }

    /// Stops the aggregation pool; pending and future attempts are dropped.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use sift_planner::{Bound, ScalarValue};

    fn ids(values: &[u64]) -> BTreeSet<DynamicFilterId> {
        values.iter().copied().map(DynamicFilterId).collect()
    }

    fn int(v: i64) -> ScalarValue {
        ScalarValue::Int64(v)
    }

    fn task(query: u64, stage: u32, id: u32) -> TaskId {
        TaskId::new(StageId::new(QueryId(query), stage), id)
    }

    fn report(id: u64, domain: Domain) -> HashMap<DynamicFilterId, Domain> {
        HashMap::from([(DynamicFilterId(id), domain)])
    }

    fn service() -> DynamicFilterService {
        DynamicFilterService::inline(DynamicFilterConfig::default())
    }

    #[test]
    fn publishes_union_once_all_stage_tasks_reported() {
        let s = service();
        let q = QueryId(1);
        s.register_query(q, ids(&[1]), ids(&[1]), ids(&[]));
        let df = DynamicFilterId(1);

        s.add_task_dynamic_filters(task(1, 0, 0), report(1, Domain::single_value(int(1))))
            .expect("report 0");
        s.add_task_dynamic_filters(task(1, 0, 1), report(1, Domain::single_value(int(5))))
            .expect("report 1");
        assert!(s.get_summary(q, df).is_none());

        s.stage_cannot_schedule_more_tasks(StageId::new(q, 0), 2);
        assert_eq!(
            s.get_summary(q, df),
            Some(Domain::multiple_values([int(1), int(5)]))
        );
        let stats = s.dynamic_filtering_stats(q).expect("stats");
        assert_eq!(stats.dynamic_filters_completed, 1);
        assert_eq!(stats.dynamic_filter_domain_stats[0].discrete_values_count, 2);
        assert_eq!(stats.dynamic_filter_domain_stats[0].simplified_domain, "{ [1, 5] }");
        assert!(stats.dynamic_filter_domain_stats[0].collection_duration.is_some());
    }

    #[test]
    fn task_count_known_before_reports() {
        let s = service();
        let q = QueryId(2);
        s.register_query(q, ids(&[1]), ids(&[]), ids(&[]));
        s.stage_cannot_schedule_more_tasks(StageId::new(q, 3), 2);
        s.add_task_dynamic_filters(task(2, 3, 0), report(1, Domain::single_value(int(1))))
            .expect("report 0");
        assert!(s.get_summary(q, DynamicFilterId(1)).is_none());
        s.add_task_dynamic_filters(task(2, 3, 1), report(1, Domain::none()))
            .expect("report 1");
        assert_eq!(
            s.get_summary(q, DynamicFilterId(1)),
            Some(Domain::single_value(int(1)))
        );
    }

    #[test]
    fn any_all_domain_completes_immediately() {
        let s = service();
        let q = QueryId(3);
        s.register_query(q, ids(&[1]), ids(&[1]), ids(&[]));
        s.add_task_dynamic_filters(task(3, 0, 0), report(1, Domain::all()))
            .expect("report");
        assert_eq!(s.get_summary(q, DynamicFilterId(1)), Some(Domain::all()));
    }

    #[test]
    fn replicated_filter_uses_single_report() {
        let s = service();
        let q = QueryId(4);
        s.register_query(q, ids(&[1]), ids(&[1]), ids(&[1]));
        let d = Domain::range(Bound::Inclusive(int(10)), Bound::Exclusive(int(20)));
        s.add_task_dynamic_filters(task(4, 0, 0), report(1, d.clone()))
            .expect("report");
        assert_eq!(s.get_summary(q, DynamicFilterId(1)), Some(d.clone()));

        // Late reports for a published filter are ignored.
        s.add_task_dynamic_filters(task(4, 0, 1), report(1, Domain::single_value(int(99))))
            .expect("late report");
        assert_eq!(s.get_summary(q, DynamicFilterId(1)), Some(d));
    }

    #[test]
    fn conflicting_task_report_is_internal_state_error() {
        let s = service();
        let q = QueryId(5);
        s.register_query(q, ids(&[1]), ids(&[]), ids(&[]));
        s.add_task_dynamic_filters(task(5, 0, 0), report(1, Domain::single_value(int(1))))
            .expect("first");
        s.add_task_dynamic_filters(task(5, 0, 0), report(1, Domain::single_value(int(1))))
            .expect("same value again");
        let err = s
            .add_task_dynamic_filters(task(5, 0, 0), report(1, Domain::single_value(int(2))))
            .expect_err("narrowing");
        assert!(matches!(err, SiftError::InternalState(_)));
    }

    fn replicated_context(query: u64) -> DynamicFilterContext {
        DynamicFilterContext::new(
            QueryId(query),
            ids(&[1]),
            ids(&[1]),
            ids(&[1]),
            SummaryLimits {
                max_domain_ranges: 100,
                max_discrete_values: 100,
            },
        )
    }

    #[test]
    fn replicated_matching_second_report_is_ignored() {
        let context = replicated_context(13);
        let d = Domain::single_value(int(7));
        context
            .record_partials(task(13, 0, 0), &report(1, d.clone()))
            .expect("first");
        context
            .record_partials(task(13, 0, 1), &report(1, d.clone()))
            .expect("matching second");
        context.collect(&[DynamicFilterId(1)]).expect("collect");
        assert_eq!(context.summary(&DynamicFilterId(1)), Some(d));
        assert!(context.lazy_signal(&DynamicFilterId(1)).expect("lazy").is_done());
    }

    #[test]
    fn replicated_conflicting_second_report_is_internal_state_error() {
        let context = replicated_context(14);
        let d = Domain::single_value(int(7));
        context
            .record_partials(task(14, 0, 0), &report(1, d.clone()))
            .expect("first");
        let err = context
            .record_partials(task(14, 0, 1), &report(1, Domain::single_value(int(8))))
            .expect_err("conflict");
        assert!(matches!(err, SiftError::InternalState(_)));

        context.collect(&[DynamicFilterId(1)]).expect("collect");
        assert_eq!(context.summary(&DynamicFilterId(1)), Some(d));
    }

    #[test]
    fn unknown_query_calls_are_noops() {
        let s = service();
        let q = QueryId(6);
        s.add_task_dynamic_filters(task(6, 0, 0), report(1, Domain::all()))
            .expect("noop");
        s.stage_cannot_schedule_more_tasks(StageId::new(q, 0), 1);
        s.remove_query(q);
        assert!(s.get_summary(q, DynamicFilterId(1)).is_none());
        assert!(s.dynamic_filtering_stats(q).is_none());
    }

    #[test]
    fn disabled_service_registers_nothing() {
        let s = DynamicFilterService::inline(DynamicFilterConfig {
            enabled: false,
            ..DynamicFilterConfig::default()
        });
        s.register_query(QueryId(7), ids(&[1]), ids(&[1]), ids(&[]));
        assert!(!s.is_registered(QueryId(7)));
    }

    #[test]
    fn register_is_idempotent() {
        let s = service();
        let q = QueryId(8);
        s.register_query(q, ids(&[1]), ids(&[1]), ids(&[]));
        s.add_task_dynamic_filters(task(8, 0, 0), report(1, Domain::single_value(int(3))))
            .expect("report");
        s.register_query(q, ids(&[2]), ids(&[]), ids(&[]));
        let stats = s.dynamic_filtering_stats(q).expect("stats");
        assert_eq!(stats.total_dynamic_filters, 1);
        assert_eq!(stats.lazy_dynamic_filters, 1);
    }

    #[test]
    fn remove_query_releases_pending_signals() {
        let s = service();
        let q = QueryId(9);
        s.register_query(q, ids(&[1]), ids(&[1]), ids(&[]));
        let context = s.context(q).expect("context");
        let waiter = context
            .lazy_signal(&DynamicFilterId(1))
            .expect("lazy")
            .wait();
        s.remove_query(q);
        assert!(waiter.now_or_never().is_some());
        assert!(!s.is_registered(q));

        s.add_task_dynamic_filters(task(9, 0, 0), report(1, Domain::all()))
            .expect("late report dropped");
        assert!(s.get_summary(q, DynamicFilterId(1)).is_none());
    }

    #[test]
    fn union_is_independent_of_report_order() {
        let partials = [
            Domain::multiple_values([int(1), int(4)]),
            Domain::range(Bound::Inclusive(int(10)), Bound::Exclusive(int(20))),
            Domain::single_value(int(4)).with_null_allowed(true),
        ];
        let orders: [[usize; 3]; 3] = [[0, 1, 2], [2, 1, 0], [1, 2, 0]];
        let summaries = orders
            .iter()
            .map(|order| {
                let s = service();
                let q = QueryId(11);
                s.register_query(q, ids(&[1]), ids(&[]), ids(&[]));
                s.stage_cannot_schedule_more_tasks(StageId::new(q, 0), 3);
                for &i in order {
                    s.add_task_dynamic_filters(task(11, 0, i as u32), report(1, partials[i].clone()))
                        .expect("report");
                }
                s.get_summary(q, DynamicFilterId(1)).expect("published")
            })
            .collect::<Vec<_>>();
        assert!(summaries.windows(2).all(|w| w[0] == w[1]));
        assert!(summaries[0].is_null_allowed());
        assert_eq!(summaries[0].range_count(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reports_publish_once() {
        let s = Arc::new(
            DynamicFilterService::with_current_runtime(DynamicFilterConfig::default())
                .expect("service"),
        );
        let q = QueryId(12);
        let tasks = 16;
        s.register_query(q, ids(&[1]), ids(&[1]), ids(&[]));
        let signal = s
            .context(q)
            .and_then(|c| c.lazy_signal(&DynamicFilterId(1)).cloned())
            .expect("lazy signal");

        let mut handles = Vec::new();
        for t in 0..tasks {
            let s = Arc::clone(&s);
            handles.push(tokio::spawn(async move {
                s.add_task_dynamic_filters(task(12, 0, t), report(1, Domain::single_value(int(t as i64))))
                    .expect("report");
                s.stage_cannot_schedule_more_tasks(StageId::new(q, 0), tasks as usize);
            }));
        }
        for h in handles {
            h.await.expect("join");
        }
        tokio::time::timeout(std::time::Duration::from_secs(5), signal.wait())
            .await
            .expect("filter published");

        let stats = s.dynamic_filtering_stats(q).expect("stats");
        assert_eq!(stats.dynamic_filters_completed, 1);
        assert_eq!(
            s.get_summary(q, DynamicFilterId(1)),
            Some(Domain::multiple_values((0..tasks as i64).map(int)))
        );
        s.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_replicated_reports_publish_first_domain() {
        let s = Arc::new(
            DynamicFilterService::with_current_runtime(DynamicFilterConfig::default())
                .expect("service"),
        );
        let d = Domain::range(Bound::Inclusive(int(1)), Bound::Inclusive(int(9)));
        for round in 0..50u64 {
            let q = QueryId(100 + round);
            s.register_query(q, ids(&[1]), ids(&[1]), ids(&[1]));
            let signal = s
                .context(q)
                .and_then(|c| c.lazy_signal(&DynamicFilterId(1)).cloned())
                .expect("lazy signal");

            let mut handles = Vec::new();
            for t in 0..8 {
                let (s, d) = (Arc::clone(&s), d.clone());
                handles.push(tokio::spawn(async move {
                    s.add_task_dynamic_filters(
                        TaskId::new(StageId::new(q, 0), t),
                        report(1, d),
                    )
                    .expect("report");
                }));
            }
            for h in handles {
                h.await.expect("join");
            }
            tokio::time::timeout(std::time::Duration::from_secs(5), signal.wait())
                .await
                .expect("filter published");
            assert_eq!(s.get_summary(q, DynamicFilterId(1)), Some(d.clone()));
            s.remove_query(q);
        }
        s.shutdown();
    }

    #[test]
    fn summary_is_simplified_past_discrete_limit() {
        let s = DynamicFilterService::inline(DynamicFilterConfig {
            max_discrete_values: 3,
            ..DynamicFilterConfig::default()
        });
        let q = QueryId(10);
        s.register_query(q, ids(&[1]), ids(&[]), ids(&[1]));
        s.add_task_dynamic_filters(
            task(10, 0, 0),
            report(1, Domain::multiple_values((0..5).map(int))),
        )
        .expect("report");
        assert_eq!(
            s.get_summary(q, DynamicFilterId(1)),
            Some(Domain::range(Bound::Inclusive(int(0)), Bound::Inclusive(int(4))))
        );
    }
}

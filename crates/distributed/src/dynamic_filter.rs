//! Probe-side view of the dynamic filters collected by the coordinator.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use sift_common::{DynamicFilterId, Result, SiftError};
use sift_planner::{
    Bound, ColumnHandle, ComparisonOperator, DynamicFilterDescriptor, Domain, Range, Symbol,
    TupleDomain,
};

use crate::filter_service::DynamicFilterContext;
use crate::signal::{self, CompletionSignal};

/// Handle consumed by probe-side operators and split sources.
pub trait DynamicFilter: Send + Sync + fmt::Debug {
    /// Resolves when any outstanding lazy filter resolves; already resolved when none are left.
    fn is_blocked(&self) -> BoxFuture<'static, ()>;

    /// True while at least one lazy filter of this handle is unresolved.
    fn is_awaitable(&self) -> bool;

    /// True once every filter of this handle has a published summary.
    fn is_complete(&self) -> bool;

    /// Intersection of the translated summaries published so far. Never regresses.
    fn current_predicate(&self) -> TupleDomain<ColumnHandle>;
}

/// Handle for queries without dynamic filtering.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyDynamicFilter;

impl DynamicFilter for EmptyDynamicFilter {
    fn is_blocked(&self) -> BoxFuture<'static, ()> {
        signal::resolved()
    }

    fn is_awaitable(&self) -> bool {
        false
    }

    fn is_complete(&self) -> bool {
        true
    }

    fn current_predicate(&self) -> TupleDomain<ColumnHandle> {
        TupleDomain::all()
    }
}

#[derive(Debug, Clone)]
struct BoundDescriptor {
    descriptor: DynamicFilterDescriptor,
    column: ColumnHandle,
}

#[derive(Debug)]
struct CachedPredicate {
    published: usize,
    predicate: TupleDomain<ColumnHandle>,
}

/// Handle backed by a registered query's filter context.
pub struct CoordinatorDynamicFilter {
    context: Arc<DynamicFilterContext>,
    descriptors: Vec<BoundDescriptor>,
    filter_ids: BTreeSet<DynamicFilterId>,
    lazy_signals: Vec<CompletionSignal>,
    cache: Mutex<CachedPredicate>,
}

impl CoordinatorDynamicFilter {
    pub(crate) fn new(
        context: Arc<DynamicFilterContext>,
        descriptors: Vec<DynamicFilterDescriptor>,
        column_mapping: &HashMap<Symbol, ColumnHandle>,
    ) -> Result<Self> {
        let descriptors = descriptors
            .into_iter()
            .map(|descriptor| -> Result<BoundDescriptor> {
                let column = column_mapping.get(&descriptor.input).cloned().ok_or_else(|| {
                    SiftError::Planning(format!(
                        "dynamic filter {} input {} has no column mapping",
                        descriptor.id, descriptor.input
                    ))
                })?;
                Ok(BoundDescriptor { descriptor, column })
            })
            .collect::<Result<Vec<_>>>()?;
        let filter_ids = descriptors
            .iter()
            .map(|d| d.descriptor.id)
            .collect::<BTreeSet<_>>();
        let lazy_signals = filter_ids
            .iter()
            .filter_map(|id| context.lazy_signal(id).cloned())
            .collect();
        Ok(Self {
            context,
            descriptors,
            filter_ids,
            lazy_signals,
            cache: Mutex::new(CachedPredicate {
                published: 0,
                predicate: TupleDomain::all(),
            }),
        })
    }

    fn published_summaries(&self) -> BTreeMap<DynamicFilterId, Domain> {
        self.filter_ids
            .iter()
            .filter_map(|id| self.context.summary(id).map(|d| (*id, d)))
            .collect()
    }
}

impl fmt::Debug for CoordinatorDynamicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatorDynamicFilter")
            .field("filter_ids", &self.filter_ids)
            .field("lazy_signals", &self.lazy_signals.len())
            .finish()
    }
}

impl DynamicFilter for CoordinatorDynamicFilter {
    fn is_blocked(&self) -> BoxFuture<'static, ()> {
        let pending = self
            .lazy_signals
            .iter()
            .filter(|s| !s.is_done())
            .map(CompletionSignal::wait)
            .collect::<Vec<_>>();
        signal::any_of(pending)
    }

    fn is_awaitable(&self) -> bool {
        self.lazy_signals.iter().any(|s| !s.is_done())
    }

    fn is_complete(&self) -> bool {
        self.filter_ids
            .iter()
            .all(|id| self.context.summary(id).is_some())
    }

    fn current_predicate(&self) -> TupleDomain<ColumnHandle> {
        let summaries = self.published_summaries();
        {
            let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            if cache.published >= summaries.len() {
                return cache.predicate.clone();
            }
        }

        let predicate = self
            .descriptors
            .iter()
            .filter_map(|bound| {
                summaries.get(&bound.descriptor.id).map(|summary| {
                    let domain = translate_summary(&bound.descriptor, summary);
                    TupleDomain::with_column_domains(BTreeMap::from([(bound.column.clone(), domain)]))
                })
            })
            .fold(TupleDomain::all(), |acc, t| acc.intersect(&t));

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        // A concurrent caller may have cached a more complete predicate meanwhile.
        if cache.published < summaries.len() {
            cache.published = summaries.len();
            cache.predicate = predicate;
        }
        cache.predicate.clone()
    }
}

/// Maps a build-side summary onto the probe column per the descriptor's comparison.
pub fn translate_summary(descriptor: &DynamicFilterDescriptor, summary: &Domain) -> Domain {
    if summary.is_all() {
        return Domain::all();
    }
    if descriptor.operator == ComparisonOperator::Equal {
        return summary.with_null_allowed(descriptor.null_allowed && summary.is_null_allowed());
    }
    match summary.span().ranges().first() {
        Some(range) => compare_with_span(descriptor.operator, range),
        None => Domain::none(),
    }
}

fn compare_with_span(operator: ComparisonOperator, span: &Range) -> Domain {
    match operator {
        ComparisonOperator::Equal => Domain::range(span.low.clone(), span.high.clone()),
        ComparisonOperator::LessThan => Domain::range(Bound::Unbounded, exclusive(&span.high)),
        ComparisonOperator::LessThanOrEqual => Domain::range(Bound::Unbounded, span.high.clone()),
        ComparisonOperator::GreaterThan => Domain::range(exclusive(&span.low), Bound::Unbounded),
        ComparisonOperator::GreaterThanOrEqual => Domain::range(span.low.clone(), Bound::Unbounded),
    }
}

fn exclusive(bound: &Bound) -> Bound {
    match bound {
        Bound::Inclusive(v) | Bound::Exclusive(v) => Bound::Exclusive(v.clone()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

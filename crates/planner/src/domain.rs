//! Immutable predicate values: per-column [`Domain`]s and conjunctive [`TupleDomain`]s.
//!
//! A domain is a normalized, sorted list of disjoint ranges plus a null flag.
//! Discrete values are single-value ranges. All operations return new values;
//! nothing here is mutated after construction.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Typed literal carried in domain bounds.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ScalarValue {
    Boolean(bool),
    Int64(i64),
    Utf8(String),
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Boolean(v) => write!(f, "{v}"),
            ScalarValue::Int64(v) => write!(f, "{v}"),
            ScalarValue::Utf8(v) => write!(f, "'{v}'"),
        }
    }
}

/// One end of a [`Range`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Bound {
    Unbounded,
    Inclusive(ScalarValue),
    Exclusive(ScalarValue),
}

impl Bound {
    fn value(&self) -> Option<&ScalarValue> {
        match self {
            Bound::Unbounded => None,
            Bound::Inclusive(v) | Bound::Exclusive(v) => Some(v),
        }
    }
}

// Inclusive low bounds start before exclusive ones at the same value.
fn cmp_low(a: &Bound, b: &Bound) -> Ordering {
    match (a, b) {
        (Bound::Unbounded, Bound::Unbounded) => Ordering::Equal,
        (Bound::Unbounded, _) => Ordering::Less,
        (_, Bound::Unbounded) => Ordering::Greater,
        (Bound::Inclusive(x), Bound::Exclusive(y)) => x.cmp(y).then(Ordering::Less),
        (Bound::Exclusive(x), Bound::Inclusive(y)) => x.cmp(y).then(Ordering::Greater),
        (Bound::Inclusive(x), Bound::Inclusive(y)) | (Bound::Exclusive(x), Bound::Exclusive(y)) => {
            x.cmp(y)
        }
    }
}

// Exclusive high bounds end before inclusive ones at the same value.
fn cmp_high(a: &Bound, b: &Bound) -> Ordering {
    match (a, b) {
        (Bound::Unbounded, Bound::Unbounded) => Ordering::Equal,
        (Bound::Unbounded, _) => Ordering::Greater,
        (_, Bound::Unbounded) => Ordering::Less,
        (Bound::Inclusive(x), Bound::Exclusive(y)) => x.cmp(y).then(Ordering::Greater),
        (Bound::Exclusive(x), Bound::Inclusive(y)) => x.cmp(y).then(Ordering::Less),
        (Bound::Inclusive(x), Bound::Inclusive(y)) | (Bound::Exclusive(x), Bound::Exclusive(y)) => {
            x.cmp(y)
        }
    }
}

/// Contiguous interval of values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub low: Bound,
    pub high: Bound,
}

impl Range {
    /// Returns `None` for an empty interval.
    pub fn new(low: Bound, high: Bound) -> Option<Self> {
        let range = Self { low, high };
        range.is_valid().then_some(range)
    }

    pub fn all() -> Self {
        Self {
            low: Bound::Unbounded,
            high: Bound::Unbounded,
        }
    }

    pub fn single(value: ScalarValue) -> Self {
        Self {
            low: Bound::Inclusive(value.clone()),
            high: Bound::Inclusive(value),
        }
    }

    pub fn is_single_value(&self) -> bool {
        matches!((&self.low, &self.high), (Bound::Inclusive(a), Bound::Inclusive(b)) if a == b)
    }

    pub fn is_all(&self) -> bool {
        self.low == Bound::Unbounded && self.high == Bound::Unbounded
    }

    fn is_valid(&self) -> bool {
        match (self.low.value(), self.high.value()) {
            (Some(lo), Some(hi)) => match lo.cmp(hi) {
                Ordering::Less => true,
                Ordering::Equal => {
                    matches!(self.low, Bound::Inclusive(_)) && matches!(self.high, Bound::Inclusive(_))
                }
                Ordering::Greater => false,
            },
            _ => true,
        }
    }

    fn intersect(&self, other: &Range) -> Option<Range> {
        let low = match cmp_low(&self.low, &other.low) {
            Ordering::Less => other.low.clone(),
            _ => self.low.clone(),
        };
        let high = match cmp_high(&self.high, &other.high) {
            Ordering::Greater => other.high.clone(),
            _ => self.high.clone(),
        };
        Range::new(low, high)
    }

    // Assumes `self.low <= next.low`.
    fn touches(&self, next: &Range) -> bool {
        match (&self.high, &next.low) {
            (Bound::Unbounded, _) | (_, Bound::Unbounded) => true,
            (Bound::Exclusive(h), Bound::Exclusive(l)) => h > l,
            (h, l) => match (h.value(), l.value()) {
                (Some(h), Some(l)) => h >= l,
                _ => true,
            },
        }
    }

    fn span(&self, other: &Range) -> Range {
        let low = match cmp_low(&self.low, &other.low) {
            Ordering::Greater => other.low.clone(),
            _ => self.low.clone(),
        };
        let high = match cmp_high(&self.high, &other.high) {
            Ordering::Less => other.high.clone(),
            _ => self.high.clone(),
        };
        Range { low, high }
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single_value() {
            if let Bound::Inclusive(v) = &self.low {
                return write!(f, "[{v}]");
            }
        }
        match &self.low {
            Bound::Unbounded => write!(f, "(<min>")?,
            Bound::Inclusive(v) => write!(f, "[{v}")?,
            Bound::Exclusive(v) => write!(f, "({v}")?,
        }
        match &self.high {
            Bound::Unbounded => write!(f, ", <max>)"),
            Bound::Inclusive(v) => write!(f, ", {v}]"),
            Bound::Exclusive(v) => write!(f, ", {v})"),
        }
    }
}

fn normalize(mut ranges: Vec<Range>) -> Vec<Range> {
    ranges.sort_by(|a, b| cmp_low(&a.low, &b.low).then_with(|| cmp_high(&a.high, &b.high)));
    let mut out: Vec<Range> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match out.last_mut() {
            Some(last) if last.touches(&range) => *last = last.span(&range),
            _ => out.push(range),
        }
    }
    out
}

/// Allowed value set for one column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Domain {
    ranges: Vec<Range>,
    null_allowed: bool,
}

impl Domain {
    pub fn new(ranges: Vec<Range>, null_allowed: bool) -> Self {
        Self {
            ranges: normalize(ranges),
            null_allowed,
        }
    }

    pub fn all() -> Self {
        Self {
            ranges: vec![Range::all()],
            null_allowed: true,
        }
    }

    pub fn none() -> Self {
        Self {
            ranges: Vec::new(),
            null_allowed: false,
        }
    }

    pub fn only_null() -> Self {
        Self {
            ranges: Vec::new(),
            null_allowed: true,
        }
    }

    pub fn not_null() -> Self {
        Self {
            ranges: vec![Range::all()],
            null_allowed: false,
        }
    }

    pub fn single_value(value: ScalarValue) -> Self {
        Self {
            ranges: vec![Range::single(value)],
            null_allowed: false,
        }
    }

    pub fn multiple_values(values: impl IntoIterator<Item = ScalarValue>) -> Self {
        Self::new(values.into_iter().map(Range::single).collect(), false)
    }

    /// Non-null values within `[low, high]` (bounds per argument).
    pub fn range(low: Bound, high: Bound) -> Self {
        Self::new(Range::new(low, high).into_iter().collect(), false)
    }

    pub fn ranges(&self) -> &[Range] {
        &self.ranges
    }

    pub fn is_null_allowed(&self) -> bool {
        self.null_allowed
    }

    pub fn is_all(&self) -> bool {
        self.null_allowed && self.ranges.len() == 1 && self.ranges[0].is_all()
    }

    pub fn is_none(&self) -> bool {
        !self.null_allowed && self.ranges.is_empty()
    }

    pub fn is_single_value(&self) -> bool {
        !self.null_allowed && self.ranges.len() == 1 && self.ranges[0].is_single_value()
    }

    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    pub fn discrete_values_count(&self) -> usize {
        self.ranges.iter().filter(|r| r.is_single_value()).count()
    }

    pub fn is_discrete(&self) -> bool {
        self.ranges.iter().all(Range::is_single_value)
    }

    pub fn with_null_allowed(&self, null_allowed: bool) -> Self {
        Self {
            ranges: self.ranges.clone(),
            null_allowed,
        }
    }

    pub fn union(&self, other: &Domain) -> Domain {
        let mut ranges = self.ranges.clone();
        ranges.extend(other.ranges.iter().cloned());
        Domain::new(ranges, self.null_allowed || other.null_allowed)
    }

    /// Union of every domain; `NONE` for an empty input.
    pub fn union_all<'a>(domains: impl IntoIterator<Item = &'a Domain>) -> Domain {
        let mut ranges = Vec::new();
        let mut null_allowed = false;
        for d in domains {
            ranges.extend(d.ranges.iter().cloned());
            null_allowed |= d.null_allowed;
        }
        Domain::new(ranges, null_allowed)
    }

    pub fn intersect(&self, other: &Domain) -> Domain {
        let mut ranges = Vec::new();
        for a in &self.ranges {
            for b in &other.ranges {
                if let Some(r) = a.intersect(b) {
                    ranges.push(r);
                }
            }
        }
        Domain::new(ranges, self.null_allowed && other.null_allowed)
    }

    /// Single range covering every value, keeping the null flag.
    pub fn span(&self) -> Domain {
        let ranges = match (self.ranges.first(), self.ranges.last()) {
            (Some(first), Some(last)) => vec![Range {
                low: first.low.clone(),
                high: last.high.clone(),
            }],
            _ => Vec::new(),
        };
        Domain {
            ranges,
            null_allowed: self.null_allowed,
        }
    }

    /// Collapses to the span once more than `threshold` ranges are present.
    pub fn simplify(&self, threshold: usize) -> Domain {
        if self.ranges.len() > threshold {
            self.span()
        } else {
            self.clone()
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_all() {
            return f.write_str("ALL");
        }
        if self.is_none() {
            return f.write_str("NONE");
        }
        f.write_str("{ ")?;
        let mut first = true;
        for r in &self.ranges {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{r}")?;
        }
        if self.null_allowed {
            if !first {
                f.write_str(", ")?;
            }
            f.write_str("NULL")?;
        }
        f.write_str(" }")
    }
}

/// Conjunction of per-column domains. `None` inner map means unsatisfiable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TupleDomain<C: Ord> {
    domains: Option<BTreeMap<C, Domain>>,
}

impl<C: Ord + Clone> TupleDomain<C> {
    pub fn all() -> Self {
        Self {
            domains: Some(BTreeMap::new()),
        }
    }

    pub fn none() -> Self {
        Self { domains: None }
    }

    /// Drops unconstrained columns; any unsatisfiable column makes the whole tuple `NONE`.
    pub fn with_column_domains(domains: BTreeMap<C, Domain>) -> Self {
        if domains.values().any(Domain::is_none) {
            return Self::none();
        }
        Self {
            domains: Some(domains.into_iter().filter(|(_, d)| !d.is_all()).collect()),
        }
    }

    pub fn is_all(&self) -> bool {
        self.domains.as_ref().is_some_and(BTreeMap::is_empty)
    }

    pub fn is_none(&self) -> bool {
        self.domains.is_none()
    }

    pub fn domains(&self) -> Option<&BTreeMap<C, Domain>> {
        self.domains.as_ref()
    }

    pub fn column_domain(&self, column: &C) -> Option<&Domain> {
        self.domains.as_ref().and_then(|d| d.get(column))
    }

    pub fn intersect(&self, other: &TupleDomain<C>) -> TupleDomain<C> {
        let (Some(left), Some(right)) = (&self.domains, &other.domains) else {
            return Self::none();
        };
        let mut merged = left.clone();
        for (column, domain) in right {
            let next = match merged.get(column) {
                Some(existing) => existing.intersect(domain),
                None => domain.clone(),
            };
            merged.insert(column.clone(), next);
        }
        Self::with_column_domains(merged)
    }
}

impl<C: Ord + Clone + fmt::Display> fmt::Display for TupleDomain<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.domains {
            None => f.write_str("NONE"),
            Some(d) if d.is_empty() => f.write_str("ALL"),
            Some(d) => {
                let parts = d
                    .iter()
                    .map(|(c, dom)| format!("{c} -> {dom}"))
                    .collect::<Vec<_>>();
                write!(f, "{}", parts.join(" AND "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(v: i64) -> ScalarValue {
        ScalarValue::Int64(v)
    }

    #[test]
    fn union_merges_overlapping_ranges() {
        let a = Domain::range(Bound::Inclusive(int(1)), Bound::Inclusive(int(5)));
        let b = Domain::range(Bound::Exclusive(int(4)), Bound::Exclusive(int(9)));
        let u = a.union(&b);
        assert_eq!(u.range_count(), 1);
        assert_eq!(
            u.ranges()[0],
            Range::new(Bound::Inclusive(int(1)), Bound::Exclusive(int(9))).expect("range")
        );
    }

    #[test]
    fn union_keeps_gap_between_exclusive_bounds() {
        let a = Domain::range(Bound::Unbounded, Bound::Exclusive(int(3)));
        let b = Domain::range(Bound::Exclusive(int(3)), Bound::Unbounded);
        assert_eq!(a.union(&b).range_count(), 2);
        let c = Domain::single_value(int(3));
        assert_eq!(a.union(&b).union(&c), Domain::not_null());
    }

    #[test]
    fn intersect_discrete_values() {
        let a = Domain::multiple_values([int(1), int(2), int(3)]);
        let b = Domain::multiple_values([int(2), int(3), int(4)]);
        assert_eq!(a.intersect(&b), Domain::multiple_values([int(2), int(3)]));
        assert!(a.intersect(&Domain::single_value(int(9))).is_none());
    }

    #[test]
    fn all_and_none_identities() {
        let a = Domain::multiple_values([int(1), int(7)]);
        assert!(a.union(&Domain::all()).is_all());
        assert_eq!(a.intersect(&Domain::all()), a);
        assert_eq!(a.union(&Domain::none()), a);
        assert!(Domain::union_all([]).is_none());
    }

    #[test]
    fn simplify_collapses_to_span() {
        let a = Domain::multiple_values((0..10).map(int));
        assert_eq!(a.discrete_values_count(), 10);
        let s = a.simplify(4);
        assert_eq!(s.range_count(), 1);
        assert_eq!(s.discrete_values_count(), 0);
        assert_eq!(s.to_string(), "{ [0, 9] }");
        assert_eq!(a.simplify(10), a);
    }

    #[test]
    fn tuple_domain_intersection_collapses_to_none() {
        let mut left = BTreeMap::new();
        left.insert("a", Domain::single_value(int(1)));
        let mut right = BTreeMap::new();
        right.insert("a", Domain::single_value(int(2)));
        let t = TupleDomain::with_column_domains(left).intersect(&TupleDomain::with_column_domains(right));
        assert!(t.is_none());
    }

    #[test]
    fn tuple_domain_drops_unconstrained_columns() {
        let mut m = BTreeMap::new();
        m.insert("a", Domain::all());
        assert!(TupleDomain::with_column_domains(m).is_all());
        assert_eq!(TupleDomain::<&str>::all().to_string(), "ALL");
    }
}

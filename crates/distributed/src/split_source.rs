//! Connector-facing split enumeration.
//!
//! A [`SplitSource`] hands out splits in batches. Fetching a batch may be a
//! suspension point: the returned future stays pending until the connector
//! has splits ready or knows there are none left.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{self, BoxFuture, FutureExt};
use sift_common::{Result, SiftError};
use tokio::sync::watch;

use crate::task::Split;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitBatch {
    pub splits: Vec<Split>,
    /// No batch follows this one.
    pub last_batch: bool,
}

pub trait SplitSource: Send + fmt::Debug {
    /// Catalog the splits belong to; restricts candidate nodes.
    fn catalog(&self) -> Option<&str> {
        None
    }

    /// Fetches up to `max_size` splits.
    fn next_batch(&mut self, max_size: usize) -> BoxFuture<'static, Result<SplitBatch>>;

    /// Releases connector resources; outstanding fetches may fail afterwards.
    fn close(&mut self);

    fn is_finished(&self) -> bool;
}

/// Source over a split list known up front.
#[derive(Debug, Default)]
pub struct FixedSplitSource {
    catalog: Option<String>,
    splits: VecDeque<Split>,
    closed: bool,
}

impl FixedSplitSource {
    pub fn new(splits: impl IntoIterator<Item = Split>) -> Self {
        Self {
            catalog: None,
            splits: splits.into_iter().collect(),
            closed: false,
        }
    }

    /// `count` remotely accessible splits with ids `0..count`.
    pub fn with_count(count: u64) -> Self {
        Self::new((0..count).map(Split::new))
    }

    pub fn with_catalog(mut self, catalog: impl Into<String>) -> Self {
        self.catalog = Some(catalog.into());
        self
    }
}

impl SplitSource for FixedSplitSource {
    fn catalog(&self) -> Option<&str> {
        self.catalog.as_deref()
    }

    fn next_batch(&mut self, max_size: usize) -> BoxFuture<'static, Result<SplitBatch>> {
        if self.closed {
            return future::ready(Err(SiftError::Execution("split source closed".to_string()))).boxed();
        }
        let n = max_size.min(self.splits.len());
        let splits = self.splits.drain(..n).collect();
        let last_batch = self.splits.is_empty();
        future::ready(Ok(SplitBatch { splits, last_batch })).boxed()
    }

    fn close(&mut self) {
        self.closed = true;
        self.splits.clear();
    }

    fn is_finished(&self) -> bool {
        self.splits.is_empty()
    }
}

#[derive(Debug, Default)]
struct QueueState {
    splits: VecDeque<Split>,
    finished: bool,
    closed: bool,
}

#[derive(Debug)]
struct SplitQueueShared {
    state: Mutex<QueueState>,
    changed: watch::Sender<u64>,
}

impl SplitQueueShared {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.changed.send_modify(|generation| *generation += 1);
    }
}

/// Producer side of a [`QueuedSplitSource`].
#[derive(Debug, Clone)]
pub struct SplitQueue {
    shared: Arc<SplitQueueShared>,
}

impl SplitQueue {
    pub fn add_splits(&self, splits: impl IntoIterator<Item = Split>) {
        self.shared.state().splits.extend(splits);
        self.shared.notify();
    }

    /// No more splits will be added.
    pub fn finish(&self) {
        self.shared.state().finished = true;
        self.shared.notify();
    }
}

/// Source fed incrementally by a [`SplitQueue`].
#[derive(Debug)]
pub struct QueuedSplitSource {
    catalog: Option<String>,
    shared: Arc<SplitQueueShared>,
}

impl QueuedSplitSource {
    pub fn new() -> (Self, SplitQueue) {
        let (changed, _) = watch::channel(0);
        let shared = Arc::new(SplitQueueShared {
            state: Mutex::new(QueueState::default()),
            changed,
        });
        (
            Self {
                catalog: None,
                shared: Arc::clone(&shared),
            },
            SplitQueue { shared },
        )
    }

    pub fn with_catalog(mut self, catalog: impl Into<String>) -> Self {
        self.catalog = Some(catalog.into());
        self
    }
}

impl SplitSource for QueuedSplitSource {
    fn catalog(&self) -> Option<&str> {
        self.catalog.as_deref()
    }

    fn next_batch(&mut self, max_size: usize) -> BoxFuture<'static, Result<SplitBatch>> {
        let shared = Arc::clone(&self.shared);
        let mut changed = shared.changed.subscribe();
        async move {
            loop {
                {
                    let mut state = shared.state();
                    if state.closed {
                        return Err(SiftError::Execution("split source closed".to_string()));
                    }
                    if !state.splits.is_empty() || state.finished {
                        let n = max_size.min(state.splits.len());
                        let splits = state.splits.drain(..n).collect();
                        let last_batch = state.finished && state.splits.is_empty();
                        return Ok(SplitBatch { splits, last_batch });
                    }
                }
                changed.changed().await.map_err(|e| {
                    SiftError::Execution(format!("split queue dropped: {e}"))
                })?;
            }
        }
        .boxed()
    }

    fn close(&mut self) {
        let mut state = self.shared.state();
        state.closed = true;
        state.splits.clear();
        drop(state);
        self.shared.notify();
    }

    fn is_finished(&self) -> bool {
        let state = self.shared.state();
        state.finished && state.splits.is_empty()
    }
}

/// Source whose fetch never completes, as when its build side is stuck.
#[derive(Debug, Default)]
pub struct BlockedSplitSource {
    closed: bool,
}

impl BlockedSplitSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl SplitSource for BlockedSplitSource {
    fn next_batch(&mut self, _max_size: usize) -> BoxFuture<'static, Result<SplitBatch>> {
        future::pending().boxed()
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn is_finished(&self) -> bool {
        false
    }
}

//! Bounded executor for dynamic filter aggregation jobs.
//!
//! Jobs are short, CPU-only closures (domain unions). The pool is owned by
//! the service that submits to it and is shut down explicitly; jobs submitted
//! afterwards are dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use sift_common::{Result, SiftError};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::debug;

enum PoolKind {
    /// Run on the submitting thread.
    Inline,
    /// Run on a tokio runtime, at most `permits` jobs at a time.
    Runtime {
        handle: Handle,
        permits: Arc<Semaphore>,
    },
}

pub struct AggregationPool {
    kind: PoolKind,
    shutdown: AtomicBool,
}

impl AggregationPool {
    /// Executes every job synchronously inside `execute`.
    pub fn inline() -> Self {
        Self {
            kind: PoolKind::Inline,
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn new(handle: Handle, threads: usize) -> Self {
        Self {
            kind: PoolKind::Runtime {
                handle,
                permits: Arc::new(Semaphore::new(threads.max(1))),
            },
            shutdown: AtomicBool::new(false),
        }
    }

    /// Pool bound to the runtime of the calling context.
    pub fn current(threads: usize) -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| {
            SiftError::InvalidConfig(format!("aggregation pool requires a tokio runtime: {e}"))
        })?;
        Ok(Self::new(handle, threads))
    }

    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shutdown() {
            debug!(operator = "AggregationPool", "dropping job submitted after shutdown");
            return;
        }
        match &self.kind {
            PoolKind::Inline => job(),
            PoolKind::Runtime { handle, permits } => {
                let permits = Arc::clone(permits);
                handle.spawn(async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return;
                    };
                    job();
                });
            }
        }
    }

    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        if let PoolKind::Runtime { permits, .. } = &self.kind {
            permits.close();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for AggregationPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            PoolKind::Inline => "inline",
            PoolKind::Runtime { .. } => "runtime",
        };
        f.debug_struct("AggregationPool")
            .field("kind", &kind)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

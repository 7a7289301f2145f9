//! Leak detection for session tasks.
//!
//! Every task a session spawns registers a unique name with the session's
//! tracker and deregisters it when it exits. When the session ends,
//! [`LeakTracker::finish`] waits a bounded time for the names to clear and
//! logs `leak_ok`, or `leak_fail` followed by every task still outstanding
//! together with the call site that registered it.
//!
//! The `leak-detector` cargo feature selects the implementation behind
//! [`Tracker`]: the real [`LeakTracker`], or the zero-sized [`NoLeakTracker`]
//! whose methods compile to nothing.

use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::Instrument;

/// How long `finish` waits for outstanding tasks by default.
pub const DEFAULT_LEAK_TIMEOUT: Duration = Duration::from_secs(1);

/// Whether this build tracks session tasks.
pub const LEAK_DETECTION_ENABLED: bool = cfg!(feature = "leak-detector");

/// Tracker used by sessions in this build.
#[cfg(feature = "leak-detector")]
pub type Tracker = LeakTracker;

/// Tracker used by sessions in this build.
#[cfg(not(feature = "leak-detector"))]
pub type Tracker = NoLeakTracker;

/// Process-wide leak check results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeakStats {
    /// Sessions whose tasks all exited in time.
    pub success: u64,
    /// Sessions with at least one task still running at the deadline.
    pub failure: u64,
}

struct GlobalStats {
    success: AtomicU64,
    failure: AtomicU64,
    workers: watch::Sender<usize>,
}

static GLOBAL: LazyLock<GlobalStats> = LazyLock::new(|| GlobalStats {
    success: AtomicU64::new(0),
    failure: AtomicU64::new(0),
    workers: watch::Sender::new(0),
});

async fn wait_for_workers() {
    let mut workers = GLOBAL.workers.subscribe();
    let _ = workers.wait_for(|active| *active == 0).await;
}

/// Returns the aggregate counters once no `finish` check is in flight.
pub async fn global_stats() -> LeakStats {
    wait_for_workers().await;
    LeakStats {
        success: GLOBAL.success.load(Ordering::Acquire),
        failure: GLOBAL.failure.load(Ordering::Acquire),
    }
}

/// Resets the aggregate counters once no `finish` check is in flight.
pub async fn reset_global_stats() {
    wait_for_workers().await;
    GLOBAL.success.store(0, Ordering::Release);
    GLOBAL.failure.store(0, Ordering::Release);
}

struct WorkerGuard;

impl WorkerGuard {
    fn enter() -> Self {
        GLOBAL.workers.send_modify(|active| *active += 1);
        WorkerGuard
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        GLOBAL
            .workers
            .send_modify(|active| *active = active.saturating_sub(1));
    }
}

/// Tracks named tasks for one session.
pub struct LeakTracker {
    entries: DashMap<String, &'static Location<'static>>,
    outstanding: watch::Sender<usize>,
    timeout: Duration,
}

impl LeakTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            outstanding: watch::Sender::new(0),
            timeout,
        }
    }

    /// Registers a task.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already registered.
    #[track_caller]
    pub fn add(&self, name: &str) {
        let site = Location::caller();
        match self.entries.entry(name.to_string()) {
            Entry::Occupied(existing) => {
                let first = *existing.get();
                drop(existing);
                panic!("leak tracker: task {name:?} registered twice (first at {first})");
            }
            Entry::Vacant(slot) => {
                slot.insert(site);
            }
        }
        self.outstanding.send_modify(|n| *n += 1);
    }

    /// Deregisters a task.
    ///
    /// # Panics
    ///
    /// Panics if `name` is not registered.
    #[track_caller]
    pub fn done(&self, name: &str) {
        if self.entries.remove(name).is_none() {
            panic!("leak tracker: done called for unknown task {name:?}");
        }
        self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Registers a task and returns a guard that deregisters it on drop.
    #[track_caller]
    pub fn guard(self: &Arc<Self>, name: &str) -> LeakGuard {
        self.add(name);
        LeakGuard {
            tracker: Arc::clone(self),
            name: name.to_string(),
        }
    }

    /// Names and call sites of tasks still registered, sorted by name.
    pub fn outstanding(&self) -> Vec<(String, String)> {
        let mut out: Vec<_> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().to_string()))
            .collect();
        out.sort();
        out
    }

    /// Waits up to the timeout for every task to finish. Returns `true` when
    /// none are left.
    pub async fn settle(&self) -> bool {
        let mut outstanding = self.outstanding.subscribe();
        let settled = tokio::time::timeout(self.timeout, outstanding.wait_for(|n| *n == 0))
            .await
            .is_ok();
        settled
    }

    /// Checks for leaked tasks in the background and logs the outcome inside `span`.
    pub fn finish(self: &Arc<Self>, span: tracing::Span) {
        let worker = WorkerGuard::enter();
        let tracker = Arc::clone(self);

        tokio::spawn(
            async move {
                let _worker = worker;
                if tracker.settle().await {
                    GLOBAL.success.fetch_add(1, Ordering::AcqRel);
                    tracing::info!("leak_ok");
                    return;
                }

                GLOBAL.failure.fetch_add(1, Ordering::AcqRel);
                tracing::warn!("leak_fail");
                for (name, site) in tracker.outstanding() {
                    tracing::warn!("Leak Detector: {} ({:?})", name, site);
                }
            }
            .instrument(span),
        );
    }
}

impl std::fmt::Debug for LeakTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeakTracker")
            .field("outstanding", &self.entries.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Deregisters its task from a [`LeakTracker`] when dropped.
#[must_use = "the task is marked done as soon as the guard is dropped"]
pub struct LeakGuard {
    tracker: Arc<LeakTracker>,
    name: String,
}

impl Drop for LeakGuard {
    fn drop(&mut self) {
        self.tracker.done(&self.name);
    }
}

/// A tracker that tracks nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLeakTracker;

/// Guard returned by [`NoLeakTracker::guard`].
#[derive(Debug)]
pub struct NoLeakGuard;

impl NoLeakTracker {
    #[inline(always)]
    pub fn new(_timeout: Duration) -> Self {
        NoLeakTracker
    }

    #[inline(always)]
    pub fn add(&self, _name: &str) {}

    #[inline(always)]
    pub fn done(&self, _name: &str) {}

    #[inline(always)]
    pub fn guard(self: &Arc<Self>, _name: &str) -> NoLeakGuard {
        NoLeakGuard
    }

    #[inline(always)]
    pub fn outstanding(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    #[inline(always)]
    pub async fn settle(&self) -> bool {
        true
    }

    #[inline(always)]
    pub fn finish(self: &Arc<Self>, _span: tracing::Span) {}
}

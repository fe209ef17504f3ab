//! Background refresh of unknown and stale access points.
//!
//! The `RefreshCoordinator` owns the set of pending AP identifiers and
//! drives at most one refresh cycle at a time. A cycle repeatedly takes up
//! to one batch of pending identifiers, resolves them, writes answers and
//! negative entries back to the cache in one transaction, reports the
//! outcome on the event channel and, while work remains, waits for a
//! wake-up or the wait interval. It ends as soon as the pending set is
//! empty and is started again on the next submit.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ap::ApId;
use crate::cache::{CacheError, LocationCache};
use crate::models::LocationRecord;
use crate::resolver::{BatchResolver, Resolved};

/// Default pause between batches.
pub const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("Refresh coordinator has been shut down")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Active,
}

/// Status reported by the refresh cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshEvent {
    /// A batch was written to the cache; estimates should be recomputed.
    BatchCommitted { resolved: Vec<ApId>, unknown: Vec<ApId> },
    /// A batch could not be resolved or stored; it stays pending.
    BatchFailed { aps: Vec<ApId>, error: String },
    /// The pending set drained and the cycle ended.
    Idle,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshStats {
    pub cycles_started: u64,
    pub batches_committed: u64,
    pub batches_failed: u64,
    pub resolved: u64,
    pub unknown: u64,
}

#[derive(Default)]
struct PendingState {
    pending: BTreeSet<ApId>,
    active: bool,
    closed: bool,
    task: Option<JoinHandle<()>>,
    stats: RefreshStats,
}

struct Inner {
    cache: Arc<LocationCache>,
    resolver: BatchResolver,
    wait_interval: Duration,
    state: Mutex<PendingState>,
    wake: Notify,
    shutdown: watch::Sender<bool>,
    events: Option<mpsc::Sender<RefreshEvent>>,
    runtime: Handle,
}

enum BatchOutcome {
    Committed { resolved: Vec<ApId>, unknown: Vec<ApId> },
    Failed(String),
    CacheClosed,
}

/// Single-flight driver for background AP lookups. Clone is cheap.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    /// Create an idle coordinator.
    ///
    /// Cycles are spawned on the tokio runtime this is called from.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(
        cache: Arc<LocationCache>,
        resolver: BatchResolver,
        wait_interval: Duration,
        events: Option<mpsc::Sender<RefreshEvent>>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                cache,
                resolver,
                wait_interval,
                state: Mutex::new(PendingState::default()),
                wake: Notify::new(),
                shutdown,
                events,
                runtime: Handle::current(),
            }),
        }
    }

    /// Queue identifiers for resolution. Returns how many were new.
    ///
    /// Wakes a running cycle, or starts one if none is running.
    pub fn submit(&self, aps: impl IntoIterator<Item = ApId>) -> Result<usize, RefreshError> {
        let mut state = self.inner.lock_state();
        if state.closed {
            return Err(RefreshError::Closed);
        }

        let added = aps.into_iter().filter(|ap| state.pending.insert(ap.clone())).count();
        if state.pending.is_empty() {
            return Ok(0);
        }

        if !state.active {
            self.start_cycle(&mut state);
        } else if added > 0 {
            self.inner.wake.notify_one();
        }

        if added > 0 {
            debug!(added, pending = state.pending.len(), "Identifiers queued for refresh");
        }
        Ok(added)
    }

    /// Cut the current wait short, or start a cycle for leftover work.
    pub fn request_refresh(&self) -> Result<(), RefreshError> {
        let mut state = self.inner.lock_state();
        if state.closed {
            return Err(RefreshError::Closed);
        }
        if state.active {
            self.inner.wake.notify_one();
        } else if !state.pending.is_empty() {
            self.start_cycle(&mut state);
        }
        Ok(())
    }

    pub fn state(&self) -> RefreshState {
        if self.inner.lock_state().active {
            RefreshState::Active
        } else {
            RefreshState::Idle
        }
    }

    pub fn pending(&self) -> Vec<ApId> {
        self.inner.lock_state().pending.iter().cloned().collect()
    }

    pub fn stats(&self) -> RefreshStats {
        self.inner.lock_state().stats.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock_state().closed
    }

    /// Stop the coordinator and wait for the background cycle to exit.
    ///
    /// Pending identifiers are dropped. Calling this again, or while idle,
    /// is harmless.
    pub async fn shutdown(&self) {
        let task = {
            let mut state = self.inner.lock_state();
            if !state.closed {
                info!(dropped = state.pending.len(), "Refresh coordinator shutting down");
            }
            state.closed = true;
            state.pending.clear();
            state.task.take()
        };

        self.inner.shutdown.send_replace(true);
        self.inner.wake.notify_one();

        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Refresh cycle ended abnormally");
            }
        }
    }

    fn start_cycle(&self, state: &mut PendingState) {
        state.active = true;
        state.stats.cycles_started += 1;
        let inner = Arc::clone(&self.inner);
        state.task = Some(self.inner.runtime.spawn(Inner::run_cycle(inner)));
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, PendingState> {
        // The state is a plain set plus flags, still consistent after a panic elsewhere
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_cycle(self: Arc<Self>) {
        info!("Refresh cycle started");
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let batch: Vec<ApId> = {
                let mut state = self.lock_state();
                if state.closed {
                    state.active = false;
                    info!("Refresh cycle stopped");
                    return;
                }
                if state.pending.is_empty() {
                    // Cleared under the same lock as the check so a concurrent
                    // submit either sees us active or starts a new cycle.
                    state.active = false;
                    break;
                }
                state.pending.iter().take(self.resolver.batch_size()).cloned().collect()
            };

            debug!(count = batch.len(), "Resolving batch");
            let result = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    self.stop_after_shutdown();
                    return;
                }
                result = self.resolver.resolve(&batch) => result,
            };

            let outcome = match result {
                Ok(found) => self.write_back(&batch, found),
                Err(e) => {
                    warn!(error = %e, count = batch.len(), "Batch lookup failed, will retry");
                    BatchOutcome::Failed(e.to_string())
                }
            };

            let event = match outcome {
                BatchOutcome::Committed { resolved, unknown } => {
                    RefreshEvent::BatchCommitted { resolved, unknown }
                }
                BatchOutcome::Failed(error) => {
                    self.lock_state().stats.batches_failed += 1;
                    RefreshEvent::BatchFailed { aps: batch, error }
                }
                BatchOutcome::CacheClosed => {
                    warn!("Location cache closed underneath the refresh cycle");
                    let mut state = self.lock_state();
                    state.closed = true;
                    state.pending.clear();
                    state.active = false;
                    return;
                }
            };
            self.emit(event);

            // Nothing left to rate-limit against
            if self.lock_state().pending.is_empty() {
                continue;
            }

            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    self.stop_after_shutdown();
                    return;
                }
                _ = self.wake.notified() => debug!("Refresh cycle woken"),
                _ = tokio::time::sleep(self.wait_interval) => {}
            }
        }

        info!("Refresh cycle idle");
        self.emit(RefreshEvent::Idle);
    }

    fn stop_after_shutdown(&self) {
        self.lock_state().active = false;
        info!("Refresh cycle stopped");
    }

    /// Stage an answer or a negative entry for every AP in the batch and
    /// commit them together. Pending entries are only dropped once the
    /// commit succeeded.
    fn write_back(&self, batch: &[ApId], mut found: Resolved) -> BatchOutcome {
        let now = Utc::now();
        let mut resolved = Vec::new();
        let mut unknown = Vec::new();

        let committed = self.cache.edit().and_then(|mut editor| {
            for ap in batch {
                match found.remove(ap) {
                    Some(location) => {
                        editor.put(LocationRecord::resolved(ap.clone(), location, now));
                        resolved.push(ap.clone());
                    }
                    None => {
                        editor.put(LocationRecord::unknown(ap.clone(), now));
                        unknown.push(ap.clone());
                    }
                }
            }
            editor.commit()
        });

        match committed {
            Ok(_) => {
                let mut state = self.lock_state();
                for ap in batch {
                    state.pending.remove(ap);
                }
                state.stats.batches_committed += 1;
                state.stats.resolved += resolved.len() as u64;
                state.stats.unknown += unknown.len() as u64;
                debug!(
                    resolved = resolved.len(),
                    unknown = unknown.len(),
                    pending = state.pending.len(),
                    "Batch written to cache"
                );
                BatchOutcome::Committed { resolved, unknown }
            }
            Err(CacheError::Closed) => BatchOutcome::CacheClosed,
            Err(e) => {
                warn!(error = %e, count = batch.len(), "Failed to store batch, will retry");
                BatchOutcome::Failed(e.to_string())
            }
        }
    }

    /// Report progress without waiting on the consumer. Events that do not
    /// fit in the channel are dropped; the cache already holds the data.
    fn emit(&self, event: RefreshEvent) {
        let Some(tx) = &self.events else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                debug!(?event, "Refresh event dropped - consumer is behind");
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Refresh event dropped - receiver closed");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

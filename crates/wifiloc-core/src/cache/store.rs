use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use super::{CacheBackend, CacheError};
use crate::ap::ApId;
use crate::models::LocationRecord;

type Table = HashMap<ApId, LocationRecord>;

/// Immutable view of the cache as of the last commit.
///
/// An estimation pass reads every AP from one snapshot, so it never mixes
/// records from before and after a concurrent commit.
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot(Arc<Table>);

impl CacheSnapshot {
    pub fn get(&self, ap: &ApId) -> Option<&LocationRecord> {
        self.0.get(ap)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LocationRecord> {
        self.0.values()
    }
}

impl FromIterator<LocationRecord> for CacheSnapshot {
    fn from_iter<I: IntoIterator<Item = LocationRecord>>(iter: I) -> Self {
        Self(Arc::new(iter.into_iter().map(|r| (r.ap.clone(), r)).collect()))
    }
}

/// Persistent AP location cache.
///
/// Readers work off the last published table and never block on a writer.
/// Writers are serialized through `edit()`; a commit persists the merged
/// table before publishing it, so a failed write leaves readers on the
/// previous table.
pub struct LocationCache {
    backend: Box<dyn CacheBackend>,
    published: RwLock<CacheSnapshot>,
    writer: Mutex<()>,
    closed: AtomicBool,
}

impl LocationCache {
    pub fn open(backend: impl CacheBackend + 'static) -> Result<Self, CacheError> {
        let records = backend.load()?;
        // Later entries win, keeping one record per AP
        let snapshot: CacheSnapshot = records.into_iter().collect();
        info!(count = snapshot.len(), "Location cache opened");

        Ok(Self {
            backend: Box::new(backend),
            published: RwLock::new(snapshot),
            writer: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), CacheError> {
        if self.closed.load(Ordering::Acquire) {
            Err(CacheError::Closed)
        } else {
            Ok(())
        }
    }

    pub fn get(&self, ap: &ApId) -> Result<Option<LocationRecord>, CacheError> {
        Ok(self.snapshot()?.get(ap).cloned())
    }

    pub fn snapshot(&self) -> Result<CacheSnapshot, CacheError> {
        self.ensure_open()?;
        self.published
            .read()
            .map(|s| s.clone())
            .map_err(|_| CacheError::Lock)
    }

    /// Start a write transaction. Blocks while another editor is open.
    pub fn edit(&self) -> Result<Editor<'_>, CacheError> {
        self.ensure_open()?;
        let guard = self.writer.lock().map_err(|_| CacheError::Lock)?;
        Ok(Editor {
            cache: self,
            _guard: guard,
            staged: BTreeMap::new(),
        })
    }

    /// Release the cache. Every later call fails with `CacheError::Closed`,
    /// including commits of editors that are still open.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut published) = self.published.write() {
            *published = CacheSnapshot::default();
        }
        info!("Location cache closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn summary(&self, now: DateTime<Utc>, stale_window: Duration) -> Result<CacheSummary, CacheError> {
        let snapshot = self.snapshot()?;
        let mut summary = CacheSummary::default();
        for record in snapshot.iter() {
            if record.is_resolved() {
                summary.resolved += 1;
            } else {
                summary.unknown += 1;
            }
            if record.is_stale(now, stale_window) {
                summary.stale += 1;
            }
            if summary.newest.map_or(true, |newest| record.resolved_at > newest) {
                summary.newest = Some(record.resolved_at);
            }
        }
        Ok(summary)
    }

    fn apply(&self, staged: BTreeMap<ApId, LocationRecord>) -> Result<usize, CacheError> {
        self.ensure_open()?;
        let count = staged.len();

        let current = self.snapshot()?;
        let mut next: Table = (*current.0).clone();
        next.extend(staged);

        self.backend.persist(&next)?;

        let mut published = self.published.write().map_err(|_| CacheError::Lock)?;
        *published = CacheSnapshot(Arc::new(next));
        debug!(count, "Cache transaction committed");
        Ok(count)
    }
}

/// Write transaction over the cache.
///
/// Holds the writer slot until committed or dropped. Dropping without
/// `commit` discards everything staged.
pub struct Editor<'a> {
    cache: &'a LocationCache,
    _guard: MutexGuard<'a, ()>,
    staged: BTreeMap<ApId, LocationRecord>,
}

impl Editor<'_> {
    /// Stage an upsert keyed by the record's AP. A later put for the same
    /// AP replaces the earlier one.
    pub fn put(&mut self, record: LocationRecord) {
        self.staged.insert(record.ap.clone(), record);
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Apply all staged records at once. Returns how many were written.
    pub fn commit(self) -> Result<usize, CacheError> {
        let Editor { cache, _guard, staged } = self;
        if staged.is_empty() {
            return Ok(0);
        }
        cache.apply(staged)
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CacheSummary {
    pub resolved: usize,
    pub unknown: usize,
    pub stale: usize,
    pub newest: Option<DateTime<Utc>>,
}

impl CacheSummary {
    pub fn total(&self) -> usize {
        self.resolved + self.unknown
    }
}

// ============================================================================
// Tests
// ============================================================================

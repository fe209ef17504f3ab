//! Caller-facing locator API.
//!
//! `Locator` ties the cache, estimator and refresh coordinator together.
//! Fixes are delivered on the `LocatorEvent` channel returned by
//! `Locator::new`, both for scans handed in by the caller and for
//! recomputations triggered when the background refresh stores new data.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::LocationCache;
use crate::config::Config;
use crate::error::LocateError;
use crate::estimator::PositionEstimator;
use crate::models::{Fix, Observation};
use crate::refresh::{RefreshCoordinator, RefreshEvent};
use crate::resolver::{BatchResolver, LocationResolver};

/// Buffer size for the event channels.
/// 32 covers a burst of batch reports plus the fixes they trigger.
const CHANNEL_BUFFER_SIZE: usize = 32;

/// Supplies the currently visible access points on demand.
pub trait ScanSource: Send + Sync {
    fn scan(&self) -> Vec<Observation>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum LocatorEvent {
    Fix(Fix),
    Refresh(RefreshEvent),
}

struct Shared {
    cache: Arc<LocationCache>,
    coordinator: RefreshCoordinator,
    estimator: PositionEstimator,
    scan_source: Option<Arc<dyn ScanSource>>,
    last_observations: Mutex<Vec<Observation>>,
    events: mpsc::Sender<LocatorEvent>,
}

pub struct Locator {
    shared: Arc<Shared>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Locator {
    /// Build a locator and the receiving end of its event channel.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(
        cache: Arc<LocationCache>,
        resolver: Arc<dyn LocationResolver>,
        config: &Config,
        scan_source: Option<Arc<dyn ScanSource>>,
    ) -> (Self, mpsc::Receiver<LocatorEvent>) {
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let (refresh_tx, refresh_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);

        let coordinator = RefreshCoordinator::new(
            Arc::clone(&cache),
            BatchResolver::new(resolver, config.batch_size),
            config.wait_interval(),
            Some(refresh_tx),
        );

        let shared = Arc::new(Shared {
            cache,
            coordinator,
            estimator: PositionEstimator::new(config.stale_window()),
            scan_source,
            last_observations: Mutex::new(Vec::new()),
            events: event_tx,
        });

        let listener = tokio::spawn(Shared::listen(Arc::clone(&shared), refresh_rx));

        let locator = Self {
            shared,
            listener: Mutex::new(Some(listener)),
        };
        (locator, event_rx)
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.shared.coordinator
    }

    pub fn cache(&self) -> &Arc<LocationCache> {
        &self.shared.cache
    }

    /// Estimate from `observations` and queue whatever needs a lookup.
    /// Does not block on the network.
    pub fn locate(&self, observations: &[Observation]) -> Result<Fix, LocateError> {
        self.shared.locate(observations)
    }

    /// Handle a fresh scan: estimate, queue refreshes and report the fix
    /// on the event channel.
    pub async fn on_aps_observed(&self, observations: Vec<Observation>) -> Result<(), LocateError> {
        let fix = self.shared.locate(&observations)?;
        self.shared.send(LocatorEvent::Fix(fix)).await;
        Ok(())
    }

    /// Manual "update now": rescan if a scan source is attached, report the
    /// fix and cut the refresh wait short.
    pub async fn request_immediate_refresh(&self) -> Result<(), LocateError> {
        let observations = match &self.shared.scan_source {
            Some(source) => source.scan(),
            None => self.shared.last_observations(),
        };
        self.on_aps_observed(observations).await?;
        self.shared.coordinator.request_refresh()?;
        Ok(())
    }

    /// Stop background work and close the cache. Idempotent.
    pub async fn shutdown(&self) {
        self.shared.coordinator.shutdown().await;

        let listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(listener) = listener {
            listener.abort();
            if let Err(e) = listener.await {
                if !e.is_cancelled() {
                    error!(error = %e, "Locator listener ended abnormally");
                }
            }
            info!("Locator shut down");
        }

        self.shared.cache.close();
    }
}

impl Shared {
    fn locate(&self, observations: &[Observation]) -> Result<Fix, LocateError> {
        let snapshot = self.cache.snapshot()?;
        let estimate = self.estimator.calculate(observations, &snapshot, Utc::now());

        *self.last_observations.lock().unwrap_or_else(PoisonError::into_inner) = observations.to_vec();

        if !estimate.need_refresh.is_empty() {
            self.coordinator.submit(estimate.need_refresh)?;
        }
        Ok(estimate.fix)
    }

    fn last_observations(&self) -> Vec<Observation> {
        self.last_observations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Helper to send events, logging any channel errors
    async fn send(&self, event: LocatorEvent) {
        if let Err(e) = self.events.send(event).await {
            debug!(error = %e, "Locator event dropped - receiver closed");
        }
    }

    async fn listen(self: Arc<Self>, mut refresh_rx: mpsc::Receiver<RefreshEvent>) {
        while let Some(event) = refresh_rx.recv().await {
            let fresh_data = matches!(event, RefreshEvent::BatchCommitted { .. });
            self.send(LocatorEvent::Refresh(event)).await;

            if fresh_data {
                let observations = self.last_observations();
                if observations.is_empty() {
                    continue;
                }
                match self.locate(&observations) {
                    Ok(fix) => self.send(LocatorEvent::Fix(fix)).await,
                    Err(e) if e.is_closed() => break,
                    Err(e) => warn!(error = %e, "Failed to recompute fix after refresh"),
                }
            }
        }
        debug!("Locator listener finished");
    }
}

// ============================================================================
// Tests
// ============================================================================

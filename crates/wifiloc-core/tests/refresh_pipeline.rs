//! End-to-end behavior of cache, estimator and refresh coordinator together.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch};

use wifiloc_core::cache::{JsonFileBackend, MemoryBackend};
use wifiloc_core::resolver::Resolved;
use wifiloc_core::{
    ApId, BatchResolver, Fix, LocationCache, LocationRecord, LocationResolver, Observation,
    PositionEstimator, RefreshCoordinator, RefreshEvent, RefreshState, ResolvedLocation,
    ResolverError,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolver backed by a fixed table that records every request and can be
/// held closed until the test opens its gate.
struct RecordingResolver {
    table: Resolved,
    requests: Mutex<Vec<Vec<ApId>>>,
    gate: watch::Receiver<bool>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingResolver {
    fn new(table: Resolved) -> (Arc<Self>, watch::Sender<bool>) {
        let (gate_tx, gate) = watch::channel(true);
        let resolver = Arc::new(Self {
            table,
            requests: Mutex::new(Vec::new()),
            gate,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        (resolver, gate_tx)
    }

    fn request_sizes(&self) -> Vec<usize> {
        self.requests.lock().unwrap().iter().map(Vec::len).collect()
    }
}

#[async_trait]
impl LocationResolver for RecordingResolver {
    async fn resolve(&self, aps: &[ApId]) -> Result<Resolved, ResolverError> {
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
        self.requests.lock().unwrap().push(aps.to_vec());

        let mut gate = self.gate.clone();
        let _ = gate.wait_for(|open| *open).await;

        let answers = aps
            .iter()
            .filter_map(|ap| self.table.get(ap).map(|loc| (ap.clone(), loc.clone())))
            .collect();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(answers)
    }
}

fn ap(n: u8) -> ApId {
    ApId::parse(&format!("02:00:00:00:00:{:02x}", n)).unwrap()
}

fn memory_cache(records: Vec<LocationRecord>) -> Arc<LocationCache> {
    Arc::new(LocationCache::open(MemoryBackend::with_records(records)).unwrap())
}

fn coordinator(
    cache: &Arc<LocationCache>,
    resolver: Arc<RecordingResolver>,
) -> (RefreshCoordinator, mpsc::Receiver<RefreshEvent>) {
    let (tx, rx) = mpsc::channel(64);
    let coordinator = RefreshCoordinator::new(
        Arc::clone(cache),
        BatchResolver::new(resolver, 10),
        Duration::from_millis(10),
        Some(tx),
    );
    (coordinator, rx)
}

async fn wait_for_idle(rx: &mut mpsc::Receiver<RefreshEvent>) {
    loop {
        let event = tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for refresh cycle")
            .expect("event channel closed");
        if event == RefreshEvent::Idle {
            return;
        }
    }
}

#[test]
fn test_commit_twice_keeps_second_value() {
    let dir = tempfile::tempdir().unwrap();
    let cache = LocationCache::open(JsonFileBackend::new(dir.path()).unwrap()).unwrap();
    let now = Utc::now();

    for lat in [1.0, 2.0] {
        let mut editor = cache.edit().unwrap();
        editor.put(LocationRecord::resolved(ap(1), ResolvedLocation::new(lat, 0.0, None, Some(5.0)), now));
        editor.commit().unwrap();
    }

    let reopened = LocationCache::open(JsonFileBackend::new(dir.path()).unwrap()).unwrap();
    let snapshot = reopened.snapshot().unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot.get(&ap(1)).unwrap().location().unwrap().latitude, 2.0);
}

#[tokio::test]
async fn test_example_scenario() {
    let now = Utc::now();
    let cache = memory_cache(vec![LocationRecord::resolved(
        ap(0xa),
        ResolvedLocation::new(10.0, 20.0, None, Some(5.0)),
        now,
    )]);
    let (resolver, gate) = RecordingResolver::new(Resolved::from([(
        ap(0xb),
        ResolvedLocation::new(11.0, 21.0, None, Some(8.0)),
    )]));
    gate.send_replace(false);
    let (coordinator, mut rx) = coordinator(&cache, resolver.clone());

    let observations = [Observation::new(ap(0xa), -55), Observation::new(ap(0xb), -65)];
    let estimate = PositionEstimator::default().calculate(&observations, &cache.snapshot().unwrap(), now);

    let position = estimate.fix.position().expect("fix from the cached AP");
    assert!((position.latitude - 10.0).abs() < 1e-6);
    assert!((position.longitude - 20.0).abs() < 1e-6);

    coordinator.submit(estimate.need_refresh).unwrap();
    assert_eq!(coordinator.pending(), vec![ap(0xb)]);

    gate.send_replace(true);
    wait_for_idle(&mut rx).await;

    let record = cache.get(&ap(0xb)).unwrap().unwrap();
    assert!(record.is_resolved());
    assert_eq!(record.location().unwrap(), &ResolvedLocation::new(11.0, 21.0, None, Some(8.0)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submits_share_one_cycle() {
    let cache = memory_cache(Vec::new());
    let table: Resolved = (0..40)
        .filter(|n| n % 3 != 0)
        .map(|n| (ap(n), ResolvedLocation::new(1.0, 1.0, None, Some(10.0))))
        .collect();
    let (resolver, gate) = RecordingResolver::new(table);
    gate.send_replace(false);
    let (coordinator, mut rx) = coordinator(&cache, resolver.clone());

    coordinator.submit([ap(0)]).unwrap();
    assert_eq!(coordinator.state(), RefreshState::Active);

    let submitters: Vec<_> = [1u8, 14, 27]
        .into_iter()
        .map(|start| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.submit((start..start + 13).map(ap)) })
        })
        .collect();
    for result in futures::future::join_all(submitters).await {
        result.unwrap().unwrap();
    }

    assert_eq!(coordinator.stats().cycles_started, 1);
    gate.send_replace(true);
    wait_for_idle(&mut rx).await;

    let stats = coordinator.stats();
    assert_eq!(stats.cycles_started, 1);
    assert_eq!(resolver.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(stats.resolved + stats.unknown, 40);
    assert!(resolver.request_sizes().iter().all(|&size| size <= 10));

    let snapshot = cache.snapshot().unwrap();
    for n in 0..40 {
        let record = snapshot.get(&ap(n)).expect("every identifier settled");
        assert_eq!(record.is_resolved(), n % 3 != 0);
    }
}

#[tokio::test]
async fn test_twenty_five_identifiers_take_three_calls() {
    let cache = memory_cache(Vec::new());
    let (resolver, _gate) = RecordingResolver::new(Resolved::new());
    let (coordinator, mut rx) = coordinator(&cache, resolver.clone());

    coordinator.submit((0..25).map(ap)).unwrap();
    wait_for_idle(&mut rx).await;

    assert_eq!(resolver.request_sizes(), vec![10, 10, 5]);
}

#[tokio::test]
async fn test_stale_record_is_served_and_refreshed() {
    let now = Utc::now();
    let old = now - chrono::Duration::days(45);
    let cache = memory_cache(vec![LocationRecord::resolved(
        ap(1),
        ResolvedLocation::new(48.0, 2.0, None, Some(15.0)),
        old,
    )]);
    let (resolver, _gate) = RecordingResolver::new(Resolved::from([(
        ap(1),
        ResolvedLocation::new(48.0001, 2.0, None, Some(12.0)),
    )]));
    let (coordinator, mut rx) = coordinator(&cache, resolver.clone());

    let estimate = PositionEstimator::default().calculate(
        &[Observation::new(ap(1), -60)],
        &cache.snapshot().unwrap(),
        now,
    );
    assert!(!estimate.fix.is_unknown());
    assert!(estimate.need_refresh.contains(&ap(1)));

    coordinator.submit(estimate.need_refresh).unwrap();
    wait_for_idle(&mut rx).await;

    assert_eq!(resolver.requests.lock().unwrap()[0], vec![ap(1)]);
    let refreshed = cache.get(&ap(1)).unwrap().unwrap();
    assert!(refreshed.resolved_at > old);
    assert_eq!(refreshed.location().unwrap().accuracy, 12.0);
}

#[tokio::test]
async fn test_negative_entry_not_requeued_within_window() {
    let cache = memory_cache(Vec::new());
    let (resolver, _gate) = RecordingResolver::new(Resolved::new());
    let (coordinator, mut rx) = coordinator(&cache, resolver.clone());

    let before = Utc::now();
    coordinator.submit([ap(7)]).unwrap();
    wait_for_idle(&mut rx).await;
    let after = Utc::now();

    let record = cache.get(&ap(7)).unwrap().unwrap();
    assert!(!record.is_resolved());
    assert!(record.resolved_at >= before && record.resolved_at <= after);

    let estimator = PositionEstimator::default();
    let observations = [Observation::new(ap(7), -60)];
    let snapshot = cache.snapshot().unwrap();

    let soon = estimator.calculate(&observations, &snapshot, after + chrono::Duration::days(29));
    assert!(soon.need_refresh.is_empty());
    assert_eq!(soon.fix, Fix::Unknown);

    let later = estimator.calculate(&observations, &snapshot, after + chrono::Duration::days(31));
    assert!(later.need_refresh.contains(&ap(7)));
}

#[test]
fn test_estimate_is_bit_identical() {
    let now = Utc::now();
    let records: Vec<LocationRecord> = [
        (1, 37.77490, -122.41940, 25.0),
        (2, 37.77495, -122.41930, 40.0),
        (3, 37.77485, -122.41950, 15.0),
        (4, 37.80000, -122.30000, 10.0),
    ]
    .into_iter()
    .map(|(n, lat, lon, acc)| LocationRecord::resolved(ap(n), ResolvedLocation::new(lat, lon, Some(12.0), Some(acc)), now))
    .collect();
    let cache = memory_cache(records);
    let snapshot = cache.snapshot().unwrap();

    let observations: Vec<Observation> = (1..=4).map(|n| Observation::new(ap(n), -40 - i32::from(n) * 7)).collect();
    let estimator = PositionEstimator::default();
    let first = estimator.calculate(&observations, &snapshot, now);
    let second = estimator.calculate(&observations, &snapshot, now);

    let (a, b) = (first.fix.position().unwrap(), second.fix.position().unwrap());
    assert_eq!(a.latitude.to_bits(), b.latitude.to_bits());
    assert_eq!(a.longitude.to_bits(), b.longitude.to_bits());
    assert_eq!(a.accuracy.to_bits(), b.accuracy.to_bits());
    assert_eq!(first, second);
    assert_eq!(first.contributors, vec![ap(1), ap(2), ap(3)]);
}

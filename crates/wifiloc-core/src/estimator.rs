//! Position estimation from cached access point locations.
//!
//! Every observed AP is classified against one cache snapshot:
//!
//! | cache entry                          | used for the fix | queued for refresh |
//! |--------------------------------------|------------------|--------------------|
//! | absent                               | no               | yes                |
//! | unknown, fresh                       | no               | no                 |
//! | unknown, stale                       | no               | yes                |
//! | resolved, fresh, accuracy known      | yes              | no                 |
//! | resolved, fresh, accuracy unknown    | no               | no                 |
//! | resolved, stale, accuracy known      | yes              | yes                |
//! | resolved, stale, accuracy unknown    | no               | yes                |
//!
//! Usable locations are then clustered; APs that agree with each other
//! reinforce the estimate and the largest agreeing group wins, so a single
//! AP that moved cannot drag the fix away.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::ap::ApId;
use crate::cache::CacheSnapshot;
use crate::models::{Fix, Observation, Position, RecordStatus, ResolvedLocation};

/// Default freshness window for cache records.
pub const DEFAULT_STALE_DAYS: i64 = 30;

/// How far apart two APs may be, beyond their accuracies, and still agree.
const MAX_AP_RADIUS_M: f64 = 500.0;

/// Added to accuracy when weighting so very precise APs do not dominate.
const ACCURACY_WEIGHT: f64 = 50.0;

/// Signal level treated as "barely visible".
const MIN_SIGNAL_LEVEL: i32 = -100;

/// Mean Earth radius in meters.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Result of one estimation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Estimate {
    pub fix: Fix,
    /// APs that are unknown or stale and should be looked up again.
    pub need_refresh: BTreeSet<ApId>,
    /// APs whose locations went into the fix.
    pub contributors: Vec<ApId>,
}

/// A usable AP location annotated with its current signal level.
#[derive(Debug, Clone, Copy)]
struct Candidate<'a> {
    ap: &'a ApId,
    location: &'a ResolvedLocation,
    signal_level: i32,
}

impl Candidate<'_> {
    fn weight(&self) -> f64 {
        let signal = f64::from(self.signal_level.saturating_sub(MIN_SIGNAL_LEVEL).max(1));
        signal / (self.location.accuracy + ACCURACY_WEIGHT)
    }
}

#[derive(Debug, Clone)]
pub struct PositionEstimator {
    stale_window: Duration,
}

impl Default for PositionEstimator {
    fn default() -> Self {
        Self::new(Duration::days(DEFAULT_STALE_DAYS))
    }
}

impl PositionEstimator {
    pub fn new(stale_window: Duration) -> Self {
        Self { stale_window }
    }

    pub fn stale_window(&self) -> Duration {
        self.stale_window
    }

    /// Estimate a position from the observed APs.
    ///
    /// Pure: the same snapshot, observations and `now` always give the
    /// same estimate.
    pub fn calculate(&self, observations: &[Observation], snapshot: &CacheSnapshot, now: DateTime<Utc>) -> Estimate {
        // One entry per AP, strongest reading wins; BTreeMap fixes the order
        let mut visible: BTreeMap<&ApId, i32> = BTreeMap::new();
        for obs in observations {
            visible
                .entry(&obs.ap)
                .and_modify(|level| *level = (*level).max(obs.signal_level))
                .or_insert(obs.signal_level);
        }

        let mut need_refresh = BTreeSet::new();
        let mut candidates = Vec::new();

        for (&ap, &signal_level) in &visible {
            let Some(record) = snapshot.get(ap) else {
                need_refresh.insert(ap.clone());
                continue;
            };

            if record.is_stale(now, self.stale_window) {
                need_refresh.insert(ap.clone());
            }

            if let RecordStatus::Resolved(location) = &record.status {
                if location.has_accuracy() {
                    candidates.push(Candidate {
                        ap,
                        location,
                        signal_level,
                    });
                }
            }
        }

        let (fix, contributors) = match Self::aggregate(&candidates, now) {
            Some((position, members)) => (Fix::Located(position), members),
            None => (Fix::Unknown, Vec::new()),
        };

        debug!(
            visible = visible.len(),
            usable = candidates.len(),
            contributors = contributors.len(),
            need_refresh = need_refresh.len(),
            "Position estimated"
        );

        Estimate {
            fix,
            need_refresh,
            contributors,
        }
    }

    fn aggregate(candidates: &[Candidate<'_>], now: DateTime<Utc>) -> Option<(Position, Vec<ApId>)> {
        if candidates.is_empty() {
            return None;
        }

        let cluster = Self::largest_cluster(candidates);
        if cluster.len() == 1 && candidates.len() > 1 {
            debug!(usable = candidates.len(), "Access point locations disagree, no fix");
            return None;
        }

        let members: Vec<&Candidate<'_>> = cluster.iter().map(|&i| &candidates[i]).collect();
        Some((Self::combine(&members, now), members.iter().map(|c| c.ap.clone()).collect()))
    }

    /// Single-linkage clustering. Ties go to the cluster holding the
    /// lowest index, which is the lexically smallest AP.
    fn largest_cluster(candidates: &[Candidate<'_>]) -> Vec<usize> {
        let n = candidates.len();
        let mut parent: Vec<usize> = (0..n).collect();

        fn find(parent: &mut [usize], mut i: usize) -> usize {
            while parent[i] != i {
                parent[i] = parent[parent[i]];
                i = parent[i];
            }
            i
        }

        for i in 0..n {
            for j in (i + 1)..n {
                if Self::compatible(&candidates[i], &candidates[j]) {
                    let (a, b) = (find(&mut parent, i), find(&mut parent, j));
                    if a != b {
                        parent[a.max(b)] = a.min(b);
                    }
                }
            }
        }

        let mut clusters: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for i in 0..n {
            let root = find(&mut parent, i);
            clusters.entry(root).or_default().push(i);
        }

        // Roots are each cluster's lowest index, iterated ascending; keep
        // the first cluster of maximum size
        let mut best: Vec<usize> = Vec::new();
        for members in clusters.into_values() {
            if members.len() > best.len() {
                best = members;
            }
        }
        best
    }

    fn compatible(a: &Candidate<'_>, b: &Candidate<'_>) -> bool {
        let distance = haversine_m(
            a.location.latitude,
            a.location.longitude,
            b.location.latitude,
            b.location.longitude,
        );
        distance < a.location.accuracy + b.location.accuracy + MAX_AP_RADIUS_M
    }

    fn combine(members: &[&Candidate<'_>], now: DateTime<Utc>) -> Position {
        // Average offsets from the first member; longitudes are unwrapped
        // so clusters spanning the antimeridian average correctly
        let reference = members[0].location;

        let mut total_weight = 0.0;
        let mut lat_offset = 0.0;
        let mut lon_offset = 0.0;
        let mut alt_weight = 0.0;
        let mut alt_sum = 0.0;

        for c in members {
            let w = c.weight();
            total_weight += w;
            lat_offset += w * (c.location.latitude - reference.latitude);
            lon_offset += w * wrap_degrees(c.location.longitude - reference.longitude);
            if let Some(alt) = c.location.altitude {
                alt_weight += w;
                alt_sum += w * alt;
            }
        }

        let latitude = reference.latitude + lat_offset / total_weight;
        let longitude = wrap_degrees(reference.longitude + lon_offset / total_weight);

        // Weighted RMS of each member's offset from the fix combined with its
        // own error, so spread widens the reported accuracy
        let mut spread = 0.0;
        for c in members {
            let d = haversine_m(latitude, longitude, c.location.latitude, c.location.longitude);
            spread += c.weight() * (d * d + c.location.accuracy * c.location.accuracy);
        }
        let accuracy = (spread / total_weight).sqrt();

        Position {
            latitude,
            longitude,
            altitude: (alt_weight > 0.0).then(|| alt_sum / alt_weight),
            accuracy,
            timestamp: now,
            ap_count: members.len(),
        }
    }
}

/// Normalize an angle in degrees to [-180, 180).
fn wrap_degrees(deg: f64) -> f64 {
    (deg + 180.0).rem_euclid(360.0) - 180.0
}

/// Great-circle distance in meters.
fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().min(1.0).asin()
}

// ============================================================================
// Tests
// ============================================================================

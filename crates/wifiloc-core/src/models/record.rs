//! Cached access point locations.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::ap::ApId;

/// Sentinel for "the resolver gave no accuracy".
/// Records carrying it stay cached but never feed the estimator.
pub const UNKNOWN_ACCURACY: f64 = -1.0;

/// Coordinates for an access point as answered by a resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedLocation {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub altitude: Option<f64>,
    /// Meters, or `UNKNOWN_ACCURACY`.
    #[serde(default = "unknown_accuracy")]
    pub accuracy: f64,
}

fn unknown_accuracy() -> f64 {
    UNKNOWN_ACCURACY
}

impl ResolvedLocation {
    pub fn new(latitude: f64, longitude: f64, altitude: Option<f64>, accuracy: Option<f64>) -> Self {
        Self {
            latitude,
            longitude,
            altitude,
            accuracy: accuracy.unwrap_or(UNKNOWN_ACCURACY),
        }
    }

    pub fn has_accuracy(&self) -> bool {
        self.accuracy >= 0.0
    }

    /// Plausibility check applied to everything coming off the wire.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
            && (self.accuracy == UNKNOWN_ACCURACY || (self.accuracy.is_finite() && self.accuracy >= 0.0))
            && self.altitude.map_or(true, f64::is_finite)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordStatus {
    Resolved(ResolvedLocation),
    /// The resolver was asked and had no answer.
    Unknown,
}

/// One cache entry. There is exactly one per access point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub ap: ApId,
    pub resolved_at: DateTime<Utc>,
    #[serde(flatten)]
    pub status: RecordStatus,
}

impl LocationRecord {
    pub fn resolved(ap: ApId, location: ResolvedLocation, resolved_at: DateTime<Utc>) -> Self {
        Self {
            ap,
            resolved_at,
            status: RecordStatus::Resolved(location),
        }
    }

    /// Negative cache entry.
    pub fn unknown(ap: ApId, resolved_at: DateTime<Utc>) -> Self {
        Self {
            ap,
            resolved_at,
            status: RecordStatus::Unknown,
        }
    }

    pub fn location(&self) -> Option<&ResolvedLocation> {
        match &self.status {
            RecordStatus::Resolved(location) => Some(location),
            RecordStatus::Unknown => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.status, RecordStatus::Resolved(_))
    }

    pub fn is_stale(&self, now: DateTime<Utc>, stale_window: Duration) -> bool {
        now - self.resolved_at > stale_window
    }

    pub fn age_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.resolved_at).num_minutes()
    }

    pub fn age_display(&self, now: DateTime<Utc>) -> String {
        let minutes = self.age_minutes(now);
        if minutes < 1 {
            // Negative ages come from clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            let hours = minutes / 60;
            if minutes % 60 >= 30 {
                format!("{}h ago", hours + 1)
            } else {
                format!("{}h ago", hours)
            }
        } else {
            let days = minutes / 1440;
            if (minutes % 1440) / 60 >= 12 {
                format!("{}d ago", days + 1)
            } else {
                format!("{}d ago", days)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ap() -> ApId {
        ApId::parse("aa:bb:cc:dd:ee:ff").unwrap()
    }

    #[test]
    fn test_age_display() {
        let now = Utc::now();
        let record = |age: Duration| LocationRecord::unknown(ap(), now - age);

        assert_eq!(record(Duration::seconds(10)).age_display(now), "just now");
        assert_eq!(record(Duration::minutes(-5)).age_display(now), "just now");
        assert_eq!(record(Duration::minutes(5)).age_display(now), "5m ago");
        assert_eq!(record(Duration::minutes(90)).age_display(now), "2h ago");
        assert_eq!(record(Duration::minutes(80)).age_display(now), "1h ago");
        assert_eq!(record(Duration::days(12)).age_display(now), "12d ago");
        assert_eq!(record(Duration::hours(36)).age_display(now), "2d ago");
    }

    #[test]
    fn test_is_stale() {
        let now = Utc::now();
        let window = Duration::days(30);

        let fresh = LocationRecord::unknown(ap(), now - Duration::days(29));
        assert!(!fresh.is_stale(now, window));

        let old = LocationRecord::unknown(ap(), now - Duration::days(31));
        assert!(old.is_stale(now, window));
    }

    #[test]
    fn test_location_validity() {
        assert!(ResolvedLocation::new(10.0, 20.0, None, Some(5.0)).is_valid());
        assert!(ResolvedLocation::new(10.0, 20.0, Some(3.0), None).is_valid());
        assert!(!ResolvedLocation::new(-180.0, -180.0, None, Some(5.0)).is_valid());
        assert!(!ResolvedLocation::new(10.0, 200.0, None, Some(5.0)).is_valid());
        assert!(!ResolvedLocation::new(10.0, 20.0, None, Some(-3.0)).is_valid());
        assert!(!ResolvedLocation::new(f64::NAN, 20.0, None, Some(5.0)).is_valid());
    }

    #[test]
    fn test_record_serde_shape() {
        let now = Utc::now();
        let record = LocationRecord::resolved(ap(), ResolvedLocation::new(1.0, 2.0, None, Some(4.0)), now);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "resolved");
        assert_eq!(json["ap"], "aa:bb:cc:dd:ee:ff");

        let back: LocationRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);

        let unknown = LocationRecord::unknown(ap(), now);
        let json = serde_json::to_value(&unknown).unwrap();
        assert_eq!(json["status"], "unknown");
    }
}

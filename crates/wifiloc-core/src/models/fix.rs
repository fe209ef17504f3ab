//! Position estimates produced by the estimator.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A concrete position estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    /// Estimated error radius in meters.
    pub accuracy: f64,
    pub timestamp: DateTime<Utc>,
    /// Number of access points that contributed to this estimate.
    pub ap_count: usize,
}

/// Result of a position estimate. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Fix {
    Unknown,
    Located(Position),
}

impl Fix {
    pub fn position(&self) -> Option<&Position> {
        match self {
            Fix::Located(position) => Some(position),
            Fix::Unknown => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Fix::Unknown)
    }
}

impl fmt::Display for Fix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fix::Unknown => write!(f, "unknown"),
            Fix::Located(p) => {
                write!(f, "{:.6}, {:.6}", p.latitude, p.longitude)?;
                if let Some(alt) = p.altitude {
                    write!(f, " alt {:.1}m", alt)?;
                }
                write!(f, " (±{:.0}m from {} APs)", p.accuracy, p.ap_count)
            }
        }
    }
}

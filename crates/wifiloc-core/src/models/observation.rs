use serde::{Deserialize, Serialize};

use crate::ap::ApId;

/// A visible access point as reported by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Observation {
    #[serde(alias = "bssid")]
    pub ap: ApId,
    /// Received signal strength in dBm.
    #[serde(alias = "rssi")]
    pub signal_level: i32,
}

impl Observation {
    pub fn new(ap: ApId, signal_level: i32) -> Self {
        Self { ap, signal_level }
    }
}

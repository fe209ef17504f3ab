//! Data models for access point locations and position fixes.
//!
//! - `LocationRecord`, `RecordStatus`: what the cache stores per AP
//! - `ResolvedLocation`: coordinates as answered by a resolver
//! - `Observation`: one visible AP and its current signal level
//! - `Fix`, `Position`: the estimator's output

pub mod fix;
pub mod observation;
pub mod record;

pub use fix::{Fix, Position};
pub use observation::Observation;
pub use record::{LocationRecord, RecordStatus, ResolvedLocation, UNKNOWN_ACCURACY};

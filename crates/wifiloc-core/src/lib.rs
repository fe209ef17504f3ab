//! wifiloc core - estimate a device position from visible WiFi access points.
//!
//! The pieces, leaves first:
//! - `cache`: persistent AP location store with all-or-nothing batch commits
//! - `resolver`: bounded-size lookups against a remote geolocation service
//! - `refresh`: single-flight background cycle that fills cache gaps
//! - `estimator`: pure aggregation of cached AP locations into a `Fix`
//! - `locator`: the caller-facing API tying the above together

pub mod ap;
pub mod cache;
pub mod config;
pub mod error;
pub mod estimator;
pub mod locator;
pub mod models;
pub mod refresh;
pub mod resolver;

pub use ap::{ApId, InvalidApId};
pub use cache::{CacheError, LocationCache};
pub use config::Config;
pub use error::LocateError;
pub use estimator::{Estimate, PositionEstimator};
pub use locator::{Locator, LocatorEvent, ScanSource};
pub use models::{Fix, LocationRecord, Observation, Position, RecordStatus, ResolvedLocation};
pub use refresh::{RefreshCoordinator, RefreshError, RefreshEvent, RefreshState};
pub use resolver::{BatchResolver, HttpResolver, LocationResolver, ResolverError};

//! Local AP location cache.
//!
//! This module provides the `LocationCache` mapping each access point to
//! its last known location. Writes go through an `Editor` transaction so
//! that a batch of records becomes visible to readers all at once.
//!
//! Records older than the stale window (30 days by default) are still
//! served but get queued for a background refresh by the estimator.

pub mod backend;
pub mod error;
pub mod store;

pub use backend::{CacheBackend, JsonFileBackend, MemoryBackend};
pub use error::CacheError;
pub use store::{CacheSnapshot, CacheSummary, Editor, LocationCache};

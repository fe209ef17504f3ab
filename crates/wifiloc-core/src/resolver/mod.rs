//! Remote lookup of access point locations.
//!
//! `LocationResolver` is the seam to whatever geolocation service answers
//! "where is this AP". `BatchResolver` wraps one and enforces the batch
//! bound and answer validation. `HttpResolver` is a JSON-over-HTTP client.
//!
//! An identifier missing from a successful answer means "the service has
//! no location for it". A failed request is an `Err` and says nothing
//! about the identifiers in it.

pub mod batch;
pub mod error;
pub mod http;

pub use batch::{BatchResolver, LocationResolver, Resolved};
pub use error::ResolverError;
pub use http::HttpResolver;

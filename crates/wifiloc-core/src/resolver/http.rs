//! JSON-over-HTTP geolocation resolver.
//!
//! Request body: `{"accessPoints": ["aa:bb:cc:dd:ee:ff", ...]}`
//! Response body: `{"results": {"aa:bb:cc:dd:ee:ff": {"lat": .., "lon": .., "altitude": .., "accuracy": ..}}}`

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{LocationResolver, Resolved, ResolverError};
use crate::ap::ApId;
use crate::models::ResolvedLocation;

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Serialize)]
struct LookupRequest<'a> {
    #[serde(rename = "accessPoints")]
    access_points: &'a [ApId],
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    results: HashMap<String, LookupResult>,
}

#[derive(Debug, Deserialize)]
struct LookupResult {
    #[serde(alias = "latitude")]
    lat: f64,
    #[serde(alias = "longitude", alias = "lng")]
    lon: f64,
    #[serde(default)]
    altitude: Option<f64>,
    #[serde(default)]
    accuracy: Option<f64>,
}

/// Resolver client for a JSON lookup endpoint.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpResolver {
    client: Client,
    url: String,
    initial_backoff: Duration,
}

impl HttpResolver {
    pub fn new(url: impl Into<String>) -> Result<Self, ResolverError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Check if response is successful.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(
        response: reqwest::Response,
    ) -> Result<Option<reqwest::Response>, ResolverError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ResolverError::from_status(status, &body))
        }
    }

    fn parse_response(body: &str) -> Result<Resolved, ResolverError> {
        let response: LookupResponse = serde_json::from_str(body)
            .map_err(|e| ResolverError::InvalidResponse(format!("Malformed lookup response: {}", e)))?;

        let mut resolved = Resolved::with_capacity(response.results.len());
        for (raw, result) in response.results {
            match ApId::parse(&raw) {
                Ok(ap) => {
                    resolved.insert(
                        ap,
                        ResolvedLocation::new(result.lat, result.lon, result.altitude, result.accuracy),
                    );
                }
                Err(e) => warn!(error = %e, "Skipping result with invalid identifier"),
            }
        }
        Ok(resolved)
    }
}

#[async_trait]
impl LocationResolver for HttpResolver {
    async fn resolve(&self, aps: &[ApId]) -> Result<Resolved, ResolverError> {
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let response = self
                .client
                .post(&self.url)
                .header(header::ACCEPT, "application/json")
                .json(&LookupRequest { access_points: aps })
                .send()
                .await
                .map_err(|e| if e.is_timeout() { ResolverError::Timeout } else { e.into() })?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => {
                    let body = response.text().await?;
                    let resolved = Self::parse_response(&body)?;
                    debug!(requested = aps.len(), answered = resolved.len(), "Lookup complete");
                    return Ok(resolved);
                }
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ResolverError::RateLimited);
                    }
                    warn!(url = %self.url, retry = retries, backoff_ms = backoff.as_millis() as u64, "Rate limited, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response() {
        let body = r#"{
            "results": {
                "AA:BB:CC:DD:EE:FF": {"lat": 10.0, "lon": 20.0, "accuracy": 5},
                "0:1:2:3:4:5": {"latitude": 11.0, "longitude": 21.0, "altitude": 120.5},
                "garbage": {"lat": 1.0, "lon": 1.0}
            }
        }"#;
        let resolved = HttpResolver::parse_response(body).unwrap();
        assert_eq!(resolved.len(), 2);

        let a = &resolved[&ApId::parse("aa:bb:cc:dd:ee:ff").unwrap()];
        assert_eq!(a.accuracy, 5.0);
        assert_eq!(a.altitude, None);

        let b = &resolved[&ApId::parse("00:01:02:03:04:05").unwrap()];
        assert!(!b.has_accuracy());
        assert_eq!(b.altitude, Some(120.5));
    }

    #[test]
    fn test_parse_empty_response() {
        assert!(HttpResolver::parse_response("{}").unwrap().is_empty());
    }

    #[test]
    fn test_parse_malformed_response_is_an_error() {
        assert!(matches!(
            HttpResolver::parse_response("<html>"),
            Err(ResolverError::InvalidResponse(_))
        ));
        assert!(matches!(
            HttpResolver::parse_response(r#"{"results": {"aa:bb:cc:dd:ee:ff": {"lat": "x"}}}"#),
            Err(ResolverError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_request_body_shape() {
        let aps = vec![ApId::parse("aa:bb:cc:dd:ee:ff").unwrap()];
        let body = serde_json::to_value(LookupRequest { access_points: &aps }).unwrap();
        assert_eq!(body["accessPoints"][0], "aa:bb:cc:dd:ee:ff");
    }
}

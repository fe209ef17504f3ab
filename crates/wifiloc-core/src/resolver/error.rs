use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResolverError {
    #[error("Request timed out")]
    Timeout,

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Batch of {size} identifiers exceeds the limit of {limit}")]
    BatchTooLarge { size: usize, limit: usize },
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ResolverError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            408 | 504 => ResolverError::Timeout,
            429 => ResolverError::RateLimited,
            500..=599 => ResolverError::ServerError(truncated),
            _ => ResolverError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }
}
